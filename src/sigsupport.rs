//! Per-signal (notify, pass, stop) policy consulted when a Unix soft signal
//! arrives as an exception, and temporarily mutated by `kill`.

use lazy_static::lazy_static;

use crate::debuggee::Debuggee;
use crate::error::{DbgError, DbgResult};

/// Highest signal number plus one on the target kernel.
pub const NSIG: i32 = 32;

/// BSD signal names, indexed by signal number.
static SIG_NAMES: [&str; NSIG as usize] = [
    "?", "HUP", "INT", "QUIT", "ILL", "TRAP", "ABRT", "EMT", "FPE", "KILL", "BUS", "SEGV", "SYS",
    "PIPE", "ALRM", "TERM", "URG", "STOP", "TSTP", "CONT", "CHLD", "TTIN", "TTOU", "IO", "XCPU",
    "XFSZ", "VTALRM", "PROF", "WINCH", "INFO", "USR1", "USR2",
];

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SigSettings {
    pub notify: bool,
    pub pass: bool,
    pub stop: bool,
}

impl Default for SigSettings {
    fn default() -> SigSettings {
        SigSettings {
            notify: true,
            pass: true,
            stop: true,
        }
    }
}

lazy_static! {
    /// The table every `Debuggee` starts with. Signals that fire constantly
    /// in healthy processes are passed through quietly.
    static ref DEFAULT_POLICIES: Vec<SigSettings> = {
        let quiet = SigSettings {
            notify: false,
            pass: true,
            stop: false,
        };

        // Target numbering: SIGURG, SIGCHLD, SIGWINCH.
        let mut policies = vec![SigSettings::default(); NSIG as usize];
        for &sig in &[16, 20, 28] {
            policies[sig as usize] = quiet;
        }
        policies
    };
}

pub fn default_policies() -> Vec<SigSettings> {
    DEFAULT_POLICIES.clone()
}

fn check(sig: i32) -> DbgResult<usize> {
    if sig >= 1 && sig < NSIG {
        Ok(sig as usize)
    } else {
        Err(DbgError::UnknownSignal(sig))
    }
}

pub fn sigsettings(dbg: &Debuggee, sig: i32) -> DbgResult<SigSettings> {
    let idx = check(sig)?;
    Ok(dbg.sigpolicies.lock().unwrap()[idx])
}

/// Also the "restore" path: setting a previously retrieved triad puts the
/// table back exactly as it was.
pub fn set_sigsettings(dbg: &Debuggee, sig: i32, settings: SigSettings) -> DbgResult<()> {
    let idx = check(sig)?;
    dbg.sigpolicies.lock().unwrap()[idx] = settings;
    Ok(())
}

/// "SIGKILL"-style name for a signal number.
pub fn signame(sig: i32) -> String {
    if sig >= 1 && sig < NSIG {
        format!("SIG{}", SIG_NAMES[sig as usize])
    } else {
        format!("SIG{}", sig)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kernel::mock::MockKernel;

    fn dbg() -> Debuggee {
        Debuggee::new(Arc::new(MockKernel::new()), Default::default())
    }

    #[test]
    fn set_then_restore_round_trips() {
        let dbg = dbg();
        let saved = sigsettings(&dbg, libc::SIGTERM).unwrap();

        let forced = SigSettings {
            notify: false,
            pass: true,
            stop: false,
        };
        set_sigsettings(&dbg, libc::SIGTERM, forced).unwrap();
        assert_eq!(sigsettings(&dbg, libc::SIGTERM).unwrap(), forced);

        set_sigsettings(&dbg, libc::SIGTERM, saved).unwrap();
        assert_eq!(sigsettings(&dbg, libc::SIGTERM).unwrap(), saved);
    }

    #[test]
    fn out_of_range_signals_are_rejected() {
        let dbg = dbg();
        assert!(sigsettings(&dbg, 0).is_err());
        assert!(sigsettings(&dbg, NSIG).is_err());
        assert!(set_sigsettings(&dbg, -3, SigSettings::default()).is_err());
    }

    #[test]
    fn signame_uses_bsd_names() {
        assert_eq!(signame(9), "SIGKILL");
        assert_eq!(signame(5), "SIGTRAP");
        assert_eq!(signame(20), "SIGCHLD");
        assert_eq!(signame(40), "SIG40");
    }
}
