//! Inferior control operations shared by the command layer and the
//! dispatcher: suspend/resume, detach, interrupt, thread-list refresh with
//! hardware-breakpoint re-binding, and step preparation.

use std::fmt::Write;
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::breakpoint::{self, BpCond};
use crate::debuggee::Debuggee;
use crate::error::{DbgError, DbgResult};
use crate::exception;
use crate::kernel::{KERN_SUCCESS, PORT_NULL};
use crate::memutils;
use crate::servers;
use crate::sigsupport;
use crate::thread::StepKind;
use crate::watchpoint;

/// The trace detach can keep failing while the stop signal is in flight;
/// bound the retry loop instead of spinning forever.
const MAX_DETACH_RETRIES: u32 = 1000;
const DETACH_RETRY_BACKOFF: Duration = Duration::from_micros(500);

pub fn suspend(dbg: &Debuggee) -> DbgResult<()> {
    dbg.suspend().map_err(|err| DbgError::Kernel {
        op: "task suspend",
        err,
    })
}

/// User-level resume: stepping breakpoints exist only to bound a step, so
/// they go first. The dispatcher's auto-resume calls the record's own
/// `resume` directly.
pub fn resume(dbg: &Debuggee) -> DbgResult<()> {
    breakpoint::delete_all_specific(dbg, BpCond::Stepping);
    dbg.resume().map_err(|err| DbgError::Kernel {
        op: "task resume",
        err,
    })
}

/// Clear single-step on every thread, then park the inferior with a stop
/// signal.
pub fn interrupt(dbg: &Debuggee) -> DbgResult<()> {
    if !dbg.attached() {
        return Err(DbgError::NotAttached);
    }

    clear_single_step_everywhere(dbg);
    dbg.kernel.kill(dbg.pid, libc::SIGSTOP)?;
    Ok(())
}

fn clear_single_step_everywhere(dbg: &Debuggee) {
    let mut threads = dbg.threads.lock().unwrap();
    for t in threads.iter_mut() {
        if t.get_debug_state(&*dbg.kernel).is_ok() {
            t.debug_state.mdscr_el1 = 0;
            if let Err(e) = t.set_debug_state(&*dbg.kernel) {
                warn!("couldn't clear single step on thread #{}: {}", t.id, e);
            }
        }
    }
}

pub fn detach(dbg: &mut Debuggee, from_death: bool, _out: &mut String) -> DbgResult<()> {
    if !dbg.attached() {
        return Err(DbgError::NotAttached);
    }

    let _ = dbg.suspend();

    breakpoint::delete_all(dbg);
    watchpoint::delete_all(dbg);
    clear_single_step_everywhere(dbg);

    // Reply to anything still queued so no thread stays blocked on us.
    while let Some(req) = dbg.exc_requests.pop() {
        let _ = exception::reply_to_exception(dbg, &req, KERN_SUCCESS);
    }

    servers::shutdown_exception_server(dbg);

    if let Some(saved) = dbg.saved_exception_ports.lock().unwrap().pop() {
        if let Err(e) = dbg.kernel.restore_exception_ports(dbg.task, &saved) {
            warn!("couldn't restore the saved exception ports: {}", e);
        }
    }

    let mut detach_err = None;

    if !from_death {
        // A stop signal parks the process status where the trace detach
        // wants it; the signal-update path would leave it running and the
        // detach would bail.
        let _ = dbg.kernel.kill(dbg.pid, libc::SIGSTOP);

        let mut tries = 0;
        loop {
            match dbg.kernel.ptrace_detach(dbg.pid) {
                Ok(()) => break,
                Err(e) => {
                    tries += 1;
                    if tries >= MAX_DETACH_RETRIES {
                        detach_err = Some(DbgError::DetachFailed(e.to_string()));
                        break;
                    }
                    debug!("trace detach not ready, retrying");
                    thread::sleep(DETACH_RETRY_BACKOFF);
                }
            }
        }

        let _ = dbg.kernel.kill(dbg.pid, libc::SIGCONT);
    }

    dbg.clear_registries();
    dbg.thread_count = 0;
    dbg.reset_thread_ids();

    dbg.collab.convvars.void("$_");
    dbg.collab.convvars.void("$__");
    dbg.collab.convvars.void("$ASLR");

    let _ = dbg.resume();
    dbg.reset_suspend_count();

    dbg.pid = -1;
    dbg.task = PORT_NULL;
    dbg.debuggee_name.clear();
    dbg.aslr_slide = 0;
    dbg.nosigs = false;
    dbg.shared_cache = None;

    match detach_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Refresh the thread registry from the kernel, repair focus if its thread
/// died, and re-bind thread-specific hardware breakpoints whose thread
/// changed identity underneath us.
pub fn threadupdate(dbg: &Debuggee, out: &mut String) -> DbgResult<()> {
    if !dbg.attached() {
        return Err(DbgError::NotAttached);
    }

    let ports = dbg
        .kernel
        .task_threads(dbg.task)
        .map_err(|err| DbgError::Kernel {
            op: "thread enumeration",
            err,
        })?;

    dbg.update_threads(&ports);

    if dbg.with_focused_mut(|_| ()).is_none() {
        out.push_str("[Previously selected thread dead, selecting thread #1]\n\n");
        if let Some(&first) = ports.first() {
            dbg.set_focused_thread(first);
        }
    }

    dbg.with_focused_mut(|t| {
        if let Err(e) = t.get_thread_state(&*dbg.kernel) {
            warn!("couldn't refresh the focused thread's state: {}", e);
        }
    });

    rebind_thread_breakpoints(dbg, out);
    Ok(())
}

struct RebindCandidate {
    id: u32,
    slot: usize,
    bcr: u64,
    bvr: u64,
    local_id: u32,
    real_tid: u64,
}

/// Adjust thread-specific hardware breakpoints: if the local ID now maps to
/// a different kernel tid, migrate the debug registers to the thread that
/// still has the expected tid, or delete the breakpoint with a notice.
fn rebind_thread_breakpoints(dbg: &Debuggee, out: &mut String) {
    let candidates: Vec<RebindCandidate> = {
        let bps = dbg.breakpoints.lock().unwrap();
        bps.iter()
            .filter(|b| !b.threadinfo.all && b.hw)
            .map(|b| RebindCandidate {
                id: b.id,
                slot: b.hw_bp_reg,
                bcr: b.bcr,
                bvr: b.bvr,
                local_id: b.threadinfo.local_id,
                real_tid: b.threadinfo.real_tid,
            })
            .collect()
    };

    for c in candidates {
        let stale_port = dbg.thread_port_of_local_id(c.local_id);
        let current_tid =
            stale_port.and_then(|port| dbg.with_thread_mut(port, |t| t.tid));

        if current_tid == Some(c.real_tid) {
            continue;
        }

        if let Some(port) = stale_port {
            dbg.with_thread_mut(port, |t| {
                if t.get_debug_state(&*dbg.kernel).is_ok() {
                    t.debug_state.bcr[c.slot] = 0;
                    t.debug_state.bvr[c.slot] = 0;
                    t.debug_state.mdscr_el1 = 0;
                    let _ = t.set_debug_state(&*dbg.kernel);
                }
            });
        }

        let correct = dbg.thread_port_of_tid(c.real_tid);
        let correct_port = match correct {
            Some(port) => port,
            None => {
                let _ = write!(
                    out,
                    "[The thread assigned to breakpoint {} has gone away, deleting it]\n",
                    c.id
                );
                if let Err(e) = breakpoint::delete(dbg, c.id) {
                    warn!("couldn't delete orphaned breakpoint {}: {}", c.id, e);
                }
                continue;
            }
        };

        let migrated = dbg.with_thread_mut(correct_port, |t| {
            if t.get_debug_state(&*dbg.kernel).is_ok() {
                t.debug_state.bcr[c.slot] = c.bcr;
                t.debug_state.bvr[c.slot] = c.bvr;
                let _ = t.set_debug_state(&*dbg.kernel);
            }
            (t.id, t.tid)
        });

        if let Some((new_local, new_tid)) = migrated {
            let mut bps = dbg.breakpoints.lock().unwrap();
            if let Some(bp) = bps.find_mut(|b| b.id == c.id) {
                bp.threadinfo.local_id = new_local;
                bp.threadinfo.real_tid = new_tid;
                bp.threadinfo.pthread_tid = new_tid;
            }
            let _ = write!(out, "[Corrected thread info for breakpoint {}]\n", c.id);
        }
    }
}

/// The NAME/PASS/STOP/NOTIFY table for every signal.
pub fn printsiginfo(dbg: &Debuggee, out: &mut String) {
    let _ = write!(
        out,
        "{:<11} {:<5} {:<5} {:<6}\n",
        "NAME", "PASS", "STOP", "NOTIFY"
    );
    out.push_str("=========== ===== ===== ======\n");

    for signo in 1..sigsupport::NSIG {
        let settings = match sigsupport::sigsettings(dbg, signo) {
            Ok(s) => s,
            Err(_) => continue,
        };

        let _ = write!(
            out,
            "{:<11} {:<5} {:<5} {:<6}\n",
            sigsupport::signame(signo),
            settings.pass,
            settings.stop,
            settings.notify
        );
    }
}

/// Arm the focused thread for an instruction step. A step-over at a
/// branch-with-link runs the whole call under a one-shot breakpoint at the
/// return address; everything else is a plain single step.
pub fn prepare_step(dbg: &Debuggee, kind: StepKind) -> DbgResult<()> {
    if !dbg.attached() {
        return Err(DbgError::NotAttached);
    }
    if !dbg.suspended() {
        return Err(DbgError::NotSuspended);
    }
    if kind == StepKind::None {
        return Err(DbgError::Internal("stepping with no step kind".to_string()));
    }

    let pc = dbg
        .with_focused_mut(|t| {
            let _ = t.get_thread_state(&*dbg.kernel);
            t.thread_state.pc
        })
        .ok_or_else(|| DbgError::Internal("no focused thread".to_string()))?;

    if kind == StepKind::InstStepOver {
        let insn = memutils::read_instruction_word(dbg, pc)?;
        if is_branch_with_link(insn) {
            breakpoint::create_stepping(dbg, pc + 4)?;
            dbg.with_focused_mut(|t| {
                t.stepconfig.set_temp_ss_breakpoint = true;
                t.begin_step(kind);
            });
            return Ok(());
        }
    }

    match dbg.with_focused_mut(|t| {
        t.begin_step(kind);
        t.set_single_step(&*dbg.kernel, true)
    }) {
        Some(result) => result.map_err(|err| DbgError::Kernel {
            op: "debug-state apply",
            err,
        })?,
        None => return Err(DbgError::Internal("no focused thread".to_string())),
    }
    Ok(())
}

/// BL and BLR are the calls a step-over must not descend into.
fn is_branch_with_link(insn: u32) -> bool {
    (insn & 0xfc00_0000) == 0x9400_0000 || (insn & 0xffff_fc1f) == 0xd63f_0000
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testutil::attached_debuggee;

    const TEXT: u64 = 0x1_0000_0000;

    #[test]
    fn step_over_a_call_plants_a_one_shot_breakpoint() {
        let (kernel, dbg) = attached_debuggee();
        // BL #0x10 at TEXT.
        kernel.map_bytes(TEXT, &0x9400_0004u32.to_le_bytes());
        kernel.set_pc(0x101, TEXT);

        prepare_step(&dbg, StepKind::InstStepOver).unwrap();

        assert!(
            breakpoint::find_with_cond(&dbg, TEXT + 4, BpCond::Stepping).is_some()
        );
        let cfg = dbg
            .with_focused_mut(|t| (t.stepconfig.is_stepping, t.stepconfig.set_temp_ss_breakpoint))
            .unwrap();
        assert_eq!(cfg, (true, true));
        // No single step: the temporary breakpoint bounds the call.
        assert_eq!(kernel.debug_state_of(0x101).mdscr_el1 & 1, 0);
    }

    #[test]
    fn step_in_gates_single_step() {
        let (kernel, dbg) = attached_debuggee();
        kernel.set_pc(0x101, TEXT);

        prepare_step(&dbg, StepKind::InstStepIn).unwrap();
        assert_eq!(kernel.debug_state_of(0x101).mdscr_el1 & 1, 1);
        let stepping = dbg.with_focused_mut(|t| t.stepconfig.is_stepping).unwrap();
        assert!(stepping);
    }

    #[test]
    fn detach_clears_everything_and_replies_to_the_backlog() {
        let (kernel, mut dbg) = attached_debuggee();
        crate::servers::setup_exception_server(&mut dbg).unwrap();

        breakpoint::create(&dbg, TEXT, None, false).unwrap();
        kernel.map_bytes(0x1_0000_2000, &[0; 8]);
        crate::watchpoint::create(&dbg, 0x1_0000_2000, 8, crate::watchpoint::WatchMode::WRITE)
            .unwrap();

        // A request still parked on the FIFO at detach time.
        dbg.exc_requests
            .push(crate::kernel::mock::exc_request(0x101, 6, 1, 0));

        let mut out = String::new();
        detach(&mut dbg, false, &mut out).unwrap();

        assert_eq!(dbg.pid, -1);
        assert_eq!(dbg.num_breakpoints(), 0);
        assert_eq!(dbg.num_watchpoints(), 0);
        assert!(dbg.breakpoints.lock().unwrap().is_empty());
        assert!(dbg.watchpoints.lock().unwrap().is_empty());
        assert!(dbg.threads.lock().unwrap().is_empty());
        assert!(dbg.exc_requests.is_empty());
        assert_eq!(kernel.replies.lock().unwrap().len(), 1);

        let calls = kernel.recorded_calls();
        assert!(calls.iter().any(|c| c.starts_with("restore_exception_ports")));
        assert!(calls.contains(&format!("kill 4321 {}", libc::SIGSTOP)));
        assert!(calls.contains(&"ptrace_detach 4321".to_string()));
        assert!(calls.contains(&format!("kill 4321 {}", libc::SIGCONT)));
    }

    #[test]
    fn detach_retries_the_trace_detach_with_backoff() {
        let (kernel, mut dbg) = attached_debuggee();
        kernel.detach_failures.store(3, std::sync::atomic::Ordering::SeqCst);

        let mut out = String::new();
        detach(&mut dbg, false, &mut out).unwrap();
        assert!(kernel
            .recorded_calls()
            .contains(&"ptrace_detach 4321".to_string()));
    }

    #[test]
    fn rebinding_migrates_or_deletes_thread_breakpoints() {
        let (kernel, dbg) = attached_debuggee();
        kernel.add_thread(0x202, 0x222, "worker");
        dbg.update_threads(&[0x101, 0x202]);

        // Hardware breakpoint bound to thread #2 (tid 0x222).
        let id = breakpoint::create(&dbg, TEXT, Some(2), true).unwrap();
        assert_ne!(kernel.debug_state_of(0x202).bcr[0], 0);

        // The kernel thread behind local #2 dies; its tid reappears on a new
        // port.
        kernel.remove_thread(0x202);
        kernel.add_thread(0x303, 0x222, "worker");

        let mut out = String::new();
        threadupdate(&dbg, &mut out).unwrap();

        assert!(out.contains(&format!("[Corrected thread info for breakpoint {}]", id)));
        assert_ne!(kernel.debug_state_of(0x303).bcr[0], 0);
        {
            let bps = dbg.breakpoints.lock().unwrap();
            let bp = bps.find(|b| b.id == id).unwrap();
            assert_eq!(bp.threadinfo.real_tid, 0x222);
            assert_eq!(bp.threadinfo.local_id, 3);
        }

        // Now the tid vanishes entirely: the breakpoint is deleted with a
        // notice.
        kernel.remove_thread(0x303);
        let mut out = String::new();
        threadupdate(&dbg, &mut out).unwrap();
        assert!(out.contains(&format!(
            "[The thread assigned to breakpoint {} has gone away, deleting it]",
            id
        )));
        assert_eq!(dbg.num_breakpoints(), 0);
    }

    #[test]
    fn focus_moves_when_the_focused_thread_dies() {
        let (kernel, dbg) = attached_debuggee();
        kernel.add_thread(0x202, 0x222, "worker");
        dbg.update_threads(&[0x101, 0x202]);
        dbg.set_focused_thread(0x202);

        kernel.remove_thread(0x202);
        let mut out = String::new();
        threadupdate(&dbg, &mut out).unwrap();

        assert!(out.contains("[Previously selected thread dead, selecting thread #1]"));
        assert_eq!(dbg.focused_port(), 0x101);
    }

    #[test]
    fn printsiginfo_lists_the_whole_table() {
        let (_kernel, dbg) = attached_debuggee();
        let mut out = String::new();
        printsiginfo(&dbg, &mut out);

        assert!(out.starts_with("NAME        PASS  STOP  NOTIFY\n"));
        assert!(out.contains("SIGKILL     true  true  true"));
        assert!(out.contains("SIGCHLD     true  false false"));
        // Header plus one row per signal 1..NSIG-1.
        assert_eq!(out.lines().count(), 2 + (sigsupport::NSIG as usize - 1));
    }
}
