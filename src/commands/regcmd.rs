//! `register view` and `register write` against the focused thread.

use std::fmt::Write;

use crate::commands::CmdArgs;
use crate::debuggee::Debuggee;
use crate::error::{CmdStatus, DbgError, DbgResult};
use crate::reg;

pub fn register_view(
    dbg: &mut Debuggee,
    args: &mut CmdArgs,
    out: &mut String,
) -> DbgResult<CmdStatus> {
    if !dbg.attached() {
        return Err(DbgError::NotAttached);
    }

    let refreshed = dbg.with_focused_mut(|t| {
        let _ = t.get_thread_state(&*dbg.kernel);
        let _ = t.get_neon_state(&*dbg.kernel);
    });
    if refreshed.is_none() {
        return Err(DbgError::Internal("no focused thread".to_string()));
    }

    // No arguments means every general-purpose register.
    if args.num_args() == 0 {
        dbg.with_focused_mut(|t| {
            for i in 0..29 {
                let _ = write!(
                    out,
                    "{:>10} = 0x{:016x}\n",
                    format!("x{}", i),
                    t.thread_state.x[i]
                );
            }

            let _ = write!(out, "{:>10} = 0x{:016x}\n", "fp", t.thread_state.fp);
            let _ = write!(out, "{:>10} = 0x{:016x}\n", "lr", t.thread_state.lr);
            let _ = write!(out, "{:>10} = 0x{:016x}\n", "sp", t.thread_state.sp);
            let _ = write!(out, "{:>10} = 0x{:016x}\n", "pc", t.thread_state.pc);
            let _ = write!(out, "{:>10} = 0x{:08x}\n", "cpsr", t.thread_state.cpsr);
        });

        return Ok(CmdStatus::Success);
    }

    while let Some(curreg) = args.next("reg") {
        let line = dbg
            .with_focused_mut(|t| reg::format_register(t, &curreg))
            .unwrap_or_else(|| Err(DbgError::Internal("no focused thread".to_string())));

        match line {
            Ok(s) => {
                out.push_str(&s);
                out.push('\n');
            }
            Err(e) => {
                let _ = write!(out, "{:>10} {}\n", "error:", e);
            }
        }
    }

    Ok(CmdStatus::Success)
}

pub fn register_write(
    dbg: &mut Debuggee,
    args: &mut CmdArgs,
    _out: &mut String,
) -> DbgResult<CmdStatus> {
    if !dbg.attached() {
        return Err(DbgError::NotAttached);
    }

    let target = args.next("reg").ok_or(DbgError::MissingArgument("reg"))?;
    let value = args.next("value").ok_or(DbgError::MissingArgument("value"))?;

    match dbg.with_focused_mut(|t| reg::write_register(t, &*dbg.kernel, &target, &value)) {
        Some(result) => result?,
        None => return Err(DbgError::Internal("no focused thread".to_string())),
    }

    Ok(CmdStatus::Success)
}
