//! attach/detach lifecycle commands and the other miscellaneous command
//! handlers: aslr, backtrace, continue, evaluate, help, interrupt, kill,
//! quit, trace.

use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use libc::pid_t;
use log::warn;

use crate::commands::CmdArgs;
use crate::dbgops;
use crate::debuggee::Debuggee;
use crate::error::{CmdStatus, DbgError, DbgResult};
use crate::kernel::PORT_NULL;
use crate::memutils;
use crate::servers;
use crate::sigsupport::{self, SigSettings};

/// Flipped false by a console interrupt to cancel `attach --waitfor`.
pub static KEEP_CHECKING_FOR_PROCESS: AtomicBool = AtomicBool::new(false);

const WAITFOR_POLL: Duration = Duration::from_micros(400);

const DSC_WARN: &str = "warning: could not properly examine the debuggee's \
                        dyld_all_image_infos structure, symbolication will be minimal.\n";

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn resolve_target(dbg: &Debuggee, target: &str) -> Option<pid_t> {
    if is_number(target) {
        target.parse().ok()
    } else {
        dbg.kernel.pid_for_name(target)
    }
}

pub fn aslr(dbg: &mut Debuggee, _args: &mut CmdArgs, out: &mut String) -> DbgResult<CmdStatus> {
    if !dbg.attached() {
        return Err(DbgError::NotAttached);
    }
    let _ = write!(out, "{:>4}{:#x}\n", "", dbg.aslr_slide);
    Ok(CmdStatus::Success)
}

pub fn attach(dbg: &mut Debuggee, args: &mut CmdArgs, out: &mut String) -> DbgResult<CmdStatus> {
    let waitfor = args.next("waitfor").is_some();
    let target = args
        .next("target")
        .ok_or(DbgError::MissingArgument("target"))?;
    let nosigs = args.next("nosigs").is_some();

    // Attaching to something else while attached means detaching first.
    if dbg.attached() {
        let prompt = format!(
            "Detach from {} and reattach to {}? (y/n) ",
            dbg.debuggee_name, target
        );
        if !dbg.collab.interaction.confirm(&prompt) {
            return Ok(CmdStatus::Success);
        }

        out.clear();
        dbgops::detach(dbg, false, out)?;
    }

    attach_inner(dbg, waitfor, &target, nosigs, out)
}

fn attach_inner(
    dbg: &mut Debuggee,
    waitfor: bool,
    target: &str,
    nosigs: bool,
    out: &mut String,
) -> DbgResult<CmdStatus> {
    let pid = if waitfor {
        let _ = write!(
            out,
            "Waiting for process '{}' to launch (Ctrl+C to stop)\n\n",
            target
        );

        KEEP_CHECKING_FOR_PROCESS.store(true, Ordering::SeqCst);

        let mut pid = resolve_target(dbg, target);
        while pid.is_none() && KEEP_CHECKING_FOR_PROCESS.load(Ordering::SeqCst) {
            thread::sleep(WAITFOR_POLL);
            pid = resolve_target(dbg, target);
        }

        KEEP_CHECKING_FOR_PROCESS.store(false, Ordering::SeqCst);

        match pid {
            Some(pid) => pid,
            // Cancelled before the target launched; nothing happened.
            None => return Ok(CmdStatus::Success),
        }
    } else {
        resolve_target(dbg, target)
            .ok_or_else(|| DbgError::NoSuchProcess(target.to_string()))?
    };

    let name = if is_number(target) {
        dbg.kernel
            .name_for_pid(pid)
            .ok_or_else(|| DbgError::NoSuchProcess(target.to_string()))?
    } else {
        target.to_string()
    };

    let task = dbg
        .kernel
        .task_for_pid(pid)
        .map_err(|err| DbgError::TaskPortDenied {
            target: target.to_string(),
            pid,
            err,
        })?;

    dbg.task = task;
    let _ = dbg.suspend();

    match attach_commit(dbg, pid, name, nosigs, out) {
        Ok(()) => Ok(CmdStatus::Success),
        Err(e) => {
            // A failed attach leaves nothing behind.
            servers::shutdown_exception_server(dbg);
            if let Some(saved) = dbg.saved_exception_ports.lock().unwrap().pop() {
                let _ = dbg.kernel.restore_exception_ports(dbg.task, &saved);
            }
            let _ = dbg.resume();
            dbg.reset_suspend_count();
            dbg.clear_registries();
            dbg.pid = -1;
            dbg.task = PORT_NULL;
            dbg.debuggee_name.clear();
            dbg.aslr_slide = 0;
            Err(e)
        }
    }
}

fn attach_commit(
    dbg: &mut Debuggee,
    pid: pid_t,
    name: String,
    nosigs: bool,
    out: &mut String,
) -> DbgResult<()> {
    match dbg.kernel.find_slide(dbg.task) {
        Some(slide) => dbg.aslr_slide = slide,
        None => {
            dbg.aslr_slide = 0;
            out.push_str("warning: couldn't find debuggee's ASLR slide\n");
        }
    }

    dbg.pid = pid;
    dbg.debuggee_name = name;

    dbg.clear_registries();
    dbg.reset_thread_ids();

    let ports = dbg
        .kernel
        .task_threads(dbg.task)
        .map_err(|err| DbgError::Kernel {
            op: "thread enumeration",
            err,
        })?;
    dbg.thread_count = ports.len() as u32;
    dbg.update_threads(&ports);

    if let Some(&first) = ports.first() {
        dbg.set_focused_thread(first);
    }
    dbg.with_focused_mut(|t| {
        let _ = t.get_thread_state(&*dbg.kernel);
    });

    servers::setup_exception_server(dbg)?;

    let _ = write!(
        out,
        "Attached to {} (pid: {}), slide: {:#x}.\n",
        dbg.debuggee_name, dbg.pid, dbg.aslr_slide
    );

    dbg.collab.convvars.void("$_exitcode");
    dbg.collab.convvars.void("$_exitsignal");

    let aslr = format!("{:#x}", dbg.aslr_slide);
    if let Err(e) = dbg.collab.convvars.set("$ASLR", &aslr) {
        let _ = write!(out, "warning: {}\n", e);
    }

    match dbg.kernel.map_shared_cache() {
        Ok(cache) => {
            dbg.shared_cache = Some(cache);
            if dbg.collab.symbolicator.init_images().is_err() {
                out.push_str(DSC_WARN);
            }
        }
        Err(_) => out.push_str(DSC_WARN),
    }

    if !nosigs {
        // Have Unix signals be sent as exceptions.
        dbg.kernel.ptrace_attachexc(dbg.pid)?;
    } else {
        out.push_str("Not sending initial SIGSTOP. Disassembly omitted.\n");
        dbg.nosigs = true;
    }

    Ok(())
}

pub fn backtrace(
    dbg: &mut Debuggee,
    _args: &mut CmdArgs,
    out: &mut String,
) -> DbgResult<CmdStatus> {
    if !dbg.suspended() {
        return Err(DbgError::NotSuspended);
    }

    let (pc, lr, fp) = dbg
        .with_focused_mut(|t| {
            let _ = t.get_thread_state(&*dbg.kernel);
            (t.thread_state.pc, t.thread_state.lr, t.thread_state.fp)
        })
        .ok_or_else(|| DbgError::Internal("no focused thread".to_string()))?;

    let _ = write!(out, "  * frame #0: 0x{:016x}", pc);
    append_frame_string(dbg, pc, out);
    out.push('\n');

    let _ = write!(out, "{:>4}frame #1: 0x{:016x}", "", lr);
    append_frame_string(dbg, lr, out);
    out.push('\n');

    // The saved-fp chain: each frame holds {previous fp, return address}.
    let mut frame = read_frame(dbg, fp)
        .map_err(|e| DbgError::Collaborator(format!("backtrace failed: {}", e)))?;
    let mut frame_counter = 2;

    while frame.0 != 0 {
        let _ = write!(out, "{:>4}frame #{}: 0x{:016x}", "", frame_counter, frame.1);
        append_frame_string(dbg, frame.1, out);
        out.push('\n');

        match read_frame(dbg, frame.0) {
            Ok(next) => frame = next,
            Err(_) => break,
        }
        frame_counter += 1;
    }

    let _ = write!(out, " - cannot unwind past frame {} -\n", frame_counter - 1);
    Ok(CmdStatus::Success)
}

fn read_frame(dbg: &Debuggee, at: u64) -> DbgResult<(u64, u64)> {
    let mut buf = [0u8; 16];
    memutils::read_memory_at_location(dbg, at, &mut buf)?;

    let mut next = [0u8; 8];
    let mut vmaddr = [0u8; 8];
    next.copy_from_slice(&buf[..8]);
    vmaddr.copy_from_slice(&buf[8..]);
    Ok((u64::from_le_bytes(next), u64::from_le_bytes(vmaddr)))
}

fn append_frame_string(dbg: &Debuggee, addr: u64, out: &mut String) {
    let mut frstr = String::new();
    dbg.collab.symbolicator.create_frame_string(addr, &mut frstr);
    if !frstr.is_empty() {
        out.push(' ');
        out.push_str(&frstr);
    }
}

pub fn cont(dbg: &mut Debuggee, _args: &mut CmdArgs, out: &mut String) -> DbgResult<CmdStatus> {
    if !dbg.attached() {
        return Err(DbgError::NotAttached);
    }
    if !dbg.suspended() {
        return Err(DbgError::NotSuspended);
    }

    dbgops::resume(dbg)?;

    let _ = write!(out, "Process {} resuming\n", dbg.pid);

    // Make output look nicer while the tracer is interleaving.
    if dbg.currently_tracing {
        out.push('\n');
    }

    Ok(CmdStatus::Success)
}

pub fn detach(dbg: &mut Debuggee, _args: &mut CmdArgs, out: &mut String) -> DbgResult<CmdStatus> {
    if !dbg.attached() {
        return Err(DbgError::NotAttached);
    }

    if !dbg.tracing_disabled && dbg.currently_tracing {
        dbg.collab.trace.stop();
        dbg.currently_tracing = false;
    }

    dbgops::detach(dbg, false, out)?;
    Ok(CmdStatus::Success)
}

pub fn evaluate(dbg: &mut Debuggee, args: &mut CmdArgs, out: &mut String) -> DbgResult<CmdStatus> {
    while let Some(expr) = args.next("expr") {
        match dbg.collab.evaluator.eval(&expr) {
            Err(e) => {
                let _ = write!(
                    out,
                    "could not evaluate expr {}: {}\n",
                    dbg.current_eval_id(),
                    e
                );
            }
            Ok(result) => {
                let cnt = dbg.next_eval_id();
                let _ = write!(out, "${} = {}\n", cnt, result);

                let name = format!("${}", cnt);
                if dbg.collab.convvars.set(&name, &result.to_string()).is_err() {
                    warn!("couldn't save convenience variable {}", name);
                }
            }
        }
    }
    Ok(CmdStatus::Success)
}

pub fn help(dbg: &mut Debuggee, args: &mut CmdArgs, out: &mut String) -> DbgResult<CmdStatus> {
    let cmd = args.next("cmd");
    dbg.collab
        .docs
        .for_command(cmd.as_deref(), out)
        .map_err(DbgError::Collaborator)?;
    Ok(CmdStatus::Success)
}

pub fn interrupt(
    dbg: &mut Debuggee,
    _args: &mut CmdArgs,
    _out: &mut String,
) -> DbgResult<CmdStatus> {
    dbgops::interrupt(dbg)?;
    Ok(CmdStatus::Success)
}

pub fn kill(dbg: &mut Debuggee, _args: &mut CmdArgs, out: &mut String) -> DbgResult<CmdStatus> {
    if !dbg.attached() {
        return Err(DbgError::NotAttached);
    }

    let prompt = format!("Do you really want to kill {}? (y/n) ", dbg.debuggee_name);
    if !dbg.collab.interaction.confirm(&prompt) {
        return Ok(CmdStatus::Success);
    }

    // Don't notify the user that the debuggee received SIGKILL when they
    // asked for it themselves.
    let saved = sigsupport::sigsettings(dbg, libc::SIGKILL)?;
    sigsupport::set_sigsettings(
        dbg,
        libc::SIGKILL,
        SigSettings {
            notify: false,
            pass: true,
            stop: false,
        },
    )?;

    let pid = dbg.pid;
    dbgops::detach(dbg, false, out)?;

    dbg.kernel.kill(pid, libc::SIGKILL)?;
    dbg.kernel.waitpid(pid)?;

    sigsupport::set_sigsettings(dbg, libc::SIGKILL, saved)?;
    Ok(CmdStatus::Success)
}

pub fn quit(dbg: &mut Debuggee, _args: &mut CmdArgs, out: &mut String) -> DbgResult<CmdStatus> {
    if dbg.attached() {
        dbgops::detach(dbg, false, out)?;
    }

    if !dbg.tracing_disabled && dbg.currently_tracing {
        dbg.collab.trace.stop();
        dbg.currently_tracing = false;
    }

    Ok(CmdStatus::Quit)
}

pub fn trace(dbg: &mut Debuggee, _args: &mut CmdArgs, _out: &mut String) -> DbgResult<CmdStatus> {
    if dbg.tracing_disabled {
        return Err(DbgError::TracingUnsupported);
    }
    if dbg.currently_tracing {
        return Err(DbgError::AlreadyTracing);
    }

    dbg.collab.trace.start();
    dbg.currently_tracing = true;
    Ok(CmdStatus::Success)
}
