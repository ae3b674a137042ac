//! Exception classification and the per-message state machine. One request
//! in, one reply out; in between we mutate breakpoint, watchpoint, and
//! thread-stepping state and build the human-readable stop description.

use std::fmt::Write;

use log::{debug, error, warn};

use crate::breakpoint::{self, BpCond};
use crate::debuggee::Debuggee;
use crate::kernel::{
    exc_str, KernReturn, KernResult, MsgHeader, Reply, Request, EXC_ARM_BREAKPOINT,
    EXC_ARM_DA_DEBUG, EXC_BREAKPOINT, EXC_SOFTWARE, EXC_SOFT_SIGNAL, MACH_MSGH_BITS_REMOTE_MASK,
    PORT_NULL,
};
use crate::kernel::PortName;
use crate::sigsupport::{self, SigSettings};
use crate::thread::StepKind;
use crate::watchpoint;

/// Size on the wire of the reply message.
const REPLY_SIZE: u32 = 36;

/// What the dispatcher decided for one consumed request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Disposition {
    pub should_print: bool,
    pub should_auto_resume: bool,
}

impl Default for Disposition {
    fn default() -> Disposition {
        Disposition {
            should_print: true,
            should_auto_resume: true,
        }
    }
}

fn describe_hit_watchpoint(prev: &[u8], cur: &[u8], desc: &mut String) {
    let _ = write!(
        desc,
        "Old value: {}\nNew value: {}\n\n",
        signed_hex(prev),
        signed_hex(cur)
    );
}

/// Sign-magnitude rendering at the watched width; the minus sign is
/// synthetic.
fn signed_hex(bytes: &[u8]) -> String {
    let value: i64 = match bytes.len() {
        1 => i8::from_le_bytes([bytes[0]]) as i64,
        2 => i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
        4 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
        _ => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[..8]);
            i64::from_le_bytes(raw)
        }
    };

    if value < 0 {
        format!("-{:#x}", (value as i128).wrapping_neg())
    } else {
        format!("{:#x}", value)
    }
}

fn handle_soft_signal(
    dbg: &Debuggee,
    thread: PortName,
    subcode: i64,
    desc: &mut String,
    settings: SigSettings,
) {
    let _ = write!(desc, "{}, {}. ", subcode, sigsupport::signame(subcode as i32));

    // If we're passing signals, don't clear them.
    if settings.pass {
        return;
    }

    if let Err(e) = dbg.kernel.ptrace_thupdate(dbg.pid, thread, 0) {
        warn!("couldn't clear the pending signal: {}", e);
    }
}

fn handle_hit_watchpoint(dbg: &Debuggee, tname: &str, disp: &mut Disposition, desc: &mut String) {
    let (loc, wp_pc) = dbg
        .with_focused_mut(|t| (t.last_hit_wp_loc, t.last_hit_wp_pc))
        .unwrap_or((0, 0));

    let id = match watchpoint::find_with_address(dbg, loc) {
        Some(id) => id,
        None => {
            // should auto resume, should not print
            disp.should_print = false;
            return;
        }
    };

    match watchpoint::capture_hit(dbg, id) {
        Ok(hit) => {
            let _ = write!(
                desc,
                ": '{}': watchpoint {} at {:#x} hit {} time(s).\n\n",
                tname, hit.id, hit.user_location, hit.hit_count
            );
            describe_hit_watchpoint(&hit.old, &hit.new, desc);
            // The faulting instruction has retired; show the next one.
            dbg.collab.disassembler.disassemble(wp_pc + 4, 4, desc);

            // should print, should not auto resume
            disp.should_auto_resume = false;
        }
        Err(e) => {
            error!("watchpoint {} hit but capture failed: {}", id, e);
            disp.should_print = false;
        }
    }

    dbg.with_focused_mut(|t| {
        t.last_hit_wp_loc = 0;
        t.last_hit_wp_pc = 0;
    });
}

fn handle_hit_breakpoint(
    dbg: &Debuggee,
    tid: u64,
    location: u64,
    disp: &mut Disposition,
    desc: &mut String,
) {
    let hit = breakpoint::find_with_cond(dbg, location, BpCond::Normal);
    let step = breakpoint::find_with_cond(dbg, location, BpCond::Stepping);

    if hit.is_none() && step.is_none() {
        disp.should_print = false;
        return;
    }

    if let Some(step) = step {
        // temporary breakpoint, deleted when hit
        if let Err(e) = breakpoint::hit(dbg, step.id) {
            warn!("stepping breakpoint {} vanished: {}", step.id, e);
        }

        dbg.with_focused_mut(|t| {
            t.stepconfig.just_hit_ss_breakpoint = true;
            t.stepconfig.set_temp_ss_breakpoint = false;
        });
    }

    // We can't have real thread-specific software breakpoints, but we can
    // emulate them: foreign threads are stepped past silently.
    if let Some(ref h) = hit {
        if !h.all && !h.hw && tid != h.pthread_tid {
            // should not print, should auto resume
            disp.should_print = false;
            return;
        }
    }

    if let Some(h) = hit {
        match breakpoint::hit(dbg, h.id) {
            Ok(counted) => {
                let _ = write!(
                    desc,
                    " breakpoint {} at {:#x} hit {} time(s).\n",
                    counted.id, counted.location, counted.hit_count
                );

                if !counted.hw {
                    dbg.with_focused_mut(|t| t.just_hit_sw_breakpoint = true);
                    // Put the original instruction back so the thread can
                    // retire it.
                    if let Err(e) = breakpoint::disable(dbg, counted.id) {
                        warn!("couldn't disable breakpoint {}: {}", counted.id, e);
                    }
                }

                dbg.with_focused_mut(|t| t.last_hit_bkpt_id = counted.id);
            }
            Err(e) => error!("breakpoint {} hit but not counted: {}", h.id, e),
        }
    } else {
        desc.push_str(" instruction step over.\n");
    }

    // should print, should not auto resume
    disp.should_auto_resume = false;
}

fn handle_single_step(dbg: &Debuggee, pc: u64, disp: &mut Disposition, desc: &mut String) {
    breakpoint::enable_all_specific(dbg, BpCond::Normal);

    let just_hit_breakpoint = dbg
        .with_focused_mut(|t| t.just_hit_breakpoint)
        .unwrap_or(false);

    if just_hit_breakpoint {
        let (just_sw, last_id) = dbg
            .with_focused_mut(|t| (t.just_hit_sw_breakpoint, t.last_hit_bkpt_id))
            .unwrap_or((false, 0));

        if just_sw {
            if let Err(e) = breakpoint::enable(dbg, last_id) {
                warn!("couldn't re-enable breakpoint {}: {}", last_id, e);
            }
            dbg.with_focused_mut(|t| t.just_hit_sw_breakpoint = false);
        }

        // If we caused a software step exception to get past a breakpoint,
        // just continue as normal. Otherwise, if we manually single step
        // right after a breakpoint hit, just print the disassembly.
        let is_stepping = dbg
            .with_focused_mut(|t| t.stepconfig.is_stepping)
            .unwrap_or(false);

        if !is_stepping {
            dbg.with_focused_mut(|t| {
                if t.stepconfig.step_kind == StepKind::InstStepOver
                    && t.stepconfig.just_hit_ss_breakpoint
                {
                    t.stepconfig.just_hit_ss_breakpoint = false;
                }
            });

            // should not print, should auto resume
            disp.should_print = false;
        } else {
            // should print, should not auto resume
            disp.should_auto_resume = false;
            desc.push('\n');
            dbg.collab.disassembler.disassemble(pc, 4, desc);
        }

        dbg.with_focused_mut(|t| t.just_hit_breakpoint = false);
        return;
    }

    let (step_kind, set_temp) = dbg
        .with_focused_mut(|t| {
            (
                t.stepconfig.step_kind,
                t.stepconfig.set_temp_ss_breakpoint,
            )
        })
        .unwrap_or((StepKind::None, false));

    if step_kind == StepKind::InstStepOver {
        if !set_temp {
            disp.should_auto_resume = false;
        }
    } else {
        disp.should_auto_resume = false;
    }

    desc.push('\n');
    dbg.collab.disassembler.disassemble(pc, 4, desc);
}

/// Classify one request and drive the stepping, breakpoint, watchpoint, and
/// signal handlers. The caller replies and acts on the returned disposition.
pub fn handle_exception(dbg: &Debuggee, req: &Request, desc: &mut String) -> Disposition {
    let mut disp = Disposition::default();

    // Finish printing everything while tracing so we don't get caught in
    // the middle of it.
    if dbg.currently_tracing {
        dbg.collab.trace.wait_until_idle();
    }

    let thread = req.thread;
    let exception = req.exception;
    let code = req.code[0];
    let subcode = req.code[1];

    // Give focus to whatever caused this exception.
    if dbg.focused_port() != thread && !dbg.set_focused_thread(thread) {
        // A thread we haven't met; refresh the registry and retry.
        if let Ok(ports) = dbg.kernel.task_threads(dbg.task) {
            dbg.update_threads(&ports);
        }
        if !dbg.set_focused_thread(thread) {
            debug!("exception from unknown thread {:#x}", thread);
            disp.should_print = false;
            return disp;
        }
    }

    let focused = dbg.with_focused_mut(|t| {
        if let Err(e) = t.get_thread_state(&*dbg.kernel) {
            warn!("couldn't refresh thread state: {}", e);
        }
        (t.id, t.tid, t.tname.clone(), t.thread_state.pc)
    });

    let (id, tid, tname, pc) = match focused {
        Some(f) => f,
        None => {
            disp.should_print = false;
            return disp;
        }
    };

    let _ = write!(desc, "\n * Thread #{} (tid = {:#x})", id, tid);

    if exception == EXC_SOFTWARE && code == EXC_SOFT_SIGNAL {
        // Unix soft signal.
        let settings = sigsupport::sigsettings(dbg, subcode as i32).unwrap_or_default();

        let _ = write!(desc, ", '{}' received signal ", tname);
        handle_soft_signal(dbg, thread, subcode, desc, settings);

        match (settings.notify, settings.stop) {
            (false, false) => {
                // should not print, should auto resume
                disp.should_print = false;
            }
            (false, true) => {
                // should not print, should not auto resume
                disp.should_print = false;
                disp.should_auto_resume = false;
            }
            (true, false) => {
                // should print, should auto resume
                desc.push_str("Resuming execution.\n");
            }
            (true, true) => {
                // should print, should not auto resume
                disp.should_auto_resume = false;
                desc.push('\n');
                dbg.collab.disassembler.disassemble(pc, 4, desc);
            }
        }
    } else if code == EXC_ARM_DA_DEBUG {
        // A hardware watchpoint hit. Single step so the CPU executes the
        // instruction at this address and the value actually changes; the
        // step exception that follows is handled below.
        dbg.with_focused_mut(|t| {
            t.just_hit_watchpoint = true;
            t.last_hit_wp_loc = subcode as u64;
            t.last_hit_wp_pc = t.thread_state.pc;

            if let Err(e) = t.set_single_step(&*dbg.kernel, true) {
                warn!("couldn't enable single stepping: {}", e);
            }
        });

        // should not print, should auto resume
        disp.should_print = false;
    } else if exception == EXC_BREAKPOINT && code == EXC_ARM_BREAKPOINT {
        // A hardware/software breakpoint hit, or the software step
        // exception has occurred.
        if subcode == 0 {
            let just_hit_watchpoint = dbg
                .with_focused_mut(|t| t.just_hit_watchpoint)
                .unwrap_or(false);

            if just_hit_watchpoint {
                handle_hit_watchpoint(dbg, &tname, &mut disp, desc);
                dbg.with_focused_mut(|t| t.just_hit_watchpoint = false);
                return disp;
            }

            let is_stepping = dbg
                .with_focused_mut(|t| t.stepconfig.is_stepping)
                .unwrap_or(false);

            if is_stepping {
                if let Some(bp) = breakpoint::find_with_cond(dbg, pc, BpCond::Normal) {
                    match breakpoint::hit(dbg, bp.id) {
                        Ok(counted) => {
                            let _ = write!(
                                desc,
                                ": '{}': breakpoint {} at {:#x} hit {} time(s).",
                                tname, counted.id, counted.location, counted.hit_count
                            );
                        }
                        Err(e) => error!("breakpoint {} hit but not counted: {}", bp.id, e),
                    }
                } else {
                    let step_kind = dbg
                        .with_focused_mut(|t| t.stepconfig.step_kind)
                        .unwrap_or(StepKind::None);
                    let kind = if step_kind == StepKind::InstStepOver {
                        "instruction step over"
                    } else {
                        "instruction step in"
                    };
                    let _ = write!(desc, ": '{}': {}.", tname, kind);
                }
            }

            handle_single_step(dbg, pc, &mut disp, desc);

            dbg.with_focused_mut(|t| t.finish_step());
            return disp;
        }

        dbg.with_focused_mut(|t| t.just_hit_breakpoint = true);

        let _ = write!(desc, ": '{}':", tname);
        handle_hit_breakpoint(dbg, tid, subcode as u64, &mut disp, desc);
        dbg.collab.disassembler.disassemble(pc, 4, desc);

        dbg.with_focused_mut(|t| {
            if let Err(e) = t.set_single_step(&*dbg.kernel, true) {
                warn!("couldn't enable single stepping: {}", e);
            }
        });
    } else {
        // Something else occurred.
        let _ = write!(
            desc,
            ": '{}': stop reason: {} (code = {:#x}, subcode = {:#x})\n",
            tname,
            exc_str(exception),
            code,
            subcode
        );
        dbg.collab.disassembler.disassemble(pc, 4, desc);

        // should print, should not auto resume
        disp.should_auto_resume = false;
    }

    disp
}

/// Build the reply that lets the inferior's faulting thread go. The header
/// mirrors the request: remote bits kept, local port nulled, ID bumped by
/// 100.
pub fn build_reply(req: &Request, retcode: KernReturn) -> Reply {
    Reply {
        head: MsgHeader {
            msgh_bits: req.head.msgh_bits & MACH_MSGH_BITS_REMOTE_MASK,
            msgh_size: REPLY_SIZE,
            msgh_remote_port: req.head.msgh_remote_port,
            msgh_local_port: PORT_NULL,
            msgh_reserved: 0,
            msgh_id: req.head.msgh_id + 100,
        },
        ndr: req.ndr,
        ret_code: retcode,
    }
}

pub fn reply_to_exception(dbg: &Debuggee, req: &Request, retcode: KernReturn) -> KernResult<()> {
    dbg.kernel.send_reply(&build_reply(req, retcode))
}
