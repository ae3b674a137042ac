//! Breakpoint engine: software trap patching, hardware debug-register
//! allocation, hit counting, and the one-shot breakpoints that bound a
//! step-over.

use log::warn;

use crate::debuggee::Debuggee;
use crate::error::{DbgError, DbgResult};
use crate::memutils;

/// BRK #0, the trap written over patched instructions.
pub const BRK_INSTRUCTION: u32 = 0xd420_0000;

pub const MAX_HW_BREAKPOINTS: usize = 6;

// Control-register value for an EL0 execute breakpoint: byte-address-select
// covering the whole word, privilege mode EL0, enable.
const BCR_BAS_ANY: u64 = 0xf << 5;
const BCR_PMC_EL0: u64 = 0b10 << 1;
const BCR_E: u64 = 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BpCond {
    Normal,
    /// One-shot; exists only to bound a step-over and is deleted on hit.
    Stepping,
}

/// Which thread a breakpoint is bound to. Software breakpoints with a
/// specific thread are emulated by the dispatcher; the trap itself is global.
#[derive(Copy, Clone, Debug)]
pub struct BpThreadInfo {
    pub all: bool,
    /// Debugger-local thread ID the breakpoint is bound to.
    pub local_id: u32,
    pub pthread_tid: u64,
    pub real_tid: u64,
}

impl Default for BpThreadInfo {
    fn default() -> BpThreadInfo {
        BpThreadInfo {
            all: true,
            local_id: 0,
            pthread_tid: 0,
            real_tid: 0,
        }
    }
}

pub struct Breakpoint {
    pub id: u32,
    /// Absolute inferior VA.
    pub location: u64,
    pub hw: bool,
    pub hw_bp_reg: usize,
    /// Original instruction word, restored on disable and delete.
    pub old_instruction: u32,
    pub bcr: u64,
    pub bvr: u64,
    pub hit_count: u32,
    pub disabled: bool,
    pub cond: BpCond,
    pub threadinfo: BpThreadInfo,
}

/// Copy of the registry fields the dispatcher needs while no lock is held.
#[derive(Copy, Clone, Debug)]
pub struct BpSnapshot {
    pub id: u32,
    pub location: u64,
    pub hw: bool,
    pub all: bool,
    pub pthread_tid: u64,
    pub hit_count: u32,
}

fn kernel_err(op: &'static str) -> impl Fn(crate::kernel::KernError) -> DbgError {
    move |err| DbgError::Kernel { op, err }
}

/// Install a breakpoint and return its ID. Software installs patch the trap
/// over the original instruction and require the inferior to be suspended.
pub fn create(dbg: &Debuggee, location: u64, thread: Option<u32>, hw: bool) -> DbgResult<u32> {
    if !dbg.attached() {
        return Err(DbgError::NotAttached);
    }

    let threadinfo = resolve_threadinfo(dbg, thread)?;

    let bp = if hw {
        let slot = free_hw_slot(dbg)?;
        let bvr = location & !3;
        let bcr = BCR_BAS_ANY | BCR_PMC_EL0 | BCR_E;
        set_hw_regs(dbg, slot, bcr, bvr, &threadinfo)?;

        Breakpoint {
            id: 0,
            location,
            hw: true,
            hw_bp_reg: slot,
            old_instruction: 0,
            bcr,
            bvr,
            hit_count: 0,
            disabled: false,
            cond: BpCond::Normal,
            threadinfo,
        }
    } else {
        if !dbg.suspended() {
            return Err(DbgError::NotSuspended);
        }

        let old_instruction = memutils::read_instruction_word(dbg, location)?;
        memutils::write_instruction_word(dbg, location, BRK_INSTRUCTION)?;

        Breakpoint {
            id: 0,
            location,
            hw: false,
            hw_bp_reg: 0,
            old_instruction,
            bcr: 0,
            bvr: 0,
            hit_count: 0,
            disabled: false,
            cond: BpCond::Normal,
            threadinfo,
        }
    };

    Ok(register(dbg, bp))
}

/// Plant the one-shot breakpoint that bounds a step-over.
pub fn create_stepping(dbg: &Debuggee, location: u64) -> DbgResult<u32> {
    if !dbg.attached() {
        return Err(DbgError::NotAttached);
    }
    if !dbg.suspended() {
        return Err(DbgError::NotSuspended);
    }

    let old_instruction = memutils::read_instruction_word(dbg, location)?;
    memutils::write_instruction_word(dbg, location, BRK_INSTRUCTION)?;

    let bp = Breakpoint {
        id: 0,
        location,
        hw: false,
        hw_bp_reg: 0,
        old_instruction,
        bcr: 0,
        bvr: 0,
        hit_count: 0,
        disabled: false,
        cond: BpCond::Stepping,
        threadinfo: Default::default(),
    };

    Ok(register(dbg, bp))
}

fn register(dbg: &Debuggee, mut bp: Breakpoint) -> u32 {
    let id = dbg.breakpoint_added();
    bp.id = id;
    dbg.breakpoints.lock().unwrap().append(bp);
    id
}

fn resolve_threadinfo(dbg: &Debuggee, thread: Option<u32>) -> DbgResult<BpThreadInfo> {
    match thread {
        Some(local_id) => {
            let tid = {
                let threads = dbg.threads.lock().unwrap();
                threads.find(|t| t.id == local_id).map(|t| t.tid)
            };
            let tid = tid.ok_or_else(|| {
                DbgError::Internal(format!("no thread with local ID {}", local_id))
            })?;
            Ok(BpThreadInfo {
                all: false,
                local_id,
                pthread_tid: tid,
                real_tid: tid,
            })
        }
        None => Ok(BpThreadInfo::default()),
    }
}

fn free_hw_slot(dbg: &Debuggee) -> DbgResult<usize> {
    let bps = dbg.breakpoints.lock().unwrap();
    for slot in 0..MAX_HW_BREAKPOINTS {
        if bps.find(|b| b.hw && b.hw_bp_reg == slot).is_none() {
            return Ok(slot);
        }
    }
    Err(DbgError::NoFreeSlot("breakpoint"))
}

/// Write (or clear, when `bcr`/`bvr` are zero) one debug-register slot on
/// every thread the breakpoint is bound to.
fn set_hw_regs(
    dbg: &Debuggee,
    slot: usize,
    bcr: u64,
    bvr: u64,
    threadinfo: &BpThreadInfo,
) -> DbgResult<()> {
    let kernel = &*dbg.kernel;
    let mut threads = dbg.threads.lock().unwrap();

    for t in threads.iter_mut() {
        if threadinfo.all || t.id == threadinfo.local_id {
            t.get_debug_state(kernel)
                .map_err(kernel_err("debug-state read"))?;
            t.debug_state.bcr[slot] = bcr;
            t.debug_state.bvr[slot] = bvr;
            t.set_debug_state(kernel)
                .map_err(kernel_err("debug-state apply"))?;
        }
    }
    Ok(())
}

pub fn find_with_cond(dbg: &Debuggee, location: u64, cond: BpCond) -> Option<BpSnapshot> {
    let bps = dbg.breakpoints.lock().unwrap();
    bps.find(|b| b.location == location && b.cond == cond)
        .map(|b| BpSnapshot {
            id: b.id,
            location: b.location,
            hw: b.hw,
            all: b.threadinfo.all,
            pthread_tid: b.threadinfo.pthread_tid,
            hit_count: b.hit_count,
        })
}

/// Count a hit. A STEPPING breakpoint is deleted on the way out.
pub fn hit(dbg: &Debuggee, id: u32) -> DbgResult<BpSnapshot> {
    let (snapshot, one_shot) = {
        let mut bps = dbg.breakpoints.lock().unwrap();
        let bp = bps
            .find_mut(|b| b.id == id)
            .ok_or(DbgError::NoSuchBreakpoint(id))?;
        bp.hit_count += 1;
        (
            BpSnapshot {
                id: bp.id,
                location: bp.location,
                hw: bp.hw,
                all: bp.threadinfo.all,
                pthread_tid: bp.threadinfo.pthread_tid,
                hit_count: bp.hit_count,
            },
            bp.cond == BpCond::Stepping,
        )
    };

    if one_shot {
        delete(dbg, id)?;
    }
    Ok(snapshot)
}

pub fn enable(dbg: &Debuggee, id: u32) -> DbgResult<()> {
    set_enabled(dbg, id, true)
}

pub fn disable(dbg: &Debuggee, id: u32) -> DbgResult<()> {
    set_enabled(dbg, id, false)
}

struct EngineView {
    location: u64,
    hw: bool,
    hw_bp_reg: usize,
    old_instruction: u32,
    bcr: u64,
    bvr: u64,
    threadinfo: BpThreadInfo,
}

fn engine_view(dbg: &Debuggee, id: u32) -> DbgResult<EngineView> {
    let bps = dbg.breakpoints.lock().unwrap();
    bps.find(|b| b.id == id)
        .map(|b| EngineView {
            location: b.location,
            hw: b.hw,
            hw_bp_reg: b.hw_bp_reg,
            old_instruction: b.old_instruction,
            bcr: b.bcr,
            bvr: b.bvr,
            threadinfo: b.threadinfo,
        })
        .ok_or(DbgError::NoSuchBreakpoint(id))
}

fn set_enabled(dbg: &Debuggee, id: u32, enabled: bool) -> DbgResult<()> {
    let view = engine_view(dbg, id)?;

    if view.hw {
        let (bcr, bvr) = if enabled { (view.bcr, view.bvr) } else { (0, 0) };
        set_hw_regs(dbg, view.hw_bp_reg, bcr, bvr, &view.threadinfo)?;
    } else {
        let word = if enabled {
            BRK_INSTRUCTION
        } else {
            view.old_instruction
        };
        memutils::write_instruction_word(dbg, view.location, word)?;
    }

    let mut bps = dbg.breakpoints.lock().unwrap();
    if let Some(bp) = bps.find_mut(|b| b.id == id) {
        bp.disabled = !enabled;
    }
    Ok(())
}

pub fn enable_all_specific(dbg: &Debuggee, cond: BpCond) {
    for id in ids_with_cond(dbg, cond) {
        if let Err(e) = enable(dbg, id) {
            warn!("couldn't re-enable breakpoint {}: {}", id, e);
        }
    }
}

pub fn disable_all_specific(dbg: &Debuggee, cond: BpCond) {
    for id in ids_with_cond(dbg, cond) {
        if let Err(e) = disable(dbg, id) {
            warn!("couldn't disable breakpoint {}: {}", id, e);
        }
    }
}

fn ids_with_cond(dbg: &Debuggee, cond: BpCond) -> Vec<u32> {
    let bps = dbg.breakpoints.lock().unwrap();
    bps.iter()
        .filter(|b| b.cond == cond)
        .map(|b| b.id)
        .collect()
}

/// Restore the original instruction (or clear the debug-register slot) and
/// drop the breakpoint from the registry.
pub fn delete(dbg: &Debuggee, id: u32) -> DbgResult<()> {
    let view = engine_view(dbg, id)?;

    if view.hw {
        set_hw_regs(dbg, view.hw_bp_reg, 0, 0, &view.threadinfo)?;
    } else {
        memutils::write_instruction_word(dbg, view.location, view.old_instruction)?;
    }

    let removed = dbg.breakpoints.lock().unwrap().remove_where(|b| b.id == id);
    dbg.breakpoints_removed(removed as u32);
    Ok(())
}

pub fn delete_all_specific(dbg: &Debuggee, cond: BpCond) {
    for id in ids_with_cond(dbg, cond) {
        if let Err(e) = delete(dbg, id) {
            warn!("couldn't delete breakpoint {}: {}", id, e);
        }
    }
}

pub fn delete_all(dbg: &Debuggee) {
    delete_all_specific(dbg, BpCond::Normal);
    delete_all_specific(dbg, BpCond::Stepping);
}
