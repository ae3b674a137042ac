//! Hardware watchpoint engine. On a hit the dispatcher lets the faulting
//! instruction retire under single-step, then asks us to diff the watched
//! bytes against the snapshot taken here.

use bitflags::bitflags;
use log::warn;

use crate::debuggee::Debuggee;
use crate::error::{DbgError, DbgResult};
use crate::memutils;

pub const MAX_HW_WATCHPOINTS: usize = 4;

// Control-register fields: load/store-control at bit 3, privilege mode EL0,
// enable; the byte-address-select mask starts at bit 5.
const WCR_BAS_SHIFT: u64 = 5;
const WCR_LSC_SHIFT: u64 = 3;
const WCR_PAC_EL0: u64 = 0b10 << 1;
const WCR_E: u64 = 1;

bitflags! {
    pub struct WatchMode: u32 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

pub struct Watchpoint {
    pub id: u32,
    /// The address the user asked to watch; may be unaligned.
    pub user_location: u64,
    pub data_len: u32,
    /// Last observed bytes at the watched location.
    pub data: Vec<u8>,
    pub mode: WatchMode,
    pub hw_wp_reg: usize,
    pub wcr: u64,
    pub wvr: u64,
    pub hit_count: u32,
}

/// Everything the dispatcher needs to report one watchpoint hit.
#[derive(Clone, Debug)]
pub struct WpHit {
    pub id: u32,
    pub user_location: u64,
    pub data_len: u32,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
    pub hit_count: u32,
}

fn kernel_err(op: &'static str) -> impl Fn(crate::kernel::KernError) -> DbgError {
    move |err| DbgError::Kernel { op, err }
}

pub fn create(dbg: &Debuggee, location: u64, len: u32, mode: WatchMode) -> DbgResult<u32> {
    if !dbg.attached() {
        return Err(DbgError::NotAttached);
    }
    match len {
        1 | 2 | 4 | 8 => {}
        other => return Err(DbgError::BadWatchSize(other)),
    }

    let mut data = vec![0u8; len as usize];
    memutils::read_memory_at_location(dbg, location, &mut data)?;

    let slot = free_hw_slot(dbg)?;

    let wvr = location & !7;
    let bas = ((1u64 << len) - 1) << (location & 7);
    let lsc = {
        let mut lsc = 0u64;
        if mode.contains(WatchMode::READ) {
            lsc |= 0b01;
        }
        if mode.contains(WatchMode::WRITE) {
            lsc |= 0b10;
        }
        lsc
    };
    let wcr = (bas << WCR_BAS_SHIFT) | (lsc << WCR_LSC_SHIFT) | WCR_PAC_EL0 | WCR_E;

    set_hw_regs(dbg, slot, wcr, wvr)?;

    let id = dbg.watchpoint_added();
    dbg.watchpoints.lock().unwrap().append(Watchpoint {
        id,
        user_location: location,
        data_len: len,
        data,
        mode,
        hw_wp_reg: slot,
        wcr,
        wvr,
        hit_count: 0,
    });
    Ok(id)
}

fn free_hw_slot(dbg: &Debuggee) -> DbgResult<usize> {
    let wps = dbg.watchpoints.lock().unwrap();
    for slot in 0..MAX_HW_WATCHPOINTS {
        if wps.find(|w| w.hw_wp_reg == slot).is_none() {
            return Ok(slot);
        }
    }
    Err(DbgError::NoFreeSlot("watchpoint"))
}

/// Watchpoints watch data, not code, so every thread gets the registers.
fn set_hw_regs(dbg: &Debuggee, slot: usize, wcr: u64, wvr: u64) -> DbgResult<()> {
    let kernel = &*dbg.kernel;
    let mut threads = dbg.threads.lock().unwrap();

    for t in threads.iter_mut() {
        t.get_debug_state(kernel)
            .map_err(kernel_err("debug-state read"))?;
        t.debug_state.wcr[slot] = wcr;
        t.debug_state.wvr[slot] = wvr;
        t.set_debug_state(kernel)
            .map_err(kernel_err("debug-state apply"))?;
    }
    Ok(())
}

/// Find the watchpoint covering a faulting data address.
pub fn find_with_address(dbg: &Debuggee, addr: u64) -> Option<u32> {
    let wps = dbg.watchpoints.lock().unwrap();
    wps.find(|w| addr >= w.user_location && addr < w.user_location + w.data_len as u64)
        .map(|w| w.id)
}

/// Count a hit and swap in the just-written bytes, returning both the old
/// snapshot and the new value.
pub fn capture_hit(dbg: &Debuggee, id: u32) -> DbgResult<WpHit> {
    let (user_location, data_len, old, hit_count) = {
        let mut wps = dbg.watchpoints.lock().unwrap();
        let wp = wps
            .find_mut(|w| w.id == id)
            .ok_or(DbgError::NoSuchWatchpoint(id))?;
        wp.hit_count += 1;
        (wp.user_location, wp.data_len, wp.data.clone(), wp.hit_count)
    };

    let mut new = vec![0u8; data_len as usize];
    memutils::read_memory_at_location(dbg, user_location, &mut new)?;

    if let Some(wp) = dbg
        .watchpoints
        .lock()
        .unwrap()
        .find_mut(|w| w.id == id)
    {
        wp.data = new.clone();
    }

    Ok(WpHit {
        id,
        user_location,
        data_len,
        old,
        new,
        hit_count,
    })
}

pub fn delete(dbg: &Debuggee, id: u32) -> DbgResult<()> {
    let slot = {
        let wps = dbg.watchpoints.lock().unwrap();
        wps.find(|w| w.id == id)
            .map(|w| w.hw_wp_reg)
            .ok_or(DbgError::NoSuchWatchpoint(id))?
    };

    set_hw_regs(dbg, slot, 0, 0)?;

    let removed = dbg.watchpoints.lock().unwrap().remove_where(|w| w.id == id);
    dbg.watchpoints_removed(removed as u32);
    Ok(())
}

pub fn delete_all(dbg: &Debuggee) {
    let ids: Vec<u32> = {
        let wps = dbg.watchpoints.lock().unwrap();
        wps.iter().map(|w| w.id).collect()
    };
    for id in ids {
        if let Err(e) = delete(dbg, id) {
            warn!("couldn't delete watchpoint {}: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testutil::attached_debuggee;

    const DATA: u64 = 0x1_0000_2000;

    #[test]
    fn install_programs_control_and_value_registers() {
        let (kernel, dbg) = attached_debuggee();
        kernel.map_bytes(DATA, &[0xaa, 0, 0, 0]);

        create(&dbg, DATA, 4, WatchMode::WRITE).unwrap();

        let ds = kernel.debug_state_of(0x101);
        assert_eq!(ds.wvr[0], DATA);
        // BAS for 4 bytes at offset 0, store-only, EL0, enabled.
        assert_eq!(ds.wcr[0], (0xf << 5) | (0b10 << 3) | (0b10 << 1) | 1);
        assert_eq!(dbg.num_watchpoints(), 1);
    }

    #[test]
    fn unaligned_watch_selects_the_right_bytes() {
        let (kernel, dbg) = attached_debuggee();
        kernel.map_bytes(DATA + 2, &[0, 0]);

        create(&dbg, DATA + 2, 2, WatchMode::READ | WatchMode::WRITE).unwrap();

        let ds = kernel.debug_state_of(0x101);
        assert_eq!(ds.wvr[0], DATA);
        assert_eq!(ds.wcr[0], (0xc << 5) | (0b11 << 3) | (0b10 << 1) | 1);
    }

    #[test]
    fn rejects_bad_sizes_and_exhausts_slots() {
        let (kernel, dbg) = attached_debuggee();
        kernel.map_bytes(DATA, &[0; 64]);

        match create(&dbg, DATA, 3, WatchMode::WRITE) {
            Err(DbgError::BadWatchSize(3)) => {}
            other => panic!("expected size error, got {:?}", other.map(|_| ())),
        }

        for n in 0..MAX_HW_WATCHPOINTS {
            create(&dbg, DATA + 8 * n as u64, 8, WatchMode::WRITE).unwrap();
        }
        match create(&dbg, DATA + 48, 8, WatchMode::WRITE) {
            Err(DbgError::NoFreeSlot("watchpoint")) => {}
            other => panic!("expected slot exhaustion, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn capture_hit_diffs_against_the_snapshot() {
        let (kernel, dbg) = attached_debuggee();
        kernel.map_bytes(DATA, &[0xaa, 0x00, 0x00, 0x00]);

        let id = create(&dbg, DATA, 4, WatchMode::WRITE).unwrap();
        assert_eq!(find_with_address(&dbg, DATA + 3), Some(id));
        assert_eq!(find_with_address(&dbg, DATA + 4), None);

        // The inferior stores a new word, then the dispatcher captures.
        kernel.map_bytes(DATA, &[0xfe, 0xff, 0xff, 0xff]);
        let hit = capture_hit(&dbg, id).unwrap();
        assert_eq!(hit.old, vec![0xaa, 0x00, 0x00, 0x00]);
        assert_eq!(hit.new, vec![0xfe, 0xff, 0xff, 0xff]);
        assert_eq!(hit.hit_count, 1);

        delete(&dbg, id).unwrap();
        assert_eq!(kernel.debug_state_of(0x101).wcr[0], 0);
        assert_eq!(dbg.num_watchpoints(), 0);
    }
}
