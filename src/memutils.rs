//! Inferior virtual-memory access. A failed read is a failure, never a
//! partial success, and never a signal.

use crate::debuggee::Debuggee;
use crate::error::{DbgError, DbgResult};

pub fn read_memory_at_location(dbg: &Debuggee, addr: u64, buf: &mut [u8]) -> DbgResult<()> {
    dbg.kernel
        .vm_read(dbg.task, addr, buf)
        .map_err(|err| DbgError::Kernel {
            op: "memory read",
            err,
        })
}

pub fn write_memory_to_location(dbg: &Debuggee, addr: u64, data: &[u8]) -> DbgResult<()> {
    dbg.kernel
        .vm_write(dbg.task, addr, data)
        .map_err(|err| DbgError::Kernel {
            op: "memory write",
            err,
        })
}

pub fn valid_location(dbg: &Debuggee, addr: u64) -> bool {
    dbg.kernel.vm_valid(dbg.task, addr)
}

/// One instruction word, as the CPU would decode it.
pub fn read_instruction_word(dbg: &Debuggee, addr: u64) -> DbgResult<u32> {
    let mut buf = [0u8; 4];
    read_memory_at_location(dbg, addr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn write_instruction_word(dbg: &Debuggee, addr: u64, word: u32) -> DbgResult<()> {
    write_memory_to_location(dbg, addr, &word.to_le_bytes())
}

pub fn swap_u32(value: u32) -> u32 {
    value.swap_bytes()
}

pub fn swap_u64(value: u64) -> u64 {
    value.swap_bytes()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kernel::mock::MockKernel;

    fn attach_mem(bytes: &[u8], at: u64) -> (Arc<MockKernel>, Debuggee) {
        let kernel = Arc::new(MockKernel::new());
        kernel.map_bytes(at, bytes);
        let mut dbg = Debuggee::new(kernel.clone(), Default::default());
        dbg.task = crate::kernel::mock::MOCK_TASK_PORT;
        (kernel, dbg)
    }

    #[test]
    fn read_round_trips_mapped_bytes() {
        let (_kernel, dbg) = attach_mem(&[0xde, 0xad, 0xbe, 0xef], 0x1000);
        let mut buf = [0u8; 4];
        read_memory_at_location(&dbg, 0x1000, &mut buf).unwrap();
        assert_eq!(buf, [0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn unmapped_read_is_an_error_not_partial_success() {
        let (_kernel, dbg) = attach_mem(&[0xde, 0xad], 0x1000);
        let mut buf = [0u8; 4];
        assert!(read_memory_at_location(&dbg, 0x1000, &mut buf).is_err());
        assert!(!valid_location(&dbg, 0x2000));
        assert!(valid_location(&dbg, 0x1001));
    }

    #[test]
    fn instruction_words_are_little_endian() {
        let (kernel, dbg) = attach_mem(&0xd4200000u32.to_le_bytes(), 0x4000);
        assert_eq!(read_instruction_word(&dbg, 0x4000).unwrap(), 0xd4200000);

        write_instruction_word(&dbg, 0x4000, 0xd10043ff).unwrap();
        assert_eq!(kernel.read_bytes(0x4000, 4), 0xd10043ffu32.to_le_bytes());
    }

    #[test]
    fn swap_helpers() {
        assert_eq!(swap_u32(0x11223344), 0x44332211);
        assert_eq!(swap_u64(0x1122334455667788), 0x8877665544332211);
    }
}
