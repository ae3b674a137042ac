//! The boundary between the debugger core and the host kernel.
//!
//! Everything the core needs from the kernel goes through the
//! [`KernelInterface`] trait: task and thread control, the three per-thread
//! state banks, virtual memory access, exception-port plumbing, and the
//! process-trace family. `kernel/mach.rs` implements it against the real
//! Mach/BSD primitives; tests drive the core with a mock inferior.

use std::fmt;
use std::io;

use libc::pid_t;
use static_assertions::const_assert_eq;

#[cfg(target_os = "macos")]
pub mod mach;

#[cfg(test)]
pub(crate) mod mock;

/// A task or thread port name. Plain integer; the kernel owns the meaning.
pub type PortName = u32;

pub type KernReturn = i32;

pub const PORT_NULL: PortName = 0;
pub const KERN_SUCCESS: KernReturn = 0;
pub const KERN_INVALID_ADDRESS: KernReturn = 1;
pub const KERN_PROTECTION_FAILURE: KernReturn = 2;
pub const KERN_INVALID_ARGUMENT: KernReturn = 4;
pub const KERN_FAILURE: KernReturn = 5;
pub const MACH_RCV_PORT_DIED: KernReturn = 0x1000_4002;

/// Exception kinds delivered in a request's `exception` field.
pub const EXC_BAD_ACCESS: i32 = 1;
pub const EXC_BAD_INSTRUCTION: i32 = 2;
pub const EXC_ARITHMETIC: i32 = 3;
pub const EXC_EMULATION: i32 = 4;
pub const EXC_SOFTWARE: i32 = 5;
pub const EXC_BREAKPOINT: i32 = 6;
pub const EXC_SYSCALL: i32 = 7;
pub const EXC_MACH_SYSCALL: i32 = 8;
pub const EXC_RPC_ALERT: i32 = 9;
pub const EXC_CRASH: i32 = 10;
pub const EXC_RESOURCE: i32 = 11;
pub const EXC_GUARD: i32 = 12;
pub const EXC_CORPSE_NOTIFY: i32 = 13;

/// Primary code of an `EXC_SOFTWARE` exception carrying a Unix signal.
pub const EXC_SOFT_SIGNAL: i64 = 0x10003;
/// Primary code of an `EXC_BREAKPOINT` exception on this architecture.
pub const EXC_ARM_BREAKPOINT: i64 = 1;
/// Primary code of a hardware watchpoint data abort.
pub const EXC_ARM_DA_DEBUG: i64 = 0x102;

/// Low five bits of `msgh_bits` describe the remote-port disposition; a reply
/// mirrors them back.
pub const MACH_MSGH_BITS_REMOTE_MASK: u32 = 0x0000_001f;

pub fn exc_str(exception: i32) -> &'static str {
    match exception {
        EXC_BAD_ACCESS => "EXC_BAD_ACCESS",
        EXC_BAD_INSTRUCTION => "EXC_BAD_INSTRUCTION",
        EXC_ARITHMETIC => "EXC_ARITHMETIC",
        EXC_EMULATION => "EXC_EMULATION",
        EXC_SOFTWARE => "EXC_SOFTWARE",
        EXC_BREAKPOINT => "EXC_BREAKPOINT",
        EXC_SYSCALL => "EXC_SYSCALL",
        EXC_MACH_SYSCALL => "EXC_MACH_SYSCALL",
        EXC_RPC_ALERT => "EXC_RPC_ALERT",
        EXC_CRASH => "EXC_CRASH",
        EXC_RESOURCE => "EXC_RESOURCE",
        EXC_GUARD => "EXC_GUARD",
        EXC_CORPSE_NOTIFY => "EXC_CORPSE_NOTIFY",
        _ => "<Unknown Exception>",
    }
}

/// A failed kernel call, carrying the raw return code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KernError(pub KernReturn);

impl std::error::Error for KernError {}

impl fmt::Display for KernError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            KERN_INVALID_ADDRESS => write!(f, "(os/kern) invalid address"),
            KERN_PROTECTION_FAILURE => write!(f, "(os/kern) protection failure"),
            KERN_INVALID_ARGUMENT => write!(f, "(os/kern) invalid argument"),
            KERN_FAILURE => write!(f, "(os/kern) failure"),
            MACH_RCV_PORT_DIED => write!(f, "(ipc/rcv) port died"),
            code => write!(f, "kernel return code {:#x}", code),
        }
    }
}

pub type KernResult<T> = std::result::Result<T, KernError>;

/// General-purpose register bank, mirroring the kernel's 64-bit thread state
/// layout: 29 indexed GPRs, then fp, lr, sp, pc, and the status register.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct Arm64ThreadState {
    pub x: [u64; 29],
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    pub pc: u64,
    pub cpsr: u32,
    pub flags: u32,
}

impl Default for Arm64ThreadState {
    fn default() -> Arm64ThreadState {
        Arm64ThreadState {
            x: [0; 29],
            fp: 0,
            lr: 0,
            sp: 0,
            pc: 0,
            cpsr: 0,
            flags: 0,
        }
    }
}

/// Debug register bank: breakpoint and watchpoint value/control register
/// arrays plus the single-step control word.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct Arm64DebugState {
    pub bvr: [u64; 16],
    pub bcr: [u64; 16],
    pub wvr: [u64; 16],
    pub wcr: [u64; 16],
    pub mdscr_el1: u64,
}

impl Default for Arm64DebugState {
    fn default() -> Arm64DebugState {
        Arm64DebugState {
            bvr: [0; 16],
            bcr: [0; 16],
            wvr: [0; 16],
            wcr: [0; 16],
            mdscr_el1: 0,
        }
    }
}

/// Vector/floating-point bank: 32 128-bit registers and the two status words.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Arm64NeonState {
    pub q: [u128; 32],
    pub fpsr: u32,
    pub fpcr: u32,
}

impl Default for Arm64NeonState {
    fn default() -> Arm64NeonState {
        Arm64NeonState {
            q: [0; 32],
            fpsr: 0,
            fpcr: 0,
        }
    }
}

const_assert_eq!(std::mem::size_of::<Arm64ThreadState>(), 272);
const_assert_eq!(std::mem::size_of::<Arm64DebugState>(), 520);
const_assert_eq!(std::mem::size_of::<Arm64NeonState>(), 528);

/// Header of an exception message, in the shape the reply must mirror.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MsgHeader {
    pub msgh_bits: u32,
    pub msgh_size: u32,
    pub msgh_remote_port: PortName,
    pub msgh_local_port: PortName,
    pub msgh_reserved: u32,
    pub msgh_id: i32,
}

/// One kernel-delivered exception message, decoded from the wire format.
#[derive(Copy, Clone, Debug)]
pub struct Request {
    pub head: MsgHeader,
    /// Data-representation record, echoed verbatim into the reply.
    pub ndr: [u8; 8],
    pub task: PortName,
    pub thread: PortName,
    pub exception: i32,
    /// Primary code and subcode.
    pub code: [i64; 2],
}

/// The reply the dispatcher must emit for every consumed request. A missing
/// reply blocks the inferior.
#[derive(Copy, Clone, Debug)]
pub struct Reply {
    pub head: MsgHeader,
    pub ndr: [u8; 8],
    pub ret_code: KernReturn,
}

/// Exception-port descriptors saved at attach time and restored on detach.
#[derive(Copy, Clone, Debug, Default)]
pub struct SavedExceptionPorts {
    pub count: u32,
    pub masks: [u32; 32],
    pub ports: [PortName; 32],
    pub behaviors: [i32; 32],
    pub flavors: [i32; 32],
}

/// Kernel identity of a thread: its stable tid and (possibly empty) name.
#[derive(Clone, Debug, Default)]
pub struct ThreadIdent {
    pub tid: u64,
    pub name: String,
}

/// A read-only mapping of the shared library cache.
#[derive(Copy, Clone, Debug)]
pub struct MappedCache {
    pub base: usize,
    pub len: usize,
}

/// Everything the core asks of the kernel. One implementation speaks real
/// Mach; the test double replays a scripted inferior.
pub trait KernelInterface: Send + Sync {
    fn task_for_pid(&self, pid: pid_t) -> KernResult<PortName>;
    fn task_suspend(&self, task: PortName) -> KernResult<()>;
    fn task_resume(&self, task: PortName) -> KernResult<()>;
    fn task_threads(&self, task: PortName) -> KernResult<Vec<PortName>>;
    fn thread_ident(&self, pid: pid_t, thread: PortName) -> KernResult<ThreadIdent>;

    fn get_thread_state(&self, thread: PortName) -> KernResult<Arm64ThreadState>;
    fn set_thread_state(&self, thread: PortName, state: &Arm64ThreadState) -> KernResult<()>;
    fn get_debug_state(&self, thread: PortName) -> KernResult<Arm64DebugState>;
    fn set_debug_state(&self, thread: PortName, state: &Arm64DebugState) -> KernResult<()>;
    fn get_neon_state(&self, thread: PortName) -> KernResult<Arm64NeonState>;
    fn set_neon_state(&self, thread: PortName, state: &Arm64NeonState) -> KernResult<()>;

    fn vm_read(&self, task: PortName, addr: u64, buf: &mut [u8]) -> KernResult<()>;
    fn vm_write(&self, task: PortName, addr: u64, data: &[u8]) -> KernResult<()>;
    fn vm_valid(&self, task: PortName, addr: u64) -> bool;

    fn save_exception_ports(&self, task: PortName) -> KernResult<SavedExceptionPorts>;
    fn install_exception_port(&self, task: PortName) -> KernResult<PortName>;
    fn restore_exception_ports(&self, task: PortName, saved: &SavedExceptionPorts)
        -> KernResult<()>;
    fn port_deallocate(&self, port: PortName) -> KernResult<()>;

    /// Blocks in the kernel receive until a message arrives or the port dies.
    fn recv_exception(&self, port: PortName) -> KernResult<Request>;
    fn send_reply(&self, reply: &Reply) -> KernResult<()>;

    fn ptrace_attachexc(&self, pid: pid_t) -> io::Result<()>;
    fn ptrace_detach(&self, pid: pid_t) -> io::Result<()>;
    fn ptrace_thupdate(&self, pid: pid_t, thread: PortName, sig: i32) -> io::Result<()>;

    fn kill(&self, pid: pid_t, sig: i32) -> io::Result<()>;
    fn waitpid(&self, pid: pid_t) -> io::Result<i32>;

    fn pid_for_name(&self, name: &str) -> Option<pid_t>;
    fn name_for_pid(&self, pid: pid_t) -> Option<String>;

    /// Best-effort ASLR slide discovery for the main executable.
    fn find_slide(&self, task: PortName) -> Option<u64>;

    /// Best-effort read-only mapping of the shared cache.
    fn map_shared_cache(&self) -> io::Result<MappedCache>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exc_str_names() {
        assert_eq!(exc_str(EXC_BREAKPOINT), "EXC_BREAKPOINT");
        assert_eq!(exc_str(EXC_SOFTWARE), "EXC_SOFTWARE");
        assert_eq!(exc_str(999), "<Unknown Exception>");
    }

    #[test]
    fn kern_error_display() {
        assert_eq!(
            KernError(KERN_PROTECTION_FAILURE).to_string(),
            "(os/kern) protection failure"
        );
        assert_eq!(KernError(0x42).to_string(), "kernel return code 0x42");
    }
}
