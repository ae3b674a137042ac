//! The real kernel: Mach traps and messages via `mach2`, the process-trace
//! family and signals via `libc`/`nix`. Everything unsafe lives here.

use std::ffi::CStr;
use std::io;
use std::mem;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;

use goblin::mach::header::{MH_EXECUTE, MH_MAGIC_64};
use goblin::mach::MachO;
use libc::pid_t;
use log::debug;
use mach2::exception_types::{EXCEPTION_DEFAULT, EXC_MASK_ALL, MACH_EXCEPTION_CODES};
use mach2::kern_return::kern_return_t;
use mach2::mach_port::{mach_port_allocate, mach_port_insert_right};
use mach2::message::{
    mach_msg, mach_msg_body_t, mach_msg_header_t, mach_msg_port_descriptor_t,
    MACH_MSG_TIMEOUT_NONE, MACH_MSG_TYPE_MAKE_SEND, MACH_RCV_MSG, MACH_SEND_MSG,
};
use mach2::port::{mach_port_t, MACH_PORT_NULL, MACH_PORT_RIGHT_RECEIVE};
use mach2::task::{task_resume, task_suspend, task_threads};
use mach2::thread_act::{thread_get_state, thread_info};
use mach2::traps::{mach_task_self, task_for_pid};
use mach2::vm::{mach_vm_protect, mach_vm_read_overwrite, mach_vm_region, mach_vm_write};
use mach2::vm_prot::{VM_PROT_COPY, VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
use mach2::vm_region::vm_region_basic_info_64;
use nix::sys::signal::{kill as nix_kill, Signal};
use nix::sys::wait::waitpid as nix_waitpid;
use nix::unistd::Pid;
use static_assertions::const_assert_eq;

use super::{
    Arm64DebugState, Arm64NeonState, Arm64ThreadState, KernError, KernResult, KernelInterface,
    MappedCache, MsgHeader, PortName, Reply, Request, SavedExceptionPorts, ThreadIdent,
    KERN_SUCCESS,
};

const ARM_THREAD_STATE64: i32 = 6;
const ARM_DEBUG_STATE64: i32 = 15;
const ARM_NEON_STATE64: i32 = 17;
const THREAD_STATE_NONE: i32 = 5;

const THREAD_IDENTIFIER_INFO: u32 = 4;
const PROC_PIDTHREADINFO: c_int = 5;
const MAXTHREADNAMESIZE: usize = 64;

const PT_DETACH: c_int = 11;
const PT_THUPDATE: c_int = 13;
const PT_ATTACHEXC: c_int = 14;

const VM_REGION_BASIC_INFO_64: i32 = 9;

const SHARED_CACHE_PATH: &[u8] =
    b"/System/Library/Caches/com.apple.dyld/dyld_shared_cache_arm64\0";

extern "C" {
    fn mach_port_destroy(task: mach_port_t, name: mach_port_t) -> kern_return_t;
    fn thread_set_state(
        thread: mach_port_t,
        flavor: i32,
        new_state: *const u32,
        count: u32,
    ) -> kern_return_t;
    fn mach_vm_deallocate(task: mach_port_t, address: u64, size: u64) -> kern_return_t;

    fn task_set_exception_ports(
        task: mach_port_t,
        exception_mask: u32,
        new_port: mach_port_t,
        behavior: i32,
        new_flavor: i32,
    ) -> kern_return_t;
    fn task_get_exception_ports(
        task: mach_port_t,
        exception_mask: u32,
        masks: *mut u32,
        masks_cnt: *mut u32,
        old_handlers: *mut mach_port_t,
        old_behaviors: *mut i32,
        old_flavors: *mut i32,
    ) -> kern_return_t;

    fn proc_listallpids(buffer: *mut c_void, buffersize: c_int) -> c_int;
    fn proc_name(pid: c_int, buffer: *mut c_void, buffersize: u32) -> c_int;
    fn proc_pidinfo(
        pid: c_int,
        flavor: c_int,
        arg: u64,
        buffer: *mut c_void,
        buffersize: c_int,
    ) -> c_int;
}

#[repr(C)]
struct ThreadIdentifierInfo {
    thread_id: u64,
    thread_handle: u64,
    dispatch_qaddr: u64,
}

#[repr(C)]
struct ProcThreadInfo {
    pth_user_time: u64,
    pth_system_time: u64,
    pth_cpu_usage: i32,
    pth_policy: i32,
    pth_run_state: i32,
    pth_flags: i32,
    pth_sleep_time: i32,
    pth_curpri: i32,
    pth_priority: i32,
    pth_maxpriority: i32,
    pth_name: [c_char; MAXTHREADNAMESIZE],
}

/// Wire layout of one exception-raise request. MIG packs these to four
/// bytes, so the 64-bit code words sit unaligned.
#[repr(C, packed(4))]
struct RawRequest {
    head: mach_msg_header_t,
    body: mach_msg_body_t,
    thread: mach_msg_port_descriptor_t,
    task: mach_msg_port_descriptor_t,
    ndr: [u8; 8],
    exception: i32,
    code_cnt: u32,
    code: [i64; 2],
}

#[repr(C, packed(4))]
struct RawReply {
    head: mach_msg_header_t,
    ndr: [u8; 8],
    ret_code: kern_return_t,
}

/// Receive buffer: the request plus room for the kernel-appended trailer.
#[repr(C)]
struct ReceiveBuffer {
    req: RawRequest,
    trailer: [u8; 72],
}

const_assert_eq!(mem::size_of::<RawRequest>(), 84);
const_assert_eq!(mem::size_of::<RawReply>(), 36);

fn check(kr: kern_return_t) -> KernResult<()> {
    if kr == KERN_SUCCESS {
        Ok(())
    } else {
        Err(KernError(kr))
    }
}

fn state_count<T>() -> u32 {
    (mem::size_of::<T>() / mem::size_of::<u32>()) as u32
}

fn nix_to_io(e: nix::Error) -> io::Error {
    match e.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, e.to_string()),
    }
}

/// The one true kernel.
pub struct MachKernel;

impl MachKernel {
    pub fn new() -> MachKernel {
        MachKernel
    }

    unsafe fn get_state_raw(
        &self,
        thread: PortName,
        flavor: i32,
        out: *mut u32,
        mut count: u32,
    ) -> KernResult<()> {
        check(thread_get_state(thread, flavor, out, &mut count))
    }

    unsafe fn set_state_raw(
        &self,
        thread: PortName,
        flavor: i32,
        state: *const u32,
        count: u32,
    ) -> KernResult<()> {
        check(thread_set_state(thread, flavor, state, count))
    }
}

impl Default for MachKernel {
    fn default() -> MachKernel {
        MachKernel::new()
    }
}

impl KernelInterface for MachKernel {
    fn task_for_pid(&self, pid: pid_t) -> KernResult<PortName> {
        let mut task: mach_port_t = MACH_PORT_NULL;
        unsafe {
            check(task_for_pid(mach_task_self(), pid, &mut task))?;
        }
        Ok(task)
    }

    fn task_suspend(&self, task: PortName) -> KernResult<()> {
        unsafe { check(task_suspend(task)) }
    }

    fn task_resume(&self, task: PortName) -> KernResult<()> {
        unsafe { check(task_resume(task)) }
    }

    fn task_threads(&self, task: PortName) -> KernResult<Vec<PortName>> {
        let mut ports: *mut mach_port_t = ptr::null_mut();
        let mut count: u32 = 0;

        unsafe {
            check(task_threads(task, &mut ports, &mut count))?;
            let out = std::slice::from_raw_parts(ports, count as usize).to_vec();
            // The kernel vm_allocates the port array in our space.
            let _ = mach_vm_deallocate(
                mach_task_self(),
                ports as u64,
                (count as usize * mem::size_of::<mach_port_t>()) as u64,
            );
            Ok(out)
        }
    }

    fn thread_ident(&self, pid: pid_t, thread: PortName) -> KernResult<ThreadIdent> {
        let mut info: ThreadIdentifierInfo = unsafe { mem::zeroed() };
        let mut count = state_count::<ThreadIdentifierInfo>();

        unsafe {
            check(thread_info(
                thread,
                THREAD_IDENTIFIER_INFO,
                &mut info as *mut _ as *mut i32,
                &mut count,
            ))?;
        }

        let mut name = String::new();
        let mut pinfo: ProcThreadInfo = unsafe { mem::zeroed() };
        let got = unsafe {
            proc_pidinfo(
                pid,
                PROC_PIDTHREADINFO,
                info.thread_handle,
                &mut pinfo as *mut _ as *mut c_void,
                mem::size_of::<ProcThreadInfo>() as c_int,
            )
        };
        if got > 0 {
            let cname = unsafe { CStr::from_ptr(pinfo.pth_name.as_ptr()) };
            name = cname.to_string_lossy().into_owned();
        }

        Ok(ThreadIdent {
            tid: info.thread_id,
            name,
        })
    }

    fn get_thread_state(&self, thread: PortName) -> KernResult<Arm64ThreadState> {
        let mut state = Arm64ThreadState::default();
        unsafe {
            self.get_state_raw(
                thread,
                ARM_THREAD_STATE64,
                &mut state as *mut _ as *mut u32,
                state_count::<Arm64ThreadState>(),
            )?;
        }
        Ok(state)
    }

    fn set_thread_state(&self, thread: PortName, state: &Arm64ThreadState) -> KernResult<()> {
        unsafe {
            self.set_state_raw(
                thread,
                ARM_THREAD_STATE64,
                state as *const _ as *const u32,
                state_count::<Arm64ThreadState>(),
            )
        }
    }

    fn get_debug_state(&self, thread: PortName) -> KernResult<Arm64DebugState> {
        let mut state = Arm64DebugState::default();
        unsafe {
            self.get_state_raw(
                thread,
                ARM_DEBUG_STATE64,
                &mut state as *mut _ as *mut u32,
                state_count::<Arm64DebugState>(),
            )?;
        }
        Ok(state)
    }

    fn set_debug_state(&self, thread: PortName, state: &Arm64DebugState) -> KernResult<()> {
        unsafe {
            self.set_state_raw(
                thread,
                ARM_DEBUG_STATE64,
                state as *const _ as *const u32,
                state_count::<Arm64DebugState>(),
            )
        }
    }

    fn get_neon_state(&self, thread: PortName) -> KernResult<Arm64NeonState> {
        let mut state = Arm64NeonState::default();
        unsafe {
            self.get_state_raw(
                thread,
                ARM_NEON_STATE64,
                &mut state as *mut _ as *mut u32,
                state_count::<Arm64NeonState>(),
            )?;
        }
        Ok(state)
    }

    fn set_neon_state(&self, thread: PortName, state: &Arm64NeonState) -> KernResult<()> {
        unsafe {
            self.set_state_raw(
                thread,
                ARM_NEON_STATE64,
                state as *const _ as *const u32,
                state_count::<Arm64NeonState>(),
            )
        }
    }

    fn vm_read(&self, task: PortName, addr: u64, buf: &mut [u8]) -> KernResult<()> {
        let mut outsize: u64 = 0;
        unsafe {
            check(mach_vm_read_overwrite(
                task,
                addr,
                buf.len() as u64,
                buf.as_mut_ptr() as usize as _,
                &mut outsize,
            ))?;
        }
        if outsize as usize == buf.len() {
            Ok(())
        } else {
            Err(KernError(super::KERN_INVALID_ADDRESS))
        }
    }

    fn vm_write(&self, task: PortName, addr: u64, data: &[u8]) -> KernResult<()> {
        let len = data.len() as u64;
        unsafe {
            // Text pages aren't writable; take a COW copy for the patch and
            // hand the page back as read/execute.
            check(mach_vm_protect(
                task,
                addr,
                len,
                0,
                VM_PROT_READ | VM_PROT_WRITE | VM_PROT_COPY,
            ))?;
            let result = check(mach_vm_write(
                task,
                addr,
                data.as_ptr() as usize as _,
                data.len() as u32,
            ));
            let _ = mach_vm_protect(task, addr, len, 0, VM_PROT_READ | VM_PROT_EXECUTE);
            result
        }
    }

    fn vm_valid(&self, task: PortName, addr: u64) -> bool {
        let mut byte = [0u8; 1];
        self.vm_read(task, addr, &mut byte).is_ok()
    }

    fn save_exception_ports(&self, task: PortName) -> KernResult<SavedExceptionPorts> {
        let mut saved = SavedExceptionPorts::default();
        let mut count: u32 = saved.masks.len() as u32;

        unsafe {
            check(task_get_exception_ports(
                task,
                EXC_MASK_ALL as u32,
                saved.masks.as_mut_ptr(),
                &mut count,
                saved.ports.as_mut_ptr(),
                saved.behaviors.as_mut_ptr(),
                saved.flavors.as_mut_ptr(),
            ))?;
        }

        saved.count = count;
        Ok(saved)
    }

    fn install_exception_port(&self, task: PortName) -> KernResult<PortName> {
        let mut port: mach_port_t = MACH_PORT_NULL;

        unsafe {
            check(mach_port_allocate(
                mach_task_self(),
                MACH_PORT_RIGHT_RECEIVE,
                &mut port,
            ))?;
            check(mach_port_insert_right(
                mach_task_self(),
                port,
                port,
                MACH_MSG_TYPE_MAKE_SEND,
            ))?;
            check(task_set_exception_ports(
                task,
                EXC_MASK_ALL as u32,
                port,
                (EXCEPTION_DEFAULT as u32 | MACH_EXCEPTION_CODES as u32) as i32,
                THREAD_STATE_NONE,
            ))?;
        }

        Ok(port)
    }

    fn restore_exception_ports(
        &self,
        task: PortName,
        saved: &SavedExceptionPorts,
    ) -> KernResult<()> {
        for i in 0..saved.count as usize {
            unsafe {
                check(task_set_exception_ports(
                    task,
                    saved.masks[i],
                    saved.ports[i],
                    saved.behaviors[i],
                    saved.flavors[i],
                ))?;
            }
        }
        Ok(())
    }

    fn port_deallocate(&self, port: PortName) -> KernResult<()> {
        unsafe { check(mach_port_destroy(mach_task_self(), port)) }
    }

    fn recv_exception(&self, port: PortName) -> KernResult<Request> {
        let mut buf: ReceiveBuffer = unsafe { mem::zeroed() };

        unsafe {
            check(mach_msg(
                &mut buf as *mut ReceiveBuffer as *mut mach_msg_header_t,
                MACH_RCV_MSG,
                0,
                mem::size_of::<ReceiveBuffer>() as u32,
                port,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            ))?;
        }

        // Copy out of the packed layout before touching anything.
        let head = buf.req.head;
        let thread = buf.req.thread;
        let task = buf.req.task;
        let ndr = buf.req.ndr;
        let exception = buf.req.exception;
        let code = buf.req.code;

        Ok(Request {
            head: MsgHeader {
                msgh_bits: head.msgh_bits,
                msgh_size: head.msgh_size,
                msgh_remote_port: head.msgh_remote_port,
                msgh_local_port: head.msgh_local_port,
                msgh_reserved: head.msgh_voucher_port,
                msgh_id: head.msgh_id,
            },
            ndr,
            task: task.name,
            thread: thread.name,
            exception,
            code,
        })
    }

    fn send_reply(&self, reply: &Reply) -> KernResult<()> {
        let mut raw = RawReply {
            head: mach_msg_header_t {
                msgh_bits: reply.head.msgh_bits,
                msgh_size: mem::size_of::<RawReply>() as u32,
                msgh_remote_port: reply.head.msgh_remote_port,
                msgh_local_port: reply.head.msgh_local_port,
                msgh_voucher_port: reply.head.msgh_reserved,
                msgh_id: reply.head.msgh_id,
            },
            ndr: reply.ndr,
            ret_code: reply.ret_code,
        };

        unsafe {
            check(mach_msg(
                &mut raw as *mut RawReply as *mut mach_msg_header_t,
                MACH_SEND_MSG,
                mem::size_of::<RawReply>() as u32,
                0,
                MACH_PORT_NULL,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            ))
        }
    }

    fn ptrace_attachexc(&self, pid: pid_t) -> io::Result<()> {
        let ret = unsafe { libc::ptrace(PT_ATTACHEXC, pid, ptr::null_mut(), 0) };
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn ptrace_detach(&self, pid: pid_t) -> io::Result<()> {
        let ret = unsafe { libc::ptrace(PT_DETACH, pid, ptr::null_mut(), 0) };
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn ptrace_thupdate(&self, pid: pid_t, thread: PortName, sig: i32) -> io::Result<()> {
        let ret = unsafe { libc::ptrace(PT_THUPDATE, pid, thread as usize as *mut c_char, sig) };
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn kill(&self, pid: pid_t, sig: i32) -> io::Result<()> {
        let signal = Signal::from_c_int(sig)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        nix_kill(Pid::from_raw(pid), signal).map_err(nix_to_io)
    }

    fn waitpid(&self, pid: pid_t) -> io::Result<i32> {
        nix_waitpid(Pid::from_raw(pid), None)
            .map(|_| 0)
            .map_err(nix_to_io)
    }

    fn pid_for_name(&self, name: &str) -> Option<pid_t> {
        const MAX_PIDS: usize = 4096;
        let mut pids = vec![0 as pid_t; MAX_PIDS];

        let bytes = unsafe {
            proc_listallpids(
                pids.as_mut_ptr() as *mut c_void,
                (MAX_PIDS * mem::size_of::<pid_t>()) as c_int,
            )
        };
        if bytes <= 0 {
            return None;
        }

        // proc_listallpids reports bytes written, not a pid count.
        let count = bytes as usize / mem::size_of::<pid_t>();

        for &pid in pids.iter().take(count) {
            if pid <= 0 {
                continue;
            }
            if let Some(pname) = self.name_for_pid(pid) {
                if pname == name {
                    return Some(pid);
                }
            }
        }
        None
    }

    fn name_for_pid(&self, pid: pid_t) -> Option<String> {
        let mut buf = [0u8; 256];
        let len = unsafe { proc_name(pid, buf.as_mut_ptr() as *mut c_void, buf.len() as u32) };
        if len <= 0 {
            return None;
        }
        String::from_utf8(buf[..len as usize].to_vec()).ok()
    }

    fn find_slide(&self, task: PortName) -> Option<u64> {
        // Walk the address space until a Mach-O executable header shows up;
        // the slide is its load address minus the linked __TEXT vmaddr.
        let mut addr: u64 = 0;

        for _ in 0..256 {
            let mut size: u64 = 0;
            let mut info: vm_region_basic_info_64 = unsafe { mem::zeroed() };
            let mut info_count = state_count::<vm_region_basic_info_64>();
            let mut object_name: mach_port_t = MACH_PORT_NULL;

            let kr = unsafe {
                mach_vm_region(
                    task,
                    &mut addr,
                    &mut size,
                    VM_REGION_BASIC_INFO_64,
                    &mut info as *mut _ as *mut i32,
                    &mut info_count,
                    &mut object_name,
                )
            };
            if kr != KERN_SUCCESS {
                return None;
            }

            if info.protection & VM_PROT_READ != 0 {
                let mut magic = [0u8; 4];
                if self.vm_read(task, addr, &mut magic).is_ok()
                    && u32::from_le_bytes(magic) == MH_MAGIC_64
                {
                    if let Some(vmaddr) = self.text_vmaddr(task, addr) {
                        return Some(addr.wrapping_sub(vmaddr));
                    }
                }
            }

            addr = addr.wrapping_add(size);
        }

        None
    }

    fn map_shared_cache(&self) -> io::Result<MappedCache> {
        unsafe {
            let fd = libc::open(SHARED_CACHE_PATH.as_ptr() as *const c_char, libc::O_RDONLY);
            if fd == -1 {
                return Err(io::Error::last_os_error());
            }

            let mut st: libc::stat = mem::zeroed();
            if libc::fstat(fd, &mut st) == -1 {
                let e = io::Error::last_os_error();
                libc::close(fd);
                return Err(e);
            }

            let len = st.st_size as usize;
            let base = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd,
                0,
            );
            libc::close(fd);

            if base == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            debug!("shared cache mapped at {:p} ({} bytes)", base, len);
            Ok(MappedCache {
                base: base as usize,
                len,
            })
        }
    }
}

impl MachKernel {
    /// Read enough of the image at `addr` to parse its load commands and
    /// pull out the linked __TEXT base. Executables that won't parse fall
    /// back to the default arm64 load address.
    fn text_vmaddr(&self, task: PortName, addr: u64) -> Option<u64> {
        const DEFAULT_BASE: u64 = 0x1_0000_0000;

        let mut header = [0u8; 32];
        self.vm_read(task, addr, &mut header).ok()?;

        let filetype = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        if filetype != MH_EXECUTE {
            return None;
        }

        let sizeofcmds =
            u32::from_le_bytes([header[20], header[21], header[22], header[23]]) as usize;
        let total = 32 + sizeofcmds;
        let mut image = vec![0u8; total];
        if self.vm_read(task, addr, &mut image).is_err() {
            return Some(DEFAULT_BASE);
        }

        match MachO::parse(&image, 0) {
            Ok(macho) => {
                for seg in macho.segments.iter() {
                    if let Ok(name) = seg.name() {
                        if name == "__TEXT" {
                            return Some(seg.vmaddr);
                        }
                    }
                }
                Some(DEFAULT_BASE)
            }
            Err(_) => Some(DEFAULT_BASE),
        }
    }
}
