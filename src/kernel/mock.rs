//! A scripted inferior standing in for the kernel in tests. Memory is a
//! sparse byte map, threads carry real state banks, and every side-effecting
//! call is recorded so tests can assert on ordering.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

use libc::pid_t;

use super::{
    Arm64DebugState, Arm64NeonState, Arm64ThreadState, KernError, KernResult, KernelInterface,
    MappedCache, MsgHeader, PortName, Reply, Request, SavedExceptionPorts, ThreadIdent,
    KERN_FAILURE, KERN_INVALID_ADDRESS, MACH_RCV_PORT_DIED,
};

pub(crate) const MOCK_TASK_PORT: PortName = 0x2a03;
pub(crate) const MOCK_EXC_PORT: PortName = 0xe07;

pub(crate) struct MockThread {
    pub port: PortName,
    pub ident: ThreadIdent,
    pub thread_state: Arm64ThreadState,
    pub debug_state: Arm64DebugState,
    pub neon_state: Arm64NeonState,
}

impl MockThread {
    pub fn new(port: PortName, tid: u64, name: &str) -> MockThread {
        MockThread {
            port,
            ident: ThreadIdent {
                tid,
                name: name.to_string(),
            },
            thread_state: Default::default(),
            debug_state: Default::default(),
            neon_state: Default::default(),
        }
    }
}

pub(crate) struct MockKernel {
    pub mem: Mutex<HashMap<u64, u8>>,
    pub threads: Mutex<Vec<MockThread>>,
    pub procs: Mutex<HashMap<String, pid_t>>,
    pub slide: Mutex<Option<u64>>,
    /// suspend minus resume balance for the task.
    pub suspends: AtomicI32,
    pub calls: Mutex<Vec<String>>,
    pub replies: Mutex<Vec<Reply>>,
    pub allow_task_for_pid: AtomicBool,
    pub shared_cache_ok: AtomicBool,
    /// Remaining PT_DETACH attempts that will fail with EBUSY.
    pub detach_failures: AtomicI32,
    exc_tx: Mutex<Option<Sender<Request>>>,
    exc_rx: Mutex<Receiver<Request>>,
}

impl MockKernel {
    pub fn new() -> MockKernel {
        let (tx, rx) = channel();
        MockKernel {
            mem: Mutex::new(HashMap::new()),
            threads: Mutex::new(Vec::new()),
            procs: Mutex::new(HashMap::new()),
            slide: Mutex::new(Some(0x10000)),
            suspends: AtomicI32::new(0),
            calls: Mutex::new(Vec::new()),
            replies: Mutex::new(Vec::new()),
            allow_task_for_pid: AtomicBool::new(true),
            shared_cache_ok: AtomicBool::new(false),
            detach_failures: AtomicI32::new(0),
            exc_tx: Mutex::new(Some(tx)),
            exc_rx: Mutex::new(rx),
        }
    }

    pub fn map_bytes(&self, addr: u64, bytes: &[u8]) {
        let mut mem = self.mem.lock().unwrap();
        for (i, b) in bytes.iter().enumerate() {
            mem.insert(addr + i as u64, *b);
        }
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        let mem = self.mem.lock().unwrap();
        (0..len)
            .map(|i| *mem.get(&(addr + i as u64)).expect("unmapped byte"))
            .collect()
    }

    pub fn add_thread(&self, port: PortName, tid: u64, name: &str) {
        self.threads.lock().unwrap().push(MockThread::new(port, tid, name));
    }

    pub fn remove_thread(&self, port: PortName) {
        self.threads.lock().unwrap().retain(|t| t.port != port);
    }

    pub fn set_pc(&self, port: PortName, pc: u64) {
        let mut threads = self.threads.lock().unwrap();
        let t = threads.iter_mut().find(|t| t.port == port).unwrap();
        t.thread_state.pc = pc;
    }

    pub fn debug_state_of(&self, port: PortName) -> Arm64DebugState {
        let threads = self.threads.lock().unwrap();
        threads.iter().find(|t| t.port == port).unwrap().debug_state
    }

    pub fn inject_exception(&self, req: Request) {
        let tx = self.exc_tx.lock().unwrap();
        if let Some(tx) = tx.as_ref() {
            tx.send(req).unwrap();
        }
    }

    pub fn recorded_calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn with_thread<R>(
        &self,
        port: PortName,
        f: impl FnOnce(&mut MockThread) -> R,
    ) -> KernResult<R> {
        let mut threads = self.threads.lock().unwrap();
        match threads.iter_mut().find(|t| t.port == port) {
            Some(t) => Ok(f(t)),
            None => Err(KernError(KERN_FAILURE)),
        }
    }
}

/// Builds a well-formed exception request the way the kernel would.
pub(crate) fn exc_request(thread: PortName, exception: i32, code: i64, subcode: i64) -> Request {
    Request {
        head: MsgHeader {
            msgh_bits: 0x1513,
            msgh_size: 84,
            msgh_remote_port: 0x913,
            msgh_local_port: MOCK_EXC_PORT,
            msgh_reserved: 7,
            msgh_id: 2405,
        },
        ndr: [0; 8],
        task: MOCK_TASK_PORT,
        thread,
        exception,
        code: [code, subcode],
    }
}

impl KernelInterface for MockKernel {
    fn task_for_pid(&self, pid: pid_t) -> KernResult<PortName> {
        if self.allow_task_for_pid.load(Ordering::SeqCst) {
            self.record(format!("task_for_pid {}", pid));
            Ok(MOCK_TASK_PORT)
        } else {
            Err(KernError(KERN_FAILURE))
        }
    }

    fn task_suspend(&self, _task: PortName) -> KernResult<()> {
        self.suspends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn task_resume(&self, _task: PortName) -> KernResult<()> {
        self.suspends.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn task_threads(&self, _task: PortName) -> KernResult<Vec<PortName>> {
        Ok(self.threads.lock().unwrap().iter().map(|t| t.port).collect())
    }

    fn thread_ident(&self, _pid: pid_t, thread: PortName) -> KernResult<ThreadIdent> {
        self.with_thread(thread, |t| t.ident.clone())
    }

    fn get_thread_state(&self, thread: PortName) -> KernResult<Arm64ThreadState> {
        self.with_thread(thread, |t| t.thread_state)
    }

    fn set_thread_state(&self, thread: PortName, state: &Arm64ThreadState) -> KernResult<()> {
        self.with_thread(thread, |t| t.thread_state = *state)
    }

    fn get_debug_state(&self, thread: PortName) -> KernResult<Arm64DebugState> {
        self.with_thread(thread, |t| t.debug_state)
    }

    fn set_debug_state(&self, thread: PortName, state: &Arm64DebugState) -> KernResult<()> {
        self.with_thread(thread, |t| t.debug_state = *state)
    }

    fn get_neon_state(&self, thread: PortName) -> KernResult<Arm64NeonState> {
        self.with_thread(thread, |t| t.neon_state)
    }

    fn set_neon_state(&self, thread: PortName, state: &Arm64NeonState) -> KernResult<()> {
        self.with_thread(thread, |t| t.neon_state = *state)
    }

    fn vm_read(&self, _task: PortName, addr: u64, buf: &mut [u8]) -> KernResult<()> {
        let mem = self.mem.lock().unwrap();
        for (i, slot) in buf.iter_mut().enumerate() {
            match mem.get(&(addr + i as u64)) {
                Some(b) => *slot = *b,
                None => return Err(KernError(KERN_INVALID_ADDRESS)),
            }
        }
        Ok(())
    }

    fn vm_write(&self, _task: PortName, addr: u64, data: &[u8]) -> KernResult<()> {
        let mut mem = self.mem.lock().unwrap();
        for i in 0..data.len() {
            if !mem.contains_key(&(addr + i as u64)) {
                return Err(KernError(KERN_INVALID_ADDRESS));
            }
        }
        for (i, b) in data.iter().enumerate() {
            mem.insert(addr + i as u64, *b);
        }
        Ok(())
    }

    fn vm_valid(&self, _task: PortName, addr: u64) -> bool {
        self.mem.lock().unwrap().contains_key(&addr)
    }

    fn save_exception_ports(&self, _task: PortName) -> KernResult<SavedExceptionPorts> {
        let mut saved = SavedExceptionPorts::default();
        saved.count = 1;
        saved.masks[0] = 0x3fe;
        saved.ports[0] = 0x101;
        Ok(saved)
    }

    fn install_exception_port(&self, _task: PortName) -> KernResult<PortName> {
        self.record("install_exception_port".to_string());
        Ok(MOCK_EXC_PORT)
    }

    fn restore_exception_ports(
        &self,
        _task: PortName,
        saved: &SavedExceptionPorts,
    ) -> KernResult<()> {
        self.record(format!("restore_exception_ports count={}", saved.count));
        Ok(())
    }

    fn port_deallocate(&self, port: PortName) -> KernResult<()> {
        self.record(format!("port_deallocate {:#x}", port));
        if port == MOCK_EXC_PORT {
            // Killing the sender wakes the blocked receive with a dead port.
            self.exc_tx.lock().unwrap().take();
        }
        Ok(())
    }

    fn recv_exception(&self, _port: PortName) -> KernResult<Request> {
        let rx = self.exc_rx.lock().unwrap();
        rx.recv().map_err(|_| KernError(MACH_RCV_PORT_DIED))
    }

    fn send_reply(&self, reply: &Reply) -> KernResult<()> {
        self.replies.lock().unwrap().push(*reply);
        Ok(())
    }

    fn ptrace_attachexc(&self, pid: pid_t) -> io::Result<()> {
        self.record(format!("ptrace_attachexc {}", pid));
        Ok(())
    }

    fn ptrace_detach(&self, pid: pid_t) -> io::Result<()> {
        if self.detach_failures.fetch_sub(1, Ordering::SeqCst) > 0 {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        self.record(format!("ptrace_detach {}", pid));
        Ok(())
    }

    fn ptrace_thupdate(&self, pid: pid_t, thread: PortName, sig: i32) -> io::Result<()> {
        self.record(format!("ptrace_thupdate {} {:#x} {}", pid, thread, sig));
        Ok(())
    }

    fn kill(&self, pid: pid_t, sig: i32) -> io::Result<()> {
        self.record(format!("kill {} {}", pid, sig));
        Ok(())
    }

    fn waitpid(&self, pid: pid_t) -> io::Result<i32> {
        self.record(format!("waitpid {}", pid));
        Ok(0)
    }

    fn pid_for_name(&self, name: &str) -> Option<pid_t> {
        self.procs.lock().unwrap().get(name).copied()
    }

    fn name_for_pid(&self, pid: pid_t) -> Option<String> {
        let procs = self.procs.lock().unwrap();
        procs
            .iter()
            .find(|(_, p)| **p == pid)
            .map(|(name, _)| name.clone())
    }

    fn find_slide(&self, _task: PortName) -> Option<u64> {
        *self.slide.lock().unwrap()
    }

    fn map_shared_cache(&self) -> io::Result<MappedCache> {
        if self.shared_cache_ok.load(Ordering::SeqCst) {
            Ok(MappedCache {
                base: 0x7000_0000,
                len: 0x4000,
            })
        } else {
            Err(io::Error::from_raw_os_error(libc::ENOENT))
        }
    }
}
