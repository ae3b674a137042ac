//! The aggregate record for one process attachment: identity, registries,
//! tracing flags, and the exception backlog. Owned by the REPL/dispatcher
//! thread and threaded explicitly through operations; the listener thread
//! shares only the exception FIFO.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use libc::pid_t;
use log::debug;

use crate::breakpoint::Breakpoint;
use crate::collaborators::Collaborators;
use crate::containers::{List, Stack};
use crate::kernel::{
    KernResult, KernelInterface, MappedCache, PortName, SavedExceptionPorts, PORT_NULL,
};
use crate::servers::ExcQueue;
use crate::sigsupport::{self, SigSettings};
use crate::thread::MachThread;
use crate::watchpoint::Watchpoint;

pub struct Debuggee {
    pub kernel: Arc<dyn KernelInterface>,
    pub collab: Collaborators,

    /// −1 when detached.
    pub pid: pid_t,
    pub task: PortName,
    pub aslr_slide: u64,
    pub debuggee_name: String,

    /// Registries. Lock order when more than one is needed: threads, then
    /// breakpoints, then watchpoints; prefer collecting under one lock and
    /// acting after release.
    pub breakpoints: Mutex<List<Breakpoint>>,
    pub watchpoints: Mutex<List<Watchpoint>>,
    pub threads: Mutex<List<MachThread>>,

    pub exc_requests: Arc<ExcQueue>,
    pub saved_exception_ports: Mutex<Stack<SavedExceptionPorts>>,
    pub exception_port: PortName,

    pub tracing_disabled: bool,
    pub currently_tracing: bool,
    pub nosigs: bool,

    pub thread_count: u32,
    pub shared_cache: Option<MappedCache>,
    pub sigpolicies: Mutex<Vec<SigSettings>>,

    num_breakpoints: AtomicU32,
    num_watchpoints: AtomicU32,
    next_bp_id: AtomicU32,
    next_wp_id: AtomicU32,
    next_thread_id: AtomicU32,
    focused_port: AtomicU32,
    suspend_count: AtomicI32,
    eval_counter: AtomicU32,

    pub(crate) listener: Option<JoinHandle<()>>,
}

impl Debuggee {
    pub fn new(kernel: Arc<dyn KernelInterface>, collab: Collaborators) -> Debuggee {
        let tracing_disabled = !collab.trace.supported();

        Debuggee {
            kernel,
            collab,
            pid: -1,
            task: PORT_NULL,
            aslr_slide: 0,
            debuggee_name: String::new(),
            breakpoints: Mutex::new(List::new()),
            watchpoints: Mutex::new(List::new()),
            threads: Mutex::new(List::new()),
            exc_requests: Arc::new(ExcQueue::new()),
            saved_exception_ports: Mutex::new(Stack::new()),
            exception_port: PORT_NULL,
            tracing_disabled,
            currently_tracing: false,
            nosigs: false,
            thread_count: 0,
            shared_cache: None,
            sigpolicies: Mutex::new(sigsupport::default_policies()),
            num_breakpoints: AtomicU32::new(0),
            num_watchpoints: AtomicU32::new(0),
            next_bp_id: AtomicU32::new(1),
            next_wp_id: AtomicU32::new(1),
            next_thread_id: AtomicU32::new(1),
            focused_port: AtomicU32::new(PORT_NULL),
            suspend_count: AtomicI32::new(0),
            eval_counter: AtomicU32::new(0),
            listener: None,
        }
    }

    pub fn attached(&self) -> bool {
        self.pid != -1
    }

    pub fn suspended(&self) -> bool {
        self.suspend_count.load(Ordering::SeqCst) > 0
    }

    pub fn suspend(&self) -> KernResult<()> {
        self.kernel.task_suspend(self.task)?;
        self.suspend_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn resume(&self) -> KernResult<()> {
        if self.suspend_count.load(Ordering::SeqCst) > 0 {
            self.kernel.task_resume(self.task)?;
            self.suspend_count.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    pub(crate) fn reset_suspend_count(&self) {
        self.suspend_count.store(0, Ordering::SeqCst);
    }

    pub fn num_breakpoints(&self) -> u32 {
        self.num_breakpoints.load(Ordering::SeqCst)
    }

    pub fn num_watchpoints(&self) -> u32 {
        self.num_watchpoints.load(Ordering::SeqCst)
    }

    pub(crate) fn breakpoint_added(&self) -> u32 {
        self.num_breakpoints.fetch_add(1, Ordering::SeqCst);
        self.next_bp_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn breakpoints_removed(&self, n: u32) {
        self.num_breakpoints.fetch_sub(n, Ordering::SeqCst);
    }

    pub(crate) fn watchpoint_added(&self) -> u32 {
        self.num_watchpoints.fetch_add(1, Ordering::SeqCst);
        self.next_wp_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn watchpoints_removed(&self, n: u32) {
        self.num_watchpoints.fetch_sub(n, Ordering::SeqCst);
    }

    pub fn next_eval_id(&self) -> u32 {
        self.eval_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_eval_id(&self) -> u32 {
        self.eval_counter.load(Ordering::SeqCst)
    }

    /// Local thread IDs restart at 1 on every fresh attachment.
    pub fn reset_thread_ids(&self) {
        self.next_thread_id.store(1, Ordering::SeqCst);
    }

    /// Empty every registry and zero its counter.
    pub(crate) fn clear_registries(&self) {
        self.breakpoints.lock().unwrap().clear();
        self.watchpoints.lock().unwrap().clear();
        self.threads.lock().unwrap().clear();
        self.num_breakpoints.store(0, Ordering::SeqCst);
        self.num_watchpoints.store(0, Ordering::SeqCst);
        self.focused_port.store(PORT_NULL, Ordering::SeqCst);
    }

    pub fn focused_port(&self) -> PortName {
        self.focused_port.load(Ordering::SeqCst)
    }

    /// Focus follows exceptions; the port must name a registered thread.
    pub fn set_focused_thread(&self, port: PortName) -> bool {
        let threads = self.threads.lock().unwrap();
        if threads.find(|t| t.port == port).is_some() {
            self.focused_port.store(port, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn with_thread_mut<R>(
        &self,
        port: PortName,
        f: impl FnOnce(&mut MachThread) -> R,
    ) -> Option<R> {
        let mut threads = self.threads.lock().unwrap();
        threads.find_mut(|t| t.port == port).map(f)
    }

    pub fn with_focused_mut<R>(&self, f: impl FnOnce(&mut MachThread) -> R) -> Option<R> {
        self.with_thread_mut(self.focused_port(), f)
    }

    pub fn thread_port_of_local_id(&self, id: u32) -> Option<PortName> {
        let threads = self.threads.lock().unwrap();
        threads.find(|t| t.id == id).map(|t| t.port)
    }

    pub fn thread_port_of_tid(&self, tid: u64) -> Option<PortName> {
        let threads = self.threads.lock().unwrap();
        threads.find(|t| t.tid == tid).map(|t| t.port)
    }

    /// Diff the registry against the kernel's current port array: register
    /// newcomers, drop the departed.
    pub fn update_threads(&self, ports: &[PortName]) {
        let mut threads = self.threads.lock().unwrap();

        let gone = threads.remove_where(|t| !ports.contains(&t.port));
        if gone > 0 {
            debug!("{} thread(s) gone from the inferior", gone);
        }

        for &port in ports {
            if threads.find(|t| t.port == port).is_none() {
                let ident = self
                    .kernel
                    .thread_ident(self.pid, port)
                    .unwrap_or_default();
                let id = self.next_thread_id.fetch_add(1, Ordering::SeqCst);
                debug!("registering thread #{} (port {:#x})", id, port);
                threads.append(MachThread::new(port, id, ident));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kernel::mock::{MockKernel, MOCK_TASK_PORT};

    fn debuggee_with_threads() -> (Arc<MockKernel>, Debuggee) {
        let kernel = Arc::new(MockKernel::new());
        kernel.add_thread(0x101, 0xaaa, "one");
        kernel.add_thread(0x202, 0xbbb, "two");
        let mut dbg = Debuggee::new(kernel.clone(), Default::default());
        dbg.pid = 99;
        dbg.task = MOCK_TASK_PORT;
        dbg.update_threads(&[0x101, 0x202]);
        (kernel, dbg)
    }

    #[test]
    fn update_threads_assigns_monotonic_local_ids() {
        let (kernel, dbg) = debuggee_with_threads();
        {
            let threads = dbg.threads.lock().unwrap();
            let ids: Vec<u32> = threads.iter().map(|t| t.id).collect();
            assert_eq!(ids, vec![1, 2]);
        }

        kernel.add_thread(0x303, 0xccc, "three");
        dbg.update_threads(&[0x101, 0x202, 0x303]);
        assert_eq!(dbg.thread_port_of_local_id(3), Some(0x303));

        // A departed thread is pruned but its id is never reused.
        dbg.update_threads(&[0x101, 0x303]);
        assert_eq!(dbg.thread_port_of_local_id(2), None);
        assert_eq!(dbg.thread_port_of_tid(0xccc), Some(0x303));
    }

    #[test]
    fn focus_requires_a_registered_thread() {
        let (_kernel, dbg) = debuggee_with_threads();
        assert!(dbg.set_focused_thread(0x202));
        assert_eq!(dbg.focused_port(), 0x202);
        assert!(!dbg.set_focused_thread(0x999));
        assert_eq!(dbg.focused_port(), 0x202);
    }

    #[test]
    fn suspend_resume_balance() {
        let (kernel, dbg) = debuggee_with_threads();
        assert!(!dbg.suspended());
        dbg.suspend().unwrap();
        dbg.suspend().unwrap();
        assert!(dbg.suspended());
        dbg.resume().unwrap();
        assert!(dbg.suspended());
        dbg.resume().unwrap();
        assert!(!dbg.suspended());
        // Resuming a running task is a no-op, not an underflow.
        dbg.resume().unwrap();
        assert_eq!(kernel.suspends.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
