//! The exception server: a dedicated thread blocked in the kernel receive,
//! feeding the FIFO the dispatcher drains. Requests are serialized by the
//! queue; replies go out in consumption order.

use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};

use crate::containers::Queue;
use crate::debuggee::Debuggee;
use crate::error::{DbgError, DbgResult};
use crate::exception;
use crate::kernel::{Request, KERN_SUCCESS, PORT_NULL};

/// The exception backlog, shared between the listener and the dispatcher.
pub struct ExcQueue {
    inner: Mutex<Queue<Request>>,
    cond: Condvar,
}

impl ExcQueue {
    pub fn new() -> ExcQueue {
        ExcQueue {
            inner: Mutex::new(Queue::new()),
            cond: Condvar::new(),
        }
    }

    pub fn push(&self, req: Request) {
        self.inner.lock().unwrap().enqueue(req);
        self.cond.notify_one();
    }

    pub fn pop(&self) -> Option<Request> {
        self.inner.lock().unwrap().dequeue()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Parks the caller until something is queued or the timeout elapses.
    /// Returns whether the queue is non-empty.
    pub fn wait(&self, timeout: Duration) -> bool {
        let queue = self.inner.lock().unwrap();
        if !queue.is_empty() {
            return true;
        }
        let (queue, _) = self.cond.wait_timeout(queue, timeout).unwrap();
        !queue.is_empty()
    }
}

impl Default for ExcQueue {
    fn default() -> ExcQueue {
        ExcQueue::new()
    }
}

/// Save the inferior's exception ports, install ours, and start the
/// listener.
pub fn setup_exception_server(dbg: &mut Debuggee) -> DbgResult<()> {
    let saved = dbg
        .kernel
        .save_exception_ports(dbg.task)
        .map_err(|err| DbgError::Kernel {
            op: "exception-port save",
            err,
        })?;
    dbg.saved_exception_ports.lock().unwrap().push(saved);

    let port = dbg
        .kernel
        .install_exception_port(dbg.task)
        .map_err(|err| DbgError::Kernel {
            op: "exception-port install",
            err,
        })?;
    dbg.exception_port = port;

    let kernel = dbg.kernel.clone();
    let queue = dbg.exc_requests.clone();

    let handle = thread::Builder::new()
        .name("exc-listener".to_string())
        .spawn(move || {
            debug!("exception listener running");
            loop {
                match kernel.recv_exception(port) {
                    Ok(req) => {
                        debug!(
                            "exception message {} for thread {:#x}",
                            req.head.msgh_id, req.thread
                        );
                        queue.push(req);
                    }
                    Err(e) => {
                        debug!("exception listener exiting: {}", e);
                        break;
                    }
                }
            }
        })?;
    dbg.listener = Some(handle);
    Ok(())
}

/// Tear the listener down: killing our receive right unblocks the kernel
/// receive, then we join.
pub fn shutdown_exception_server(dbg: &mut Debuggee) {
    if dbg.exception_port != PORT_NULL {
        if let Err(e) = dbg.kernel.port_deallocate(dbg.exception_port) {
            warn!("couldn't deallocate the exception port: {}", e);
        }
        dbg.exception_port = PORT_NULL;
    }

    if let Some(handle) = dbg.listener.take() {
        let _ = handle.join();
    }
}

/// Drain the backlog: classify, reply, and resume or hold the inferior per
/// each request's disposition. Returns how many requests were consumed.
pub fn pump_exceptions(dbg: &Debuggee, out: &mut String) -> usize {
    let mut handled = 0;

    while let Some(req) = dbg.exc_requests.pop() {
        if let Err(e) = dbg.suspend() {
            warn!("couldn't suspend the task for exception handling: {}", e);
        }

        let mut desc = String::new();
        let disp = exception::handle_exception(dbg, &req, &mut desc);

        // The reply is the one side effect that must always happen; a
        // missing reply blocks the inferior forever.
        if let Err(e) = exception::reply_to_exception(dbg, &req, KERN_SUCCESS) {
            error!("couldn't reply to exception message: {}", e);
        }

        if disp.should_print {
            out.push_str(&desc);
        }
        if disp.should_auto_resume {
            if let Err(e) = dbg.resume() {
                warn!("couldn't auto-resume the task: {}", e);
            }
        }

        handled += 1;
    }
    handled
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::kernel::mock::exc_request;
    use crate::kernel::{EXC_BAD_ACCESS, EXC_BREAKPOINT};
    use crate::testutil::attached_debuggee;

    #[test]
    fn listener_feeds_the_queue_and_pump_replies_in_order() {
        let (kernel, mut dbg) = attached_debuggee();
        setup_exception_server(&mut dbg).unwrap();

        let mut first = exc_request(0x101, EXC_BAD_ACCESS, 1, 0x10);
        first.head.msgh_id = 2405;
        let mut second = exc_request(0x101, EXC_BAD_ACCESS, 1, 0x20);
        second.head.msgh_id = 2406;

        kernel.inject_exception(first);
        kernel.inject_exception(second);

        assert!(dbg.exc_requests.wait(Duration::from_secs(5)));
        while dbg.exc_requests.len() < 2 {
            std::thread::yield_now();
        }

        let mut out = String::new();
        assert_eq!(pump_exceptions(&dbg, &mut out), 2);

        let replies = kernel.replies.lock().unwrap();
        let ids: Vec<i32> = replies.iter().map(|r| r.head.msgh_id).collect();
        assert_eq!(ids, vec![2505, 2506]);

        drop(replies);
        shutdown_exception_server(&mut dbg);
        assert!(dbg.listener.is_none());
    }

    #[test]
    fn auto_resume_balances_the_pump_suspend() {
        let (kernel, mut dbg) = attached_debuggee();
        setup_exception_server(&mut dbg).unwrap();

        // An unclassified stop: no auto-resume, the task stays suspended.
        kernel.inject_exception(exc_request(0x101, EXC_BAD_ACCESS, 1, 0));
        assert!(dbg.exc_requests.wait(Duration::from_secs(5)));

        let before = kernel.suspends.load(std::sync::atomic::Ordering::SeqCst);
        let mut out = String::new();
        pump_exceptions(&dbg, &mut out);
        let after = kernel.suspends.load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(after, before + 1);
        assert!(out.contains("stop reason"));

        // A spurious breakpoint message nobody owns: silently resumed.
        kernel.inject_exception(exc_request(0x101, EXC_BREAKPOINT, 1, 0x500));
        assert!(dbg.exc_requests.wait(Duration::from_secs(5)));
        let mut out = String::new();
        pump_exceptions(&dbg, &mut out);
        assert_eq!(
            kernel.suspends.load(std::sync::atomic::Ordering::SeqCst),
            after
        );
        assert_eq!(out, "");

        shutdown_exception_server(&mut dbg);
    }
}
