//! Shared fixtures: a mock inferior already attached, with one thread and a
//! page of text mapped.

use std::fmt::Write;
use std::sync::Arc;

use crate::collaborators::{Collaborators, Disassembler};
use crate::debuggee::Debuggee;
use crate::kernel::mock::{MockKernel, MOCK_TASK_PORT};

pub(crate) struct TestDisassembler;

impl Disassembler for TestDisassembler {
    fn disassemble(&self, addr: u64, _nbytes: u32, out: &mut String) {
        let _ = write!(out, "    {:#x}  <disassembly>\n", addr);
    }
}

/// An attached, suspended debuggee over a mock inferior: pid 4321 ("victim"),
/// one thread (port 0x101, tid 0x111, named "main"), and NOPs mapped at
/// 0x1_0000_0000.
pub(crate) fn attached_debuggee() -> (Arc<MockKernel>, Debuggee) {
    // RUST_LOG-gated output from the engines under test.
    let _ = env_logger::builder().is_test(true).try_init();

    let kernel = Arc::new(MockKernel::new());
    kernel.procs.lock().unwrap().insert("victim".to_string(), 4321);
    kernel.add_thread(0x101, 0x111, "main");

    let mut text = Vec::new();
    for _ in 0..64 {
        text.extend_from_slice(&0xd503_201fu32.to_le_bytes());
    }
    kernel.map_bytes(0x1_0000_0000, &text);

    let collab = Collaborators {
        disassembler: Box::new(TestDisassembler),
        ..Default::default()
    };

    let mut dbg = Debuggee::new(kernel.clone(), collab);
    dbg.pid = 4321;
    dbg.task = MOCK_TASK_PORT;
    dbg.debuggee_name = "victim".to_string();
    dbg.aslr_slide = 0x10000;
    let _ = dbg.suspend();
    dbg.update_threads(&[0x101]);
    dbg.set_focused_thread(0x101);

    (kernel, dbg)
}
