//! Per-thread records: kernel identity, cached register banks, and the
//! stepping state machine the dispatcher drives.

use bit_field::BitField;

use crate::kernel::{
    Arm64DebugState, Arm64NeonState, Arm64ThreadState, KernResult, KernelInterface, PortName,
    ThreadIdent,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StepKind {
    None,
    InstStepIn,
    InstStepOver,
}

impl Default for StepKind {
    fn default() -> StepKind {
        StepKind::None
    }
}

/// State of an in-flight user step. `is_stepping` implies
/// `step_kind != None`.
#[derive(Copy, Clone, Debug, Default)]
pub struct StepConfig {
    pub is_stepping: bool,
    pub step_kind: StepKind,
    /// A one-shot breakpoint bounds the current step-over.
    pub set_temp_ss_breakpoint: bool,
    pub just_hit_ss_breakpoint: bool,
}

pub struct MachThread {
    /// Debugger-local ID, monotonic from 1 per attachment.
    pub id: u32,
    pub port: PortName,
    pub tid: u64,
    pub tname: String,

    /// Cached register banks. Authoritative between a `get_*_state` and the
    /// next `set_*_state`; don't read the kernel directly in between.
    pub thread_state: Arm64ThreadState,
    pub debug_state: Arm64DebugState,
    pub neon_state: Arm64NeonState,

    pub just_hit_breakpoint: bool,
    pub just_hit_sw_breakpoint: bool,
    pub just_hit_watchpoint: bool,
    pub last_hit_bkpt_id: u32,
    pub last_hit_wp_loc: u64,
    pub last_hit_wp_pc: u64,

    pub stepconfig: StepConfig,
}

impl MachThread {
    pub fn new(port: PortName, id: u32, ident: ThreadIdent) -> MachThread {
        MachThread {
            id,
            port,
            tid: ident.tid,
            tname: if ident.name.is_empty() {
                "none".to_string()
            } else {
                ident.name
            },
            thread_state: Default::default(),
            debug_state: Default::default(),
            neon_state: Default::default(),
            just_hit_breakpoint: false,
            just_hit_sw_breakpoint: false,
            just_hit_watchpoint: false,
            last_hit_bkpt_id: 0,
            last_hit_wp_loc: 0,
            last_hit_wp_pc: 0,
            stepconfig: Default::default(),
        }
    }

    pub fn get_thread_state(&mut self, kernel: &dyn KernelInterface) -> KernResult<()> {
        self.thread_state = kernel.get_thread_state(self.port)?;
        Ok(())
    }

    pub fn set_thread_state(&self, kernel: &dyn KernelInterface) -> KernResult<()> {
        kernel.set_thread_state(self.port, &self.thread_state)
    }

    pub fn get_debug_state(&mut self, kernel: &dyn KernelInterface) -> KernResult<()> {
        self.debug_state = kernel.get_debug_state(self.port)?;
        Ok(())
    }

    pub fn set_debug_state(&self, kernel: &dyn KernelInterface) -> KernResult<()> {
        kernel.set_debug_state(self.port, &self.debug_state)
    }

    pub fn get_neon_state(&mut self, kernel: &dyn KernelInterface) -> KernResult<()> {
        self.neon_state = kernel.get_neon_state(self.port)?;
        Ok(())
    }

    pub fn set_neon_state(&self, kernel: &dyn KernelInterface) -> KernResult<()> {
        kernel.set_neon_state(self.port, &self.neon_state)
    }

    /// Gate one-instruction execution with the single-step control bit.
    pub fn set_single_step(&mut self, kernel: &dyn KernelInterface, on: bool) -> KernResult<()> {
        self.get_debug_state(kernel)?;
        self.debug_state.mdscr_el1.set_bit(0, on);
        self.set_debug_state(kernel)
    }

    pub fn begin_step(&mut self, kind: StepKind) {
        debug_assert!(kind != StepKind::None);
        self.stepconfig.is_stepping = true;
        self.stepconfig.step_kind = kind;
    }

    pub fn finish_step(&mut self) {
        self.stepconfig.is_stepping = false;
        self.stepconfig.step_kind = StepKind::None;
    }
}
