use crate::fault::{FaultKind, HaltReason, SchedulingError};
use crate::state::{gpr, RegisterFile};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use xemu_mem::AddressSpace;

/// Pending events beyond this are dropped; a guest that faults in a loop
/// without anyone draining the queue would otherwise grow it without bound.
const MAX_PENDING_FAULTS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Running,
    Halted(HaltReason),
}

/// A guest-visible fault waiting for the process layer to deliver it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFault {
    pub kind: FaultKind,
    pub addr: u64,
}

/// Linux syscall arguments as read from the register file on `syscall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallArgs {
    pub number: u64,
    /// rdi, rsi, rdx, r10, r8, r9.
    pub args: [u64; 6],
}

impl SyscallArgs {
    pub fn from_regs(regs: &RegisterFile) -> Self {
        Self {
            number: regs.gpr[gpr::RAX],
            args: [
                regs.gpr[gpr::RDI],
                regs.gpr[gpr::RSI],
                regs.gpr[gpr::RDX],
                regs.gpr[gpr::R10],
                regs.gpr[gpr::R8],
                regs.gpr[gpr::R9],
            ],
        }
    }
}

/// What the host hands back for a syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallReturn {
    pub value: u64,
    /// Positive errno; when set, RAX receives `-errno` instead of `value`.
    pub error: Option<i32>,
}

impl SyscallReturn {
    pub fn ok(value: u64) -> Self {
        Self { value, error: None }
    }

    pub fn err(errno: i32) -> Self {
        Self {
            value: 0,
            error: Some(errno),
        }
    }

    /// The value RAX holds after the syscall.
    pub fn rax(&self) -> u64 {
        match self.error {
            Some(errno) => (-(errno as i64)) as u64,
            None => self.value,
        }
    }
}

/// Per-thread execution state.
///
/// The address space is held weakly: the process owns it, threads only use it.
#[derive(Debug)]
pub struct ExecutionContext {
    tid: u32,
    pub regs: RegisterFile,
    space: Weak<AddressSpace>,
    pending: VecDeque<PendingFault>,
    state: RunState,
    retired: u64,
}

impl ExecutionContext {
    pub fn new(tid: u32, space: &Arc<AddressSpace>, regs: RegisterFile) -> Self {
        Self {
            tid,
            regs,
            space: Arc::downgrade(space),
            pending: VecDeque::new(),
            state: RunState::Running,
            retired: 0,
        }
    }

    #[inline]
    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn space(&self) -> Result<Arc<AddressSpace>, SchedulingError> {
        self.space
            .upgrade()
            .ok_or(SchedulingError::AddressSpaceReleased)
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.state, RunState::Halted(_))
    }

    pub fn halt_reason(&self) -> Option<&HaltReason> {
        match &self.state {
            RunState::Halted(reason) => Some(reason),
            RunState::Running => None,
        }
    }

    /// Move the thread to its terminal state. Halting twice is an error and
    /// keeps the first reason.
    pub fn halt(&mut self, reason: HaltReason) -> Result<(), SchedulingError> {
        if self.is_halted() {
            return Err(SchedulingError::ThreadAlreadyHalted);
        }
        tracing::debug!(tid = self.tid, ?reason, "thread halted");
        self.state = RunState::Halted(reason);
        Ok(())
    }

    /// Number of instructions this thread has retired.
    #[inline]
    pub fn retired(&self) -> u64 {
        self.retired
    }

    pub(crate) fn retire(&mut self, regs: RegisterFile) {
        self.regs = regs;
        self.retired += 1;
    }

    pub(crate) fn deliver_fault(&mut self, kind: FaultKind, addr: u64) {
        if self.pending.len() >= MAX_PENDING_FAULTS {
            tracing::warn!(tid = self.tid, addr, %kind, "pending fault queue full; dropping");
            return;
        }
        self.pending.push_back(PendingFault { kind, addr });
    }

    pub fn pending_faults(&self) -> impl Iterator<Item = &PendingFault> {
        self.pending.iter()
    }

    pub fn take_fault(&mut self) -> Option<PendingFault> {
        self.pending.pop_front()
    }

    /// Resume a thread that stopped with `SyscallRequested`.
    pub fn complete_syscall(&mut self, ret: SyscallReturn) -> Result<(), SchedulingError> {
        if self.is_halted() {
            return Err(SchedulingError::ThreadAlreadyHalted);
        }
        self.regs.gpr[gpr::RAX] = ret.rax();
        Ok(())
    }
}
