use crate::state::UnsupportedRegister;
use thiserror::Error;
use xemu_decoder::DecodeError;
use xemu_mem::MemoryFault;

/// Divide-error traps (#DE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ArithmeticTrap {
    #[error("divide by zero")]
    DivideByZero,
    #[error("quotient does not fit the destination")]
    Overflow,
}

/// Caller errors: asking the core to run a thread that cannot run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedulingError {
    #[error("thread has already halted")]
    ThreadAlreadyHalted,
    #[error("the thread's address space has been released")]
    AddressSpaceReleased,
}

/// Why an instruction did not retire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FaultKind {
    /// Undecodable or unsupported instruction. Never delivered to the guest:
    /// the thread halts instead.
    #[error("decode failure: {0}")]
    Decode(DecodeError),
    #[error(transparent)]
    Memory(MemoryFault),
    #[error(transparent)]
    Arithmetic(ArithmeticTrap),
    /// Instruction that requires CPL 0 (`hlt`, port I/O, descriptor tables).
    #[error("privileged instruction")]
    Privileged,
    /// #GP from user code: a misaligned 16-byte SSE operand or a reserved
    /// MXCSR bit.
    #[error("general protection fault")]
    GeneralProtection,
    /// `int3`.
    #[error("breakpoint")]
    Breakpoint,
    /// `ud2` and friends: a well-formed instruction defined to raise #UD.
    #[error("undefined instruction")]
    UndefinedInstruction,
}

impl FaultKind {
    /// Faults that halt the thread rather than being reported to the guest.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FaultKind::Decode(_))
    }

    pub(crate) fn unsupported() -> Self {
        FaultKind::Decode(DecodeError::UnsupportedFeature)
    }

    pub(crate) fn invalid() -> Self {
        FaultKind::Decode(DecodeError::InvalidOpcode)
    }
}

impl From<MemoryFault> for FaultKind {
    fn from(fault: MemoryFault) -> Self {
        FaultKind::Memory(fault)
    }
}

impl From<ArithmeticTrap> for FaultKind {
    fn from(trap: ArithmeticTrap) -> Self {
        FaultKind::Arithmetic(trap)
    }
}

impl From<DecodeError> for FaultKind {
    fn from(err: DecodeError) -> Self {
        FaultKind::Decode(err)
    }
}

impl From<UnsupportedRegister> for FaultKind {
    fn from(_: UnsupportedRegister) -> Self {
        FaultKind::unsupported()
    }
}

/// Terminal state of a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// The thread called `exit` (or `exit_group`) with this status.
    Exited(i32),
    /// Another thread ended the process.
    Killed,
    /// The instruction at `addr` could not be decoded or is not supported.
    Decode {
        addr: u64,
        bytes: Vec<u8>,
        error: DecodeError,
    },
    /// A guest-visible fault nobody handled.
    Fault { kind: FaultKind, addr: u64 },
}
