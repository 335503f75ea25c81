//! x86-64 user-mode execution core.
//!
//! [`ExecutionCore`] fetches, decodes and executes guest instructions for one
//! [`ExecutionContext`] at a time against a shared [`xemu_mem::AddressSpace`].
//! Instructions either retire completely or not at all: faults are reported
//! with the register file and memory exactly as they were before the
//! faulting instruction.
//!
//! Two optional accelerators sit in front of the interpreter: a decode cache
//! keyed by guest address, and a block translator for hot straight-line code.
//! Both validate against the code bytes they were built from, so guest code
//! may rewrite itself freely.

mod config;
mod context;
mod decode_cache;
mod exec;
mod fault;
mod interp;
pub mod state;
pub mod trace;
mod translator;

pub use config::CoreConfig;
pub use context::{ExecutionContext, PendingFault, RunState, SyscallArgs, SyscallReturn};
pub use decode_cache::DecodeCacheStats;
pub use exec::{ExecutionCore, RunExit, StepResult};
pub use fault::{ArithmeticTrap, FaultKind, HaltReason, SchedulingError};
pub use state::{gpr, RFlags, RegisterFile};
pub use translator::TranslatorStats;
