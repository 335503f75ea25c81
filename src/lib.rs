//! xemu runs unmodified x86-64 Linux user-mode programs on any host.
//!
//! The work is split across the workspace:
//!
//! - `xemu-decoder`: byte window to [`InstructionDescriptor`] (iced-x86 underneath).
//! - `xemu-mem`: the paged guest [`AddressSpace`] with permissions and code
//!   versioning for self-modifying code.
//! - `xemu-cpu-core`: registers, the interpreter, the decode cache and the
//!   block translator.
//! - `xemu-posix`: the static ELF loader and the Linux syscall bridge.
//!
//! This crate ties them together into a [`GuestProcess`] whose threads each
//! run on a host thread.
//!
//! [`InstructionDescriptor`]: xemu_decoder::InstructionDescriptor

mod config;
mod process;

pub use config::{ConfigError, EmulatorConfig, FaultPolicy, DEFAULT_BATCH_SIZE};
pub use process::{fault_signal, GuestProcess, ProcessError, ProcessExit, ThreadExit};

pub use xemu_cpu_core as cpu;
pub use xemu_decoder as decoder;
pub use xemu_mem as mem;
pub use xemu_posix as posix;

pub use xemu_mem::AddressSpace;
