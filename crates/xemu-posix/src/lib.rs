//! Linux personality for the xemu execution core: a static ELF64 loader and
//! the syscall bridge that services `syscall` requests from guest threads.

mod bridge;
pub mod errno;
mod linux;
mod loader;

pub use bridge::{Bridge, SyscallDisposition};
pub use linux::{nr, Captured, InputStream, LinuxBridge, OutputStream, DEFAULT_BRK_LIMIT};
pub use loader::{
    load_elf, LoadError, LoadOptions, LoadedImage, DEFAULT_AT_RANDOM, DEFAULT_STACK_SIZE,
    DEFAULT_STACK_TOP, PIE_LOAD_BIAS,
};
