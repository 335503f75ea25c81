use xemu_cpu_core::{ExecutionContext, SyscallArgs, SyscallReturn};
use xemu_mem::AddressSpace;

/// What the process layer should do after a syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallDisposition {
    /// Write the result to RAX and keep running.
    Return(SyscallReturn),
    /// `exit`: end the calling thread only.
    Exit(i32),
    /// `exit_group`: end every thread of the process.
    ExitGroup(i32),
}

impl SyscallDisposition {
    pub fn ok(value: u64) -> Self {
        SyscallDisposition::Return(SyscallReturn::ok(value))
    }

    pub fn err(errno: i32) -> Self {
        SyscallDisposition::Return(SyscallReturn::err(errno))
    }
}

/// Host side of the `syscall` instruction.
///
/// One bridge serves every thread of a process, so implementations take
/// `&self` and keep their own locking. The context is passed mutably for calls
/// such as `arch_prctl` that change thread registers; RIP has already moved
/// past the `syscall` when the bridge runs.
pub trait Bridge: Send + Sync {
    fn syscall(
        &self,
        space: &AddressSpace,
        ctx: &mut ExecutionContext,
        args: &SyscallArgs,
    ) -> SyscallDisposition;
}
