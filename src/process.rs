use crate::config::{EmulatorConfig, FaultPolicy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use thiserror::Error;
use xemu_cpu_core::{
    ExecutionContext, ExecutionCore, FaultKind, HaltReason, PendingFault, RegisterFile, StepResult,
};
use xemu_mem::AddressSpace;
use xemu_posix::{load_elf, Bridge, LoadError, LoadOptions, LoadedImage, SyscallDisposition};

const SIGILL: i32 = 4;
const SIGTRAP: i32 = 5;
const SIGFPE: i32 = 8;
const SIGSEGV: i32 = 11;

/// Signal the Linux kernel would raise for `kind`.
pub fn fault_signal(kind: &FaultKind) -> i32 {
    match kind {
        FaultKind::Memory(_) | FaultKind::Privileged | FaultKind::GeneralProtection => SIGSEGV,
        FaultKind::Arithmetic(_) => SIGFPE,
        FaultKind::Breakpoint => SIGTRAP,
        FaultKind::UndefinedInstruction | FaultKind::Decode(_) => SIGILL,
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("failed to start host thread for guest thread {tid}: {source}")]
    Spawn {
        tid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("guest thread {tid} panicked")]
    ThreadPanicked { tid: u32 },
}

/// Final state of one guest thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadExit {
    pub tid: u32,
    pub reason: HaltReason,
    pub retired: u64,
    pub regs: RegisterFile,
}

impl ThreadExit {
    /// Wait-status style code: the exit code for `exit`, `128 + signal` for a
    /// fatal fault, `None` when another thread ended the process.
    pub fn status(&self) -> Option<i32> {
        match &self.reason {
            HaltReason::Exited(code) => Some(code & 0xff),
            HaltReason::Fault { kind, .. } => Some(128 + fault_signal(kind)),
            HaltReason::Decode { .. } => Some(128 + SIGILL),
            HaltReason::Killed => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub status: i32,
    /// In spawn order.
    pub threads: Vec<ThreadExit>,
}

/// State every thread of a process shares.
#[derive(Debug, Default)]
struct Shared {
    exiting: AtomicBool,
    group_status: Mutex<Option<i32>>,
}

impl Shared {
    /// First caller wins; later statuses are ignored.
    fn exit_group(&self, status: i32) {
        let mut slot = self.group_status.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(status & 0xff);
        }
        self.exiting.store(true, Ordering::Release);
    }

    fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    fn group_status(&self) -> Option<i32> {
        *self.group_status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A guest process: one address space, one syscall bridge, any number of
/// guest threads, each driven by its own host thread.
pub struct GuestProcess {
    space: Arc<AddressSpace>,
    bridge: Arc<dyn Bridge>,
    cfg: EmulatorConfig,
    shared: Arc<Shared>,
    threads: Vec<(u32, JoinHandle<ThreadExit>)>,
    next_tid: u32,
}

impl GuestProcess {
    pub fn new(space: Arc<AddressSpace>, bridge: Arc<dyn Bridge>, cfg: EmulatorConfig) -> Self {
        Self {
            space,
            bridge,
            cfg,
            shared: Arc::new(Shared::default()),
            threads: Vec::new(),
            next_tid: 1,
        }
    }

    /// Load a static ELF image into a fresh address space and start its main
    /// thread. `make_bridge` receives the loaded image so it can seed the
    /// program break. The stack size comes from `cfg`.
    pub fn spawn_elf(
        image: &[u8],
        opts: &LoadOptions,
        cfg: EmulatorConfig,
        make_bridge: impl FnOnce(&LoadedImage) -> Arc<dyn Bridge>,
    ) -> Result<(Self, LoadedImage), ProcessError> {
        let space = Arc::new(AddressSpace::with_config(cfg.vmm));
        let opts = LoadOptions {
            stack_size: cfg.stack_size,
            ..opts.clone()
        };
        let loaded = load_elf(&space, image, &opts)?;
        let bridge = make_bridge(&loaded);
        let mut process = Self::new(space, bridge, cfg);
        process.spawn_thread(loaded.initial_registers())?;
        Ok((process, loaded))
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.cfg
    }

    /// Start a guest thread with `regs`; returns its tid.
    pub fn spawn_thread(&mut self, regs: RegisterFile) -> Result<u32, ProcessError> {
        let tid = self.next_tid;
        self.next_tid += 1;
        let runner = ThreadRunner {
            ctx: ExecutionContext::new(tid, &self.space, regs),
            space: self.space.clone(),
            bridge: self.bridge.clone(),
            shared: self.shared.clone(),
            cfg: self.cfg,
        };
        let handle = std::thread::Builder::new()
            .name(format!("xemu-tid-{tid}"))
            .spawn(move || runner.run())
            .map_err(|source| ProcessError::Spawn { tid, source })?;
        tracing::debug!(tid, rip = format_args!("{:#x}", regs.rip), "spawned guest thread");
        self.threads.push((tid, handle));
        Ok(tid)
    }

    /// Ask every thread to stop at its next batch boundary, as `exit_group`
    /// would.
    pub fn exit_group(&self, status: i32) {
        self.shared.exit_group(status);
    }

    /// Join every thread. The process status is the `exit_group` status if
    /// one was set, otherwise the status of the first thread spawned.
    pub fn wait(self) -> Result<ProcessExit, ProcessError> {
        let mut threads = Vec::with_capacity(self.threads.len());
        for (tid, handle) in self.threads {
            let exit = handle
                .join()
                .map_err(|_| ProcessError::ThreadPanicked { tid })?;
            threads.push(exit);
        }
        let status = self
            .shared
            .group_status()
            .or_else(|| threads.first().and_then(ThreadExit::status))
            .unwrap_or(0);
        tracing::debug!(status, threads = threads.len(), "guest process exited");
        Ok(ProcessExit { status, threads })
    }
}

struct ThreadRunner {
    ctx: ExecutionContext,
    space: Arc<AddressSpace>,
    bridge: Arc<dyn Bridge>,
    shared: Arc<Shared>,
    cfg: EmulatorConfig,
}

impl ThreadRunner {
    fn run(mut self) -> ThreadExit {
        let mut core = ExecutionCore::new(self.cfg.core);
        let span = tracing::debug_span!("guest_thread", tid = self.ctx.tid());
        let _enter = span.enter();

        while !self.ctx.is_halted() {
            if self.shared.is_exiting() {
                self.halt(HaltReason::Killed);
                break;
            }
            let exit = match core.run(&mut self.ctx, self.cfg.batch_size) {
                Ok(exit) => exit,
                Err(err) => {
                    tracing::error!(%err, "guest thread cannot continue");
                    break;
                }
            };
            match exit.result {
                StepResult::Completed | StepResult::ThreadHalted(_) => {}
                StepResult::SyscallRequested(args) => {
                    match self.bridge.syscall(&self.space, &mut self.ctx, &args) {
                        SyscallDisposition::Return(ret) => {
                            if let Err(err) = self.ctx.complete_syscall(ret) {
                                tracing::error!(%err, "syscall completion rejected");
                            }
                        }
                        SyscallDisposition::Exit(code) => self.halt(HaltReason::Exited(code)),
                        SyscallDisposition::ExitGroup(code) => {
                            self.shared.exit_group(code);
                            self.halt(HaltReason::Exited(code));
                        }
                    }
                }
                StepResult::Faulted { .. } => {
                    if let Some(fault) = self.ctx.take_fault() {
                        self.unhandled_fault(fault);
                    }
                }
            }
        }

        ThreadExit {
            tid: self.ctx.tid(),
            reason: self.ctx.halt_reason().cloned().unwrap_or(HaltReason::Killed),
            retired: self.ctx.retired(),
            regs: self.ctx.regs,
        }
    }

    /// No guest signal handlers are modelled, so every fault is unhandled.
    fn unhandled_fault(&mut self, fault: PendingFault) {
        let PendingFault { kind, addr } = fault;
        tracing::debug!(
            %kind,
            addr = format_args!("{addr:#x}"),
            policy = ?self.cfg.fault_policy,
            "unhandled guest fault"
        );
        if self.cfg.fault_policy == FaultPolicy::KillProcess {
            self.shared.exit_group(128 + fault_signal(&kind));
        }
        self.halt(HaltReason::Fault { kind, addr });
    }

    fn halt(&mut self, reason: HaltReason) {
        if let Err(err) = self.ctx.halt(reason) {
            tracing::error!(%err, "halting an already halted thread");
        }
    }
}
