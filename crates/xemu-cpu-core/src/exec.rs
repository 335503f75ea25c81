use crate::config::CoreConfig;
use crate::context::{ExecutionContext, SyscallArgs};
use crate::decode_cache::{DecodeCache, DecodeCacheStats};
use crate::fault::{FaultKind, HaltReason, SchedulingError};
use crate::interp::{self, ExecOutcome, Handler, Machine};
use crate::state::RFlags;
use crate::trace::{self, TraceEvent, TraceSink};
use crate::translator::{Block, BlockTranslator, TranslatorStats};
use xemu_decoder::{decode, DecodeError, DecodeMode, InstructionDescriptor, MAX_INSTRUCTION_LEN};
use xemu_mem::{AddressSpace, MemoryFault};

/// Result of executing (or trying to execute) one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    /// The instruction retired.
    Completed,
    /// The instruction at `addr` raised a guest-visible fault. Nothing was
    /// committed and the fault has been queued on the context.
    Faulted { kind: FaultKind, addr: u64 },
    /// `syscall` retired; RIP already points past it. Resume with
    /// [`ExecutionContext::complete_syscall`].
    SyscallRequested(SyscallArgs),
    /// The thread can no longer run.
    ThreadHalted(HaltReason),
}

/// Summary of a [`ExecutionCore::run`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunExit {
    /// Instructions retired, including a final `syscall`.
    pub executed: u64,
    /// Why the run stopped; `Completed` means the budget ran out.
    pub result: StepResult,
}

enum FetchFailure {
    Fault(MemoryFault),
    Decode { error: DecodeError, bytes: Vec<u8> },
}

/// Drives one guest thread at a time.
///
/// A core owns per-thread caches but no guest state, so one core per host
/// thread is the intended layout; the address space behind each context is
/// shared and internally synchronised.
pub struct ExecutionCore {
    cache: Option<DecodeCache>,
    translator: Option<BlockTranslator>,
    trace: Option<Box<dyn TraceSink>>,
}

impl Default for ExecutionCore {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

impl ExecutionCore {
    pub fn new(cfg: CoreConfig) -> Self {
        Self {
            cache: (cfg.decode_cache_entries > 0).then(|| DecodeCache::new(cfg.decode_cache_entries)),
            translator: cfg
                .hot_threshold
                .map(|threshold| BlockTranslator::new(threshold, cfg.max_block_len)),
            trace: None,
        }
    }

    /// Emit a [`TraceEvent`] for every retired instruction from now on.
    pub fn set_trace_sink(&mut self, sink: impl TraceSink + 'static) {
        self.trace = Some(Box::new(sink));
    }

    pub fn clear_trace_sink(&mut self) {
        self.trace = None;
    }

    pub fn decode_cache_stats(&self) -> DecodeCacheStats {
        self.cache.as_ref().map(DecodeCache::stats).unwrap_or_default()
    }

    pub fn translator_stats(&self) -> TranslatorStats {
        self.translator
            .as_ref()
            .map(BlockTranslator::stats)
            .unwrap_or_default()
    }

    /// Drop every cached decode and translated block. Never required for
    /// correctness (both validate against the code bytes), but frees memory
    /// when switching to an unrelated address space.
    pub fn flush(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
        if let Some(translator) = self.translator.as_mut() {
            translator.clear();
        }
    }

    /// Fetch, decode and execute exactly one instruction.
    pub fn step(&mut self, ctx: &mut ExecutionContext) -> Result<StepResult, SchedulingError> {
        if ctx.is_halted() {
            return Err(SchedulingError::ThreadAlreadyHalted);
        }
        let space = ctx.space()?;
        Ok(self.step_in(ctx, &space))
    }

    /// Execute up to `max_instructions`, stopping early at the first fault,
    /// syscall or halt.
    pub fn run(
        &mut self,
        ctx: &mut ExecutionContext,
        max_instructions: u64,
    ) -> Result<RunExit, SchedulingError> {
        if ctx.is_halted() {
            return Err(SchedulingError::ThreadAlreadyHalted);
        }
        let space = ctx.space()?;
        let mut executed = 0u64;

        while executed < max_instructions {
            let block = match self.translator.as_mut() {
                Some(translator) => translator.lookup(&space, ctx.regs.rip),
                None => None,
            };
            if let Some(block) = block {
                let (n, exit) = self.run_block(ctx, &space, &block, max_instructions - executed);
                executed += n;
                if let Some(result) = exit {
                    return Ok(RunExit { executed, result });
                }
                if n > 0 {
                    continue;
                }
            }

            match self.step_in(ctx, &space) {
                StepResult::Completed => executed += 1,
                result @ StepResult::SyscallRequested(_) => {
                    executed += 1;
                    return Ok(RunExit { executed, result });
                }
                result => return Ok(RunExit { executed, result }),
            }
        }

        Ok(RunExit {
            executed,
            result: StepResult::Completed,
        })
    }

    fn step_in(&mut self, ctx: &mut ExecutionContext, space: &AddressSpace) -> StepResult {
        let rip = ctx.regs.rip;
        let inst = match self.fetch(space, rip) {
            Ok(inst) => inst,
            Err(FetchFailure::Fault(fault)) => return self.raise(ctx, space, fault.into(), rip),
            Err(FetchFailure::Decode { error, bytes }) => return halt_on_decode(ctx, rip, bytes, error),
        };
        let handler = match interp::resolve(&inst) {
            Ok(handler) => handler,
            Err(kind) => return self.raise(ctx, space, kind, rip),
        };
        self.execute(ctx, space, &inst, handler).0
    }

    /// Run a translated block until it ends, the budget runs out, something
    /// other than plain retirement happens, or a store changes its code.
    fn run_block(
        &mut self,
        ctx: &mut ExecutionContext,
        space: &AddressSpace,
        block: &Block,
        budget: u64,
    ) -> (u64, Option<StepResult>) {
        let mut executed = 0u64;
        let mut exit = None;
        for op in &block.ops {
            if executed >= budget || ctx.regs.rip != op.inst.ip() {
                break;
            }
            let (result, stored) = self.execute(ctx, space, &op.inst, op.handler);
            match result {
                StepResult::Completed => executed += 1,
                StepResult::SyscallRequested(_) => {
                    executed += 1;
                    exit = Some(result);
                    break;
                }
                _ => {
                    exit = Some(result);
                    break;
                }
            }
            if stored && !block.is_valid(space) {
                if let Some(translator) = self.translator.as_mut() {
                    translator.invalidate(block.entry);
                }
                break;
            }
        }
        if let Some(translator) = self.translator.as_mut() {
            translator.note_retired(executed);
        }
        (executed, exit)
    }

    fn fetch(&mut self, space: &AddressSpace, rip: u64) -> Result<InstructionDescriptor, FetchFailure> {
        if let Some(hit) = self.cache.as_mut().and_then(|cache| cache.lookup(space, rip)) {
            return Ok(hit);
        }

        let mut window = [0u8; MAX_INSTRUCTION_LEN];
        let fetched = space.fetch_code(rip, &mut window).map_err(FetchFailure::Fault)?;
        match decode(&window[..fetched.len], rip, DecodeMode::Bits64) {
            Ok(inst) => {
                if let Some(cache) = self.cache.as_mut() {
                    cache.insert(rip, fetched.stamp.restrict(rip, inst.len()), inst.clone());
                }
                Ok(inst)
            }
            // The window stopped early at a page that cannot be fetched, and
            // the instruction runs into it: that is a fetch fault on the
            // missing byte, not an undecodable instruction.
            Err(DecodeError::InsufficientBytes) if fetched.len < MAX_INSTRUCTION_LEN => {
                let next = rip.wrapping_add(fetched.len as u64);
                let mut probe = [0u8; 1];
                match space.fetch_code(next, &mut probe) {
                    Err(fault) => Err(FetchFailure::Fault(fault)),
                    Ok(_) => Err(FetchFailure::Decode {
                        error: DecodeError::InsufficientBytes,
                        bytes: window[..fetched.len].to_vec(),
                    }),
                }
            }
            Err(error) => Err(FetchFailure::Decode {
                error,
                bytes: window[..fetched.len].to_vec(),
            }),
        }
    }

    /// Run `handler` on a scratch register file and commit it if it succeeds.
    /// The second value reports whether the instruction stored to memory.
    fn execute(
        &mut self,
        ctx: &mut ExecutionContext,
        space: &AddressSpace,
        inst: &InstructionDescriptor,
        handler: Handler,
    ) -> (StepResult, bool) {
        let mut scratch = ctx.regs;
        let mut writes = self.trace.is_some().then(Vec::new);
        let (outcome, stored) = {
            let mut m = Machine::new(&mut scratch, space, ctx.retired(), writes.as_mut());
            let outcome = handler(&mut m, inst);
            (outcome, m.stored)
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(kind) => return (self.raise(ctx, space, kind, inst.ip()), stored),
        };

        scratch.rip = match outcome {
            ExecOutcome::Branch(target) => target,
            ExecOutcome::Continue | ExecOutcome::Syscall => inst.next_ip(),
        };
        scratch.rflags |= RFlags::FIXED;

        if let Some(sink) = self.trace.as_mut() {
            sink.record(TraceEvent {
                tid: ctx.tid(),
                seq: ctx.retired(),
                address: inst.ip(),
                instruction: inst.clone(),
                regs: trace::diff(&ctx.regs, &scratch),
                writes: writes.unwrap_or_default(),
            });
        }
        ctx.retire(scratch);

        let result = match outcome {
            ExecOutcome::Syscall => StepResult::SyscallRequested(SyscallArgs::from_regs(&ctx.regs)),
            _ => StepResult::Completed,
        };
        (result, stored)
    }

    /// Report a fault at `addr`: decode failures halt the thread, everything
    /// else is queued for the guest.
    fn raise(
        &mut self,
        ctx: &mut ExecutionContext,
        space: &AddressSpace,
        kind: FaultKind,
        addr: u64,
    ) -> StepResult {
        if let FaultKind::Decode(error) = kind {
            let mut window = [0u8; MAX_INSTRUCTION_LEN];
            let bytes = match space.fetch_code(addr, &mut window) {
                Ok(fetched) => window[..fetched.len].to_vec(),
                Err(_) => Vec::new(),
            };
            return halt_on_decode(ctx, addr, bytes, error);
        }
        tracing::debug!(tid = ctx.tid(), addr = format_args!("{addr:#x}"), %kind, "guest fault");
        ctx.deliver_fault(kind, addr);
        StepResult::Faulted { kind, addr }
    }
}

fn halt_on_decode(ctx: &mut ExecutionContext, addr: u64, bytes: Vec<u8>, error: DecodeError) -> StepResult {
    tracing::warn!(
        tid = ctx.tid(),
        addr = format_args!("{addr:#x}"),
        bytes = ?bytes,
        %error,
        "cannot execute instruction; halting thread"
    );
    let reason = HaltReason::Decode { addr, bytes, error };
    if let Err(err) = ctx.halt(reason.clone()) {
        tracing::error!(tid = ctx.tid(), %err, "halt on decode failure");
    }
    StepResult::ThreadHalted(reason)
}
