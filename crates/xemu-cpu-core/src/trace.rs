//! Per-instruction execution trace.
//!
//! When a sink is installed the core emits one [`TraceEvent`] per retired
//! instruction, in retirement order for the thread. Faulting instructions do
//! not retire and produce no event.

use crate::state::RegisterFile;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use xemu_decoder::InstructionDescriptor;

/// Register slots that can appear in a trace delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegId {
    Gpr(u8),
    Rip,
    Rflags,
    FsBase,
    GsBase,
    /// Low and high quadwords of an XMM register.
    XmmLow(u8),
    XmmHigh(u8),
    Mxcsr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegDelta {
    pub reg: RegId,
    pub old: u64,
    pub new: u64,
}

/// Bytes stored by the instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemWrite {
    pub addr: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub tid: u32,
    /// Retirement index within the thread, starting at 0.
    pub seq: u64,
    pub address: u64,
    pub instruction: InstructionDescriptor,
    pub regs: Vec<RegDelta>,
    pub writes: Vec<MemWrite>,
}

/// Register differences between two snapshots, RIP included.
pub(crate) fn diff(before: &RegisterFile, after: &RegisterFile) -> Vec<RegDelta> {
    let mut out = Vec::new();
    for i in 0..16 {
        if before.gpr[i] != after.gpr[i] {
            out.push(RegDelta {
                reg: RegId::Gpr(i as u8),
                old: before.gpr[i],
                new: after.gpr[i],
            });
        }
    }
    let mut push = |reg, old: u64, new: u64| {
        if old != new {
            out.push(RegDelta { reg, old, new });
        }
    };
    push(RegId::Rip, before.rip, after.rip);
    push(RegId::Rflags, before.flags(), after.flags());
    push(RegId::FsBase, before.fs_base, after.fs_base);
    push(RegId::GsBase, before.gs_base, after.gs_base);
    for i in 0..16 {
        let (old, new) = (before.xmm[i], after.xmm[i]);
        push(RegId::XmmLow(i as u8), old as u64, new as u64);
        push(RegId::XmmHigh(i as u8), (old >> 64) as u64, (new >> 64) as u64);
    }
    push(RegId::Mxcsr, before.mxcsr as u64, after.mxcsr as u64);
    out
}

/// Consumer of trace events. Sinks must not block for long: they run on the
/// guest thread between instructions.
pub trait TraceSink: Send {
    fn record(&mut self, event: TraceEvent);
}

/// Forward events over a channel; events are dropped once the receiver is gone.
impl TraceSink for Sender<TraceEvent> {
    fn record(&mut self, event: TraceEvent) {
        let _ = self.send(event);
    }
}

/// Collects events in memory. Clones share the same buffer, so a test can keep
/// one handle and give the other to the core.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TraceSink for MemorySink {
    fn record(&mut self, event: TraceEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Writes each event to the `tracing` subscriber at TRACE level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn record(&mut self, event: TraceEvent) {
        tracing::trace!(
            tid = event.tid,
            seq = event.seq,
            rip = format_args!("{:#x}", event.address),
            mnemonic = ?event.instruction.mnemonic(),
            regs = ?event.regs,
            writes = event.writes.len(),
            "retired"
        );
    }
}
