//! Hot-path block translator.
//!
//! Once an address has been entered `hot_threshold` times through the run
//! loop, the straight-line run of instructions starting there is decoded once
//! and bound to its handlers. Running the block skips the per-instruction
//! fetch, decode-cache probe and dispatch lookup; the handlers themselves are
//! the interpreter's, so a block retires exactly what stepping would.
//!
//! A block remembers the stamp of every code page it was built from and is
//! discarded as soon as any of them changes. It also ends at the first
//! instruction that can redirect control flow, so there is never a question of
//! which instruction comes next.

use crate::interp::{self, Handler};
use std::collections::HashMap;
use std::sync::Arc;
use xemu_decoder::{decode, DecodeMode, FlowControl, InstructionDescriptor, MAX_INSTRUCTION_LEN};
use xemu_mem::{page_floor, AddressSpace, CodeStamp, PAGE_SIZE};

/// Entry addresses tracked at once, compiled or merely warming up. Past this
/// the heat counters start over and compiled blocks are evicted one at a time.
const MAX_TRACKED: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslatorStats {
    pub blocks_compiled: u64,
    pub block_runs: u64,
    /// Instructions retired from inside blocks.
    pub block_instructions: u64,
    /// Blocks dropped because their code changed.
    pub invalidations: u64,
    /// Blocks dropped to stay within the tracking limit.
    pub evictions: u64,
}

pub(crate) struct CompiledOp {
    pub(crate) inst: InstructionDescriptor,
    pub(crate) handler: Handler,
}

pub(crate) struct Block {
    pub(crate) entry: u64,
    pub(crate) ops: Vec<CompiledOp>,
    pages: Vec<(u64, CodeStamp)>,
}

impl Block {
    /// True while every code page the block was built from is unchanged.
    pub(crate) fn is_valid(&self, space: &AddressSpace) -> bool {
        self.pages
            .iter()
            .all(|&(page, stamp)| space.code_stamp(page, 1).ok() == Some(stamp))
    }
}

enum Slot {
    Compiled(Arc<Block>),
    /// Nothing compilable starts here; retried when the entry page changes.
    Rejected(CodeStamp),
}

pub(crate) struct BlockTranslator {
    threshold: u32,
    max_len: usize,
    max_tracked: usize,
    heat: HashMap<u64, u32>,
    slots: HashMap<u64, Slot>,
    stats: TranslatorStats,
}

impl BlockTranslator {
    pub(crate) fn new(threshold: u32, max_len: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            max_len: max_len.max(1),
            max_tracked: MAX_TRACKED,
            heat: HashMap::new(),
            slots: HashMap::new(),
            stats: TranslatorStats::default(),
        }
    }

    pub(crate) fn stats(&self) -> TranslatorStats {
        self.stats
    }

    pub(crate) fn clear(&mut self) {
        self.heat.clear();
        self.slots.clear();
    }

    /// A valid block entered at `rip`, compiling one if the address just
    /// became hot.
    pub(crate) fn lookup(&mut self, space: &AddressSpace, rip: u64) -> Option<Arc<Block>> {
        match self.slots.get(&rip) {
            Some(Slot::Compiled(block)) => {
                if block.is_valid(space) {
                    self.stats.block_runs += 1;
                    return Some(block.clone());
                }
                self.invalidate(rip);
            }
            Some(Slot::Rejected(stamp)) => {
                if space.code_stamp(page_floor(rip), 1).ok() == Some(*stamp) {
                    return None;
                }
                self.slots.remove(&rip);
            }
            None => {}
        }

        if self.heat.len() >= self.max_tracked && !self.heat.contains_key(&rip) {
            self.heat.clear();
        }
        let heat = self.heat.entry(rip).or_insert(0);
        *heat += 1;
        if *heat < self.threshold {
            return None;
        }

        match compile(space, rip, self.max_len) {
            Some(block) => {
                let block = Arc::new(block);
                tracing::trace!(entry = rip, len = block.ops.len(), "compiled block");
                self.stats.blocks_compiled += 1;
                self.stats.block_runs += 1;
                self.insert_slot(rip, Slot::Compiled(block.clone()));
                Some(block)
            }
            None => {
                if let Ok(stamp) = space.code_stamp(page_floor(rip), 1) {
                    self.insert_slot(rip, Slot::Rejected(stamp));
                }
                None
            }
        }
    }

    fn insert_slot(&mut self, rip: u64, slot: Slot) {
        self.heat.remove(&rip);
        if self.slots.len() >= self.max_tracked && !self.slots.contains_key(&rip) {
            let victim = self.slots.keys().next().copied();
            if let Some(victim) = victim {
                self.slots.remove(&victim);
                self.stats.evictions += 1;
            }
        }
        self.slots.insert(rip, slot);
    }

    pub(crate) fn invalidate(&mut self, entry: u64) {
        if self.slots.remove(&entry).is_some() {
            tracing::trace!(entry, "block invalidated");
            self.stats.invalidations += 1;
            self.heat.remove(&entry);
        }
    }

    pub(crate) fn note_retired(&mut self, count: u64) {
        self.stats.block_instructions += count;
    }
}

/// Decode the straight-line run at `entry`. Stops before anything the
/// interpreter would reject and after the first control-flow instruction.
fn compile(space: &AddressSpace, entry: u64, max_len: usize) -> Option<Block> {
    let mut ops = Vec::new();
    let mut pages: Vec<(u64, CodeStamp)> = Vec::new();
    let mut rip = entry;

    while ops.len() < max_len {
        let mut window = [0u8; MAX_INSTRUCTION_LEN];
        let Ok(fetched) = space.fetch_code(rip, &mut window) else {
            break;
        };
        let Ok(inst) = decode(&window[..fetched.len], rip, DecodeMode::Bits64) else {
            break;
        };
        if inst.prefixes().lock {
            break;
        }
        let Ok(handler) = interp::resolve(&inst) else {
            break;
        };

        let first = page_floor(rip);
        let last = page_floor(rip.wrapping_add(inst.len() as u64 - 1));
        for page in [first, last] {
            if pages.iter().any(|&(p, _)| p == page) {
                continue;
            }
            let Ok(stamp) = space.code_stamp(page, 1) else {
                return None;
            };
            pages.push((page, stamp));
        }

        let ends_block = inst.flow_control() != FlowControl::Next;
        rip = inst.next_ip();
        ops.push(CompiledOp { inst, handler });
        if ends_block || rip.wrapping_sub(entry) > 16 * PAGE_SIZE {
            break;
        }
    }

    if ops.is_empty() {
        return None;
    }
    Some(Block { entry, ops, pages })
}

#[cfg(test)]
mod tests {
    use super::*;
    use xemu_mem::{Backing, Permissions};

    const CODE: u64 = 0x40_0000;

    #[test]
    fn tracking_stays_bounded() {
        // A page of `ret`s: every byte is a one-instruction block.
        let space = AddressSpace::new();
        space
            .map(CODE, PAGE_SIZE, Permissions::RX, Backing::Anonymous)
            .unwrap();
        space
            .write_unchecked(CODE, &[0xC3; PAGE_SIZE as usize])
            .unwrap();

        let mut translator = BlockTranslator::new(2, 8);
        translator.max_tracked = 16;
        for rip in CODE..CODE + 64 {
            assert!(translator.lookup(&space, rip).is_none());
            assert!(translator.heat.len() <= 16);
        }
        for rip in CODE..CODE + 64 {
            translator.lookup(&space, rip);
            translator.lookup(&space, rip);
            assert!(translator.slots.len() <= 16);
            assert!(translator.heat.len() <= 16);
        }
        let stats = translator.stats();
        assert!(stats.blocks_compiled >= 64);
        assert_eq!(stats.evictions, stats.blocks_compiled - 16);
        assert!(translator.lookup(&space, CODE + 63).is_some());
    }
}
