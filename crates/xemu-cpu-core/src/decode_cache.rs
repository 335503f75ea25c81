use xemu_decoder::InstructionDescriptor;
use xemu_mem::{AddressSpace, CodeStamp};

pub(crate) const DEFAULT_DECODE_CACHE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeCacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Lookups that found the address but whose code bytes had changed.
    pub stale: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    rip: u64,
    stamp: CodeStamp,
    decoded: InstructionDescriptor,
}

/// Direct-mapped memo of decoded instructions keyed by guest address.
///
/// An entry is only reused while the frames its bytes came from are
/// unchanged (same frame identity, same write version, still executable), so
/// stores into code, remaps and `mprotect` all invalidate it implicitly.
#[derive(Debug)]
pub(crate) struct DecodeCache {
    entries: Box<[Option<Entry>]>,
    stats: DecodeCacheStats,
}

impl DecodeCache {
    pub(crate) fn new(size: usize) -> Self {
        let size = size.max(1).next_power_of_two();
        Self {
            entries: vec![None; size].into_boxed_slice(),
            stats: DecodeCacheStats::default(),
        }
    }

    #[inline]
    fn index(&self, rip: u64) -> usize {
        let mut x = rip.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        x ^= x >> 33;
        x as usize & (self.entries.len() - 1)
    }

    /// Cached descriptor for `rip`, if its code bytes are provably unchanged.
    pub(crate) fn lookup(&mut self, space: &AddressSpace, rip: u64) -> Option<InstructionDescriptor> {
        let idx = self.index(rip);
        if let Some(hit) = &self.entries[idx] {
            if hit.rip == rip {
                if space.code_stamp(rip, hit.decoded.len()).ok() == Some(hit.stamp) {
                    self.stats.hits += 1;
                    return Some(hit.decoded.clone());
                }
                self.stats.stale += 1;
                self.entries[idx] = None;
            }
        }
        self.stats.misses += 1;
        None
    }

    pub(crate) fn insert(&mut self, rip: u64, stamp: CodeStamp, decoded: InstructionDescriptor) {
        let idx = self.index(rip);
        self.entries[idx] = Some(Entry {
            rip,
            stamp,
            decoded,
        });
    }

    pub(crate) fn clear(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = None);
    }

    pub(crate) fn stats(&self) -> DecodeCacheStats {
        self.stats
    }
}
