use crate::decode_cache::DEFAULT_DECODE_CACHE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreConfig {
    /// Decode-cache entries (rounded up to a power of two); 0 disables the cache.
    pub decode_cache_entries: usize,
    /// Executions of an address before the translator compiles a block there.
    /// `None` keeps every instruction on the interpreter.
    pub hot_threshold: Option<u32>,
    /// Upper bound on instructions per translated block.
    pub max_block_len: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            decode_cache_entries: DEFAULT_DECODE_CACHE_SIZE,
            hot_threshold: None,
            max_block_len: 64,
        }
    }
}

impl CoreConfig {
    /// Pure interpretation: no decode cache, no translation.
    pub fn interpreter_only() -> Self {
        Self {
            decode_cache_entries: 0,
            hot_threshold: None,
            ..Self::default()
        }
    }

    pub fn with_translator(mut self, hot_threshold: u32) -> Self {
        self.hot_threshold = Some(hot_threshold.max(1));
        self
    }
}
