use thiserror::Error;
use xemu_cpu_core::CoreConfig;
use xemu_mem::VmmConfig;
use xemu_posix::DEFAULT_STACK_SIZE;

/// Instructions a guest thread runs between checks of the process-wide exit
/// flag.
pub const DEFAULT_BATCH_SIZE: u64 = 64 * 1024;

/// What happens to a thread whose fault nobody handles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Halt the faulting thread only; the rest of the process keeps running.
    #[default]
    Halt,
    /// End the whole process with status `128 + signal`, the way the Linux
    /// default disposition of SIGSEGV/SIGFPE/SIGILL/SIGTRAP does.
    KillProcess,
}

impl FaultPolicy {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "halt" => Some(Self::Halt),
            "kill" | "kill-process" => Some(Self::KillProcess),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatorConfig {
    pub core: CoreConfig,
    pub vmm: VmmConfig,
    pub batch_size: u64,
    /// Size of the main thread's stack mapping.
    pub stack_size: u64,
    pub fault_policy: FaultPolicy,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            vmm: VmmConfig::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            stack_size: DEFAULT_STACK_SIZE,
            fault_policy: FaultPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
}

impl EmulatorConfig {
    /// Defaults overridden by `XEMU_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`EmulatorConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(batch) = parse_u64(&lookup, "XEMU_BATCH_SIZE")? {
            if batch == 0 {
                return Err(ConfigError::InvalidEnv("XEMU_BATCH_SIZE"));
            }
            cfg.batch_size = batch;
        }
        if let Some(raw) = lookup("XEMU_HOT_THRESHOLD") {
            // "off" keeps everything on the interpreter.
            cfg.core.hot_threshold = match raw.trim() {
                "off" | "0" => None,
                value => Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| ConfigError::InvalidEnv("XEMU_HOT_THRESHOLD"))?,
                ),
            };
        }
        if let Some(entries) = parse_u64(&lookup, "XEMU_DECODE_CACHE")? {
            cfg.core.decode_cache_entries =
                usize::try_from(entries).map_err(|_| ConfigError::InvalidEnv("XEMU_DECODE_CACHE"))?;
        }
        if let Some(size) = parse_u64(&lookup, "XEMU_STACK_SIZE")? {
            if size == 0 {
                return Err(ConfigError::InvalidEnv("XEMU_STACK_SIZE"));
            }
            cfg.stack_size = size;
        }
        if let Some(raw) = lookup("XEMU_FAULT_POLICY") {
            cfg.fault_policy =
                FaultPolicy::parse(&raw).ok_or(ConfigError::InvalidEnv("XEMU_FAULT_POLICY"))?;
        }
        Ok(cfg)
    }
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse::<u64>(),
    };
    parsed.map(Some).map_err(|_| ConfigError::InvalidEnv(var))
}
