//! Allocator configuration.
//!
//! Loaded from TOML. Every field has a default, so an empty file describes
//! a single 64MB coalescing region with sequential fallback.
//!
//! ```toml
//! [memory]
//! regions = 4
//! region_size = "64MB"
//! strategy = "slab"
//! slot_sizes = [64, 256, 1024, 4096]
//!
//! [policy]
//! kind = "round_robin"
//! max_allocations = 2
//! on_exhaustion = "error"
//!
//! [eviction]
//! expire_batch = 50
//! sweep_interval_ms = 1000
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::allocator::AllocatorKind;
use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Regions and placement strategy.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Region selection.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Expiration and LFU sweeps.
    #[serde(default)]
    pub eviction: EvictionConfig,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Region layout.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    /// Number of regions.
    #[serde(default = "default_regions")]
    pub regions: usize,

    /// Bytes per region. Accepts "64MB"-style strings.
    #[serde(default = "default_region_size", deserialize_with = "deserialize_size")]
    pub region_size: usize,

    /// Placement strategy: "bump", "coalescing" or "slab".
    #[serde(default)]
    pub strategy: AllocatorKind,

    /// Slot sizes for the slab strategy.
    #[serde(default = "default_slot_sizes")]
    pub slot_sizes: Vec<usize>,

    /// Segments per slab pool.
    #[serde(default = "default_slab_segments")]
    pub slab_segments: usize,

    /// Let an exhausted slab pool fall through to larger slot sizes.
    #[serde(default)]
    pub allow_larger_slab: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            regions: default_regions(),
            region_size: default_region_size(),
            strategy: AllocatorKind::default(),
            slot_sizes: default_slot_sizes(),
            slab_segments: default_slab_segments(),
            allow_larger_slab: false,
        }
    }
}

/// Which allocation policy the manager uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Stay on the active region, advance on failure.
    #[default]
    Sequential,
    /// Advance a shared cursor on every call.
    RoundRobin,
}

/// What the manager reports when every region is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnExhaustion {
    /// `Ok(None)`.
    #[default]
    ReturnNone,
    /// `Err(AllocError::OutOfSpace)`.
    Error,
}

/// Allocation policy settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// Policy kind.
    #[serde(default)]
    pub kind: PolicyKind,

    /// Attempts per call for the round-robin policy.
    #[serde(default = "default_max_allocations")]
    pub max_allocations: usize,

    /// Exhaustion reporting.
    #[serde(default)]
    pub on_exhaustion: OnExhaustion,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            kind: PolicyKind::default(),
            max_allocations: default_max_allocations(),
            on_exhaustion: OnExhaustion::default(),
        }
    }
}

/// Sweep settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvictionConfig {
    /// Pointers freed per region and per expiration kind in one sweep.
    #[serde(default = "default_expire_batch")]
    pub expire_batch: usize,

    /// Pointers freed per region in one LFU sweep. 0 means a tenth of the
    /// live pointers.
    #[serde(default)]
    pub lfu_batch: usize,

    /// Allocation errors tolerated before a region is in shortage.
    #[serde(default)]
    pub shortage_threshold: u64,

    /// Sweeper period in milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            expire_batch: default_expire_batch(),
            lfu_batch: 0,
            shortage_threshold: 0,
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl EvictionConfig {
    /// Sweeper period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable.
    #[default]
    Pretty,
    /// Single-line human readable.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "offheap_cache=debug".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps.
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the event target.
    #[serde(default = "default_true")]
    pub target: bool,

    /// Include thread names.
    #[serde(default)]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: true,
            thread_names: false,
        }
    }
}

fn default_regions() -> usize {
    1
}

fn default_region_size() -> usize {
    64 * 1024 * 1024 // 64MB
}

fn default_slot_sizes() -> Vec<usize> {
    vec![64, 256, 1024, 4096, 16384]
}

fn default_slab_segments() -> usize {
    1
}

fn default_max_allocations() -> usize {
    2
}

fn default_expire_batch() -> usize {
    50
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Deserialize a size string like "64MB" or a plain number into bytes.
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Parse a byte size such as "512", "4KB" or "64MiB".
///
/// Suffixes are case-insensitive and always binary, so "KB" and "KiB" both
/// mean 1024 bytes. Whitespace between the number and the suffix is allowed.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let digits = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (number, unit) = s.split_at(digits);
    if number.is_empty() {
        return Err(format!("size {s:?} does not start with a number"));
    }

    let shift = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        other => return Err(format!("unknown size suffix {other:?}")),
    };

    let number: usize = number
        .parse()
        .map_err(|e| format!("invalid size {s:?}: {e}"))?;
    number
        .checked_mul(1usize << shift)
        .ok_or_else(|| format!("size {s:?} does not fit in usize"))
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let memory = &self.memory;

        if memory.regions == 0 {
            return Err(ConfigError::Invalid("regions must be at least 1".into()));
        }

        if memory.region_size == 0 {
            return Err(ConfigError::Invalid("region_size must be greater than 0".into()));
        }

        if memory.region_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "region_size ({}) must not exceed {} bytes",
                memory.region_size,
                u32::MAX
            )));
        }

        if memory.strategy == AllocatorKind::Slab {
            if memory.slot_sizes.is_empty() {
                return Err(ConfigError::Invalid(
                    "slot_sizes must not be empty for the slab strategy".into(),
                ));
            }
            if memory.slot_sizes.contains(&0) {
                return Err(ConfigError::Invalid("slot sizes must be greater than 0".into()));
            }
            if memory.slab_segments == 0 {
                return Err(ConfigError::Invalid("slab_segments must be at least 1".into()));
            }
            let segment = memory.region_size / memory.slot_sizes.len() / memory.slab_segments;
            if let Some(&largest) = memory.slot_sizes.iter().max() {
                if largest > segment {
                    return Err(ConfigError::Invalid(format!(
                        "largest slot size ({largest}) must fit in a slab segment ({segment} bytes)"
                    )));
                }
            }
        }

        if self.policy.max_allocations == 0 {
            return Err(ConfigError::Invalid("max_allocations must be at least 1".into()));
        }

        if self.eviction.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval_ms must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}
