//! Heap configuration
//!
//! Settings are read once when a [`Heap`](crate::Heap) is built. They come
//! from [`GcConfig::default`], builder-style setters, or environment
//! variables through [`GcConfig::from_env`].

use crate::defaults::*;
use crate::gc::mmap;
use crate::{GcError, GcResult};

/// Configuration for the garbage collector and allocators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcConfig {
    /// Allocated bytes below which no collection is triggered (default: 128 KiB)
    pub trigger_bytes: usize,
    /// Growth over the last post-collection size that triggers a collection (default: 50)
    pub growth_percent: usize,
    /// Size of one cell pool; a power of two, at least one page (default: one page)
    pub pool_size: usize,
    /// Gray stack capacity in entries (default: 256)
    pub gray_stack_capacity: usize,
    /// Allocation-triggered collections run one incremental step (default: false)
    pub incremental_trigger: bool,
    /// Size of one small-buffer arena (default: 64 KiB)
    pub buffer_arena_size: usize,
    /// Buffers at or above this size get a dedicated mapping (default: 16 KiB)
    pub big_buffer_threshold: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            trigger_bytes: DEFAULT_GC_TRIGGER_BYTES,
            growth_percent: DEFAULT_GC_GROWTH_PERCENT,
            pool_size: mmap::page_size(),
            gray_stack_capacity: DEFAULT_GRAY_STACK_CAPACITY,
            incremental_trigger: false,
            buffer_arena_size: DEFAULT_BUFFER_ARENA_SIZE,
            big_buffer_threshold: DEFAULT_BIG_BUFFER_THRESHOLD,
        }
    }
}

impl GcConfig {
    /// Read overrides from the process environment
    pub fn from_env() -> GcResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through an arbitrary key lookup
    ///
    /// Unparsable values are logged and ignored. The result is validated.
    pub fn from_lookup<F>(lookup: F) -> GcResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(n) = read_number(&lookup, ENV_TRIGGER_BYTES) {
            config.trigger_bytes = n;
        }
        if let Some(n) = read_number(&lookup, ENV_POOL_SIZE) {
            config.pool_size = n;
        }
        if let Some(n) = read_number(&lookup, ENV_GRAY_STACK) {
            config.gray_stack_capacity = n;
        }
        if let Some(n) = read_number(&lookup, ENV_INCREMENTAL) {
            config.incremental_trigger = n != 0;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the trigger threshold
    pub fn trigger_bytes(mut self, bytes: usize) -> Self {
        self.trigger_bytes = bytes;
        self
    }

    /// Set the growth percentage
    pub fn growth_percent(mut self, percent: usize) -> Self {
        self.growth_percent = percent;
        self
    }

    /// Set the cell pool size
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the gray stack capacity
    pub fn gray_stack_capacity(mut self, entries: usize) -> Self {
        self.gray_stack_capacity = entries;
        self
    }

    /// Make allocation-triggered collections incremental
    pub fn incremental_trigger(mut self, incremental: bool) -> Self {
        self.incremental_trigger = incremental;
        self
    }

    /// Set the small-buffer arena size and big-buffer threshold
    pub fn buffer_sizes(mut self, arena_size: usize, big_threshold: usize) -> Self {
        self.buffer_arena_size = arena_size;
        self.big_buffer_threshold = big_threshold;
        self
    }

    /// Check the configuration for values the allocators cannot use
    pub fn validate(&self) -> GcResult<()> {
        let page = mmap::page_size();

        if !self.pool_size.is_power_of_two() {
            return Err(GcError::InvalidConfig(format!(
                "pool size {} is not a power of two",
                self.pool_size
            )));
        }
        if self.pool_size < page {
            return Err(GcError::InvalidConfig(format!(
                "pool size {} is smaller than a page ({})",
                self.pool_size, page
            )));
        }
        if self.gray_stack_capacity == 0 {
            return Err(GcError::InvalidConfig(
                "gray stack capacity must be positive".to_string(),
            ));
        }
        if self.buffer_arena_size == 0 || self.big_buffer_threshold >= self.buffer_arena_size {
            return Err(GcError::InvalidConfig(format!(
                "big buffer threshold {} must be below the arena size {}",
                self.big_buffer_threshold, self.buffer_arena_size
            )));
        }
        Ok(())
    }
}

fn read_number<F>(lookup: &F, key: &str) -> Option<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match parse_number(raw.trim()) {
        Some(n) => Some(n),
        None => {
            tracing::warn!(target: "ming::gc", key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number
fn parse_number(s: &str) -> Option<usize> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: FxHashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = GcConfig::default();
        assert_eq!(config.trigger_bytes, 128 * 1024);
        assert_eq!(config.growth_percent, 50);
        assert_eq!(config.pool_size, mmap::page_size());
        assert_eq!(config.gray_stack_capacity, 256);
        assert!(!config.incremental_trigger);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("4096"), Some(4096));
        assert_eq!(parse_number("0x2000"), Some(0x2000));
        assert_eq!(parse_number("0X10"), Some(16));
        assert_eq!(parse_number("ten"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let pool = mmap::page_size() * 4;
        let pool_str = format!("{:#x}", pool);
        let config = GcConfig::from_lookup(lookup_from(&[
            (ENV_TRIGGER_BYTES, "1000"),
            (ENV_POOL_SIZE, &pool_str),
            (ENV_GRAY_STACK, "16"),
            (ENV_INCREMENTAL, "1"),
        ]))
        .unwrap();

        assert_eq!(config.trigger_bytes, 1000);
        assert_eq!(config.pool_size, pool);
        assert_eq!(config.gray_stack_capacity, 16);
        assert!(config.incremental_trigger);
    }

    #[test]
    fn test_from_lookup_ignores_garbage() {
        let config = GcConfig::from_lookup(lookup_from(&[(ENV_TRIGGER_BYTES, "lots")])).unwrap();
        assert_eq!(config.trigger_bytes, DEFAULT_GC_TRIGGER_BYTES);
    }

    #[test]
    fn test_rejects_non_power_of_two_pool() {
        let size = mmap::page_size() * 3;
        let result = GcConfig::from_lookup(lookup_from(&[(ENV_POOL_SIZE, &size.to_string())]));
        assert!(matches!(result, Err(GcError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_sub_page_pool() {
        let config = GcConfig::default().pool_size(mmap::page_size() / 2);
        assert!(matches!(config.validate(), Err(GcError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_gray_stack() {
        let config = GcConfig::default().gray_stack_capacity(0);
        assert!(matches!(config.validate(), Err(GcError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_big_threshold_above_arena() {
        let config = GcConfig::default().buffer_sizes(4096, 8192);
        assert!(config.validate().is_err());
    }
}
