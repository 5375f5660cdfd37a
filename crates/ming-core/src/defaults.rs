//! Default constants for heap configuration.
//!
//! Centralizes the numbers shared by [`GcConfig`](crate::GcConfig), the
//! cell allocator, the buffer allocator and the thread registry.

/// Allocated bytes below which no collection is ever triggered (128 KiB).
pub const DEFAULT_GC_TRIGGER_BYTES: usize = 128 * 1024;

/// Growth over the post-collection baseline that triggers a collection, in percent.
pub const DEFAULT_GC_GROWTH_PERCENT: usize = 50;

/// Default gray stack capacity in entries.
pub const DEFAULT_GRAY_STACK_CAPACITY: usize = 256;

/// Default size of one small-buffer arena (64 KiB).
pub const DEFAULT_BUFFER_ARENA_SIZE: usize = 64 * 1024;

/// Buffers of at least this size get their own mapping (16 KiB).
pub const DEFAULT_BIG_BUFFER_THRESHOLD: usize = 16 * 1024;

/// Minimum number of slots in a thread's new-born stack.
pub const MIN_NEWBORN_STACK: usize = 32;

/// Page size assumed when the OS cannot be asked.
pub const FALLBACK_PAGE_SIZE: usize = 4096;

/// Environment variable overriding the trigger threshold.
pub const ENV_TRIGGER_BYTES: &str = "MING_GC_TRIGGER_BYTES";

/// Environment variable overriding the cell pool size.
pub const ENV_POOL_SIZE: &str = "MING_GC_POOL_SIZE";

/// Environment variable overriding the gray stack capacity.
pub const ENV_GRAY_STACK: &str = "MING_GC_GRAY_STACK";

/// Environment variable enabling incremental allocation-triggered collection.
pub const ENV_INCREMENTAL: &str = "MING_GC_INCREMENTAL";
