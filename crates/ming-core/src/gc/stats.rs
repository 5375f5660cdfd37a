//! Collection statistics

use std::time::Duration;

/// Garbage collector statistics
#[derive(Debug, Clone)]
pub struct GcStats {
    /// Total number of completed collection cycles
    pub collections: usize,

    /// Total number of collector steps (one per stop-the-world pause)
    pub steps: usize,

    /// Total objects freed
    pub objects_freed: usize,

    /// Total bytes freed
    pub bytes_freed: usize,

    /// Total pause time across all collections
    pub total_pause_time: Duration,

    /// Pause time of the last completed cycle (sum of its steps)
    pub last_pause_time: Duration,

    /// Average pause time per cycle
    pub avg_pause_time: Duration,

    /// Maximum pause time of a cycle
    pub max_pause_time: Duration,

    /// Minimum pause time of a cycle
    pub min_pause_time: Duration,

    /// Objects marked in last collection
    pub last_marked_count: usize,

    /// Objects freed in last collection
    pub last_freed_count: usize,

    /// Bytes freed in last collection
    pub last_freed_bytes: usize,

    /// Live objects after last collection
    pub live_objects: usize,

    /// Live bytes after last collection
    pub live_bytes: usize,

    /// Full bitmap rescans caused by gray stack overflow
    pub gray_rescans: usize,

    /// Empty pools returned to the OS
    pub pools_unmapped: usize,

    cycle_pause: Duration,
}

impl Default for GcStats {
    fn default() -> Self {
        Self {
            collections: 0,
            steps: 0,
            objects_freed: 0,
            bytes_freed: 0,
            total_pause_time: Duration::ZERO,
            last_pause_time: Duration::ZERO,
            avg_pause_time: Duration::ZERO,
            max_pause_time: Duration::ZERO,
            min_pause_time: Duration::ZERO,
            last_marked_count: 0,
            last_freed_count: 0,
            last_freed_bytes: 0,
            live_objects: 0,
            live_bytes: 0,
            gray_rescans: 0,
            pools_unmapped: 0,
            cycle_pause: Duration::ZERO,
        }
    }
}

impl GcStats {
    /// Record one collector step
    pub(crate) fn record_step(&mut self, pause: Duration) {
        self.steps += 1;
        self.cycle_pause += pause;
    }

    /// Update statistics after a completed cycle
    pub(crate) fn update(
        &mut self,
        marked: usize,
        freed: usize,
        freed_bytes: usize,
        live_objects: usize,
        live_bytes: usize,
    ) {
        let pause_time = std::mem::take(&mut self.cycle_pause);

        self.collections += 1;
        self.objects_freed += freed;
        self.bytes_freed += freed_bytes;
        self.total_pause_time += pause_time;
        self.last_pause_time = pause_time;

        self.avg_pause_time = self.total_pause_time / self.collections as u32;

        if pause_time > self.max_pause_time {
            self.max_pause_time = pause_time;
        }
        if self.collections == 1 || pause_time < self.min_pause_time {
            self.min_pause_time = pause_time;
        }

        self.last_marked_count = marked;
        self.last_freed_count = freed;
        self.last_freed_bytes = freed_bytes;
        self.live_objects = live_objects;
        self.live_bytes = live_bytes;
    }

    /// Get survival rate (0.0 to 1.0)
    pub fn survival_rate(&self) -> f64 {
        let seen = self.live_objects + self.last_freed_count;
        if seen == 0 {
            return 0.0;
        }
        self.live_objects as f64 / seen as f64
    }
}

/// Snapshot of heap occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes held by allocated cells
    pub allocated_bytes: usize,
    /// Cell bytes after the last collection (the trigger baseline)
    pub baseline_bytes: usize,
    /// Allocated cells
    pub live_cells: usize,
    /// Mapped cell pools
    pub pool_count: usize,
    /// Bytes handed out by the buffer allocator
    pub buffer_bytes: usize,
    /// Bytes mapped by the buffer allocator
    pub buffer_mapped_bytes: usize,
    /// Distinct explicit roots
    pub root_count: usize,
    /// Attached threads
    pub thread_count: usize,
    /// Attached threads currently paused or outside the runtime
    pub paused_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_update() {
        let mut stats = GcStats::default();
        stats.record_step(Duration::from_millis(2));
        stats.record_step(Duration::from_millis(3));
        stats.update(10, 4, 256, 10, 640);

        assert_eq!(stats.collections, 1);
        assert_eq!(stats.steps, 2);
        assert_eq!(stats.last_pause_time, Duration::from_millis(5));
        assert_eq!(stats.min_pause_time, Duration::from_millis(5));
        assert_eq!(stats.objects_freed, 4);
        assert_eq!(stats.bytes_freed, 256);

        stats.record_step(Duration::from_millis(1));
        stats.update(5, 0, 0, 10, 640);
        assert_eq!(stats.collections, 2);
        assert_eq!(stats.min_pause_time, Duration::from_millis(1));
        assert_eq!(stats.max_pause_time, Duration::from_millis(5));
        assert_eq!(stats.avg_pause_time, Duration::from_millis(3));
    }

    #[test]
    fn test_survival_rate() {
        let mut stats = GcStats::default();
        assert_eq!(stats.survival_rate(), 0.0);
        stats.update(3, 1, 8, 3, 24);
        assert_eq!(stats.survival_rate(), 0.75);
    }
}
