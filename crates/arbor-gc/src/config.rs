//! Collector tuning knobs.
//!
//! Every constant that drives allocation routing or GC scheduling lives in
//! [`GcConfig`]. A config is validated once when the [`Collector`](crate::Collector)
//! is built and is immutable afterwards.

use std::time::Duration;

use crate::heap::NormalPage;

/// Allocation volume and growth rate that must both be exceeded before a
/// collection of a given kind is requested.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcThreshold {
    /// Bytes allocated since the last collection.
    pub allocated_bytes: usize,
    /// `(marked_bytes + allocated_bytes) / marked_bytes` of the last cycle.
    pub growing_rate: f64,
}

impl GcThreshold {
    /// Creates a threshold.
    #[must_use]
    pub const fn new(allocated_bytes: usize, growing_rate: f64) -> Self {
        Self {
            allocated_bytes,
            growing_rate,
        }
    }

    /// Returns `true` when both limits are exceeded.
    ///
    /// With nothing marked in the last cycle the growth rate is unbounded.
    #[must_use]
    pub fn is_exceeded(&self, allocated_since_last_gc: usize, marked_bytes: usize) -> bool {
        if allocated_since_last_gc < self.allocated_bytes {
            return false;
        }
        if marked_bytes == 0 {
            return true;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = (marked_bytes + allocated_since_last_gc) as f64 / marked_bytes as f64;
        rate >= self.growing_rate
    }
}

/// Configuration of a [`Collector`](crate::Collector).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use arbor_gc::GcConfig;
///
/// let config = GcConfig::default()
///     .with_large_object_threshold(32 * 1024)
///     .with_park_timeout(Duration::from_millis(50));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct GcConfig {
    /// Requested sizes at or above this go to the large-object arena.
    pub large_object_threshold: usize,
    /// Promptly freed bytes an arena accumulates before the allocator
    /// bothers to coalesce them back into its free list.
    pub promptly_freed_coalesce_threshold: usize,
    /// How long `park_others` waits for the other threads to reach a safepoint.
    pub park_timeout: Duration,
    /// Threshold for scheduling an idle-time collection.
    pub idle_gc_threshold: GcThreshold,
    /// Threshold for scheduling a precise collection at the next safepoint.
    pub precise_gc_threshold: GcThreshold,
    /// Threshold above which a conservative collection runs immediately.
    pub conservative_gc_threshold: GcThreshold,
    /// Upper bound on rounds performed by `collect_all_garbage`.
    pub collect_all_rounds: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            large_object_threshold: 64 * 1024,
            promptly_freed_coalesce_threshold: 1024 * 1024,
            park_timeout: Duration::from_millis(100),
            idle_gc_threshold: GcThreshold::new(1024 * 1024, 1.5),
            precise_gc_threshold: GcThreshold::new(1024 * 1024, 1.5),
            conservative_gc_threshold: GcThreshold::new(32 * 1024 * 1024, 5.0),
            collect_all_rounds: 5,
        }
    }
}

impl GcConfig {
    /// Sets the large-object threshold.
    #[must_use]
    pub const fn with_large_object_threshold(mut self, bytes: usize) -> Self {
        self.large_object_threshold = bytes;
        self
    }

    /// Sets the promptly-freed coalescing threshold.
    #[must_use]
    pub const fn with_promptly_freed_coalesce_threshold(mut self, bytes: usize) -> Self {
        self.promptly_freed_coalesce_threshold = bytes;
        self
    }

    /// Sets the park timeout.
    #[must_use]
    pub const fn with_park_timeout(mut self, timeout: Duration) -> Self {
        self.park_timeout = timeout;
        self
    }

    /// Sets the idle collection threshold.
    #[must_use]
    pub const fn with_idle_gc_threshold(mut self, threshold: GcThreshold) -> Self {
        self.idle_gc_threshold = threshold;
        self
    }

    /// Sets the precise collection threshold.
    #[must_use]
    pub const fn with_precise_gc_threshold(mut self, threshold: GcThreshold) -> Self {
        self.precise_gc_threshold = threshold;
        self
    }

    /// Sets the conservative collection threshold.
    #[must_use]
    pub const fn with_conservative_gc_threshold(mut self, threshold: GcThreshold) -> Self {
        self.conservative_gc_threshold = threshold;
        self
    }

    /// Sets the round limit of `collect_all_garbage`.
    #[must_use]
    pub const fn with_collect_all_rounds(mut self, rounds: usize) -> Self {
        self.collect_all_rounds = rounds;
        self
    }

    /// Disables heuristic scheduling entirely. Useful for deterministic tests.
    #[must_use]
    pub const fn without_heuristics(mut self) -> Self {
        let never = GcThreshold::new(usize::MAX, f64::INFINITY);
        self.idle_gc_threshold = never;
        self.precise_gc_threshold = never;
        self.conservative_gc_threshold = never;
        self
    }

    /// Checks the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated constraint.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.large_object_threshold == 0 {
            return Err("large_object_threshold must be > 0");
        }
        if self.large_object_threshold > NormalPage::max_payload_size() + 1 {
            return Err("large_object_threshold must leave every smaller object room in a normal page");
        }
        if self.park_timeout.is_zero() {
            return Err("park_timeout must be > 0");
        }
        for threshold in [
            &self.idle_gc_threshold,
            &self.precise_gc_threshold,
            &self.conservative_gc_threshold,
        ] {
            if threshold.growing_rate.is_nan() || threshold.growing_rate < 1.0 {
                return Err("growing rates must be >= 1.0");
            }
        }
        if self.collect_all_rounds == 0 {
            return Err("collect_all_rounds must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(GcConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_oversized_threshold() {
        let config = GcConfig::default().with_large_object_threshold(1 << 30);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_rounds() {
        let config = GcConfig::default().with_collect_all_rounds(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_requires_floor_and_growth() {
        let threshold = GcThreshold::new(1000, 1.5);
        assert!(!threshold.is_exceeded(999, 0));
        assert!(threshold.is_exceeded(1000, 0));
        // 1000 allocated on top of 4000 marked is a 1.25x growth.
        assert!(!threshold.is_exceeded(1000, 4000));
        assert!(threshold.is_exceeded(2000, 4000));
    }

    #[test]
    fn test_without_heuristics_never_fires() {
        let config = GcConfig::default().without_heuristics();
        assert!(config.validate().is_ok());
        assert!(!config.precise_gc_threshold.is_exceeded(usize::MAX - 1, 1));
    }
}
