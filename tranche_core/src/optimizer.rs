//! Adaptive batch sizing.

use crate::config::BatchOptimizerConfig;
use crate::migration::BatchedMigration;
use std::time::Duration;

/// Adjusts a migration's batch size from the duration of its last batch.
#[derive(Debug, Clone)]
pub struct BatchOptimizer<'a> {
    config: &'a BatchOptimizerConfig,
}

impl<'a> BatchOptimizer<'a> {
    /// Creates an optimizer applying `config`.
    pub fn new(config: &'a BatchOptimizerConfig) -> Self {
        Self { config }
    }

    /// The batch size the next window should use, when it differs from the current one.
    ///
    /// Returns `None` for migrations without a `max_batch_size`, or when the duration falls
    /// between the growth and shrink thresholds. The result stays within
    /// `sub_batch_size..=max_batch_size`.
    pub fn optimize(&self, migration: &BatchedMigration, duration: Duration) -> Option<i64> {
        let max_batch_size = migration.max_batch_size?;
        if migration.interval.is_zero() {
            return None;
        }

        let ratio = duration.as_secs_f64() / migration.interval.as_secs_f64();
        let current = migration.batch_size as f64;
        let proposed = if ratio <= self.config.growth_threshold {
            current * self.config.growth_factor
        } else if ratio > self.config.shrink_threshold {
            current * self.config.shrink_factor
        } else {
            return None;
        };

        let floor = migration.sub_batch_size.max(1);
        let ceiling = max_batch_size.max(floor);
        let next = (proposed.round() as i64).clamp(floor, ceiling);
        (next != migration.batch_size).then_some(next)
    }
}
