//! Batch window arithmetic.

use crate::job::BatchedJob;
use crate::migration::BatchedMigration;
use serde::{Deserialize, Serialize};

/// An inclusive range of the batching column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchWindow {
    /// Inclusive lower bound.
    pub min_value: i64,
    /// Inclusive upper bound.
    pub max_value: i64,
}

impl BatchWindow {
    /// Creates a window covering `min_value..=max_value`.
    pub fn new(min_value: i64, max_value: i64) -> Self {
        Self {
            min_value,
            max_value,
        }
    }

    /// Number of column values covered.
    pub fn len(&self) -> i64 {
        self.max_value
            .saturating_sub(self.min_value)
            .saturating_add(1)
            .max(0)
    }

    /// Whether `value` lies inside the window.
    pub fn contains(&self, value: i64) -> bool {
        value >= self.min_value && value <= self.max_value
    }

    /// Whether the window covers no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits the window into consecutive chunks of at most `sub_batch_size` values.
    pub fn sub_batches(&self, sub_batch_size: i64) -> SubBatches {
        SubBatches {
            next_min: (!self.is_empty()).then_some(self.min_value),
            max_value: self.max_value,
            size: sub_batch_size.max(1),
        }
    }
}

/// Iterator over the sub-batches of a [`BatchWindow`].
#[derive(Debug, Clone)]
pub struct SubBatches {
    next_min: Option<i64>,
    max_value: i64,
    size: i64,
}

impl Iterator for SubBatches {
    type Item = BatchWindow;

    fn next(&mut self) -> Option<Self::Item> {
        let min = self.next_min?;
        let max = min.saturating_add(self.size - 1).min(self.max_value);
        self.next_min = if max >= self.max_value {
            None
        } else {
            Some(max + 1)
        };
        Some(BatchWindow::new(min, max))
    }
}

/// Computes the next window of a migration from the one before it.
///
/// Windows are contiguous: each one starts right after the previous one ends. A window
/// normally spans `batch_size` values. When the next populated value lies further ahead, the
/// gap up to it becomes a window of its own, so a wide range without rows is covered by a
/// single job.
pub struct BatchBoundaryCalculator;

impl BatchBoundaryCalculator {
    /// Where the window following `previous` starts, or `None` when the migration's range is
    /// exhausted.
    pub fn next_start(migration: &BatchedMigration, previous: Option<&BatchedJob>) -> Option<i64> {
        Self::start_after(
            migration.min_value,
            migration.max_value,
            previous.map(|job| job.max_value),
        )
    }

    /// The value right after `previous_max`, or `min_value` for the first window.
    pub fn start_after(min_value: i64, max_value: i64, previous_max: Option<i64>) -> Option<i64> {
        let start = match previous_max {
            Some(previous) => previous.checked_add(1)?.max(min_value),
            None => min_value,
        };
        (start <= max_value).then_some(start)
    }

    /// The window starting at `start`.
    ///
    /// `first_value` is the lowest value of the column at or after `start`. Values before it
    /// hold no rows and form the window on their own. Without a value left in range the
    /// window runs to `max_value`.
    pub fn window_at(
        start: i64,
        max_value: i64,
        batch_size: i64,
        first_value: Option<i64>,
    ) -> BatchWindow {
        match first_value.filter(|value| *value <= max_value) {
            Some(value) if value > start => BatchWindow::new(start, value - 1),
            Some(_) => BatchWindow::new(
                start,
                start.saturating_add(batch_size.max(1) - 1).min(max_value),
            ),
            None => BatchWindow::new(start, max_value),
        }
    }

    /// The window of `batch_size` values starting right after `previous_max`,
    /// or at `min_value` for the first batch, clipped to `max_value`.
    pub fn next_window(
        min_value: i64,
        max_value: i64,
        batch_size: i64,
        previous_max: Option<i64>,
    ) -> Option<BatchWindow> {
        let start = Self::start_after(min_value, max_value, previous_max)?;
        Some(Self::window_at(start, max_value, batch_size, Some(start)))
    }
}
