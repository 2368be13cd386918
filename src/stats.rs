//! Per-job counters, aggregated by the scheduler across jobs.

use std::fmt;
use std::ops::{Add, AddAssign};

/// Outcome counters for one backup or restore job.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Items created or updated.
    pub changes: u64,
    /// Items removed because they were deleted upstream.
    pub deletes: u64,
    /// Archived folder subtrees removed during reconciliation.
    pub pruned: u64,
    /// Items or folders skipped after a recoverable failure.
    pub errors: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of item operations performed.
    pub fn total(&self) -> u64 {
        self.changes + self.deletes
    }
}

impl Add for Stats {
    type Output = Stats;

    fn add(self, other: Stats) -> Stats {
        Stats {
            changes: self.changes + other.changes,
            deletes: self.deletes + other.deletes,
            pruned: self.pruned + other.pruned,
            errors: self.errors + other.errors,
        }
    }
}

impl AddAssign for Stats {
    fn add_assign(&mut self, other: Stats) {
        *self = *self + other;
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} changes, {} deletes, {} pruned folders, {} errors",
            self.changes, self.deletes, self.pruned, self.errors
        )
    }
}
