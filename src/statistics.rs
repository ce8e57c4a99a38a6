use std::collections::VecDeque;
use std::time::Duration;

use crate::util::formatted_size;

/// Outcome of one scavenge.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScavengeStats {
    /// Bytes below the survivor boundary when the scavenge started.
    pub promo_candidates: usize,
    /// Bytes promoted into old space.
    pub promoted: usize,
    /// Bytes copied within new space.
    pub copied: usize,
    /// Bytes that should have been promoted but stayed in new space.
    pub failed_to_promote: usize,
    pub used_before: usize,
    pub used_after: usize,
    pub duration: Duration,
}

impl ScavengeStats {
    /// What fraction of the promotion candidates survived and was promoted.
    pub fn promo_candidates_success_fraction(&self) -> f64 {
        if self.promo_candidates == 0 {
            0.0
        } else {
            self.promoted as f64 / self.promo_candidates as f64
        }
    }
}

/// The last two scavenges, newest first.
#[derive(Default)]
pub struct ScavengeHistory {
    entries: VecDeque<ScavengeStats>,
}

impl ScavengeHistory {
    const CAPACITY: usize = 2;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, stats: ScavengeStats) {
        if self.entries.len() == Self::CAPACITY {
            self.entries.pop_back();
        }
        self.entries.push_front(stats);
    }

    pub fn get(&self, index: usize) -> Option<&ScavengeStats> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the next scavenge should treat all survivors as promotion candidates. The
    /// previous cycle is given half the weight of the latest one.
    pub fn early_tenure(&self, threshold_percent: usize) -> bool {
        let latest = match self.get(0) {
            Some(stats) => stats.promo_candidates_success_fraction(),
            None => return false,
        };
        let average = match self.get(1) {
            Some(previous) => {
                (latest + 0.5 * previous.promo_candidates_success_fraction()) / 1.5
            }
            None => latest,
        };
        average >= threshold_percent as f64 / 100.0
    }
}

pub struct HeapStatistics {
    pub new_space_used: usize,
    pub new_space_capacity: usize,
    pub old_space_used: usize,
    pub old_space_capacity: usize,
    pub old_space_pages: usize,
    pub large_pages: usize,
    pub external_new: usize,
    pub external_old: usize,
    pub scavenges: usize,
    pub mark_sweeps: usize,
    pub compactions: usize,
    pub becomes: usize,
    pub total_objects_allocated: usize,
    pub total_memory_allocated: usize,
    pub early_tenure: bool,
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  New space: {} of {}{}",
            formatted_size(self.new_space_used),
            formatted_size(self.new_space_capacity),
            if self.early_tenure { " (early tenure)" } else { "" }
        )?;
        writeln!(
            f,
            "  Old space: {} of {} in {} pages",
            formatted_size(self.old_space_used),
            formatted_size(self.old_space_capacity),
            self.old_space_pages
        )?;
        writeln!(f, "  Large allocations: {}", self.large_pages)?;
        writeln!(
            f,
            "  External memory: {} new, {} old",
            formatted_size(self.external_new),
            formatted_size(self.external_old)
        )?;
        writeln!(
            f,
            "  GC cycles: {} scavenges, {} mark-sweeps, {} compactions, {} becomes",
            self.scavenges, self.mark_sweeps, self.compactions, self.becomes
        )?;
        writeln!(
            f,
            "  Total memory allocated: {}",
            formatted_size(self.total_memory_allocated)
        )?;
        write!(
            f,
            "  Total objects allocated: {}",
            self.total_objects_allocated
        )
    }
}
