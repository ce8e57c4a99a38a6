//! Memory core of a managed VM: a generational heap with a semi-space scavenger for the young
//! generation, a tri-color marker and sweeper for the old generation, an incremental compactor
//! that evacuates sparse old pages, and an explicit identity-forwarding facility ([`Become`]).
//!
//! A [`Heap`] owns everything; there is no global state. Objects are referenced through
//! tagged [`ObjectPtr`] words and laid out according to [`ClassKind`].

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        }
    };
}

pub mod error;
pub mod globals;
pub mod header;
pub mod mmap;
pub mod object;
pub mod util;

pub mod freelist;
pub mod new_space;
pub mod old_space;
pub mod page;

pub mod handles;
pub mod marking_stack;
pub mod statistics;
pub mod store_buffer;
pub mod thread;
pub mod thread_pool;
pub mod weak;

pub mod compactor;
pub mod forwarding;
pub mod marker;
pub mod scavenger;
pub mod sweeper;
pub mod verifier;

pub mod r#become;
pub mod heap;

pub use crate::{
    compactor::{select_evacuation_candidates, CompactionStats, IncrementalCompactor, PageUsage},
    error::HeapError,
    handles::{FinalizableHandle, Finalizer, PersistentHandle},
    header::Header,
    heap::{GcPrologueCallback, GcReason, Heap},
    marker::MarkSweepStats,
    object::{ClassId, ClassKind, ClassTable, ObjectPtr},
    r#become::Become,
    statistics::{HeapStatistics, ScavengeStats},
    sweeper::SweepStats,
    thread::{Thread, ThreadId},
    weak::{WeakReferenceSet, WeakReferenceSetId, WeakSelector},
};

/// Configuration for heap constructor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Size of each of the two young semi-spaces.
    pub semi_space_size: usize,
    /// Old space grows up to this under normal operation.
    pub old_space_soft_limit: usize,
    /// Old space never grows past this, not even when promotion or compaction forces growth.
    pub old_space_hard_limit: usize,
    /// Parallel tasks used by the compactor, the forwarding pass and the sweeper. The last
    /// one runs on the calling thread.
    pub workers: usize,
    /// Tenure survivors early once at least this percentage of promotion candidates got
    /// promoted in the recent scavenges.
    pub early_tenuring_threshold: usize,
    /// Live bytes evacuated per compaction, as a fraction of the young generation capacity.
    pub compactor_budget_fraction: f64,
    pub object_id_ring_capacity: usize,
    /// Enables verbose printing
    pub verbose: bool,
    pub verify_before_gc: bool,
    pub verify_after_gc: bool,
    /// Overwrite from-space after each scavenge so stale references fail loudly.
    pub zap_from_space: bool,
}

impl Default for Config {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .clamp(1, 8);
        Self {
            semi_space_size: 2 * 1024 * 1024,
            old_space_soft_limit: 256 * 1024 * 1024,
            old_space_hard_limit: 1024 * 1024 * 1024,
            workers,
            early_tenuring_threshold: 66,
            compactor_budget_fraction: 0.5,
            object_id_ring_capacity: 1024,
            verbose: false,
            verify_before_gc: false,
            verify_after_gc: cfg!(debug_assertions),
            zap_from_space: cfg!(debug_assertions),
        }
    }
}

impl Config {
    pub fn with_semi_space_size(mut self, size: usize) -> Self {
        self.semi_space_size = size;
        self
    }

    pub fn with_old_space_limits(mut self, soft: usize, hard: usize) -> Self {
        self.old_space_soft_limit = soft.min(hard);
        self.old_space_hard_limit = hard;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_early_tenuring_threshold(mut self, percent: usize) -> Self {
        self.early_tenuring_threshold = percent;
        self
    }

    pub fn with_compactor_budget_fraction(mut self, fraction: f64) -> Self {
        self.compactor_budget_fraction = fraction;
        self
    }

    pub fn with_object_id_ring_capacity(mut self, capacity: usize) -> Self {
        self.object_id_ring_capacity = capacity;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_verification(mut self, before: bool, after: bool) -> Self {
        self.verify_before_gc = before;
        self.verify_after_gc = after;
        self
    }

    pub fn with_zap_from_space(mut self, zap: bool) -> Self {
        self.zap_from_space = zap;
        self
    }
}
