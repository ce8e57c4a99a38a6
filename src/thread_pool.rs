//! Worker tasks for the stop-the-world parallel phases.
//!
//! A phase runs `N` copies of the same task: `N - 1` on scoped helper threads and the last one
//! inline on the thread that requested the collection. Tasks split work by claiming units
//! from shared atomic cursors and rendezvous at [`ThreadBarrier::sync`] points.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

struct BarrierState {
    participants: usize,
    arrived: usize,
    generation: usize,
    closed: bool,
    poisoned: bool,
}

/// Unwind payload used to wake tasks blocked on a barrier after another task failed.
struct BarrierPoisoned;

/// Rendezvous for a dynamic set of worker tasks.
///
/// Tasks join with [`try_enter`](Self::try_enter) until the first task reaches a
/// [`sync`](BarrierParticipant::sync) point; a task that arrives later finds the barrier
/// closed and skips the phase. Work is claimed through cursors, so the tasks that did enter
/// finish everything.
pub struct ThreadBarrier {
    state: Mutex<BarrierState>,
    condvar: Condvar,
}

impl ThreadBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState {
                participants: 0,
                arrived: 0,
                generation: 0,
                closed: false,
                poisoned: false,
            }),
            condvar: Condvar::new(),
        }
    }

    pub fn try_enter(&self) -> Option<BarrierParticipant<'_>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.participants += 1;
        Some(BarrierParticipant { barrier: self })
    }

    fn sync(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        if state.poisoned {
            drop(state);
            panic::resume_unwind(Box::new(BarrierPoisoned));
        }
        state.arrived += 1;
        if state.arrived == state.participants {
            state.arrived = 0;
            state.generation += 1;
            self.condvar.notify_all();
            return;
        }
        let generation = state.generation;
        while state.generation == generation && !state.poisoned {
            self.condvar.wait(&mut state);
        }
        if state.poisoned {
            drop(state);
            panic::resume_unwind(Box::new(BarrierPoisoned));
        }
    }

    fn release(&self, failed: bool) {
        let mut state = self.state.lock();
        state.participants -= 1;
        if failed {
            state.poisoned = true;
            self.condvar.notify_all();
        } else if state.arrived > 0 && state.arrived == state.participants {
            state.arrived = 0;
            state.generation += 1;
            self.condvar.notify_all();
        }
    }
}

impl Default for ThreadBarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// Membership of one task in a [`ThreadBarrier`]. Dropping it releases the task.
pub struct BarrierParticipant<'a> {
    barrier: &'a ThreadBarrier,
}

impl BarrierParticipant<'_> {
    /// Blocks until every entered task has reached this point.
    pub fn sync(&self) {
        self.barrier.sync();
    }
}

impl Drop for BarrierParticipant<'_> {
    fn drop(&mut self) {
        self.barrier.release(std::thread::panicking());
    }
}

/// Shared fetch-and-add cursor over `0..len` work units.
pub struct WorkCursor {
    next: CachePadded<AtomicUsize>,
    len: usize,
}

impl WorkCursor {
    pub fn new(len: usize) -> Self {
        Self {
            next: CachePadded::new(AtomicUsize::new(0)),
            len,
        }
    }

    #[inline]
    pub fn claim(&self) -> Option<usize> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        if index < self.len {
            Some(index)
        } else {
            None
        }
    }

    /// Claims one unit at a time and passes it to `f` until the cursor is exhausted.
    pub fn for_each(&self, mut f: impl FnMut(usize)) {
        while let Some(index) = self.claim() {
            f(index);
        }
    }
}

/// Runs `task(0..num_tasks)`: all but one on scoped helper threads, one inline.
///
/// If any task panics the first real panic is resumed on the caller once every task has
/// finished.
pub fn run_parallel<F>(num_tasks: usize, task: F)
where
    F: Fn(usize) + Sync,
{
    let num_tasks = num_tasks.max(1);
    if num_tasks == 1 {
        task(0);
        return;
    }
    let task = &task;
    let result = crossbeam_utils::thread::scope(|scope| {
        let helpers: Vec<_> = (1..num_tasks)
            .map(|id| scope.spawn(move |_| task(id)))
            .collect();
        let mut panics: Vec<Box<dyn Any + Send>> = Vec::new();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task(0))) {
            panics.push(payload);
        }
        for helper in helpers {
            if let Err(payload) = helper.join() {
                panics.push(payload);
            }
        }
        panics
    });
    let panics = match result {
        Ok(panics) => panics,
        Err(payload) => vec![payload],
    };
    let mut poisoned = None;
    for payload in panics {
        if payload.is::<BarrierPoisoned>() {
            poisoned = Some(payload);
        } else {
            panic::resume_unwind(payload);
        }
    }
    if let Some(payload) = poisoned {
        panic::resume_unwind(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_hands_out_each_unit_once() {
        let cursor = WorkCursor::new(1000);
        let seen: Vec<AtomicUsize> = (0..1000).map(|_| AtomicUsize::new(0)).collect();
        run_parallel(4, |_| {
            cursor.for_each(|i| {
                seen[i].fetch_add(1, Ordering::Relaxed);
            })
        });
        assert!(seen.iter().all(|c| c.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn sync_orders_phases() {
        let barrier = ThreadBarrier::new();
        let first = AtomicUsize::new(0);
        let observed = Mutex::new(Vec::new());
        run_parallel(4, |_| {
            let participant = match barrier.try_enter() {
                Some(p) => p,
                None => return,
            };
            first.fetch_add(1, Ordering::SeqCst);
            participant.sync();
            observed.lock().push(first.load(Ordering::SeqCst));
        });
        let observed = observed.into_inner();
        let entered = first.load(Ordering::SeqCst);
        assert!(entered >= 1);
        assert_eq!(observed.len(), entered);
        assert!(observed.iter().all(|&n| n == entered));
    }

    #[test]
    fn late_tasks_are_turned_away() {
        let barrier = ThreadBarrier::new();
        let p = barrier.try_enter().unwrap();
        p.sync();
        assert!(barrier.try_enter().is_none());
    }

    #[test]
    #[should_panic(expected = "task failed")]
    fn task_panics_reach_the_caller() {
        let barrier = ThreadBarrier::new();
        let entered = std::sync::Barrier::new(3);
        run_parallel(3, |id| {
            let participant = barrier.try_enter();
            entered.wait();
            let participant = match participant {
                Some(p) => p,
                None => return,
            };
            if id == 1 {
                panic!("task failed");
            }
            participant.sync();
        });
    }
}
