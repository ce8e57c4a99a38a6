//! Incremental evacuating compactor for old space.
//!
//! The prologue picks sparsely populated pages while marking starts and flags their objects.
//! Once marking is complete the epilogue copies the marked objects off those pages, leaving
//! forwarding corpses behind, rewrites every reference through [`forward_heap`] and unmaps
//! the pages. An aborted marking cycle just drops the flags.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{
    forwarding::{forward_heap, ForwardingCorpse, ForwardingMode, SendPtr},
    freelist::FreeList,
    heap::Heap,
    object::{ObjectPtr, FORWARDING_CORPSE_CID, FREE_LIST_ELEMENT_CID},
    old_space::{GrowthPolicy, OldSpace},
    page::Page,
    thread_pool::{run_parallel, ThreadBarrier, WorkCursor},
};

/// Occupancy of one regular page as seen by candidate selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageUsage {
    pub live_bytes: usize,
    pub area_size: usize,
    pub never_evacuate: bool,
}

/// Picks the pages to evacuate and returns their indices into `pages`.
///
/// Pages at most half full are sorted by live bytes, then the longest prefix whose
/// cumulative live bytes fit in `budget` is taken. Lowering the budget can only shrink the
/// result.
pub fn select_evacuation_candidates(pages: &[PageUsage], budget: usize) -> Vec<usize> {
    let mut eligible: Vec<usize> = (0..pages.len())
        .filter(|&i| {
            let page = &pages[i];
            !page.never_evacuate && page.live_bytes < page.area_size / 2
        })
        .collect();
    eligible.sort_by_key(|&i| pages[i].live_bytes);
    let mut total = 0;
    let mut selected = Vec::new();
    for i in eligible {
        total += pages[i].live_bytes;
        if total > budget {
            break;
        }
        selected.push(i);
    }
    selected
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CompactionStats {
    pub candidates: usize,
    pub evacuated_bytes: usize,
    pub aborted_pages: usize,
    pub released_pages: usize,
    pub duration: Duration,
}

/// Compactor state carried across one marking cycle.
#[derive(Default)]
pub struct IncrementalCompactor {
    active: bool,
    candidates: usize,
    candidate_live_bytes: usize,
    last: Option<CompactionStats>,
}

fn candidate_pages(old_space: &OldSpace) -> Vec<&Page> {
    old_space
        .regular_pages()
        .into_iter()
        .filter(|p| p.is_evacuation_candidate())
        .collect()
}

impl IncrementalCompactor {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn candidates(&self) -> usize {
        self.candidates
    }

    /// Statistics of the last epilogue that moved anything.
    pub fn last_compaction(&self) -> Option<&CompactionStats> {
        self.last.as_ref()
    }

    /// Selects candidate pages, flags their objects and removes their free chunks from the
    /// shared free list so nothing new is allocated there.
    pub fn prologue(heap: &mut Heap) {
        debug_assert!(!heap.compactor.active);
        let budget =
            (heap.config.compactor_budget_fraction * heap.new_space.capacity() as f64) as usize;
        let workers = heap.config.workers;
        let (count, live_bytes, pruned) = {
            let pages = heap.old_space.regular_pages();
            let usage: Vec<PageUsage> = pages
                .iter()
                .map(|p| PageUsage {
                    live_bytes: p.live_bytes(),
                    area_size: p.area_size(),
                    never_evacuate: p.is_never_evacuate(),
                })
                .collect();
            let selected = select_evacuation_candidates(&usage, budget);
            if selected.is_empty() {
                return;
            }
            let candidates: Vec<&Page> = selected.iter().map(|&i| pages[i]).collect();
            for page in candidates.iter() {
                page.set_evacuation_candidate(true);
            }
            let live_bytes: usize = selected.iter().map(|&i| usage[i].live_bytes).sum();

            // Workers prune distinct buckets while this thread holds the lock.
            let mut guard = heap.old_space.freelist();
            let freelist = SendPtr::new(&mut *guard);
            let barrier = ThreadBarrier::new();
            let page_cursor = WorkCursor::new(candidates.len());
            let bucket_cursor = WorkCursor::new(FreeList::num_buckets());
            let pruned = AtomicUsize::new(0);
            run_parallel(workers, |_| {
                let participant = match barrier.try_enter() {
                    Some(participant) => participant,
                    None => return,
                };
                page_cursor.for_each(|i| unsafe {
                    candidates[i].visit_objects(|obj| {
                        let header = obj.header();
                        match header.class_id() {
                            FREE_LIST_ELEMENT_CID | FORWARDING_CORPSE_CID => {}
                            _ => obj.set_header(header.with_evacuation_candidate(true)),
                        }
                    });
                });
                participant.sync();
                bucket_cursor.for_each(|i| unsafe {
                    let removed = FreeList::prune_bucket(freelist.get(), i, &|addr| {
                        !(*Page::of(addr)).is_evacuation_candidate()
                    });
                    pruned.fetch_add(removed, Ordering::Relaxed);
                });
            });
            let pruned = pruned.into_inner();
            guard.discount(pruned);
            (candidates.len(), live_bytes, pruned)
        };

        let compactor = &mut heap.compactor;
        compactor.active = true;
        compactor.candidates = count;
        compactor.candidate_live_bytes = live_bytes;
        log::debug!(
            "[gc] compactor: {} candidate pages, {} live bytes, {} free bytes withdrawn",
            count,
            live_bytes,
            pruned
        );
    }

    /// Evacuates the candidate pages and forwards the heap. Returns whether anything moved.
    /// Must run after marking completed and before sweeping.
    pub fn epilogue(heap: &mut Heap) -> bool {
        if !heap.compactor.active {
            return false;
        }
        heap.compactor.active = false;
        let start = Instant::now();
        let policy = heap.old_space.growth_policy();
        heap.old_space.set_growth_policy(GrowthPolicy::Forced);

        let workers = heap.config.workers;
        let lists = Mutex::new(Vec::with_capacity(workers));
        let evacuated = AtomicUsize::new(0);
        let aborted = AtomicUsize::new(0);
        {
            let old_space = &heap.old_space;
            let pages = candidate_pages(old_space);
            let cursor = WorkCursor::new(pages.len());
            run_parallel(workers, |_| {
                let mut freelist = FreeList::new();
                cursor.for_each(|i| {
                    let page = pages[i];
                    let (moved, complete) = unsafe { evacuate_page(old_space, page, &mut freelist) };
                    evacuated.fetch_add(moved, Ordering::Relaxed);
                    if !complete {
                        page.set_evacuation_candidate(false);
                        aborted.fetch_add(1, Ordering::Relaxed);
                    }
                });
                lists.lock().push(freelist);
            });
        }
        for mut list in lists.into_inner() {
            heap.old_space.freelist_mut().merge(&mut list);
        }
        heap.old_space.set_growth_policy(policy);

        forward_heap(heap, ForwardingMode::Compaction);
        #[cfg(debug_assertions)]
        crate::verifier::verify_after_compaction(heap);

        let released = heap
            .old_space
            .pages_mut()
            .remove_if(|page| page.is_evacuation_candidate());
        let stats = CompactionStats {
            candidates: heap.compactor.candidates,
            evacuated_bytes: evacuated.into_inner(),
            aborted_pages: aborted.into_inner(),
            released_pages: released.len(),
            duration: start.elapsed(),
        };
        unsafe { heap.old_space.release_pages(released) };
        log::debug!(
            "[gc] compactor: evacuated {} bytes of {} expected, released {} pages, {} aborted, {:?}",
            stats.evacuated_bytes,
            heap.compactor.candidate_live_bytes,
            stats.released_pages,
            stats.aborted_pages,
            stats.duration
        );
        heap.compactor.candidates = 0;
        heap.compactor.candidate_live_bytes = 0;
        heap.compactor.last = Some(stats);
        heap.compactions += 1;
        true
    }

    /// Drops the candidate flags and gives the withdrawn free chunks back. Nothing has moved
    /// yet so this is always safe.
    pub fn abort(heap: &mut Heap) {
        if !heap.compactor.active {
            return;
        }
        heap.compactor.active = false;
        heap.compactor.candidates = 0;
        heap.compactor.candidate_live_bytes = 0;
        let pages: Vec<*const Page> = candidate_pages(&heap.old_space)
            .into_iter()
            .map(|p| p as *const Page)
            .collect();
        let freelist = heap.old_space.freelist_mut();
        for &page in pages.iter() {
            unsafe {
                let page = &*page;
                let mut free = Vec::new();
                page.visit_objects(|obj| {
                    let header = obj.header();
                    if header.class_id() == FREE_LIST_ELEMENT_CID {
                        free.push((obj.addr(), obj.heap_size()));
                    } else if header.evacuation_candidate() {
                        obj.set_header(header.with_evacuation_candidate(false));
                    }
                });
                for (addr, size) in free {
                    freelist.free(addr, size);
                }
                page.set_evacuation_candidate(false);
            }
        }
        log::debug!("[gc] compactor: aborted, {} pages kept", pages.len());
    }
}

/// Target memory for an evacuated object: the worker's own list first, then a fresh page,
/// then the shared list.
fn allocate_target(old_space: &OldSpace, freelist: &mut FreeList, size: usize) -> Option<usize> {
    if let Some(addr) = freelist.try_allocate(size) {
        return Some(addr);
    }
    if let Some(page) = old_space.allocate_page() {
        unsafe { freelist.free(page.object_start(), page.area_size()) };
        return freelist.try_allocate(size);
    }
    old_space.freelist().try_allocate(size)
}

/// Moves every marked candidate object off `page`. Returns the bytes moved and whether the
/// page was emptied; on allocation failure the rest of the page stays where it is.
unsafe fn evacuate_page(old_space: &OldSpace, page: &Page, freelist: &mut FreeList) -> (usize, bool) {
    let mut moved = 0;
    let mut complete = true;
    page.visit_objects(|obj| {
        let header = obj.header();
        if !header.evacuation_candidate() {
            return;
        }
        let header = header.with_evacuation_candidate(false);
        if !complete || !header.marked() {
            obj.set_header(header);
            return;
        }
        let size = obj.heap_size();
        let addr = match allocate_target(old_space, freelist, size) {
            Some(addr) => addr,
            None => {
                log::debug!("[gc] compactor: no room for {} bytes, keeping page", size);
                complete = false;
                obj.set_header(header);
                return;
            }
        };
        std::ptr::copy_nonoverlapping(obj.addr() as *const u8, addr as *mut u8, size);
        let target = ObjectPtr::from_addr(addr);
        target.set_header(header);
        (*Page::of(addr)).add_live_bytes(size);
        ForwardingCorpse::write(obj.addr(), size, target);
        moved += size;
    });
    (moved, complete)
}
