//! Old-space sweeping.
//!
//! Regular pages are walked in parallel. Runs of dead objects, free-list elements and
//! unreferenced corpses are coalesced into fresh free-list elements, marks of live objects are cleared
//! and pages left without live objects are unmapped. Large pages live or die as a whole.

use parking_lot::Mutex;

use crate::{
    freelist::FreeList,
    heap::Heap,
    object::FREE_LIST_ELEMENT_CID,
    page::Page,
    thread_pool::{run_parallel, WorkCursor},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub live_bytes: usize,
    pub free_bytes: usize,
    pub released_pages: usize,
    pub released_large_pages: usize,
}

/// Walks `page`, clearing marks, and collects its free chunks. Returns the live bytes.
unsafe fn sweep_page(page: &Page, chunks: &mut Vec<(usize, usize)>) -> usize {
    let mut live = 0;
    let mut run_start = 0;
    let mut run_size = 0;
    page.visit_objects(|obj| {
        let header = obj.header();
        let size = obj.heap_size();
        // Dummy corpses that are still referenced were marked like any other object.
        let dead = header.class_id() == FREE_LIST_ELEMENT_CID || !header.marked();
        if dead {
            if run_size == 0 {
                run_start = obj.addr();
            }
            run_size += size;
        } else {
            obj.set_header(header.with_marked(false));
            live += size;
            if run_size != 0 {
                chunks.push((run_start, run_size));
                run_size = 0;
            }
        }
    });
    if run_size != 0 {
        chunks.push((run_start, run_size));
    }
    live
}

pub(crate) fn sweep(heap: &mut Heap) -> SweepStats {
    let workers = heap.config.workers;
    heap.old_space.freelist_mut().reset();

    let lists = Mutex::new(Vec::with_capacity(workers));
    let empty = Mutex::new(Vec::new());
    let live_total = Mutex::new(0usize);
    {
        let pages = heap.old_space.regular_pages();
        let cursor = WorkCursor::new(pages.len());
        run_parallel(workers, |_| {
            let mut freelist = FreeList::new();
            let mut chunks = Vec::new();
            let mut live_bytes = 0;
            let mut empty_pages = Vec::new();
            cursor.for_each(|i| {
                let page = pages[i];
                chunks.clear();
                let live = unsafe { sweep_page(page, &mut chunks) };
                page.set_live_bytes(live);
                if live == 0 {
                    empty_pages.push(page as *const Page as usize);
                    return;
                }
                live_bytes += live;
                for &(addr, size) in chunks.iter() {
                    unsafe { freelist.free(addr, size) };
                }
            });
            lists.lock().push(freelist);
            empty.lock().append(&mut empty_pages);
            *live_total.lock() += live_bytes;
        });
    }

    let mut stats = SweepStats {
        live_bytes: live_total.into_inner(),
        ..Default::default()
    };
    for mut list in lists.into_inner() {
        heap.old_space.freelist_mut().merge(&mut list);
    }
    stats.free_bytes = heap.old_space.free_bytes();

    let empty = empty.into_inner();
    let released = heap
        .old_space
        .pages_mut()
        .remove_if(|page| empty.contains(&(page as *const Page as usize)));
    stats.released_pages = released.len();
    let dead_large = heap.old_space.large_pages_mut().remove_if(|page| unsafe {
        let obj = page.large_object();
        let header = obj.header();
        if header.marked() {
            obj.set_header(header.with_marked(false));
            stats.live_bytes += page.large_object_size();
            false
        } else {
            true
        }
    });
    stats.released_large_pages = dead_large.len();
    unsafe {
        heap.old_space.release_pages(released);
        heap.old_space.release_pages(dead_large);
    }
    log::debug!(
        "[gc] sweep: {} live, {} free, released {} pages and {} large pages",
        crate::util::formatted_size(stats.live_bytes),
        crate::util::formatted_size(stats.free_bytes),
        stats.released_pages,
        stats.released_large_pages
    );
    stats
}
