use std::sync::atomic::{AtomicUsize, Ordering};

use atomic::Atomic;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    freelist::FreeList,
    globals::PAGE_SIZE,
    object::ObjectPtr,
    page::{Page, PageList},
};

/// How far old space may grow when it runs out of free-list memory.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GrowthPolicy {
    /// Respect the soft limit; hitting it means a collection is due.
    Controlled,
    /// Grow up to the hard limit. Used while a collection must not fail.
    Forced,
}

/// Old generation: regular free-list pages plus one page per large object.
///
/// Mutator-side allocation always goes through the locks. GC workers inside a stop-the-world
/// phase work on disjoint pages and only take the page-list lock to acquire fresh pages.
pub struct OldSpace {
    pages: Mutex<PageList>,
    large_pages: Mutex<PageList>,
    freelist: Mutex<FreeList>,
    capacity: AtomicUsize,
    soft_limit: usize,
    hard_limit: usize,
    growth_policy: Atomic<GrowthPolicy>,
    /// Lowest and highest address ever mapped, a coarse bound for sanity checks.
    lowest: AtomicUsize,
    highest: AtomicUsize,
}

impl OldSpace {
    pub fn new(soft_limit: usize, hard_limit: usize) -> Self {
        Self {
            pages: Mutex::new(PageList::new()),
            large_pages: Mutex::new(PageList::new()),
            freelist: Mutex::new(FreeList::new()),
            capacity: AtomicUsize::new(0),
            soft_limit,
            hard_limit: hard_limit.max(soft_limit),
            growth_policy: Atomic::new(GrowthPolicy::Controlled),
            lowest: AtomicUsize::new(usize::MAX),
            highest: AtomicUsize::new(0),
        }
    }

    fn record_mapping(&self, page: *mut Page) {
        let start = page as usize;
        let end = start + unsafe { (*page).mapped_size() };
        self.lowest.fetch_min(start, Ordering::Relaxed);
        self.highest.fetch_max(end, Ordering::Relaxed);
    }

    /// False for addresses that can not possibly belong to old space.
    #[inline]
    pub fn in_bounds(&self, addr: usize) -> bool {
        addr >= self.lowest.load(Ordering::Relaxed) && addr < self.highest.load(Ordering::Relaxed)
    }

    pub fn growth_policy(&self) -> GrowthPolicy {
        self.growth_policy.load(atomic::Ordering::Relaxed)
    }

    pub fn set_growth_policy(&self, policy: GrowthPolicy) {
        self.growth_policy.store(policy, atomic::Ordering::Relaxed);
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn soft_limit(&self) -> usize {
        self.soft_limit
    }

    pub fn hard_limit(&self) -> usize {
        self.hard_limit
    }

    pub fn free_bytes(&self) -> usize {
        self.freelist.lock().free_bytes()
    }

    pub fn used_bytes(&self) -> usize {
        self.capacity().saturating_sub(self.free_bytes())
    }

    fn reserve(&self, bytes: usize) -> bool {
        let limit = match self.growth_policy() {
            GrowthPolicy::Controlled => self.soft_limit,
            GrowthPolicy::Forced => self.hard_limit,
        };
        let mut current = self.capacity.load(Ordering::Relaxed);
        loop {
            if current + bytes > limit {
                return false;
            }
            match self.capacity.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Maps a fresh regular page if the growth policy allows it. The page's object area is
    /// unformatted; the caller must hand it to a free list.
    pub fn allocate_page(&self) -> Option<&Page> {
        if !self.reserve(PAGE_SIZE) {
            return None;
        }
        match Page::allocate_regular() {
            Some(page) => {
                self.record_mapping(page);
                self.pages.lock().push(page);
                log::trace!("[gc] old space grew to {} pages", self.pages.lock().len());
                Some(unsafe { &*page })
            }
            None => {
                self.capacity.fetch_sub(PAGE_SIZE, Ordering::AcqRel);
                None
            }
        }
    }

    /// Allocates `size` bytes from the shared free list, growing if allowed. The returned
    /// memory is not formatted.
    pub fn try_allocate(&self, size: usize) -> Option<usize> {
        let mut freelist = self.freelist.lock();
        let addr = match freelist.try_allocate(size) {
            Some(addr) => addr,
            None => {
                let page = self.allocate_page()?;
                unsafe {
                    freelist.free(page.object_start(), page.area_size());
                }
                freelist.try_allocate(size)?
            }
        };
        unsafe {
            (*Page::of(addr)).add_live_bytes(size);
        }
        Some(addr)
    }

    /// Maps a page holding a single object of `size` bytes and returns the object address.
    pub fn allocate_large(&self, size: usize) -> Option<usize> {
        let mapped = crate::util::align_up(Page::header_size() + size, PAGE_SIZE);
        if !self.reserve(mapped) {
            return None;
        }
        match Page::allocate_large(size) {
            Some(page) => unsafe {
                self.record_mapping(page);
                (*page).set_live_bytes(size);
                self.large_pages.lock().push(page);
                Some((*page).object_start())
            },
            None => {
                self.capacity.fetch_sub(mapped, Ordering::AcqRel);
                None
            }
        }
    }

    pub fn freelist(&self) -> MutexGuard<'_, FreeList> {
        self.freelist.lock()
    }

    pub fn freelist_mut(&mut self) -> &mut FreeList {
        self.freelist.get_mut()
    }

    pub fn pages_mut(&mut self) -> &mut PageList {
        self.pages.get_mut()
    }

    pub fn large_pages_mut(&mut self) -> &mut PageList {
        self.large_pages.get_mut()
    }

    /// Snapshot of the regular pages.
    pub fn regular_pages(&self) -> Vec<&Page> {
        let pages = self.pages.lock();
        pages.iter().map(|p| unsafe { &*(p as *const Page) }).collect()
    }

    /// Snapshot of the large pages.
    pub fn large_pages(&self) -> Vec<&Page> {
        let pages = self.large_pages.lock();
        pages.iter().map(|p| unsafe { &*(p as *const Page) }).collect()
    }

    pub fn num_pages(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn num_large_pages(&self) -> usize {
        self.large_pages.lock().len()
    }

    /// Page holding `addr`, if it belongs to this space.
    pub fn page_containing(&self, addr: usize) -> Option<&Page> {
        let page = Page::of(addr);
        let found = self.pages.lock().contains(page) || self.large_pages.lock().contains(page);
        if found && unsafe { (*page).contains(addr) } {
            Some(unsafe { &*page })
        } else {
            None
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.page_containing(addr).is_some()
    }

    /// Unmaps `pages`, which must already be unlinked.
    pub unsafe fn release_pages(&self, pages: Vec<*mut Page>) {
        for page in pages {
            self.capacity
                .fetch_sub((*page).mapped_size(), Ordering::AcqRel);
            Page::deallocate(page);
        }
    }

    /// Visits every object, free-list element and corpse of the space.
    pub unsafe fn visit_objects(&self, mut f: impl FnMut(ObjectPtr)) {
        for page in self.regular_pages() {
            page.visit_objects(&mut f);
        }
        for page in self.large_pages() {
            f(page.large_object());
        }
    }
}

impl Drop for OldSpace {
    fn drop(&mut self) {
        let pages = self.pages.get_mut().take_all();
        let large = self.large_pages.get_mut().take_all();
        unsafe {
            self.release_pages(pages);
            self.release_pages(large);
        }
    }
}
