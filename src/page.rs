use std::mem::size_of;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{
    globals::{CARD_SIZE, CARD_SIZE_LOG2, OBJECT_ALIGNMENT, PAGE_SIZE, WORD_SIZE},
    mmap::Mmap,
    object::{ObjectPtr, Slot},
    util::{align_down, align_up},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageKind {
    /// `PAGE_SIZE` bytes of free-list managed objects.
    Regular,
    /// Exactly one object bigger than `LARGE_OBJECT_THRESHOLD`.
    Large,
}

/// Old-space page. The descriptor lives at the start of its own mapping so the page of
/// any object is found by masking the object address.
pub struct Page {
    memory: Mmap,
    next: *mut Page,
    kind: PageKind,
    object_start: usize,
    object_end: usize,
    live_bytes: AtomicUsize,
    evacuation_candidate: AtomicBool,
    never_evacuate: bool,
    cards: Box<[AtomicBool]>,
}

unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    #[inline(always)]
    pub fn header_size() -> usize {
        align_up(size_of::<Self>(), OBJECT_ALIGNMENT)
    }

    /// Maps a regular page. Its object area is left uninitialized.
    pub fn allocate_regular() -> Option<*mut Page> {
        Self::allocate(PageKind::Regular, PAGE_SIZE - Self::header_size())
    }

    /// Maps a page for a single object of `object_size` bytes.
    pub fn allocate_large(object_size: usize) -> Option<*mut Page> {
        Self::allocate(PageKind::Large, object_size)
    }

    fn allocate(kind: PageKind, object_size: usize) -> Option<*mut Page> {
        let header = Self::header_size();
        let size = align_up(header + object_size, PAGE_SIZE);
        let memory = Mmap::new_aligned(size, PAGE_SIZE)?;
        let base = memory.start() as usize;
        let object_start = base + header;
        let object_end = object_start + object_size;
        let cards = match kind {
            PageKind::Regular => Vec::new(),
            PageKind::Large => (0..(align_up(object_size, CARD_SIZE) >> CARD_SIZE_LOG2))
                .map(|_| AtomicBool::new(false))
                .collect(),
        };
        let page = base as *mut Page;
        unsafe {
            page.write(Page {
                memory,
                next: null_mut(),
                kind,
                object_start,
                object_end,
                live_bytes: AtomicUsize::new(0),
                evacuation_candidate: AtomicBool::new(false),
                never_evacuate: kind == PageKind::Large,
                cards: cards.into_boxed_slice(),
            });
        }
        Some(page)
    }

    /// Unmaps `page`.
    ///
    /// # Safety
    /// Nothing may reference the page or any object on it afterwards.
    pub unsafe fn deallocate(page: *mut Page) {
        // Move the descriptor off the mapping before the mapping goes away.
        drop(std::ptr::read(page));
    }

    #[inline(always)]
    pub fn of(addr: usize) -> *mut Page {
        align_down(addr, PAGE_SIZE) as *mut Page
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }
    pub fn is_large(&self) -> bool {
        self.kind == PageKind::Large
    }
    pub fn object_start(&self) -> usize {
        self.object_start
    }
    pub fn object_end(&self) -> usize {
        self.object_end
    }
    pub fn area_size(&self) -> usize {
        self.object_end - self.object_start
    }
    pub fn mapped_size(&self) -> usize {
        self.memory.size()
    }
    pub fn large_object_size(&self) -> usize {
        debug_assert!(self.is_large());
        self.area_size()
    }
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.object_start && addr < self.object_end
    }

    pub fn next(&self) -> *mut Page {
        self.next
    }
    pub fn set_next(&mut self, next: *mut Page) {
        self.next = next;
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }
    pub fn add_live_bytes(&self, bytes: usize) {
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
    pub fn set_live_bytes(&self, bytes: usize) {
        self.live_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn is_evacuation_candidate(&self) -> bool {
        self.evacuation_candidate.load(Ordering::Acquire)
    }
    pub fn set_evacuation_candidate(&self, value: bool) {
        self.evacuation_candidate.store(value, Ordering::Release);
    }
    pub fn is_never_evacuate(&self) -> bool {
        self.never_evacuate
    }
    pub fn set_never_evacuate(&mut self, value: bool) {
        self.never_evacuate = value;
    }

    /// The object on a large page.
    pub fn large_object(&self) -> ObjectPtr {
        debug_assert!(self.is_large());
        ObjectPtr::from_addr(self.object_start)
    }

    /// Walks every object, free-list element and corpse on the page in address order.
    ///
    /// # Safety
    /// The page must be linearly walkable: every byte of the object area belongs to exactly
    /// one object with a live (non-forwarded) header.
    pub unsafe fn visit_objects(&self, mut f: impl FnMut(ObjectPtr)) {
        let mut addr = self.object_start;
        while addr < self.object_end {
            let obj = ObjectPtr::from_addr(addr);
            let size = obj.heap_size();
            debug_assert!(size >= OBJECT_ALIGNMENT && addr + size <= self.object_end);
            f(obj);
            addr += size;
        }
    }

    /// Marks the card covering `slot`. Only large pages have cards.
    pub fn remember_card(&self, slot: Slot) {
        debug_assert!(self.is_large());
        let index = (slot as usize - self.object_start) >> CARD_SIZE_LOG2;
        self.cards[index].store(true, Ordering::Relaxed);
    }

    pub fn has_remembered_cards(&self) -> bool {
        self.cards.iter().any(|c| c.load(Ordering::Relaxed))
    }

    pub fn reset_cards(&self) {
        for card in self.cards.iter() {
            card.store(false, Ordering::Relaxed);
        }
    }

    fn card_range(&self, index: usize) -> (Slot, Slot) {
        let first_slot = self.object_start + WORD_SIZE;
        let from = (self.object_start + (index << CARD_SIZE_LOG2)).max(first_slot);
        let to = (self.object_start + ((index + 1) << CARD_SIZE_LOG2)).min(self.object_end);
        (from as Slot, to as Slot)
    }

    /// Clears every dirty card and calls `f` with the slot range `[from, to)` it covered.
    /// The header word of the object is never part of a range.
    pub fn take_remembered_cards(&self, mut f: impl FnMut(Slot, Slot)) {
        for (i, card) in self.cards.iter().enumerate() {
            if card.swap(false, Ordering::Relaxed) {
                let (from, to) = self.card_range(i);
                f(from, to);
            }
        }
    }

    /// Like [`take_remembered_cards`](Self::take_remembered_cards) but leaves the cards dirty.
    pub fn visit_remembered_cards(&self, mut f: impl FnMut(Slot, Slot)) {
        for (i, card) in self.cards.iter().enumerate() {
            if card.load(Ordering::Relaxed) {
                let (from, to) = self.card_range(i);
                f(from, to);
            }
        }
    }
}

/// Singly linked list of pages owned by one space.
pub struct PageList {
    head: *mut Page,
    len: usize,
}

unsafe impl Send for PageList {}

impl PageList {
    pub const fn new() -> Self {
        Self {
            head: null_mut(),
            len: 0,
        }
    }

    pub fn push(&mut self, page: *mut Page) {
        unsafe {
            (*page).set_next(self.head);
        }
        self.head = page;
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> PageIter<'_> {
        PageIter {
            current: self.head,
            _list: std::marker::PhantomData,
        }
    }

    pub fn contains(&self, page: *mut Page) -> bool {
        self.iter().any(|p| p as *const Page == page as *const Page)
    }

    /// Unlinks every page for which `remove` returns true and hands them back.
    pub fn remove_if(&mut self, mut remove: impl FnMut(&Page) -> bool) -> Vec<*mut Page> {
        let mut removed = Vec::new();
        let mut prev: *mut Page = null_mut();
        let mut current = self.head;
        unsafe {
            while !current.is_null() {
                let next = (*current).next();
                if remove(&*current) {
                    if prev.is_null() {
                        self.head = next;
                    } else {
                        (*prev).set_next(next);
                    }
                    (*current).set_next(null_mut());
                    removed.push(current);
                    self.len -= 1;
                } else {
                    prev = current;
                }
                current = next;
            }
        }
        removed
    }

    /// Unlinks all pages.
    pub fn take_all(&mut self) -> Vec<*mut Page> {
        self.remove_if(|_| true)
    }
}

pub struct PageIter<'a> {
    current: *mut Page,
    _list: std::marker::PhantomData<&'a PageList>,
}

impl<'a> Iterator for PageIter<'a> {
    type Item = &'a Page;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_null() {
            return None;
        }
        unsafe {
            let page = &*self.current;
            self.current = page.next();
            Some(page)
        }
    }
}
