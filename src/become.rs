//! Explicit identity forwarding.
//!
//! Every `before` object is overlaid with a [`ForwardingCorpse`] targeting its `after`, then
//! the shared forwarding pass rewrites all references. No object data is copied.

use crate::{
    error::HeapError,
    forwarding::{forward_heap, ForwardingCorpse, ForwardingMode},
    globals::MIN_OBJECT_SIZE,
    heap::Heap,
    object::ObjectPtr,
    page::Page,
    util::align_up,
};

/// A pending batch of `(before, after)` pairs. Only one can exist per heap at a time since
/// it borrows the heap mutably.
pub struct Become<'h> {
    heap: &'h mut Heap,
    pairs: Vec<(ObjectPtr, ObjectPtr)>,
}

impl<'h> Become<'h> {
    pub(crate) fn new(heap: &'h mut Heap) -> Self {
        Self {
            heap,
            pairs: Vec::new(),
        }
    }

    pub fn add(&mut self, before: ObjectPtr, after: ObjectPtr) {
        self.pairs.push((before, after));
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Allocates a self-forwarding placeholder of `size` bytes in old space. It can be used
    /// as a `before` whose references are redirected later.
    ///
    /// The compactor never moves corpses, so the page holding a dummy is pinned.
    pub fn make_dummy_object(&mut self, size: usize) -> Result<ObjectPtr, HeapError> {
        let size = align_up(size.max(MIN_OBJECT_SIZE), MIN_OBJECT_SIZE);
        let addr = self.heap.allocate_old_raw(size)?;
        unsafe {
            (*Page::of(addr)).set_never_evacuate(true);
            let dummy = ForwardingCorpse::write_dummy(addr, size);
            if self.heap.marker.is_some() {
                dummy.set_header(dummy.header().with_marked(true));
            }
            Ok(dummy)
        }
    }

    unsafe fn validate(before: ObjectPtr, after: ObjectPtr) {
        if before == after {
            crate::fatal!("become: {:?} would forward to itself", before);
        }
        if !before.is_heap_object() || !after.is_heap_object() {
            crate::fatal!("become: immediate in pair {:?} -> {:?}", before, after);
        }
        if before.header().immutable() {
            crate::fatal!("become: {:?} is an immutable image object", before);
        }
        if ForwardingCorpse::is_forwarding(before) && !ForwardingCorpse::is_dummy(before) {
            crate::fatal!(
                "become: {:?} already forwards to {:?}",
                before,
                ForwardingCorpse::forwarded_address(before)
            );
        }
        if ForwardingCorpse::is_forwarding(after) {
            crate::fatal!("become: target {:?} is itself forwarded", after);
        }
    }

    /// Redirects every reference to each `before` to its `after`.
    pub fn forward(self) {
        let Become { heap, pairs } = self;
        if pairs.is_empty() {
            return;
        }
        unsafe {
            for &(before, after) in pairs.iter() {
                Self::validate(before, after);
                let hash = before.header().hash();
                let after_header = after.header();
                if hash != 0 && after_header.hash() == 0 {
                    after.set_header(after_header.with_hash(hash));
                }
                let size = before.heap_size();
                if ForwardingCorpse::is_dummy(before) {
                    ForwardingCorpse::set_forward(before, after);
                } else {
                    ForwardingCorpse::write(before.addr(), size, after);
                }
                if let Some(marker) = heap.marker.as_deref_mut() {
                    marker.barrier_mark(after);
                }
            }
            if let Some(marker) = heap.marker.as_deref_mut() {
                marker.forward_worklists();
            }
        }

        forward_heap(heap, ForwardingMode::Become);
        #[cfg(debug_assertions)]
        crate::verifier::verify_no_corpse_references(heap);

        heap.becomes += 1;
        log::debug!("[gc] become: forwarded {} objects", pairs.len());
    }
}
