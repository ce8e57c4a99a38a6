//! Heap verification. Every failed check is fatal.

use crate::{
    forwarding::{ForwardingCorpse, ForwardingWord},
    heap::Heap,
    new_space::NewSpace,
    object::{kind_of, visit_pointers, ClassKind, ClassTable, ObjectPtr, Slot, FREE_LIST_ELEMENT_CID},
    old_space::OldSpace,
    page::Page,
};

struct Verifier<'a> {
    classes: &'a ClassTable,
    new_space: &'a NewSpace,
    old_space: &'a OldSpace,
    /// Evacuation candidate bits are legal while a compaction is pending.
    compacting: bool,
    /// Skip unmarked old objects: they are garbage the sweeper has not reclaimed yet.
    only_marked: bool,
    checked: usize,
}

impl<'a> Verifier<'a> {
    unsafe fn check_reference(&mut self, holder: Option<ObjectPtr>, slot: Slot) {
        let value = *slot;
        if !value.is_heap_object() {
            return;
        }
        self.checked += 1;
        let addr = value.addr();
        let young = self.new_space.in_to_space(addr);
        if !young && !self.old_space.contains(addr) {
            crate::fatal!(
                "{:?} (held by {:?}) is outside the allocated heap",
                value,
                holder
            );
        }
        if ForwardingWord::is_forwarding(value.header_word()) {
            crate::fatal!("{:?} (held by {:?}) has a scavenger forward", value, holder);
        }
        let header = value.header();
        if !self.classes.is_registered(header.class_id()) {
            crate::fatal!(
                "{:?} (held by {:?}) has unregistered class id {}",
                value,
                holder,
                header.class_id()
            );
        }
        if ForwardingCorpse::is_forwarding(value) && !ForwardingCorpse::is_dummy(value) {
            let holder_class = holder
                .and_then(|h| self.classes.info(h.header().class_id()))
                .map_or("root", |info| info.name.as_str());
            crate::fatal!(
                "{:?} (held by {:?}, a {}) refers to a forwarding corpse for {:?}",
                value,
                holder,
                holder_class,
                ForwardingCorpse::forwarded_address(value)
            );
        }
        if header.class_id() == FREE_LIST_ELEMENT_CID {
            crate::fatal!("{:?} (held by {:?}) is free memory", value, holder);
        }
        if header.young() != young {
            crate::fatal!("{:?} has a wrong generation bit", value);
        }
        if self.only_marked && !young && !header.marked() {
            crate::fatal!("{:?} (held by {:?}) is live but unmarked", value, holder);
        }
        if let Some(holder) = holder {
            let holder_header = holder.header();
            if young
                && !holder_header.young()
                && !holder_header.remembered()
                && !holder_header.card_remembered()
            {
                crate::fatal!(
                    "old {:?} refers to young {:?} but is not remembered",
                    holder,
                    value
                );
            }
        }
    }

    unsafe fn verify_object(&mut self, obj: ObjectPtr) {
        if let ClassKind::FreeListElement | ClassKind::ForwardingCorpse = kind_of(self.classes, obj) {
            return;
        }
        if obj.header().evacuation_candidate() && !self.compacting {
            crate::fatal!("{:?} carries a stale evacuation candidate bit", obj);
        }
        let classes = self.classes;
        visit_pointers(classes, obj, &mut |slot| self.check_reference(Some(obj), slot));
    }

    unsafe fn verify_spaces(&mut self) {
        let new_space = self.new_space;
        let old_space = self.old_space;
        new_space.visit_objects(|obj| self.verify_object(obj));
        for page in old_space.regular_pages() {
            // Evacuated pages hold stale copies until they are released.
            if self.only_marked && page.is_evacuation_candidate() {
                continue;
            }
            page.visit_objects(|obj| {
                if !self.only_marked || obj.header().marked() {
                    self.verify_object(obj)
                }
            });
        }
        for page in old_space.large_pages() {
            let obj = page.large_object();
            if !self.only_marked || obj.header().marked() {
                self.verify_object(obj);
            }
        }
    }
}

fn run(heap: &mut Heap, only_marked: bool) -> usize {
    let Heap {
        roots,
        classes,
        new_space,
        old_space,
        compactor,
        ..
    } = heap;
    let mut verifier = Verifier {
        classes,
        new_space,
        old_space,
        compacting: compactor.is_active(),
        only_marked,
        checked: 0,
    };
    roots.visit_all(&mut |slot| unsafe { verifier.check_reference(None, slot) });
    unsafe { verifier.verify_spaces() };
    verifier.checked
}

/// Full check of roots and every object. Returns the number of references checked.
pub(crate) fn verify_heap(heap: &mut Heap) -> usize {
    let checked = run(heap, false);
    log::trace!("[gc] verified {} references", checked);
    checked
}

/// Checks that no reference into a forwarding corpse survived a become.
pub(crate) fn verify_no_corpse_references(heap: &mut Heap) {
    verify_heap(heap);
}

/// Checks after the compactor's forwarding pass, before sweeping: free lists stay off the
/// candidate pages and every live reference targets a marked, current object.
pub(crate) fn verify_after_compaction(heap: &mut Heap) {
    heap.old_space.freelist().visit_elements(|addr, _| unsafe {
        if (*Page::of(addr)).is_evacuation_candidate() {
            crate::fatal!("free-list element {:#x} lies on an evacuated page", addr);
        }
    });
    run(heap, true);
}

