//! Copying collector for new space.
//!
//! Survivors are copied breadth-first into to-space, or promoted into old space once they
//! survived a previous scavenge (they sit below the survivor boundary of the space being
//! evacuated). Copied objects leave a [`ForwardingWord`] in their old header.

use std::time::Instant;

use crate::{
    error::PromotionFailure,
    forwarding::ForwardingWord,
    handles::HandleFate,
    header::Header,
    heap::Heap,
    marker::Marker,
    new_space::NewSpace,
    object::{kind_of, layout, visit_pointers, ClassKind, ClassTable, ObjectPtr, Slot},
    old_space::{GrowthPolicy, OldSpace},
    statistics::ScavengeStats,
    store_buffer::StoreBuffer,
    weak::{resolve_weak_reference_sets, DelaySet, WeakResolver},
};

struct ScavengerVisitor<'a> {
    classes: &'a ClassTable,
    new_space: &'a mut NewSpace,
    old_space: &'a OldSpace,
    store_buffer: &'a mut StoreBuffer,
    marker: Option<&'a mut Marker>,
    survivor_end: usize,
    promoted: Vec<ObjectPtr>,
    delayed: DelaySet,
    ready: Vec<ObjectPtr>,
    /// Set while scanning an old object when one of its fields still refers to new space.
    holder_has_young: bool,
    stats: ScavengeStats,
}

impl<'a> ScavengerVisitor<'a> {
    #[inline]
    fn scavenge_slot(&mut self, slot: Slot) {
        unsafe {
            let value = *slot;
            if !value.is_heap_object() {
                return;
            }
            let addr = value.addr();
            if self.new_space.in_from_space(addr) {
                let target = self.resolve(value);
                *slot = target;
                if self.new_space.in_to_space(target.addr()) {
                    self.holder_has_young = true;
                }
            } else if self.new_space.in_to_space(addr) {
                self.holder_has_young = true;
            }
        }
    }

    /// Returns the new location of the from-space object `obj`, copying it if needed.
    unsafe fn resolve(&mut self, obj: ObjectPtr) -> ObjectPtr {
        let word = obj.header_word();
        if let Some(forward) = ForwardingWord::from_header_word(word) {
            return forward.target();
        }
        let header = Header::from_raw(word);
        let size = obj.heap_size();
        let mut promoted = None;
        if obj.addr() < self.survivor_end {
            match self.try_promote(size) {
                Ok(addr) => promoted = Some(addr),
                Err(failure) => {
                    log::debug!("[gc] {}, keeping the object in new space", failure);
                    self.stats.failed_to_promote += failure.size;
                }
            }
        }
        let new_addr = match promoted {
            Some(addr) => addr,
            None => match self.new_space.try_allocate(size) {
                Some(addr) => addr,
                None => crate::fatal!("to-space overflow copying {} bytes", size),
            },
        };
        std::ptr::copy_nonoverlapping(obj.addr() as *const u8, new_addr as *mut u8, size);
        let target = ObjectPtr::from_addr(new_addr);
        let mut new_header = header.with_remembered(false).with_young(promoted.is_none());
        if promoted.is_some() {
            self.stats.promoted += size;
            if let Some(marker) = self.marker.as_mut() {
                new_header = new_header.with_marked(true);
                marker.push_deferred(target);
            }
            self.promoted.push(target);
        } else {
            self.stats.copied += size;
        }
        target.set_header(new_header);
        obj.set_header_word(ForwardingWord::new(new_addr).raw());
        if let Some(properties) = self.delayed.take(obj) {
            self.ready.extend(properties);
        }
        target
    }

    /// Promotion under the current growth policy, retried once with forced growth.
    fn try_promote(&mut self, size: usize) -> Result<usize, PromotionFailure> {
        if let Some(addr) = self.old_space.try_allocate(size) {
            return Ok(addr);
        }
        if self.old_space.growth_policy() == GrowthPolicy::Controlled {
            log::debug!("[gc] promotion failed, switching to forced growth");
            self.old_space.set_growth_policy(GrowthPolicy::Forced);
            if let Some(addr) = self.old_space.try_allocate(size) {
                return Ok(addr);
            }
        }
        Err(PromotionFailure { size })
    }

    #[inline]
    unsafe fn is_unresolved(&self, obj: ObjectPtr) -> bool {
        obj.is_heap_object()
            && self.new_space.in_from_space(obj.addr())
            && !ForwardingWord::is_forwarding(obj.header_word())
    }

    /// Scans a copied or promoted object. Weak properties with an unresolved key are parked
    /// in the delay set instead.
    unsafe fn scan_object(&mut self, obj: ObjectPtr) {
        let classes = self.classes;
        if kind_of(classes, obj) == ClassKind::WeakProperty {
            let key = obj.field(layout::WEAK_PROPERTY_KEY);
            if self.is_unresolved(key) {
                self.delayed.insert(key, obj);
                return;
            }
        }
        visit_pointers(classes, obj, &mut |slot| self.scavenge_slot(slot));
    }

    /// Scans an old object and keeps it remembered if it still refers to new space.
    unsafe fn scan_old_object(&mut self, obj: ObjectPtr, scan: impl FnOnce(&mut Self)) {
        self.holder_has_young = false;
        scan(self);
        if self.holder_has_young {
            let header = obj.header();
            if !header.remembered() {
                obj.set_header(header.with_remembered(true));
                self.store_buffer.add_object(obj);
            }
        }
    }

    /// Drains to-space, the promotion worklist and the woken weak properties.
    fn process_to_fixed_point(&mut self) {
        unsafe {
            loop {
                let mut progress = false;
                while self.new_space.resolved_top() < self.new_space.top() {
                    let obj = ObjectPtr::from_addr(self.new_space.resolved_top());
                    let size = obj.heap_size();
                    self.scan_object(obj);
                    let next = self.new_space.resolved_top() + size;
                    self.new_space.set_resolved_top(next);
                    progress = true;
                }
                while let Some(obj) = self.promoted.pop() {
                    self.scan_old_object(obj, |this| this.scan_object(obj));
                    progress = true;
                }
                while let Some(property) = self.ready.pop() {
                    let classes = self.classes;
                    if property.header().young() {
                        visit_pointers(classes, property, &mut |slot| self.scavenge_slot(slot));
                    } else {
                        self.scan_old_object(property, |this| {
                            visit_pointers(classes, property, &mut |slot| this.scavenge_slot(slot))
                        });
                    }
                    progress = true;
                }
                if !progress {
                    break;
                }
            }
        }
    }

    fn visit_store_buffer(&mut self) {
        let classes = self.classes;
        for mut block in self.store_buffer.take_blocks() {
            for &obj in block.entries() {
                unsafe {
                    let header = obj.header();
                    debug_assert!(header.remembered() && !header.young());
                    obj.set_header(header.with_remembered(false));
                    self.scan_old_object(obj, |this| {
                        visit_pointers(classes, obj, &mut |slot| this.scavenge_slot(slot))
                    });
                }
            }
            block.reset();
            self.store_buffer.return_block(block);
        }
    }

    fn visit_cards(&mut self) {
        for page in self.old_space.large_pages() {
            page.take_remembered_cards(|from, to| {
                let mut slot = from;
                while slot < to {
                    self.holder_has_young = false;
                    self.scavenge_slot(slot);
                    if self.holder_has_young {
                        page.remember_card(slot);
                    }
                    slot = unsafe { slot.add(1) };
                }
            });
        }
    }

    /// Resolves a slot weakly: survivors are forwarded, dead from-space objects cleared.
    unsafe fn update_weak_slot(&self, slot: Slot) {
        let value = *slot;
        if value.is_heap_object() && self.new_space.in_from_space(value.addr()) {
            *slot = match ForwardingWord::from_header_word(value.header_word()) {
                Some(forward) => forward.target(),
                None => ObjectPtr::NULL,
            };
        }
    }
}

impl WeakResolver for ScavengerVisitor<'_> {
    fn is_live(&mut self, key: ObjectPtr) -> bool {
        unsafe { !self.is_unresolved(key) }
    }

    fn keep_alive(&mut self, slot: Slot) {
        self.scavenge_slot(slot);
    }

    fn drain(&mut self) {
        self.process_to_fixed_point();
    }
}

/// Evacuates new space. The caller has brought every mutator to a safepoint.
pub(crate) fn scavenge(heap: &mut Heap) -> ScavengeStats {
    let start = Instant::now();
    let used_before = heap.new_space.used_bytes();
    let survivor_end = heap.new_space.survivor_end();
    let candidates_end = survivor_end.min(heap.new_space.top());
    let promo_candidates = candidates_end.saturating_sub(heap.new_space.to_space().start());

    heap.new_space.flip();
    log::trace!(
        "[gc] scavenge: {} bytes below the survivor boundary",
        promo_candidates
    );

    let mut visitor = ScavengerVisitor {
        classes: &heap.classes,
        new_space: &mut heap.new_space,
        old_space: &heap.old_space,
        store_buffer: &mut heap.store_buffer,
        marker: heap.marker.as_deref_mut(),
        survivor_end,
        promoted: Vec::new(),
        delayed: DelaySet::new(),
        ready: Vec::new(),
        holder_has_young: false,
        stats: ScavengeStats {
            promo_candidates,
            used_before,
            ..Default::default()
        },
    };

    heap.roots
        .visit_all(&mut |slot| visitor.scavenge_slot(slot));
    visitor.visit_store_buffer();
    visitor.visit_cards();
    heap.id_ring.visit(&mut |slot| visitor.scavenge_slot(slot));
    visitor.process_to_fixed_point();

    resolve_weak_reference_sets(&mut heap.weak_sets, &mut visitor);
    heap.weak_sets
        .visit(&mut |slot| unsafe { visitor.update_weak_slot(slot) });

    for (_, properties) in visitor.delayed.drain() {
        for property in properties {
            unsafe {
                property.set_field(layout::WEAK_PROPERTY_KEY, ObjectPtr::NULL);
                property.set_field(layout::WEAK_PROPERTY_VALUE, ObjectPtr::NULL);
            }
        }
    }

    {
        let new_space = &*visitor.new_space;
        heap.finalizable_handles.process(|handle| unsafe {
            let referent = handle.referent();
            if !referent.is_heap_object() || !new_space.in_from_space(referent.addr()) {
                return HandleFate::Retain;
            }
            match ForwardingWord::from_header_word(referent.header_word()) {
                Some(forward) => {
                    *handle.referent_slot() = forward.target();
                    if new_space.in_to_space(forward.forwarded_address()) {
                        HandleFate::Retain
                    } else {
                        HandleFate::Promoted
                    }
                }
                None => HandleFate::Finalize { young: true },
            }
        });
        heap.weak_tables.rekey_all(|key| unsafe {
            if !new_space.in_from_space(key.addr()) {
                return Some(key);
            }
            ForwardingWord::from_header_word(key.header_word()).map(|f| f.target())
        });
    }

    let mut stats = visitor.stats;
    stats.used_after = heap.new_space.used_bytes();
    stats.duration = start.elapsed();

    heap.scavenge_history.add(stats);
    heap.early_tenure = heap
        .scavenge_history
        .early_tenure(heap.config.early_tenuring_threshold);
    heap.new_space.set_survivor_end(heap.early_tenure);
    if heap.config.zap_from_space {
        heap.new_space.zap_from_space();
    }
    heap.old_space.set_growth_policy(GrowthPolicy::Controlled);
    stats
}
