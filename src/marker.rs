//! Tri-color marking of old space.
//!
//! White objects have a clear mark bit, gray ones are marked and sit on a marking stack,
//! black ones are marked and scanned. New space is not marked: its objects are treated as
//! roots, and an old object found to refer to one is put back into the remembered set.

use std::time::Instant;

use crate::{
    compactor::IncrementalCompactor,
    forwarding::ForwardingCorpse,
    handles::HandleFate,
    header::Header,
    heap::Heap,
    marking_stack::MarkingStack,
    object::{kind_of, layout, visit_pointers, ClassKind, ClassTable, ObjectPtr, Slot},
    old_space::OldSpace,
    page::Page,
    store_buffer::StoreBuffer,
    sweeper::{sweep, SweepStats},
    weak::{resolve_weak_reference_sets, DelaySet, WeakResolver},
};

/// State of one marking cycle.
pub struct Marker {
    stack: MarkingStack,
    /// Objects marked outside the marker: write-barrier targets and promoted objects.
    deferred: MarkingStack,
    delayed: DelaySet,
    /// Delayed weak properties whose key got marked.
    ready: Vec<ObjectPtr>,
    /// Functions whose code slot was not traced.
    functions: Vec<ObjectPtr>,
    collect_code: bool,
    rebuild_store_buffer: bool,
    marked_bytes: usize,
    evacuation_bytes: usize,
    started: Instant,
}

impl Marker {
    fn new(collect_code: bool, rebuild_store_buffer: bool) -> Self {
        Self {
            stack: MarkingStack::new(),
            deferred: MarkingStack::new(),
            delayed: DelaySet::new(),
            ready: Vec::new(),
            functions: Vec::new(),
            collect_code,
            rebuild_store_buffer,
            marked_bytes: 0,
            evacuation_bytes: 0,
            started: Instant::now(),
        }
    }

    pub(crate) fn push_deferred(&mut self, obj: ObjectPtr) {
        self.deferred.push(obj);
    }

    /// Insertion barrier: marks an old object stored while marking is in progress.
    pub(crate) unsafe fn barrier_mark(&mut self, obj: ObjectPtr) {
        let header = obj.header();
        if header.young() || header.marked() {
            return;
        }
        self.set_marked(obj, header);
        self.deferred.push(obj);
    }

    unsafe fn set_marked(&mut self, obj: ObjectPtr, header: Header) {
        obj.set_header(header.with_marked(true).with_watched(false));
        if header.watched() {
            if let Some(properties) = self.delayed.take(obj) {
                self.ready.extend(properties);
            }
        }
        let size = obj.heap_size();
        self.marked_bytes += size;
        if header.evacuation_candidate() {
            self.evacuation_bytes += size;
        }
    }

    /// Follows become corpses in the marker's own worklists.
    pub(crate) unsafe fn forward_worklists(&mut self) {
        let forward = |obj: ObjectPtr| {
            if obj.is_heap_object() && ForwardingCorpse::is_forwarding(obj) {
                ForwardingCorpse::forwarded_address(obj)
            } else {
                obj
            }
        };
        for obj in self.ready.iter_mut().chain(self.functions.iter_mut()) {
            *obj = forward(*obj);
        }
        // A key may now be an `after` that is already marked: its properties are ready.
        for (key, properties) in self.delayed.drain() {
            let key = forward(key);
            let properties = properties.into_iter().map(forward);
            let header = key.header();
            if header.young() || header.marked() {
                self.ready.extend(properties);
            } else {
                key.set_header(header.with_watched(true));
                for property in properties {
                    self.delayed.insert(key, property);
                }
            }
        }
    }

    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes
    }

    /// Bytes of live objects found on evacuation candidate pages.
    pub fn evacuation_bytes(&self) -> usize {
        self.evacuation_bytes
    }

    pub fn has_work(&self) -> bool {
        !self.stack.is_empty() || !self.deferred.is_empty() || !self.ready.is_empty()
    }
}

struct MarkingVisitor<'a> {
    classes: &'a ClassTable,
    old_space: &'a OldSpace,
    store_buffer: &'a mut StoreBuffer,
    marker: &'a mut Marker,
    /// Old object whose fields are being scanned.
    visiting: Option<ObjectPtr>,
}

impl<'a> MarkingVisitor<'a> {
    #[inline]
    fn mark_slot(&mut self, slot: Slot) {
        unsafe {
            let value = *slot;
            if !value.is_heap_object() {
                return;
            }
            let header = value.header();
            if header.young() {
                if let Some(holder) = self.visiting {
                    self.remember(holder, slot);
                }
                return;
            }
            self.mark_and_push(value, header);
        }
    }

    unsafe fn remember(&mut self, holder: ObjectPtr, slot: Slot) {
        let header = holder.header();
        if header.card_remembered() {
            (*Page::of(holder.addr())).remember_card(slot);
        } else if !header.remembered() {
            holder.set_header(header.with_remembered(true));
            self.store_buffer.add_object(holder);
        }
    }

    unsafe fn mark_and_push(&mut self, obj: ObjectPtr, header: Header) {
        if header.marked() {
            return;
        }
        if !self.old_space.in_bounds(obj.addr()) {
            crate::fatal!("reference to {:?} outside the heap", obj);
        }
        if !self.classes.is_registered(header.class_id()) {
            crate::fatal!(
                "marking {:?} with unregistered class id {}",
                obj,
                header.class_id()
            );
        }
        self.marker.set_marked(obj, header);
        self.marker.stack.push(obj);
    }

    /// Scans a gray object, turning it black.
    unsafe fn visit_object(&mut self, obj: ObjectPtr) {
        let classes = self.classes;
        self.visiting = Some(obj);
        match kind_of(classes, obj) {
            ClassKind::WeakProperty => {
                let key = obj.field(layout::WEAK_PROPERTY_KEY);
                if key.is_heap_object() {
                    let key_header = key.header();
                    if !key_header.young() && !key_header.marked() {
                        self.marker.delayed.insert(key, obj);
                        key.set_header(key_header.with_watched(true));
                        self.visiting = None;
                        return;
                    }
                }
                visit_pointers(classes, obj, &mut |slot| self.mark_slot(slot));
            }
            ClassKind::Function if self.marker.collect_code => {
                for i in 0..obj.payload_words() {
                    let slot = obj.field_addr(i);
                    if i != layout::FUNCTION_CODE {
                        self.mark_slot(slot);
                    } else if (*slot).is_heap_object() && (*slot).header().young() {
                        self.remember(obj, slot);
                    }
                }
                self.marker.functions.push(obj);
            }
            _ => visit_pointers(classes, obj, &mut |slot| self.mark_slot(slot)),
        }
        self.visiting = None;
    }

    /// Processes gray objects until none are left or `budget` objects were scanned. Returns
    /// true when the marker ran out of work.
    fn drain(&mut self, budget: Option<usize>) -> bool {
        let classes = self.classes;
        let mut scanned = 0;
        loop {
            if budget.map_or(false, |b| scanned >= b) {
                return !self.marker.has_work();
            }
            let obj = match self.marker.stack.pop() {
                Some(obj) => obj,
                None => match self.marker.deferred.pop() {
                    Some(obj) => obj,
                    None => match self.marker.ready.pop() {
                        Some(property) => {
                            self.visiting = Some(property);
                            unsafe {
                                visit_pointers(classes, property, &mut |slot| self.mark_slot(slot))
                            };
                            self.visiting = None;
                            scanned += 1;
                            continue;
                        }
                        None => return true,
                    },
                },
            };
            unsafe { self.visit_object(obj) };
            scanned += 1;
        }
    }

    fn visit_root(&mut self, slot: Slot) {
        self.visiting = None;
        self.mark_slot(slot);
    }

    /// New-space objects are roots: everything old they refer to is live.
    fn visit_new_space(&mut self, heap_new_space: &crate::new_space::NewSpace) {
        let classes = self.classes;
        self.visiting = None;
        unsafe {
            heap_new_space.visit_objects(|obj| {
                visit_pointers(classes, obj, &mut |slot| self.mark_slot(slot));
            });
        }
    }
}

impl WeakResolver for MarkingVisitor<'_> {
    fn is_live(&mut self, key: ObjectPtr) -> bool {
        unsafe {
            let header = key.header();
            header.young() || header.marked()
        }
    }

    fn keep_alive(&mut self, slot: Slot) {
        self.visit_root(slot);
    }

    fn drain(&mut self) {
        MarkingVisitor::drain(self, None);
    }
}

#[inline]
unsafe fn is_dead(obj: ObjectPtr) -> bool {
    if !obj.is_heap_object() {
        return false;
    }
    let header = obj.header();
    !header.young() && !header.marked()
}

/// Clears every store-buffer entry and remembered bit. Marking re-adds what it finds.
fn reset_remembered_set(heap: &mut Heap) {
    for mut block in heap.store_buffer.take_blocks() {
        for &obj in block.entries() {
            unsafe { obj.set_header(obj.header().with_remembered(false)) };
        }
        block.reset();
        heap.store_buffer.return_block(block);
    }
    for page in heap.old_space.large_pages() {
        page.reset_cards();
    }
}

macro_rules! marking_visitor {
    ($heap: expr, $marker: expr) => {
        MarkingVisitor {
            classes: &$heap.classes,
            old_space: &$heap.old_space,
            store_buffer: &mut $heap.store_buffer,
            marker: $marker,
            visiting: None,
        }
    };
}

fn mark_roots(heap: &mut Heap, marker: &mut Marker) {
    let mut visitor = marking_visitor!(heap, marker);
    heap.roots.visit_all(&mut |slot| visitor.visit_root(slot));
    visitor.visit_new_space(&heap.new_space);
}

/// Starts a marking cycle: prologue callback, remembered-set reset, compactor candidate
/// selection and the roots. Returns with gray objects left for [`mark_step`].
///
/// `rebuild_store_buffer` is only safe when no scavenge can run before marking finishes:
/// the remembered set is then rebuilt from what marking visits.
pub(crate) fn start_marking(
    heap: &mut Heap,
    invoke_api_callbacks: bool,
    collect_code: bool,
    rebuild_store_buffer: bool,
) {
    debug_assert!(heap.marker.is_none());
    if invoke_api_callbacks {
        if let Some(callback) = heap.gc_prologue_callback.as_mut() {
            callback(&mut heap.weak_sets);
        }
    }
    if rebuild_store_buffer {
        reset_remembered_set(heap);
    }
    let mut marker = Box::new(Marker::new(collect_code, rebuild_store_buffer));
    IncrementalCompactor::prologue(heap);
    mark_roots(heap, &mut marker);
    log::debug!(
        "[gc] marking started, {} objects gray after roots",
        marker.stack.len()
    );
    heap.marker = Some(marker);
}

/// Scans up to `budget` gray objects. Returns true once marking has no work left.
pub(crate) fn mark_step(heap: &mut Heap, budget: usize) -> bool {
    let mut marker = match heap.marker.take() {
        Some(marker) => marker,
        None => return true,
    };
    let done = marking_visitor!(heap, &mut marker).drain(Some(budget));
    heap.marker = Some(marker);
    done
}

/// Outcome of a completed mark-sweep cycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct MarkSweepStats {
    pub marked_bytes: usize,
    pub detached_functions: usize,
    pub compacted: bool,
    pub sweep: SweepStats,
}

/// Completes the cycle: final closure, weak processing, code detaching, pruning, then
/// compaction and sweeping.
pub(crate) fn finish_marking(heap: &mut Heap) -> Option<MarkSweepStats> {
    let mut marker = heap.marker.take()?;
    // Roots may have changed without barriers since the cycle started.
    mark_roots(heap, &mut marker);
    {
        let mut visitor = marking_visitor!(heap, &mut marker);
        visitor.drain(None);
        let unresolved = resolve_weak_reference_sets(&mut heap.weak_sets, &mut visitor);
        if unresolved > 0 {
            log::debug!("[gc] {} weak reference sets left for the next cycle", unresolved);
        }
    }
    heap.weak_sets.visit(&mut |slot| unsafe {
        if is_dead(*slot) {
            *slot = ObjectPtr::NULL;
        }
    });

    for (key, properties) in marker.delayed.drain() {
        unsafe {
            key.set_header(key.header().with_watched(false));
            for property in properties {
                property.set_field(layout::WEAK_PROPERTY_KEY, ObjectPtr::NULL);
                property.set_field(layout::WEAK_PROPERTY_VALUE, ObjectPtr::NULL);
            }
        }
    }

    let stub = heap.roots.lazy_compile_stub;
    let mut detached = 0;
    for &function in marker.functions.iter() {
        unsafe {
            if kind_of(&heap.classes, function) != ClassKind::Function {
                continue;
            }
            let code = function.field(layout::FUNCTION_CODE);
            if is_dead(code) {
                function.set_field(layout::FUNCTION_CODE, stub);
                detached += 1;
                if stub.is_heap_object() && stub.header().young() {
                    let header = function.header();
                    if !header.remembered() {
                        function.set_header(header.with_remembered(true));
                        heap.store_buffer.add_object(function);
                    }
                }
            }
        }
    }

    heap.weak_tables
        .rekey_all(|key| if unsafe { is_dead(key) } { None } else { Some(key) });
    heap.id_ring.visit(&mut |slot| unsafe {
        if is_dead(*slot) {
            *slot = ObjectPtr::NULL;
        }
    });
    heap.finalizable_handles.process(|handle| {
        if unsafe { is_dead(handle.referent()) } {
            HandleFate::Finalize { young: false }
        } else {
            HandleFate::Retain
        }
    });
    if !marker.rebuild_store_buffer {
        for block in heap.store_buffer.blocks_mut().iter_mut() {
            block.retain_map(|obj| if unsafe { is_dead(obj) } { None } else { Some(obj) });
        }
    }

    let marked_bytes = marker.marked_bytes;
    let evacuation_bytes = marker.evacuation_bytes;
    let duration = marker.started.elapsed();
    log::debug!(
        "[gc] marking done: {} bytes marked ({} on evacuation candidates), {} functions detached, {:?}",
        marked_bytes,
        evacuation_bytes,
        detached,
        duration
    );
    drop(marker);

    let compacted = IncrementalCompactor::epilogue(heap);
    let swept = sweep(heap);
    Some(MarkSweepStats {
        marked_bytes,
        detached_functions: detached,
        compacted,
        sweep: swept,
    })
}

/// Abandons the cycle without reclaiming anything.
pub(crate) fn abort_marking(heap: &mut Heap) {
    let marker = match heap.marker.take() {
        Some(marker) => marker,
        None => return,
    };
    drop(marker);
    unsafe {
        heap.old_space.visit_objects(|obj| {
            let header = obj.header();
            if header.marked() || header.watched() {
                obj.set_header(header.with_marked(false).with_watched(false));
            }
        });
    }
    IncrementalCompactor::abort(heap);
    log::debug!("[gc] marking aborted");
}
