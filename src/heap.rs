use std::time::Instant;

use crate::{
    compactor::IncrementalCompactor,
    error::HeapError,
    globals::{LARGE_OBJECT_THRESHOLD, MIN_OBJECT_SIZE, OBJECT_ALIGNMENT, WORD_SIZE},
    handles::{FinalizableHandle, FinalizableHandles, Finalizer, PersistentHandle},
    header::{Header, HASH_MASK},
    marker::{self, MarkSweepStats, Marker},
    new_space::NewSpace,
    object::{
        is_pointer_slot, layout, ClassId, ClassKind, ClassTable, ObjectPtr, BYTES_CID, CODE_CID,
        FUNCTION_CID, STACK_MAP_CID, SUSPEND_STATE_CID, WEAK_PROPERTY_CID,
    },
    old_space::{GrowthPolicy, OldSpace},
    page::Page,
    r#become::Become,
    scavenger,
    statistics::{HeapStatistics, ScavengeHistory, ScavengeStats},
    store_buffer::StoreBuffer,
    thread::{RootSet, Thread, ThreadId},
    util::{align_up, formatted_size},
    verifier,
    weak::{
        ObjectIdRing, WeakReferenceSet, WeakReferenceSetId, WeakReferenceSets, WeakSelector,
        WeakTables,
    },
    Config,
};

/// Size of the object released when old space is exhausted, giving the embedder room to
/// report the failure.
const OOM_RESERVATION_SIZE: usize = 16 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcReason {
    RequestedByUser,
    AllocationFailure,
    OldSpaceFull,
}

/// Callback run at the start of marking when API callbacks are requested. It may add or
/// drop weak reference sets for the coming cycle.
pub type GcPrologueCallback = Box<dyn FnMut(&mut WeakReferenceSets)>;

/// A heap and everything its collectors need: spaces, remembered set, roots and weak
/// tables. All collections go through it; nothing is global.
pub struct Heap {
    pub(crate) config: Config,
    pub(crate) classes: ClassTable,
    pub(crate) new_space: NewSpace,
    pub(crate) old_space: OldSpace,
    pub(crate) store_buffer: StoreBuffer,
    pub(crate) roots: RootSet,
    pub(crate) finalizable_handles: FinalizableHandles,
    pub(crate) weak_tables: WeakTables,
    pub(crate) weak_sets: WeakReferenceSets,
    pub(crate) id_ring: ObjectIdRing,
    pub(crate) marker: Option<Box<Marker>>,
    pub(crate) compactor: IncrementalCompactor,
    pub(crate) gc_prologue_callback: Option<GcPrologueCallback>,
    pub(crate) scavenge_history: ScavengeHistory,
    pub(crate) early_tenure: bool,
    pub(crate) compactions: usize,
    pub(crate) becomes: usize,
    total_gcs: usize,
    scavenges: usize,
    mark_sweeps: usize,
    total_objects_allocated: usize,
    total_memory_allocated: usize,
    next_thread_id: usize,
    hash_state: u32,
}

impl Heap {
    pub fn new(config: Config) -> Result<Self, HeapError> {
        let new_space = NewSpace::new(config.semi_space_size)?;
        let old_space = OldSpace::new(config.old_space_soft_limit, config.old_space_hard_limit);
        let id_ring = ObjectIdRing::new(config.object_id_ring_capacity);
        let mut heap = Self {
            config,
            classes: ClassTable::new(),
            new_space,
            old_space,
            store_buffer: StoreBuffer::new(),
            roots: RootSet::new(),
            finalizable_handles: FinalizableHandles::new(),
            weak_tables: WeakTables::new(),
            weak_sets: WeakReferenceSets::new(),
            id_ring,
            marker: None,
            compactor: IncrementalCompactor::default(),
            gc_prologue_callback: None,
            scavenge_history: ScavengeHistory::new(),
            early_tenure: false,
            compactions: 0,
            becomes: 0,
            total_gcs: 0,
            scavenges: 0,
            mark_sweeps: 0,
            total_objects_allocated: 0,
            total_memory_allocated: 0,
            next_thread_id: 0,
            hash_state: 0x2545_f491,
        };
        let reservation = heap.allocate_old(BYTES_CID, OOM_RESERVATION_SIZE)?;
        unsafe {
            reservation.set_raw_field(layout::BYTES_LENGTH, OOM_RESERVATION_SIZE - 2 * WORD_SIZE)
        };
        heap.roots.oom_reservation = reservation;
        heap.roots.lazy_compile_stub = heap.allocate_old(CODE_CID, 2 * WORD_SIZE)?;
        Ok(heap)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    pub fn register_class(&mut self, name: &str, kind: ClassKind) -> Result<ClassId, HeapError> {
        self.classes.register(name, kind)
    }

    pub fn is_marking(&self) -> bool {
        self.marker.is_some()
    }

    pub fn early_tenure(&self) -> bool {
        self.early_tenure
    }

    pub fn last_scavenge(&self) -> Option<&ScavengeStats> {
        self.scavenge_history.get(0)
    }

    pub fn compactor(&self) -> &IncrementalCompactor {
        &self.compactor
    }

    /// Stub installed in functions whose code was detached.
    pub fn lazy_compile_stub(&self) -> ObjectPtr {
        self.roots.lazy_compile_stub
    }

    pub fn is_young(&self, obj: ObjectPtr) -> bool {
        obj.is_heap_object() && self.new_space.contains(obj.addr())
    }

    pub fn is_old(&self, obj: ObjectPtr) -> bool {
        obj.is_heap_object() && self.old_space.contains(obj.addr())
    }

    fn object_size(&self, class_id: ClassId, size: usize) -> Result<usize, HeapError> {
        match self.classes.kind(class_id) {
            None | Some(ClassKind::FreeListElement) | Some(ClassKind::ForwardingCorpse) => {
                return Err(HeapError::InvalidClass(class_id))
            }
            Some(_) => {}
        }
        if size == 0 || size > self.old_space.hard_limit() {
            return Err(HeapError::InvalidSize(size));
        }
        Ok(align_up(size.max(MIN_OBJECT_SIZE), OBJECT_ALIGNMENT))
    }

    /// Zero-fills `[addr, addr + size)` and writes a header for it.
    unsafe fn initialize(&mut self, addr: usize, class_id: ClassId, size: usize, young: bool) -> ObjectPtr {
        std::ptr::write_bytes(addr as *mut u8, 0, size);
        let mut header = Header::for_object(class_id, size).with_young(young);
        if !young {
            if size > LARGE_OBJECT_THRESHOLD && self.classes.kind(class_id) == Some(ClassKind::Instance) {
                header = header.with_card_remembered(true);
            }
            // Black allocation while marking is in progress.
            header = header.with_marked(self.marker.is_some());
        }
        let obj = ObjectPtr::from_addr(addr);
        obj.set_header(header);
        self.total_objects_allocated += 1;
        self.total_memory_allocated += size;
        obj
    }

    /// Allocates a zero-filled object of `size` bytes, header included. Small objects start in
    /// new space; objects above `LARGE_OBJECT_THRESHOLD` get a page of their own in old space.
    ///
    /// Collects garbage as needed. Any `ObjectPtr` the caller holds outside the heap's roots
    /// is stale after this returns.
    pub fn allocate(&mut self, class_id: ClassId, size: usize) -> Result<ObjectPtr, HeapError> {
        let size = self.object_size(class_id, size)?;
        if size > LARGE_OBJECT_THRESHOLD {
            let addr = self.allocate_old_raw(size)?;
            return Ok(unsafe { self.initialize(addr, class_id, size, false) });
        }
        let addr = match self.new_space.try_allocate(size) {
            Some(addr) => addr,
            None => {
                self.collect_young(GcReason::AllocationFailure);
                match self.new_space.try_allocate(size) {
                    Some(addr) => addr,
                    None => {
                        let addr = self.allocate_old_raw(size)?;
                        return Ok(unsafe { self.initialize(addr, class_id, size, false) });
                    }
                }
            }
        };
        Ok(unsafe { self.initialize(addr, class_id, size, true) })
    }

    /// Allocates directly in old space.
    pub fn allocate_old(&mut self, class_id: ClassId, size: usize) -> Result<ObjectPtr, HeapError> {
        let size = self.object_size(class_id, size)?;
        let addr = self.allocate_old_raw(size)?;
        Ok(unsafe { self.initialize(addr, class_id, size, false) })
    }

    fn try_allocate_old(&self, size: usize) -> Option<usize> {
        if size > LARGE_OBJECT_THRESHOLD {
            self.old_space.allocate_large(size)
        } else {
            self.old_space.try_allocate(size)
        }
    }

    /// Unformatted old-space memory. Escalates from a full collection to forced growth and
    /// finally to releasing the out-of-memory reservation.
    pub(crate) fn allocate_old_raw(&mut self, size: usize) -> Result<usize, HeapError> {
        if let Some(addr) = self.try_allocate_old(size) {
            return Ok(addr);
        }
        self.collect_all_garbage_with_reason(GcReason::OldSpaceFull);
        if let Some(addr) = self.try_allocate_old(size) {
            return Ok(addr);
        }
        self.old_space.set_growth_policy(GrowthPolicy::Forced);
        let addr = self.try_allocate_old(size);
        self.old_space.set_growth_policy(GrowthPolicy::Controlled);
        if let Some(addr) = addr {
            return Ok(addr);
        }
        if !self.roots.oom_reservation.is_null() {
            log::warn!("[gc] old space exhausted, releasing the reservation");
            self.roots.oom_reservation = ObjectPtr::NULL;
            self.collect_all_garbage_with_reason(GcReason::OldSpaceFull);
            if let Some(addr) = self.try_allocate_old(size) {
                return Ok(addr);
            }
        }
        log::error!(
            "[gc] out of memory allocating {} (old space {} of {})",
            formatted_size(size),
            formatted_size(self.old_space.used_bytes()),
            formatted_size(self.old_space.hard_limit())
        );
        Err(HeapError::OutOfMemory { requested: size })
    }

    /// Allocates while keeping `protect` alive; the returned values are their current
    /// locations.
    fn allocate_protected<const N: usize>(
        &mut self,
        class_id: ClassId,
        size: usize,
        protect: [ObjectPtr; N],
    ) -> Result<(ObjectPtr, [ObjectPtr; N]), HeapError> {
        let base = self.roots.scratch.len();
        self.roots.scratch.extend_from_slice(&protect);
        let result = self.allocate(class_id, size);
        let mut current = protect;
        current.copy_from_slice(&self.roots.scratch[base..base + N]);
        self.roots.scratch.truncate(base);
        Ok((result?, current))
    }

    /// An instance with `num_fields` tagged fields, all null.
    pub fn allocate_instance(&mut self, class_id: ClassId, num_fields: usize) -> Result<ObjectPtr, HeapError> {
        if self.classes.kind(class_id) != Some(ClassKind::Instance) {
            return Err(HeapError::InvalidClass(class_id));
        }
        self.allocate(class_id, (num_fields + 1) * WORD_SIZE)
    }

    /// A byte array of `length` zero bytes.
    pub fn allocate_bytes(&mut self, length: usize) -> Result<ObjectPtr, HeapError> {
        let obj = self.allocate(BYTES_CID, 2 * WORD_SIZE + length)?;
        unsafe { obj.set_raw_field(layout::BYTES_LENGTH, length) };
        Ok(obj)
    }

    /// A code object of `length` instruction bytes.
    pub fn allocate_code(&mut self, length: usize) -> Result<ObjectPtr, HeapError> {
        let obj = self.allocate(CODE_CID, 2 * WORD_SIZE + length)?;
        unsafe { obj.set_raw_field(layout::BYTES_LENGTH, length) };
        Ok(obj)
    }

    pub fn allocate_weak_property(&mut self, key: ObjectPtr, value: ObjectPtr) -> Result<ObjectPtr, HeapError> {
        let size = (layout::WEAK_PROPERTY_WORDS + 1) * WORD_SIZE;
        let (obj, [key, value]) = self.allocate_protected(WEAK_PROPERTY_CID, size, [key, value])?;
        self.store(obj, layout::WEAK_PROPERTY_KEY, key);
        self.store(obj, layout::WEAK_PROPERTY_VALUE, value);
        Ok(obj)
    }

    pub fn allocate_function(&mut self, code: ObjectPtr, name: ObjectPtr) -> Result<ObjectPtr, HeapError> {
        let size = (layout::FUNCTION_WORDS + 1) * WORD_SIZE;
        let (obj, [code, name]) = self.allocate_protected(FUNCTION_CID, size, [code, name])?;
        self.store(obj, layout::FUNCTION_CODE, code);
        self.store(obj, layout::FUNCTION_NAME, name);
        Ok(obj)
    }

    /// A stack map describing a frame of `pointer_slots.len()` words; `true` entries hold
    /// tagged values.
    pub fn allocate_stack_map(&mut self, pointer_slots: &[bool]) -> Result<ObjectPtr, HeapError> {
        let bit_words = (pointer_slots.len() + 63) / 64;
        let obj = self.allocate(STACK_MAP_CID, (2 + bit_words) * WORD_SIZE)?;
        unsafe {
            obj.set_raw_field(layout::STACK_MAP_LENGTH, pointer_slots.len());
            for (i, &is_pointer) in pointer_slots.iter().enumerate() {
                if is_pointer {
                    let index = layout::STACK_MAP_BITS + i / 64;
                    obj.set_raw_field(index, obj.raw_field(index) | 1 << (i % 64));
                }
            }
        }
        Ok(obj)
    }

    /// A suspended frame holding `frame`, laid out according to `stack_map`. Only the words
    /// the stack map flags are treated as references.
    pub fn allocate_suspend_state(&mut self, stack_map: ObjectPtr, frame: &[ObjectPtr]) -> Result<ObjectPtr, HeapError> {
        let size = (layout::SUSPEND_STATE_FRAME + frame.len() + 1) * WORD_SIZE;
        let pointer_slots: Vec<usize> = if stack_map.is_heap_object() {
            (0..frame.len())
                .filter(|&i| unsafe { is_pointer_slot(stack_map, i) })
                .collect()
        } else {
            Vec::new()
        };

        let base = self.roots.scratch.len();
        self.roots.scratch.push(stack_map);
        self.roots.scratch.extend(pointer_slots.iter().map(|&i| frame[i]));
        let result = self.allocate(SUSPEND_STATE_CID, size);
        let protected: Vec<ObjectPtr> = self.roots.scratch.drain(base..).collect();
        let obj = result?;
        let mut frame = frame.to_vec();
        for (&i, &value) in pointer_slots.iter().zip(protected[1..].iter()) {
            frame[i] = value;
        }
        unsafe {
            obj.set_field(layout::SUSPEND_STATE_FRAME_LENGTH, ObjectPtr::from_smi(frame.len() as isize));
            for (i, &value) in frame.iter().enumerate() {
                obj.set_field(layout::SUSPEND_STATE_FRAME + i, value);
            }
        }
        self.store(obj, layout::SUSPEND_STATE_STACK_MAP, protected[0]);
        for &i in pointer_slots.iter() {
            self.store(obj, layout::SUSPEND_STATE_FRAME + i, frame[i]);
        }
        Ok(obj)
    }

    #[inline]
    pub fn load(&self, obj: ObjectPtr, index: usize) -> ObjectPtr {
        unsafe {
            debug_assert!(index < obj.payload_words());
            obj.field(index)
        }
    }

    /// Stores `value` into field `index` of `obj` through the write barrier.
    #[inline]
    pub fn store(&mut self, obj: ObjectPtr, index: usize, value: ObjectPtr) {
        unsafe {
            debug_assert!(index < obj.payload_words());
            obj.set_field(index, value);
            if !value.is_heap_object() {
                return;
            }
            let header = obj.header();
            let value_header = value.header();
            if !header.young() && value_header.young() {
                if header.card_remembered() {
                    (*Page::of(obj.addr())).remember_card(obj.field_addr(index));
                } else if !header.remembered() {
                    obj.set_header(header.with_remembered(true));
                    self.store_buffer.add_object(obj);
                }
            }
            if let Some(marker) = self.marker.as_deref_mut() {
                marker.barrier_mark(value);
            }
        }
    }

    /// Identity hash of `obj`, assigned on first request and kept across moves.
    pub fn identity_hash(&mut self, obj: ObjectPtr) -> u32 {
        unsafe {
            let header = obj.header();
            if header.hash() != 0 {
                return header.hash();
            }
            let mut hash = 0;
            while hash == 0 {
                // xorshift32
                let mut x = self.hash_state;
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                self.hash_state = x;
                hash = x & HASH_MASK;
            }
            obj.set_header(header.with_hash(hash));
            hash
        }
    }

    pub fn new_persistent_handle(&mut self, obj: ObjectPtr) -> PersistentHandle {
        self.roots.persistent.add(obj)
    }

    pub fn persistent_handle(&self, handle: PersistentHandle) -> ObjectPtr {
        self.roots.persistent.get(handle)
    }

    pub fn set_persistent_handle(&mut self, handle: PersistentHandle, obj: ObjectPtr) {
        self.roots.persistent.set(handle, obj);
    }

    pub fn delete_persistent_handle(&mut self, handle: PersistentHandle) {
        self.roots.persistent.remove(handle);
    }

    /// Weak handle whose `finalizer` runs with `peer` once `obj` dies. `external_size` is
    /// charged to the generation `obj` lives in.
    pub fn new_finalizable_handle(
        &mut self,
        obj: ObjectPtr,
        peer: usize,
        external_size: usize,
        finalizer: Finalizer,
    ) -> FinalizableHandle {
        let young = self.is_young(obj);
        self.finalizable_handles
            .add(obj, peer, external_size, finalizer, young)
    }

    /// Referent of a weak handle, `None` once it was finalized or deleted.
    pub fn finalizable_handle(&self, handle: FinalizableHandle) -> Option<ObjectPtr> {
        self.finalizable_handles.get(handle)
    }

    pub fn delete_finalizable_handle(&mut self, handle: FinalizableHandle) {
        let young = self
            .finalizable_handles
            .get(handle)
            .map_or(false, |obj| self.is_young(obj));
        self.finalizable_handles.remove(handle, young);
    }

    pub fn set_weak(&mut self, selector: WeakSelector, obj: ObjectPtr, value: usize) {
        self.weak_tables.table_mut(selector).set(obj, value);
    }

    pub fn get_weak(&self, selector: WeakSelector, obj: ObjectPtr) -> Option<usize> {
        self.weak_tables.table(selector).get(obj)
    }

    pub fn add_weak_reference_set(&mut self, keys: Vec<ObjectPtr>, values: Vec<ObjectPtr>) -> WeakReferenceSetId {
        self.weak_sets.add(WeakReferenceSet::new(keys, values))
    }

    pub fn weak_reference_set(&self, id: WeakReferenceSetId) -> Option<&WeakReferenceSet> {
        self.weak_sets.get(id)
    }

    pub fn remove_weak_reference_set(&mut self, id: WeakReferenceSetId) -> Option<WeakReferenceSet> {
        self.weak_sets.remove(id)
    }

    pub fn set_gc_prologue_callback(&mut self, callback: GcPrologueCallback) {
        self.gc_prologue_callback = Some(callback);
    }

    /// Debug id for `obj`, valid until the ring wraps around or the object dies.
    pub fn object_id(&mut self, obj: ObjectPtr) -> usize {
        self.id_ring.add(obj)
    }

    pub fn object_by_id(&self, id: usize) -> Option<ObjectPtr> {
        self.id_ring.get(id)
    }

    pub fn add_thread(&mut self, name: &str) -> ThreadId {
        let id = ThreadId(self.next_thread_id);
        self.next_thread_id += 1;
        self.roots.threads.push(Thread::new(id, name));
        id
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.roots.threads.iter().find(|t| t.id() == id)
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.roots.threads.iter_mut().find(|t| t.id() == id)
    }

    pub fn remove_thread(&mut self, id: ThreadId) {
        self.roots.threads.retain(|t| t.id() != id);
    }

    fn verify_if(&mut self, enabled: bool) {
        if enabled {
            verifier::verify_heap(self);
        }
    }

    /// Collects new space.
    pub fn scavenge(&mut self) -> ScavengeStats {
        self.collect_young(GcReason::RequestedByUser)
    }

    fn collect_young(&mut self, reason: GcReason) -> ScavengeStats {
        self.verify_if(self.config.verify_before_gc);
        let old_before = self.old_space.used_bytes();
        let stats = scavenger::scavenge(self);
        self.scavenges += 1;
        logln_if!(
            self.config.verbose,
            "[gc] GC({}) Pause Young ({:?}) Promoted {}(old space: {}->{}) {}->{} {:.4}ms",
            self.total_gcs,
            reason,
            formatted_size(stats.promoted),
            formatted_size(old_before),
            formatted_size(self.old_space.used_bytes()),
            formatted_size(stats.used_before),
            formatted_size(stats.used_after),
            stats.duration.as_micros() as f64 / 1000.0
        );
        self.total_gcs += 1;
        self.verify_if(self.config.verify_after_gc);
        stats
    }

    /// Stop-the-world mark-sweep of old space, with compaction of sparse pages. Completes an
    /// incremental cycle instead if one is in progress.
    pub fn mark_objects(&mut self, invoke_api_callbacks: bool, collect_code: bool) -> MarkSweepStats {
        self.mark_objects_with_reason(invoke_api_callbacks, collect_code, GcReason::RequestedByUser)
    }

    fn mark_objects_with_reason(
        &mut self,
        invoke_api_callbacks: bool,
        collect_code: bool,
        reason: GcReason,
    ) -> MarkSweepStats {
        let start = Instant::now();
        if self.marker.is_none() {
            self.verify_if(self.config.verify_before_gc);
            marker::start_marking(self, invoke_api_callbacks, collect_code, true);
        }
        self.finish_cycle(reason, start)
    }

    /// Starts an incremental marking cycle. Mutators keep running between [`mark_step`]
    /// calls, guarded by the write barrier in [`store`]; scavenges may happen in between.
    ///
    /// [`mark_step`]: Heap::mark_step
    /// [`store`]: Heap::store
    pub fn start_marking(&mut self, invoke_api_callbacks: bool, collect_code: bool) {
        if self.marker.is_some() {
            return;
        }
        self.verify_if(self.config.verify_before_gc);
        marker::start_marking(self, invoke_api_callbacks, collect_code, false);
    }

    /// Scans up to `budget` objects. Returns true when only the final pause is left.
    pub fn mark_step(&mut self, budget: usize) -> bool {
        marker::mark_step(self, budget)
    }

    /// Final pause of an incremental cycle. `None` if no cycle was in progress.
    pub fn finish_marking(&mut self) -> Option<MarkSweepStats> {
        if self.marker.is_none() {
            return None;
        }
        Some(self.finish_cycle(GcReason::RequestedByUser, Instant::now()))
    }

    fn finish_cycle(&mut self, reason: GcReason, start: Instant) -> MarkSweepStats {
        let before = self.old_space.used_bytes();
        let stats = marker::finish_marking(self).unwrap_or_default();
        self.mark_sweeps += 1;
        logln_if!(
            self.config.verbose,
            "[gc] GC({}) Pause Old ({:?}) {}->{}({}) {:.4}ms",
            self.total_gcs,
            reason,
            formatted_size(before),
            formatted_size(self.old_space.used_bytes()),
            formatted_size(self.old_space.capacity()),
            start.elapsed().as_micros() as f64 / 1000.0
        );
        self.total_gcs += 1;
        self.verify_if(self.config.verify_after_gc);
        stats
    }

    /// Abandons an incremental cycle. Candidate pages are released untouched.
    pub fn abort_marking(&mut self) {
        marker::abort_marking(self);
    }

    /// Scavenge followed by a full mark-sweep.
    pub fn collect_all_garbage(&mut self) {
        self.collect_all_garbage_with_reason(GcReason::RequestedByUser);
    }

    fn collect_all_garbage_with_reason(&mut self, reason: GcReason) {
        self.collect_young(reason);
        self.mark_objects_with_reason(true, false, reason);
    }

    /// Starts a become batch. The borrow keeps a second one from being opened meanwhile.
    pub fn become_objects(&mut self) -> Become<'_> {
        Become::new(self)
    }

    /// Checks every root and object, aborting on the first inconsistency. Returns the number
    /// of references checked.
    pub fn verify(&mut self) -> usize {
        verifier::verify_heap(self)
    }

    pub fn statistics(&self) -> HeapStatistics {
        HeapStatistics {
            new_space_used: self.new_space.used_bytes(),
            new_space_capacity: self.new_space.capacity(),
            old_space_used: self.old_space.used_bytes(),
            old_space_capacity: self.old_space.capacity(),
            old_space_pages: self.old_space.num_pages(),
            large_pages: self.old_space.num_large_pages(),
            external_new: self.finalizable_handles.external_new(),
            external_old: self.finalizable_handles.external_old(),
            scavenges: self.scavenges,
            mark_sweeps: self.mark_sweeps,
            compactions: self.compactions,
            becomes: self.becomes,
            total_objects_allocated: self.total_objects_allocated,
            total_memory_allocated: self.total_memory_allocated,
            early_tenure: self.early_tenure,
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if self.marker.is_some() {
            marker::abort_marking(self);
        }
    }
}
