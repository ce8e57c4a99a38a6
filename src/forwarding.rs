//! Forwarding state of moved objects and the reference-rewriting pass shared by the
//! compactor and become.
//!
//! Two encodings exist. The scavenger overwrites the header of a copied from-space object
//! with a [`ForwardingWord`]; from-space is abandoned afterwards so nothing else needs to
//! survive. Old-space moves overlay the vacated memory with a [`ForwardingCorpse`], a real
//! object of the original size, so pages stay walkable until the forwarding pass has
//! rewritten every reference.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::{
    globals::OBJECT_ALIGNMENT,
    header::Header,
    heap::Heap,
    object::{
        kind_of, visit_pointers, visit_suspend_state_frame, ClassKind, ClassTable, ObjectPtr,
        Slot, FORWARDING_CORPSE_CID,
    },
    page::Page,
    thread_pool::{run_parallel, ThreadBarrier, WorkCursor},
    util::BitFieldTrait,
};

struct ForwardedTag;
impl BitFieldTrait<0, 1> for ForwardedTag {}
struct ForwardedAddress;
impl BitFieldTrait<4, 59> for ForwardedAddress {}

/// Header word of a from-space object the scavenger already copied.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ForwardingWord(u64);

impl ForwardingWord {
    #[inline(always)]
    pub fn new(target: usize) -> Self {
        debug_assert!(target % OBJECT_ALIGNMENT == 0);
        ForwardingWord(
            ForwardedTag::encode(1) | ForwardedAddress::encode((target as u64) >> 4),
        )
    }

    /// Interprets a header word, `None` for a live header.
    #[inline(always)]
    pub fn from_header_word(word: u64) -> Option<Self> {
        if Self::is_forwarding(word) {
            Some(ForwardingWord(word))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn is_forwarding(word: u64) -> bool {
        ForwardedTag::decode(word) != 0
    }

    #[inline(always)]
    pub fn forwarded_address(self) -> usize {
        (ForwardedAddress::decode(self.0) << 4) as usize
    }

    #[inline(always)]
    pub fn target(self) -> ObjectPtr {
        ObjectPtr::from_addr(self.forwarded_address())
    }

    #[inline(always)]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Size-preserving overlay redirecting references to another object.
///
/// Layout: header (class id `FORWARDING_CORPSE_CID`), target, and when the size does not fit
/// the header's size tag, the size in the following word.
pub struct ForwardingCorpse;

impl ForwardingCorpse {
    const TARGET: usize = 0;
    const SIZE: usize = 1;

    /// Overlays `[addr, addr + size)` with a corpse pointing at `target`.
    ///
    /// # Safety
    /// The memory must be owned by the caller and at least `size` bytes long.
    pub unsafe fn write(addr: usize, size: usize, target: ObjectPtr) -> ObjectPtr {
        let obj = ObjectPtr::from_addr(addr);
        let header = Header::for_object(FORWARDING_CORPSE_CID, size);
        obj.set_header(header);
        obj.set_field(Self::TARGET, target);
        if header.tagged_size().is_none() {
            obj.set_raw_field(Self::SIZE, size);
        }
        if obj.heap_size() != size {
            crate::fatal!(
                "corpse at {:#x} reports {} bytes, expected {}",
                addr,
                obj.heap_size(),
                size
            );
        }
        obj
    }

    /// A self-forwarding placeholder. It counts as "not yet forwarded" for become.
    pub unsafe fn write_dummy(addr: usize, size: usize) -> ObjectPtr {
        Self::write(addr, size, ObjectPtr::from_addr(addr))
    }

    #[inline(always)]
    pub unsafe fn is_forwarding(obj: ObjectPtr) -> bool {
        obj.class_id() == FORWARDING_CORPSE_CID
    }

    #[inline(always)]
    pub unsafe fn forwarded_address(obj: ObjectPtr) -> ObjectPtr {
        debug_assert!(Self::is_forwarding(obj));
        obj.field(Self::TARGET)
    }

    pub unsafe fn is_dummy(obj: ObjectPtr) -> bool {
        Self::is_forwarding(obj) && Self::forwarded_address(obj) == obj
    }

    /// Retargets an existing corpse.
    pub unsafe fn set_forward(obj: ObjectPtr, target: ObjectPtr) {
        if !Self::is_forwarding(obj) {
            crate::fatal!("{:?} is not a forwarding corpse", obj);
        }
        if target == obj {
            crate::fatal!("self-forward of {:?}", obj);
        }
        obj.set_field(Self::TARGET, target);
    }
}

/// Rewrites `slot` if it refers to a corpse. Returns the new value when it changed.
#[inline]
pub(crate) unsafe fn forward_slot(slot: Slot) -> Option<ObjectPtr> {
    let value = *slot;
    if !value.is_heap_object() || !ForwardingCorpse::is_forwarding(value) {
        return None;
    }
    let target = ForwardingCorpse::forwarded_address(value);
    if target == value {
        return None;
    }
    if !target.is_heap_object() {
        crate::fatal!("{:?} forwards to immediate {:?}", value, target);
    }
    *slot = target;
    Some(target)
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ForwardingMode {
    /// After evacuation: only marked objects outside candidate pages are live.
    Compaction,
    /// After become: every object may refer to a `before`.
    Become,
}

/// Raw pointer handed to GC workers that touch disjoint parts of the pointee.
pub(crate) struct SendPtr<T>(pub(crate) *mut T);
unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

impl<T> Clone for SendPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SendPtr<T> {}

impl<T> SendPtr<T> {
    pub(crate) fn new(value: &mut T) -> Self {
        SendPtr(value as *mut T)
    }

    pub(crate) fn get(&self) -> *mut T {
        self.0
    }
}

/// Forwards the fields of `obj` and reports whether an old holder now refers to a young
/// object. Suspend states only get their stack map forwarded and are returned for the
/// final step.
unsafe fn forward_object(
    classes: &ClassTable,
    obj: ObjectPtr,
    suspend_states: &mut Vec<ObjectPtr>,
) -> bool {
    let header = obj.header();
    let old_holder = !header.young();
    let mut young_target = false;
    let mut f = |slot: Slot| {
        if let Some(target) = forward_slot(slot) {
            if old_holder && target.header().young() {
                if header.card_remembered() {
                    (*Page::of(obj.addr())).remember_card(slot);
                } else {
                    young_target = true;
                }
            }
        }
    };
    if kind_of(classes, obj) == ClassKind::SuspendState {
        f(obj.field_addr(crate::object::layout::SUSPEND_STATE_STACK_MAP));
        suspend_states.push(obj);
    } else {
        visit_pointers(classes, obj, &mut f);
    }
    young_target
}

/// Store-buffer entries after forwarding. An evacuated entry is replaced by its copy, which
/// inherited the remembered bit. A become target takes over the entry unless it is young or
/// already remembered on its own. Entries left on candidate pages are dead and dropped.
unsafe fn forward_store_buffer_entry(obj: ObjectPtr, mode: ForwardingMode) -> Option<ObjectPtr> {
    if ForwardingCorpse::is_forwarding(obj) {
        let target = ForwardingCorpse::forwarded_address(obj);
        if mode == ForwardingMode::Compaction {
            return Some(target);
        }
        let header = target.header();
        if header.young() || header.remembered() {
            return None;
        }
        target.set_header(header.with_remembered(true));
        return Some(target);
    }
    if mode == ForwardingMode::Compaction && (*Page::of(obj.addr())).is_evacuation_candidate() {
        return None;
    }
    Some(obj)
}

/// Rewrites every reference to a forwarding corpse in the heap and its roots.
///
/// Runs on `config.workers` tasks. Units are claimed through cursors and the steps are
/// separated by barrier syncs where a later step reads what an earlier one wrote: stack maps
/// read by the roots and by suspend states must be forwarded first.
pub(crate) fn forward_heap(heap: &mut Heap, mode: ForwardingMode) {
    let workers = heap.config.workers;
    let classes = &heap.classes;
    let new_space = &heap.new_space;
    let old_space = &heap.old_space;

    let roots = SendPtr::new(&mut heap.roots);
    let blocks: Vec<_> = heap
        .store_buffer
        .blocks_mut()
        .iter_mut()
        .map(|b| SendPtr::new(&mut **b))
        .collect();
    let handle_blocks: Vec<_> = heap
        .finalizable_handles
        .blocks_mut()
        .iter_mut()
        .map(SendPtr::new)
        .collect();
    let weak_tables: Vec<_> = heap
        .weak_tables
        .tables_mut()
        .iter_mut()
        .map(SendPtr::new)
        .collect();
    let weak_sets = SendPtr::new(&mut heap.weak_sets);
    let id_ring = SendPtr::new(&mut heap.id_ring);

    let large_pages = old_space.large_pages();
    let old_pages: Vec<&Page> = old_space
        .regular_pages()
        .into_iter()
        .filter(|p| mode == ForwardingMode::Become || !p.is_evacuation_candidate())
        .chain(large_pages.iter().copied())
        .collect();

    let barrier = ThreadBarrier::new();
    let oom_cursor = WorkCursor::new(1);
    let block_cursor = WorkCursor::new(blocks.len());
    let card_cursor = WorkCursor::new(large_pages.len());
    let new_space_cursor = WorkCursor::new(1);
    let handle_cursor = WorkCursor::new(handle_blocks.len());
    let weak_cursor = WorkCursor::new(weak_tables.len() + 1);
    let id_ring_cursor = WorkCursor::new(1);
    let page_cursor = WorkCursor::new(old_pages.len());
    let roots_cursor = WorkCursor::new(1);
    let suspend_states = Mutex::new(Vec::new());
    let remembered = Mutex::new(Vec::new());
    let suspend_next = AtomicUsize::new(0);

    run_parallel(workers, |_| {
        let participant = match barrier.try_enter() {
            Some(participant) => participant,
            None => return,
        };
        let mut local_suspend_states = Vec::new();
        let mut local_remembered = Vec::new();
        unsafe {
            oom_cursor.for_each(|_| {
                (*roots.get()).visit_oom_reservation(&mut |slot| {
                    forward_slot(slot);
                })
            });
            block_cursor.for_each(|i| {
                (*blocks[i].get()).retain_map(|obj| forward_store_buffer_entry(obj, mode));
            });
            card_cursor.for_each(|i| {
                large_pages[i].visit_remembered_cards(|from, to| {
                    let mut slot = from;
                    while slot < to {
                        forward_slot(slot);
                        slot = slot.add(1);
                    }
                });
            });
        }
        participant.sync();

        unsafe {
            new_space_cursor.for_each(|_| {
                new_space.visit_objects(|obj| {
                    forward_object(classes, obj, &mut local_suspend_states);
                });
            });
            handle_cursor.for_each(|i| {
                for handle in (*handle_blocks[i].get()).iter_mut().flatten() {
                    forward_slot(handle.referent_slot());
                }
            });
            weak_cursor.for_each(|i| {
                if i < weak_tables.len() {
                    (*weak_tables[i].get()).rekey(|key| {
                        let mut key = key;
                        forward_slot(&mut key);
                        Some(key)
                    });
                } else {
                    (*weak_sets.get()).visit(&mut |slot| {
                        forward_slot(slot);
                    });
                }
            });
            id_ring_cursor.for_each(|_| {
                (*id_ring.get()).visit(&mut |slot| {
                    forward_slot(slot);
                })
            });
            page_cursor.for_each(|i| {
                let page = old_pages[i];
                page.visit_objects(|obj| {
                    let header = obj.header();
                    if mode == ForwardingMode::Compaction && !header.marked() {
                        return;
                    }
                    if forward_object(classes, obj, &mut local_suspend_states)
                        && !header.remembered()
                    {
                        obj.set_header(header.with_remembered(true));
                        local_remembered.push(obj);
                    }
                });
            });
        }
        suspend_states.lock().append(&mut local_suspend_states);
        participant.sync();

        unsafe {
            roots_cursor.for_each(|_| {
                (*roots.get()).visit_roots(&mut |slot| {
                    forward_slot(slot);
                })
            });
        }
        participant.sync();

        let states = suspend_states.lock().clone();
        loop {
            let i = suspend_next.fetch_add(1, Ordering::Relaxed);
            if i >= states.len() {
                break;
            }
            let state = states[i];
            unsafe {
                let old_holder = !state.header().young();
                let mut young_target = false;
                visit_suspend_state_frame(state, &mut |slot| {
                    if let Some(target) = forward_slot(slot) {
                        young_target |= old_holder && target.header().young();
                    }
                });
                let header = state.header();
                if young_target && !header.remembered() {
                    state.set_header(header.with_remembered(true));
                    local_remembered.push(state);
                }
            }
        }
        remembered.lock().append(&mut local_remembered);
    });

    let remembered = remembered.into_inner();
    let suspend_states = suspend_states.into_inner().len();
    for obj in remembered {
        heap.store_buffer.add_object(obj);
    }
    log::debug!(
        "[gc] forwarding pass ({:?}) done, {} suspend states",
        mode,
        suspend_states
    );
}
