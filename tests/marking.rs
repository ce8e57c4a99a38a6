use std::cell::Cell;
use std::rc::Rc;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use gencompact::{
    object::{layout, CODE_CID, INSTANCE_CID},
    Config, Heap, ObjectPtr, ThreadId,
};

fn heap() -> (Heap, ThreadId) {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = Config::default()
        .with_semi_space_size(256 * 1024)
        .with_workers(3)
        .with_verification(true, true)
        .with_verbose(true);
    let mut heap = Heap::new(config).unwrap();
    let thread = heap.add_thread("main");
    (heap, thread)
}

fn push(heap: &mut Heap, thread: ThreadId, obj: ObjectPtr) -> usize {
    heap.thread_mut(thread).unwrap().push(obj)
}

fn get(heap: &Heap, thread: ThreadId, index: usize) -> ObjectPtr {
    heap.thread(thread).unwrap().get(index)
}

/// Two scavenges tenure every survivor.
fn promote(heap: &mut Heap) {
    heap.scavenge();
    heap.scavenge();
}

fn old_instance(heap: &mut Heap, tag: isize) -> ObjectPtr {
    let obj = heap.allocate_old(INSTANCE_CID, 32).unwrap();
    heap.store(obj, 0, ObjectPtr::from_smi(tag));
    obj
}

#[test]
fn unreachable_old_objects_are_swept() {
    let (mut heap, thread) = heap();
    let keep = old_instance(&mut heap, 1);
    push(&mut heap, thread, keep);
    for i in 0..5000 {
        old_instance(&mut heap, i);
    }
    let before = heap.statistics().old_space_used;

    let stats = heap.mark_objects(false, false);
    let after = heap.statistics().old_space_used;
    assert!(after < before, "{} -> {}", before, after);
    assert!(stats.sweep.free_bytes > 0);
    let keep = get(&heap, thread, 0);
    assert_eq!(heap.load(keep, 0), ObjectPtr::from_smi(1));
    unsafe { assert!(!keep.header().marked()) };
    assert_eq!(heap.statistics().mark_sweeps, 1);
}

#[test]
fn swept_memory_is_reused() {
    let (mut heap, _thread) = heap();
    for i in 0..5000 {
        old_instance(&mut heap, i);
    }
    heap.mark_objects(false, false);
    let pages = heap.statistics().old_space_pages;
    for i in 0..1000 {
        old_instance(&mut heap, i);
    }
    assert!(heap.statistics().old_space_pages <= pages);
}

#[test]
fn dead_large_objects_release_their_pages() {
    let (mut heap, thread) = heap();
    let keep = heap.allocate_bytes(64 * 1024).unwrap();
    push(&mut heap, thread, keep);
    heap.allocate_bytes(64 * 1024).unwrap();
    heap.allocate_bytes(64 * 1024).unwrap();
    assert_eq!(heap.statistics().large_pages, 3);

    let stats = heap.mark_objects(false, false);
    assert_eq!(stats.sweep.released_large_pages, 2);
    assert_eq!(heap.statistics().large_pages, 1);
}

#[test]
fn young_objects_keep_old_objects_alive() {
    let (mut heap, thread) = heap();
    let old = old_instance(&mut heap, 5);
    let young = heap.allocate_instance(INSTANCE_CID, 1).unwrap();
    heap.store(young, 0, old);
    push(&mut heap, thread, young);

    heap.mark_objects(false, false);
    let young = get(&heap, thread, 0);
    assert_eq!(heap.load(heap.load(young, 0), 0), ObjectPtr::from_smi(5));
    heap.verify();
}

#[test]
fn old_to_young_references_are_remembered_again() {
    let (mut heap, thread) = heap();
    let old = old_instance(&mut heap, 0);
    push(&mut heap, thread, old);
    let young = heap.allocate_instance(INSTANCE_CID, 1).unwrap();
    heap.store(old, 1, young);

    heap.mark_objects(false, false);
    let old = get(&heap, thread, 0);
    unsafe { assert!(old.header().remembered()) };
    heap.scavenge();
    assert!(heap.load(old, 1).is_heap_object());
}

#[test]
fn weak_properties_with_dead_keys_are_cleared() {
    let (mut heap, thread) = heap();
    let key = old_instance(&mut heap, 1);
    let value = old_instance(&mut heap, 2);
    let live_key = old_instance(&mut heap, 3);
    push(&mut heap, thread, live_key);
    let dead = heap.allocate_weak_property(key, value).unwrap();
    push(&mut heap, thread, dead);
    let live_key = get(&heap, thread, 0);
    let value = heap.allocate_instance(INSTANCE_CID, 1).unwrap();
    let live = heap.allocate_weak_property(live_key, value).unwrap();
    push(&mut heap, thread, live);
    promote(&mut heap);

    heap.mark_objects(false, false);
    let dead = get(&heap, thread, 1);
    assert!(heap.load(dead, layout::WEAK_PROPERTY_KEY).is_null());
    assert!(heap.load(dead, layout::WEAK_PROPERTY_VALUE).is_null());
    let live = get(&heap, thread, 2);
    assert_eq!(heap.load(live, layout::WEAK_PROPERTY_KEY), get(&heap, thread, 0));
    assert!(heap.load(live, layout::WEAK_PROPERTY_VALUE).is_heap_object());
    unsafe { assert!(!get(&heap, thread, 0).header().watched()) };
}

#[test]
fn weak_property_chain_resolves_during_marking() {
    let (mut heap, thread) = heap();
    let keys: Vec<ObjectPtr> = (0..6).map(|i| old_instance(&mut heap, i)).collect();
    for &key in keys.iter() {
        push(&mut heap, thread, key);
    }
    for i in 0..5 {
        let property = heap
            .allocate_weak_property(get(&heap, thread, i), get(&heap, thread, i + 1))
            .unwrap();
        push(&mut heap, thread, property);
    }
    promote(&mut heap);
    let first = get(&heap, thread, 0);
    let properties: Vec<ObjectPtr> = (6..11).map(|i| get(&heap, thread, i)).collect();
    let stack = heap.thread_mut(thread).unwrap();
    stack.truncate(0);
    for property in properties {
        stack.push(property);
    }
    stack.push(first);

    heap.mark_objects(false, false);
    for i in 0..5 {
        let property = get(&heap, thread, i);
        let key = heap.load(property, layout::WEAK_PROPERTY_KEY);
        let value = heap.load(property, layout::WEAK_PROPERTY_VALUE);
        assert_eq!(heap.load(key, 0), ObjectPtr::from_smi(i as isize));
        assert_eq!(heap.load(value, 0), ObjectPtr::from_smi(i as isize + 1));
    }
}

#[test]
fn unused_code_is_detached() {
    let (mut heap, thread) = heap();
    let code = heap.allocate_code(64).unwrap();
    let function = heap.allocate_function(code, ObjectPtr::NULL).unwrap();
    push(&mut heap, thread, function);
    let code = heap.allocate_code(64).unwrap();
    push(&mut heap, thread, code);
    let function = heap.allocate_function(code, ObjectPtr::NULL).unwrap();
    push(&mut heap, thread, function);
    promote(&mut heap);

    let stats = heap.mark_objects(false, true);
    assert_eq!(stats.detached_functions, 1);
    let stub = heap.lazy_compile_stub();
    assert_eq!(heap.load(get(&heap, thread, 0), layout::FUNCTION_CODE), stub);
    // Code that is referenced elsewhere stays attached.
    assert_eq!(
        heap.load(get(&heap, thread, 2), layout::FUNCTION_CODE),
        get(&heap, thread, 1)
    );
}

#[test]
fn code_is_kept_unless_requested() {
    let (mut heap, thread) = heap();
    let code = heap.allocate_code(64).unwrap();
    let function = heap.allocate_function(code, ObjectPtr::NULL).unwrap();
    push(&mut heap, thread, function);
    promote(&mut heap);

    let stats = heap.mark_objects(false, false);
    assert_eq!(stats.detached_functions, 0);
    let code = heap.load(get(&heap, thread, 0), layout::FUNCTION_CODE);
    assert_ne!(code, heap.lazy_compile_stub());
    unsafe { assert_eq!(code.class_id(), CODE_CID) };
}

#[test]
fn old_finalizers_run_after_marking() {
    let (mut heap, thread) = heap();
    let finalized = Arc::new(AtomicUsize::new(0));
    let obj = old_instance(&mut heap, 0);
    let counter = finalized.clone();
    let handle = heap.new_finalizable_handle(
        obj,
        3,
        256,
        Box::new(move |peer| {
            counter.fetch_add(peer, Ordering::SeqCst);
        }),
    );
    push(&mut heap, thread, obj);
    assert_eq!(heap.statistics().external_old, 256);

    heap.mark_objects(false, false);
    assert_eq!(finalized.load(Ordering::SeqCst), 0);
    assert!(heap.finalizable_handle(handle).is_some());

    heap.thread_mut(thread).unwrap().truncate(0);
    heap.mark_objects(false, false);
    assert_eq!(finalized.load(Ordering::SeqCst), 3);
    assert_eq!(heap.finalizable_handle(handle), None);
    assert_eq!(heap.statistics().external_old, 0);
}

#[test]
fn weak_reference_sets_keep_values_of_live_keys() {
    let (mut heap, thread) = heap();
    let key = old_instance(&mut heap, 1);
    let value = old_instance(&mut heap, 2);
    let dead_key = old_instance(&mut heap, 3);
    let dead_value = old_instance(&mut heap, 4);
    push(&mut heap, thread, key);
    let live = heap.add_weak_reference_set(vec![key], vec![value]);
    let dead = heap.add_weak_reference_set(vec![dead_key], vec![dead_value]);

    heap.mark_objects(false, false);
    let set = heap.weak_reference_set(live).unwrap();
    assert_eq!(set.keys()[0], get(&heap, thread, 0));
    assert_eq!(heap.load(set.values()[0], 0), ObjectPtr::from_smi(2));
    let set = heap.weak_reference_set(dead).unwrap();
    assert!(set.keys()[0].is_null());
    assert!(set.values()[0].is_null());
}

#[test]
fn prologue_callback_runs_when_requested() {
    let (mut heap, _thread) = heap();
    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    heap.set_gc_prologue_callback(Box::new(move |_sets| counter.set(counter.get() + 1)));

    heap.mark_objects(false, false);
    assert_eq!(calls.get(), 0);
    heap.mark_objects(true, false);
    assert_eq!(calls.get(), 1);
    heap.collect_all_garbage();
    assert_eq!(calls.get(), 2);
}

#[test]
fn object_ids_of_dead_objects_are_cleared() {
    let (mut heap, thread) = heap();
    let live = old_instance(&mut heap, 1);
    push(&mut heap, thread, live);
    let dead = old_instance(&mut heap, 2);
    let live_id = heap.object_id(live);
    let dead_id = heap.object_id(dead);

    heap.mark_objects(false, false);
    assert_eq!(heap.object_by_id(live_id), Some(get(&heap, thread, 0)));
    assert_eq!(heap.object_by_id(dead_id), None);
}

#[test]
fn incremental_marking_with_mutation_and_scavenges() {
    let (mut heap, thread) = heap();
    let holder = heap.allocate_old(INSTANCE_CID, 8 * 8).unwrap();
    push(&mut heap, thread, holder);
    let mut chain = ObjectPtr::NULL;
    for i in 0..2000 {
        let node = old_instance(&mut heap, i);
        heap.store(node, 1, chain);
        chain = node;
    }
    heap.store(holder, 0, chain);
    let hidden = old_instance(&mut heap, -1);
    let shelf = old_instance(&mut heap, -2);
    heap.store(shelf, 1, hidden);
    heap.store(holder, 1, shelf);

    heap.start_marking(false, false);
    assert!(heap.is_marking());
    assert!(!heap.mark_step(10));

    // Move the only reference to `hidden` into the already scanned holder.
    let shelf = heap.load(holder, 1);
    let hidden = heap.load(shelf, 1);
    heap.store(holder, 2, hidden);
    heap.store(shelf, 1, ObjectPtr::NULL);

    let young = heap.allocate_instance(INSTANCE_CID, 1).unwrap();
    heap.store(young, 0, ObjectPtr::from_smi(77));
    heap.store(holder, 3, young);
    let black = heap.allocate_old(INSTANCE_CID, 32).unwrap();
    unsafe { assert!(black.header().marked()) };
    heap.store(holder, 4, black);

    heap.scavenge();
    heap.scavenge();
    while !heap.mark_step(100) {}
    let stats = heap.finish_marking().unwrap();
    assert!(!heap.is_marking());
    assert!(stats.marked_bytes > 0);

    let holder = get(&heap, thread, 0);
    assert_eq!(heap.load(heap.load(holder, 2), 0), ObjectPtr::from_smi(-1));
    assert_eq!(heap.load(heap.load(holder, 3), 0), ObjectPtr::from_smi(77));
    let mut node = heap.load(holder, 0);
    let mut count = 0;
    while node.is_heap_object() {
        count += 1;
        node = heap.load(node, 1);
    }
    assert_eq!(count, 2000);
    heap.verify();
    assert!(heap.finish_marking().is_none());
}

#[test]
fn mark_objects_completes_a_started_cycle() {
    let (mut heap, thread) = heap();
    let obj = old_instance(&mut heap, 9);
    push(&mut heap, thread, obj);
    heap.start_marking(false, false);
    heap.mark_step(1);
    heap.mark_objects(false, false);
    assert!(!heap.is_marking());
    assert_eq!(heap.load(get(&heap, thread, 0), 0), ObjectPtr::from_smi(9));
    assert_eq!(heap.statistics().mark_sweeps, 1);
}

#[test]
fn aborted_marking_leaves_no_marks() {
    let (mut heap, thread) = heap();
    for i in 0..3000 {
        let obj = old_instance(&mut heap, i);
        if i % 10 == 0 {
            push(&mut heap, thread, obj);
        }
    }
    let used = heap.statistics().old_space_used;
    heap.start_marking(false, false);
    heap.mark_step(50);
    heap.abort_marking();
    assert!(!heap.is_marking());
    assert!(!heap.compactor().is_active());
    for i in 0..300 {
        let obj = get(&heap, thread, i);
        unsafe {
            assert!(!obj.header().marked());
            assert!(!obj.header().evacuation_candidate());
        }
        assert_eq!(heap.load(obj, 0), ObjectPtr::from_smi(i as isize * 10));
    }
    assert_eq!(heap.statistics().old_space_used, used);
    heap.verify();

    heap.mark_objects(false, false);
    assert!(heap.statistics().old_space_used < used);
}
