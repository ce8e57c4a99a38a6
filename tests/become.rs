use gencompact::{
    object::{layout, INSTANCE_CID},
    Config, Heap, ObjectPtr, ThreadId, WeakSelector,
};

fn heap() -> (Heap, ThreadId) {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = Config::default()
        .with_semi_space_size(256 * 1024)
        .with_workers(2)
        .with_verification(true, true);
    let mut heap = Heap::new(config).unwrap();
    let thread = heap.add_thread("main");
    (heap, thread)
}

fn instance(heap: &mut Heap, tag: isize) -> ObjectPtr {
    let obj = heap.allocate_instance(INSTANCE_CID, 2).unwrap();
    heap.store(obj, 0, ObjectPtr::from_smi(tag));
    obj
}

fn get(heap: &Heap, thread: ThreadId, index: usize) -> ObjectPtr {
    heap.thread(thread).unwrap().get(index)
}

#[test]
fn holders_of_before_observe_after() {
    let (mut heap, thread) = heap();
    let before = instance(&mut heap, 1);
    let after = instance(&mut heap, 2);
    let young_holder = instance(&mut heap, 3);
    heap.store(young_holder, 1, before);
    let old_holder = heap.allocate_old(INSTANCE_CID, 32).unwrap();
    heap.store(old_holder, 1, before);
    let stack = heap.thread_mut(thread).unwrap();
    stack.push(young_holder);
    stack.push(old_holder);
    stack.push(before);
    let handle = heap.new_persistent_handle(before);
    heap.set_weak(WeakSelector::Peer, before, 5);

    let mut batch = heap.become_objects();
    batch.add(before, after);
    assert_eq!(batch.len(), 1);
    batch.forward();

    assert_eq!(heap.load(young_holder, 1), after);
    assert_eq!(heap.load(old_holder, 1), after);
    assert_eq!(get(&heap, thread, 2), after);
    assert_eq!(heap.persistent_handle(handle), after);
    assert_eq!(heap.get_weak(WeakSelector::Peer, after), Some(5));
    assert_eq!(heap.statistics().becomes, 1);

    // The corpse is unreferenced and disappears with the next scavenge.
    heap.scavenge();
    let holder = get(&heap, thread, 0);
    assert_eq!(heap.load(heap.load(holder, 1), 0), ObjectPtr::from_smi(2));
    heap.verify();
}

#[test]
fn identity_hash_moves_to_after() {
    let (mut heap, thread) = heap();
    let before = instance(&mut heap, 1);
    let after = instance(&mut heap, 2);
    heap.thread_mut(thread).unwrap().push(before);
    let hash = heap.identity_hash(before);

    let mut batch = heap.become_objects();
    batch.add(before, after);
    batch.forward();
    assert_eq!(heap.identity_hash(get(&heap, thread, 0)), hash);
}

#[test]
fn pairs_are_forwarded_together() {
    let (mut heap, thread) = heap();
    let a = instance(&mut heap, 1);
    let b = instance(&mut heap, 2);
    heap.store(a, 1, b);
    heap.store(b, 1, a);
    let stack = heap.thread_mut(thread).unwrap();
    stack.push(a);
    stack.push(b);
    heap.scavenge();
    heap.scavenge();
    let a = get(&heap, thread, 0);
    let b = get(&heap, thread, 1);
    assert!(heap.is_old(a) && heap.is_old(b));
    let a2 = instance(&mut heap, 10);
    let b2 = instance(&mut heap, 20);

    let mut batch = heap.become_objects();
    batch.add(a, a2);
    batch.add(b, b2);
    batch.forward();

    assert_eq!(get(&heap, thread, 0), a2);
    assert_eq!(get(&heap, thread, 1), b2);
    heap.scavenge();
    let a2 = get(&heap, thread, 0);
    assert_eq!(heap.load(a2, 0), ObjectPtr::from_smi(10));
    assert_eq!(heap.load(get(&heap, thread, 1), 0), ObjectPtr::from_smi(20));
    heap.verify();
}

#[test]
fn old_holders_of_young_targets_are_remembered() {
    let (mut heap, thread) = heap();
    let before = heap.allocate_old(INSTANCE_CID, 32).unwrap();
    let holder = heap.allocate_old(INSTANCE_CID, 32).unwrap();
    heap.store(holder, 0, before);
    heap.thread_mut(thread).unwrap().push(holder);
    let after = instance(&mut heap, 8);

    let mut batch = heap.become_objects();
    batch.add(before, after);
    batch.forward();

    unsafe { assert!(holder.header().remembered()) };
    heap.scavenge();
    assert_eq!(heap.load(heap.load(holder, 0), 0), ObjectPtr::from_smi(8));
}

#[test]
fn dummy_objects_can_be_redirected_later() {
    let (mut heap, thread) = heap();
    let dummy = {
        let mut batch = heap.become_objects();
        batch.make_dummy_object(48).unwrap()
    };
    let holder = instance(&mut heap, 0);
    heap.store(holder, 1, dummy);
    heap.thread_mut(thread).unwrap().push(holder);
    // A still referenced dummy survives collections.
    heap.collect_all_garbage();
    let holder = get(&heap, thread, 0);
    let dummy = heap.load(holder, 1);

    let real = instance(&mut heap, 42);
    let mut batch = heap.become_objects();
    batch.add(dummy, real);
    batch.forward();

    let holder = get(&heap, thread, 0);
    assert_eq!(heap.load(heap.load(holder, 1), 0), ObjectPtr::from_smi(42));
    heap.collect_all_garbage();
    heap.verify();
}

#[test]
fn become_during_marking_keeps_after_alive() {
    let (mut heap, thread) = heap();
    let before = heap.allocate_old(INSTANCE_CID, 32).unwrap();
    let holder = heap.allocate_old(INSTANCE_CID, 32).unwrap();
    heap.store(holder, 0, before);
    heap.thread_mut(thread).unwrap().push(holder);
    let after = heap.allocate_old(INSTANCE_CID, 32).unwrap();
    heap.store(after, 0, ObjectPtr::from_smi(6));

    heap.start_marking(false, false);
    // The sparse page holding `holder` is about to be evacuated.
    assert!(heap.compactor().candidates() > 0);
    unsafe { assert!(holder.header().evacuation_candidate()) };
    heap.mark_step(1);
    let mut batch = heap.become_objects();
    batch.add(before, after);
    batch.forward();
    assert_eq!(heap.load(holder, 0), after);
    heap.verify();
    heap.finish_marking().unwrap();

    let holder = get(&heap, thread, 0);
    assert_eq!(heap.load(heap.load(holder, 0), 0), ObjectPtr::from_smi(6));
    heap.verify();
}

#[test]
fn become_during_marking_wakes_properties_waiting_on_before() {
    let (mut heap, thread) = heap();
    let key = heap.allocate_old(INSTANCE_CID, 32).unwrap();
    let value = heap.allocate_old(INSTANCE_CID, 32).unwrap();
    heap.store(value, 0, ObjectPtr::from_smi(2));
    let after = heap.allocate_old(INSTANCE_CID, 32).unwrap();
    heap.store(after, 0, ObjectPtr::from_smi(1));
    let property = heap.allocate_weak_property(key, value).unwrap();
    let stack = heap.thread_mut(thread).unwrap();
    stack.push(property);
    stack.push(after);
    heap.scavenge();
    heap.scavenge();
    let property = get(&heap, thread, 0);
    assert!(heap.is_old(property));

    heap.start_marking(false, false);
    while !heap.mark_step(64) {}
    // Only the property refers to the key, so the property waits for it.
    unsafe { assert!(key.header().watched()) };
    let mut batch = heap.become_objects();
    batch.add(key, after);
    batch.forward();
    heap.finish_marking().unwrap();

    let property = get(&heap, thread, 0);
    let after = get(&heap, thread, 1);
    assert_eq!(heap.load(property, layout::WEAK_PROPERTY_KEY), after);
    let value = heap.load(property, layout::WEAK_PROPERTY_VALUE);
    assert_eq!(heap.load(value, 0), ObjectPtr::from_smi(2));
    unsafe { assert!(!after.header().watched()) };
    heap.verify();
}

#[test]
fn empty_batch_is_a_no_op() {
    let (mut heap, _thread) = heap();
    let batch = heap.become_objects();
    assert!(batch.is_empty());
    batch.forward();
    assert_eq!(heap.statistics().becomes, 0);
}

#[test]
#[should_panic(expected = "already forwards to")]
fn forwarding_a_corpse_again_is_fatal() {
    let (mut heap, thread) = heap();
    let a = instance(&mut heap, 1);
    let b = instance(&mut heap, 2);
    let c = instance(&mut heap, 3);
    let stack = heap.thread_mut(thread).unwrap();
    stack.push(b);
    stack.push(c);

    let mut batch = heap.become_objects();
    batch.add(a, b);
    batch.forward();
    // `a` is a stale reference to the corpse left behind.
    let mut batch = heap.become_objects();
    batch.add(a, c);
    batch.forward();
}

#[test]
#[should_panic(expected = "is itself forwarded")]
fn forwarding_to_a_corpse_is_fatal() {
    let (mut heap, thread) = heap();
    let a = instance(&mut heap, 1);
    let b = instance(&mut heap, 2);
    let c = instance(&mut heap, 3);
    let stack = heap.thread_mut(thread).unwrap();
    stack.push(b);
    stack.push(c);

    let mut batch = heap.become_objects();
    batch.add(a, b);
    batch.forward();
    // `a` is now a corpse and cannot start a forwarding chain.
    let mut batch = heap.become_objects();
    batch.add(c, a);
    batch.forward();
}

#[test]
#[should_panic(expected = "would forward to itself")]
fn self_forward_is_fatal() {
    let (mut heap, _thread) = heap();
    let a = instance(&mut heap, 1);
    let mut batch = heap.become_objects();
    batch.add(a, a);
    batch.forward();
}

#[test]
#[should_panic(expected = "immediate")]
fn forwarding_immediates_is_fatal() {
    let (mut heap, _thread) = heap();
    let a = instance(&mut heap, 1);
    let mut batch = heap.become_objects();
    batch.add(a, ObjectPtr::from_smi(3));
    batch.forward();
}
