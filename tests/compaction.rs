use gencompact::{
    globals::PAGE_SIZE,
    object::{layout, INSTANCE_CID},
    select_evacuation_candidates, Config, Heap, ObjectPtr, PageUsage, ThreadId, WeakSelector,
};

fn heap(workers: usize) -> (Heap, ThreadId) {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = Config::default()
        .with_semi_space_size(256 * 1024)
        .with_workers(workers)
        .with_verification(true, true);
    let mut heap = Heap::new(config).unwrap();
    let thread = heap.add_thread("main");
    (heap, thread)
}

fn usage(area: usize, percent: usize) -> PageUsage {
    PageUsage {
        live_bytes: area * percent / 100,
        area_size: area,
        never_evacuate: false,
    }
}

#[test]
fn sparse_pages_within_budget_are_selected() {
    let area = 200_000;
    let pages = [usage(area, 10), usage(area, 90), usage(area, 30)];
    let budget = area * 40 / 100;
    assert_eq!(select_evacuation_candidates(&pages, budget), vec![0, 2]);
}

#[test]
fn lowering_the_budget_never_adds_candidates() {
    let area = 200_000;
    let pages = [usage(area, 10), usage(area, 90), usage(area, 30)];
    let wide = select_evacuation_candidates(&pages, area * 40 / 100);
    let narrow = select_evacuation_candidates(&pages, area * 15 / 100);
    assert_eq!(narrow, vec![0]);
    for page in narrow.iter() {
        assert!(wide.contains(page));
    }
    assert!(!wide.contains(&1));
    assert!(select_evacuation_candidates(&pages, 0).is_empty());
}

/// Fills old space with `count` objects and roots every `keep_every`th one.
fn fragment(heap: &mut Heap, thread: ThreadId, count: usize, keep_every: usize) {
    for i in 0..count {
        let obj = heap.allocate_old(INSTANCE_CID, 144).unwrap();
        heap.store(obj, 0, ObjectPtr::from_smi(i as isize));
        if i % keep_every == 0 {
            heap.thread_mut(thread).unwrap().push(obj);
        }
    }
}

fn check_survivors(heap: &Heap, thread: ThreadId, keep_every: usize) {
    let stack = heap.thread(thread).unwrap();
    for index in 0..stack.len() {
        let obj = stack.get(index);
        assert_eq!(
            heap.load(obj, 0),
            ObjectPtr::from_smi((index * keep_every) as isize)
        );
        unsafe {
            let header = obj.header();
            assert!(!header.evacuation_candidate());
            assert!(!header.marked());
        }
    }
}

fn compaction_releases_sparse_pages(workers: usize) {
    let (mut heap, thread) = heap(workers);
    fragment(&mut heap, thread, 20_000, 16);
    heap.mark_objects(false, false);
    check_survivors(&heap, thread, 16);
    let pages_before = heap.statistics().old_space_pages;

    let stats = heap.mark_objects(false, false);
    assert!(stats.compacted);
    let compaction = heap.compactor().last_compaction().copied().unwrap();
    assert!(compaction.candidates > 0);
    assert!(compaction.evacuated_bytes > 0);
    assert_eq!(compaction.aborted_pages, 0);
    assert!(compaction.released_pages > 0);
    assert!(heap.statistics().old_space_pages < pages_before);
    assert!(heap.statistics().compactions >= 1);

    check_survivors(&heap, thread, 16);
    heap.verify();
}

#[test]
fn compaction_releases_sparse_pages_serially() {
    compaction_releases_sparse_pages(1);
}

#[test]
fn compaction_releases_sparse_pages_in_parallel() {
    compaction_releases_sparse_pages(4);
}

#[test]
fn references_from_every_root_kind_are_forwarded() {
    let (mut heap, thread) = heap(2);
    fragment(&mut heap, thread, 8000, 32);
    heap.mark_objects(false, false);

    // One survivor per root kind, all on sparse pages.
    let target = heap.thread(thread).unwrap().get(1);
    let handle = heap.new_persistent_handle(target);
    heap.set_weak(WeakSelector::Peer, target, 17);
    let id = heap.object_id(target);
    let young = heap.allocate_instance(INSTANCE_CID, 2).unwrap();
    let target = heap.thread(thread).unwrap().get(1);
    heap.store(young, 0, target);
    heap.thread_mut(thread).unwrap().push(young);
    let property = heap.allocate_weak_property(target, young).unwrap();
    heap.thread_mut(thread).unwrap().push(property);
    let young = heap.load(property, layout::WEAK_PROPERTY_VALUE);
    let set = heap.add_weak_reference_set(vec![target], vec![young]);

    heap.mark_objects(false, false);
    let stack = heap.thread(thread).unwrap();
    let target = stack.get(1);
    let young = stack.get(stack.len() - 2);
    let property = stack.get(stack.len() - 1);
    assert_eq!(heap.load(target, 0), ObjectPtr::from_smi(32));
    assert_eq!(heap.persistent_handle(handle), target);
    assert_eq!(heap.get_weak(WeakSelector::Peer, target), Some(17));
    assert_eq!(heap.object_by_id(id), Some(target));
    assert_eq!(heap.load(young, 0), target);
    assert_eq!(heap.load(property, layout::WEAK_PROPERTY_KEY), target);
    let set = heap.weak_reference_set(set).unwrap();
    assert_eq!(set.keys()[0], target);
    heap.verify();
}

#[test]
fn compaction_survives_interleaved_scavenges() {
    let (mut heap, thread) = heap(3);
    fragment(&mut heap, thread, 10_000, 8);
    heap.mark_objects(false, false);

    heap.start_marking(false, false);
    assert!(heap.compactor().is_active());
    assert!(heap.compactor().candidates() > 0);
    for i in 0..200 {
        let young = heap.allocate_instance(INSTANCE_CID, 1).unwrap();
        heap.store(young, 0, ObjectPtr::from_smi(-(i as isize)));
        let holder = heap.thread(thread).unwrap().get(i);
        heap.store(holder, 1, young);
        heap.mark_step(20);
    }
    heap.scavenge();
    while !heap.mark_step(500) {}
    let stats = heap.finish_marking().unwrap();
    assert!(stats.compacted);

    check_survivors(&heap, thread, 8);
    for i in 0..200 {
        let holder = heap.thread(thread).unwrap().get(i);
        let young = heap.load(holder, 1);
        assert_eq!(heap.load(young, 0), ObjectPtr::from_smi(-(i as isize)));
    }
    heap.verify();
}

#[test]
fn evacuation_aborts_when_old_space_cannot_grow() {
    let _ = env_logger::builder().is_test(true).try_init();
    let limit = 3 * PAGE_SIZE;
    let mut heap = Heap::new(
        Config::default()
            .with_semi_space_size(PAGE_SIZE)
            .with_old_space_limits(limit, limit)
            .with_workers(2)
            .with_verification(false, true),
    )
    .unwrap();
    let thread = heap.add_thread("main");

    // Two full pages, then a third one where only every third object survives.
    let mut expected = Vec::new();
    let mut i = 0;
    loop {
        let stats = heap.statistics();
        if stats.old_space_pages == 3 && stats.old_space_capacity - stats.old_space_used < 1024 {
            break;
        }
        let obj = heap.allocate_old(INSTANCE_CID, 144).unwrap();
        heap.store(obj, 0, ObjectPtr::from_smi(i));
        if stats.old_space_pages < 3 || i % 3 == 0 {
            heap.thread_mut(thread).unwrap().push(obj);
            expected.push(i);
        }
        i += 1;
    }
    heap.mark_objects(false, false);

    // The sparse page is selected but nothing else has room for its survivors.
    let stats = heap.mark_objects(false, false);
    assert!(stats.compacted);
    let compaction = heap.compactor().last_compaction().copied().unwrap();
    assert_eq!(compaction.candidates, 1);
    assert_eq!(compaction.aborted_pages, 1);
    assert_eq!(compaction.released_pages, 0);
    assert_eq!(heap.statistics().old_space_pages, 3);

    let stack = heap.thread(thread).unwrap();
    for (index, &tag) in expected.iter().enumerate() {
        let obj = stack.get(index);
        assert_eq!(heap.load(obj, 0), ObjectPtr::from_smi(tag));
        unsafe { assert!(!obj.header().evacuation_candidate()) };
    }
    heap.verify();
}
