//! Randomized object graphs must look the same after every kind of collection.

use std::collections::{BTreeMap, HashMap, VecDeque};

use gencompact::{object::INSTANCE_CID, ClassKind, Config, Heap, ObjectPtr, ThreadId};
use rand::{rngs::StdRng, Rng, SeedableRng};

const FIELDS: usize = 4;

/// Node id followed by the ids (or immediates) of its fields.
type Shape = BTreeMap<isize, Vec<Result<isize, isize>>>;

fn heap(workers: usize) -> (Heap, ThreadId) {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = Config::default()
        .with_semi_space_size(128 * 1024)
        .with_workers(workers)
        .with_verification(true, true);
    let mut heap = Heap::new(config).unwrap();
    let thread = heap.add_thread("main");
    (heap, thread)
}

/// Allocates `count` nodes, wires them randomly and keeps the first `roots` on the stack.
fn build(heap: &mut Heap, thread: ThreadId, rng: &mut StdRng, count: usize, roots: usize) {
    let node_class = heap.register_class("Node", ClassKind::Instance).unwrap();
    for i in 0..count {
        let old = rng.gen_bool(0.3);
        let node = if old {
            heap.allocate_old(node_class, (FIELDS + 2) * 8).unwrap()
        } else {
            heap.allocate_instance(node_class, FIELDS + 1).unwrap()
        };
        heap.store(node, 0, ObjectPtr::from_smi(i as isize));
        heap.thread_mut(thread).unwrap().push(node);
        // Garbage between nodes keeps the collectors busy.
        for _ in 0..rng.gen_range(0..4) {
            heap.allocate_instance(INSTANCE_CID, rng.gen_range(1..16)).unwrap();
        }
    }
    for i in 0..count {
        for field in 1..=FIELDS {
            let value = if rng.gen_bool(0.7) {
                heap.thread(thread).unwrap().get(rng.gen_range(0..count))
            } else {
                ObjectPtr::from_smi(rng.gen_range(-100..100))
            };
            let node = heap.thread(thread).unwrap().get(i);
            heap.store(node, field, value);
        }
    }
    heap.thread_mut(thread).unwrap().truncate(roots);
}

fn shape(heap: &Heap, thread: ThreadId) -> Shape {
    let stack = heap.thread(thread).unwrap();
    let mut seen: HashMap<ObjectPtr, isize> = HashMap::new();
    let mut queue: VecDeque<ObjectPtr> = (0..stack.len()).map(|i| stack.get(i)).collect();
    let mut shape = Shape::new();
    while let Some(node) = queue.pop_front() {
        let id = heap.load(node, 0).smi_value();
        if let Some(&known) = seen.get(&node) {
            assert_eq!(known, id, "two nodes share {:?}", node);
            continue;
        }
        seen.insert(node, id);
        let fields = (1..=FIELDS)
            .map(|field| {
                let value = heap.load(node, field);
                if value.is_heap_object() {
                    queue.push_back(value);
                    Ok(heap.load(value, 0).smi_value())
                } else {
                    Err(value.smi_value())
                }
            })
            .collect();
        assert!(shape.insert(id, fields).is_none(), "node {} reached twice", id);
    }
    shape
}

fn check_all_collections(seed: u64, workers: usize) {
    let (mut heap, thread) = heap(workers);
    let mut rng = StdRng::seed_from_u64(seed);
    build(&mut heap, thread, &mut rng, 3000, 40);
    let expected = shape(&heap, thread);
    assert!(!expected.is_empty());

    heap.scavenge();
    assert_eq!(shape(&heap, thread), expected);
    heap.scavenge();
    assert_eq!(shape(&heap, thread), expected);
    heap.mark_objects(false, false);
    assert_eq!(shape(&heap, thread), expected);
    // The second cycle sees the sparse pages the first one left behind.
    heap.mark_objects(true, true);
    assert_eq!(shape(&heap, thread), expected);

    heap.start_marking(false, false);
    while !heap.mark_step(rng.gen_range(1..64)) {
        if rng.gen_bool(0.1) {
            heap.scavenge();
        }
    }
    heap.finish_marking().unwrap();
    assert_eq!(shape(&heap, thread), expected);
    heap.collect_all_garbage();
    assert_eq!(shape(&heap, thread), expected);
    assert!(heap.verify() > 0);
}

#[test]
fn graphs_survive_collections_serially() {
    for seed in 0..3 {
        check_all_collections(seed, 1);
    }
}

#[test]
fn graphs_survive_collections_in_parallel() {
    for seed in 10..13 {
        check_all_collections(seed, 4);
    }
}

#[test]
fn graphs_survive_become_of_a_node() {
    let (mut heap, thread) = heap(2);
    let mut rng = StdRng::seed_from_u64(99);
    build(&mut heap, thread, &mut rng, 500, 10);
    heap.mark_objects(false, false);
    let before = shape(&heap, thread);

    // Replace the first root with a copy carrying the same id and fields.
    let original = heap.thread(thread).unwrap().get(0);
    let class_id = unsafe { original.class_id() };
    let copy = heap.allocate_instance(class_id, FIELDS + 1).unwrap();
    let original = heap.thread(thread).unwrap().get(0);
    for field in 0..=FIELDS {
        let value = heap.load(original, field);
        heap.store(copy, field, value);
    }
    let mut batch = heap.become_objects();
    batch.add(original, copy);
    batch.forward();

    assert_eq!(heap.thread(thread).unwrap().get(0), copy);
    assert_eq!(shape(&heap, thread), before);
    heap.collect_all_garbage();
    assert_eq!(shape(&heap, thread), before);
}
