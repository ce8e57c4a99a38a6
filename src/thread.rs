use crate::{
    handles::PersistentHandles,
    object::{visit_frame_slots, ObjectPtr, Slot},
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ThreadId(pub(crate) usize);

/// A compiled frame: its tagged slots are described by a stack map, which is itself a heap
/// object.
pub struct StackFrame {
    stack_map: ObjectPtr,
    slots: Vec<ObjectPtr>,
}

/// Root state of one mutator thread: a value stack plus stack-mapped frames.
pub struct Thread {
    id: ThreadId,
    name: String,
    stack: Vec<ObjectPtr>,
    frames: Vec<StackFrame>,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            stack: Vec::new(),
            frames: Vec::new(),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pushes a value and returns its stack index.
    pub fn push(&mut self, value: ObjectPtr) -> usize {
        self.stack.push(value);
        self.stack.len() - 1
    }

    pub fn pop(&mut self) -> Option<ObjectPtr> {
        self.stack.pop()
    }

    pub fn get(&self, index: usize) -> ObjectPtr {
        self.stack[index]
    }

    pub fn set(&mut self, index: usize, value: ObjectPtr) {
        self.stack[index] = value;
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn truncate(&mut self, len: usize) {
        self.stack.truncate(len);
    }

    /// Pushes a frame of `slots` described by `stack_map` and returns its index. Slots the
    /// stack map does not flag are never read or updated by the collectors.
    pub fn push_frame(&mut self, stack_map: ObjectPtr, slots: Vec<ObjectPtr>) -> usize {
        self.frames.push(StackFrame { stack_map, slots });
        self.frames.len() - 1
    }

    pub fn pop_frame(&mut self) {
        self.frames.pop();
    }

    pub fn frame_slot(&self, frame: usize, index: usize) -> ObjectPtr {
        self.frames[frame].slots[index]
    }

    pub fn set_frame_slot(&mut self, frame: usize, index: usize, value: ObjectPtr) {
        self.frames[frame].slots[index] = value;
    }

    pub fn frame_stack_map(&self, frame: usize) -> ObjectPtr {
        self.frames[frame].stack_map
    }

    /// Visits the value stack, then each frame's stack map followed by the slots it flags.
    pub fn visit(&mut self, f: &mut dyn FnMut(Slot)) {
        for slot in self.stack.iter_mut() {
            f(slot as *mut ObjectPtr);
        }
        for frame in self.frames.iter_mut() {
            f(&mut frame.stack_map as *mut ObjectPtr);
            if frame.stack_map.is_heap_object() {
                unsafe {
                    visit_frame_slots(
                        frame.stack_map,
                        frame.slots.as_mut_ptr(),
                        frame.slots.len(),
                        f,
                    );
                }
            }
        }
    }
}

/// Strong roots of a heap.
#[derive(Default)]
pub struct RootSet {
    pub(crate) persistent: PersistentHandles,
    pub(crate) threads: Vec<Thread>,
    /// Arguments of allocation helpers kept alive across a collection.
    pub(crate) scratch: Vec<ObjectPtr>,
    pub(crate) oom_reservation: ObjectPtr,
    pub(crate) lazy_compile_stub: ObjectPtr,
}

impl RootSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visit_oom_reservation(&mut self, f: &mut dyn FnMut(Slot)) {
        f(&mut self.oom_reservation as *mut ObjectPtr);
    }

    /// Every root except the out-of-memory reservation.
    pub fn visit_roots(&mut self, f: &mut dyn FnMut(Slot)) {
        f(&mut self.lazy_compile_stub as *mut ObjectPtr);
        self.persistent.visit(f);
        for slot in self.scratch.iter_mut() {
            f(slot as *mut ObjectPtr);
        }
        for thread in self.threads.iter_mut() {
            thread.visit(f);
        }
    }

    pub fn visit_all(&mut self, f: &mut dyn FnMut(Slot)) {
        self.visit_oom_reservation(f);
        self.visit_roots(f);
    }
}
