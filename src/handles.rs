use crate::{
    globals::HANDLE_BLOCK_CAPACITY,
    object::{ObjectPtr, Slot},
};

/// Strong handle keeping its referent alive and current across moves.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PersistentHandle(usize);

#[derive(Default)]
pub struct PersistentHandles {
    slots: Vec<ObjectPtr>,
    free: Vec<usize>,
}

impl PersistentHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, obj: ObjectPtr) -> PersistentHandle {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = obj;
                PersistentHandle(index)
            }
            None => {
                self.slots.push(obj);
                PersistentHandle(self.slots.len() - 1)
            }
        }
    }

    pub fn get(&self, handle: PersistentHandle) -> ObjectPtr {
        self.slots[handle.0]
    }

    pub fn set(&mut self, handle: PersistentHandle, obj: ObjectPtr) {
        self.slots[handle.0] = obj;
    }

    pub fn remove(&mut self, handle: PersistentHandle) {
        self.slots[handle.0] = ObjectPtr::NULL;
        self.free.push(handle.0);
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn visit(&mut self, f: &mut dyn FnMut(Slot)) {
        for slot in self.slots.iter_mut() {
            f(slot as *mut ObjectPtr);
        }
    }
}

/// Called with the handle's peer once its referent is found unreachable.
pub type Finalizer = Box<dyn FnOnce(usize) + Send>;

/// Weak external reference with a finalizer and an external-memory charge.
pub struct FinalizablePersistentHandle {
    referent: ObjectPtr,
    peer: usize,
    external_size: usize,
    finalizer: Option<Finalizer>,
}

impl FinalizablePersistentHandle {
    pub fn referent(&self) -> ObjectPtr {
        self.referent
    }
    pub fn referent_slot(&mut self) -> Slot {
        &mut self.referent as *mut ObjectPtr
    }
    pub fn peer(&self) -> usize {
        self.peer
    }
    pub fn external_size(&self) -> usize {
        self.external_size
    }

    fn finalize(&mut self) {
        if let Some(finalizer) = self.finalizer.take() {
            finalizer(self.peer);
        }
        self.referent = ObjectPtr::NULL;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FinalizableHandle(usize);

/// What a collector decided about one weak handle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandleFate {
    Retain,
    /// The referent moved from new space to old space.
    Promoted,
    /// The referent is dead. `young` tells which space carried the external charge.
    Finalize { young: bool },
}

type HandleBlock = Vec<Option<FinalizablePersistentHandle>>;

/// Block-partitioned table of finalizable weak handles.
#[derive(Default)]
pub struct FinalizableHandles {
    blocks: Vec<HandleBlock>,
    free: Vec<usize>,
    external_new: usize,
    external_old: usize,
}

impl FinalizableHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        referent: ObjectPtr,
        peer: usize,
        external_size: usize,
        finalizer: Finalizer,
        young: bool,
    ) -> FinalizableHandle {
        let handle = FinalizablePersistentHandle {
            referent,
            peer,
            external_size,
            finalizer: Some(finalizer),
        };
        if young {
            self.external_new += external_size;
        } else {
            self.external_old += external_size;
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.blocks.last().map_or(true, |b| b.len() == HANDLE_BLOCK_CAPACITY) {
                    self.blocks.push(Vec::with_capacity(HANDLE_BLOCK_CAPACITY));
                }
                let block = self.blocks.len() - 1;
                self.blocks[block].push(None);
                block * HANDLE_BLOCK_CAPACITY + self.blocks[block].len() - 1
            }
        };
        self.blocks[index / HANDLE_BLOCK_CAPACITY][index % HANDLE_BLOCK_CAPACITY] = Some(handle);
        FinalizableHandle(index)
    }

    fn entry(&self, handle: FinalizableHandle) -> Option<&FinalizablePersistentHandle> {
        self.blocks
            .get(handle.0 / HANDLE_BLOCK_CAPACITY)
            .and_then(|b| b.get(handle.0 % HANDLE_BLOCK_CAPACITY))
            .and_then(|h| h.as_ref())
    }

    /// Current referent, `None` once the handle was finalized or deleted.
    pub fn get(&self, handle: FinalizableHandle) -> Option<ObjectPtr> {
        self.entry(handle).map(|h| h.referent)
    }

    pub fn peer(&self, handle: FinalizableHandle) -> Option<usize> {
        self.entry(handle).map(|h| h.peer)
    }

    /// Deletes a handle without running its finalizer.
    pub fn remove(&mut self, handle: FinalizableHandle, young: bool) {
        let block = handle.0 / HANDLE_BLOCK_CAPACITY;
        let index = handle.0 % HANDLE_BLOCK_CAPACITY;
        if let Some(h) = self.blocks.get_mut(block).and_then(|b| b[index].take()) {
            self.discharge(h.external_size, young);
            self.free.push(handle.0);
        }
    }

    fn discharge(&mut self, size: usize, young: bool) {
        if young {
            self.external_new = self.external_new.saturating_sub(size);
        } else {
            self.external_old = self.external_old.saturating_sub(size);
        }
    }

    pub fn external_new(&self) -> usize {
        self.external_new
    }
    pub fn external_old(&self) -> usize {
        self.external_old
    }

    pub fn len(&self) -> usize {
        self.blocks.iter().flatten().filter(|h| h.is_some()).count()
    }

    /// Lets a collector decide the fate of every live handle. Finalizers run here, at most
    /// once per handle, and the slot is released afterwards.
    pub fn process(&mut self, mut decide: impl FnMut(&mut FinalizablePersistentHandle) -> HandleFate) {
        let mut promoted = 0;
        let mut released = Vec::new();
        for (b, block) in self.blocks.iter_mut().enumerate() {
            for (i, entry) in block.iter_mut().enumerate() {
                let fate = match entry {
                    Some(handle) => decide(handle),
                    None => continue,
                };
                match fate {
                    HandleFate::Retain => {}
                    HandleFate::Promoted => {
                        if let Some(h) = entry.as_ref() {
                            promoted += h.external_size;
                        }
                    }
                    HandleFate::Finalize { young } => {
                        if let Some(mut h) = entry.take() {
                            h.finalize();
                            released.push((b * HANDLE_BLOCK_CAPACITY + i, h.external_size, young));
                        }
                    }
                }
            }
        }
        self.external_new = self.external_new.saturating_sub(promoted);
        self.external_old += promoted;
        for (index, size, young) in released {
            self.discharge(size, young);
            self.free.push(index);
        }
    }

    /// Handle blocks for the parallel forwarding pass.
    pub fn blocks_mut(&mut self) -> &mut [Vec<Option<FinalizablePersistentHandle>>] {
        &mut self.blocks
    }
}
