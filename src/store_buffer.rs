use parking_lot::Mutex;

use crate::{globals::STORE_BUFFER_BLOCK_CAPACITY, object::ObjectPtr};

/// A block of remembered old objects.
pub struct StoreBufferBlock {
    top: usize,
    pointers: [ObjectPtr; STORE_BUFFER_BLOCK_CAPACITY],
}

impl StoreBufferBlock {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            top: 0,
            pointers: [ObjectPtr::NULL; STORE_BUFFER_BLOCK_CAPACITY],
        })
    }

    #[inline]
    pub fn push(&mut self, obj: ObjectPtr) {
        debug_assert!(!self.is_full());
        self.pointers[self.top] = obj;
        self.top += 1;
    }

    pub fn is_full(&self) -> bool {
        self.top == STORE_BUFFER_BLOCK_CAPACITY
    }
    pub fn is_empty(&self) -> bool {
        self.top == 0
    }
    pub fn len(&self) -> usize {
        self.top
    }
    pub fn reset(&mut self) {
        self.top = 0;
    }

    pub fn entries(&self) -> &[ObjectPtr] {
        &self.pointers[..self.top]
    }

    /// Rewrites each entry through `f`, dropping entries mapped to `None`.
    pub fn retain_map(&mut self, mut f: impl FnMut(ObjectPtr) -> Option<ObjectPtr>) {
        let mut out = 0;
        for i in 0..self.top {
            if let Some(obj) = f(self.pointers[i]) {
                self.pointers[out] = obj;
                out += 1;
            }
        }
        self.top = out;
    }
}

/// Remembered set: old objects that may hold pointers into new space.
///
/// The mutator appends to the current block; full blocks move to a shared list and empty
/// ones come from a pool. GC workers fill private blocks and publish them with
/// [`StoreBuffer::push_block`].
pub struct StoreBuffer {
    current: Box<StoreBufferBlock>,
    full: Mutex<Vec<Box<StoreBufferBlock>>>,
    pool: Mutex<Vec<Box<StoreBufferBlock>>>,
}

impl StoreBuffer {
    pub fn new() -> Self {
        Self {
            current: StoreBufferBlock::new(),
            full: Mutex::new(Vec::new()),
            pool: Mutex::new(Vec::new()),
        }
    }

    /// Records `obj`. The caller has already set its remembered bit.
    pub fn add_object(&mut self, obj: ObjectPtr) {
        if self.current.is_full() {
            let fresh = self.pop_empty_block();
            let full = std::mem::replace(&mut self.current, fresh);
            self.full.lock().push(full);
        }
        self.current.push(obj);
    }

    pub fn pop_empty_block(&self) -> Box<StoreBufferBlock> {
        match self.pool.lock().pop() {
            Some(block) => block,
            None => StoreBufferBlock::new(),
        }
    }

    pub fn push_block(&self, block: Box<StoreBufferBlock>) {
        if block.is_empty() {
            self.return_block(block);
        } else {
            self.full.lock().push(block);
        }
    }

    pub fn return_block(&self, mut block: Box<StoreBufferBlock>) {
        block.reset();
        self.pool.lock().push(block);
    }

    /// Moves the current block to the full list.
    pub fn flush(&mut self) {
        if !self.current.is_empty() {
            let fresh = self.pop_empty_block();
            let full = std::mem::replace(&mut self.current, fresh);
            self.full.get_mut().push(full);
        }
    }

    /// Takes every non-empty block, leaving the buffer empty.
    pub fn take_blocks(&mut self) -> Vec<Box<StoreBufferBlock>> {
        self.flush();
        std::mem::take(self.full.get_mut())
    }

    /// Blocks holding entries, after a flush. Used by the parallel forwarding pass.
    pub fn blocks_mut(&mut self) -> &mut Vec<Box<StoreBufferBlock>> {
        self.flush();
        self.full.get_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.full.lock().iter().all(|b| b.is_empty())
    }

    pub fn len(&self) -> usize {
        self.current.len() + self.full.lock().iter().map(|b| b.len()).sum::<usize>()
    }

    pub fn visit_entries(&self, mut f: impl FnMut(ObjectPtr)) {
        for block in self.full.lock().iter() {
            for &obj in block.entries() {
                f(obj);
            }
        }
        for &obj in self.current.entries() {
            f(obj);
        }
    }
}

impl Default for StoreBuffer {
    fn default() -> Self {
        Self::new()
    }
}
