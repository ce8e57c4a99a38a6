use crate::{globals::MARKING_STACK_CHUNK_CAPACITY, object::ObjectPtr};

/// Fixed-capacity block of gray objects.
pub struct MarkingStackChunk {
    next: Option<Box<MarkingStackChunk>>,
    top: usize,
    data: [ObjectPtr; MARKING_STACK_CHUNK_CAPACITY],
}

impl MarkingStackChunk {
    fn new() -> Box<Self> {
        Box::new(Self {
            next: None,
            top: 0,
            data: [ObjectPtr::NULL; MARKING_STACK_CHUNK_CAPACITY],
        })
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.top == MARKING_STACK_CHUNK_CAPACITY
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.top == 0
    }
}

/// Chunked stack of gray objects. Full chunks form a linked list behind the current one
/// and drained chunks go to a pool so steady-state marking does not allocate.
pub struct MarkingStack {
    current: Box<MarkingStackChunk>,
    full: Option<Box<MarkingStackChunk>>,
    pool: Option<Box<MarkingStackChunk>>,
    len: usize,
}

impl MarkingStack {
    pub fn new() -> Self {
        Self {
            current: MarkingStackChunk::new(),
            full: None,
            pool: None,
            len: 0,
        }
    }

    #[inline]
    pub fn push(&mut self, obj: ObjectPtr) {
        if self.current.is_full() {
            let mut fresh = match self.pool.take() {
                Some(mut chunk) => {
                    self.pool = chunk.next.take();
                    chunk
                }
                None => MarkingStackChunk::new(),
            };
            std::mem::swap(&mut self.current, &mut fresh);
            fresh.next = self.full.take();
            self.full = Some(fresh);
        }
        let top = self.current.top;
        self.current.data[top] = obj;
        self.current.top = top + 1;
        self.len += 1;
    }

    #[inline]
    pub fn pop(&mut self) -> Option<ObjectPtr> {
        if self.current.is_empty() {
            let mut full = self.full.take()?;
            self.full = full.next.take();
            std::mem::swap(&mut self.current, &mut full);
            full.next = self.pool.take();
            self.pool = Some(full);
        }
        self.current.top -= 1;
        self.len -= 1;
        Some(self.current.data[self.current.top])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drops all entries, keeping the chunks for reuse.
    pub fn clear(&mut self) {
        while self.pop().is_some() {}
    }

    pub fn pooled_chunks(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.pool.as_ref();
        while let Some(chunk) = cursor {
            count += 1;
            cursor = chunk.next.as_ref();
        }
        count
    }
}

impl Default for MarkingStack {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MarkingStack {
    fn drop(&mut self) {
        // Unlink iteratively so long chains do not recurse in Box's drop.
        for list in [self.full.take(), self.pool.take()].iter_mut() {
            while let Some(mut chunk) = list.take() {
                *list = chunk.next.take();
            }
        }
    }
}
