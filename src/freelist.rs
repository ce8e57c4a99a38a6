use crate::{
    globals::{OBJECT_ALIGNMENT, OBJECT_ALIGNMENT_LOG2},
    header::Header,
    object::{ObjectPtr, FREE_LIST_ELEMENT_CID},
};

/// Buckets `1..NUM_LISTS` hold elements of exactly `index * 16` bytes; the last bucket
/// holds everything bigger.
pub const NUM_LISTS: usize = 128;

/// Size-segregated list of free chunks. Each chunk is formatted as a free-list element so
/// pages stay walkable.
pub struct FreeList {
    heads: [usize; NUM_LISTS + 1],
    free_bytes: usize,
}

/// Formats `[addr, addr + size)` as a free-list element linked to `next`.
pub unsafe fn write_free_list_element(addr: usize, size: usize, next: usize) {
    debug_assert!(size >= OBJECT_ALIGNMENT && size % OBJECT_ALIGNMENT == 0);
    let obj = ObjectPtr::from_addr(addr);
    let header = Header::for_object(FREE_LIST_ELEMENT_CID, size);
    obj.set_header(header);
    obj.set_raw_field(0, next);
    if header.tagged_size().is_none() {
        obj.set_raw_field(1, size);
    }
}

#[inline(always)]
unsafe fn element_next(addr: usize) -> usize {
    ObjectPtr::from_addr(addr).raw_field(0)
}

#[inline(always)]
unsafe fn set_element_next(addr: usize, next: usize) {
    ObjectPtr::from_addr(addr).set_raw_field(0, next)
}

#[inline(always)]
unsafe fn element_size(addr: usize) -> usize {
    ObjectPtr::from_addr(addr).heap_size()
}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            heads: [0; NUM_LISTS + 1],
            free_bytes: 0,
        }
    }

    #[inline]
    pub fn bucket_index(size: usize) -> usize {
        (size >> OBJECT_ALIGNMENT_LOG2).min(NUM_LISTS)
    }

    pub const fn num_buckets() -> usize {
        NUM_LISTS + 1
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.heads.iter().all(|&h| h == 0)
    }

    pub fn reset(&mut self) {
        self.heads = [0; NUM_LISTS + 1];
        self.free_bytes = 0;
    }

    /// Adds `[addr, addr + size)` to the list.
    ///
    /// # Safety
    /// The range must be unused heap memory inside a single page.
    pub unsafe fn free(&mut self, addr: usize, size: usize) {
        let index = Self::bucket_index(size);
        write_free_list_element(addr, size, self.heads[index]);
        self.heads[index] = addr;
        self.free_bytes += size;
    }

    /// Takes a chunk of exactly `size` bytes, splitting a bigger element when needed.
    pub fn try_allocate(&mut self, size: usize) -> Option<usize> {
        debug_assert!(size % OBJECT_ALIGNMENT == 0);
        let index = Self::bucket_index(size);
        unsafe {
            if index < NUM_LISTS {
                for i in index..NUM_LISTS {
                    let head = self.heads[i];
                    if head != 0 {
                        self.heads[i] = element_next(head);
                        let chunk = i << OBJECT_ALIGNMENT_LOG2;
                        self.free_bytes -= chunk;
                        self.split(head, chunk, size);
                        return Some(head);
                    }
                }
            }
            self.try_allocate_large(size)
        }
    }

    unsafe fn try_allocate_large(&mut self, size: usize) -> Option<usize> {
        let mut prev = 0usize;
        let mut current = self.heads[NUM_LISTS];
        while current != 0 {
            let next = element_next(current);
            let chunk = element_size(current);
            if chunk >= size {
                if prev == 0 {
                    self.heads[NUM_LISTS] = next;
                } else {
                    set_element_next(prev, next);
                }
                self.free_bytes -= chunk;
                self.split(current, chunk, size);
                return Some(current);
            }
            prev = current;
            current = next;
        }
        None
    }

    unsafe fn split(&mut self, addr: usize, chunk: usize, size: usize) {
        if chunk > size {
            self.free(addr + size, chunk - size);
        }
    }

    /// Calls `f` with the address and size of every element.
    pub fn visit_elements(&self, mut f: impl FnMut(usize, usize)) {
        for &head in self.heads.iter() {
            let mut current = head;
            while current != 0 {
                unsafe {
                    f(current, element_size(current));
                    current = element_next(current);
                }
            }
        }
    }

    /// Moves every element of `other` into `self`.
    pub fn merge(&mut self, other: &mut FreeList) {
        let mut chunks = Vec::new();
        other.visit_elements(|addr, size| chunks.push((addr, size)));
        other.reset();
        for (addr, size) in chunks {
            unsafe { self.free(addr, size) };
        }
    }

    /// Drops from bucket `index` every element for which `keep` is false and returns the
    /// number of bytes dropped. The dropped elements stay formatted in their pages.
    ///
    /// Only touches the one bucket, so distinct buckets of the same list may be pruned
    /// from different threads; `free_bytes` must be adjusted by the caller afterwards.
    ///
    /// # Safety
    /// No other thread may access bucket `index` concurrently.
    pub unsafe fn prune_bucket(
        list: *mut FreeList,
        index: usize,
        keep: &dyn Fn(usize) -> bool,
    ) -> usize {
        let head = std::ptr::addr_of_mut!((*list).heads[index]);
        let mut removed = 0;
        let mut prev = 0usize;
        let mut current = *head;
        while current != 0 {
            let next = element_next(current);
            if keep(current) {
                prev = current;
            } else {
                removed += element_size(current);
                if prev == 0 {
                    *head = next;
                } else {
                    set_element_next(prev, next);
                }
            }
            current = next;
        }
        removed
    }

    pub(crate) fn discount(&mut self, bytes: usize) {
        self.free_bytes -= bytes;
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}
