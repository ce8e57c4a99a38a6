use memmap2::MmapMut;

use crate::{
    error::HeapError,
    globals::{OBJECT_ALIGNMENT, ZAP_BYTE},
    object::ObjectPtr,
    util::{align_up, is_aligned},
};

/// One of the two equal halves of new space.
pub struct SemiSpace {
    memory: MmapMut,
    start: usize,
    end: usize,
}

impl SemiSpace {
    pub fn new(size: usize) -> Result<Self, HeapError> {
        let size = align_up(size, OBJECT_ALIGNMENT);
        let mut memory = MmapMut::map_anon(size + OBJECT_ALIGNMENT)
            .map_err(|_| HeapError::ReservationFailed(size))?;
        let start = align_up(memory.as_mut_ptr() as usize, OBJECT_ALIGNMENT);
        Ok(Self {
            memory,
            start,
            end: start + size,
        })
    }

    pub fn start(&self) -> usize {
        self.start
    }
    pub fn end(&self) -> usize {
        self.end
    }
    pub fn size(&self) -> usize {
        self.end - self.start
    }
    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    fn zap(&mut self) {
        let offset = self.start - self.memory.as_ptr() as usize;
        let size = self.size();
        for byte in &mut self.memory[offset..offset + size] {
            *byte = ZAP_BYTE;
        }
    }
}

/// Young generation. Objects are bump allocated in `to`; a scavenge flips the halves and
/// copies survivors back into `to`.
///
/// `[to.start, survivor_end)` of the space being evacuated holds the objects that already
/// survived one scavenge, and those are the promotion candidates.
pub struct NewSpace {
    to: SemiSpace,
    from: SemiSpace,
    top: usize,
    resolved_top: usize,
    survivor_end: usize,
}

impl NewSpace {
    pub fn new(semi_space_size: usize) -> Result<Self, HeapError> {
        let to = SemiSpace::new(semi_space_size)?;
        let from = SemiSpace::new(semi_space_size)?;
        let top = to.start();
        Ok(Self {
            to,
            from,
            top,
            resolved_top: top,
            survivor_end: top,
        })
    }

    #[inline]
    pub fn try_allocate(&mut self, size: usize) -> Option<usize> {
        debug_assert!(is_aligned(size, OBJECT_ALIGNMENT));
        let addr = self.top;
        if self.to.end() - addr < size {
            return None;
        }
        self.top = addr + size;
        Some(addr)
    }

    /// Swaps the halves. Survivors are copied into the new `to` from its start.
    pub fn flip(&mut self) {
        std::mem::swap(&mut self.to, &mut self.from);
        self.top = self.to.start();
        self.resolved_top = self.top;
    }

    /// Marks everything currently below `top` (or the whole space when `early_tenure`) as
    /// promotion candidates for the next scavenge.
    pub fn set_survivor_end(&mut self, early_tenure: bool) {
        self.survivor_end = if early_tenure { self.to.end() } else { self.top };
    }

    pub fn survivor_end(&self) -> usize {
        self.survivor_end
    }

    pub fn top(&self) -> usize {
        self.top
    }
    pub fn resolved_top(&self) -> usize {
        self.resolved_top
    }
    pub fn set_resolved_top(&mut self, value: usize) {
        self.resolved_top = value;
    }

    pub fn to_space(&self) -> &SemiSpace {
        &self.to
    }
    pub fn from_space(&self) -> &SemiSpace {
        &self.from
    }

    /// True for addresses in either half.
    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        self.to.contains(addr) || self.from.contains(addr)
    }
    #[inline(always)]
    pub fn in_to_space(&self, addr: usize) -> bool {
        self.to.contains(addr)
    }
    #[inline(always)]
    pub fn in_from_space(&self, addr: usize) -> bool {
        self.from.contains(addr)
    }

    pub fn capacity(&self) -> usize {
        self.to.size()
    }

    pub fn used_bytes(&self) -> usize {
        self.top - self.to.start()
    }

    pub fn zap_from_space(&mut self) {
        self.from.zap();
    }

    /// Walks the allocated part of `to`.
    ///
    /// # Safety
    /// Every object below `top` must have a live header.
    pub unsafe fn visit_objects(&self, mut f: impl FnMut(ObjectPtr)) {
        let mut addr = self.to.start();
        while addr < self.top {
            let obj = ObjectPtr::from_addr(addr);
            let size = obj.heap_size();
            f(obj);
            addr += size;
        }
    }
}
