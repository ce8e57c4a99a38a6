use crate::globals::{MAX_SIZE_TAG_BYTES, OBJECT_ALIGNMENT, OBJECT_ALIGNMENT_LOG2};
use crate::object::ClassId;
use modular_bitfield::prelude::*;

// Header is the first word of every heap object.
//
// +------------------------+------+--------------------------------------------+
// | name                   | bits |                                            |
// +------------------------+------+--------------------------------------------+
// | forwarded              |    1 | Always clear in a live header. When set    |
// |                        |      | the word is a scavenger forward instead.   |
// | marked                 |    1 | Old-space tri-color mark.                  |
// | remembered             |    1 | Object is in the store buffer.             |
// | young                  |    1 | Object lives in new space.                 |
// | watched                |    1 | Key of a delayed weak property.            |
// | evacuation candidate   |    1 | Set by the compactor prologue.             |
// | card remembered        |    1 | Old->young slots tracked by cards.         |
// | immutable              |    1 | Image object, never forwarded.             |
// +------------------------+------+--------------------------------------------+
// | size tag               |   12 | Size in 16-byte units, 0 = out of line.    |
// | class id               |   16 |                                            |
// | hash                   |   28 | Identity hash, 0 = not yet assigned.       |
// +------------------------+------+--------------------------------------------+
//
// Notes:
// - |size tag| zero means the size is stored elsewhere: in the large page holding the
//   object, or for free-list elements and forwarding corpses in their third word.
#[bitfield]
#[repr(u64)]
#[derive(Clone, Copy)]
pub struct Header {
    pub forwarded: bool,
    pub marked: bool,
    pub remembered: bool,
    pub young: bool,
    pub watched: bool,
    pub evacuation_candidate: bool,
    pub card_remembered: bool,
    pub immutable: bool,
    pub size_tag: B12,
    pub class_id: B16,
    pub hash: B28,
}

pub const HASH_MASK: u32 = (1 << 28) - 1;

impl Header {
    pub fn for_object(class_id: ClassId, size: usize) -> Self {
        Header::new()
            .with_class_id(class_id)
            .with_size_tag(Self::size_to_tag(size))
    }

    #[inline(always)]
    pub fn from_raw(raw: u64) -> Self {
        Header::from(raw)
    }

    #[inline(always)]
    pub fn raw(self) -> u64 {
        u64::from(self)
    }

    /// Size tag for `size`, or 0 when it does not fit in the header.
    #[inline(always)]
    pub fn size_to_tag(size: usize) -> u16 {
        debug_assert!(size % OBJECT_ALIGNMENT == 0);
        if size > MAX_SIZE_TAG_BYTES {
            0
        } else {
            (size >> OBJECT_ALIGNMENT_LOG2) as u16
        }
    }

    /// Size encoded in the header, `None` when it is stored out of line.
    #[inline(always)]
    pub fn tagged_size(self) -> Option<usize> {
        match self.size_tag() {
            0 => None,
            tag => Some((tag as usize) << OBJECT_ALIGNMENT_LOG2),
        }
    }

    /// Clears the per-cycle GC bits, keeping layout and identity.
    pub fn without_gc_bits(self) -> Self {
        self.with_marked(false)
            .with_remembered(false)
            .with_watched(false)
            .with_evacuation_candidate(false)
    }
}

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Header")
            .field("class_id", &self.class_id())
            .field("size_tag", &self.size_tag())
            .field("marked", &self.marked())
            .field("remembered", &self.remembered())
            .field("young", &self.young())
            .field("watched", &self.watched())
            .field("evacuation_candidate", &self.evacuation_candidate())
            .field("card_remembered", &self.card_remembered())
            .field("immutable", &self.immutable())
            .field("hash", &self.hash())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_independent() {
        let h = Header::for_object(42, 64).with_marked(true).with_young(true);
        assert_eq!(h.class_id(), 42);
        assert_eq!(h.tagged_size(), Some(64));
        assert!(h.marked());
        assert!(h.young());
        assert!(!h.forwarded());
        assert!(!h.remembered());
        let cleared = h.with_remembered(true).without_gc_bits();
        assert!(!cleared.marked());
        assert!(!cleared.remembered());
        assert!(cleared.young());
        assert_eq!(Header::from_raw(cleared.raw()).class_id(), 42);
    }

    #[test]
    fn forwarded_flag_is_the_low_bit() {
        assert_eq!(Header::new().with_forwarded(true).raw(), 1);
        assert_eq!(Header::for_object(7, 16).raw() & 1, 0);
    }

    #[test]
    fn oversized_objects_have_no_size_tag() {
        let h = Header::for_object(3, MAX_SIZE_TAG_BYTES + OBJECT_ALIGNMENT);
        assert_eq!(h.tagged_size(), None);
        let h = Header::for_object(3, MAX_SIZE_TAG_BYTES);
        assert_eq!(h.tagged_size(), Some(MAX_SIZE_TAG_BYTES));
    }
}
