#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}
#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    // See https://github.com/rust-lang/rust/blob/e620d0f337d0643c757bab791fc7d88d63217704/src/libcore/alloc.rs#L192
    addr.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1)
}
#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

/// A field of `SIZE` bits starting at bit `SHIFT` of a 64-bit word.
pub trait BitFieldTrait<const SHIFT: u64, const SIZE: u64> {
    const MASK: u64 = ((1 << SHIFT) << SIZE) - (1 << SHIFT);

    fn encode(value: u64) -> u64 {
        value.wrapping_shl(SHIFT as _) & Self::MASK
    }
    fn update(previous: u64, value: u64) -> u64 {
        (previous & !Self::MASK) | Self::encode(value)
    }

    fn decode(value: u64) -> u64 {
        (value & Self::MASK).wrapping_shr(SHIFT as _)
    }
}

pub struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}
