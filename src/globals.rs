use std::mem::size_of;

#[cfg(not(target_pointer_width = "64"))]
compile_error!("the heap layout assumes 64-bit words");

pub const WORD_SIZE: usize = size_of::<usize>();
pub const OBJECT_ALIGNMENT_LOG2: usize = 4;
/// Every heap object starts on a 16-byte boundary, which leaves the low bits of any object
/// address free for tagging.
pub const OBJECT_ALIGNMENT: usize = 1 << OBJECT_ALIGNMENT_LOG2;
pub const MIN_OBJECT_SIZE: usize = OBJECT_ALIGNMENT;
/// Largest size the header's size tag can encode.
pub const MAX_SIZE_TAG_BYTES: usize = ((1 << 12) - 1) * OBJECT_ALIGNMENT;

pub const PAGE_SIZE_LOG2: usize = 18;
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_LOG2;
/// Objects above this size bypass new space and get a large page of their own.
pub const LARGE_OBJECT_THRESHOLD: usize = 32 * 1024;

pub const CARD_SIZE_LOG2: usize = 10;
pub const CARD_SIZE: usize = 1 << CARD_SIZE_LOG2;

pub const MARKING_STACK_CHUNK_CAPACITY: usize = 128;
pub const STORE_BUFFER_BLOCK_CAPACITY: usize = 256;
pub const HANDLE_BLOCK_CAPACITY: usize = 64;

/// Byte pattern written over from-space after a scavenge when zapping is enabled.
pub const ZAP_BYTE: u8 = 0xf3;
