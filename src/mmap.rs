//! Page-aligned virtual memory reservations for old-space pages.
//!
//! A reservation over-maps by `alignment` bytes so that an aligned window of the requested
//! size always exists inside it; the whole mapping is released on drop.

#[cfg(windows)]
pub mod _win {
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    };

    use crate::util::align_up;

    pub struct Mmap {
        reserved: *mut u8,
        #[allow(dead_code)]
        reserved_size: usize,
        start: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub fn new_aligned(size: usize, alignment: usize) -> Option<Self> {
            unsafe {
                let reserved_size = size + alignment;
                let mem = VirtualAlloc(
                    null_mut(),
                    reserved_size,
                    MEM_RESERVE | MEM_COMMIT,
                    PAGE_READWRITE,
                ) as *mut u8;
                if mem.is_null() {
                    return None;
                }
                let start = align_up(mem as usize, alignment) as *mut u8;
                Some(Self {
                    reserved: mem,
                    reserved_size,
                    start,
                    size,
                })
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            unsafe { self.start.add(self.size) }
        }
        pub const fn size(&self) -> usize {
            self.size
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                VirtualFree(self.reserved.cast(), 0, MEM_RELEASE);
            }
        }
    }
}

#[cfg(unix)]
pub mod _unix {
    use crate::util::align_up;

    pub struct Mmap {
        reserved: *mut u8,
        reserved_size: usize,
        start: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub fn new_aligned(size: usize, alignment: usize) -> Option<Self> {
            unsafe {
                let reserved_size = size + alignment;
                let map = libc::mmap(
                    core::ptr::null_mut(),
                    reserved_size as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    return None;
                }
                let start = align_up(map as usize, alignment) as *mut u8;
                Some(Self {
                    reserved: map as *mut u8,
                    reserved_size,
                    start,
                    size,
                })
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            unsafe { self.start.add(self.size) }
        }
        pub const fn size(&self) -> usize {
            self.size
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.reserved as *mut _, self.reserved_size as _);
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;
