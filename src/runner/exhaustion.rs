//! Allocation failure inside the runner
//!
//! Under the address-space ceiling a failed Rust allocation would otherwise
//! abort with SIGABRT, which reads as a runner crash. The runner binary
//! installs [`ExitOnExhaustion`] as its global allocator so that the same
//! failure ends like a Python `MemoryError`.

use std::alloc::{GlobalAlloc, Layout, System};

use super::exit;

const MESSAGE: &[u8] = b"MemoryError: out of memory\n";

/// System allocator that exits with [`exit::MEMORY_EXHAUSTED`] when an
/// allocation cannot be satisfied
pub struct ExitOnExhaustion;

// SAFETY: every call is forwarded to `System` unchanged; only the null
// return is intercepted.
unsafe impl GlobalAlloc for ExitOnExhaustion {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        satisfied(System.alloc(layout))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        satisfied(System.alloc_zeroed(layout))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        satisfied(System.realloc(ptr, layout, new_size))
    }
}

fn satisfied(ptr: *mut u8) -> *mut u8 {
    if ptr.is_null() {
        exhausted();
    }
    ptr
}

fn exhausted() -> ! {
    // SAFETY: write(2) and _exit(2) allocate nothing.
    unsafe {
        libc::write(libc::STDERR_FILENO, MESSAGE.as_ptr().cast(), MESSAGE.len());
        libc::_exit(exit::MEMORY_EXHAUSTED)
    }
}
