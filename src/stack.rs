use std::ffi::c_void;
use std::ptr;
use std::sync::OnceLock;

use libc::{
    MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE, _SC_PAGESIZE, mmap,
    mprotect, munmap, sysconf,
};

use crate::{env_usize_clamp, fatal};

pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let ps = unsafe { sysconf(_SC_PAGESIZE) };
        if ps <= 0 { 4096 } else { ps as usize }
    })
}

/// Usable stack bytes per fiber, rounded up to whole pages.
pub fn stack_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    *SIZE.get_or_init(|| {
        let kb = env_usize_clamp("STRAND_STACK_KB", 256, 64, 16384);
        let page = page_size();
        ((kb * 1024 + page - 1) / page) * page
    })
}

/// Maps `usable` stack bytes plus one guard page below them: the whole
/// reservation starts PROT_NONE and everything above the lowest page is
/// flipped to read-write, so running off the bottom of the stack faults
/// instead of corrupting a neighbour. Returns the lowest usable address.
pub unsafe fn stack_alloc(usable: usize) -> *mut c_void {
    let page = page_size();
    let total = usable + page;
    let base = mmap(ptr::null_mut(), total, PROT_NONE, MAP_PRIVATE | MAP_ANON, -1, 0);
    if base == MAP_FAILED {
        fatal("mmap fiber stack failed");
    }
    let usable_base = (base as *mut u8).add(page) as *mut c_void;
    if mprotect(usable_base, usable, PROT_READ | PROT_WRITE) != 0 {
        let _ = munmap(base, total);
        fatal("mprotect fiber stack failed");
    }
    usable_base
}

/// Unmaps a stack returned by `stack_alloc`, guard page included.
pub unsafe fn stack_free(usable_base: *mut c_void, usable: usize) {
    if usable_base.is_null() {
        return;
    }
    let page = page_size();
    let base = (usable_base as *mut u8).sub(page) as *mut c_void;
    let _ = munmap(base, usable + page);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_size_is_page_aligned() {
        assert_eq!(stack_size() % page_size(), 0);
        assert!(stack_size() >= 64 * 1024);
    }

    #[test]
    fn mapping_is_writable_above_the_guard() {
        unsafe {
            let usable = stack_size();
            let base = stack_alloc(usable);
            assert!(!base.is_null());
            assert_eq!(base as usize % page_size(), 0);
            let bytes = base as *mut u8;
            *bytes = 1;
            *bytes.add(usable - 1) = 2;
            assert_eq!(*bytes, 1);
            assert_eq!(*bytes.add(usable - 1), 2);
            stack_free(base, usable);
        }
    }
}
