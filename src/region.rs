// Purpose: Per-fiber arena allocator: chained pages, bump allocation, bulk release.
// Inputs/Outputs: Chains are headed by a raw pointer stored in each fiber record; alloc may rewrite the head.
// Invariants: Allocations never move; every pointer stays valid until the whole chain is released.
// Gotchas: There are no per-block headers, so regrowing a buried block needs the caller-supplied old size.

use std::cell::Cell;
use std::mem;
use std::ptr;
use std::sync::OnceLock;

use crate::{env_usize_clamp, fatal};

/// All region allocations are aligned to this (the platform max-align).
pub const REGION_ALIGN: usize = 16;

/// One page in a fiber's allocation chain. `last` is the offset of the most
/// recent allocation in this page, which lets `region_realloc` grow a
/// trailing block in place.
#[repr(C)]
pub struct Region {
    next: *mut Region,
    used: usize,
    last: usize,
    capacity: usize,
    data: *mut u8,
}

thread_local! {
    static REGION_PAGES_LIVE: Cell<i64> = const { Cell::new(0) };
}

/// Pages currently allocated on this thread. Release observability hook:
/// after a fiber retires, the count drops by exactly the pages its chain
/// held.
pub fn region_pages_live() -> i64 {
    REGION_PAGES_LIVE.with(|c| c.get())
}

fn default_region_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    *SIZE.get_or_init(|| env_usize_clamp("STRAND_REGION_KB", 16, 4, 4096) * 1024)
}

fn align_up(n: usize) -> usize {
    (n + REGION_ALIGN - 1) & !(REGION_ALIGN - 1)
}

unsafe fn region_new(capacity: usize) -> *mut Region {
    let region = libc::malloc(mem::size_of::<Region>()) as *mut Region;
    if region.is_null() {
        fatal("out of memory");
    }
    let data = libc::malloc(capacity) as *mut u8;
    if data.is_null() {
        fatal("out of memory");
    }
    (*region).next = ptr::null_mut();
    (*region).used = 0;
    (*region).last = 0;
    (*region).capacity = capacity;
    (*region).data = data;
    REGION_PAGES_LIVE.with(|c| c.set(c.get() + 1));
    region
}

/// Bump-allocates `size` bytes from the chain headed at `*head`. When the
/// head page cannot satisfy the request, a fresh page sized
/// `max(default, size)` is prepended and becomes the new head, so
/// allocation never walks the chain. A null head is valid and means the
/// chain is created on first use.
pub unsafe fn region_alloc(head: &mut *mut Region, size: usize) -> *mut u8 {
    let need = align_up(size);
    let mut page = *head;
    if page.is_null() || (*page).used + need > (*page).capacity {
        let capacity = default_region_size().max(need);
        let fresh = region_new(capacity);
        (*fresh).next = page;
        *head = fresh;
        page = fresh;
    }
    let offset = (*page).used;
    (*page).last = offset;
    (*page).used = offset + need;
    (*page).data.add(offset)
}

/// Resizes a block previously returned by `region_alloc`. The most recent
/// allocation in the head page is resized in place when room remains;
/// anything else is copied to a fresh allocation. The old space is never
/// reclaimed.
pub unsafe fn region_realloc(
    head: &mut *mut Region,
    old: *mut u8,
    old_size: usize,
    new_size: usize,
) -> *mut u8 {
    if old.is_null() {
        return region_alloc(head, new_size);
    }
    let page = *head;
    if !page.is_null() && old == (*page).data.add((*page).last) {
        let need = align_up(new_size);
        if (*page).last + need <= (*page).capacity {
            (*page).used = (*page).last + need;
            return old;
        }
    }
    let fresh = region_alloc(head, new_size);
    ptr::copy_nonoverlapping(old, fresh, old_size.min(new_size));
    fresh
}

/// Frees the whole chain and nulls the head. Every pointer handed out from
/// the chain becomes invalid.
pub unsafe fn region_release(head: &mut *mut Region) {
    let mut page = *head;
    while !page.is_null() {
        let next = (*page).next;
        libc::free((*page).data as *mut libc::c_void);
        libc::free(page as *mut libc::c_void);
        REGION_PAGES_LIVE.with(|c| c.set(c.get() - 1));
        page = next;
    }
    *head = ptr::null_mut();
}

/// Total capacity across the chain.
pub unsafe fn region_total_capacity(head: *const Region) -> usize {
    let mut size = 0usize;
    let mut page = head;
    while !page.is_null() {
        size += (*page).capacity;
        page = (*page).next;
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_stay_valid_across_page_growth() {
        unsafe {
            let mut head: *mut Region = ptr::null_mut();
            let first = region_alloc(&mut head, 64);
            ptr::write_bytes(first, 0xAB, 64);
            for _ in 0..8 {
                let big = region_alloc(&mut head, 40 * 1024);
                assert!(!big.is_null());
            }
            for i in 0..64 {
                assert_eq!(*first.add(i), 0xAB);
            }
            region_release(&mut head);
            assert!(head.is_null());
        }
    }

    #[test]
    fn pages_are_sized_to_the_larger_of_default_and_request() {
        unsafe {
            let mut head: *mut Region = ptr::null_mut();
            let p = region_alloc(&mut head, 100 * 1024);
            assert!(!p.is_null());
            assert!(region_total_capacity(head) >= 100 * 1024);
            region_release(&mut head);
        }
    }

    #[test]
    fn release_returns_every_page() {
        unsafe {
            let before = region_pages_live();
            let mut head: *mut Region = ptr::null_mut();
            let _ = region_alloc(&mut head, 16);
            let _ = region_alloc(&mut head, 64 * 1024);
            assert!(region_pages_live() >= before + 2);
            region_release(&mut head);
            assert_eq!(region_pages_live(), before);
        }
    }

    #[test]
    fn alignment_is_max_align() {
        unsafe {
            let mut head: *mut Region = ptr::null_mut();
            for size in [1usize, 3, 17, 31, 100] {
                let p = region_alloc(&mut head, size);
                assert_eq!(p as usize % REGION_ALIGN, 0);
            }
            region_release(&mut head);
        }
    }

    #[test]
    fn trailing_block_grows_in_place() {
        unsafe {
            let mut head: *mut Region = ptr::null_mut();
            let p = region_alloc(&mut head, 32);
            ptr::write_bytes(p, 0x5A, 32);
            let q = region_realloc(&mut head, p, 32, 64);
            assert_eq!(p, q);
            for i in 0..32 {
                assert_eq!(*q.add(i), 0x5A);
            }
            region_release(&mut head);
        }
    }

    #[test]
    fn buried_block_is_copied_on_regrow() {
        unsafe {
            let mut head: *mut Region = ptr::null_mut();
            let p = region_alloc(&mut head, 32);
            ptr::write_bytes(p, 0x21, 32);
            let _later = region_alloc(&mut head, 16);
            let q = region_realloc(&mut head, p, 32, 128);
            assert_ne!(p, q);
            for i in 0..32 {
                assert_eq!(*q.add(i), 0x21);
            }
            region_release(&mut head);
        }
    }
}
