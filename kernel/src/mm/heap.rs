//! kernel heap
//!
//! an intrusive free list over a contiguous arena starting at KHEAP_START.
//! every block, used or free, carries a header and sits in one address
//! ordered chain; allocation is first fit with tail splitting, freeing merges
//! with the physically adjacent successor. when the free list comes up empty
//! the arena doubles (up to its hard cap) by demand mapping fresh frames and
//! the allocation retries once

use crate::arch::{KHEAP_INITIAL_SIZE, KHEAP_MAX_SIZE, KHEAP_START, PAGE_SIZE};
use alloc::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use log::{debug, error};
use spin::Mutex;

const MAGIC: u32 = 0xfeedface;

/// the smallest payload worth splitting a block for
const MIN_SPLIT: usize = 8;

const HEADER_SIZE: usize = size_of::<Header>();

/// every block starts with one of these, payload right after
#[repr(C)]
struct Header {
    magic: u32,

    /// payload bytes following this header
    size: usize,

    free: bool,

    /// next block by address, null at the end of the arena
    next: *mut Header,
}

/// heap health counters
#[derive(Debug, Copy, Clone)]
pub struct HeapStats {
    pub arena: usize,
    pub used: usize,
    pub free: usize,
    pub blocks: usize,
}

pub struct Heap {
    start: usize,
    end: usize,
    max: usize,
    head: *mut Header,

    /// growth needs the virtual memory manager; until it's up the arena is
    /// pinned at its initial size
    can_grow: bool,
}

// raw pointers keep Heap from being Send on its own; everything here is
// reached through one global lock
unsafe impl Send for Heap {}

impl Heap {
    /// creates a heap spanning [start, end), one big free block
    ///
    /// # Safety
    ///
    /// the range has to be mapped and unused
    pub unsafe fn new(start: usize, end: usize, max: usize) -> Self {
        let head = start as *mut Header;

        (*head) = Header {
            magic: MAGIC,
            size: (end - start) - HEADER_SIZE,
            free: true,
            next: core::ptr::null_mut(),
        };

        Self {
            start,
            end,
            max,
            head,
            can_grow: false,
        }
    }

    /// rounds a size up to keep payloads 8 byte aligned
    fn round_size(size: usize) -> usize {
        size.max(MIN_SPLIT).div_ceil(8) * 8
    }

    /// first fit allocation walk; returns a payload pointer
    fn alloc_once(&mut self, size: usize, alignment: usize) -> Option<*mut u8> {
        let size = Self::round_size(size);
        let alignment = alignment.max(8);

        let mut block = self.head;

        while !block.is_null() {
            let header = unsafe { &mut *block };
            debug_assert!(header.magic == MAGIC, "heap corruption at {:#x}", block as usize);

            if !header.free {
                block = header.next;
                continue;
            }

            let payload = block as usize + HEADER_SIZE;
            let block_end = payload + header.size;

            // find an aligned payload address inside this block, leaving
            // either no gap in front or enough for a whole free block
            let mut aligned = payload.next_multiple_of(alignment);
            while aligned != payload && aligned - payload < HEADER_SIZE + MIN_SPLIT {
                aligned += alignment;
            }

            if aligned + size > block_end {
                block = header.next;
                continue;
            }

            // carve a free block out of the front gap if there is one
            let alloc_header = if aligned == payload {
                block
            } else {
                let front_gap = aligned - payload;
                header.size = front_gap - HEADER_SIZE;

                let alloc_header = (aligned - HEADER_SIZE) as *mut Header;
                unsafe {
                    (*alloc_header) = Header {
                        magic: MAGIC,
                        size: block_end - aligned,
                        free: true,
                        next: header.next,
                    };
                }
                header.next = alloc_header;

                alloc_header
            };

            let alloc_header = unsafe { &mut *alloc_header };

            // split the tail off when the residue can hold a header plus a
            // minimum payload
            if alloc_header.size - size >= HEADER_SIZE + MIN_SPLIT {
                let tail = (alloc_header as *mut Header as usize + HEADER_SIZE + size) as *mut Header;
                unsafe {
                    (*tail) = Header {
                        magic: MAGIC,
                        size: alloc_header.size - size - HEADER_SIZE,
                        free: true,
                        next: alloc_header.next,
                    };
                }

                alloc_header.next = tail;
                alloc_header.size = size;
            }

            alloc_header.free = false;

            return Some((alloc_header as *mut Header as usize + HEADER_SIZE) as *mut u8);
        }

        None
    }

    /// allocation entry point: first fit, then grow-and-retry-once
    pub fn alloc(&mut self, size: usize, alignment: usize) -> Option<*mut u8> {
        if size == 0 {
            return None;
        }

        if let Some(ptr) = self.alloc_once(size, alignment) {
            return Some(ptr);
        }

        if !self.grow(Self::round_size(size) + alignment + HEADER_SIZE) {
            return None;
        }

        self.alloc_once(size, alignment)
    }

    /// frees a payload pointer handed out by alloc
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let addr = ptr as usize;

        if addr < self.start + HEADER_SIZE || addr >= self.end {
            error!("refusing to free {:#x}, outside the heap arena", addr);
            return;
        }

        let header = unsafe { &mut *((addr - HEADER_SIZE) as *mut Header) };

        if header.magic != MAGIC {
            error!("refusing to free {:#x}, bad block header", addr);
            return;
        }

        if header.free {
            error!("double free of {:#x}", addr);
            return;
        }

        header.free = true;

        // merge with the successor if it's free and physically adjacent
        let next = header.next;
        if !next.is_null() {
            let next_header = unsafe { &*next };

            if next_header.free && (header as *mut Header as usize) + HEADER_SIZE + header.size == next as usize {
                header.size += HEADER_SIZE + next_header.size;
                header.next = next_header.next;
            }
        }
    }

    /// same block if it already fits, otherwise allocate-copy-free
    pub fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> Option<*mut u8> {
        if ptr.is_null() {
            return self.alloc(new_size, 8);
        }

        let header = unsafe { &*((ptr as usize - HEADER_SIZE) as *const Header) };

        if header.magic != MAGIC || header.free {
            error!("refusing to realloc {:#x}, bad block", ptr as usize);
            return None;
        }

        if header.size >= new_size {
            return Some(ptr);
        }

        let new_ptr = self.alloc(new_size, 8)?;
        unsafe {
            core::ptr::copy_nonoverlapping(ptr, new_ptr, header.size);
        }
        self.free(ptr);

        Some(new_ptr)
    }

    /// doubles the arena (up to its cap, and at least enough for `need`) by
    /// mapping fresh frames past the current end
    fn grow(&mut self, need: usize) -> bool {
        if !self.can_grow {
            return false;
        }

        let current = self.end - self.start;
        let mut target = current;

        while target - current < need {
            if self.start + target >= self.max {
                break;
            }

            target = (target * 2).min(self.max - self.start);
        }

        if target - current < need {
            return false;
        }

        // demand map the new stretch of arena
        let mut new_end = self.end;
        for addr in (self.end..self.start + target).step_by(PAGE_SIZE) {
            let Some(frame) = super::frame::alloc_frame() else {
                break;
            };

            if crate::arch::paging::map_kernel_page(addr, frame).is_err() {
                super::frame::free_frame(frame);
                break;
            }

            new_end = addr + PAGE_SIZE;
        }

        if new_end == self.end {
            return false;
        }

        debug!("heap grew from {:#x} to {:#x} bytes", current, new_end - self.start);

        // hand the new memory to the last block if it's free, otherwise
        // append a fresh free block
        let mut block = self.head;
        while !(unsafe { &*block }).next.is_null() {
            block = unsafe { &*block }.next;
        }

        let last = unsafe { &mut *block };
        let last_end = block as usize + HEADER_SIZE + last.size;

        if last.free && last_end == self.end {
            last.size += new_end - self.end;
        } else {
            let header = self.end as *mut Header;
            unsafe {
                (*header) = Header {
                    magic: MAGIC,
                    size: (new_end - self.end) - HEADER_SIZE,
                    free: true,
                    next: core::ptr::null_mut(),
                };
            }
            last.next = header;
        }

        self.end = new_end;

        true
    }

    /// lets the arena grow past its initial size; only sane once paging can
    /// map new pages on demand
    pub fn enable_growth(&mut self) {
        self.can_grow = true;
    }

    pub fn stats(&self) -> HeapStats {
        let mut used = 0;
        let mut free = 0;
        let mut blocks = 0;

        let mut block = self.head;
        while !block.is_null() {
            let header = unsafe { &*block };

            if header.free {
                free += header.size;
            } else {
                used += header.size;
            }

            blocks += 1;
            block = header.next;
        }

        HeapStats {
            arena: self.end - self.start,
            used,
            free,
            blocks,
        }
    }

    /// walks the whole chain checking that headers are intact, blocks are
    /// adjacent, and the sizes add back up to the arena
    pub fn check_consistency(&self) -> bool {
        let mut addr = self.start;
        let mut block = self.head;

        while !block.is_null() {
            if block as usize != addr {
                return false;
            }

            let header = unsafe { &*block };

            if header.magic != MAGIC {
                return false;
            }

            addr += HEADER_SIZE + header.size;
            block = header.next;
        }

        addr == self.end
    }
}

static KERNEL_HEAP: Mutex<Option<Heap>> = Mutex::new(None);

/// sets up the heap over its initial, boot mapped arena
pub fn init() {
    let heap = unsafe { Heap::new(KHEAP_START, KHEAP_START + KHEAP_INITIAL_SIZE, KHEAP_START + KHEAP_MAX_SIZE) };

    *KERNEL_HEAP.lock() = Some(heap);
}

fn with_heap<T, F: FnOnce(&mut Heap) -> T>(f: F) -> T {
    crate::arch::without_interrupts(|| {
        let mut heap = KERNEL_HEAP.lock();
        f(heap.as_mut().expect("heap not initialized"))
    })
}

/// lets the arena grow, for once the virtual memory manager is up
pub fn enable_growth() {
    with_heap(|heap| heap.enable_growth());
}

pub fn kmalloc(size: usize, alignment: usize) -> Option<*mut u8> {
    with_heap(|heap| heap.alloc(size, alignment))
}

/// kmalloc, but the memory comes back zeroed
pub fn kzalloc(size: usize) -> Option<*mut u8> {
    let ptr = kmalloc(size, 8)?;

    unsafe {
        core::ptr::write_bytes(ptr, 0, size);
    }

    Some(ptr)
}

/// allocates whole pages, page aligned
pub fn kmalloc_pages(count: usize) -> Option<*mut u8> {
    kmalloc(count * PAGE_SIZE, PAGE_SIZE)
}

pub fn krealloc(ptr: *mut u8, new_size: usize) -> Option<*mut u8> {
    with_heap(|heap| heap.realloc(ptr, new_size))
}

pub fn kfree(ptr: *mut u8) {
    with_heap(|heap| heap.free(ptr));
}

pub fn stats() -> HeapStats {
    with_heap(|heap| heap.stats())
}

/// verifies free list integrity, for tests and post-init sanity logging
pub fn check_consistency() -> bool {
    with_heap(|heap| heap.check_consistency())
}

/// our custom allocator, allows rust to use our heap
pub struct KernelAllocator;

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match kmalloc(layout.size(), layout.align()) {
            Some(ptr) => ptr,
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        kfree(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        match krealloc(ptr, new_size) {
            Some(ptr) => ptr,
            None => core::ptr::null_mut(),
        }
    }
}
