//! physical frame allocator
//!
//! one bit per 4 KiB frame over all of physical memory, set meaning used.
//! init marks everything used, clears whatever the bootloader's memory map
//! calls available, then re-reserves the kernel image and the memory backing
//! the early heap (which is also where this bitmap itself lives)

use crate::arch::{without_interrupts, PhysicalAddress, PAGE_SIZE};
use common::array::BitSet;
use core::fmt;
use log::error;
use spin::Mutex;

/// allocator health counters
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    /// the frame was already free
    DoubleFree,

    /// the address is past the end of physical memory (or not frame aligned)
    OutOfRange,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DoubleFree => write!(f, "frame is already free"),
            Self::OutOfRange => write!(f, "address out of range"),
        }
    }
}

pub struct FrameAllocator {
    /// one bit per frame, set = used
    bitmap: BitSet,

    /// rotating first-fit hint, updated on every alloc and free
    first_free: usize,
}

impl FrameAllocator {
    /// creates an allocator covering the given number of frames, all of them
    /// initially used; regions the bootloader reports as available get
    /// cleared afterwards
    pub fn new(total_frames: usize) -> Self {
        let mut bitmap = BitSet::new(total_frames);
        bitmap.set_all();

        Self { bitmap, first_free: 0 }
    }

    /// marks every whole frame inside the given region as free; partial
    /// frames at the edges stay used
    pub fn free_region(&mut self, base: u64, length: u64) {
        let page_size = PAGE_SIZE as u64;

        let start_frame = base.div_ceil(page_size);
        let end_frame = (base + length) / page_size;

        for frame in start_frame..end_frame {
            if frame < self.bitmap.size() as u64 {
                self.bitmap.clear(frame as usize);
            }
        }
    }

    /// marks every frame touching the given region as used
    pub fn reserve_region(&mut self, base: u64, length: u64) {
        let page_size = PAGE_SIZE as u64;

        let start_frame = base / page_size;
        let end_frame = (base + length).div_ceil(page_size);

        for frame in start_frame..end_frame {
            if frame < self.bitmap.size() as u64 {
                self.bitmap.set(frame as usize);
            }
        }
    }

    /// allocates one frame, rotating first-fit from the hint
    pub fn alloc_one(&mut self) -> Option<PhysicalAddress> {
        let frame = self.bitmap.first_unset_from(self.first_free)?;

        self.bitmap.set(frame);
        self.first_free = (frame + 1) % self.bitmap.size();

        Some((frame * PAGE_SIZE) as PhysicalAddress)
    }

    /// allocates a run of physically contiguous frames, returning the base of
    /// the run; a plain linear scan, there's no compaction to help it
    pub fn alloc_contiguous(&mut self, count: usize) -> Option<PhysicalAddress> {
        if count == 0 {
            return None;
        }

        let total = self.bitmap.size();
        let mut run_start = 0;
        let mut run_len = 0;

        for frame in 0..total {
            if self.bitmap.test(frame) {
                run_len = 0;
                run_start = frame + 1;
            } else {
                run_len += 1;

                if run_len == count {
                    for i in run_start..run_start + count {
                        self.bitmap.set(i);
                    }

                    self.first_free = (run_start + count) % total;
                    return Some((run_start * PAGE_SIZE) as PhysicalAddress);
                }
            }
        }

        None
    }

    /// frees one frame
    pub fn free_one(&mut self, addr: PhysicalAddress) -> Result<(), FrameError> {
        let frame = addr as usize / PAGE_SIZE;

        if addr as usize % PAGE_SIZE != 0 || frame >= self.bitmap.size() {
            return Err(FrameError::OutOfRange);
        }

        if !self.bitmap.test(frame) {
            return Err(FrameError::DoubleFree);
        }

        self.bitmap.clear(frame);
        self.first_free = frame;

        Ok(())
    }

    /// frees a run of contiguous frames
    pub fn free_contiguous(&mut self, addr: PhysicalAddress, count: usize) -> Result<(), FrameError> {
        for i in 0..count {
            self.free_one(addr + (i * PAGE_SIZE) as PhysicalAddress)?;
        }

        Ok(())
    }

    pub fn stats(&self) -> FrameStats {
        let total = self.bitmap.size();
        let used = self.bitmap.bits_used();

        FrameStats {
            total,
            used,
            free: total - used,
        }
    }
}

static FRAME_ALLOCATOR: Mutex<Option<FrameAllocator>> = Mutex::new(None);

/// installs the allocator built during memory init
pub fn init(allocator: FrameAllocator) {
    without_interrupts(|| {
        *FRAME_ALLOCATOR.lock() = Some(allocator);
    });
}

fn with_allocator<T, F: FnOnce(&mut FrameAllocator) -> T>(f: F) -> T {
    without_interrupts(|| {
        let mut allocator = FRAME_ALLOCATOR.lock();
        f(allocator.as_mut().expect("frame allocator not initialized"))
    })
}

/// allocates a single frame; a None here is a normal, reportable failure
pub fn alloc_frame() -> Option<PhysicalAddress> {
    with_allocator(|a| a.alloc_one())
}

/// allocates physically contiguous frames
pub fn alloc_frames_contiguous(count: usize) -> Option<PhysicalAddress> {
    with_allocator(|a| a.alloc_contiguous(count))
}

/// frees a single frame, logging (rather than propagating) double frees and
/// bad addresses since callers can't do anything useful about either
pub fn free_frame(addr: PhysicalAddress) {
    with_allocator(|a| {
        if let Err(err) = a.free_one(addr) {
            error!("couldn't free frame {:#x}: {}", addr, err);
        }
    });
}

/// frees a run of contiguous frames
pub fn free_frames_contiguous(addr: PhysicalAddress, count: usize) {
    with_allocator(|a| {
        if let Err(err) = a.free_contiguous(addr, count) {
            error!("couldn't free {} frames @ {:#x}: {}", count, addr, err);
        }
    });
}

pub fn stats() -> FrameStats {
    with_allocator(|a| a.stats())
}
