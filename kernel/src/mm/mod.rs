//! memory management

pub mod frame;
pub mod heap;

use crate::{
    arch::{
        paging::{self, PageTableFlags},
        PhysicalAddress, KHEAP_BOOT_PHYS, KHEAP_INITIAL_SIZE, KHEAP_START, LINKED_BASE, PAGE_SIZE,
    },
    platform::bootloader::{MappingKind, MultibootInfo},
};
use alloc::collections::BTreeMap;
use log::{debug, info, warn};
use spin::Mutex;

pub use crate::arch::paging::PageDirectory;
pub use frame::{alloc_frame, free_frame};

/// how many user mappings point at each frame
///
/// fork shares frames between address spaces (copy on write), so a frame may
/// only go back to the allocator once the last mapping lets go of it
static PAGE_REFS: Mutex<BTreeMap<PhysicalAddress, usize>> = Mutex::new(BTreeMap::new());

/// starts tracking a frame that just got its first user mapping
pub fn track_frame(phys: PhysicalAddress) {
    PAGE_REFS.lock().insert(phys, 1);
}

/// notes another mapping of an already tracked frame
pub fn add_frame_reference(phys: PhysicalAddress) {
    *PAGE_REFS.lock().entry(phys).or_insert(1) += 1;
}

/// how many mappings a frame currently has
pub fn frame_reference_count(phys: PhysicalAddress) -> usize {
    PAGE_REFS.lock().get(&phys).copied().unwrap_or(0)
}

/// drops one mapping of a frame, freeing it once nothing points at it anymore
pub fn remove_frame_reference(phys: PhysicalAddress) {
    let mut refs = PAGE_REFS.lock();

    match refs.get_mut(&phys) {
        Some(count) if *count > 1 => *count -= 1,
        Some(_) => {
            refs.remove(&phys);
            drop(refs);
            frame::free_frame(phys);
        }
        None => warn!("removing a reference to untracked frame {:#x}", phys),
    }
}

/// resolves a write fault on a copy on write page in the given address space
///
/// the faulting mapping keeps the frame if it's the last one pointing at it
/// and just gets its write bit back; otherwise it gets a private copy and the
/// original loses a reference. returns false if this wasn't a copy on write
/// situation (or a fresh frame couldn't be had), in which case the fault is
/// fatal
pub fn resolve_cow(dir: &mut PageDirectory, addr: usize) -> bool {
    let page = addr & !(PAGE_SIZE - 1);

    if page >= LINKED_BASE {
        return false;
    }

    let Some(entry) = dir.get_page(page) else {
        return false;
    };

    if !entry.is_copy_on_write() {
        return false;
    }

    let old_phys = entry.get_address();
    let flags = (entry.get_flags() & !PageTableFlags::CopyOnWrite) | PageTableFlags::ReadWrite;

    if frame_reference_count(old_phys) <= 1 {
        // last mapping standing, no copy needed
        debug!("cow fault @ {:#x}: sole owner, restoring write access", page);
        dir.change_flags(page, flags).is_ok()
    } else {
        let Some(new_phys) = frame::alloc_frame() else {
            return false;
        };

        debug!("cow fault @ {:#x}: copying frame {:#x} -> {:#x}", page, old_phys, new_phys);

        // bounce through a heap buffer so this works no matter which address
        // space happens to be live
        let mut buffer = alloc::vec![0_u8; PAGE_SIZE];
        paging::with_scratch_frame(old_phys, |src| buffer.copy_from_slice(&src[..]));
        paging::with_scratch_frame(new_phys, |dst| dst.copy_from_slice(&buffer));

        if dir.map(page, new_phys, flags).is_err() {
            frame::free_frame(new_phys);
            return false;
        }

        track_frame(new_phys);
        remove_frame_reference(old_phys);

        true
    }
}

/// page fault entry point: resolve a copy on write fault against the current
/// process's address space
pub fn handle_cow_fault(addr: usize) -> bool {
    crate::task::with_current_process(|process| resolve_cow(&mut process.page_directory, addr)).unwrap_or(false)
}

/// brings up the heap, the frame allocator, and the virtual memory manager,
/// in that order (the frame bitmap lives on the heap, and page tables live on
/// both)
pub fn init(info: &MultibootInfo) {
    heap::init();

    let mem_size = info.total_memory().expect("couldn't get memory amount");
    let total_frames = (mem_size / PAGE_SIZE as u64) as usize;

    info!("{} KiB of memory, {} frames", mem_size / 1024, total_frames);

    let mut allocator = frame::FrameAllocator::new(total_frames);

    // free every whole frame the bootloader says is available
    if let Some(mmap) = info.get_mmap() {
        for region in mmap {
            debug!(
                "memory region @ {:#x}, {:#x} bytes, {:?}",
                region.base_addr, region.length, region.kind
            );

            if region.kind == MappingKind::Available {
                allocator.free_region(region.base_addr, region.length);
            }
        }
    } else {
        warn!("no memory map from bootloader, assuming everything above 1 MiB is fair game");

        allocator.free_region(0, 0xa0000);
        allocator.free_region(0x100000, mem_size - 0x100000);
    }

    // now re-reserve what's already spoken for: everything below the kernel
    // image plus the image itself, and the boot window backing the early heap
    // arena (the frame bitmap itself lives there too)
    let kernel_end_phys = crate::arch::kernel_end_addr() - LINKED_BASE;
    assert!(kernel_end_phys <= crate::arch::KERNEL_MAP_SIZE, "kernel image doesn't fit its mapped region");
    assert!(kernel_end_phys as u32 <= KHEAP_BOOT_PHYS, "kernel image overlaps the heap's boot window");
    allocator.reserve_region(0, kernel_end_phys as u64);
    allocator.reserve_region(KHEAP_BOOT_PHYS as u64, KHEAP_INITIAL_SIZE as u64);

    let stats = allocator.stats();
    info!("{} frames used, {} free", stats.used, stats.free);

    frame::init(allocator);

    // swap the boot page directory for the real thing
    unsafe {
        paging::init(KHEAP_START + KHEAP_INITIAL_SIZE).expect("couldn't build the kernel page directory");
    }

    heap::enable_growth();

    debug!("heap consistent: {}", heap::check_consistency());
}
