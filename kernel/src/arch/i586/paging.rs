//! x86 non-PAE paging
//!
//! every address space is a `PageDirectory`: a physical directory the CPU
//! walks, plus the heap-owned page tables backing it. kernel slots (the
//! identity window, the kernel image, the scratch page, and the heap arena)
//! are created once at init and shared by value with every process directory,
//! so the high half looks identical no matter which CR3 is loaded

use super::{
    KERNEL_MAP_SIZE, KHEAP_BOOT_PHYS, KHEAP_MAX_SIZE, KHEAP_START, LINKED_BASE, PAGE_SIZE, SCRATCH_PAGE, TABLE_SIZE, USER_BASE,
};
use crate::arch::PhysicalAddress;
use alloc::{
    alloc::{alloc_zeroed, Layout},
    boxed::Box,
    vec::Vec,
};
use bitmask_enum::bitmask;
use common::{Errno, Result};
use core::{fmt, pin::Pin};
use log::trace;
use spin::Mutex;

/// slot of the first page directory entry belonging to the user region
pub const USER_PDE_START: usize = USER_BASE / TABLE_SIZE;

/// slot of the first page directory entry above the user region
pub const USER_PDE_END: usize = LINKED_BASE / TABLE_SIZE;

/// page table entry flags
#[bitmask(u16)]
pub enum PageTableFlags {
    /// no flags?
    None = 0,

    /// page is present in memory and can be accessed
    Present = 1 << 0,

    /// code can read and write to page
    ///
    /// absence of this flag forces read only
    ReadWrite = 1 << 1,

    /// page is accessible in user mode
    ///
    /// absence of this flag only allows supervisor access
    UserSupervisor = 1 << 2,

    /// enables write-through caching instead of write-back
    PageWriteThru = 1 << 3,

    /// disables caching for this page
    PageCacheDisable = 1 << 4,

    /// set if page has been accessed during address translation
    Accessed = 1 << 5,

    /// set if page has been written to
    Dirty = 1 << 6,

    /// can be set if page attribute table is supported, allows setting cache disable and write thru bits
    PageAttributeTable = 1 << 7,

    /// tells cpu to not invalidate this page table entry in cache when page tables are reloaded
    Global = 1 << 8,

    /// one of the CPU-ignored bits; if this is set and the writable bit
    /// isn't, a write to the page gets the writer its own copy of the frame
    CopyOnWrite = 1 << 9,
}

/// entry in a page table
#[repr(transparent)]
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    /// create new page table entry
    pub const fn new(addr: PhysicalAddress, flags: PageTableFlags) -> Self {
        Self((addr & 0xfffff000) | (flags.bits & 0x0fff) as u32)
    }

    /// create an unused page table entry
    pub const fn new_unused() -> Self {
        Self(0)
    }

    /// checks if this page table entry is unused
    pub fn is_unused(&self) -> bool {
        self.0 == 0 // lol. lmao
    }

    /// gets address of page table entry
    pub fn get_address(&self) -> PhysicalAddress {
        self.0 & 0xfffff000
    }

    /// gets flags of page table entry
    pub fn get_flags(&self) -> PageTableFlags {
        PageTableFlags {
            bits: (self.0 & 0x0fff) as u16,
        }
    }

    /// set flags of page table entry
    pub fn set_flags(&mut self, flags: PageTableFlags) {
        self.0 = (self.0 & 0xfffff000) | (flags.bits & 0x0fff) as u32;
    }

    /// whether this entry can be handed a private copy of its frame on a
    /// write fault
    pub fn is_copy_on_write(&self) -> bool {
        let flags = self.get_flags();
        (flags & PageTableFlags::Present).bits != 0
            && (flags & PageTableFlags::CopyOnWrite).bits != 0
            && (flags & PageTableFlags::ReadWrite).bits == 0
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = self.get_address() as *const u8;

        f.debug_struct("PageTableEntry").field("address", &addr).field("flags", &self.get_flags()).finish()
    }
}

/// page directory entry flags
///
/// all absent flags override flags of children, i.e. not having the read
/// write bit set prevents all page table entries in the page directory from
/// being writable
#[bitmask(u16)]
pub enum PageDirFlags {
    /// no flags?
    None = 0,

    /// pages are present in memory and can be accessed
    Present = 1 << 0,

    /// code can read/write to pages
    ReadWrite = 1 << 1,

    /// pages are accessible in user mode
    UserSupervisor = 1 << 2,

    /// enables write-through caching instead of write-back
    PageWriteThru = 1 << 3,

    /// disables caching for this page
    PageCacheDisable = 1 << 4,

    /// set if page has been accessed during address translation
    Accessed = 1 << 5,

    /// set if page has been written to; only available if page is large
    Dirty = 1 << 6,

    /// enables large (4mb) pages
    PageSize = 1 << 7,

    /// tells cpu to not invalidate this page table entry in cache when page tables are reloaded
    Global = 1 << 8,
}

/// entry in a page directory
#[repr(transparent)]
#[derive(Copy, Clone, Default)]
pub struct PageDirEntry(u32);

impl PageDirEntry {
    /// create new page directory entry
    pub const fn new(addr: PhysicalAddress, flags: PageDirFlags) -> Self {
        Self((addr & 0xfffff000) | (flags.bits & 0x0fff) as u32)
    }

    /// create an unused page directory entry
    pub const fn new_unused() -> Self {
        Self(0)
    }

    /// checks if this page dir entry is unused
    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }

    /// gets address of page directory entry
    pub fn get_address(&self) -> PhysicalAddress {
        self.0 & 0xfffff000
    }
}

impl fmt::Debug for PageDirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = self.get_address() as *const u8;
        let flags = PageDirFlags { bits: (self.0 & 0x0fff) as u16 };

        f.debug_struct("PageDirEntry").field("address", &addr).field("flags", &flags).finish()
    }
}

/// a page table; wants to be page aligned so its physical address is clean
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 1024],
}

impl PageTable {
    /// whether every entry in this table is unused
    fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_unused())
    }
}

/// the physical half of a page directory, the thing CR3 actually points at
#[repr(C, align(4096))]
struct DirectoryEntries {
    entries: [PageDirEntry; 1024],
}

/// allocates a zeroed, page aligned T on the kernel heap
fn alloc_pinned_zeroed<T>() -> Result<Pin<Box<T>>> {
    let layout = Layout::new::<T>();

    // alloc_zeroed avoids materializing a 4 KiB zero block on the stack
    let ptr = unsafe { alloc_zeroed(layout) } as *mut T;

    if ptr.is_null() {
        Err(Errno::OutOfMemory)
    } else {
        Ok(Box::into_pin(unsafe { Box::from_raw(ptr) }))
    }
}

/// a full address space: the shared kernel half plus per-process mappings
pub struct PageDirectory {
    /// page tables owned by this directory, by slot; kernel slots borrowed
    /// from the kernel directory stay `None` here
    tables: Box<[Option<Pin<Box<PageTable>>>; 1024]>,

    /// the physical directory the CPU walks
    physical: Pin<Box<DirectoryEntries>>,

    /// physical address of `physical`, what CR3 gets loaded with
    physical_addr: PhysicalAddress,
}

impl PageDirectory {
    /// creates a page directory with every slot empty
    pub fn new_empty() -> Result<Self> {
        let mut tables = Vec::new();
        tables.try_reserve_exact(1024).map_err(|_| Errno::OutOfMemory)?;
        tables.resize_with(1024, || None);
        let tables: Box<[Option<Pin<Box<PageTable>>>; 1024]> = tables.into_boxed_slice().try_into().map_err(|_| Errno::OutOfMemory)?;

        let physical = alloc_pinned_zeroed::<DirectoryEntries>()?;
        let physical_addr = translate_kernel(&*physical as *const _ as usize).ok_or(Errno::OutOfMemory)?;

        Ok(Self {
            tables,
            physical,
            physical_addr,
        })
    }

    /// creates the directory for a new process: every kernel slot (identity
    /// window, kernel image, scratch page, heap arena) is copied by value
    /// from the kernel directory, the user region starts out unmapped
    pub fn new_process() -> Result<Self> {
        let mut dir = Self::new_empty()?;

        let kernel_dir = KERNEL_PAGE_DIR.lock();
        let kernel_dir = kernel_dir.as_ref().expect("paging not initialized");

        for idx in (0..USER_PDE_START).chain(USER_PDE_END..1024) {
            dir.physical.entries[idx] = kernel_dir.physical.entries[idx];
        }

        Ok(dir)
    }

    /// the physical address to load into CR3 for this address space
    pub fn physical_addr(&self) -> PhysicalAddress {
        self.physical_addr
    }

    /// makes sure the page table covering the given slot exists, allocating
    /// and installing a zeroed one if it doesn't
    fn ensure_table(&mut self, idx: usize, user: bool) -> Result<()> {
        if self.tables[idx].is_some() {
            return Ok(());
        }

        let table = alloc_pinned_zeroed::<PageTable>()?;
        let phys = translate_kernel(&*table as *const _ as usize).ok_or(Errno::OutOfMemory)?;

        trace!("new page table for slot {:#x} (phys {:#x})", idx, phys);

        let mut flags = PageDirFlags::Present | PageDirFlags::ReadWrite;
        if user {
            flags |= PageDirFlags::UserSupervisor;
        }
        if idx >= USER_PDE_END {
            flags |= PageDirFlags::Global;
        }

        self.physical.entries[idx] = PageDirEntry::new(phys, flags);
        self.tables[idx] = Some(table);

        Ok(())
    }

    /// installs a mapping from the given page to the given frame; the owning
    /// page table is allocated on demand, and the TLB entry is invalidated
    pub fn map(&mut self, addr: usize, phys: PhysicalAddress, flags: PageTableFlags) -> Result<()> {
        let idx = addr / TABLE_SIZE;
        let user = (flags & PageTableFlags::UserSupervisor).bits != 0;

        self.ensure_table(idx, user)?;

        let mut flags = flags | PageTableFlags::Present;
        if addr >= LINKED_BASE {
            // kernel half mappings survive address space switches
            flags |= PageTableFlags::Global;
        }

        let table = self.tables[idx].as_mut().unwrap();
        table.as_mut().get_mut().entries[(addr / PAGE_SIZE) % 1024] = PageTableEntry::new(phys, flags);

        super::invlpg(addr);

        Ok(())
    }

    /// removes the mapping for the given page and invalidates its TLB entry;
    /// a user page table left entirely empty is handed back to the heap
    pub fn unmap(&mut self, addr: usize) {
        let idx = addr / TABLE_SIZE;

        if let Some(table) = self.tables[idx].as_mut() {
            table.as_mut().get_mut().entries[(addr / PAGE_SIZE) % 1024] = PageTableEntry::new_unused();

            // kernel tables are shared with every other address space and
            // have to stay put even when empty
            if (USER_PDE_START..USER_PDE_END).contains(&idx) && table.is_empty() {
                self.tables[idx] = None;
                self.physical.entries[idx] = PageDirEntry::new_unused();
            }
        }

        super::invlpg(addr);
    }

    /// reads the page table entry covering the given address, if its table
    /// exists; kernel half lookups on a process directory go through the
    /// kernel directory, which owns those tables
    pub fn get_page(&self, addr: usize) -> Option<PageTableEntry> {
        let idx = addr / TABLE_SIZE;

        if let Some(table) = self.tables[idx].as_ref() {
            let entry = table.entries[(addr / PAGE_SIZE) % 1024];

            if entry.is_unused() {
                None
            } else {
                Some(entry)
            }
        } else if !self.physical.entries[idx].is_unused() {
            kernel_get_page(addr)
        } else {
            None
        }
    }

    /// walks the directory and table for the given virtual address, returning
    /// the physical address it maps to
    pub fn translate(&self, addr: usize) -> Option<PhysicalAddress> {
        let entry = self.get_page(addr)?;

        if (entry.get_flags() & PageTableFlags::Present).bits == 0 {
            None
        } else {
            Some(entry.get_address() | (addr % PAGE_SIZE) as PhysicalAddress)
        }
    }

    /// whether the given virtual address has a present mapping
    pub fn is_mapped(&self, addr: usize) -> bool {
        self.translate(addr).is_some()
    }

    /// replaces the flags of an existing mapping, keeping its frame
    pub fn change_flags(&mut self, addr: usize, flags: PageTableFlags) -> Result<()> {
        let idx = addr / TABLE_SIZE;

        let table = self.tables[idx].as_mut().ok_or(Errno::InvalidAddress)?;
        let entry = &mut table.as_mut().get_mut().entries[(addr / PAGE_SIZE) % 1024];

        if entry.is_unused() {
            return Err(Errno::InvalidAddress);
        }

        entry.set_flags(flags | PageTableFlags::Present);
        super::invlpg(addr);

        Ok(())
    }

    /// clones this address space for fork
    ///
    /// the child gets a fresh directory and a fresh page table per present
    /// user slot (sharing tables would make per-side copy on write marking
    /// impossible); both parent and child entries for originally writable
    /// pages lose their write bit and gain the copy on write mark, and every
    /// shared frame picks up a reference. kernel slots are shared by value
    ///
    /// everything that can fail happens before either side is touched, so a
    /// clone that runs out of memory leaves the parent exactly as it was: no
    /// stray references, no half-marked entries
    pub fn clone_for_fork(&mut self) -> Result<Self> {
        let mut new = Self::new_process()?;

        // phase one: allocate a child table for every present user slot
        let mut child_tables = Vec::new();
        for idx in USER_PDE_START..USER_PDE_END {
            if self.tables[idx].is_none() {
                continue;
            }

            let table = alloc_pinned_zeroed::<PageTable>()?;
            let phys = translate_kernel(&*table as *const _ as usize).ok_or(Errno::OutOfMemory)?;

            child_tables.try_reserve(1).map_err(|_| Errno::OutOfMemory)?;
            child_tables.push((idx, table, phys));
        }

        // phase two can't fail: count the shared frames and mark both sides
        for (idx, mut child_table, child_phys) in child_tables {
            let parent_table = self.tables[idx].as_mut().unwrap().as_mut().get_mut();
            let child_entries = child_table.as_mut().get_mut();

            for (i, entry) in parent_table.entries.iter_mut().enumerate() {
                if entry.is_unused() {
                    continue;
                }

                let flags = entry.get_flags();
                if (flags & PageTableFlags::Present).bits != 0 {
                    crate::mm::add_frame_reference(entry.get_address());

                    if (flags & PageTableFlags::ReadWrite).bits != 0 {
                        entry.set_flags((flags & !PageTableFlags::ReadWrite) | PageTableFlags::CopyOnWrite);
                    }
                }

                child_entries.entries[i] = *entry;
            }

            let pde = self.physical.entries[idx];
            new.physical.entries[idx] = PageDirEntry::new(child_phys, PageDirFlags { bits: (pde.0 & 0x0fff) as u16 });
            new.tables[idx] = Some(child_table);
        }

        // the parent's write permissions just changed under its feet
        super::flush_tlb();

        Ok(new)
    }

    /// tears down the user half of this address space: every present user
    /// frame loses a reference (freeing it if that was the last one) and
    /// every user page table goes back to the heap. the directory itself and
    /// the kernel half stay intact
    pub fn free_user_pages(&mut self) {
        for idx in USER_PDE_START..USER_PDE_END {
            let Some(table) = self.tables[idx].take() else {
                continue;
            };

            for entry in table.entries.iter() {
                if !entry.is_unused() && (entry.get_flags() & PageTableFlags::Present).bits != 0 {
                    crate::mm::remove_frame_reference(entry.get_address());
                }
            }

            self.physical.entries[idx] = PageDirEntry::new_unused();
        }

        super::flush_tlb();
    }

    /// loads this address space into CR3
    pub unsafe fn switch_to(&self) {
        // the reference has to be somewhere the new address space also maps
        assert!(self as *const _ as usize >= LINKED_BASE, "page directory reference isn't in kernel memory");

        super::write_cr3(self.physical_addr);
    }
}

impl fmt::Debug for PageDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageDirectory")
            .field("physical_addr", &(self.physical_addr as *const u8))
            .field("owned_tables", &self.tables.iter().filter(|t| t.is_some()).count())
            .finish()
    }
}

/// the kernel's own address space, the template every process directory
/// copies its kernel slots from
static KERNEL_PAGE_DIR: Mutex<Option<PageDirectory>> = Mutex::new(None);

/// translates a kernel virtual address to its physical address
///
/// before the kernel directory exists this falls back to the fixed windows
/// the boot page directory establishes (the kernel image at LINKED_BASE and
/// the initial heap arena), which is exactly where early allocations live
pub fn translate_kernel(addr: usize) -> Option<PhysicalAddress> {
    let dir = KERNEL_PAGE_DIR.lock();

    match dir.as_ref() {
        Some(dir) => dir.translate(addr),
        None => boot_virt_to_phys(addr),
    }
}

/// address math for the boot page directory's windows
fn boot_virt_to_phys(addr: usize) -> Option<PhysicalAddress> {
    if (LINKED_BASE..LINKED_BASE + 2 * TABLE_SIZE).contains(&addr) {
        Some((addr - LINKED_BASE) as PhysicalAddress)
    } else if (KHEAP_START..KHEAP_START + TABLE_SIZE).contains(&addr) {
        Some((addr - KHEAP_START) as PhysicalAddress + KHEAP_BOOT_PHYS)
    } else {
        None
    }
}

/// reads a page table entry out of the kernel directory
fn kernel_get_page(addr: usize) -> Option<PageTableEntry> {
    KERNEL_PAGE_DIR.lock().as_ref()?.get_page(addr)
}

/// builds the kernel's address space and switches to it, replacing the 4 MiB
/// boot mappings with proper 4 KiB ones:
///
/// - the first 4 MiB identity mapped (early bring-up, the VGA window)
/// - the same 4 MiB at LINKED_BASE, global, where the kernel actually runs
/// - an empty table for the scratch page
/// - tables for the entire heap arena range, so the kernel half never
///   changes shape again once processes start copying it
/// - the heap pages handed out so far, mapped to their boot-window frames
pub unsafe fn init(heap_mapped_end: usize) -> Result<()> {
    let mut dir = PageDirectory::new_empty()?;

    for offset in (0..KERNEL_MAP_SIZE).step_by(PAGE_SIZE) {
        dir.map(offset, offset as PhysicalAddress, PageTableFlags::ReadWrite)?;
        dir.map(LINKED_BASE + offset, offset as PhysicalAddress, PageTableFlags::ReadWrite)?;
    }

    dir.ensure_table(SCRATCH_PAGE / TABLE_SIZE, false)?;

    for idx in (KHEAP_START / TABLE_SIZE)..((KHEAP_START + KHEAP_MAX_SIZE) / TABLE_SIZE) {
        dir.ensure_table(idx, false)?;
    }

    for addr in (KHEAP_START..heap_mapped_end).step_by(PAGE_SIZE) {
        dir.map(addr, (addr - KHEAP_START) as PhysicalAddress + KHEAP_BOOT_PHYS, PageTableFlags::ReadWrite)?;
    }

    dir.switch_to();

    *KERNEL_PAGE_DIR.lock() = Some(dir);

    Ok(())
}

/// maps a freshly allocated frame into the kernel's address space, for heap
/// growth; the heap arena's page tables were created during init, so this
/// never allocates
pub fn map_kernel_page(addr: usize, phys: PhysicalAddress) -> Result<()> {
    let mut dir = KERNEL_PAGE_DIR.lock();
    dir.as_mut().ok_or(Errno::OutOfMemory)?.map(addr, phys, PageTableFlags::ReadWrite)
}

/// maps the given frame at the scratch page and hands a byte slice over it to
/// the closure; used to fill or copy frames that aren't reachable through the
/// current address space
///
/// the scratch page table is shared with every address space, so this works
/// no matter which CR3 is loaded
pub fn with_scratch_frame<T, F: FnOnce(&mut [u8; PAGE_SIZE]) -> T>(phys: PhysicalAddress, f: F) -> T {
    super::without_interrupts(|| {
        let mut dir = KERNEL_PAGE_DIR.lock();
        let dir = dir.as_mut().expect("paging not initialized");

        dir.map(SCRATCH_PAGE, phys, PageTableFlags::ReadWrite).expect("scratch table disappeared");

        let result = f(unsafe { &mut *(SCRATCH_PAGE as *mut [u8; PAGE_SIZE]) });

        dir.unmap(SCRATCH_PAGE);

        result
    })
}
