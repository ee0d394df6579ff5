//! multiboot bootloader info
//!
//! a multiboot v1 loader leaves a magic value in EAX and the physical address
//! of an info structure in EBX; the boot code passes both to kmain untouched.
//! the kernel consumes three pieces of it: the memory totals (flag bit 0),
//! the memory map (flag bit 6), and the loader's name (flag bit 9)

use crate::arch::LINKED_BASE;
use core::{ffi::CStr, fmt};

/// what a multiboot v1 loader puts in EAX
pub const MULTIBOOT_MAGIC: u32 = 0x2bad_b002;

/// rejects anything that didn't come from a multiboot loader; there's no
/// recovering from a boot protocol mismatch
pub fn check_magic(magic: u32) {
    if magic != MULTIBOOT_MAGIC {
        panic!("invalid multiboot signature ({magic:#x})");
    }
}

/// turns the physical info pointer from EBX into a reference
///
/// # Safety
///
/// the pointer has to be the one the loader handed over, and it has to land
/// inside the boot-mapped low memory window
pub unsafe fn get_multiboot_info(ptr: u32) -> &'static MultibootInfo {
    &*((ptr as usize + LINKED_BASE) as *const MultibootInfo)
}

/// the multiboot info structure, exactly as the loader lays it out; fields
/// the kernel ignores still have to be here to keep the offsets right
#[repr(C)]
pub struct MultibootInfo {
    /// which of the fields below are valid
    pub flags: u32,

    /// kb of conventional memory
    mem_lower: u32,

    /// kb of memory above the 1 mb mark
    mem_upper: u32,

    /// bios drive the kernel came from
    boot_device: [u8; 4],

    /// physical address of the kernel command line (c string)
    cmdline: u32,

    /// boot modules: count and physical address of the list
    mods_count: u32,
    mods_addr: u32,

    /// a.out symbol table or elf section headers, unused here
    syms: [u32; 4],

    /// the memory map
    mmap: MemMapList,

    /// bios drive list, unused here
    drives_length: u32,
    drives_addr: u32,

    /// rom configuration table, unused here
    config_table: u32,

    /// physical address of the loader's name (c string)
    bootloader_name: u32,
    // vbe and framebuffer info follow in the real layout; nothing in this
    // kernel reads past this point
}

#[derive(Debug)]
pub struct FlagOutOfBoundsError;

impl MultibootInfo {
    /// whether the loader filled in the field guarded by the given flag bit
    pub fn is_flag_set(&self, flag: u8) -> Result<bool, FlagOutOfBoundsError> {
        if flag < 32 {
            Ok(self.flags & (1 << flag) != 0)
        } else {
            Err(FlagOutOfBoundsError)
        }
    }

    /// lower and upper memory amounts in kb, if the loader provided them
    pub fn get_mem(&self) -> Option<(u32, u32)> {
        if self.is_flag_set(0).unwrap() {
            Some((self.mem_lower, self.mem_upper))
        } else {
            None
        }
    }

    /// total bytes of memory, derived from the upper memory count (which
    /// starts at the 1 mb mark, hence the extra 1024 kb)
    pub fn total_memory(&self) -> Option<u64> {
        let (_, upper) = self.get_mem()?;
        Some((upper as u64 + 1024) * 1024)
    }

    /// iterator over the memory map, if the loader provided one
    pub fn get_mmap(&self) -> Option<MemMapIter<'_>> {
        if self.is_flag_set(6).unwrap() {
            Some(MemMapIter::new(&self.mmap))
        } else {
            None
        }
    }

    /// the loader's name, if it left one
    pub fn get_bootloader_name(&self) -> Option<&str> {
        if self.is_flag_set(9).unwrap() {
            unsafe { CStr::from_ptr((self.bootloader_name as usize + LINKED_BASE) as *const _).to_str().ok() }
        } else {
            None
        }
    }
}

impl fmt::Debug for MultibootInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultibootInfo")
            .field("flags", &self.flags)
            .field("mem", &self.get_mem())
            .field("bootloader_name", &self.get_bootloader_name())
            .finish_non_exhaustive()
    }
}

/// what a memory map region is good for
#[repr(u32)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum MappingKind {
    Unknown = 0,

    /// free for the kernel to use
    Available,

    /// hands off
    Reserved,

    /// holds ACPI tables the OS may reclaim after reading them
    AcpiReclaimable,

    /// ACPI non-volatile storage
    NVS,

    /// failed memory, don't touch
    BadRAM,
}

/// one region of the memory map
#[repr(C)]
#[derive(Debug)]
pub struct MemMapEntry {
    /// bytes this record occupies, minus the size field itself; records are
    /// variable length
    pub size: u32,

    pub base_addr: u64,
    pub length: u64,
    pub kind: MappingKind,
}

/// the memory map as the loader describes it: a byte length and a physical
/// pointer to the first record
#[repr(C)]
pub struct MemMapList {
    length: u32,
    addr: u32,
}

impl fmt::Debug for MemMapList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemMapList").field("length", &self.length).field("addr", &(self.addr as *const u8)).finish()
    }
}

/// walks the memory map; records are variable length, so this steps
/// `size + 4` bytes at a time instead of indexing an array
#[derive(Debug)]
pub struct MemMapIter<'a> {
    list: &'a MemMapList,

    /// virtual address of the next record
    current_addr: usize,

    /// bytes consumed so far, checked against the list length
    consumed: usize,
}

impl<'a> MemMapIter<'a> {
    pub fn new(list: &'a MemMapList) -> Self {
        Self {
            list,
            // the list sits in low memory, reachable through the high half
            current_addr: list.addr as usize + LINKED_BASE,
            consumed: 0,
        }
    }
}

impl<'a> Iterator for MemMapIter<'a> {
    type Item = &'a MemMapEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.consumed >= self.list.length as usize {
            return None;
        }

        let entry = unsafe { &*(self.current_addr as *const MemMapEntry) };

        if entry.size == 0 {
            return None;
        }

        // the size field doesn't count itself
        let step = entry.size as usize + 4;
        self.current_addr += step;
        self.consumed += step;

        Some(entry)
    }
}
