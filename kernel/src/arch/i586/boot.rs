//! multiboot header and early boot code
//!
//! the bootloader drops us at physical 1 MiB with paging off, so the first
//! order of business is a throwaway page directory built out of 4 MiB pages:
//! the first 8 MiB of memory identity mapped (we're executing there), the same
//! 8 MiB at LINKED_BASE (where the kernel is linked), and a third window
//! handing the memory at 8 MiB to the initial heap arena. once paging is on we
//! jump to the high half and never look back; the memory manager replaces all
//! of this with proper 4 KiB mappings during init

use core::arch::global_asm;

/// how big the boot stack is; kmain and later the idle process run on it
pub const BOOT_STACK_SIZE: usize = 0x4000;

extern "C" {
    /// top of the stack the kernel boots on, defined below
    pub static boot_stack_top: u8;
}

/// gets the address of the top of the boot stack
pub fn boot_stack_top_addr() -> usize {
    unsafe { &boot_stack_top as *const u8 as usize }
}

global_asm!(
    r#"
.section .multiboot.data, "aw"

/* multiboot v1 header: magic, flags (page align modules + memory info), checksum */
.align 4
.long 0x1badb002
.long 0x00000003
.long -(0x1badb002 + 0x00000003)

.section .bss

.align 4096
boot_page_directory:
.skip 4096

.align 16
boot_stack_bottom:
.skip 0x4000
.global boot_stack_top
boot_stack_top:

.section .multiboot.text, "ax"

.global _start
.type _start, @function
_start:
    /* stash the multiboot magic and info pointer */
    mov edi, eax
    mov esi, ebx

    /* build the boot page directory (addresses here are physical) */
    lea ecx, [boot_page_directory - 0xc0000000]

    /* 0x83 = present | writable | 4 MiB page */
    mov dword ptr [ecx + 0 * 4],   0x00000083
    mov dword ptr [ecx + 1 * 4],   0x00400083
    mov dword ptr [ecx + 768 * 4], 0x00000083
    mov dword ptr [ecx + 769 * 4], 0x00400083
    mov dword ptr [ecx + 832 * 4], 0x00800083

    mov cr3, ecx

    /* turn on 4 MiB pages */
    mov ecx, cr4
    or ecx, 0x10
    mov cr4, ecx

    /* turn on paging */
    mov ecx, cr0
    or ecx, 0x80000000
    mov cr0, ecx

    /* and get out of the identity mapped low half */
    lea ecx, [higher_half]
    jmp ecx

.section .text

higher_half:
    lea esp, [boot_stack_top]

    /* kmain(magic, info) */
    push esi
    push edi
    cld
    call kmain

    /* kmain never returns, but just in case */
2:
    cli
    hlt
    jmp 2b
"#
);
