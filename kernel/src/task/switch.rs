//! context resume machinery
//!
//! every context switch travels through the saved-register frame the
//! interrupt trampolines build: the scheduler copies the outgoing frame into
//! its PCB, picks a successor, and this module rebuilds the successor's frame
//! on the right stack and pops into it with iretd
//!
//! ring 3 contexts are staged at the top of their kernel stack; the iret at
//! the end swaps to the user stack anyway. ring 0 contexts are staged just
//! below their saved stack pointer, so the final add/iretd sequence leaves
//! esp exactly where the interrupt found it

use crate::arch::{gdt, ints::InterruptRegisters, read_cr3, write_cr3};
use core::{arch::asm, mem::size_of, sync::atomic::{AtomicBool, Ordering}};

/// a full saved frame, through ss
const FRAME_SIZE: usize = size_of::<InterruptRegisters>();

/// a ring 0 frame: the CPU doesn't push useresp/ss without a privilege
/// change, so those two slots stay off the target stack
const KERNEL_FRAME_SIZE: usize = FRAME_SIZE - 8;

/// whether the CPU is running (or about to run) a process, as opposed to
/// early bring-up or the tail of a context switch; the timer never preempts
/// while this is clear, which is what keeps the kernel non-preemptive
/// against itself
static IN_TASK: AtomicBool = AtomicBool::new(false);

pub fn in_task() -> bool {
    IN_TASK.load(Ordering::SeqCst)
}

pub fn set_in_task(value: bool) {
    IN_TASK.store(value, Ordering::SeqCst);
}

/// drops the CPU into the given context and never comes back
///
/// loads CR3 if the target lives in a different address space (kernel half
/// entries are global and survive), points the TSS at the target's kernel
/// stack when the target runs in ring 3, stages the frame, and restores it
///
/// # Safety
///
/// the frame has to describe a resumable context whose stack and address
/// space are live; interrupts must be disabled
pub unsafe fn resume(frame: InterruptRegisters, kernel_stack_top: usize, page_dir_phys: u32) -> ! {
    debug_assert!(!crate::arch::interrupts_enabled());

    if read_cr3() != page_dir_phys {
        write_cr3(page_dir_phys);
    }

    let (stage, len) = if frame.is_user() {
        gdt::set_kernel_stack(kernel_stack_top as u32);
        (kernel_stack_top - FRAME_SIZE, FRAME_SIZE)
    } else {
        (frame.esp as usize - KERNEL_FRAME_SIZE, KERNEL_FRAME_SIZE)
    };

    core::ptr::copy_nonoverlapping(&frame as *const InterruptRegisters as *const u8, stage as *mut u8, len);

    set_in_task(true);

    enter_frame(stage)
}

/// points esp at a staged frame and pops out through it: segments, general
/// registers, the error code slot, then iretd
unsafe fn enter_frame(stage: usize) -> ! {
    asm!(
        "mov esp, {stage}",
        "pop eax",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "popad",
        "add esp, 4",
        "iretd",
        stage = in(reg) stage,
        options(noreturn),
    )
}
