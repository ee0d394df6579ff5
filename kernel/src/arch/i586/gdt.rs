//! i586 global descriptor table (GDT) and task state segment (TSS)
//!
//! six descriptors: null, ring 0 code/data, ring 3 code/data, TSS. the rest
//! of the kernel hardcodes the selectors these produce (0x08, 0x10, 0x1b,
//! 0x23, 0x28), so the order here is load bearing

use aligned::{Aligned, A16};
use core::{arch::asm, mem::size_of, ptr::addr_of, ptr::addr_of_mut};
use log::debug;
use x86::{
    bits32::task::TaskStateSegment,
    dtables::{lgdt, DescriptorTablePointer},
    segmentation::{BuildDescriptor, CodeSegmentType, DataSegmentType, Descriptor, DescriptorBuilder, SegmentDescriptorBuilder, SegmentSelector},
    task::load_tr,
    Ring,
};

const GDT_ENTRIES: usize = 6;

/// the GDT itself (aligned to 16 bits for performance)
static mut GDT: Aligned<A16, [Descriptor; GDT_ENTRIES]> = Aligned([Descriptor::NULL; GDT_ENTRIES]);

/// the TSS; only ESP0/SS0 matter, they steer ring 3 -> ring 0 transitions
/// onto the right kernel stack
static mut TSS: Aligned<A16, TaskStateSegment> = Aligned(TaskStateSegment::new());

/// a flat 4 GiB segment: base 0, page granular limit, 32 bit
fn flat_segment(ring: Ring, executable: bool) -> Descriptor {
    let builder = if executable {
        DescriptorBuilder::code_descriptor(0, 0x000fffff, CodeSegmentType::ExecuteRead)
    } else {
        DescriptorBuilder::data_descriptor(0, 0x000fffff, DataSegmentType::ReadWrite)
    };

    builder.present().dpl(ring).limit_granularity_4kb().db().finish()
}

/// initialize GDT and TSS and swap out whatever the bootloader left loaded
pub unsafe fn init(int_stack_end: u32) {
    let tss = &mut *addr_of_mut!(TSS);

    tss.ss0 = SegmentSelector::new(2, Ring::Ring0).bits();
    tss.esp0 = int_stack_end;
    tss.iobp_offset = size_of::<TaskStateSegment>() as u16; // no I/O permission bitmap

    let gdt = &mut *addr_of_mut!(GDT);

    gdt[0] = Descriptor::NULL;
    gdt[1] = flat_segment(Ring::Ring0, true);
    gdt[2] = flat_segment(Ring::Ring0, false);
    gdt[3] = flat_segment(Ring::Ring3, true);
    gdt[4] = flat_segment(Ring::Ring3, false);

    let base = addr_of!(TSS) as u32;
    debug!("tss @ {:#x}, size {:#x}", base, size_of::<TaskStateSegment>() as u32);

    // rust-x86's tss_descriptor builder gets the system bit wrong, so build
    // the TSS entry as a code segment and patch the bit by hand
    gdt[5] = DescriptorBuilder::code_descriptor(base, size_of::<TaskStateSegment>() as u32, CodeSegmentType::ExecuteAccessed)
        .present()
        .finish();
    gdt[5].upper &= 0xffffefff;

    lgdt(&DescriptorTablePointer::new(&*addr_of!(GDT)));

    reload_segments();

    load_tr(SegmentSelector::new(5, Ring::Ring0));
}

/// points the TSS at the given kernel stack, so the next ring 3 -> ring 0
/// transition lands on it
pub unsafe fn set_kernel_stack(esp0: u32) {
    (&mut *addr_of_mut!(TSS)).esp0 = esp0;
}

/// reloads CS with a far return and the data segments with plain moves
unsafe fn reload_segments() {
    asm!(
        "push 0x08",
        "lea eax, [2f]",
        "push eax",
        "retf",
        "2:",
        "mov ax, 0x10",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "mov ss, ax",
        out("eax") _,
    );
}
