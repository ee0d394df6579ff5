//! i586 low level interrupt/exception handling

use aligned::{Aligned, A16};
use core::{fmt, ptr::addr_of, ptr::addr_of_mut};
use interrupt_macro::*;
use log::{error, info, trace, warn};
use x86::{
    dtables::{lidt, DescriptorTablePointer},
    segmentation::SegmentSelector,
    Ring,
};

use super::INITIAL_EFLAGS;

/// the vector user processes trap into for syscalls
pub const SYSCALL_INT: usize = 0x80;

/// the vector kernel processes trap into to reach the scheduler; DPL 0, so
/// userspace can't touch it
pub const SERVICE_INT: usize = 0x81;

/// gate type nibble: 32 bit interrupt gate, so the CPU clears IF on entry
/// and the handler runs undisturbed until its iret
const GATE_INTERRUPT: u8 = 0x0e;

/// present bit of the attributes byte
const GATE_PRESENT: u8 = 0x80;

/// one gate of the IDT: where a handler lives and who may trigger it
///
/// the handler address is split across the two ends of the entry because
/// that's just how the hardware wants it
#[repr(C, packed(16))]
#[derive(Copy, Clone)]
pub struct IDTEntry {
    /// handler address, low half
    offset_low: u16,

    /// code segment the handler runs in
    selector: u16,

    reserved: u8,

    /// present bit, privilege check, gate type
    attributes: u8,

    /// handler address, high half
    offset_high: u16,
}

impl IDTEntry {
    /// a present interrupt gate for the given handler, triggerable from the
    /// given ring or below; the handler itself always runs in ring 0 in the
    /// kernel code segment
    ///
    /// exceptions and IRQs take Ring0 (hardware delivery ignores the DPL
    /// anyway), the syscall vector takes Ring3 so userspace can int into it
    fn new(handler: *const (), dpl: Ring) -> Self {
        let address = handler as u32;

        Self {
            offset_low: address as u16,
            offset_high: (address >> 16) as u16,
            selector: SegmentSelector::new(1, Ring::Ring0).bits(),
            attributes: GATE_PRESENT | ((dpl as u8) << 5) | GATE_INTERRUPT,
            reserved: 0,
        }
    }

    /// a gate with the present bit clear; triggering one of these faults
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            reserved: 0,
            attributes: 0,
            offset_high: 0,
        }
    }
}

/// the CPU exception vectors this kernel installs named handlers for; the
/// remaining slots below 32 get a catch-all
pub enum Exceptions {
    DivideByZero = 0,
    Debug = 1,
    NonMaskableInterrupt = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRangeExceeded = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    InvalidTSS = 10,
    SegmentNotPresent = 11,
    StackSegmentFault = 12,
    GeneralProtectionFault = 13,
    PageFault = 14,
    FloatingPoint = 16,
    AlignmentCheck = 17,
    MachineCheck = 18,
    SIMDFloatingPoint = 19,
}

/// page fault error code wrapper
#[repr(transparent)]
pub struct PageFaultErrorCode(pub u32);

impl PageFaultErrorCode {
    /// whether the faulting access was a write to a present page, the only
    /// recoverable (copy on write) combination
    pub fn is_write_to_present(&self) -> bool {
        self.0 & 0x3 == 0x3
    }
}

impl fmt::Display for PageFaultErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} on a {} page{}",
            if self.0 & (1 << 2) > 0 { "user" } else { "supervisor" },
            if self.0 & (1 << 1) > 0 { "write" } else { "read" },
            if self.0 & (1 << 0) > 0 { "present" } else { "missing" },
            if self.0 & (1 << 4) > 0 { " (instruction fetch)" } else { "" },
        )
    }
}

/// registers passed to interrupt handlers, in the exact order the trampoline
/// pushes them (ds last, ss first)
///
/// for interrupts taken from ring 3 the CPU pushes useresp and ss; from ring 0
/// those two slots are whatever happened to be on the stack, and the stack
/// pointer to resume with is the address of the useresp slot itself
#[repr(C)]
#[derive(Default, Copy, Clone)]
pub struct InterruptRegisters {
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub useresp: u32,
    pub ss: u32,
}

impl InterruptRegisters {
    /// context for a fresh kernel process: ring 0 selectors, entry point, and
    /// its own stack
    pub fn new_kernel(entry_point: usize, stack_top: usize) -> Self {
        Self {
            cs: SegmentSelector::new(1, Ring::Ring0).bits().into(),
            ds: SegmentSelector::new(2, Ring::Ring0).bits().into(),
            ss: SegmentSelector::new(2, Ring::Ring0).bits().into(),

            eip: entry_point as u32,
            esp: stack_top as u32,
            ebp: stack_top as u32,
            eflags: INITIAL_EFLAGS,

            ..Default::default()
        }
    }

    /// context for a fresh user process: ring 3 selectors and the user stack;
    /// the iret this context is restored with drops the CPU to ring 3
    pub fn new_user(entry_point: usize, user_stack_top: usize) -> Self {
        Self {
            cs: SegmentSelector::new(3, Ring::Ring3).bits().into(),
            ds: SegmentSelector::new(4, Ring::Ring3).bits().into(),
            ss: SegmentSelector::new(4, Ring::Ring3).bits().into(),

            eip: entry_point as u32,
            useresp: (user_stack_top - 4) as u32,
            ebp: (user_stack_top - 4) as u32,
            eflags: INITIAL_EFLAGS,

            ..Default::default()
        }
    }

    /// whether this context resumes in ring 3
    pub fn is_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// the stack pointer a ring 0 context interrupted here resumes with: the
    /// CPU pushed eflags/cs/eip without switching stacks, so the pre-interrupt
    /// esp is exactly where the useresp slot of this frame sits
    pub fn kernel_resume_esp(&self) -> u32 {
        &self.useresp as *const u32 as u32
    }
}

struct Hex(u32);

impl fmt::Debug for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Debug for InterruptRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptRegisters")
            .field("ds", &Hex(self.ds))
            .field("edi", &Hex(self.edi))
            .field("esi", &Hex(self.esi))
            .field("ebp", &Hex(self.ebp))
            .field("esp", &Hex(self.esp))
            .field("ebx", &Hex(self.ebx))
            .field("edx", &Hex(self.edx))
            .field("ecx", &Hex(self.ecx))
            .field("eax", &Hex(self.eax))
            .field("error_code", &Hex(self.error_code))
            .field("eip", &Hex(self.eip))
            .field("cs", &Hex(self.cs))
            .field("eflags", &Hex(self.eflags))
            .field("useresp", &Hex(self.useresp))
            .field("ss", &Hex(self.ss))
            .finish()
    }
}

/// last stop for exceptions the kernel can't recover from: dump the faulting
/// context and stop the machine
unsafe fn generic_exception(name: &str, regs: &mut InterruptRegisters) -> ! {
    super::cli();

    if regs.error_code == 0 {
        error!("PANIC: {name} @ {:#x}, no error code", regs.eip);
    } else {
        error!("PANIC: {name} @ {:#x}, error code {:#x}", regs.eip, regs.error_code);
    }

    info!("{:#?}", regs);

    super::halt();
}

/// exception handler for divide by zero
#[interrupt(x86)]
unsafe fn divide_by_zero_handler(regs: &mut InterruptRegisters) {
    generic_exception("divide by zero", regs);
}

/// exception handler for breakpoint
#[interrupt(x86)]
unsafe fn breakpoint_handler(regs: &mut InterruptRegisters) {
    info!("breakpoint @ {:#x}", regs.eip);
}

#[interrupt(x86)]
unsafe fn nmi_handler(regs: &mut InterruptRegisters) {
    warn!("got NMI @ {:#x}", regs.eip);
}

/// exception handler for overflow
#[interrupt(x86)]
unsafe fn overflow_handler(regs: &mut InterruptRegisters) {
    info!("overflow @ {:#x}", regs.eip);
}

/// exception handler for bound range exceeded
#[interrupt(x86)]
unsafe fn bound_range_handler(regs: &mut InterruptRegisters) {
    generic_exception("bound range exceeded", regs);
}

/// exception handler for invalid opcode
#[interrupt(x86)]
unsafe fn invalid_opcode_handler(regs: &mut InterruptRegisters) {
    generic_exception("invalid opcode", regs);
}

/// exception handler for device not available
#[interrupt(x86)]
unsafe fn device_not_available_handler(regs: &mut InterruptRegisters) {
    generic_exception("device not available", regs);
}

/// exception handler for double fault
#[interrupt(x86_error_code)]
unsafe fn double_fault_handler(regs: &mut InterruptRegisters) {
    generic_exception("double fault", regs);
}

/// exception handler for invalid tss
#[interrupt(x86_error_code)]
unsafe fn invalid_tss_handler(regs: &mut InterruptRegisters) {
    generic_exception("invalid TSS", regs);
}

/// exception handler for segment not present
#[interrupt(x86_error_code)]
unsafe fn segment_not_present_handler(regs: &mut InterruptRegisters) {
    generic_exception("segment not present", regs);
}

/// exception handler for stack-segment fault
#[interrupt(x86_error_code)]
unsafe fn stack_segment_handler(regs: &mut InterruptRegisters) {
    generic_exception("stack-segment fault", regs);
}

/// exception handler for general protection fault
#[interrupt(x86_error_code)]
unsafe fn general_protection_fault_handler(regs: &mut InterruptRegisters) {
    generic_exception("general protection fault", regs);
}

/// exception handler for page fault; write faults on copy on write pages are
/// resolved here, anything else is fatal
#[interrupt(x86_error_code)]
unsafe fn page_fault_handler(regs: &mut InterruptRegisters) {
    let address = super::read_cr2();
    let code = PageFaultErrorCode(regs.error_code);

    if code.is_write_to_present() && crate::mm::handle_cow_fault(address as usize) {
        return;
    }

    super::cli();

    error!("PANIC: page fault @ {:#x} (accessed {:#x}), {}", regs.eip, address, code);
    info!("{:#?}", regs);

    super::halt();
}

/// exception handler for x87 floating point exception
#[interrupt(x86)]
unsafe fn x87_fpu_exception_handler(regs: &mut InterruptRegisters) {
    generic_exception("x87 FPU exception", regs);
}

/// exception handler for alignment check
#[interrupt(x86_error_code)]
unsafe fn alignment_check_handler(regs: &mut InterruptRegisters) {
    generic_exception("alignment check", regs);
}

/// exception handler for machine check
#[interrupt(x86)]
unsafe fn machine_check_handler(regs: &mut InterruptRegisters) {
    generic_exception("machine check", regs);
}

/// exception handler for SIMD floating point exception
#[interrupt(x86)]
unsafe fn simd_fpu_exception_handler(regs: &mut InterruptRegisters) {
    generic_exception("SIMD FPU exception", regs);
}

/// handler for the reserved exception vectors, which shouldn't ever fire
#[interrupt(x86)]
unsafe fn reserved_exception_handler(regs: &mut InterruptRegisters) {
    generic_exception("reserved exception", regs);
}

/// IRQ 0 is the PIT; EOI goes out before the tick since the scheduler may
/// resume a different context instead of returning through the trampoline
#[interrupt(x86)]
unsafe fn timer_irq_handler(regs: &mut InterruptRegisters) {
    crate::platform::pic::eoi(0);
    crate::timer::tick(regs);
}

/// IRQ 1 is the PS/2 keyboard
#[interrupt(x86)]
unsafe fn keyboard_irq_handler(_regs: &mut InterruptRegisters) {
    crate::platform::pic::eoi(1);
    crate::platform::keyboard::handle_irq();
}

/// every other IRQ line is acknowledged and otherwise ignored
macro_rules! stub_irq_handler {
    ($name:ident, $num:literal) => {
        #[interrupt(x86)]
        unsafe fn $name(_regs: &mut InterruptRegisters) {
            trace!("ignoring irq {}", $num);
            crate::platform::pic::eoi($num);
        }
    };
}

stub_irq_handler!(irq2_handler, 2);
stub_irq_handler!(irq3_handler, 3);
stub_irq_handler!(irq4_handler, 4);
stub_irq_handler!(irq5_handler, 5);
stub_irq_handler!(irq6_handler, 6);
stub_irq_handler!(irq7_handler, 7);
stub_irq_handler!(irq8_handler, 8);
stub_irq_handler!(irq9_handler, 9);
stub_irq_handler!(irq10_handler, 10);
stub_irq_handler!(irq11_handler, 11);
stub_irq_handler!(irq12_handler, 12);
stub_irq_handler!(irq13_handler, 13);
stub_irq_handler!(irq14_handler, 14);
stub_irq_handler!(irq15_handler, 15);

/// int 0x80, the syscall gate: the call number and arguments are already in
/// the saved registers, and whatever the dispatcher leaves in the saved EAX
/// slot is what the caller observes after iret
#[interrupt(x86)]
unsafe fn syscall_handler(regs: &mut InterruptRegisters) {
    crate::syscalls::dispatch(regs);
}

/// int 0x81, the kernel service gate (yield/block/fork/exec/exit)
#[interrupt(x86)]
unsafe fn service_handler(regs: &mut InterruptRegisters) {
    crate::task::lifecycle::service(regs);
}

/// how many entries do we want in our IDT
pub const IDT_ENTRIES: usize = 256;

/// the IDT itself (aligned to 16 bits for performance)
static mut IDT: Aligned<A16, [IDTEntry; IDT_ENTRIES]> = Aligned([IDTEntry::missing(); IDT_ENTRIES]);

/// set up and load the IDT, and remap the PIC so IRQs land on vectors 32-47
pub unsafe fn init() {
    crate::platform::pic::remap();

    let idt = &mut *addr_of_mut!(IDT);

    // every exception vector gets a stub, even the reserved ones
    for entry in idt.iter_mut().take(32) {
        *entry = IDTEntry::new(reserved_exception_handler as *const (), Ring::Ring0);
    }

    idt[Exceptions::DivideByZero as usize] = IDTEntry::new(divide_by_zero_handler as *const (), Ring::Ring0);
    idt[Exceptions::NonMaskableInterrupt as usize] = IDTEntry::new(nmi_handler as *const (), Ring::Ring0);
    idt[Exceptions::Breakpoint as usize] = IDTEntry::new(breakpoint_handler as *const (), Ring::Ring0);
    idt[Exceptions::Overflow as usize] = IDTEntry::new(overflow_handler as *const (), Ring::Ring0);
    idt[Exceptions::BoundRangeExceeded as usize] = IDTEntry::new(bound_range_handler as *const (), Ring::Ring0);
    idt[Exceptions::InvalidOpcode as usize] = IDTEntry::new(invalid_opcode_handler as *const (), Ring::Ring0);
    idt[Exceptions::DeviceNotAvailable as usize] = IDTEntry::new(device_not_available_handler as *const (), Ring::Ring0);
    idt[Exceptions::DoubleFault as usize] = IDTEntry::new(double_fault_handler as *const (), Ring::Ring0);
    idt[Exceptions::InvalidTSS as usize] = IDTEntry::new(invalid_tss_handler as *const (), Ring::Ring0);
    idt[Exceptions::SegmentNotPresent as usize] = IDTEntry::new(segment_not_present_handler as *const (), Ring::Ring0);
    idt[Exceptions::StackSegmentFault as usize] = IDTEntry::new(stack_segment_handler as *const (), Ring::Ring0);
    idt[Exceptions::GeneralProtectionFault as usize] = IDTEntry::new(general_protection_fault_handler as *const (), Ring::Ring0);
    idt[Exceptions::PageFault as usize] = IDTEntry::new(page_fault_handler as *const (), Ring::Ring0);
    idt[Exceptions::FloatingPoint as usize] = IDTEntry::new(x87_fpu_exception_handler as *const (), Ring::Ring0);
    idt[Exceptions::AlignmentCheck as usize] = IDTEntry::new(alignment_check_handler as *const (), Ring::Ring0);
    idt[Exceptions::MachineCheck as usize] = IDTEntry::new(machine_check_handler as *const (), Ring::Ring0);
    idt[Exceptions::SIMDFloatingPoint as usize] = IDTEntry::new(simd_fpu_exception_handler as *const (), Ring::Ring0);

    // remapped PIC IRQs
    idt[0x20] = IDTEntry::new(timer_irq_handler as *const (), Ring::Ring0);
    idt[0x21] = IDTEntry::new(keyboard_irq_handler as *const (), Ring::Ring0);
    idt[0x22] = IDTEntry::new(irq2_handler as *const (), Ring::Ring0);
    idt[0x23] = IDTEntry::new(irq3_handler as *const (), Ring::Ring0);
    idt[0x24] = IDTEntry::new(irq4_handler as *const (), Ring::Ring0);
    idt[0x25] = IDTEntry::new(irq5_handler as *const (), Ring::Ring0);
    idt[0x26] = IDTEntry::new(irq6_handler as *const (), Ring::Ring0);
    idt[0x27] = IDTEntry::new(irq7_handler as *const (), Ring::Ring0);
    idt[0x28] = IDTEntry::new(irq8_handler as *const (), Ring::Ring0);
    idt[0x29] = IDTEntry::new(irq9_handler as *const (), Ring::Ring0);
    idt[0x2a] = IDTEntry::new(irq10_handler as *const (), Ring::Ring0);
    idt[0x2b] = IDTEntry::new(irq11_handler as *const (), Ring::Ring0);
    idt[0x2c] = IDTEntry::new(irq12_handler as *const (), Ring::Ring0);
    idt[0x2d] = IDTEntry::new(irq13_handler as *const (), Ring::Ring0);
    idt[0x2e] = IDTEntry::new(irq14_handler as *const (), Ring::Ring0);
    idt[0x2f] = IDTEntry::new(irq15_handler as *const (), Ring::Ring0);

    // software gates: userspace may int 0x80, only the kernel may int 0x81
    idt[SYSCALL_INT] = IDTEntry::new(syscall_handler as *const (), Ring::Ring3);
    idt[SERVICE_INT] = IDTEntry::new(service_handler as *const (), Ring::Ring0);

    load();
}

pub fn load() {
    unsafe {
        // load interrupt handler table
        lidt(&DescriptorTablePointer::new(&*addr_of!(IDT)));
    }
}
