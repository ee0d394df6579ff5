//! tests
//!
//! these run inside the booted kernel (after memory and the process table
//! are up, before the scheduler starts) and exercise the pieces that don't
//! need live preemption: allocators, paging, fork bookkeeping, scheduler
//! accounting, and syscall dispatch

use crate::{
    arch::{
        ints::InterruptRegisters,
        paging::{self, PageDirectory, PageTableFlags},
        PAGE_SIZE, USER_CODE_BASE,
    },
    mm::{
        self,
        frame::{FrameAllocator, FrameError},
        heap,
    },
    syscalls,
    task::{self, lifecycle, sched, switch, Pid, ProcessState},
};
use alloc::vec::Vec;
use core::arch::asm;
use log::info;

/// custom test runner to run all tests
pub fn test_runner(tests: &[&dyn Testable]) {
    info!("=== running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    info!("=== done");
}

/// custom testable trait
pub trait Testable {
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        info!("--- {}...", core::any::type_name::<T>());
        self();
        info!("--- ok");
    }
}

/// entry point for scratch kernel processes; never actually runs
extern "C" fn noop_process() -> ! {
    loop {
        crate::arch::hlt();
    }
}

/// tears down a process the tests created
fn destroy_process(pid: Pid) {
    sched::remove_from_queues(pid);
    task::with_process_table(|table| {
        if let Some(process) = table.get_mut(pid) {
            process.page_directory.free_user_pages();
        }
        table.remove(pid);
    });
}

/// test breakpoint interrupt
#[test_case]
fn int() {
    unsafe {
        asm!("int3");
    }
}

/// test heap alloc/free and block reuse
#[test_case]
fn heap_alloc_free() {
    assert!(heap::check_consistency());

    let a = heap::kmalloc(8, 8).unwrap();
    let b = heap::kmalloc(8, 8).unwrap();
    assert!(a != b);
    assert!(heap::check_consistency());

    heap::kfree(a);
    heap::kfree(b);
    assert!(heap::check_consistency());

    // first fit hands the first hole back out
    let c = heap::kmalloc(8, 8).unwrap();
    assert!(c == a);
    heap::kfree(c);

    assert!(heap::check_consistency());
}

/// test heap alloc alignment
#[test_case]
fn heap_alloc_align() {
    for size in 1..32 {
        for shift in 0..13 {
            let alignment = 1 << shift;
            let ptr = heap::kmalloc(size, alignment).unwrap();

            assert!(ptr as usize % alignment == 0);
            assert!(heap::check_consistency());

            heap::kfree(ptr);
            assert!(heap::check_consistency());
        }
    }
}

/// test that whole-page allocations come back page aligned
#[test_case]
fn heap_alloc_pages() {
    let ptr = heap::kmalloc_pages(2).unwrap();
    assert!(ptr as usize % PAGE_SIZE == 0);
    heap::kfree(ptr);
    assert!(heap::check_consistency());
}

/// test zeroed and reallocated blocks
#[test_case]
fn heap_zalloc_realloc() {
    let ptr = heap::kzalloc(64).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts_mut(ptr, 64) };
    assert!(bytes.iter().all(|b| *b == 0));

    bytes[0] = 0x5a;
    bytes[63] = 0xa5;

    // growing moves the block but keeps its contents
    let grown = heap::krealloc(ptr, 4096).unwrap();
    let grown_bytes = unsafe { core::slice::from_raw_parts(grown, 64) };
    assert!(grown_bytes[0] == 0x5a);
    assert!(grown_bytes[63] == 0xa5);

    // shrinking stays put
    let shrunk = heap::krealloc(grown, 32).unwrap();
    assert!(shrunk == grown);

    heap::kfree(shrunk);
    assert!(heap::check_consistency());
}

/// test that heavy churn leaves every header in the arena consistent
#[test_case]
fn heap_churn_consistency() {
    let mut live: Vec<*mut u8> = Vec::new();

    for round in 0..8 {
        for size in [8, 24, 100, 513, 2048] {
            live.push(heap::kmalloc(size, 8).unwrap());
        }

        // free in a different order each round
        if round % 2 == 0 {
            while let Some(ptr) = live.pop() {
                heap::kfree(ptr);
                assert!(heap::check_consistency());
            }
        } else {
            for ptr in live.drain(..) {
                heap::kfree(ptr);
                assert!(heap::check_consistency());
            }
        }
    }
}

/// frame allocator invariant: used + free == total after every operation
#[test_case]
fn frame_accounting() {
    let total = 64;
    let mut allocator = FrameAllocator::new(total);
    allocator.free_region(0, (total * PAGE_SIZE) as u64);

    let check = |a: &FrameAllocator| {
        let stats = a.stats();
        assert!(stats.used + stats.free == stats.total);
    };

    check(&allocator);
    assert!(allocator.stats().free == total);

    let mut frames = Vec::new();
    for _i in 0..total {
        frames.push(allocator.alloc_one().unwrap());
        check(&allocator);
    }

    // exhausted: failure is a normal result, not a panic
    assert!(allocator.alloc_one().is_none());

    for frame in frames.drain(..) {
        allocator.free_one(frame).unwrap();
        check(&allocator);
    }

    assert!(allocator.stats().free == total);
}

/// frame allocator edge cases: double free, out of range, zero-size runs
#[test_case]
fn frame_edge_cases() {
    let mut allocator = FrameAllocator::new(16);
    allocator.free_region(0, (16 * PAGE_SIZE) as u64);

    let frame = allocator.alloc_one().unwrap();
    allocator.free_one(frame).unwrap();
    assert!(allocator.free_one(frame) == Err(FrameError::DoubleFree));

    assert!(allocator.free_one((64 * PAGE_SIZE) as u32) == Err(FrameError::OutOfRange));
    assert!(allocator.free_one(0x123) == Err(FrameError::OutOfRange));

    assert!(allocator.alloc_contiguous(0).is_none());
}

/// contiguous runs are contiguous and freeable
#[test_case]
fn frame_contiguous() {
    let mut allocator = FrameAllocator::new(32);
    allocator.free_region(0, (32 * PAGE_SIZE) as u64);

    // fragment the low frames a little
    let a = allocator.alloc_one().unwrap();
    let b = allocator.alloc_one().unwrap();
    allocator.free_one(a).unwrap();

    let run = allocator.alloc_contiguous(8).unwrap();
    assert!(run as usize % PAGE_SIZE == 0);

    // the run can't overlap the single allocated frame
    let run_frames = (run as usize / PAGE_SIZE)..(run as usize / PAGE_SIZE + 8);
    assert!(!run_frames.contains(&(b as usize / PAGE_SIZE)));

    allocator.free_contiguous(run, 8).unwrap();
    allocator.free_one(b).unwrap();

    assert!(allocator.stats().free == 32);

    // a run longer than memory fails cleanly
    assert!(allocator.alloc_contiguous(33).is_none());
}

/// paging invariant: map then translate round-trips, unmap really unmaps
#[test_case]
fn paging_map_translate_unmap() {
    let mut dir = PageDirectory::new_process().unwrap();

    let va = USER_CODE_BASE;
    let frame = mm::alloc_frame().unwrap();

    assert!(!dir.is_mapped(va));
    assert!(dir.translate(va).is_none());

    dir.map(va, frame, PageTableFlags::UserSupervisor | PageTableFlags::ReadWrite).unwrap();

    assert!(dir.is_mapped(va));
    assert!(dir.translate(va) == Some(frame));
    assert!(dir.translate(va + 0x123) == Some(frame + 0x123));

    dir.unmap(va);

    assert!(!dir.is_mapped(va));
    assert!(dir.translate(va).is_none());

    mm::free_frame(frame);
}

/// fork cloning: both sides see the same frame, neither keeps write access
#[test_case]
fn clone_shares_frames_read_only() {
    let mut parent = PageDirectory::new_process().unwrap();

    let va = USER_CODE_BASE;
    let frame = mm::alloc_frame().unwrap();
    parent.map(va, frame, PageTableFlags::UserSupervisor | PageTableFlags::ReadWrite).unwrap();
    mm::track_frame(frame);

    let mut child = parent.clone_for_fork().unwrap();

    let parent_entry = parent.get_page(va).unwrap();
    let child_entry = child.get_page(va).unwrap();

    assert!(parent_entry.get_address() == frame);
    assert!(child_entry.get_address() == frame);
    assert!(parent_entry.is_copy_on_write());
    assert!(child_entry.is_copy_on_write());
    assert!((parent_entry.get_flags() & PageTableFlags::ReadWrite).bits == 0);
    assert!((child_entry.get_flags() & PageTableFlags::ReadWrite).bits == 0);

    // each side holds one reference; teardown drops them one at a time and
    // the frame only goes back to the allocator with the last one
    assert!(mm::frame_reference_count(frame) == 2);
    parent.free_user_pages();
    assert!(mm::frame_reference_count(frame) == 1);
    child.free_user_pages();
    assert!(mm::frame_reference_count(frame) == 0);
}

/// copy on write: after the child's write fault the two sides diverge
#[test_case]
fn cow_fault_diverges() {
    let mut parent = PageDirectory::new_process().unwrap();

    let va = USER_CODE_BASE;
    let frame = mm::alloc_frame().unwrap();
    paging::with_scratch_frame(frame, |page| page.fill(0xaa));
    parent.map(va, frame, PageTableFlags::UserSupervisor | PageTableFlags::ReadWrite).unwrap();
    mm::track_frame(frame);

    let mut child = parent.clone_for_fork().unwrap();

    // the child writes first and gets its own copy
    assert!(mm::resolve_cow(&mut child, va));

    let parent_phys = parent.translate(va).unwrap();
    let child_phys = child.translate(va).unwrap();
    assert!(parent_phys != child_phys);

    let child_entry = child.get_page(va).unwrap();
    assert!((child_entry.get_flags() & PageTableFlags::ReadWrite).bits != 0);
    assert!(!child_entry.is_copy_on_write());

    // the copy carried the parent's bytes over
    paging::with_scratch_frame(child_phys & !(PAGE_SIZE as u32 - 1), |page| {
        assert!(page.iter().all(|b| *b == 0xaa));
        page.fill(0xbb);
    });

    // the parent's page is untouched by the child's write
    paging::with_scratch_frame(parent_phys & !(PAGE_SIZE as u32 - 1), |page| {
        assert!(page.iter().all(|b| *b == 0xaa));
    });

    // the parent faults next; it's the sole owner now, so it just gets its
    // write bit back and keeps the original frame
    assert!(mm::resolve_cow(&mut parent, va));
    assert!(parent.translate(va) == Some(parent_phys));
    assert!((parent.get_page(va).unwrap().get_flags() & PageTableFlags::ReadWrite).bits != 0);

    parent.free_user_pages();
    child.free_user_pages();

    assert!(mm::frame_reference_count(parent_phys & !(PAGE_SIZE as u32 - 1)) == 0);
    assert!(mm::frame_reference_count(child_phys & !(PAGE_SIZE as u32 - 1)) == 0);
}

/// fork return-value law: parent's saved EAX is the child's pid, child's is 0
#[test_case]
fn fork_return_values() {
    let parent = lifecycle::create_kernel_process("forktest", noop_process).unwrap();

    // pretend the scheduler dispatched it
    sched::remove_from_queues(parent);
    task::with_process(parent, |p| p.state = ProcessState::Running);
    sched::set_current(Some(parent));

    let mut regs = InterruptRegisters::new_kernel(0x1000, 0);
    let child = lifecycle::do_fork(&mut regs).unwrap();

    assert!(regs.eax == child as u32);
    assert!(task::with_process(child, |p| p.registers.eax) == Some(0));

    // the child sits at the parent's level with duplicated descriptors
    assert!(sched::queue_level_of(child) == Some(0));
    assert!(task::with_process(child, |p| p.state) == Some(ProcessState::Ready));
    assert!(task::with_process(parent, |p| p.children.contains(&child)) == Some(true));
    assert!(task::with_process(child, |p| p.parent) == Some(Some(parent)));

    // fd 0 is shared between both tables now
    assert!(task::with_process(child, |p| p.files[0].as_ref().map(|fd| fd.ref_count())) == Some(Some(2)));

    sched::set_current(None);
    destroy_process(child);
    destroy_process(parent);
}

/// scheduler demotion: a process that burns its whole slice drops one level
/// per exhaustion and never falls past the bottom
#[test_case]
fn mlfq_demotion() {
    let pid = lifecycle::create_kernel_process("cpuhog", noop_process).unwrap();

    sched::remove_from_queues(pid);
    task::with_process(pid, |p| p.state = ProcessState::Running);
    sched::set_current(Some(pid));
    switch::set_in_task(true);

    for expected in 1..sched::LEVELS {
        // run the current quantum down
        let slice = task::with_process(pid, |p| p.time_slice).unwrap();
        for i in 0..slice {
            let wants_switch = sched::tick_accounting();
            assert!(wants_switch == (i == slice - 1));
        }

        assert!(task::with_process(pid, |p| p.priority) == Some(expected));

        // what the switch path would do: requeue at the new level, then
        // dispatch again
        sched::enqueue_process(pid, expected);
        sched::remove_from_queues(pid);
        task::with_process(pid, |p| p.state = ProcessState::Running);
    }

    // the bottom level is the floor
    let slice = task::with_process(pid, |p| p.time_slice).unwrap();
    for _i in 0..slice {
        sched::tick_accounting();
    }
    assert!(task::with_process(pid, |p| p.priority) == Some(sched::LEVELS - 1));

    switch::set_in_task(false);
    sched::set_current(None);
    destroy_process(pid);
}

/// aging: a ready process stuck at the bottom rises one level per threshold
#[test_case]
fn mlfq_aging() {
    let pid = lifecycle::create_kernel_process("starved", noop_process).unwrap();

    sched::remove_from_queues(pid);
    sched::enqueue_process(pid, sched::LEVELS - 1);
    sched::set_current(None);

    for _i in 0..sched::AGING_THRESHOLD {
        sched::tick_accounting();
    }

    assert!(sched::queue_level_of(pid) == Some(sched::LEVELS - 2));
    assert!(task::with_process(pid, |p| p.priority) == Some(sched::LEVELS - 2));
    assert!(task::with_process(pid, |p| p.wait_time) == Some(0));

    // the interactive boost jumps the rest of the way
    sched::boost_interactive(pid);
    assert!(sched::queue_level_of(pid) == Some(0));
    assert!(task::with_process(pid, |p| p.priority) == Some(0));

    destroy_process(pid);
}

/// scheduler census invariant: at most one running process, and every live
/// PCB is accounted for by exactly one state bucket
#[test_case]
fn scheduler_census() {
    let a = lifecycle::create_kernel_process("census-a", noop_process).unwrap();
    let b = lifecycle::create_kernel_process("census-b", noop_process).unwrap();

    let census = sched::census();

    assert!(census.running <= 1);
    assert!(census.total == census.running + census.ready + census.blocked + census.done);

    let queued: usize = census.queue_sizes.iter().sum();
    // everything queued is ready; idle is ready without being queued
    assert!(queued <= census.ready);

    destroy_process(a);
    destroy_process(b);
}

/// syscall dispatch is total: every number either runs a handler or comes
/// back as invalid syscall, and nothing panics
#[test_case]
fn syscall_dispatch_totality() {
    sched::set_current(None);

    let before = syscalls::stats();

    // a garbage call number
    let mut regs = InterruptRegisters::default();
    regs.eax = 999;
    syscalls::dispatch(&mut regs);
    assert!(regs.eax as i32 == -1);

    // a known number with no caller behind it
    let mut regs = InterruptRegisters::default();
    regs.eax = 2; // getpid
    syscalls::dispatch(&mut regs);
    assert!(regs.eax as i32 == -4);

    // the stubbed file calls report themselves unimplemented
    for number in [3, 4, 5] {
        let mut regs = InterruptRegisters::default();
        regs.eax = number;
        syscalls::dispatch(&mut regs);
        assert!(regs.eax as i32 == -1);
    }

    let after = syscalls::stats();
    assert!(after.total == before.total + 5);
}

/// write argument validation, per the single-page initial contract
#[test_case]
fn syscall_write_validation() {
    let pid = lifecycle::create_kernel_process("writer", noop_process).unwrap();
    sched::remove_from_queues(pid);
    task::with_process(pid, |p| p.state = ProcessState::Running);
    sched::set_current(Some(pid));

    let write_call = |fd: u32, buf: u32, count: u32| -> i32 {
        let mut regs = InterruptRegisters {
            eax: 1,
            ebx: fd,
            ecx: buf,
            edx: count,
            ..Default::default()
        };
        syscalls::dispatch(&mut regs);
        regs.eax as i32
    };

    // count 0 short-circuits to 0
    assert!(write_call(1, USER_CODE_BASE as u32, 0) == 0);

    // oversize counts and unsupported fds are parameter errors
    assert!(write_call(1, USER_CODE_BASE as u32, PAGE_SIZE as u32 + 1) == -2);
    assert!(write_call(0, USER_CODE_BASE as u32, 4) == -2);
    assert!(write_call(7, USER_CODE_BASE as u32, 4) == -2);

    // kernel pointers, page-straddling buffers, and unmapped pages are
    // address errors
    assert!(write_call(1, 0xc010_0000, 4) == -6);
    assert!(write_call(1, (USER_CODE_BASE + PAGE_SIZE - 2) as u32, 4) == -6);
    assert!(write_call(1, USER_CODE_BASE as u32, 4) == -6);

    // getpid resolves the freshly minted caller
    let mut regs = InterruptRegisters {
        eax: 2,
        ..Default::default()
    };
    syscalls::dispatch(&mut regs);
    assert!(regs.eax == pid as u32);

    // sleep rejects anything past a minute
    let mut regs = InterruptRegisters {
        eax: 6,
        ebx: 60_001,
        ..Default::default()
    };
    syscalls::dispatch(&mut regs);
    assert!(regs.eax as i32 == -2);

    sched::set_current(None);
    destroy_process(pid);
}

/// wait on a pid that isn't a child reports no-such-process without blocking
#[test_case]
fn wait_rejects_non_children() {
    let pid = lifecycle::create_kernel_process("waiter", noop_process).unwrap();
    sched::remove_from_queues(pid);
    task::with_process(pid, |p| p.state = ProcessState::Running);
    sched::set_current(Some(pid));

    assert!(lifecycle::wait(4242).is_err());

    sched::set_current(None);
    destroy_process(pid);
}
