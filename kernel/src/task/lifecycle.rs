//! process lifecycle: create, fork, exec, exit, wait
//!
//! kernel processes reach the operations that give up or transform the CPU
//! (yield, block, fork, exec, exit) through the int 0x81 service gate, so
//! that every one of them flows through the same saved-frame context switch
//! the timer uses. user processes get the subset the int 0x80 ABI exposes

use super::{
    new_fd_table, sched, with_process, with_process_table, FileDescriptor, KernelStack, Pid, Privilege, Process, ProcessState, UserLayout,
    INIT_PID, MAX_CHILDREN,
};
use crate::{
    arch::{
        ints::InterruptRegisters,
        paging::{self, PageTableFlags},
        PAGE_SIZE, USER_CODE_BASE, USER_HEAP_BASE, USER_STACK_BASE, USER_STACK_PAGES, USER_STACK_TOP,
    },
    mm::{self, PageDirectory},
};
use alloc::{string::String, vec::Vec};
use common::{Errno, Result};
use core::arch::asm;
use log::{debug, warn};

/// service gate operation codes, passed in EAX
const SERVICE_YIELD: u32 = 0;
const SERVICE_BLOCK: u32 = 1;
const SERVICE_FORK: u32 = 2;
const SERVICE_EXIT: u32 = 3;
const SERVICE_EXEC: u32 = 4;

/// an in-memory program, the only thing exec knows how to load
///
/// a loader for a real executable format would parse its input down to one
/// of these; the kernel itself only deals in flat byte blobs
pub struct ProgramImage<'a> {
    pub name: &'a str,

    /// mapped read + execute at the bottom of the user region
    pub code: &'a [u8],

    /// mapped read + write straight after the code
    pub data: &'a [u8],

    /// entry point, as an offset into the code region
    pub entry: usize,
}

/// the int 0x81 handler body
pub fn service(regs: &mut InterruptRegisters) {
    match regs.eax {
        SERVICE_YIELD => sched::switch_context(regs, sched::ContextSwitchMode::Normal),
        SERVICE_BLOCK => sched::switch_context(regs, sched::ContextSwitchMode::Block),
        SERVICE_FORK => {
            regs.eax = match do_fork(regs) {
                Ok(pid) => pid as u32,
                Err(err) => err.as_return_value(),
            };
        }
        SERVICE_EXIT => {
            let code = regs.ebx as i32;
            do_exit(regs, code);
        }
        SERVICE_EXEC => {
            let image = unsafe { &*(regs.ebx as *const ProgramImage<'static>) };

            if let Err(err) = do_exec(regs, image) {
                regs.eax = err.as_return_value();
            }
        }
        other => warn!("unknown service gate operation {}", other),
    }
}

/// builds a PCB around the given pieces, registers it, and makes it ready at
/// the top priority level
fn finalize(name: &str, privilege: Privilege, registers: InterruptRegisters, page_directory: PageDirectory, kernel_stack: KernelStack, layout: Option<UserLayout>) -> Result<Pid> {
    let mut files = new_fd_table();
    for fd in files.iter_mut().take(3) {
        *fd = Some(FileDescriptor::console());
    }

    let pid = with_process_table(|table| {
        let pid = table.allocate_pid();

        let mut process = Process {
            pid,
            name: String::new(),
            state: ProcessState::Created,
            privilege,
            registers,
            page_directory,
            kernel_stack,
            priority: 0,
            time_slice: 0,
            wait_time: 0,
            total_cpu_time: 0,
            last_scheduled: 0,
            parent: None,
            exit_code: 0,
            files,
            children: Vec::new(),
            waiting_for_child: None,
            user_layout: layout,
        };
        process.set_name(name);

        table.insert(process);
        pid
    });

    debug!("created {:?} process {} ({})", privilege, pid, name);

    sched::enqueue_process(pid, 0);

    Ok(pid)
}

/// creates a kernel process: its own stack and (kernel-only) address space,
/// ring 0 registers pointed at the entry function
pub fn create_kernel_process(name: &str, entry: extern "C" fn() -> !) -> Result<Pid> {
    let kernel_stack = KernelStack::allocate()?;
    let page_directory = PageDirectory::new_process()?;
    let registers = InterruptRegisters::new_kernel(entry as usize, kernel_stack.top());

    finalize(name, Privilege::Kernel, registers, page_directory, kernel_stack, None)
}

/// creates a user process from a program image: code, data, and stack pages
/// in a fresh address space, ring 3 registers pointed at the image's entry
pub fn create_user_process(name: &str, image: &ProgramImage) -> Result<Pid> {
    let kernel_stack = KernelStack::allocate()?;
    let mut page_directory = PageDirectory::new_process()?;

    let layout = match load_image(&mut page_directory, image) {
        Ok(layout) => layout,
        Err(err) => {
            page_directory.free_user_pages();
            return Err(err);
        }
    };

    let registers = InterruptRegisters::new_user(USER_CODE_BASE + image.entry, USER_STACK_TOP);

    finalize(name, Privilege::User, registers, page_directory, kernel_stack, Some(layout))
}

/// maps a run of fresh frames at `base`, zeroing each and copying in as much
/// of `content` as lands in it
fn map_user_region(dir: &mut PageDirectory, base: usize, pages: usize, writable: bool, content: Option<&[u8]>) -> Result<()> {
    for i in 0..pages {
        let frame = mm::alloc_frame().ok_or(Errno::OutOfMemory)?;

        // this address space isn't the live one, so the frame gets filled
        // through the scratch window
        paging::with_scratch_frame(frame, |dst| {
            dst.fill(0);

            if let Some(bytes) = content {
                let start = i * PAGE_SIZE;
                if start < bytes.len() {
                    let chunk = &bytes[start..bytes.len().min(start + PAGE_SIZE)];
                    dst[..chunk.len()].copy_from_slice(chunk);
                }
            }
        });

        let mut flags = PageTableFlags::UserSupervisor;
        if writable {
            flags |= PageTableFlags::ReadWrite;
        }

        if let Err(err) = dir.map(base + i * PAGE_SIZE, frame, flags) {
            mm::free_frame(frame);
            return Err(err);
        }

        mm::track_frame(frame);
    }

    Ok(())
}

/// lays a program image out in an address space: code (r-x), data (rw-)
/// right after, a heap mark past the data, and a stack at the top of the
/// user region
fn load_image(dir: &mut PageDirectory, image: &ProgramImage) -> Result<UserLayout> {
    let code_pages = image.code.len().div_ceil(PAGE_SIZE).max(1);
    map_user_region(dir, USER_CODE_BASE, code_pages, false, Some(image.code))?;

    let data_base = USER_CODE_BASE + code_pages * PAGE_SIZE;
    let data_pages = image.data.len().div_ceil(PAGE_SIZE);
    if data_pages > 0 {
        map_user_region(dir, data_base, data_pages, true, Some(image.data))?;
    }

    let stack_base = USER_STACK_TOP - USER_STACK_PAGES * PAGE_SIZE;
    debug_assert!(stack_base >= USER_STACK_BASE);
    map_user_region(dir, stack_base, USER_STACK_PAGES, true, None)?;

    // the heap grows up from wherever the data ends, and a sane image leaves
    // it the whole gap up to the heap region proper
    let heap_base = data_base + data_pages * PAGE_SIZE;
    debug_assert!(heap_base <= USER_HEAP_BASE);

    Ok(UserLayout {
        code_base: USER_CODE_BASE,
        code_pages,
        data_base,
        data_pages,
        heap_base,
        stack_pages: USER_STACK_PAGES,
    })
}

/// copies the live part of the parent's kernel stack onto the child's and
/// rewrites the frame pointer chain so the child unwinds on its own stack
/// (frame pointers are forced on for this target, so the chain is walkable)
fn clone_kernel_stack(parent: &Process, child_stack: &KernelStack, regs: &InterruptRegisters, child_regs: &mut InterruptRegisters) {
    let resume_esp = regs.kernel_resume_esp() as usize;

    if !parent.kernel_stack.contains(resume_esp) {
        // the frame isn't on the parent's stack (it happens when fork gets
        // driven synthetically); give the child a clean stack instead
        child_regs.esp = child_stack.top() as u32;
        child_regs.ebp = child_stack.top() as u32;
        return;
    }

    let used = parent.kernel_stack.top() - resume_esp;
    let child_base = child_stack.top() - used;
    let delta = child_base as isize - resume_esp as isize;

    unsafe {
        core::ptr::copy_nonoverlapping(resume_esp as *const u8, child_base as *mut u8, used);
    }

    child_regs.esp = (resume_esp as isize + delta) as u32;

    // walk the copied frame pointer chain and shift every saved ebp that
    // pointed into the parent's stack
    if parent.kernel_stack.contains(regs.ebp as usize) {
        child_regs.ebp = (regs.ebp as isize + delta) as u32;

        let mut link = child_regs.ebp as usize;
        while child_stack.contains(link) {
            let saved = unsafe { *(link as *const usize) };

            if !parent.kernel_stack.contains(saved) {
                break;
            }

            let shifted = (saved as isize + delta) as usize;
            unsafe {
                *(link as *mut usize) = shifted;
            }
            link = shifted;
        }
    }
}

/// forks the current process
///
/// the child gets a copy of the parent's saved frame (EAX forced to 0, the
/// parent's EAX becomes the child's pid), a copy-on-write clone of the
/// address space, duplicates of every open descriptor, and a seat at the
/// parent's current priority level
pub fn do_fork(regs: &mut InterruptRegisters) -> Result<Pid> {
    let parent_pid = sched::current_pid().ok_or(Errno::NoSuchProcess)?;

    let child_stack = KernelStack::allocate()?;

    let built = with_process_table(|table| -> Result<(Process, usize)> {
        let parent = table.get_mut(parent_pid).ok_or(Errno::NoSuchProcess)?;

        if parent.children.len() >= MAX_CHILDREN {
            return Err(Errno::OutOfMemory);
        }

        let page_directory = parent.page_directory.clone_for_fork()?;

        let mut child_regs = *regs;
        child_regs.eax = 0;

        if !regs.is_user() {
            clone_kernel_stack(parent, &child_stack, regs, &mut child_regs);
        }

        let mut files = new_fd_table();
        for (i, fd) in parent.files.iter().enumerate() {
            if let Some(fd) = fd {
                files[i] = Some(fd.duplicate());
            }
        }

        let mut child = Process {
            pid: 0, // assigned below
            name: String::new(),
            state: ProcessState::Created,
            privilege: parent.privilege,
            registers: child_regs,
            page_directory,
            kernel_stack: child_stack,
            priority: parent.priority,
            time_slice: 0,
            wait_time: 0,
            total_cpu_time: 0,
            last_scheduled: 0,
            parent: Some(parent_pid),
            exit_code: 0,
            files,
            children: Vec::new(),
            waiting_for_child: None,
            user_layout: parent.user_layout,
        };
        let name = parent.name.clone();
        child.set_name(&name);

        Ok((child, parent.priority))
    });

    let (mut child, level) = built?;

    let child_pid = with_process_table(|table| {
        let pid = table.allocate_pid();
        child.pid = pid;

        if let Some(parent) = table.get_mut(parent_pid) {
            parent.children.push(pid);
        }

        table.insert(child);
        pid
    });

    debug!("forked {} -> {}", parent_pid, child_pid);

    // the fork return-value contract
    regs.eax = child_pid as u32;

    sched::enqueue_process(child_pid, level);

    Ok(child_pid)
}

/// replaces the current process's image: the user half of the address space
/// is torn down and rebuilt from the given program, the registers become a
/// fresh ring 3 entry, and the name changes. file descriptors survive
pub fn do_exec(regs: &mut InterruptRegisters, image: &ProgramImage) -> Result<()> {
    let pid = sched::current_pid().ok_or(Errno::NoSuchProcess)?;

    with_process(pid, |process| -> Result<()> {
        process.page_directory.free_user_pages();

        let layout = load_image(&mut process.page_directory, image)?;

        process.set_name(image.name);
        process.privilege = Privilege::User;
        process.user_layout = Some(layout);

        *regs = InterruptRegisters::new_user(USER_CODE_BASE + image.entry, USER_STACK_TOP);
        process.registers = *regs;

        // this frame irets straight into ring 3 without a context switch, so
        // the TSS has to know about our kernel stack now
        unsafe {
            crate::arch::gdt::set_kernel_stack(process.kernel_stack.top() as u32);
        }

        Ok(())
    })
    .ok_or(Errno::NoSuchProcess)??;

    debug!("process {} is now {}", pid, image.name);

    Ok(())
}

/// ends the current process: records the exit code, wakes a waiting parent,
/// hands orphans to init (reaping any that already died), closes every
/// descriptor, frees the user half of the address space, and schedules away
/// for the last time. the PCB sticks around as a zombie until the parent
/// collects the code; the kernel stack is freed at that point, not here,
/// since this path runs on it
pub fn do_exit(regs: &mut InterruptRegisters, code: i32) {
    let Some(pid) = sched::current_pid() else {
        panic!("exit with no current process");
    };

    let wake = with_process_table(|table| {
        let process = table.get_mut(pid).expect("current process vanished");

        process.state = ProcessState::Terminated;
        process.exit_code = code;
        process.waiting_for_child = None;

        let parent_pid = process.parent;
        let children = core::mem::take(&mut process.children);

        // closing a descriptor is dropping it; the last drop releases the
        // underlying handle
        for fd in process.files.iter_mut() {
            *fd = None;
        }

        process.page_directory.free_user_pages();
        process.state = ProcessState::Zombie;

        // orphans go to init; ones that already finished get reaped here
        for child_pid in children {
            let Some(child) = table.get_mut(child_pid) else {
                continue;
            };

            match child.state {
                ProcessState::Terminated | ProcessState::Zombie => {
                    table.remove(child_pid);
                }
                _ => {
                    child.parent = Some(INIT_PID);
                    if let Some(init) = table.get_mut(INIT_PID) {
                        init.children.push(child_pid);
                    }
                }
            }
        }

        // wake the parent if it's waiting for us (or for anyone)
        let mut wake = None;
        if let Some(parent_pid) = parent_pid {
            if let Some(parent) = table.get_mut(parent_pid) {
                let waiting_for_us = matches!(parent.waiting_for_child, Some(0)) || parent.waiting_for_child == Some(pid);

                if parent.state == ProcessState::Blocked && waiting_for_us {
                    wake = Some((parent_pid, parent.priority));
                }
            }
        }

        wake
    });

    if let Some((parent_pid, level)) = wake {
        sched::enqueue_process(parent_pid, level);
    }

    debug!("process {} exited with code {}", pid, code);

    sched::switch_context(regs, sched::ContextSwitchMode::Remove);
    unreachable!("a removed process got scheduled again");
}

enum WaitDecision {
    Reaped(i32),
    NoChild,
    Wait,
}

/// waits for a child to exit and collects its exit code
///
/// target 0 means any child. if a matching child has already exited it's
/// reaped immediately; otherwise the caller blocks until one does and
/// re-checks. reaping removes the zombie's PCB, which is where its kernel
/// stack and page directory finally get freed
pub fn wait(target: Pid) -> Result<i32> {
    let pid = sched::current_pid().ok_or(Errno::NoSuchProcess)?;

    loop {
        let flags = crate::arch::get_flags();
        crate::arch::cli();

        let decision = with_process_table(|table| {
            let Some(process) = table.get(pid) else {
                return WaitDecision::NoChild;
            };

            if target != 0 && !process.children.contains(&target) {
                return WaitDecision::NoChild;
            }

            let children: Vec<Pid> = process.children.clone();

            let reapable = children.iter().copied().find(|child_pid| {
                if target != 0 && *child_pid != target {
                    return false;
                }

                matches!(
                    table.get(*child_pid).map(|c| c.state),
                    Some(ProcessState::Terminated) | Some(ProcessState::Zombie)
                )
            });

            match reapable {
                Some(child_pid) => {
                    let code = table.get(child_pid).map(|c| c.exit_code).unwrap_or(0);
                    table.remove(child_pid);

                    let process = table.get_mut(pid).unwrap();
                    process.children.retain(|c| *c != child_pid);
                    process.waiting_for_child = None;

                    WaitDecision::Reaped(code)
                }
                None => {
                    let process = table.get_mut(pid).unwrap();
                    process.state = ProcessState::Blocked;
                    process.waiting_for_child = Some(target);

                    WaitDecision::Wait
                }
            }
        });

        match decision {
            WaitDecision::Reaped(code) => {
                crate::arch::set_flags(flags);
                return Ok(code);
            }
            WaitDecision::NoChild => {
                crate::arch::set_flags(flags);
                return Err(Errno::NoSuchProcess);
            }
            WaitDecision::Wait => {
                // block until a child's exit wakes us, then look again
                service_call(SERVICE_BLOCK, 0);
                crate::arch::set_flags(flags);
            }
        }
    }
}

/// issues a service gate interrupt; works with interrupts masked (software
/// interrupts don't care about IF)
fn service_call(op: u32, arg: u32) -> u32 {
    let ret;

    unsafe {
        asm!(
            "int 0x81",
            inout("eax") op => ret,
            in("ebx") arg,
        );
    }

    ret
}

/// gives up the CPU voluntarily; no demotion, the process keeps its level
pub fn kyield() {
    service_call(SERVICE_YIELD, 0);
}

/// forks the calling kernel process; parent gets the child's pid, child gets 0
pub fn kfork() -> Result<Pid> {
    let ret = service_call(SERVICE_FORK, 0) as i32;

    if ret < 0 {
        Err(Errno::try_from((-ret) as u32).unwrap_or(Errno::InvalidParameter))
    } else {
        Ok(ret as Pid)
    }
}

/// ends the calling process
pub fn kexit(code: i32) -> ! {
    service_call(SERVICE_EXIT, code as u32);
    unreachable!("exit came back");
}

/// replaces the calling process with a user program; only comes back on
/// failure
pub fn kexec(image: &'static ProgramImage<'static>) -> Errno {
    let ret = service_call(SERVICE_EXEC, image as *const ProgramImage as u32) as i32;

    Errno::try_from((-ret) as u32).unwrap_or(Errno::InvalidParameter)
}
