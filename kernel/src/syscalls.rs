//! the system call layer
//!
//! calls arrive through int 0x80 with the number in EAX and arguments in
//! EBX, ECX, EDX, ESI; whatever ends up in the saved EAX slot (a result, or
//! an errno as a negative value) is what the caller sees after iret

use crate::{
    arch::{ints::InterruptRegisters, LINKED_BASE, PAGE_SIZE},
    platform,
    task::{self, lifecycle, sched, Pid},
};
use common::{syscalls::NUM_SYSCALLS, Errno, Result, Syscall};
use core::sync::atomic::{AtomicU64, Ordering};

const COUNTER_INIT: AtomicU64 = AtomicU64::new(0);

/// per-call invocation counters, indexed by call number
static CALL_COUNTS: [AtomicU64; NUM_SYSCALLS] = [COUNTER_INIT; NUM_SYSCALLS];

/// every int 0x80, including ones with bogus numbers
static TOTAL_CALLS: AtomicU64 = AtomicU64::new(0);

/// a snapshot of the call counters, for diagnostics
#[derive(Debug, Copy, Clone)]
pub struct SyscallStats {
    pub total: u64,
    pub per_call: [u64; NUM_SYSCALLS],
}

pub fn stats() -> SyscallStats {
    let mut per_call = [0; NUM_SYSCALLS];
    for (i, counter) in CALL_COUNTS.iter().enumerate() {
        per_call[i] = counter.load(Ordering::SeqCst);
    }

    SyscallStats {
        total: TOTAL_CALLS.load(Ordering::SeqCst),
        per_call,
    }
}

/// writes a handler result into the saved EAX slot
fn finish(regs: &mut InterruptRegisters, result: Result<u32>) {
    regs.eax = match result {
        Ok(value) => value,
        Err(err) => err.as_return_value(),
    };
}

/// the caller's pid; every syscall resolves this first
fn current_pid() -> Result<Pid> {
    sched::current_pid().ok_or(Errno::NoSuchProcess)
}

/// the int 0x80 dispatcher: total over every possible EAX value, either a
/// handler runs or the caller gets invalid syscall back. nothing in here
/// panics on bad input
pub fn dispatch(regs: &mut InterruptRegisters) {
    TOTAL_CALLS.fetch_add(1, Ordering::SeqCst);

    match Syscall::try_from(regs.eax) {
        Ok(call) => {
            CALL_COUNTS[call as usize].fetch_add(1, Ordering::SeqCst);

            match call {
                Syscall::Exit => sys_exit(regs),
                Syscall::Write => {
                    let result = sys_write(regs);
                    finish(regs, result);
                }
                Syscall::GetPid => finish(regs, current_pid().map(|pid| pid as u32)),
                // stubs for now; the numbers are reserved and the handlers
                // report themselves as unimplemented
                Syscall::Read | Syscall::Open | Syscall::Close => finish(regs, Err(Errno::InvalidSyscall)),
                Syscall::Sleep => {
                    let result = sys_sleep(regs);
                    finish(regs, result);
                }
                Syscall::Yield => {
                    regs.eax = 0;
                    sched::switch_context(regs, sched::ContextSwitchMode::Normal);
                }
            }
        }
        Err(_) => finish(regs, Err(Errno::InvalidSyscall)),
    }
}

fn sys_exit(regs: &mut InterruptRegisters) {
    let code = regs.ebx as i32;
    lifecycle::do_exit(regs, code);
}

/// write(fd, buf, count): only fd 1 (the console) exists. the buffer has to
/// sit inside one page of the caller's address space, a deliberately simple
/// initial contract
fn sys_write(regs: &mut InterruptRegisters) -> Result<u32> {
    let pid = current_pid()?;

    let fd = regs.ebx as usize;
    let buf = regs.ecx as usize;
    let count = regs.edx as usize;

    if count == 0 {
        return Ok(0);
    }

    if count > PAGE_SIZE {
        return Err(Errno::InvalidParameter);
    }

    if fd != 1 {
        return Err(Errno::InvalidParameter);
    }

    task::with_process(pid, |process| -> Result<u32> {
        // the slot has to actually be open
        let descriptor = process.files[fd].as_ref().ok_or(Errno::InvalidParameter)?;
        descriptor.handle.as_ref().ok_or(Errno::InvalidParameter)?;

        // no kernel pointers, no page straddling, and the page has to
        // translate through the caller's address space
        if buf >= LINKED_BASE || buf % PAGE_SIZE + count > PAGE_SIZE {
            return Err(Errno::InvalidAddress);
        }

        process.page_directory.translate(buf).ok_or(Errno::InvalidAddress)?;

        let bytes = unsafe { core::slice::from_raw_parts(buf as *const u8, count) };

        console_write(bytes);

        Ok(count as u32)
    })
    .ok_or(Errno::NoSuchProcess)?
}

/// puts bytes on both the screen and the serial port: printable ASCII,
/// newlines, and tabs (as four spaces); everything else is dropped
fn console_write(bytes: &[u8]) {
    platform::vga::put_bytes(bytes);

    for b in bytes.iter() {
        unsafe {
            match b {
                b'\n' => platform::serial::putb(b'\n'),
                b'\t' => platform::serial::puts("    "),
                0x20..=0x7e => platform::serial::putb(*b),
                _ => (),
            }
        }
    }
}

/// sleep(ms): bounded busy wait against the tick counter; anything past a
/// minute is rejected rather than clamped
fn sys_sleep(regs: &mut InterruptRegisters) -> Result<u32> {
    current_pid()?;

    let ms = regs.ebx;

    if ms > 60_000 {
        return Err(Errno::InvalidParameter);
    }

    crate::timer::sleep_ms(ms);

    Ok(0)
}
