//! saturnia, a small teaching kernel for 32-bit PCs
//!
//! multiboot in, preemptively scheduled kernel and user processes out:
//! paging with copy on write fork, a five-level feedback queue scheduler,
//! and an int 0x80 syscall gateway. one CPU, one address space at a time

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(clippy::missing_safety_doc)]

// we need this to effectively use our heap
extern crate alloc;

pub mod arch;
pub mod demo;
pub mod logging;
pub mod mm;
pub mod platform;
pub mod syscalls;
pub mod task;
pub mod timer;

/// tests
#[cfg(test)]
pub mod test;

use log::{error, info};

pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// kernel entrypoint, called by the boot code with paging already on and the
/// multiboot registers passed through
#[no_mangle]
pub unsafe extern "C" fn kmain(magic: u32, info_ptr: u32) -> ! {
    platform::serial::init();
    logging::init().expect("couldn't set up logging");

    info!("{} v{}", NAME, VERSION);

    platform::bootloader::check_magic(magic);
    let info = platform::bootloader::get_multiboot_info(info_ptr);

    if let Some(name) = info.get_bootloader_name() {
        info!("booted by {}", name);
    }

    arch::gdt::init(arch::boot::boot_stack_top_addr() as u32);
    arch::ints::init();
    platform::init_pit(timer::TIMER_HZ as u32);

    mm::init(info);

    platform::vga::init();
    platform::vga::puts("saturnia\n");

    task::init().expect("couldn't create the idle process");

    #[cfg(test)]
    {
        test_main();
        platform::exit_qemu(platform::QemuExitCode::Success);
    }

    #[cfg(not(test))]
    {
        task::lifecycle::create_kernel_process("init", init_main).expect("couldn't create init");
        task::sched::start();
    }
}

/// pid 1. starts the embedded demo program both ways a process can start
/// (created directly, and fork + exec), reaps both, then spends the rest of
/// its days collecting orphans
#[cfg(not(test))]
extern "C" fn init_main() -> ! {
    info!("init running");

    let direct = task::lifecycle::create_user_process("demo", &demo::DEMO).expect("couldn't load the demo program");

    match task::lifecycle::wait(direct) {
        Ok(code) => info!("demo (pid {}) exited with code {}", direct, code),
        Err(err) => error!("waiting for the demo failed: {}", err),
    }

    match task::lifecycle::kfork() {
        Ok(0) => {
            // the child turns itself into a second copy of the demo
            let err = task::lifecycle::kexec(&demo::DEMO);
            error!("exec failed: {}", err);
            task::lifecycle::kexit(-1);
        }
        Ok(child) => match task::lifecycle::wait(child) {
            Ok(code) => info!("forked demo (pid {}) exited with code {}", child, code),
            Err(err) => error!("waiting for the forked demo failed: {}", err),
        },
        Err(err) => error!("fork failed: {}", err),
    }

    let stats = syscalls::stats();
    info!("{} syscalls handled so far", stats.total);

    let frames = mm::frame::stats();
    info!("{} of {} frames free", frames.free, frames.total);

    loop {
        match task::lifecycle::wait(0) {
            Ok(code) => info!("reaped an orphan, exit code {}", code),
            Err(_) => task::lifecycle::kyield(),
        }
    }
}

#[panic_handler]
pub fn panic_implementation(info: &core::panic::PanicInfo) -> ! {
    let (file, line) = match info.location() {
        Some(loc) => (loc.file(), loc.line()),
        None => ("", 0),
    };

    error!("PANIC: \"{}\" @ {file}:{line}", info.message());

    #[cfg(test)]
    platform::exit_qemu(platform::QemuExitCode::Failed);

    #[cfg(not(test))]
    arch::halt();
}
