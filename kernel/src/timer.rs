//! timer tick accounting

use crate::arch::ints::InterruptRegisters;
use core::sync::atomic::{AtomicU64, Ordering};

/// ticks per second; the PIT gets programmed for this during bring-up
pub const TIMER_HZ: u64 = 100;

/// ticks since boot
static JIFFIES: AtomicU64 = AtomicU64::new(0);

/// the timer IRQ body: advance time, then let the scheduler do its
/// bookkeeping (which may resume a different context instead of returning)
pub fn tick(regs: &mut InterruptRegisters) {
    JIFFIES.fetch_add(1, Ordering::SeqCst);

    crate::task::sched::on_tick(regs);
}

pub fn jiffies() -> u64 {
    JIFFIES.load(Ordering::SeqCst)
}

/// milliseconds to ticks, rounding up so short sleeps don't round to nothing
pub fn ms_to_ticks(ms: u32) -> u64 {
    (ms as u64 * TIMER_HZ).div_ceil(1000)
}

/// burns until the given number of milliseconds has passed
///
/// interrupts get let back in around each hlt so ticks keep arriving even
/// when this is called from a handler (which is exactly where the sleep
/// syscall calls it from)
pub fn sleep_ms(ms: u32) {
    let target = jiffies() + ms_to_ticks(ms);

    while jiffies() < target {
        crate::arch::sti();
        crate::arch::hlt();
        crate::arch::cli();
    }
}
