//! PS/2 keyboard

use log::trace;
use x86::io::inb;

const DATA_PORT: u16 = 0x60;

/// fetches the scancode that raised IRQ 1; the byte has to be read either way
/// or the controller won't send another interrupt. no decoding layer here,
/// the byte is just logged
pub fn handle_irq() {
    let scancode = unsafe { inb(DATA_PORT) };

    trace!("keyboard scancode {:#04x}", scancode);
}
