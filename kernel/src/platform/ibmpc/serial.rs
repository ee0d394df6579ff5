//! 16550 UART driver for the standard PC serial port (COM1)

use x86::io::{inb, outb};

const COM1: u16 = 0x3f8;

/// brings up the UART: FIFO on, loopback off, 38400 8N1
pub unsafe fn init() {
    outb(COM1 + 1, 0x00); // no interrupts, we poll
    outb(COM1 + 3, 0x80); // DLAB on to set the divisor
    outb(COM1, 0x03); // divisor 3 = 38400 baud, low byte
    outb(COM1 + 1, 0x00); // high byte
    outb(COM1 + 3, 0x03); // 8 bits, no parity, one stop bit (clears DLAB)
    outb(COM1 + 2, 0xc7); // enable and clear FIFOs, 14 byte threshold
    outb(COM1 + 4, 0x0b); // DTR + RTS + OUT2, loopback off
}

/// writes one byte, spinning until the transmit FIFO has room
///
/// unsafe because the port accesses aren't synchronized against anyone else
/// poking the UART
pub unsafe fn putb(b: u8) {
    while (inb(COM1 + 5) & 0x20) == 0 {}

    outb(COM1, b);

    // mirror to the bochs/qemu 0xe9 debug port, it costs nothing
    outb(0xe9, b);
}

/// writes a whole string, see [`putb`]
pub unsafe fn puts(s: &str) {
    for b in s.bytes() {
        putb(b);
    }
}
