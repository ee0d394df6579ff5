//! x86 vga text mode console
//!
//! writes go straight into the 80x25 cell grid at 0xb8000 (reachable through
//! the identity mapped low 4 MiB); the hardware cursor is kept in sync
//! through the CRTC index registers

use crate::arch::without_interrupts;
use core::ptr::{read_volatile, write_volatile};
use spin::Mutex;
use x86::io::outb;

const BUFFER: usize = 0xb8000;
const WIDTH: usize = 80;
const HEIGHT: usize = 25;

/// light grey on black
const ATTRIBUTE: u8 = 0x07;

pub struct VgaConsole {
    column: usize,
    row: usize,
}

impl VgaConsole {
    const fn new() -> Self {
        Self { column: 0, row: 0 }
    }

    fn cell_ptr(&self, column: usize, row: usize) -> *mut u16 {
        (BUFFER + (row * WIDTH + column) * 2) as *mut u16
    }

    fn put_cell(&mut self, column: usize, row: usize, c: u8) {
        unsafe {
            write_volatile(self.cell_ptr(column, row), ((ATTRIBUTE as u16) << 8) | c as u16);
        }
    }

    /// blanks the whole grid and homes the cursor
    pub fn clear(&mut self) {
        for row in 0..HEIGHT {
            for column in 0..WIDTH {
                self.put_cell(column, row, b' ');
            }
        }

        self.column = 0;
        self.row = 0;
        self.update_cursor();
    }

    fn newline(&mut self) {
        self.column = 0;
        self.row += 1;

        if self.row >= HEIGHT {
            self.scroll();
            self.row = HEIGHT - 1;
        }
    }

    /// moves every row up one and blanks the bottom row
    fn scroll(&mut self) {
        for row in 1..HEIGHT {
            for column in 0..WIDTH {
                let c = unsafe { read_volatile(self.cell_ptr(column, row)) };
                unsafe {
                    write_volatile(self.cell_ptr(column, row - 1), c);
                }
            }
        }

        for column in 0..WIDTH {
            self.put_cell(column, HEIGHT - 1, b' ');
        }
    }

    pub fn put_byte(&mut self, b: u8) {
        match b {
            b'\n' => self.newline(),
            // tabs render as four spaces
            b'\t' => {
                for _i in 0..4 {
                    self.put_byte(b' ');
                }
            }
            0x20..=0x7e => {
                self.put_cell(self.column, self.row, b);
                self.column += 1;

                if self.column >= WIDTH {
                    self.newline();
                }
            }
            _ => (),
        }
    }

    pub fn puts(&mut self, s: &str) {
        for b in s.bytes() {
            self.put_byte(b);
        }

        self.update_cursor();
    }

    /// programs the CRTC cursor position registers
    fn update_cursor(&self) {
        let position = (self.row * WIDTH + self.column) as u16;

        unsafe {
            outb(0x3d4, 0x0e);
            outb(0x3d5, (position >> 8) as u8);
            outb(0x3d4, 0x0f);
            outb(0x3d5, (position & 0xff) as u8);
        }
    }
}

static CONSOLE: Mutex<VgaConsole> = Mutex::new(VgaConsole::new());

/// clears the screen; call once the platform is far enough along to take
/// writes
pub fn init() {
    without_interrupts(|| CONSOLE.lock().clear());
}

/// writes a string to the screen
pub fn puts(s: &str) {
    without_interrupts(|| CONSOLE.lock().puts(s));
}

/// writes raw bytes to the screen; anything unprintable (other than newlines
/// and tabs) is dropped
pub fn put_bytes(bytes: &[u8]) {
    without_interrupts(|| {
        let mut console = CONSOLE.lock();

        for b in bytes.iter() {
            console.put_byte(*b);
        }

        console.update_cursor();
    });
}
