//! the embedded demo program
//!
//! there's no filesystem to load anything from, so the program init runs in
//! ring 3 is a hand-assembled flat binary baked into the kernel image. the
//! first 32 bytes of the code region hold the message it prints, execution
//! starts right after

use crate::task::lifecycle::ProgramImage;

/// offset of the first instruction inside [`DEMO_CODE`]
const ENTRY: usize = 32;

pub static DEMO: ProgramImage<'static> = ProgramImage {
    name: "demo",
    code: &DEMO_CODE,
    data: &[],
    entry: ENTRY,
};

/// the message at offset 0 (loaded at 0x08000000), padded to the entry
/// point, then the code:
///
/// ```text
/// mov eax, 1          ; write
/// mov ebx, 1          ; fd 1
/// mov ecx, 0x08000000 ; the message
/// mov edx, 18
/// int 0x80
/// mov eax, 2          ; getpid
/// int 0x80
/// mov eax, 7          ; yield
/// int 0x80
/// mov eax, 0          ; exit
/// mov ebx, 42
/// int 0x80
/// jmp $               ; never reached
/// ```
static DEMO_CODE: [u8; ENTRY + 50] = [
    // "hello from ring 3\n", padded to 32 bytes
    b'h', b'e', b'l', b'l', b'o', b' ', b'f', b'r', b'o', b'm', b' ', b'r', b'i', b'n', b'g', b' ', //
    b'3', b'\n', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, //
    0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
    0xbb, 0x01, 0x00, 0x00, 0x00, // mov ebx, 1
    0xb9, 0x00, 0x00, 0x00, 0x08, // mov ecx, 0x08000000
    0xba, 0x12, 0x00, 0x00, 0x00, // mov edx, 18
    0xcd, 0x80, // int 0x80
    0xb8, 0x02, 0x00, 0x00, 0x00, // mov eax, 2
    0xcd, 0x80, // int 0x80
    0xb8, 0x07, 0x00, 0x00, 0x00, // mov eax, 7
    0xcd, 0x80, // int 0x80
    0xb8, 0x00, 0x00, 0x00, 0x00, // mov eax, 0
    0xbb, 0x2a, 0x00, 0x00, 0x00, // mov ebx, 42
    0xcd, 0x80, // int 0x80
    0xeb, 0xfe, // jmp $
];
