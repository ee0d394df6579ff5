//! syscall numbers
//!
//! the call number goes in EAX, arguments in EBX, ECX, EDX, ESI (EDI is
//! reserved for expansion), and the return value comes back in EAX

use num_enum::TryFromPrimitive;

/// every syscall the kernel knows about
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum Syscall {
    Exit = 0,
    Write,
    GetPid,
    Read,
    Open,
    Close,
    Sleep,
    Yield,
}

/// how many syscalls there are, for sizing dispatch and statistics tables
pub const NUM_SYSCALLS: usize = 8;

#[cfg(test)]
mod tests {
    use super::{Syscall, NUM_SYSCALLS};

    #[test]
    fn numbering() {
        assert_eq!(Syscall::try_from(0_u32).unwrap(), Syscall::Exit);
        assert_eq!(Syscall::try_from(1_u32).unwrap(), Syscall::Write);
        assert_eq!(Syscall::try_from(2_u32).unwrap(), Syscall::GetPid);
        assert_eq!(Syscall::try_from(6_u32).unwrap(), Syscall::Sleep);
        assert_eq!(Syscall::try_from(7_u32).unwrap(), Syscall::Yield);
    }

    #[test]
    fn unknown_numbers_are_rejected() {
        assert!(Syscall::try_from(NUM_SYSCALLS as u32).is_err());
        assert!(Syscall::try_from(999_u32).is_err());
        assert!(Syscall::try_from(u32::MAX).is_err());
    }
}
