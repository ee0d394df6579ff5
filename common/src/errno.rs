//! kernel error numbers

use core::fmt;
use num_enum::TryFromPrimitive;

/// error number and message
///
/// syscalls report these to userspace as negative values in EAX, so the
/// discriminants here are part of the ABI and must not be reordered
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
pub enum Errno {
    /// unknown call number, or a registered number whose handler is a stub
    InvalidSyscall = 1,

    /// syscall argument out of range, unsupported fd, oversize count
    InvalidParameter,

    /// reserved for future capability checks
    PermissionDenied,

    /// caller or target pid doesn't exist
    NoSuchProcess,

    /// no free frame or heap byte for a demanded allocation
    OutOfMemory,

    /// a supplied virtual address doesn't translate or crosses a disallowed boundary
    InvalidAddress,

    /// a supplied buffer is too small for the result
    BufferTooSmall,

    // the rest of these are reserved for future filesystem work
    AlreadyExists,
    NotFound,
    Busy,
    Interrupted,
    ReadOnly,
    NoSpace,
}

impl Errno {
    /// the value a syscall handler leaves in the saved EAX slot for this error
    pub fn as_return_value(self) -> u32 {
        (-(self as u32 as i32)) as u32
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", match self {
            Self::InvalidSyscall => "invalid syscall",
            Self::InvalidParameter => "invalid parameter",
            Self::PermissionDenied => "permission denied",
            Self::NoSuchProcess => "no such process",
            Self::OutOfMemory => "out of memory",
            Self::InvalidAddress => "invalid address",
            Self::BufferTooSmall => "buffer too small",
            Self::AlreadyExists => "already exists",
            Self::NotFound => "not found",
            Self::Busy => "busy",
            Self::Interrupted => "interrupted",
            Self::ReadOnly => "read only",
            Self::NoSpace => "no space",
        })
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno: {self}")
    }
}

#[cfg(test)]
mod tests {
    use super::Errno;

    #[test]
    fn return_values_are_negative() {
        assert_eq!(Errno::InvalidSyscall.as_return_value() as i32, -1);
        assert_eq!(Errno::InvalidParameter.as_return_value() as i32, -2);
        assert_eq!(Errno::PermissionDenied.as_return_value() as i32, -3);
        assert_eq!(Errno::NoSuchProcess.as_return_value() as i32, -4);
        assert_eq!(Errno::OutOfMemory.as_return_value() as i32, -5);
        assert_eq!(Errno::InvalidAddress.as_return_value() as i32, -6);
        assert_eq!(Errno::BufferTooSmall.as_return_value() as i32, -7);
    }

    #[test]
    fn round_trip() {
        for num in 1_u32..=13 {
            let errno = Errno::try_from(num).unwrap();
            assert_eq!(errno as u32, num);
        }
        assert!(Errno::try_from(0_u32).is_err());
        assert!(Errno::try_from(14_u32).is_err());
    }
}
