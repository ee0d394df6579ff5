//! architecture specific code

#[cfg(target_arch = "x86")]
pub mod i586;

#[cfg(target_arch = "x86")]
pub use i586::*;

/// the physical address size for this architecture
///
/// since PAE is optional and for i686 and up, there's no point in using a full
/// 64 bit pointer when the top 32 bits are irrelevant
pub type PhysicalAddress = u32;
