//! platform specific code

pub mod ibmpc;

pub use ibmpc::*;
