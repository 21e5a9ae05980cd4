//! c0vm - A virtual machine for C0 bytecode
//!
//! This library provides the loader, interpreter and built-in natives used
//! by the `c0vm` binary.

pub mod config;
pub mod stdlib;
pub mod vm;

// Re-export commonly used types
pub use config::{ReportFormat, RuntimeConfig};
pub use vm::{ErrorKind, NativeTable, Program, RunStats, VM, Value, VmError, execute};
