mod error;
mod frame;
mod heap;
mod native;
mod ops;
mod stack;
mod value;
mod vm;
pub mod bytecode;
pub mod dump;

pub use error::{ErrorKind, VmError};
pub use frame::{CallStack, Frame, Locals};
pub use heap::{ARRAY_HEADER_SIZE, ArrayHeader, Heap, INT_SIZE, PTR_SIZE};
pub use native::{NativeContext, NativeEntry, NativeFn, NativeTable};
pub use ops::Opcode;
pub use stack::OperandStack;
pub use value::{Address, Value};
pub use vm::{RunStats, VM, execute};

/// A function in the program's function pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub num_args: u16,
    pub num_vars: u16,
    pub code: Vec<u8>,
}

/// A native descriptor: how many arguments to pass and which dispatch table
/// entry to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeInfo {
    pub num_args: u16,
    pub function_table_index: u16,
}

/// A loaded program: function, constant and native pools.
///
/// Function 0 is the entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    pub int_pool: Vec<i32>,
    /// Concatenated NUL-terminated strings, addressed by byte offset.
    pub string_pool: Vec<u8>,
    pub functions: Vec<Function>,
    pub natives: Vec<NativeInfo>,
}
