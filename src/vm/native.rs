//! Calling convention for host-implemented native functions.
//!
//! A native receives its arguments as an ordered slice (first argument at
//! index 0) and returns exactly one value. The bodies live outside the VM;
//! the VM only marshals values across the boundary.

use std::fmt;
use std::io::Write;

use super::{Heap, NativeInfo, OperandStack, Value, VmError};

/// Everything a native may touch while it runs.
pub struct NativeContext<'a> {
    pub heap: &'a mut Heap,
    pub output: &'a mut dyn Write,
}

impl NativeContext<'_> {
    /// Read a C0 string argument. Null reads as the empty string.
    pub fn string(&self, value: Value) -> Result<&[u8], VmError> {
        let addr = value.as_ptr();
        if addr.is_null() {
            return Ok(&[]);
        }
        self.heap.read_c_string(addr)
    }

    /// Allocate a C0 string and return the value pointing at it.
    pub fn alloc_string(&mut self, s: &[u8]) -> Result<Value, VmError> {
        Ok(Value::Ptr(self.heap.alloc_c_string(s)?))
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        self.output
            .write_all(bytes)
            .map_err(|e| VmError::internal(format!("io error: {}", e)))
    }
}

/// Signature of a native function.
pub type NativeFn = fn(&mut NativeContext<'_>, &[Value]) -> Result<Value, VmError>;

/// A registered native function.
#[derive(Clone, Copy)]
pub struct NativeEntry {
    pub name: &'static str,
    pub func: NativeFn,
}

impl fmt::Debug for NativeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The dispatch table native descriptors index into.
///
/// Handed to the VM by shared reference at construction; the VM never
/// modifies it.
#[derive(Debug, Default, Clone)]
pub struct NativeTable {
    entries: Vec<NativeEntry>,
}

impl NativeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a native and return its dispatch index.
    pub fn register(&mut self, name: &'static str, func: NativeFn) -> u16 {
        let index = self.entries.len() as u16;
        self.entries.push(NativeEntry { name, func });
        index
    }

    pub fn get(&self, index: u16) -> Option<&NativeEntry> {
        self.entries.get(usize::from(index))
    }

    /// Dispatch index of the native called `name`, if registered.
    pub fn index_of(&self, name: &str) -> Option<u16> {
        self.entries
            .iter()
            .position(|e| e.name == name)
            .map(|i| i as u16)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pop the arguments `info` describes from `stack`, call the native and
    /// push its result.
    pub fn call(
        &self,
        info: &NativeInfo,
        stack: &mut OperandStack,
        ctx: &mut NativeContext<'_>,
    ) -> Result<(), VmError> {
        let entry = self.get(info.function_table_index).ok_or_else(|| {
            VmError::internal(format!(
                "native function {} not in dispatch table ({} entries)",
                info.function_table_index,
                self.len()
            ))
        })?;
        let args = stack.pop_args(usize::from(info.num_args))?;
        tracing::debug!(native = entry.name, argc = args.len(), "invokenative");
        let result = (entry.func)(ctx, &args)?;
        stack.push(result);
        Ok(())
    }
}
