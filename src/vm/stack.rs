use super::{Value, VmError};

/// The operand stack of a single activation.
///
/// Strictly LIFO. A fresh stack is created for every call and the caller's
/// stack is put aside in its [`Frame`](super::Frame) until the callee returns.
#[derive(Debug, Default)]
pub struct OperandStack {
    values: Vec<Value>,
}

impl OperandStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    /// Pop the top value. Underflow means the bytecode is malformed.
    pub fn pop(&mut self) -> Result<Value, VmError> {
        self.values
            .pop()
            .ok_or_else(|| VmError::internal("operand stack underflow"))
    }

    pub fn pop_int(&mut self) -> Result<i32, VmError> {
        Ok(self.pop()?.as_int())
    }

    pub fn pop_ptr(&mut self) -> Result<super::Address, VmError> {
        Ok(self.pop()?.as_ptr())
    }

    /// Pop `n` values into a vector ordered bottom-to-top: the last value
    /// popped lands at index 0.
    pub fn pop_args(&mut self, n: usize) -> Result<Vec<Value>, VmError> {
        let mut args = vec![Value::default(); n];
        for slot in args.iter_mut().rev() {
            *slot = self.pop()?;
        }
        Ok(args)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
