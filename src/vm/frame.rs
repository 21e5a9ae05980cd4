//! Activation records and the explicit call stack.
//!
//! Calls never recurse on the host stack: the caller's whole activation is
//! moved into a [`Frame`] and pushed onto a [`CallStack`], so call depth is
//! limited by available memory only.

use super::{Function, OperandStack, Value, VmError};

/// The local variables of one activation, zeroed on entry.
#[derive(Debug, Default)]
pub struct Locals {
    slots: Vec<Value>,
}

impl Locals {
    pub fn new(count: usize) -> Self {
        Self {
            slots: vec![Value::default(); count],
        }
    }

    pub fn get(&self, index: usize) -> Result<Value, VmError> {
        self.slots.get(index).copied().ok_or_else(|| {
            VmError::internal(format!(
                "local variable {} out of range ({} locals)",
                index,
                self.slots.len()
            ))
        })
    }

    pub fn set(&mut self, index: usize, value: Value) -> Result<(), VmError> {
        let len = self.slots.len();
        let slot = self.slots.get_mut(index).ok_or_else(|| {
            VmError::internal(format!(
                "local variable {} out of range ({} locals)",
                index, len
            ))
        })?;
        *slot = value;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A complete activation: code view, program counter, operand stack, locals.
///
/// The interpreter owns the running activation directly; suspended callers
/// live on the [`CallStack`].
#[derive(Debug)]
pub struct Frame<'p> {
    /// Index into the program's function pool.
    pub function: usize,
    pub code: &'p [u8],
    pub pc: usize,
    pub stack: OperandStack,
    pub locals: Locals,
}

impl<'p> Frame<'p> {
    /// A fresh activation of `func` with the given arguments in slots
    /// `0..args.len()` and every other local zeroed.
    pub fn enter(function: usize, func: &'p Function, args: Vec<Value>) -> Result<Self, VmError> {
        let mut locals = Locals::new(usize::from(func.num_vars));
        for (slot, value) in args.into_iter().enumerate() {
            locals.set(slot, value)?;
        }
        Ok(Self {
            function,
            code: &func.code,
            pc: 0,
            stack: OperandStack::new(),
            locals,
        })
    }
}

/// LIFO history of suspended callers.
#[derive(Debug, Default)]
pub struct CallStack<'p> {
    frames: Vec<Frame<'p>>,
    max_depth: usize,
}

impl<'p> CallStack<'p> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame<'p>) {
        self.frames.push(frame);
        self.max_depth = self.max_depth.max(self.frames.len());
    }

    pub fn pop(&mut self) -> Option<Frame<'p>> {
        self.frames.pop()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Deepest the stack has been since it was created.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// `(function, return pc)` pairs from the outermost caller inward.
    pub fn backtrace(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.frames.iter().map(|f| (f.function, f.pc))
    }
}
