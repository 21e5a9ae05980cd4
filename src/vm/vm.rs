use std::io::{self, Write};
use std::mem;

use serde::Serialize;
use tracing::{debug, trace};

use crate::config::RuntimeConfig;
use crate::vm::{
    Address, CallStack, Frame, Heap, NativeContext, NativeTable, Opcode, Program, Value, VmError,
};

/// Counters collected while a program runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub instructions: u64,
    pub calls: u64,
    pub native_calls: u64,
    pub max_call_depth: usize,
    pub heap_bytes: usize,
    pub heap_objects: usize,
}

enum ControlFlow {
    Continue,
    Exit(i32),
}

/// The C0 virtual machine.
///
/// Holds the running activation directly and every suspended caller on an
/// explicit [`CallStack`]; no host recursion is involved in calls.
pub struct VM<'p> {
    program: &'p Program,
    natives: &'p NativeTable,
    heap: Heap,
    /// Where the program's string pool was copied into the heap.
    string_pool: Address,
    frame: Frame<'p>,
    call_stack: CallStack<'p>,
    output: Box<dyn Write + 'p>,
    trace: bool,
    halted: bool,
    /// Position of the instruction being executed.
    op_pc: usize,
    stats: RunStats,
}

impl<'p> VM<'p> {
    pub fn new(program: &'p Program, natives: &'p NativeTable) -> Result<Self, VmError> {
        Self::with_config(
            program,
            natives,
            &RuntimeConfig::default(),
            Box::new(io::stdout()),
        )
    }

    /// Create a VM with a custom output stream for natives.
    pub fn with_output(
        program: &'p Program,
        natives: &'p NativeTable,
        output: Box<dyn Write + 'p>,
    ) -> Result<Self, VmError> {
        Self::with_config(program, natives, &RuntimeConfig::default(), output)
    }

    /// Create a VM with full configuration.
    ///
    /// The string pool is copied into the heap so `ALDC` can hand out
    /// ordinary heap addresses, and function 0 is activated with zeroed
    /// locals.
    pub fn with_config(
        program: &'p Program,
        natives: &'p NativeTable,
        config: &RuntimeConfig,
        output: Box<dyn Write + 'p>,
    ) -> Result<Self, VmError> {
        let main = program
            .functions
            .first()
            .ok_or_else(|| VmError::internal("program has no functions"))?;

        let mut heap = Heap::new_with_limit(config.heap_limit);
        let string_pool = heap.alloc_data(&program.string_pool)?;
        let frame = Frame::enter(0, main, Vec::new())?;

        Ok(Self {
            program,
            natives,
            heap,
            string_pool,
            frame,
            call_stack: CallStack::new(),
            output,
            trace: config.trace,
            halted: false,
            op_pc: 0,
            stats: RunStats::default(),
        })
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Number of suspended callers.
    pub fn call_depth(&self) -> usize {
        self.call_stack.depth()
    }

    pub fn stats(&self) -> RunStats {
        RunStats {
            max_call_depth: self.call_stack.max_depth(),
            heap_bytes: self.heap.bytes_allocated(),
            heap_objects: self.heap.object_count(),
            ..self.stats.clone()
        }
    }

    /// Run until the outermost `RETURN` and yield its value, or until the
    /// first error.
    pub fn run(&mut self) -> Result<i32, VmError> {
        if self.halted {
            return Err(VmError::internal("the VM has already halted"));
        }

        let result = loop {
            match self.step() {
                Ok(ControlFlow::Continue) => {}
                Ok(ControlFlow::Exit(value)) => break Ok(value),
                Err(e) => {
                    debug!(
                        function = self.frame.function,
                        pc = self.op_pc,
                        depth = self.call_stack.depth(),
                        "{}",
                        e
                    );
                    for (function, pc) in self.call_stack.backtrace() {
                        debug!(function, pc, "called from");
                    }
                    break Err(e);
                }
            }
        };

        self.halted = true;
        if let Ok(value) = result {
            debug!(result = value, instructions = self.stats.instructions, "program returned");
        }
        result
    }

    fn step(&mut self) -> Result<ControlFlow, VmError> {
        let at = self.frame.pc;
        self.op_pc = at;

        let byte = self.fetch_u8()?;
        let op = Opcode::from_byte(byte)
            .ok_or_else(|| VmError::internal(format!("invalid opcode: 0x{:02x}", byte)))?;
        self.stats.instructions += 1;

        if self.trace {
            trace!(
                function = self.frame.function,
                pc = at,
                op = op.mnemonic(),
                stack = self.frame.stack.len(),
                "step"
            );
        }

        match op {
            Opcode::Nop => {}
            Opcode::Pop => {
                self.frame.stack.pop()?;
            }
            Opcode::Dup => {
                let v = self.frame.stack.pop()?;
                self.frame.stack.push(v);
                self.frame.stack.push(v);
            }
            Opcode::Swap => {
                let v2 = self.frame.stack.pop()?;
                let v1 = self.frame.stack.pop()?;
                self.frame.stack.push(v2);
                self.frame.stack.push(v1);
            }

            Opcode::Iadd => self.int_binop(|x, y| Ok(x.wrapping_add(y)))?,
            Opcode::Isub => self.int_binop(|x, y| Ok(x.wrapping_sub(y)))?,
            Opcode::Imul => self.int_binop(|x, y| Ok(x.wrapping_mul(y)))?,
            Opcode::Idiv => self.int_binop(|x, y| {
                check_division(x, y)?;
                Ok(x / y)
            })?,
            Opcode::Irem => self.int_binop(|x, y| {
                check_division(x, y)?;
                Ok(x % y)
            })?,
            Opcode::Iand => self.int_binop(|x, y| Ok(x & y))?,
            Opcode::Ior => self.int_binop(|x, y| Ok(x | y))?,
            Opcode::Ixor => self.int_binop(|x, y| Ok(x ^ y))?,
            Opcode::Ishl => self.int_binop(|x, y| Ok(x << check_shift(y)?))?,
            Opcode::Ishr => self.int_binop(|x, y| Ok(x >> check_shift(y)?))?,

            Opcode::Bipush => {
                let n = self.fetch_i8()?;
                self.frame.stack.push(Value::Int(i32::from(n)));
            }
            Opcode::Ildc => {
                let index = self.fetch_u16()?;
                let n = self
                    .program
                    .int_pool
                    .get(usize::from(index))
                    .copied()
                    .ok_or_else(|| {
                        VmError::internal(format!("int pool index {} out of range", index))
                    })?;
                self.frame.stack.push(Value::Int(n));
            }
            Opcode::Aldc => {
                let offset = self.fetch_u16()?;
                if usize::from(offset) >= self.program.string_pool.len() {
                    return Err(VmError::internal(format!(
                        "string pool offset {} out of range",
                        offset
                    )));
                }
                let addr = self.string_pool.offset(i64::from(offset));
                self.frame.stack.push(Value::Ptr(addr));
            }
            Opcode::AconstNull => self.frame.stack.push(Value::null()),

            Opcode::Vload => {
                let index = self.fetch_u8()?;
                let v = self.frame.locals.get(usize::from(index))?;
                self.frame.stack.push(v);
            }
            Opcode::Vstore => {
                let index = self.fetch_u8()?;
                let v = self.frame.stack.pop()?;
                self.frame.locals.set(usize::from(index), v)?;
            }

            Opcode::Athrow => {
                let msg = self.frame.stack.pop_ptr()?;
                return Err(VmError::User(self.message(msg)?));
            }
            Opcode::Assert => {
                let msg = self.frame.stack.pop_ptr()?;
                let cond = self.frame.stack.pop_int()?;
                if cond == 0 {
                    return Err(VmError::Assertion(self.message(msg)?));
                }
            }

            Opcode::IfCmpeq | Opcode::IfCmpne => {
                let v2 = self.frame.stack.pop()?;
                let v1 = self.frame.stack.pop()?;
                let equal = v1.raw_eq(&v2);
                self.branch(at, if op == Opcode::IfCmpeq { equal } else { !equal })?;
            }
            Opcode::IfIcmplt => self.int_branch(at, |x, y| x < y)?,
            Opcode::IfIcmpge => self.int_branch(at, |x, y| x >= y)?,
            Opcode::IfIcmpgt => self.int_branch(at, |x, y| x > y)?,
            Opcode::IfIcmple => self.int_branch(at, |x, y| x <= y)?,
            Opcode::Goto => self.branch(at, true)?,

            Opcode::Invokestatic => {
                let index = self.fetch_u16()?;
                self.invoke(index)?;
            }
            Opcode::Invokenative => {
                let index = self.fetch_u16()?;
                self.invoke_native(index)?;
            }
            Opcode::Return => {
                let value = self.frame.stack.pop()?;
                if !self.frame.stack.is_empty() {
                    return Err(VmError::internal(format!(
                        "return with {} values on the operand stack",
                        self.frame.stack.len() + 1
                    )));
                }
                match self.call_stack.pop() {
                    None => return Ok(ControlFlow::Exit(value.as_int())),
                    Some(caller) => {
                        // The callee's stack and locals are dropped here.
                        self.frame = caller;
                        self.frame.stack.push(value);
                        debug!(
                            function = self.frame.function,
                            depth = self.call_stack.depth(),
                            "return"
                        );
                    }
                }
            }

            Opcode::New => {
                let size = self.fetch_u8()?;
                let addr = self.heap.alloc_struct(size)?;
                self.frame.stack.push(Value::Ptr(addr));
            }
            Opcode::Newarray => {
                let elem_size = self.fetch_i8()?;
                let count = self.frame.stack.pop_int()?;
                let addr = self.heap.alloc_array(i32::from(elem_size), count)?;
                self.frame.stack.push(Value::Ptr(addr));
            }
            Opcode::Arraylength => {
                let array = self.frame.stack.pop_ptr()?;
                let count = self.heap.array_length(array)?;
                self.frame.stack.push(Value::Int(count));
            }
            Opcode::Aaddf => {
                let offset = self.fetch_i8()?;
                let base = self.frame.stack.pop_ptr()?;
                let addr = self.heap.field_address(base, offset)?;
                self.frame.stack.push(Value::Ptr(addr));
            }
            Opcode::Aadds => {
                let index = self.frame.stack.pop_int()?;
                let array = self.frame.stack.pop_ptr()?;
                let addr = self.heap.element_address(array, index)?;
                self.frame.stack.push(Value::Ptr(addr));
            }

            Opcode::Imload => {
                let addr = self.frame.stack.pop_ptr()?;
                let n = self.heap.load_int(addr)?;
                self.frame.stack.push(Value::Int(n));
            }
            Opcode::Imstore => {
                let n = self.frame.stack.pop_int()?;
                let addr = self.frame.stack.pop_ptr()?;
                self.heap.store_int(addr, n)?;
            }
            Opcode::Amload => {
                let addr = self.frame.stack.pop_ptr()?;
                let p = self.heap.load_ptr(addr)?;
                self.frame.stack.push(Value::Ptr(p));
            }
            Opcode::Amstore => {
                let p = self.frame.stack.pop_ptr()?;
                let addr = self.frame.stack.pop_ptr()?;
                self.heap.store_ptr(addr, p)?;
            }
            Opcode::Cmload => {
                let addr = self.frame.stack.pop_ptr()?;
                let c = self.heap.load_char(addr)?;
                self.frame.stack.push(Value::Int(c));
            }
            Opcode::Cmstore => {
                let c = self.frame.stack.pop_int()?;
                let addr = self.frame.stack.pop_ptr()?;
                self.heap.store_char(addr, c)?;
            }
        }

        Ok(ControlFlow::Continue)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Suspend the current activation and enter function `index`.
    fn invoke(&mut self, index: u16) -> Result<(), VmError> {
        let program = self.program;
        let func = program
            .functions
            .get(usize::from(index))
            .ok_or_else(|| VmError::internal(format!("function {} does not exist", index)))?;

        let args = self.frame.stack.pop_args(usize::from(func.num_args))?;
        let callee = Frame::enter(usize::from(index), func, args)?;
        let caller = mem::replace(&mut self.frame, callee);
        self.call_stack.push(caller);
        self.stats.calls += 1;

        debug!(function = index, depth = self.call_stack.depth(), "invokestatic");
        Ok(())
    }

    fn invoke_native(&mut self, index: u16) -> Result<(), VmError> {
        let info = self
            .program
            .natives
            .get(usize::from(index))
            .ok_or_else(|| VmError::internal(format!("native {} does not exist", index)))?;
        let natives = self.natives;
        let mut ctx = NativeContext {
            heap: &mut self.heap,
            output: &mut *self.output,
        };
        natives.call(info, &mut self.frame.stack, &mut ctx)?;
        self.stats.native_calls += 1;
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Pop `y` then `x` and push `f(x, y)`.
    fn int_binop(&mut self, f: impl FnOnce(i32, i32) -> Result<i32, VmError>) -> Result<(), VmError> {
        let y = self.frame.stack.pop_int()?;
        let x = self.frame.stack.pop_int()?;
        self.frame.stack.push(Value::Int(f(x, y)?));
        Ok(())
    }

    fn int_branch(&mut self, at: usize, cond: impl FnOnce(i32, i32) -> bool) -> Result<(), VmError> {
        let y = self.frame.stack.pop_int()?;
        let x = self.frame.stack.pop_int()?;
        self.branch(at, cond(x, y))
    }

    /// Read a branch offset and jump relative to the opcode at `at` when
    /// `taken`.
    ///
    /// An offset of zero never jumps, even when taken: execution falls
    /// through to the next instruction.
    fn branch(&mut self, at: usize, taken: bool) -> Result<(), VmError> {
        let offset = self.fetch_i16()?;
        if taken && offset != 0 {
            let target = at as i64 + i64::from(offset);
            self.frame.pc = usize::try_from(target).map_err(|_| {
                VmError::internal(format!("branch target {} before start of function", target))
            })?;
        }
        Ok(())
    }

    /// The message of an `ATHROW` or `ASSERT`.
    fn message(&self, addr: Address) -> Result<String, VmError> {
        if addr.is_null() {
            return Ok(String::new());
        }
        let bytes = self.heap.read_c_string(addr)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn fetch_u8(&mut self) -> Result<u8, VmError> {
        let byte = self.frame.code.get(self.frame.pc).copied().ok_or_else(|| {
            VmError::internal(format!(
                "program counter {} past end of function {} ({} bytes)",
                self.frame.pc,
                self.frame.function,
                self.frame.code.len()
            ))
        })?;
        self.frame.pc += 1;
        Ok(byte)
    }

    fn fetch_i8(&mut self) -> Result<i8, VmError> {
        Ok(self.fetch_u8()? as i8)
    }

    fn fetch_u16(&mut self) -> Result<u16, VmError> {
        let hi = self.fetch_u8()?;
        let lo = self.fetch_u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn fetch_i16(&mut self) -> Result<i16, VmError> {
        Ok(self.fetch_u16()? as i16)
    }
}

fn check_division(x: i32, y: i32) -> Result<(), VmError> {
    if y == 0 {
        return Err(VmError::arithmetic("division by zero"));
    }
    if x == i32::MIN && y == -1 {
        return Err(VmError::arithmetic("integer overflow in division"));
    }
    Ok(())
}

fn check_shift(y: i32) -> Result<i32, VmError> {
    if !(0..=31).contains(&y) {
        return Err(VmError::arithmetic(format!("shift amount {} out of range", y)));
    }
    Ok(y)
}

/// Run `program` to completion with stdout as the natives' output.
pub fn execute(program: &Program, natives: &NativeTable) -> Result<i32, VmError> {
    VM::new(program, natives)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::bytecode::CodeBuilder;
    use crate::vm::{ErrorKind, Function, Opcode::*};

    fn program(code: Vec<u8>) -> Program {
        Program {
            functions: vec![Function {
                num_args: 0,
                num_vars: 4,
                code,
            }],
            ..Default::default()
        }
    }

    fn run(code: Vec<u8>) -> Result<i32, VmError> {
        execute(&program(code), &NativeTable::new())
    }

    fn binop(op: crate::vm::Opcode, x: i32, y: i32) -> Result<i32, VmError> {
        let p = Program {
            int_pool: vec![x, y],
            ..program(
                CodeBuilder::new()
                    .op_u16(Ildc, 0)
                    .op_u16(Ildc, 1)
                    .op(op)
                    .op(Return)
                    .finish(),
            )
        };
        execute(&p, &NativeTable::new())
    }

    #[test]
    fn test_return_constant() {
        let code = CodeBuilder::new().op_i8(Bipush, -3).op(Return).finish();
        assert_eq!(run(code), Ok(-3));
    }

    #[test]
    fn test_wrapping_arithmetic() {
        assert_eq!(binop(Iadd, i32::MAX, 1), Ok(i32::MIN));
        assert_eq!(binop(Isub, i32::MIN, 1), Ok(i32::MAX));
        assert_eq!(binop(Imul, 0x10000, 0x10000), Ok(0));
        assert_eq!(binop(Isub, 3, 10), Ok(-7));
    }

    #[test]
    fn test_division_identity() {
        let samples = [i32::MIN, i32::MIN + 1, -100, -7, -1, 0, 1, 3, 7, 100, i32::MAX];
        for x in samples {
            for y in samples {
                if y == 0 || (x == i32::MIN && y == -1) {
                    continue;
                }
                let q = binop(Idiv, x, y).unwrap();
                let r = binop(Irem, x, y).unwrap();
                assert_eq!(q.wrapping_mul(y).wrapping_add(r), x, "x={} y={}", x, y);
                assert!(r == 0 || (r < 0) == (x < 0), "remainder sign x={} y={}", x, y);
            }
        }
        assert_eq!(binop(Idiv, -7, 2), Ok(-3));
        assert_eq!(binop(Irem, -7, 2), Ok(-1));
    }

    #[test]
    fn test_division_by_zero() {
        for x in [i32::MIN, -1, 0, 1, i32::MAX] {
            for op in [Idiv, Irem] {
                let err = binop(op, x, 0).unwrap_err();
                assert_eq!(err, VmError::arithmetic("division by zero"));
            }
        }
    }

    #[test]
    fn test_int_min_by_minus_one() {
        for op in [Idiv, Irem] {
            let err = binop(op, i32::MIN, -1).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Arithmetic);
        }
    }

    #[test]
    fn test_bitwise() {
        assert_eq!(binop(Iand, 0b1100, 0b1010), Ok(0b1000));
        assert_eq!(binop(Ior, 0b1100, 0b1010), Ok(0b1110));
        assert_eq!(binop(Ixor, 0b1100, 0b1010), Ok(0b0110));
    }

    #[test]
    fn test_shifts() {
        assert_eq!(binop(Ishl, 1, 31), Ok(i32::MIN));
        assert_eq!(binop(Ishl, 3, 0), Ok(3));
        for x in [i32::MIN, -9, -1, 0, 9, i32::MAX] {
            for n in 0..32 {
                assert_eq!(binop(Ishr, x, n), Ok(x >> n));
            }
        }
        assert_eq!(binop(Ishr, -8, 1), Ok(-4));
        for n in [-1, 32, 100, i32::MIN] {
            assert_eq!(binop(Ishl, 1, n).unwrap_err().kind(), ErrorKind::Arithmetic);
            assert_eq!(binop(Ishr, 1, n).unwrap_err().kind(), ErrorKind::Arithmetic);
        }
    }

    #[test]
    fn test_dup_and_swap() {
        // 7 dup isub -> 0
        let code = CodeBuilder::new()
            .op_i8(Bipush, 7)
            .op(Dup)
            .op(Isub)
            .op(Return)
            .finish();
        assert_eq!(run(code), Ok(0));

        // 10 3 swap isub -> 3 - 10
        let code = CodeBuilder::new()
            .op_i8(Bipush, 10)
            .op_i8(Bipush, 3)
            .op(Swap)
            .op(Isub)
            .op(Return)
            .finish();
        assert_eq!(run(code), Ok(-7));

        // swapping twice restores the order
        let code = CodeBuilder::new()
            .op_i8(Bipush, 10)
            .op_i8(Bipush, 3)
            .op(Swap)
            .op(Swap)
            .op(Isub)
            .op(Return)
            .finish();
        assert_eq!(run(code), Ok(7));
    }

    #[test]
    fn test_pop_and_nop() {
        let code = CodeBuilder::new()
            .op_i8(Bipush, 1)
            .op_i8(Bipush, 2)
            .op(Pop)
            .op(Nop)
            .op(Return)
            .finish();
        assert_eq!(run(code), Ok(1));
    }

    #[test]
    fn test_locals() {
        let code = CodeBuilder::new()
            .op_i8(Bipush, 5)
            .op_u8(Vstore, 3)
            .op_u8(Vload, 3)
            .op_u8(Vload, 3)
            .op(Imul)
            .op_u8(Vload, 1)
            .op(Iadd)
            .op(Return)
            .finish();
        assert_eq!(run(code), Ok(25));
    }

    #[test]
    fn test_goto_zero_offset_falls_through() {
        let code = CodeBuilder::new()
            .op_i16(Goto, 0)
            .op_i8(Bipush, 9)
            .op(Return)
            .finish();
        assert_eq!(run(code), Ok(9));
    }

    #[test]
    fn test_taken_conditional_with_zero_offset_falls_through() {
        let code = CodeBuilder::new()
            .op_i8(Bipush, 1)
            .op_i8(Bipush, 1)
            .op_i16(IfCmpeq, 0)
            .op_i8(Bipush, 4)
            .op(Return)
            .finish();
        assert_eq!(run(code), Ok(4));
    }

    #[test]
    fn test_goto_skips_forward() {
        // 0: goto +5 ; 3: bipush 1 ; 5: bipush 2 ; 7: return
        let code = CodeBuilder::new()
            .op_i16(Goto, 5)
            .op_i8(Bipush, 1)
            .op_i8(Bipush, 2)
            .op(Return)
            .finish();
        assert_eq!(run(code), Ok(2));
    }

    #[test]
    fn test_countdown_loop() {
        // i = 10; n = 0; while (i > 0) { n += 3; i -= 1; } return n;
        let mut b = CodeBuilder::new();
        b.op_i8(Bipush, 10).op_u8(Vstore, 0);
        b.op_i8(Bipush, 0).op_u8(Vstore, 1);
        let head = b.pos();
        b.op_u8(Vload, 0).op_i8(Bipush, 0);
        let exit = b.forward(IfIcmple);
        b.op_u8(Vload, 1).op_i8(Bipush, 3).op(Iadd).op_u8(Vstore, 1);
        b.op_u8(Vload, 0).op_i8(Bipush, 1).op(Isub).op_u8(Vstore, 0);
        b.branch_to(Goto, head);
        b.patch_here(exit);
        b.op_u8(Vload, 1).op(Return);
        assert_eq!(run(b.finish()), Ok(30));
    }

    #[test]
    fn test_integer_comparisons() {
        let cases = [
            (IfIcmplt, 1, 2, true),
            (IfIcmplt, 2, 2, false),
            (IfIcmpge, 2, 2, true),
            (IfIcmpge, -5, 2, false),
            (IfIcmpgt, 3, 2, true),
            (IfIcmpgt, 2, 3, false),
            (IfIcmple, 2, 2, true),
            (IfIcmple, 3, 2, false),
            (IfCmpeq, 4, 4, true),
            (IfCmpne, 4, 4, false),
            (IfCmpne, 4, 5, true),
        ];
        for (op, x, y, taken) in cases {
            // 0: bipush x ; 2: bipush y ; 4: if +6 ; 7: bipush 0 ; 9: return ; 10: bipush 1 ; 12: return
            let code = CodeBuilder::new()
                .op_i8(Bipush, x)
                .op_i8(Bipush, y)
                .op_i16(op, 6)
                .op_i8(Bipush, 0)
                .op(Return)
                .op_i8(Bipush, 1)
                .op(Return)
                .finish();
            assert_eq!(run(code), Ok(i32::from(taken)), "{:?} {} {}", op, x, y);
        }
    }

    #[test]
    fn test_null_compares_equal_to_zero() {
        let code = CodeBuilder::new()
            .op(AconstNull)
            .op_i8(Bipush, 0)
            .op_i16(IfCmpeq, 6)
            .op_i8(Bipush, 0)
            .op(Return)
            .op_i8(Bipush, 1)
            .op(Return)
            .finish();
        assert_eq!(run(code), Ok(1));
    }

    #[test]
    fn test_backward_branch_before_start() {
        let code = CodeBuilder::new().op_i16(Goto, -4).finish();
        assert_eq!(run(code).unwrap_err().kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_invalid_opcode() {
        let err = run(vec![Nop as u8, 0xFE]).unwrap_err();
        assert_eq!(err, VmError::internal("invalid opcode: 0xfe"));
    }

    #[test]
    fn test_running_off_the_end() {
        let err = run(vec![Nop as u8]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_return_requires_single_value() {
        let code = CodeBuilder::new()
            .op_i8(Bipush, 1)
            .op_i8(Bipush, 2)
            .op(Return)
            .finish();
        assert_eq!(run(code).unwrap_err().kind(), ErrorKind::Internal);
        assert_eq!(run(vec![Return as u8]).unwrap_err().kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_ildc_out_of_range() {
        let code = CodeBuilder::new().op_u16(Ildc, 3).op(Return).finish();
        assert_eq!(run(code).unwrap_err().kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_struct_field_roundtrip() {
        // new 8; dup; aaddf 4; bipush 42; imstore; aaddf 4; imload; return
        let code = CodeBuilder::new()
            .op_u8(New, 8)
            .op(Dup)
            .op_i8(Aaddf, 4)
            .op_i8(Bipush, 42)
            .op(Imstore)
            .op_i8(Aaddf, 4)
            .op(Imload)
            .op(Return)
            .finish();
        assert_eq!(run(code), Ok(42));
    }

    #[test]
    fn test_new_returns_distinct_handles() {
        // new 0; new n; if_cmpeq +6; bipush 0; return; bipush 1; return
        for second in [0, 4] {
            let code = CodeBuilder::new()
                .op_u8(New, 0)
                .op_u8(New, second)
                .op_i16(IfCmpeq, 6)
                .op_i8(Bipush, 0)
                .op(Return)
                .op_i8(Bipush, 1)
                .op(Return)
                .finish();
            assert_eq!(run(code), Ok(0), "new 0 aliased new {}", second);
        }
    }

    #[test]
    fn test_empty_arrays_are_distinct() {
        // bipush 0; newarray 4; bipush 0; newarray 4; if_cmpeq +6; ...
        let code = CodeBuilder::new()
            .op_i8(Bipush, 0)
            .op_i8(Newarray, 4)
            .op_i8(Bipush, 0)
            .op_i8(Newarray, 4)
            .op_i16(IfCmpeq, 6)
            .op_i8(Bipush, 0)
            .op(Return)
            .op_i8(Bipush, 1)
            .op(Return)
            .finish();
        assert_eq!(run(code), Ok(0));
    }

    #[test]
    fn test_aaddf_on_null() {
        let code = CodeBuilder::new()
            .op(AconstNull)
            .op_i8(Aaddf, 0)
            .op(Return)
            .finish();
        assert_eq!(run(code).unwrap_err().kind(), ErrorKind::Memory);
    }

    #[test]
    fn test_array_length_and_elements() {
        // A = alloc_array(int, 5); A[3] = 17; return A[3] + \length(A)
        let code = CodeBuilder::new()
            .op_i8(Bipush, 5)
            .op_i8(Newarray, 4)
            .op_u8(Vstore, 0)
            .op_u8(Vload, 0)
            .op_i8(Bipush, 3)
            .op(Aadds)
            .op_i8(Bipush, 17)
            .op(Imstore)
            .op_u8(Vload, 0)
            .op_i8(Bipush, 3)
            .op(Aadds)
            .op(Imload)
            .op_u8(Vload, 0)
            .op(Arraylength)
            .op(Iadd)
            .op(Return)
            .finish();
        assert_eq!(run(code), Ok(22));
    }

    #[test]
    fn test_aadds_out_of_bounds() {
        for index in [-1i8, 2, 100] {
            let code = CodeBuilder::new()
                .op_i8(Bipush, 2)
                .op_i8(Newarray, 4)
                .op_i8(Bipush, index)
                .op(Aadds)
                .op(Imload)
                .op(Return)
                .finish();
            let err = run(code).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Memory, "index {}", index);
        }
    }

    #[test]
    fn test_aadds_on_null_array() {
        let code = CodeBuilder::new()
            .op(AconstNull)
            .op_i8(Bipush, 0)
            .op(Aadds)
            .op(Return)
            .finish();
        assert_eq!(run(code).unwrap_err().kind(), ErrorKind::Memory);
    }

    #[test]
    fn test_typed_loads_and_stores_null_check() {
        for (op, pushes) in [(Imload, 0), (Amload, 0), (Cmload, 0), (Imstore, 1), (Amstore, 1), (Cmstore, 1)] {
            let mut b = CodeBuilder::new();
            b.op(AconstNull);
            if pushes == 1 {
                if op == Amstore {
                    b.op(AconstNull);
                } else {
                    b.op_i8(Bipush, 1);
                }
            }
            b.op(op).op_i8(Bipush, 0).op(Return);
            let err = run(b.finish()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Memory, "{:?}", op);
        }
    }

    #[test]
    fn test_char_store_masks() {
        // c = new 1; *c = -56 (0xC8); return *c  ->  0x48
        let code = CodeBuilder::new()
            .op_u8(New, 1)
            .op_u8(Vstore, 0)
            .op_u8(Vload, 0)
            .op_i8(Bipush, -56)
            .op(Cmstore)
            .op_u8(Vload, 0)
            .op(Cmload)
            .op(Return)
            .finish();
        assert_eq!(run(code), Ok(0x48));
    }

    #[test]
    fn test_pointer_cells() {
        // p = new 8 (holds a pointer); q = new 4; *q = 11; *p = q; return **p
        let code = CodeBuilder::new()
            .op_u8(New, 8)
            .op_u8(Vstore, 0)
            .op_u8(New, 4)
            .op_u8(Vstore, 1)
            .op_u8(Vload, 1)
            .op_i8(Bipush, 11)
            .op(Imstore)
            .op_u8(Vload, 0)
            .op_u8(Vload, 1)
            .op(Amstore)
            .op_u8(Vload, 0)
            .op(Amload)
            .op(Imload)
            .op(Return)
            .finish();
        assert_eq!(run(code), Ok(11));
    }

    #[test]
    fn test_aldc_points_into_string_pool() {
        let p = Program {
            string_pool: b"abc\0xyz\0".to_vec(),
            ..program(
                CodeBuilder::new()
                    .op_u16(Aldc, 5)
                    .op(Cmload)
                    .op(Return)
                    .finish(),
            )
        };
        assert_eq!(execute(&p, &NativeTable::new()), Ok(i32::from(b'y')));
    }

    #[test]
    fn test_athrow_and_assert() {
        let with_pool = |code: Vec<u8>| Program {
            string_pool: b"boom\0".to_vec(),
            ..program(code)
        };

        let p = with_pool(CodeBuilder::new().op_u16(Aldc, 0).op(Athrow).finish());
        let err = execute(&p, &NativeTable::new()).unwrap_err();
        assert_eq!(err, VmError::User("boom".to_string()));

        let p = with_pool(
            CodeBuilder::new()
                .op_i8(Bipush, 0)
                .op_u16(Aldc, 0)
                .op(Assert)
                .op_i8(Bipush, 1)
                .op(Return)
                .finish(),
        );
        let err = execute(&p, &NativeTable::new()).unwrap_err();
        assert_eq!(err, VmError::Assertion("boom".to_string()));

        let p = with_pool(
            CodeBuilder::new()
                .op_i8(Bipush, 1)
                .op_u16(Aldc, 0)
                .op(Assert)
                .op_i8(Bipush, 1)
                .op(Return)
                .finish(),
        );
        assert_eq!(execute(&p, &NativeTable::new()), Ok(1));
    }

    #[test]
    fn test_invokestatic_passes_args_in_order() {
        // main: bipush 10; bipush 3; invokestatic 1; return
        // f(a, b): vload 0; vload 1; isub; return
        let p = Program {
            functions: vec![
                Function {
                    num_args: 0,
                    num_vars: 0,
                    code: CodeBuilder::new()
                        .op_i8(Bipush, 10)
                        .op_i8(Bipush, 3)
                        .op_u16(Invokestatic, 1)
                        .op(Return)
                        .finish(),
                },
                Function {
                    num_args: 2,
                    num_vars: 3,
                    code: CodeBuilder::new()
                        .op_u8(Vload, 0)
                        .op_u8(Vload, 1)
                        .op(Isub)
                        .op_u8(Vload, 2)
                        .op(Iadd)
                        .op(Return)
                        .finish(),
                },
            ],
            ..Default::default()
        };
        assert_eq!(execute(&p, &NativeTable::new()), Ok(7));
    }

    #[test]
    fn test_caller_stack_survives_call() {
        // main keeps 100 on its stack across a call to f() = 5
        let p = Program {
            functions: vec![
                Function {
                    num_args: 0,
                    num_vars: 1,
                    code: CodeBuilder::new()
                        .op_i8(Bipush, 100)
                        .op_i8(Bipush, 20)
                        .op_u8(Vstore, 0)
                        .op_u16(Invokestatic, 1)
                        .op(Iadd)
                        .op_u8(Vload, 0)
                        .op(Iadd)
                        .op(Return)
                        .finish(),
                },
                Function {
                    num_args: 0,
                    num_vars: 1,
                    code: CodeBuilder::new()
                        .op_i8(Bipush, 5)
                        .op_u8(Vstore, 0)
                        .op_u8(Vload, 0)
                        .op(Return)
                        .finish(),
                },
            ],
            ..Default::default()
        };
        assert_eq!(execute(&p, &NativeTable::new()), Ok(125));
    }

    #[test]
    fn test_invokestatic_unknown_function() {
        let code = CodeBuilder::new().op_u16(Invokestatic, 9).op(Return).finish();
        assert_eq!(run(code).unwrap_err().kind(), ErrorKind::Internal);
    }

    fn add_natives(_: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, VmError> {
        Ok(Value::Int(args.iter().map(|v| v.as_int()).sum()))
    }

    #[test]
    fn test_invokenative() {
        let mut natives = NativeTable::new();
        natives.register("noop", add_natives);
        let sum = natives.register("sum", add_natives);
        let p = Program {
            natives: vec![crate::vm::NativeInfo {
                num_args: 3,
                function_table_index: sum,
            }],
            ..program(
                CodeBuilder::new()
                    .op_i8(Bipush, 1)
                    .op_i8(Bipush, 2)
                    .op_i8(Bipush, 3)
                    .op_u16(Invokenative, 0)
                    .op(Return)
                    .finish(),
            )
        };
        let mut out = Vec::new();
        let mut vm = VM::with_output(&p, &natives, Box::new(&mut out)).unwrap();
        assert_eq!(vm.run(), Ok(6));
        assert_eq!(vm.stats().native_calls, 1);
    }

    #[test]
    fn test_stats_and_halt() {
        let p = program(CodeBuilder::new().op_u8(New, 8).op(Pop).op_i8(Bipush, 0).op(Return).finish());
        let natives = NativeTable::new();
        let mut vm = VM::with_output(&p, &natives, Box::new(io::sink())).unwrap();
        assert_eq!(vm.run(), Ok(0));
        let stats = vm.stats();
        assert_eq!(stats.instructions, 4);
        assert_eq!(stats.heap_objects, 2); // string pool + struct
        assert_eq!(vm.run().unwrap_err().kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_heap_limit_from_config() {
        let p = program(CodeBuilder::new().op_i8(Bipush, 100).op_i8(Newarray, 8).op(Return).finish());
        let natives = NativeTable::new();
        let config = RuntimeConfig {
            heap_limit: Some(256),
            ..Default::default()
        };
        let mut vm = VM::with_config(&p, &natives, &config, Box::new(io::sink())).unwrap();
        assert_eq!(vm.run().unwrap_err().kind(), ErrorKind::OutOfMemory);
    }

    #[test]
    fn test_empty_program() {
        let natives = NativeTable::new();
        assert!(VM::new(&Program::default(), &natives).is_err());
    }
}
