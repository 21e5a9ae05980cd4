//! Built-in natives for programs run from the command line.
//!
//! Covers console output and the string/char helpers C0 programs commonly
//! import. Native descriptors in a program refer to these by the indices
//! below.

use std::io::Write;

use crate::vm::{NativeContext, NativeTable, Value, VmError};

pub const PRINT: u16 = 0;
pub const PRINTLN: u16 = 1;
pub const PRINTINT: u16 = 2;
pub const PRINTBOOL: u16 = 3;
pub const PRINTCHAR: u16 = 4;
pub const FLUSH: u16 = 5;
pub const STRING_LENGTH: u16 = 6;
pub const STRING_CHARAT: u16 = 7;
pub const STRING_JOIN: u16 = 8;
pub const STRING_EQUAL: u16 = 9;
pub const CHAR_ORD: u16 = 10;
pub const CHAR_CHR: u16 = 11;

/// The dispatch table with every built-in registered at its index.
pub fn natives() -> NativeTable {
    let mut table = NativeTable::new();
    table.register("print", print);
    table.register("println", println);
    table.register("printint", printint);
    table.register("printbool", printbool);
    table.register("printchar", printchar);
    table.register("flush", flush);
    table.register("string_length", string_length);
    table.register("string_charat", string_charat);
    table.register("string_join", string_join);
    table.register("string_equal", string_equal);
    table.register("char_ord", char_ord);
    table.register("char_chr", char_chr);
    table
}

fn arg(args: &[Value], i: usize) -> Result<Value, VmError> {
    args.get(i)
        .copied()
        .ok_or_else(|| VmError::internal(format!("native expects argument {}", i)))
}

// =============================================================================
// Console
// =============================================================================

fn print(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, VmError> {
    let s = ctx.string(arg(args, 0)?)?.to_vec();
    ctx.write(&s)?;
    Ok(Value::Int(0))
}

fn println(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, VmError> {
    let mut s = ctx.string(arg(args, 0)?)?.to_vec();
    s.push(b'\n');
    ctx.write(&s)?;
    Ok(Value::Int(0))
}

fn printint(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, VmError> {
    let n = arg(args, 0)?.as_int();
    ctx.write(n.to_string().as_bytes())?;
    Ok(Value::Int(0))
}

fn printbool(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, VmError> {
    let b = arg(args, 0)?.as_int() != 0;
    let text: &[u8] = if b { b"true" } else { b"false" };
    ctx.write(text)?;
    Ok(Value::Int(0))
}

fn printchar(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, VmError> {
    let c = arg(args, 0)?.as_int();
    ctx.write(&[c as u8])?;
    Ok(Value::Int(0))
}

fn flush(ctx: &mut NativeContext<'_>, _args: &[Value]) -> Result<Value, VmError> {
    ctx.output
        .flush()
        .map_err(|e| VmError::internal(format!("io error: {}", e)))?;
    Ok(Value::Int(0))
}

// =============================================================================
// Strings and chars
// =============================================================================

fn string_length(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, VmError> {
    let len = ctx.string(arg(args, 0)?)?.len();
    Ok(Value::Int(len as i32))
}

fn string_charat(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, VmError> {
    let s = ctx.string(arg(args, 0)?)?;
    let index = arg(args, 1)?.as_int();
    let c = usize::try_from(index)
        .ok()
        .and_then(|i| s.get(i))
        .ok_or_else(|| {
            VmError::memory(format!(
                "string_charat: index {} out of bounds (length {})",
                index,
                s.len()
            ))
        })?;
    Ok(Value::Int(i32::from(*c as i8)))
}

fn string_join(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, VmError> {
    let mut joined = ctx.string(arg(args, 0)?)?.to_vec();
    joined.extend_from_slice(ctx.string(arg(args, 1)?)?);
    ctx.alloc_string(&joined)
}

fn string_equal(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, VmError> {
    let a = ctx.string(arg(args, 0)?)?;
    let b = ctx.string(arg(args, 1)?)?;
    Ok(Value::Int(i32::from(a == b)))
}

fn char_ord(_ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::Int(arg(args, 0)?.as_int()))
}

fn char_chr(_ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, VmError> {
    let n = arg(args, 0)?.as_int();
    if !(0..128).contains(&n) {
        return Err(VmError::Assertion(format!(
            "char_chr: {} is not an ASCII code",
            n
        )));
    }
    Ok(Value::Int(n))
}
