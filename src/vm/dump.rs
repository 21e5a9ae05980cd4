//! Human-readable listing of a loaded program.

use std::fmt::Write as _;

use super::{Opcode, Program};

/// Disassemble every function of `program`, preceded by its pools.
pub fn disassemble(program: &Program) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "== Int Pool ({} entries) ==", program.int_pool.len());
    for (i, n) in program.int_pool.iter().enumerate() {
        let _ = writeln!(out, "  #{}: {}", i, n);
    }

    let _ = writeln!(out, "== String Pool ({} bytes) ==", program.string_pool.len());
    let mut offset = 0;
    for chunk in program.string_pool.split_inclusive(|&b| b == 0) {
        let text = String::from_utf8_lossy(chunk.strip_suffix(b"\0").unwrap_or(chunk));
        let _ = writeln!(out, "  @{}: {:?}", offset, text);
        offset += chunk.len();
    }

    let _ = writeln!(out, "== Natives ({} entries) ==", program.natives.len());
    for (i, native) in program.natives.iter().enumerate() {
        let _ = writeln!(
            out,
            "  native {}: {} args -> table[{}]",
            i, native.num_args, native.function_table_index
        );
    }

    for (index, func) in program.functions.iter().enumerate() {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "== Function {} (args: {}, vars: {}, {} bytes) ==",
            index,
            func.num_args,
            func.num_vars,
            func.code.len()
        );
        disassemble_code(&mut out, &func.code);
    }

    out
}

/// Disassemble one function body.
pub fn disassemble_code(out: &mut String, code: &[u8]) {
    let mut pc = 0;
    while pc < code.len() {
        let Some(op) = Opcode::from_byte(code[pc]) else {
            let _ = writeln!(out, "{:04}: .byte 0x{:02x}", pc, code[pc]);
            pc += 1;
            continue;
        };

        let operands = &code[pc + 1..code.len().min(pc + 1 + op.operand_len())];
        if operands.len() < op.operand_len() {
            let _ = writeln!(out, "{:04}: {} <truncated>", pc, op.mnemonic());
            break;
        }

        let _ = match operands {
            [] => writeln!(out, "{:04}: {}", pc, op.mnemonic()),
            [b] => {
                let operand = match op {
                    Opcode::Bipush | Opcode::Newarray | Opcode::Aaddf => (*b as i8).to_string(),
                    _ => b.to_string(),
                };
                writeln!(out, "{:04}: {} {}", pc, op.mnemonic(), operand)
            }
            [hi, lo] => {
                let raw = u16::from_be_bytes([*hi, *lo]);
                if op.is_branch() {
                    let offset = raw as i16;
                    let target = pc as i64 + i64::from(offset);
                    writeln!(out, "{:04}: {} {:+} -> {}", pc, op.mnemonic(), offset, target)
                } else {
                    writeln!(out, "{:04}: {} {}", pc, op.mnemonic(), raw)
                }
            }
            _ => Ok(()),
        };
        pc += 1 + op.operand_len();
    }
}
