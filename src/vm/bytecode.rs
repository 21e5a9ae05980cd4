//! Reading and writing C0 bytecode.
//!
//! `.bc0` files are text: whitespace-separated hex byte pairs, with `#`
//! starting a comment that runs to the end of the line. The decoded bytes
//! have this layout (all multi-byte fields big-endian):
//!
//! - Magic: `C0 C0 FF EE`
//! - Version word: u16, `version << 1 | arch` (arch 1 = 64-bit)
//! - Int pool: u16 count, then 4-byte ints
//! - String pool: u16 size, then that many bytes
//! - Functions: u16 count, then `{u16 num_args, u16 num_vars, u16 code_length, code}`
//! - Natives: u16 count, then `{u16 num_args, u16 function_table_index}`

use std::fmt::Write as _;
use std::io::{self, Read};
use std::path::Path;

use super::{Function, NativeInfo, Opcode, Program};

/// Magic bytes at the start of every program.
pub const MAGIC: [u8; 4] = [0xC0, 0xC0, 0xFF, 0xEE];

/// Bytecode version written by [`serialize`].
pub const VERSION: u16 = 11;

/// Architecture bit for 64-bit pointers.
pub const ARCH_64: u16 = 1;

/// Error type for bytecode operations
#[derive(Debug)]
pub enum BytecodeError {
    /// Invalid magic number
    InvalidMagic([u8; 4]),
    /// Truncated data
    UnexpectedEof,
    /// Bytes left over after the native pool
    TrailingBytes(usize),
    /// A token in a `.bc0` file that is not a hex byte
    InvalidHex { line: usize, token: String },
    /// I/O error
    Io(io::Error),
}

impl From<io::Error> for BytecodeError {
    fn from(e: io::Error) -> Self {
        BytecodeError::Io(e)
    }
}

impl std::fmt::Display for BytecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BytecodeError::InvalidMagic(m) => write!(
                f,
                "invalid magic number: {:02X} {:02X} {:02X} {:02X}",
                m[0], m[1], m[2], m[3]
            ),
            BytecodeError::UnexpectedEof => write!(f, "unexpected end of file"),
            BytecodeError::TrailingBytes(n) => {
                write!(f, "{} unexpected bytes after the native pool", n)
            }
            BytecodeError::InvalidHex { line, token } => {
                write!(f, "line {}: invalid hex byte '{}'", line, token)
            }
            BytecodeError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for BytecodeError {}

// =============================================================================
// Loading
// =============================================================================

/// Load a `.bc0` file.
pub fn load_file(path: impl AsRef<Path>) -> Result<Program, BytecodeError> {
    let text = std::fs::read_to_string(path)?;
    parse_bc0(&text)
}

/// Parse the text of a `.bc0` file.
pub fn parse_bc0(text: &str) -> Result<Program, BytecodeError> {
    deserialize(&decode_hex(text)?)
}

/// Turn `.bc0` text into raw bytes.
pub fn decode_hex(text: &str) -> Result<Vec<u8>, BytecodeError> {
    let mut bytes = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let code = line.split('#').next().unwrap_or_default();
        for token in code.split_whitespace() {
            if token.len() != 2 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(BytecodeError::InvalidHex {
                    line: n + 1,
                    token: token.to_string(),
                });
            }
            bytes.push(u8::from_str_radix(token, 16).unwrap_or_default());
        }
    }
    Ok(bytes)
}

/// Decode a program from raw bytes.
pub fn deserialize(data: &[u8]) -> Result<Program, BytecodeError> {
    let mut r = data;

    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    if magic != MAGIC {
        return Err(BytecodeError::InvalidMagic(magic));
    }

    let word = read_u16(&mut r)?;
    let (version, arch) = (word >> 1, word & 1);
    if arch != ARCH_64 {
        tracing::warn!(version, arch, "bytecode was not compiled for 64-bit pointers");
    }

    let int_count = read_u16(&mut r)?;
    let mut int_pool = Vec::with_capacity(usize::from(int_count));
    for _ in 0..int_count {
        int_pool.push(read_i32(&mut r)?);
    }

    let string_size = read_u16(&mut r)?;
    let string_pool = read_bytes(&mut r, usize::from(string_size))?;

    let function_count = read_u16(&mut r)?;
    let mut functions = Vec::with_capacity(usize::from(function_count));
    for _ in 0..function_count {
        let num_args = read_u16(&mut r)?;
        let num_vars = read_u16(&mut r)?;
        let code_length = read_u16(&mut r)?;
        let code = read_bytes(&mut r, usize::from(code_length))?;
        functions.push(Function {
            num_args,
            num_vars,
            code,
        });
    }

    let native_count = read_u16(&mut r)?;
    let mut natives = Vec::with_capacity(usize::from(native_count));
    for _ in 0..native_count {
        let num_args = read_u16(&mut r)?;
        let function_table_index = read_u16(&mut r)?;
        natives.push(NativeInfo {
            num_args,
            function_table_index,
        });
    }

    if !r.is_empty() {
        return Err(BytecodeError::TrailingBytes(r.len()));
    }

    tracing::debug!(
        version,
        functions = functions.len(),
        natives = natives.len(),
        "loaded bytecode"
    );

    Ok(Program {
        int_pool,
        string_pool,
        functions,
        natives,
    })
}

fn read_u16<R: Read>(r: &mut R) -> Result<u16, BytecodeError> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32, BytecodeError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(i32::from_be_bytes(buf))
}

fn read_bytes<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>, BytecodeError> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(buf)
}

// =============================================================================
// Writing
// =============================================================================

/// Encode a program as raw bytes.
pub fn serialize(program: &Program) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&(VERSION << 1 | ARCH_64).to_be_bytes());

    write_u16(&mut buf, program.int_pool.len());
    for n in &program.int_pool {
        buf.extend_from_slice(&n.to_be_bytes());
    }

    write_u16(&mut buf, program.string_pool.len());
    buf.extend_from_slice(&program.string_pool);

    write_u16(&mut buf, program.functions.len());
    for func in &program.functions {
        buf.extend_from_slice(&func.num_args.to_be_bytes());
        buf.extend_from_slice(&func.num_vars.to_be_bytes());
        write_u16(&mut buf, func.code.len());
        buf.extend_from_slice(&func.code);
    }

    write_u16(&mut buf, program.natives.len());
    for native in &program.natives {
        buf.extend_from_slice(&native.num_args.to_be_bytes());
        buf.extend_from_slice(&native.function_table_index.to_be_bytes());
    }
    buf
}

/// Pools larger than a u16 can count are truncated; such programs cannot be
/// expressed in the format.
fn write_u16(buf: &mut Vec<u8>, n: usize) {
    buf.extend_from_slice(&(n as u16).to_be_bytes());
}

/// Render a program as annotated `.bc0` text.
///
/// Each section starts on its own commented line and every instruction of a
/// function body gets a line with its mnemonic, so the output stays readable
/// and parses back to the same program.
pub fn write_bc0(program: &Program) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "C0 C0 FF EE       # magic number");
    let _ = writeln!(
        out,
        "{}       # version {}, arch = {} (64 bits)",
        hex(&(VERSION << 1 | ARCH_64).to_be_bytes()),
        VERSION,
        ARCH_64
    );

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{}             # int pool count",
        hex(&(program.int_pool.len() as u16).to_be_bytes())
    );
    for n in &program.int_pool {
        let _ = writeln!(out, "{}       # {}", hex(&n.to_be_bytes()), n);
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{}             # string pool total size",
        hex(&(program.string_pool.len() as u16).to_be_bytes())
    );
    for chunk in program.string_pool.split_inclusive(|&b| b == 0) {
        let text = String::from_utf8_lossy(chunk.strip_suffix(b"\0").unwrap_or(chunk));
        let _ = writeln!(out, "{}  # {:?}", hex(chunk), text);
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{}             # function count",
        hex(&(program.functions.len() as u16).to_be_bytes())
    );
    for (index, func) in program.functions.iter().enumerate() {
        let _ = writeln!(out);
        let _ = writeln!(out, "# function {}", index);
        let _ = writeln!(out, "{}             # number of arguments", hex(&func.num_args.to_be_bytes()));
        let _ = writeln!(out, "{}             # number of local variables", hex(&func.num_vars.to_be_bytes()));
        let _ = writeln!(
            out,
            "{}             # code length = {} bytes",
            hex(&(func.code.len() as u16).to_be_bytes()),
            func.code.len()
        );
        write_code(&mut out, &func.code);
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{}             # native count",
        hex(&(program.natives.len() as u16).to_be_bytes())
    );
    for native in &program.natives {
        let _ = writeln!(
            out,
            "{} {}       # {} args, table index {}",
            hex(&native.num_args.to_be_bytes()),
            hex(&native.function_table_index.to_be_bytes()),
            native.num_args,
            native.function_table_index
        );
    }
    out
}

fn write_code(out: &mut String, code: &[u8]) {
    let mut pc = 0;
    while pc < code.len() {
        let len = Opcode::from_byte(code[pc])
            .map(|op| 1 + op.operand_len())
            .unwrap_or(1)
            .min(code.len() - pc);
        let bytes = &code[pc..pc + len];
        let comment = match Opcode::from_byte(code[pc]) {
            Some(op) => op.mnemonic().to_string(),
            None => format!(".byte 0x{:02x}", code[pc]),
        };
        let _ = writeln!(out, "{:<18}# {:>4}: {}", hex(bytes), pc, comment);
        pc += len;
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

// =============================================================================
// Code builder
// =============================================================================

/// A forward branch whose offset is filled in later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Patch {
    at: usize,
}

/// Assembles a function body one instruction at a time.
#[derive(Debug, Default, Clone)]
pub struct CodeBuilder {
    code: Vec<u8>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Position the next instruction will be emitted at.
    pub fn pos(&self) -> usize {
        self.code.len()
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.code.push(op.byte());
        self
    }

    pub fn op_u8(&mut self, op: Opcode, operand: u8) -> &mut Self {
        self.op(op);
        self.code.push(operand);
        self
    }

    pub fn op_i8(&mut self, op: Opcode, operand: i8) -> &mut Self {
        self.op_u8(op, operand as u8)
    }

    pub fn op_u16(&mut self, op: Opcode, operand: u16) -> &mut Self {
        self.op(op);
        self.code.extend_from_slice(&operand.to_be_bytes());
        self
    }

    pub fn op_i16(&mut self, op: Opcode, operand: i16) -> &mut Self {
        self.op_u16(op, operand as u16)
    }

    /// Emit a branch to an already emitted position.
    pub fn branch_to(&mut self, op: Opcode, target: usize) -> &mut Self {
        let offset = target as i64 - self.pos() as i64;
        self.op_i16(op, offset as i16)
    }

    /// Emit a branch whose target is not known yet.
    pub fn forward(&mut self, op: Opcode) -> Patch {
        let at = self.pos();
        self.op_i16(op, 0);
        Patch { at }
    }

    /// Point a forward branch at the current position.
    pub fn patch_here(&mut self, patch: Patch) -> &mut Self {
        let offset = (self.pos() - patch.at) as i16;
        self.code[patch.at + 1..patch.at + 3].copy_from_slice(&offset.to_be_bytes());
        self
    }

    pub fn finish(&self) -> Vec<u8> {
        self.code.clone()
    }
}
