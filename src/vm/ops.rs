/// Opcodes of the C0 virtual machine.
///
/// Every instruction is one opcode byte followed by a fixed number of operand
/// bytes (see [`Opcode::operand_len`]). Multi-byte operands are big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // ========================================
    // Stack Manipulation
    // ========================================
    Pop = 0x57,
    Dup = 0x59,
    Swap = 0x5F,

    // ========================================
    // Arithmetic
    // ========================================
    Iadd = 0x60,
    Isub = 0x64,
    Imul = 0x68,
    Idiv = 0x6C,
    Irem = 0x70,
    Iand = 0x7E,
    Ior = 0x80,
    Ixor = 0x82,
    Ishl = 0x78,
    Ishr = 0x7A,

    // ========================================
    // Constants
    // ========================================
    Bipush = 0x10,
    Ildc = 0x13,
    Aldc = 0x14,
    AconstNull = 0x01,

    // ========================================
    // Local Variables
    // ========================================
    Vload = 0x15,
    Vstore = 0x36,

    // ========================================
    // Assertions and Errors
    // ========================================
    Athrow = 0xBF,
    Assert = 0xCF,

    // ========================================
    // Control Flow
    // ========================================
    Nop = 0x00,
    IfCmpeq = 0x9F,
    IfCmpne = 0xA0,
    IfIcmplt = 0xA1,
    IfIcmpge = 0xA2,
    IfIcmpgt = 0xA3,
    IfIcmple = 0xA4,
    Goto = 0xA7,

    // ========================================
    // Functions
    // ========================================
    Invokestatic = 0xB8,
    Invokenative = 0xB7,
    Return = 0xB0,

    // ========================================
    // Heap Operations
    // ========================================
    New = 0xBB,
    Newarray = 0xBC,
    Arraylength = 0xBE,
    Aaddf = 0x62,
    Aadds = 0x63,

    // ========================================
    // Memory Access
    // ========================================
    Imload = 0x2E,
    Imstore = 0x4E,
    Amload = 0x2F,
    Amstore = 0x4F,
    Cmload = 0x34,
    Cmstore = 0x55,
}

impl Opcode {
    pub const ALL: [Opcode; 43] = [
        Opcode::Pop,
        Opcode::Dup,
        Opcode::Swap,
        Opcode::Iadd,
        Opcode::Isub,
        Opcode::Imul,
        Opcode::Idiv,
        Opcode::Irem,
        Opcode::Iand,
        Opcode::Ior,
        Opcode::Ixor,
        Opcode::Ishl,
        Opcode::Ishr,
        Opcode::Bipush,
        Opcode::Ildc,
        Opcode::Aldc,
        Opcode::AconstNull,
        Opcode::Vload,
        Opcode::Vstore,
        Opcode::Athrow,
        Opcode::Assert,
        Opcode::Nop,
        Opcode::IfCmpeq,
        Opcode::IfCmpne,
        Opcode::IfIcmplt,
        Opcode::IfIcmpge,
        Opcode::IfIcmpgt,
        Opcode::IfIcmple,
        Opcode::Goto,
        Opcode::Invokestatic,
        Opcode::Invokenative,
        Opcode::Return,
        Opcode::New,
        Opcode::Newarray,
        Opcode::Arraylength,
        Opcode::Aaddf,
        Opcode::Aadds,
        Opcode::Imload,
        Opcode::Imstore,
        Opcode::Amload,
        Opcode::Amstore,
        Opcode::Cmload,
        Opcode::Cmstore,
    ];

    /// Decode an opcode byte.
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        let op = match byte {
            0x57 => Opcode::Pop,
            0x59 => Opcode::Dup,
            0x5F => Opcode::Swap,
            0x60 => Opcode::Iadd,
            0x64 => Opcode::Isub,
            0x68 => Opcode::Imul,
            0x6C => Opcode::Idiv,
            0x70 => Opcode::Irem,
            0x7E => Opcode::Iand,
            0x80 => Opcode::Ior,
            0x82 => Opcode::Ixor,
            0x78 => Opcode::Ishl,
            0x7A => Opcode::Ishr,
            0x10 => Opcode::Bipush,
            0x13 => Opcode::Ildc,
            0x14 => Opcode::Aldc,
            0x01 => Opcode::AconstNull,
            0x15 => Opcode::Vload,
            0x36 => Opcode::Vstore,
            0xBF => Opcode::Athrow,
            0xCF => Opcode::Assert,
            0x00 => Opcode::Nop,
            0x9F => Opcode::IfCmpeq,
            0xA0 => Opcode::IfCmpne,
            0xA1 => Opcode::IfIcmplt,
            0xA2 => Opcode::IfIcmpge,
            0xA3 => Opcode::IfIcmpgt,
            0xA4 => Opcode::IfIcmple,
            0xA7 => Opcode::Goto,
            0xB8 => Opcode::Invokestatic,
            0xB7 => Opcode::Invokenative,
            0xB0 => Opcode::Return,
            0xBB => Opcode::New,
            0xBC => Opcode::Newarray,
            0xBE => Opcode::Arraylength,
            0x62 => Opcode::Aaddf,
            0x63 => Opcode::Aadds,
            0x2E => Opcode::Imload,
            0x4E => Opcode::Imstore,
            0x2F => Opcode::Amload,
            0x4F => Opcode::Amstore,
            0x34 => Opcode::Cmload,
            0x55 => Opcode::Cmstore,
            _ => return None,
        };
        Some(op)
    }

    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Number of operand bytes following the opcode.
    pub fn operand_len(self) -> usize {
        match self {
            Opcode::Bipush
            | Opcode::Vload
            | Opcode::Vstore
            | Opcode::New
            | Opcode::Newarray
            | Opcode::Aaddf => 1,
            Opcode::Ildc
            | Opcode::Aldc
            | Opcode::IfCmpeq
            | Opcode::IfCmpne
            | Opcode::IfIcmplt
            | Opcode::IfIcmpge
            | Opcode::IfIcmpgt
            | Opcode::IfIcmple
            | Opcode::Goto
            | Opcode::Invokestatic
            | Opcode::Invokenative => 2,
            _ => 0,
        }
    }

    /// Whether the two operand bytes are a relative branch offset.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::IfCmpeq
                | Opcode::IfCmpne
                | Opcode::IfIcmplt
                | Opcode::IfIcmpge
                | Opcode::IfIcmpgt
                | Opcode::IfIcmple
                | Opcode::Goto
        )
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Pop => "pop",
            Opcode::Dup => "dup",
            Opcode::Swap => "swap",
            Opcode::Iadd => "iadd",
            Opcode::Isub => "isub",
            Opcode::Imul => "imul",
            Opcode::Idiv => "idiv",
            Opcode::Irem => "irem",
            Opcode::Iand => "iand",
            Opcode::Ior => "ior",
            Opcode::Ixor => "ixor",
            Opcode::Ishl => "ishl",
            Opcode::Ishr => "ishr",
            Opcode::Bipush => "bipush",
            Opcode::Ildc => "ildc",
            Opcode::Aldc => "aldc",
            Opcode::AconstNull => "aconst_null",
            Opcode::Vload => "vload",
            Opcode::Vstore => "vstore",
            Opcode::Athrow => "athrow",
            Opcode::Assert => "assert",
            Opcode::Nop => "nop",
            Opcode::IfCmpeq => "if_cmpeq",
            Opcode::IfCmpne => "if_cmpne",
            Opcode::IfIcmplt => "if_icmplt",
            Opcode::IfIcmpge => "if_icmpge",
            Opcode::IfIcmpgt => "if_icmpgt",
            Opcode::IfIcmple => "if_icmple",
            Opcode::Goto => "goto",
            Opcode::Invokestatic => "invokestatic",
            Opcode::Invokenative => "invokenative",
            Opcode::Return => "return",
            Opcode::New => "new",
            Opcode::Newarray => "newarray",
            Opcode::Arraylength => "arraylength",
            Opcode::Aaddf => "aaddf",
            Opcode::Aadds => "aadds",
            Opcode::Imload => "imload",
            Opcode::Imstore => "imstore",
            Opcode::Amload => "amload",
            Opcode::Amstore => "amstore",
            Opcode::Cmload => "cmload",
            Opcode::Cmstore => "cmstore",
        }
    }
}
