use std::fmt;

/// An address into the VM's linear heap memory.
///
/// Addresses are byte offsets into [`Heap`](super::Heap) memory. Offset 0 is
/// reserved and never handed out by the allocator, so it doubles as the null
/// pointer. Arithmetic on addresses wraps, exactly like raw pointer
/// arithmetic; whether the result points at anything is only checked when it
/// is dereferenced.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address(u64);

impl Address {
    pub const NULL: Address = Address(0);

    pub fn from_bits(bits: u64) -> Self {
        Address(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset this address by a signed number of bytes.
    pub fn offset(self, bytes: i64) -> Self {
        Address(self.0.wrapping_add_signed(bytes))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "NULL")
        } else {
            write!(f, "0x{:x}", self.0)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A tagged value: either a 32-bit integer or a pointer into the heap.
///
/// Both variants occupy one machine word in the original C0 semantics, and
/// the instruction set compares values by their raw bits. Use [`Value::bits`]
/// and [`Value::raw_eq`] for that; `==` on `Value` is the same bit equality.
#[derive(Clone, Copy)]
pub enum Value {
    Int(i32),
    Ptr(Address),
}

impl Value {
    pub fn null() -> Self {
        Value::Ptr(Address::NULL)
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self, Value::Ptr(_))
    }

    /// Unwrap an integer.
    ///
    /// The payload is reinterpreted without a tag check in release builds.
    pub fn as_int(&self) -> i32 {
        match *self {
            Value::Int(n) => n,
            Value::Ptr(a) => {
                debug_assert!(false, "expected int, found pointer {a}");
                a.bits() as u32 as i32
            }
        }
    }

    /// Unwrap a pointer.
    ///
    /// Integer 0 is accepted as null since locals start out zeroed. Any other
    /// integer is reinterpreted without a tag check in release builds.
    pub fn as_ptr(&self) -> Address {
        match *self {
            Value::Ptr(a) => a,
            Value::Int(n) => {
                debug_assert!(n == 0, "expected pointer, found int {n}");
                Address::from_bits(u64::from(n as u32))
            }
        }
    }

    /// The raw one-word representation of this value.
    pub fn bits(&self) -> u64 {
        match *self {
            Value::Int(n) => u64::from(n as u32),
            Value::Ptr(a) => a.bits(),
        }
    }

    /// Bit-level equality, independent of tag.
    pub fn raw_eq(&self, other: &Value) -> bool {
        self.bits() == other.bits()
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Ptr(_) => "pointer",
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Int(0)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.raw_eq(other)
    }
}

impl Eq for Value {}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n)
    }
}

impl From<Address> for Value {
    fn from(a: Address) -> Self {
        Value::Ptr(a)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Ptr(a) => write!(f, "Ptr({:?})", a),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Ptr(a) => write!(f, "{}", a),
        }
    }
}
