use std::fmt;

/// The category of a fatal VM error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Division by zero, `INT_MIN / -1`, or an out-of-range shift.
    Arithmetic,
    /// Null dereference or out-of-bounds array index.
    Memory,
    /// `ASSERT` with a false condition.
    Assertion,
    /// `ATHROW` (a C0 `error(...)` statement).
    User,
    /// The program is malformed or incompatible with this VM.
    Internal,
    /// The allocator could not satisfy a request.
    OutOfMemory,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Arithmetic => "arithmetic error",
            ErrorKind::Memory => "memory error",
            ErrorKind::Assertion => "assertion failed",
            ErrorKind::User => "error",
            ErrorKind::Internal => "internal error",
            ErrorKind::OutOfMemory => "out of memory",
        }
    }

    /// Process exit status used when a run ends with this kind of error.
    ///
    /// Mirrors the signal a native C0 program dies with (128 + signo), except
    /// for user errors which exit with status 1.
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::User => 1,
            ErrorKind::Assertion | ErrorKind::Internal => 134,
            ErrorKind::Arithmetic => 136,
            ErrorKind::OutOfMemory => 137,
            ErrorKind::Memory => 139,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fatal error raised while executing a program.
///
/// Every error is unrecoverable: the interpreter stops at the instruction
/// that raised it and returns the error to its caller exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    Arithmetic(String),
    Memory(String),
    Assertion(String),
    User(String),
    Internal(String),
    OutOfMemory { requested: i64, limit: Option<usize> },
}

impl VmError {
    pub fn arithmetic(msg: impl Into<String>) -> Self {
        VmError::Arithmetic(msg.into())
    }

    pub fn memory(msg: impl Into<String>) -> Self {
        VmError::Memory(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        VmError::Internal(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::Arithmetic(_) => ErrorKind::Arithmetic,
            VmError::Memory(_) => ErrorKind::Memory,
            VmError::Assertion(_) => ErrorKind::Assertion,
            VmError::User(_) => ErrorKind::User,
            VmError::Internal(_) => ErrorKind::Internal,
            VmError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
        }
    }

    /// The human-readable message, without the kind prefix.
    pub fn message(&self) -> String {
        match self {
            VmError::Arithmetic(m)
            | VmError::Memory(m)
            | VmError::Assertion(m)
            | VmError::User(m)
            | VmError::Internal(m) => m.clone(),
            VmError::OutOfMemory {
                requested,
                limit: Some(limit),
            } => format!(
                "cannot allocate {} bytes (heap limit {} bytes)",
                requested, limit
            ),
            VmError::OutOfMemory {
                requested,
                limit: None,
            } => format!("cannot allocate {} bytes", requested),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.kind().exit_code()
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl std::error::Error for VmError {}
