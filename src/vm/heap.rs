use super::{Address, VmError};

// =============================================================================
// Memory Layout
// =============================================================================
//
// The heap is one linear, growable byte buffer. Addresses are byte offsets
// into it, so pointer arithmetic is plain integer arithmetic and a pointer
// stored in memory is just its offset written as a little-endian u64.
//
// +------------------+--------+--------+-----+
// | null guard (16B) | obj 0  | obj 1  | ... |
// +------------------+--------+--------+-----+
//
// - The null guard is never handed out and can never be read or written, so
//   address 0 is a valid null pointer and any access near it faults.
// - Every allocation starts on an 8-byte boundary and is zero-filled.
// - Every allocation takes at least one byte, so no two objects share an
//   address, even zero-sized ones.
// - Nothing is ever freed.
//
// Array record (16 bytes), referenced by the value NEWARRAY pushes:
// +-------------+-----------------+------------------+
// | count (i32) | elem_size (i32) | elems (u64 addr) |
// +-------------+-----------------+------------------+

/// Bytes reserved at address 0.
const NULL_GUARD: usize = 16;
/// Alignment of every allocation.
const ALIGN: usize = 8;

/// Size of an `int` cell.
pub const INT_SIZE: usize = 4;
/// Size of a pointer cell.
pub const PTR_SIZE: usize = 8;
/// Size of the record an array handle points at.
pub const ARRAY_HEADER_SIZE: usize = 16;

/// Decoded array record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayHeader {
    pub count: i32,
    pub elem_size: i32,
    pub elems: Address,
}

/// The heap object model: struct and array allocation plus typed access to
/// memory cells.
///
/// All address arithmetic in the VM goes through this type. Accessing a
/// non-null address that does not lie inside allocated memory is reported as
/// an internal error (the safe equivalent of a segmentation fault); null
/// checks required by the instruction set are memory errors.
#[derive(Debug)]
pub struct Heap {
    memory: Vec<u8>,
    heap_limit: Option<usize>,
    object_count: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::new_with_limit(None)
    }

    /// Create a heap that refuses to grow past `heap_limit` allocated bytes.
    pub fn new_with_limit(heap_limit: Option<usize>) -> Self {
        Self {
            memory: vec![0; NULL_GUARD],
            heap_limit,
            object_count: 0,
        }
    }

    /// Total bytes handed out so far, including alignment padding.
    pub fn bytes_allocated(&self) -> usize {
        self.memory.len() - NULL_GUARD
    }

    /// Number of allocations performed so far.
    pub fn object_count(&self) -> usize {
        self.object_count
    }

    fn alloc_bytes(&mut self, size: usize) -> Result<Address, VmError> {
        let out_of_memory = VmError::OutOfMemory {
            requested: size as i64,
            limit: self.heap_limit,
        };
        let start = self.memory.len().next_multiple_of(ALIGN);
        let end = start
            .checked_add(size.max(1))
            .filter(|&end| end <= isize::MAX as usize)
            .ok_or_else(|| out_of_memory.clone())?;

        if let Some(limit) = self.heap_limit {
            if end - NULL_GUARD > limit {
                return Err(out_of_memory);
            }
        }

        self.memory
            .try_reserve(end - self.memory.len())
            .map_err(|_| out_of_memory)?;
        self.memory.resize(end, 0);
        self.object_count += 1;

        tracing::debug!(address = start, size, "heap alloc");
        Ok(Address::from_bits(start as u64))
    }

    /// Allocate a zeroed struct of `size` bytes.
    pub fn alloc_struct(&mut self, size: u8) -> Result<Address, VmError> {
        self.alloc_bytes(usize::from(size))
    }

    /// Allocate an array of `count` zeroed elements of `elem_size` bytes and
    /// return the address of its record.
    ///
    /// Neither argument is validated; a negative total size simply cannot be
    /// allocated.
    pub fn alloc_array(&mut self, elem_size: i32, count: i32) -> Result<Address, VmError> {
        // Two negative arguments give a positive total and a negative count;
        // element access then rejects every index.
        let total = i64::from(elem_size) * i64::from(count);
        let Ok(size) = usize::try_from(total) else {
            return Err(VmError::OutOfMemory {
                requested: total,
                limit: self.heap_limit,
            });
        };

        let header = self.alloc_bytes(ARRAY_HEADER_SIZE)?;
        let elems = self.alloc_bytes(size)?;

        let record = self.slice_mut(header, ARRAY_HEADER_SIZE)?;
        record[0..4].copy_from_slice(&count.to_le_bytes());
        record[4..8].copy_from_slice(&elem_size.to_le_bytes());
        record[8..16].copy_from_slice(&elems.bits().to_le_bytes());
        Ok(header)
    }

    /// Copy `data` into a fresh allocation.
    pub fn alloc_data(&mut self, data: &[u8]) -> Result<Address, VmError> {
        let addr = self.alloc_bytes(data.len())?;
        self.slice_mut(addr, data.len())?.copy_from_slice(data);
        Ok(addr)
    }

    /// Allocate a NUL-terminated copy of `s`.
    pub fn alloc_c_string(&mut self, s: &[u8]) -> Result<Address, VmError> {
        let addr = self.alloc_bytes(s.len() + 1)?;
        self.slice_mut(addr, s.len())?.copy_from_slice(s);
        Ok(addr)
    }

    // =========================================================================
    // Address arithmetic
    // =========================================================================

    /// `base + offset`, for struct field access.
    pub fn field_address(&self, base: Address, offset: i8) -> Result<Address, VmError> {
        if base.is_null() {
            return Err(null_dereference());
        }
        Ok(base.offset(i64::from(offset)))
    }

    /// Read the record of the array at `array`.
    ///
    /// No null check: a null handle reads the guard region and faults.
    pub fn array_header(&self, array: Address) -> Result<ArrayHeader, VmError> {
        let record = self.slice(array, ARRAY_HEADER_SIZE)?;
        let count = i32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        let elem_size = i32::from_le_bytes([record[4], record[5], record[6], record[7]]);
        let mut elems = [0; 8];
        elems.copy_from_slice(&record[8..16]);
        Ok(ArrayHeader {
            count,
            elem_size,
            elems: Address::from_bits(u64::from_le_bytes(elems)),
        })
    }

    pub fn array_length(&self, array: Address) -> Result<i32, VmError> {
        Ok(self.array_header(array)?.count)
    }

    /// Address of element `index`, bounds-checked against the array's count.
    pub fn element_address(&self, array: Address, index: i32) -> Result<Address, VmError> {
        if array.is_null() {
            return Err(null_dereference());
        }
        let header = self.array_header(array)?;
        if index < 0 || index >= header.count {
            return Err(VmError::memory(format!(
                "array index {} out of bounds (length {})",
                index, header.count
            )));
        }
        Ok(header
            .elems
            .offset(i64::from(index) * i64::from(header.elem_size)))
    }

    // =========================================================================
    // Typed cell access
    // =========================================================================

    pub fn load_int(&self, addr: Address) -> Result<i32, VmError> {
        let bytes = self.checked_slice(addr, INT_SIZE)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn store_int(&mut self, addr: Address, value: i32) -> Result<(), VmError> {
        self.checked_slice_mut(addr, INT_SIZE)?
            .copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn load_ptr(&self, addr: Address) -> Result<Address, VmError> {
        let bytes = self.checked_slice(addr, PTR_SIZE)?;
        let mut word = [0; PTR_SIZE];
        word.copy_from_slice(bytes);
        Ok(Address::from_bits(u64::from_le_bytes(word)))
    }

    pub fn store_ptr(&mut self, addr: Address, value: Address) -> Result<(), VmError> {
        self.checked_slice_mut(addr, PTR_SIZE)?
            .copy_from_slice(&value.bits().to_le_bytes());
        Ok(())
    }

    /// Load a character cell, sign-extended like a C `char`.
    pub fn load_char(&self, addr: Address) -> Result<i32, VmError> {
        let bytes = self.checked_slice(addr, 1)?;
        Ok(i32::from(bytes[0] as i8))
    }

    /// Store the low 7 bits of `value` into a character cell.
    pub fn store_char(&mut self, addr: Address, value: i32) -> Result<(), VmError> {
        self.checked_slice_mut(addr, 1)?[0] = (value & 0x7F) as u8;
        Ok(())
    }

    /// Read the NUL-terminated string starting at `addr` (terminator excluded).
    pub fn read_c_string(&self, addr: Address) -> Result<&[u8], VmError> {
        if addr.is_null() {
            return Err(null_dereference());
        }
        let start = self.resolve(addr, 0)?;
        let tail = &self.memory[start..];
        let len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| VmError::internal(format!("unterminated string at {}", addr)))?;
        Ok(&tail[..len])
    }

    // =========================================================================
    // Raw access
    // =========================================================================

    /// Translate `addr..addr+len` into a range of `memory`, faulting if it
    /// touches the guard region or runs past the end of the heap.
    fn resolve(&self, addr: Address, len: usize) -> Result<usize, VmError> {
        usize::try_from(addr.bits())
            .ok()
            .filter(|&start| start >= NULL_GUARD)
            .filter(|&start| {
                start
                    .checked_add(len)
                    .is_some_and(|end| end <= self.memory.len())
            })
            .ok_or_else(|| {
                VmError::internal(format!(
                    "segmentation fault: invalid {}-byte access at {}",
                    len, addr
                ))
            })
    }

    fn slice(&self, addr: Address, len: usize) -> Result<&[u8], VmError> {
        let start = self.resolve(addr, len)?;
        Ok(&self.memory[start..start + len])
    }

    fn slice_mut(&mut self, addr: Address, len: usize) -> Result<&mut [u8], VmError> {
        let start = self.resolve(addr, len)?;
        Ok(&mut self.memory[start..start + len])
    }

    fn checked_slice(&self, addr: Address, len: usize) -> Result<&[u8], VmError> {
        if addr.is_null() {
            return Err(null_dereference());
        }
        self.slice(addr, len)
    }

    fn checked_slice_mut(&mut self, addr: Address, len: usize) -> Result<&mut [u8], VmError> {
        if addr.is_null() {
            return Err(null_dereference());
        }
        self.slice_mut(addr, len)
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

fn null_dereference() -> VmError {
    VmError::memory("null pointer dereference")
}
