//! Value representation using tagged words (64-bit)
//!
//! Values are stored in a single 64-bit word. The lowest 3 bits are the
//! type tag; the tag of any value is recovered by masking alone.
//!
//! # Encoding Strategy
//!
//! ```text
//! Pointer:  cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc000
//! Double:   cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc001
//! String:   cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc010
//! Integer:  iiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiiii011
//! false:    0000000000000000000000000000000000000000000000000000000000000100
//! true:     0000000000000000000000000000000000000000000000000000000000001100
//! null:     0000000000000000000000000000000000000000000000000000000000000000
//! ```
//!
//! `c` is a packed [`CellRef`]. A pointer-tagged value does not name the
//! object directly: it names a one-word *pointer cell* whose content holds
//! the target handle and a 2-bit [`PtrKind`]. Doubles do not fit in a
//! tagged word, so they live in a pointer-free Double cell.

use crate::handle::CellRef;
use crate::{GcError, GcResult};
use std::fmt;

/// Type tag stored in the low bits of a [`Value`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Reference to a pointer cell (or null)
    Ptr,
    /// Reference to a Double cell
    Double,
    /// Reference to a String cell
    String,
    /// Small integer immediate
    Int,
    /// Boolean immediate
    Bool,
}

/// Kind of object a pointer cell refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PtrKind {
    /// Plain object
    Object = 0,
    /// Function closure
    Closure = 1,
    /// Array
    Array = 2,
}

impl PtrKind {
    const MASK: u64 = 0b11;

    fn from_bits(bits: u64) -> Option<Self> {
        match bits & Self::MASK {
            0 => Some(PtrKind::Object),
            1 => Some(PtrKind::Closure),
            2 => Some(PtrKind::Array),
            _ => None,
        }
    }
}

/// Content of a pointer cell: the target handle plus its kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PtrTarget {
    /// What the target is
    pub kind: PtrKind,
    /// The target cell
    pub cell: CellRef,
}

impl PtrTarget {
    /// Encode into the pointer cell word
    #[inline]
    pub fn to_word(self) -> u64 {
        (self.cell.to_bits() << 2) | self.kind as u64
    }

    /// Decode a pointer cell word
    ///
    /// Returns `None` for the zero word (a null pointer cell) or a
    /// malformed word.
    #[inline]
    pub fn from_word(word: u64) -> Option<Self> {
        let kind = PtrKind::from_bits(word)?;
        let cell = CellRef::from_bits(word >> 2)?;
        Some(Self { kind, cell })
    }
}

/// A value decoded without touching the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unpacked {
    /// The zero word
    Null,
    /// Boolean immediate
    Bool(bool),
    /// Integer immediate
    Int(i32),
    /// Double stored in the referenced cell
    Double(CellRef),
    /// String stored in the referenced cell
    String(CellRef),
    /// Pointer cell naming an object, closure or array
    Ptr(CellRef),
}

/// Tagged word value representation
///
/// A `Value` can only be built through its constructors, so a word with an
/// unknown tag never exists.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    const TYPE_SHIFT: u32 = 3;
    const TAG_MASK: u64 = (1 << Self::TYPE_SHIFT) - 1;
    const TAG_PTR: u64 = 0;
    const TAG_DOUBLE: u64 = 1;
    const TAG_STRING: u64 = 2;
    const TAG_INT: u64 = 3;
    const TAG_BOOL: u64 = 4;

    const TRUE: u64 = 0xC;
    const FALSE: u64 = 0x4;

    /// Smallest integer stored as an immediate
    pub const INT_MIN: i64 = i32::MIN as i64;
    /// Largest integer stored as an immediate
    pub const INT_MAX: i64 = i32::MAX as i64;

    /// The null value
    pub const NULL: Value = Value(0);

    /// Create a null value
    #[inline]
    pub const fn null() -> Self {
        Self::NULL
    }

    /// Create a boolean value
    #[inline]
    pub const fn bool(b: bool) -> Self {
        Value(if b { Self::TRUE } else { Self::FALSE })
    }

    /// Create an integer value
    #[inline]
    pub const fn int(i: i32) -> Self {
        Value((((i as i64) << Self::TYPE_SHIFT) as u64) | Self::TAG_INT)
    }

    /// Create an integer value from a wider integer, checking the range
    pub fn from_i64(i: i64) -> GcResult<Self> {
        if (Self::INT_MIN..=Self::INT_MAX).contains(&i) {
            Ok(Self::int(i as i32))
        } else {
            Err(GcError::IntOutOfRange(i))
        }
    }

    /// Create an integer value if `d` is integral and in immediate range
    pub fn int_from_f64(d: f64) -> Option<Self> {
        if d.fract() != 0.0 || !d.is_finite() {
            return None;
        }
        if d < Self::INT_MIN as f64 || d > Self::INT_MAX as f64 {
            return None;
        }
        // -0.0 must stay a double to keep its sign
        if d == 0.0 && d.is_sign_negative() {
            return None;
        }
        Some(Self::int(d as i32))
    }

    /// Create a value referencing a Double cell
    #[inline]
    pub fn double(cell: CellRef) -> Self {
        Self::with_cell(cell, Self::TAG_DOUBLE)
    }

    /// Create a value referencing a String cell
    #[inline]
    pub fn string(cell: CellRef) -> Self {
        Self::with_cell(cell, Self::TAG_STRING)
    }

    /// Create a value referencing a pointer cell
    #[inline]
    pub fn ptr(cell: CellRef) -> Self {
        Self::with_cell(cell, Self::TAG_PTR)
    }

    #[inline]
    fn with_cell(cell: CellRef, tag: u64) -> Self {
        Value((cell.to_bits() << Self::TYPE_SHIFT) | tag)
    }

    /// Rebuild a value from a raw word
    ///
    /// Returns `None` if the word is not a valid encoding. Used when scanning
    /// memory that is only expected to hold values.
    pub fn from_bits(bits: u64) -> Option<Self> {
        match bits & Self::TAG_MASK {
            Self::TAG_PTR if bits == 0 => Some(Self::NULL),
            Self::TAG_PTR | Self::TAG_DOUBLE | Self::TAG_STRING => {
                CellRef::from_bits(bits >> Self::TYPE_SHIFT).map(|_| Value(bits))
            }
            Self::TAG_INT => {
                let i = (bits as i64) >> Self::TYPE_SHIFT;
                if (Self::INT_MIN..=Self::INT_MAX).contains(&i) {
                    Some(Value(bits))
                } else {
                    None
                }
            }
            Self::TAG_BOOL if bits == Self::TRUE || bits == Self::FALSE => Some(Value(bits)),
            _ => None,
        }
    }

    /// Get the raw word
    #[inline]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Get the type tag
    #[inline]
    pub fn tag(self) -> Tag {
        match self.0 & Self::TAG_MASK {
            Self::TAG_PTR => Tag::Ptr,
            Self::TAG_DOUBLE => Tag::Double,
            Self::TAG_STRING => Tag::String,
            Self::TAG_INT => Tag::Int,
            Self::TAG_BOOL => Tag::Bool,
            _ => unreachable!("value with invalid tag {:#x}", self.0),
        }
    }

    /// Check if this is the zero word
    ///
    /// A pointer cell holding no target is also null; use
    /// [`Heap::is_null`](crate::Heap::is_null) for the uniform check.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check if this value is a boolean
    #[inline]
    pub const fn is_bool(self) -> bool {
        self.0 == Self::TRUE || self.0 == Self::FALSE
    }

    /// Check if this value is an integer
    #[inline]
    pub const fn is_int(self) -> bool {
        (self.0 & Self::TAG_MASK) == Self::TAG_INT
    }

    /// Check if this value references a Double cell
    #[inline]
    pub const fn is_double(self) -> bool {
        (self.0 & Self::TAG_MASK) == Self::TAG_DOUBLE
    }

    /// Check if this value is a number (integer or double)
    #[inline]
    pub const fn is_number(self) -> bool {
        self.is_int() || self.is_double()
    }

    /// Check if this value references a String cell
    #[inline]
    pub const fn is_string(self) -> bool {
        (self.0 & Self::TAG_MASK) == Self::TAG_STRING
    }

    /// Check if this value references a pointer cell
    #[inline]
    pub const fn is_ptr(self) -> bool {
        self.0 != 0 && (self.0 & Self::TAG_MASK) == Self::TAG_PTR
    }

    /// Extract boolean value
    #[inline]
    pub const fn as_bool(self) -> Option<bool> {
        match self.0 {
            Self::TRUE => Some(true),
            Self::FALSE => Some(false),
            _ => None,
        }
    }

    /// Extract integer value
    #[inline]
    pub const fn as_int(self) -> Option<i32> {
        if self.is_int() {
            Some(((self.0 as i64) >> Self::TYPE_SHIFT) as i32)
        } else {
            None
        }
    }

    /// The cell this value references, if any
    #[inline]
    pub fn cell(self) -> Option<CellRef> {
        match self.tag() {
            Tag::Ptr | Tag::Double | Tag::String => CellRef::from_bits(self.0 >> Self::TYPE_SHIFT),
            Tag::Int | Tag::Bool => None,
        }
    }

    /// Decode into an [`Unpacked`] value
    pub fn unpack(self) -> Unpacked {
        match self.tag() {
            Tag::Bool => Unpacked::Bool(self.0 == Self::TRUE),
            Tag::Int => Unpacked::Int(((self.0 as i64) >> Self::TYPE_SHIFT) as i32),
            Tag::Ptr => match self.cell() {
                Some(cell) => Unpacked::Ptr(cell),
                None => Unpacked::Null,
            },
            Tag::Double => Unpacked::Double(self.expect_cell()),
            Tag::String => Unpacked::String(self.expect_cell()),
        }
    }

    /// Encode an [`Unpacked`] value
    pub fn pack(unpacked: Unpacked) -> Self {
        match unpacked {
            Unpacked::Null => Self::NULL,
            Unpacked::Bool(b) => Self::bool(b),
            Unpacked::Int(i) => Self::int(i),
            Unpacked::Double(cell) => Self::double(cell),
            Unpacked::String(cell) => Self::string(cell),
            Unpacked::Ptr(cell) => Self::ptr(cell),
        }
    }

    fn expect_cell(self) -> CellRef {
        match CellRef::from_bits(self.0 >> Self::TYPE_SHIFT) {
            Some(cell) => cell,
            None => unreachable!("reference value without a cell: {:#x}", self.0),
        }
    }

    /// Get type name for debugging
    pub fn type_name(self) -> &'static str {
        match self.tag() {
            Tag::Ptr if self.is_null() => "null",
            Tag::Ptr => "pointer",
            Tag::Double => "double",
            Tag::String => "string",
            Tag::Int => "int",
            Tag::Bool => "bool",
        }
    }
}

impl From<Unpacked> for Value {
    fn from(unpacked: Unpacked) -> Self {
        Value::pack(unpacked)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::int(i)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unpack() {
            Unpacked::Null => write!(f, "null"),
            Unpacked::Bool(b) => write!(f, "bool({})", b),
            Unpacked::Int(i) => write!(f, "int({})", i),
            Unpacked::Double(cell) => write!(f, "double@{:?}", cell),
            Unpacked::String(cell) => write!(f, "string@{:?}", cell),
            Unpacked::Ptr(cell) => write!(f, "ptr@{:?}", cell),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unpack() {
            Unpacked::Null => write!(f, "null"),
            Unpacked::Bool(b) => write!(f, "{}", b),
            Unpacked::Int(i) => write!(f, "{}", i),
            Unpacked::Double(cell) => write!(f, "[double@{}]", cell),
            Unpacked::String(cell) => write!(f, "[string@{}]", cell),
            Unpacked::Ptr(cell) => write!(f, "[object@{}]", cell),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::null()
    }
}
