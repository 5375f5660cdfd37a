//! GC object descriptors
//!
//! Every object type the heap manages has an [`ObjDescriptor`]: its fixed
//! cell size, whether it can hold references, and optional scan and
//! finalize callbacks. Descriptors are collected in a [`DescriptorTable`]
//! indexed by [`ObjType`]; the table is frozen once a heap is built.

use crate::gc::buffer::{BufFlags, BufferAllocator};
use crate::gc::collector::Tracer;
use crate::value::{PtrTarget, Value};
use crate::{GcError, GcResult};
use std::fmt;

/// Object type ordinal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjType(pub u16);

impl ObjType {
    /// One-word pointer cell referenced by pointer-tagged values
    pub const PTR: ObjType = ObjType(0);
    /// Boxed double
    pub const DOUBLE: ObjType = ObjType(1);
    /// String header (buffer pointer and length)
    pub const STRING: ObjType = ObjType(2);
    /// Plain object
    pub const OBJECT: ObjType = ObjType(3);
    /// Function closure
    pub const CLOSURE: ObjType = ObjType(4);
    /// Array header
    pub const ARRAY: ObjType = ObjType(5);
    /// Interpreter frame
    pub const FRAME: ObjType = ObjType(6);

    /// Index into a descriptor table
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Scan callback: report every reference held by the cell at `cell`
///
/// # Safety
///
/// `cell` must point to a live cell of `size` bytes of the described type.
pub type ScanFn = unsafe fn(cell: *const u8, size: usize, tracer: &mut Tracer<'_>);

/// Finalize callback: release resources owned by a dead cell
///
/// # Safety
///
/// `cell` must point to a dead cell of `size` bytes of the described type
/// that is finalized exactly once.
pub type FinalFn = unsafe fn(cell: *mut u8, size: usize, bufs: &mut BufferAllocator);

/// Static metadata for one object type
#[derive(Clone, Copy)]
pub struct ObjDescriptor {
    /// Type name for logging
    pub name: &'static str,
    /// Cell size in bytes (a multiple of the word size)
    pub size: usize,
    /// Whether cells of this type can hold references
    pub has_pointers: bool,
    /// Reference enumeration
    pub scan: Option<ScanFn>,
    /// Destruction hook
    pub finalize: Option<FinalFn>,
}

impl ObjDescriptor {
    /// Descriptor for a cell holding `slots` [`Value`] words
    pub fn values(name: &'static str, slots: usize) -> Self {
        Self {
            name,
            size: slots * WORD,
            has_pointers: true,
            scan: Some(scan_value_slots),
            finalize: None,
        }
    }

    /// Descriptor for a pointer-free cell of `size` bytes
    pub fn opaque(name: &'static str, size: usize) -> Self {
        Self {
            name,
            size,
            has_pointers: false,
            scan: None,
            finalize: None,
        }
    }

    /// Replace the scan callback
    pub fn with_scan(mut self, scan: ScanFn) -> Self {
        self.scan = Some(scan);
        self.has_pointers = true;
        self
    }

    /// Set the finalize callback
    pub fn with_finalizer(mut self, finalize: FinalFn) -> Self {
        self.finalize = Some(finalize);
        self
    }
}

impl fmt::Debug for ObjDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjDescriptor")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("has_pointers", &self.has_pointers)
            .field("scan", &self.scan.is_some())
            .field("finalize", &self.finalize.is_some())
            .finish()
    }
}

const WORD: usize = std::mem::size_of::<u64>();

/// Number of value slots in an Object cell
pub const OBJECT_SLOTS: usize = 4;
/// Number of value slots in a Closure cell
pub const CLOSURE_SLOTS: usize = 2;
/// Number of value slots in an Array cell
pub const ARRAY_SLOTS: usize = 4;
/// Number of value slots in a Frame cell
pub const FRAME_SLOTS: usize = 8;

/// Fixed table of descriptors indexed by [`ObjType`]
#[derive(Debug, Clone)]
pub struct DescriptorTable {
    entries: Vec<Option<ObjDescriptor>>,
}

impl DescriptorTable {
    /// The seven built-in object types
    pub fn standard() -> Self {
        Self::builder()
            .build()
            .unwrap_or_else(|e| unreachable!("standard descriptors are valid: {}", e))
    }

    /// Start from the built-in types
    pub fn builder() -> DescriptorTableBuilder {
        let mut builder = DescriptorTableBuilder::empty();
        builder
            .set(
                ObjType::PTR,
                ObjDescriptor::opaque("ptr", WORD).with_scan(scan_ptr_cell),
            )
            .set(ObjType::DOUBLE, ObjDescriptor::opaque("double", WORD))
            .set(
                ObjType::STRING,
                ObjDescriptor::opaque("string", 2 * WORD).with_finalizer(finalize_string),
            )
            .set(ObjType::OBJECT, ObjDescriptor::values("object", OBJECT_SLOTS))
            .set(ObjType::CLOSURE, ObjDescriptor::values("closure", CLOSURE_SLOTS))
            .set(ObjType::ARRAY, ObjDescriptor::values("array", ARRAY_SLOTS))
            .set(ObjType::FRAME, ObjDescriptor::values("frame", FRAME_SLOTS));
        builder
    }

    /// Look up a descriptor
    #[inline]
    pub fn get(&self, ty: ObjType) -> GcResult<&ObjDescriptor> {
        self.entries
            .get(ty.index())
            .and_then(Option::as_ref)
            .ok_or(GcError::UnknownType(ty.0))
    }

    /// Iterate over registered types
    pub fn iter(&self) -> impl Iterator<Item = (ObjType, &ObjDescriptor)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.as_ref().map(|d| (ObjType(i as u16), d)))
    }

    /// Number of ordinals in the table (registered or not)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no ordinals
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Builder for a [`DescriptorTable`]
#[derive(Debug, Clone)]
pub struct DescriptorTableBuilder {
    entries: Vec<Option<ObjDescriptor>>,
}

impl DescriptorTableBuilder {
    /// A builder without any types
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// Register or replace the descriptor for `ty`
    pub fn set(&mut self, ty: ObjType, desc: ObjDescriptor) -> &mut Self {
        if self.entries.len() <= ty.index() {
            self.entries.resize(ty.index() + 1, None);
        }
        self.entries[ty.index()] = Some(desc);
        self
    }

    /// Validate and freeze the table
    pub fn build(&self) -> GcResult<DescriptorTable> {
        for (i, desc) in self.entries.iter().enumerate() {
            let Some(desc) = desc else { continue };
            if desc.size == 0 || desc.size % WORD != 0 {
                return Err(GcError::InvalidConfig(format!(
                    "type {} ({}) has size {}, expected a positive multiple of {}",
                    i, desc.name, desc.size, WORD
                )));
            }
        }
        Ok(DescriptorTable {
            entries: self.entries.clone(),
        })
    }
}

/// Scan every word of a cell as a [`Value`]
///
/// # Safety
///
/// `cell` must point to `size` readable bytes.
pub unsafe fn scan_value_slots(cell: *const u8, size: usize, tracer: &mut Tracer<'_>) {
    let words = cell as *const u64;
    for i in 0..size / WORD {
        if let Some(value) = Value::from_bits(words.add(i).read()) {
            tracer.mark_value(value);
        }
    }
}

unsafe fn scan_ptr_cell(cell: *const u8, _size: usize, tracer: &mut Tracer<'_>) {
    let word = (cell as *const u64).read();
    if let Some(target) = PtrTarget::from_word(word) {
        tracer.mark_cell(target.cell);
    }
}

unsafe fn finalize_string(cell: *mut u8, _size: usize, bufs: &mut BufferAllocator) {
    let words = cell as *mut u64;
    let ptr = words.read() as usize as *mut u8;
    let len = words.add(1).read() as usize;
    bufs.free(ptr, len, BufFlags::empty());
    words.write(0);
    words.add(1).write(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_table() {
        let table = DescriptorTable::standard();
        assert_eq!(table.len(), 7);
        assert_eq!(table.iter().count(), 7);

        let ptr = table.get(ObjType::PTR).unwrap();
        assert_eq!(ptr.size, 8);
        assert!(ptr.has_pointers);

        let double = table.get(ObjType::DOUBLE).unwrap();
        assert!(!double.has_pointers);
        assert!(double.scan.is_none());

        let string = table.get(ObjType::STRING).unwrap();
        assert_eq!(string.size, 16);
        assert!(!string.has_pointers);
        assert!(string.finalize.is_some());

        assert_eq!(table.get(ObjType::OBJECT).unwrap().size, OBJECT_SLOTS * 8);
        assert_eq!(table.get(ObjType::FRAME).unwrap().size, FRAME_SLOTS * 8);
    }

    #[test]
    fn test_unknown_type() {
        let table = DescriptorTable::standard();
        assert!(matches!(table.get(ObjType(99)), Err(GcError::UnknownType(99))));
    }

    #[test]
    fn test_builder_replaces_and_extends() {
        let table = DescriptorTable::builder()
            .set(ObjType::OBJECT, ObjDescriptor::values("wide", 16))
            .set(ObjType(10), ObjDescriptor::opaque("blob", 24))
            .build()
            .unwrap();

        assert_eq!(table.get(ObjType::OBJECT).unwrap().size, 128);
        assert_eq!(table.get(ObjType(10)).unwrap().name, "blob");
        assert!(matches!(table.get(ObjType(8)), Err(GcError::UnknownType(8))));
    }

    #[test]
    fn test_builder_rejects_bad_size() {
        let result = DescriptorTableBuilder::empty()
            .set(ObjType(0), ObjDescriptor::opaque("odd", 12))
            .build();
        assert!(matches!(result, Err(GcError::InvalidConfig(_))));
    }
}
