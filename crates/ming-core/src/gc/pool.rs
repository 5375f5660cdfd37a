//! Cell pools
//!
//! A pool is one mapping holding `capacity` cells of a single object type.
//! The mark bitmap (2 bits per cell) sits at the start of the mapping and
//! the cells follow it:
//!
//! ```text
//! ┌──────────────────────┬────────┬────────┬─────┬────────┐
//! │ mark bitmap (words)  │ cell 0 │ cell 1 │ ... │ cell N │
//! └──────────────────────┴────────┴────────┴─────┴────────┘
//! ```
//!
//! Free cells are kept on a stack of indices. A cell that is on the free
//! stack is always marked [`Mark::Unused`].

use crate::gc::descriptor::ObjType;
use crate::gc::mmap::Mapping;
use crate::handle::{CellRef, PoolId};
use crate::GcResult;

/// Mark color of one cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Mark {
    /// Free cell
    Unused = 0,
    /// Allocated, not (yet) proven reachable
    White = 1,
    /// Reachable, references not yet scanned
    Gray = 2,
    /// Reachable and scanned
    Black = 3,
}

impl Mark {
    #[inline]
    fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0 => Mark::Unused,
            1 => Mark::White,
            2 => Mark::Gray,
            _ => Mark::Black,
        }
    }
}

const WORD_BITS: usize = 64;
const CELLS_PER_WORD: usize = WORD_BITS / 2;

/// Capacity and bitmap size of a pool for one cell size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLayout {
    /// Cell size in bytes
    pub cell_size: usize,
    /// Number of cells in the pool
    pub capacity: usize,
    /// Bytes reserved for the mark bitmap (word aligned)
    pub bitmap_bytes: usize,
}

impl PoolLayout {
    /// Fit as many cells as possible into `pool_size` bytes
    ///
    /// Returns `None` when not even one cell fits.
    pub fn compute(pool_size: usize, cell_size: usize) -> Option<Self> {
        if cell_size == 0 {
            return None;
        }
        let mut capacity = (pool_size * 8) / (cell_size * 8 + 2);
        loop {
            let bitmap_bytes = bitmap_bytes_for(capacity);
            if capacity * cell_size + bitmap_bytes <= pool_size {
                if capacity == 0 {
                    return None;
                }
                return Some(Self {
                    cell_size,
                    capacity,
                    bitmap_bytes,
                });
            }
            capacity = capacity.checked_sub(1)?;
        }
    }
}

#[inline]
fn bitmap_bytes_for(capacity: usize) -> usize {
    let bits = capacity * 2;
    bits.div_ceil(WORD_BITS) * (WORD_BITS / 8)
}

/// A page-aligned arena of same-sized cells
pub struct CellPool {
    id: PoolId,
    ty: ObjType,
    layout: PoolLayout,
    map: Mapping,
    free: Vec<u32>,
}

impl CellPool {
    /// Map a new pool with every cell free
    pub fn new(id: PoolId, ty: ObjType, layout: PoolLayout, pool_size: usize) -> GcResult<Self> {
        let map = Mapping::new(pool_size)?;
        let free = (0..layout.capacity as u32).rev().collect();
        Ok(Self {
            id,
            ty,
            layout,
            map,
            free,
        })
    }

    /// Pool identifier
    #[inline]
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Object type held by this pool
    #[inline]
    pub fn obj_type(&self) -> ObjType {
        self.ty
    }

    /// Pool layout
    #[inline]
    pub fn layout(&self) -> PoolLayout {
        self.layout
    }

    /// Number of cells in the pool
    #[inline]
    pub fn capacity(&self) -> usize {
        self.layout.capacity
    }

    /// Number of allocated cells
    #[inline]
    pub fn used(&self) -> usize {
        self.layout.capacity - self.free.len()
    }

    /// No free cell left
    #[inline]
    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// No allocated cell
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.free.len() == self.layout.capacity
    }

    /// Handle of the cell at `index`
    #[inline]
    pub fn cell_ref(&self, index: u32) -> CellRef {
        CellRef::new(self.id, index)
    }

    #[inline]
    fn bitmap(&self) -> *mut u64 {
        self.map.as_ptr() as *mut u64
    }

    /// Read the mark of a cell
    #[inline]
    pub fn mark(&self, index: u32) -> Mark {
        let index = self.check_index(index);
        let (word, shift) = (index / CELLS_PER_WORD, (index % CELLS_PER_WORD) * 2);
        // SAFETY: index < capacity, so the word lies inside the bitmap.
        let bits = unsafe { self.bitmap().add(word).read() };
        Mark::from_bits(bits >> shift)
    }

    /// Overwrite the mark of a cell
    #[inline]
    pub fn set_mark(&mut self, index: u32, mark: Mark) {
        let index = self.check_index(index);
        let (word, shift) = (index / CELLS_PER_WORD, (index % CELLS_PER_WORD) * 2);
        // SAFETY: index < capacity, so the word lies inside the bitmap.
        unsafe {
            let slot = self.bitmap().add(word);
            let bits = slot.read() & !(0b11 << shift);
            slot.write(bits | ((mark as u64) << shift));
        }
    }

    /// Address of a cell
    #[inline]
    pub fn cell_ptr(&self, index: u32) -> *mut u8 {
        let index = self.check_index(index);
        // SAFETY: the cell area starts after the bitmap and holds capacity cells.
        unsafe {
            self.map
                .as_ptr()
                .add(self.layout.bitmap_bytes + index * self.layout.cell_size)
        }
    }

    /// Take a free cell, zero it and mark it `mark`
    pub fn alloc(&mut self, mark: Mark) -> Option<u32> {
        let index = self.free.pop()?;
        debug_assert_eq!(self.mark(index), Mark::Unused);
        // SAFETY: the cell is inside the pool and no longer on the free stack.
        unsafe { std::ptr::write_bytes(self.cell_ptr(index), 0, self.layout.cell_size) };
        self.set_mark(index, mark);
        Some(index)
    }

    /// Return a cell to the free stack
    pub fn free(&mut self, index: u32) {
        assert_ne!(
            self.mark(index),
            Mark::Unused,
            "double free of cell {}:{}",
            self.id.get(),
            index
        );
        self.set_mark(index, Mark::Unused);
        self.free.push(index);
    }

    /// Whether `index` names a cell of this pool
    #[inline]
    pub fn contains(&self, index: u32) -> bool {
        (index as usize) < self.layout.capacity
    }

    #[inline]
    fn check_index(&self, index: u32) -> usize {
        assert!(
            self.contains(index),
            "cell index {} out of range for pool {}",
            index,
            self.id.get()
        );
        index as usize
    }
}

impl std::fmt::Debug for CellPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellPool")
            .field("id", &self.id)
            .field("ty", &self.ty)
            .field("capacity", &self.layout.capacity)
            .field("used", &self.used())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::mmap::page_size;

    fn pool(cell_size: usize) -> CellPool {
        let layout = PoolLayout::compute(page_size(), cell_size).unwrap();
        CellPool::new(PoolId::new(1).unwrap(), ObjType::OBJECT, layout, page_size()).unwrap()
    }

    #[test]
    fn test_layout_fits() {
        for cell_size in [8, 16, 24, 32, 64, 200, 1024] {
            let size = 4096;
            let layout = PoolLayout::compute(size, cell_size).unwrap();
            assert!(layout.capacity * cell_size + layout.bitmap_bytes <= size);
            assert_eq!(layout.bitmap_bytes % 8, 0);
            assert!(layout.bitmap_bytes * 4 >= layout.capacity);
            // One more cell would not fit
            let more = layout.capacity + 1;
            assert!(more * cell_size + bitmap_bytes_for(more) > size);
        }
    }

    #[test]
    fn test_layout_eight_byte_cells() {
        let layout = PoolLayout::compute(4096, 8).unwrap();
        assert_eq!(layout.capacity, 496);
        assert_eq!(layout.bitmap_bytes, 128);
    }

    #[test]
    fn test_layout_too_big() {
        assert!(PoolLayout::compute(4096, 4096).is_none());
        assert!(PoolLayout::compute(4096, 0).is_none());
    }

    #[test]
    fn test_marks_are_independent() {
        let mut p = pool(8);
        let a = p.alloc(Mark::White).unwrap();
        let b = p.alloc(Mark::White).unwrap();
        assert_eq!((a, b), (0, 1));

        p.set_mark(a, Mark::Gray);
        assert_eq!(p.mark(a), Mark::Gray);
        assert_eq!(p.mark(b), Mark::White);

        p.set_mark(b, Mark::Black);
        p.set_mark(a, Mark::White);
        assert_eq!(p.mark(a), Mark::White);
        assert_eq!(p.mark(b), Mark::Black);
        assert_eq!(p.mark(2), Mark::Unused);
    }

    #[test]
    fn test_alloc_until_full_then_free() {
        let mut p = pool(64);
        let cap = p.capacity();
        for _ in 0..cap {
            assert!(p.alloc(Mark::White).is_some());
        }
        assert!(p.is_full());
        assert!(p.alloc(Mark::White).is_none());

        p.free(3);
        assert!(!p.is_full());
        assert_eq!(p.used(), cap - 1);
        assert_eq!(p.alloc(Mark::Black), Some(3));
        assert_eq!(p.mark(3), Mark::Black);
    }

    #[test]
    fn test_alloc_zeroes_cell() {
        let mut p = pool(16);
        let i = p.alloc(Mark::White).unwrap();
        unsafe { std::ptr::write_bytes(p.cell_ptr(i), 0xFF, 16) };
        p.free(i);
        let j = p.alloc(Mark::White).unwrap();
        assert_eq!(i, j);
        let bytes = unsafe { std::slice::from_raw_parts(p.cell_ptr(j), 16) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_cells_do_not_overlap_bitmap() {
        let p = pool(8);
        let base = p.cell_ptr(0) as usize - p.map.as_ptr() as usize;
        assert_eq!(base, p.layout.bitmap_bytes);
        let last = p.cell_ptr(p.capacity() as u32 - 1) as usize - p.map.as_ptr() as usize;
        assert!(last + 8 <= page_size());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let mut p = pool(8);
        let i = p.alloc(Mark::White).unwrap();
        p.free(i);
        p.free(i);
    }
}
