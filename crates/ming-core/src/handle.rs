//! Cell handles
//!
//! GC cells are never addressed by raw pointer arithmetic on the pool
//! alignment. Every cell is named by a [`CellRef`], an explicit
//! `{pool, index}` pair. The owning pool is found in O(1) by indexing the
//! pool table with the pool id.
//!
//! # Bit Layout
//!
//! ```text
//! 63      61 60                             32 31                          0
//! ┌─────────┬─────────────────────────────────┬─────────────────────────────┐
//! │  0 0 0  │ pool id (29 bits, never zero)   │ cell index (32 bits)        │
//! └─────────┴─────────────────────────────────┴─────────────────────────────┘
//! ```
//!
//! The top three bits stay clear so a handle can be shifted into a tagged
//! [`Value`](crate::Value) word. A pool id of zero is reserved, which makes
//! the all-zero word usable as "no cell".

use std::fmt;
use std::num::NonZeroU32;

/// Identifier of a cell pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PoolId(NonZeroU32);

impl PoolId {
    /// Largest pool id that still fits a tagged value word
    pub const MAX: u32 = (1 << 29) - 1;

    /// Create a pool id from its raw number
    ///
    /// Returns `None` for zero or for ids above [`PoolId::MAX`].
    #[inline]
    pub fn new(raw: u32) -> Option<Self> {
        if raw > Self::MAX {
            return None;
        }
        NonZeroU32::new(raw).map(PoolId)
    }

    /// Get the raw pool number
    #[inline]
    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Position of this pool in a zero-based table
    #[inline]
    pub(crate) fn slot(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

/// Handle to one GC cell
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellRef {
    pool: PoolId,
    index: u32,
}

impl CellRef {
    /// Create a handle from a pool and a cell index inside it
    #[inline]
    pub fn new(pool: PoolId, index: u32) -> Self {
        Self { pool, index }
    }

    /// The pool holding this cell
    #[inline]
    pub fn pool(self) -> PoolId {
        self.pool
    }

    /// Index of the cell inside its pool
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    /// Pack the handle into a word (never zero)
    #[inline]
    pub fn to_bits(self) -> u64 {
        ((self.pool.get() as u64) << 32) | self.index as u64
    }

    /// Unpack a word produced by [`CellRef::to_bits`]
    #[inline]
    pub fn from_bits(bits: u64) -> Option<Self> {
        let pool = PoolId::new((bits >> 32) as u32)?;
        if bits >> 61 != 0 {
            return None;
        }
        Some(Self {
            pool,
            index: bits as u32,
        })
    }
}

impl fmt::Debug for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell({}:{})", self.pool.get(), self.index)
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pool.get(), self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_id_rejects_zero_and_overflow() {
        assert!(PoolId::new(0).is_none());
        assert!(PoolId::new(PoolId::MAX + 1).is_none());
        assert_eq!(PoolId::new(PoolId::MAX).map(PoolId::get), Some(PoolId::MAX));
    }

    #[test]
    fn test_pool_id_slot() {
        assert_eq!(PoolId::new(1).unwrap().slot(), 0);
        assert_eq!(PoolId::new(7).unwrap().slot(), 6);
    }

    #[test]
    fn test_cell_ref_bits() {
        let pool = PoolId::new(PoolId::MAX).unwrap();
        let cell = CellRef::new(pool, u32::MAX);
        let bits = cell.to_bits();

        assert_ne!(bits, 0);
        assert_eq!(bits >> 61, 0);
        assert_eq!(CellRef::from_bits(bits), Some(cell));
    }

    #[test]
    fn test_cell_ref_from_zero_is_none() {
        assert_eq!(CellRef::from_bits(0), None);
        assert_eq!(CellRef::from_bits(42), None);
    }

    #[test]
    fn test_cell_ref_rejects_high_bits() {
        let bits = (1u64 << 63) | (1u64 << 32);
        assert_eq!(CellRef::from_bits(bits), None);
    }
}
