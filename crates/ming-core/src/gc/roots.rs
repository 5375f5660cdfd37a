//! GC root tracking
//!
//! Explicit roots pin cells independently of reachability. Each cell keeps
//! a reference count so independent callers can pin the same cell; the
//! entry disappears when the count drops to zero.

use crate::handle::CellRef;
use rustc_hash::FxHashMap;

/// Reference-counted set of pinned cells
#[derive(Debug, Default)]
pub struct RootSet {
    roots: FxHashMap<CellRef, u32>,
}

impl RootSet {
    /// Create a new root set
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a cell, returning its new count
    pub fn add(&mut self, cell: CellRef) -> u32 {
        let count = self.roots.entry(cell).or_insert(0);
        *count += 1;
        *count
    }

    /// Unpin a cell, returning the remaining count
    ///
    /// Removing a cell that is not a root is a no-op returning zero.
    pub fn remove(&mut self, cell: CellRef) -> u32 {
        let Some(count) = self.roots.get_mut(&cell) else {
            return 0;
        };
        *count -= 1;
        let left = *count;
        if left == 0 {
            self.roots.remove(&cell);
        }
        left
    }

    /// Current pin count of a cell
    pub fn count(&self, cell: CellRef) -> u32 {
        self.roots.get(&cell).copied().unwrap_or(0)
    }

    /// Iterate over pinned cells
    pub fn iter(&self) -> impl Iterator<Item = CellRef> + '_ {
        self.roots.keys().copied()
    }

    /// Get number of distinct roots
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}
