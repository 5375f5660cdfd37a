//! Cell allocator
//!
//! Owns every [`CellPool`]. Pools are stored in a table indexed by
//! [`PoolId`], so the owner of any [`CellRef`] is found in O(1). Each object
//! type has a family of pools split into a usable list (pools with a free
//! cell) and a full list.

use crate::gc::descriptor::{DescriptorTable, ObjType};
use crate::gc::pool::{CellPool, Mark, PoolLayout};
use crate::handle::{CellRef, PoolId};
use crate::{GcError, GcResult};
use std::ptr::NonNull;

#[derive(Debug, Default)]
struct PoolFamily {
    layout: Option<PoolLayout>,
    usable: Vec<PoolId>,
    full: Vec<PoolId>,
}

/// Allocator for fixed-size GC cells
#[derive(Debug)]
pub struct CellAllocator {
    pool_size: usize,
    pools: Vec<Option<CellPool>>,
    free_ids: Vec<PoolId>,
    families: Vec<PoolFamily>,
    allocated_bytes: usize,
}

impl CellAllocator {
    /// Create an allocator for every type in `descriptors`
    pub fn new(pool_size: usize, descriptors: &DescriptorTable) -> GcResult<Self> {
        let mut families: Vec<PoolFamily> = (0..descriptors.len()).map(|_| PoolFamily::default()).collect();

        for (ty, desc) in descriptors.iter() {
            let layout = PoolLayout::compute(pool_size, desc.size).ok_or_else(|| {
                GcError::InvalidConfig(format!(
                    "type {} ({} bytes) does not fit a {} byte pool",
                    desc.name, desc.size, pool_size
                ))
            })?;
            families[ty.index()].layout = Some(layout);
        }

        Ok(Self {
            pool_size,
            pools: Vec::new(),
            free_ids: Vec::new(),
            families,
            allocated_bytes: 0,
        })
    }

    /// Allocate one cell of type `ty` with the given initial mark
    pub fn alloc(&mut self, ty: ObjType, mark: Mark) -> GcResult<CellRef> {
        let family = self
            .families
            .get(ty.index())
            .ok_or(GcError::UnknownType(ty.0))?;
        let layout = family.layout.ok_or(GcError::UnknownType(ty.0))?;

        let id = match family.usable.last() {
            Some(id) => *id,
            None => self.map_pool(ty, layout)?,
        };

        let pool = self.pools[id.slot()]
            .as_mut()
            .unwrap_or_else(|| unreachable!("usable pool {} is not mapped", id.get()));
        let index = pool
            .alloc(mark)
            .unwrap_or_else(|| unreachable!("usable pool {} has no free cell", id.get()));

        if pool.is_full() {
            let family = &mut self.families[ty.index()];
            family.usable.pop();
            family.full.push(id);
        }

        self.allocated_bytes += layout.cell_size;
        Ok(CellRef::new(id, index))
    }

    fn map_pool(&mut self, ty: ObjType, layout: PoolLayout) -> GcResult<PoolId> {
        let id = match self.free_ids.pop() {
            Some(id) => id,
            None => PoolId::new(self.pools.len() as u32 + 1)
                .ok_or(GcError::OutOfMemory { requested: self.pool_size })?,
        };

        let pool = match CellPool::new(id, ty, layout, self.pool_size) {
            Ok(pool) => pool,
            Err(e) => {
                self.free_ids.push(id);
                return Err(e);
            }
        };

        if id.slot() == self.pools.len() {
            self.pools.push(Some(pool));
        } else {
            self.pools[id.slot()] = Some(pool);
        }
        self.families[ty.index()].usable.push(id);

        tracing::trace!(
            target: "ming::gc",
            pool = id.get(),
            ty = ty.0,
            capacity = layout.capacity,
            "mapped cell pool"
        );
        Ok(id)
    }

    /// The pool with the given id, if mapped
    #[inline]
    pub fn pool(&self, id: PoolId) -> Option<&CellPool> {
        self.pools.get(id.slot()).and_then(Option::as_ref)
    }

    #[inline]
    fn pool_of(&self, cell: CellRef) -> Option<&CellPool> {
        self.pool(cell.pool()).filter(|p| p.contains(cell.index()))
    }

    #[inline]
    fn pool_of_mut(&mut self, cell: CellRef) -> Option<&mut CellPool> {
        self.pools
            .get_mut(cell.pool().slot())
            .and_then(Option::as_mut)
            .filter(|p| p.contains(cell.index()))
    }

    /// Mark of a cell, or `None` for a handle that names no cell
    #[inline]
    pub fn mark(&self, cell: CellRef) -> Option<Mark> {
        self.pool_of(cell).map(|p| p.mark(cell.index()))
    }

    /// Set the mark of a cell; ignored for invalid handles
    #[inline]
    pub fn set_mark(&mut self, cell: CellRef, mark: Mark) {
        if let Some(pool) = self.pool_of_mut(cell) {
            pool.set_mark(cell.index(), mark);
        }
    }

    /// Object type of an allocated cell
    #[inline]
    pub fn obj_type(&self, cell: CellRef) -> Option<ObjType> {
        self.pool_of(cell)
            .filter(|p| p.mark(cell.index()) != Mark::Unused)
            .map(CellPool::obj_type)
    }

    /// Address of an allocated cell
    #[inline]
    pub fn cell_ptr(&self, cell: CellRef) -> Option<NonNull<u8>> {
        let pool = self.pool_of(cell)?;
        if pool.mark(cell.index()) == Mark::Unused {
            return None;
        }
        NonNull::new(pool.cell_ptr(cell.index()))
    }

    /// Return a cell to its pool
    pub fn free(&mut self, cell: CellRef) {
        let pool = self
            .pool_of_mut(cell)
            .unwrap_or_else(|| panic!("free of invalid cell {:?}", cell));
        let size = pool.layout().cell_size;
        pool.free(cell.index());
        self.allocated_bytes -= size;
    }

    /// Ids of every mapped pool
    pub fn pool_ids(&self) -> Vec<PoolId> {
        self.pools.iter().flatten().map(CellPool::id).collect()
    }

    /// Mutable access to a pool during sweep
    #[inline]
    pub(crate) fn pool_mut(&mut self, id: PoolId) -> Option<&mut CellPool> {
        self.pools.get_mut(id.slot()).and_then(Option::as_mut)
    }

    /// Account for cells freed directly through [`CellAllocator::pool_mut`]
    pub(crate) fn release_bytes(&mut self, bytes: usize) {
        self.allocated_bytes -= bytes;
    }

    /// Unmap empty pools and rebuild the usable/full lists
    ///
    /// Returns the number of pools unmapped.
    pub fn rebalance(&mut self) -> usize {
        for family in &mut self.families {
            family.usable.clear();
            family.full.clear();
        }

        let mut unmapped = 0;
        for slot in 0..self.pools.len() {
            let Some(pool) = &self.pools[slot] else { continue };
            let id = pool.id();
            if pool.is_empty() {
                self.pools[slot] = None;
                self.free_ids.push(id);
                unmapped += 1;
                tracing::trace!(target: "ming::gc", pool = id.get(), "unmapped empty cell pool");
                continue;
            }
            let family = &mut self.families[pool.obj_type().index()];
            if pool.is_full() {
                family.full.push(id);
            } else {
                family.usable.push(id);
            }
        }

        while matches!(self.pools.last(), Some(None)) {
            self.pools.pop();
        }
        let len = self.pools.len();
        self.free_ids.retain(|id| id.slot() < len);
        // Lowest ids are reused first
        self.free_ids.sort_unstable_by(|a, b| b.cmp(a));

        unmapped
    }

    /// Bytes held by allocated cells
    #[inline]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Number of mapped pools
    pub fn pool_count(&self) -> usize {
        self.pools.iter().flatten().count()
    }

    /// Number of allocated cells
    pub fn live_cells(&self) -> usize {
        self.pools.iter().flatten().map(CellPool::used).sum()
    }

    /// Cell size for a type
    pub fn cell_size(&self, ty: ObjType) -> Option<usize> {
        self.families
            .get(ty.index())
            .and_then(|f| f.layout)
            .map(|l| l.cell_size)
    }
}
