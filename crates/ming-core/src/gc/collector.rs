//! Incremental tri-color mark-sweep collector
//!
//! The collector is a resumable state machine:
//!
//! ```text
//! Idle ──▶ MarkRoot ──▶ MarkObj ──▶ Sweep ──▶ Compact ──▶ Idle
//! ```
//!
//! A non-incremental run goes straight through to `Idle`. With
//! [`CollectFlags::INCREMENTAL`] each call completes one phase and returns,
//! so a cycle takes three steps (mark roots, mark objects, sweep). Every step
//! runs with the world stopped and the GC lock held.
//!
//! Colors live in the pool bitmaps. Marking only ever moves a cell from
//! white to gray (or straight to black for pointer-free types), which makes
//! it idempotent and lets cyclic graphs terminate. The gray stack is
//! bounded; on overflow the cell stays gray in its bitmap and a full bitmap
//! rescan picks it up once the stack drains.

use crate::gc::buffer::BufferAllocator;
use crate::gc::cells::CellAllocator;
use crate::gc::descriptor::DescriptorTable;
use crate::gc::pool::Mark;
use crate::gc::roots::RootSet;
use crate::gc::stats::GcStats;
use crate::handle::CellRef;
use crate::thread::registry::ThreadRegistry;
use crate::value::Value;
use bitflags::bitflags;
use std::time::Instant;

bitflags! {
    /// Flags for a collection request
    pub struct CollectFlags: u32 {
        /// Run one phase and return
        const INCREMENTAL = 1 << 0;
        /// Skip marking and release every cell
        const CLEAR_ALL = 1 << 1;
    }
}

/// Collector phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcStatus {
    /// No cycle in progress
    Idle,
    /// Next step marks the roots
    MarkRoot,
    /// Next step propagates marks through the gray stack
    MarkObj,
    /// Next step sweeps every pool
    Sweep,
    /// Cycle finishing (no-op, the collector is non-moving)
    Compact,
}

impl GcStatus {
    /// Marks may still change; stores need the write barrier
    #[inline]
    pub fn is_marking(self) -> bool {
        matches!(self, GcStatus::MarkRoot | GcStatus::MarkObj)
    }

    /// A cycle has started and not finished
    #[inline]
    pub fn in_cycle(self) -> bool {
        !matches!(self, GcStatus::Idle)
    }
}

/// Bounded stack of gray cells
#[derive(Debug)]
pub(crate) struct GrayStack {
    items: Vec<CellRef>,
    capacity: usize,
    overflowed: bool,
}

impl GrayStack {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
            overflowed: false,
        }
    }

    /// Push a cell; on overflow remember that a rescan is needed
    fn push(&mut self, cell: CellRef) -> bool {
        if self.items.len() < self.capacity {
            self.items.push(cell);
            true
        } else {
            self.overflowed = true;
            false
        }
    }

    fn pop(&mut self) -> Option<CellRef> {
        self.items.pop()
    }

    fn clear(&mut self) {
        self.items.clear();
        self.overflowed = false;
    }
}

/// Marking interface handed to scan callbacks
pub struct Tracer<'a> {
    cells: &'a mut CellAllocator,
    descriptors: &'a DescriptorTable,
    gray: &'a mut GrayStack,
    marked: &'a mut usize,
}

impl<'a> Tracer<'a> {
    /// Mark the cell referenced by `value`, if any
    #[inline]
    pub fn mark_value(&mut self, value: Value) {
        if let Some(cell) = value.cell() {
            self.mark_cell(cell);
        }
    }

    /// Mark a cell reachable
    ///
    /// Only white cells change color. Cells of pointer-free types go
    /// straight to black; the rest become gray and are queued for scanning.
    /// Handles that name no allocated cell are ignored.
    pub fn mark_cell(&mut self, cell: CellRef) {
        if self.cells.mark(cell) != Some(Mark::White) {
            return;
        }
        let traced = self
            .cells
            .obj_type(cell)
            .and_then(|ty| self.descriptors.get(ty).ok())
            .is_some_and(|desc| desc.has_pointers && desc.scan.is_some());

        *self.marked += 1;
        if traced {
            self.cells.set_mark(cell, Mark::Gray);
            self.gray.push(cell);
        } else {
            self.cells.set_mark(cell, Mark::Black);
        }
    }

    /// Mark a cell black without scanning it
    fn mark_opaque(&mut self, cell: CellRef) {
        if self.cells.mark(cell) == Some(Mark::White) {
            *self.marked += 1;
            self.cells.set_mark(cell, Mark::Black);
        }
    }
}

/// Borrowed heap state for one collector step
pub(crate) struct GcContext<'a> {
    pub(crate) cells: &'a mut CellAllocator,
    pub(crate) bufs: &'a mut BufferAllocator,
    pub(crate) roots: &'a mut RootSet,
    pub(crate) threads: &'a mut ThreadRegistry,
    pub(crate) descriptors: &'a DescriptorTable,
    pub(crate) stats: &'a mut GcStats,
}

#[derive(Debug, Default, Clone, Copy)]
struct SweepResult {
    freed: usize,
    freed_bytes: usize,
    unmapped: usize,
}

/// Tri-color mark-sweep collector state
#[derive(Debug)]
pub struct Collector {
    status: GcStatus,
    gray: GrayStack,
    baseline: usize,
    marked: usize,
}

impl Collector {
    /// Create a collector with a gray stack of `gray_capacity` entries
    pub fn new(gray_capacity: usize) -> Self {
        Self {
            status: GcStatus::Idle,
            gray: GrayStack::new(gray_capacity),
            baseline: 0,
            marked: 0,
        }
    }

    /// Current phase
    #[inline]
    pub fn status(&self) -> GcStatus {
        self.status
    }

    /// Allocated cell bytes recorded after the last sweep
    #[inline]
    pub fn baseline(&self) -> usize {
        self.baseline
    }

    /// Mark colour for a freshly allocated cell
    ///
    /// Cells allocated while a cycle is in progress are black so the
    /// running cycle cannot free them.
    #[inline]
    pub fn alloc_mark(&self) -> Mark {
        if self.status.in_cycle() {
            Mark::Black
        } else {
            Mark::White
        }
    }

    fn tracer<'t>(&'t mut self, cells: &'t mut CellAllocator, descriptors: &'t DescriptorTable) -> Tracer<'t> {
        Tracer {
            cells,
            descriptors,
            gray: &mut self.gray,
            marked: &mut self.marked,
        }
    }

    /// Write barrier: shade `value` while marking is in progress
    pub(crate) fn shade(&mut self, value: Value, cells: &mut CellAllocator, descriptors: &DescriptorTable) {
        if self.status.is_marking() {
            self.tracer(cells, descriptors).mark_value(value);
        }
    }

    /// Write barrier for a raw cell handle
    pub(crate) fn shade_cell(&mut self, cell: CellRef, cells: &mut CellAllocator, descriptors: &DescriptorTable) {
        if self.status.is_marking() {
            self.tracer(cells, descriptors).mark_cell(cell);
        }
    }

    /// Run the collector
    ///
    /// Returns `true` when the cycle is complete and the collector is idle.
    pub(crate) fn collect(&mut self, flags: CollectFlags, cx: &mut GcContext<'_>) -> bool {
        let start = Instant::now();

        if flags.contains(CollectFlags::CLEAR_ALL) {
            let swept = self.clear_all(cx);
            cx.stats.record_step(start.elapsed());
            self.finish(cx, swept);
            return true;
        }

        let mut swept = SweepResult::default();
        loop {
            match self.status {
                GcStatus::Idle => {
                    tracing::debug!(
                        target: "ming::gc",
                        allocated = cx.cells.allocated_bytes(),
                        baseline = self.baseline,
                        incremental = flags.contains(CollectFlags::INCREMENTAL),
                        "GC cycle starting"
                    );
                    self.marked = 0;
                    self.status = GcStatus::MarkRoot;
                    continue;
                }
                GcStatus::MarkRoot => {
                    self.mark_roots(cx);
                    self.status = GcStatus::MarkObj;
                }
                GcStatus::MarkObj => {
                    // Roots may have changed since the previous step
                    self.mark_roots(cx);
                    self.mark_objects(cx);
                    self.status = GcStatus::Sweep;
                }
                GcStatus::Sweep => {
                    swept = self.sweep(cx, false);
                    self.status = GcStatus::Compact;
                    continue;
                }
                GcStatus::Compact => {
                    self.status = GcStatus::Idle;
                    cx.stats.record_step(start.elapsed());
                    self.finish(cx, swept);
                    return true;
                }
            }

            if flags.contains(CollectFlags::INCREMENTAL) {
                cx.stats.record_step(start.elapsed());
                return false;
            }
        }
    }

    fn finish(&mut self, cx: &mut GcContext<'_>, swept: SweepResult) {
        cx.stats.pools_unmapped += swept.unmapped;
        cx.stats.update(
            self.marked,
            swept.freed,
            swept.freed_bytes,
            cx.cells.live_cells(),
            cx.cells.allocated_bytes(),
        );
        tracing::debug!(
            target: "ming::gc",
            marked = self.marked,
            freed = swept.freed,
            freed_bytes = swept.freed_bytes,
            live_bytes = cx.cells.allocated_bytes(),
            pools = cx.cells.pool_count(),
            "GC cycle finished"
        );
    }

    fn mark_roots(&mut self, cx: &mut GcContext<'_>) {
        let mut tracer = Tracer {
            cells: &mut *cx.cells,
            descriptors: cx.descriptors,
            gray: &mut self.gray,
            marked: &mut self.marked,
        };

        let mut newborn = 0;
        for record in cx.threads.records() {
            for entry in record.newborn() {
                if entry.scannable {
                    tracer.mark_cell(entry.cell);
                } else {
                    tracer.mark_opaque(entry.cell);
                }
            }
            newborn += record.newborn().len();
            tracer.mark_value(record.actor());
        }

        for cell in cx.roots.iter() {
            tracer.mark_cell(cell);
        }

        let mut ptr_words = 0;
        for (addr, len) in cx.bufs.ptr_buffers() {
            let words = addr as *const u64;
            for i in 0..len / 8 {
                // SAFETY: registered PTR buffers are live and word aligned.
                let bits = unsafe { words.add(i).read() };
                if let Some(value) = Value::from_bits(bits) {
                    tracer.mark_value(value);
                }
            }
            ptr_words += len / 8;
        }

        tracing::debug!(
            target: "ming::gc",
            threads = cx.threads.thread_count(),
            newborn,
            roots = cx.roots.len(),
            ptr_words,
            "marked roots"
        );
    }

    fn mark_objects(&mut self, cx: &mut GcContext<'_>) {
        loop {
            while let Some(cell) = self.gray.pop() {
                self.scan_cell(cell, cx);
            }
            if !self.gray.overflowed {
                break;
            }
            self.gray.overflowed = false;
            cx.stats.gray_rescans += 1;
            self.rescan(cx.cells);
        }
        tracing::debug!(target: "ming::gc", marked = self.marked, "marked objects");
    }

    fn scan_cell(&mut self, cell: CellRef, cx: &mut GcContext<'_>) {
        if cx.cells.mark(cell) != Some(Mark::Gray) {
            return;
        }
        cx.cells.set_mark(cell, Mark::Black);

        let Some(ty) = cx.cells.obj_type(cell) else { return };
        let Ok(desc) = cx.descriptors.get(ty) else {
            unreachable!("cell {:?} has unregistered type {}", cell, ty.0)
        };
        let (Some(scan), Some(ptr)) = (desc.scan, cx.cells.cell_ptr(cell)) else {
            return;
        };
        let size = desc.size;

        let mut tracer = self.tracer(cx.cells, cx.descriptors);
        // SAFETY: ptr is a live cell of `size` bytes of type `ty`.
        unsafe { scan(ptr.as_ptr(), size, &mut tracer) };
    }

    /// Queue every gray cell still in the bitmaps
    fn rescan(&mut self, cells: &CellAllocator) {
        let mut found = 0;
        'pools: for id in cells.pool_ids() {
            let Some(pool) = cells.pool(id) else { continue };
            for index in 0..pool.capacity() as u32 {
                if pool.mark(index) == Mark::Gray {
                    found += 1;
                    if !self.gray.push(pool.cell_ref(index)) {
                        break 'pools;
                    }
                }
            }
        }
        tracing::debug!(target: "ming::gc", found, "gray stack overflow rescan");
    }

    fn sweep(&mut self, cx: &mut GcContext<'_>, clear_all: bool) -> SweepResult {
        let mut result = SweepResult::default();

        for id in cx.cells.pool_ids() {
            let Some(pool) = cx.cells.pool_mut(id) else { continue };
            let ty = pool.obj_type();
            let Ok(desc) = cx.descriptors.get(ty) else {
                unreachable!("pool {} has unregistered type {}", id.get(), ty.0)
            };

            for index in 0..pool.capacity() as u32 {
                match pool.mark(index) {
                    Mark::Unused => {}
                    Mark::Black if !clear_all => pool.set_mark(index, Mark::White),
                    Mark::Gray if !clear_all => {
                        panic!("cell {}:{} still gray at sweep", id.get(), index)
                    }
                    _ => {
                        if let Some(finalize) = desc.finalize {
                            // SAFETY: the cell is dead and finalized once.
                            unsafe { finalize(pool.cell_ptr(index), desc.size, cx.bufs) };
                        }
                        pool.free(index);
                        result.freed += 1;
                        result.freed_bytes += desc.size;
                    }
                }
            }
        }

        cx.cells.release_bytes(result.freed_bytes);
        result.unmapped = cx.cells.rebalance();
        self.baseline = cx.cells.allocated_bytes();

        tracing::debug!(
            target: "ming::gc",
            freed = result.freed,
            freed_bytes = result.freed_bytes,
            unmapped_pools = result.unmapped,
            "sweep finished"
        );
        result
    }

    /// Abandon any cycle and release every cell
    fn clear_all(&mut self, cx: &mut GcContext<'_>) -> SweepResult {
        tracing::debug!(target: "ming::gc", live = cx.cells.live_cells(), "clearing heap");
        self.gray.clear();
        self.status = GcStatus::Idle;
        self.marked = 0;

        for record in cx.threads.records_mut() {
            record.clear_newborn();
        }
        *cx.roots = RootSet::new();

        self.sweep(cx, true)
    }
}
