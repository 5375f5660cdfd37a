//! The heap runtime context
//!
//! A [`Heap`] owns every allocator, the root set, the thread registry and
//! the collector behind one lock (the GC lock). Allocation, root changes,
//! thread state transitions and every collector step happen with that lock
//! held. The safepoint coordinator's condition variables wait on it.
//!
//! Threads reach the heap through a [`Mutator`](crate::Mutator) obtained
//! from [`Heap::attach`]. Operations that need no thread identity (buffers,
//! roots, decoding) are available directly on the heap.

use crate::config::GcConfig;
use crate::gc::buffer::{BufFlags, BufferAllocator};
use crate::gc::cells::CellAllocator;
use crate::gc::collector::{CollectFlags, Collector, GcContext, GcStatus};
use crate::gc::descriptor::{DescriptorTable, ObjType};
use crate::gc::roots::RootSet;
use crate::gc::stats::{GcStats, HeapStats};
use crate::handle::CellRef;
use crate::thread::mutator::{self, Mutator};
use crate::thread::registry::{ThreadId, ThreadRegistry, ThreadState, ThreadsMut};
use crate::thread::safepoint::{SafepointCoordinator, SafepointStats};
use crate::value::{PtrKind, PtrTarget, Unpacked, Value};
use crate::{GcError, GcResult};
use parking_lot::{Mutex, MutexGuard};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

/// Everything guarded by the GC lock
#[derive(Debug)]
pub(crate) struct HeapState {
    pub(crate) cells: CellAllocator,
    pub(crate) bufs: BufferAllocator,
    pub(crate) roots: RootSet,
    pub(crate) threads: ThreadRegistry,
    pub(crate) collector: Collector,
    pub(crate) stats: GcStats,
}

impl HeapState {
    fn context<'a>(&'a mut self, descriptors: &'a DescriptorTable) -> (&'a mut Collector, GcContext<'a>) {
        let cx = GcContext {
            cells: &mut self.cells,
            bufs: &mut self.bufs,
            roots: &mut self.roots,
            threads: &mut self.threads,
            descriptors,
            stats: &mut self.stats,
        };
        (&mut self.collector, cx)
    }

    /// Size in bytes of an allocated cell
    fn cell_size(&self, cell: CellRef, descriptors: &DescriptorTable) -> Option<usize> {
        let ty = self.cells.obj_type(cell)?;
        descriptors.get(ty).ok().map(|d| d.size)
    }

    fn read_word(&self, cell: CellRef, slot: usize, descriptors: &DescriptorTable) -> Option<u64> {
        let size = self.cell_size(cell, descriptors)?;
        if slot >= size / 8 {
            return None;
        }
        let ptr = self.cells.cell_ptr(cell)?.as_ptr() as *const u64;
        // SAFETY: the cell is allocated and `slot` is within its size.
        Some(unsafe { ptr.add(slot).read() })
    }

    /// Read a slot of a cell only if the cell has type `ty`
    fn read_typed(&self, cell: CellRef, ty: ObjType, slot: usize, descriptors: &DescriptorTable) -> Option<u64> {
        if self.cells.obj_type(cell)? != ty {
            return None;
        }
        self.read_word(cell, slot, descriptors)
    }

    pub(crate) fn write_word(
        &mut self,
        cell: CellRef,
        slot: usize,
        word: u64,
        descriptors: &DescriptorTable,
    ) -> bool {
        let Some(size) = self.cell_size(cell, descriptors) else {
            return false;
        };
        if slot >= size / 8 {
            return false;
        }
        let Some(ptr) = self.cells.cell_ptr(cell) else {
            return false;
        };
        // SAFETY: the cell is allocated and `slot` is within its size.
        unsafe { (ptr.as_ptr() as *mut u64).add(slot).write(word) };
        true
    }
}

impl ThreadsMut for HeapState {
    fn threads_mut(&mut self) -> &mut ThreadRegistry {
        &mut self.threads
    }
}

/// A value decoded through the heap
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolved {
    /// Null, including a pointer cell holding no target
    Null,
    /// Boolean
    Bool(bool),
    /// Integer immediate
    Int(i32),
    /// Boxed double, read from its cell
    Double(f64),
    /// String cell
    String(CellRef),
    /// Object reached through a pointer cell
    Object(CellRef),
    /// Closure reached through a pointer cell
    Closure(CellRef),
    /// Array reached through a pointer cell
    Array(CellRef),
}

/// The memory-management runtime context
pub struct Heap {
    id: u64,
    config: GcConfig,
    descriptors: DescriptorTable,
    state: Mutex<HeapState>,
    coordinator: SafepointCoordinator,
    /// Mirrors `collector.status().is_marking()` for the lock-free barrier check
    marking: AtomicBool,
}

impl Heap {
    /// Create a heap with the standard object types
    pub fn new(config: GcConfig) -> GcResult<Arc<Self>> {
        Self::with_descriptors(config, DescriptorTable::standard())
    }

    /// Create a heap configured from the environment
    pub fn from_env() -> GcResult<Arc<Self>> {
        Self::new(GcConfig::from_env()?)
    }

    /// Create a heap with a custom descriptor table
    pub fn with_descriptors(config: GcConfig, descriptors: DescriptorTable) -> GcResult<Arc<Self>> {
        config.validate()?;
        let cells = CellAllocator::new(config.pool_size, &descriptors)?;
        let bufs = BufferAllocator::new(config.buffer_arena_size, config.big_buffer_threshold);

        let id = NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: "ming::gc",
            heap = id,
            trigger_bytes = config.trigger_bytes,
            growth_percent = config.growth_percent,
            pool_size = config.pool_size,
            gray_stack = config.gray_stack_capacity,
            incremental = config.incremental_trigger,
            types = descriptors.len(),
            "heap created"
        );

        Ok(Arc::new(Self {
            id,
            state: Mutex::new(HeapState {
                cells,
                bufs,
                roots: RootSet::new(),
                threads: ThreadRegistry::new(),
                collector: Collector::new(config.gray_stack_capacity),
                stats: GcStats::default(),
            }),
            config,
            descriptors,
            coordinator: SafepointCoordinator::new(),
            marking: AtomicBool::new(false),
        }))
    }

    /// Attach the calling thread
    ///
    /// The first attach on a thread registers it; later attaches on the
    /// same thread share the registration. The thread detaches when its
    /// last [`Mutator`] is dropped.
    pub fn attach(self: &Arc<Self>) -> Mutator {
        mutator::attach(self)
    }

    /// Unique id of this heap within the process
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Effective configuration
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Object type table
    pub fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }

    /// Safepoint statistics
    pub fn safepoint_stats(&self) -> &SafepointStats {
        &self.coordinator.stats
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, HeapState> {
        self.state.lock()
    }

    #[inline]
    pub(crate) fn coordinator(&self) -> &SafepointCoordinator {
        &self.coordinator
    }

    #[inline]
    pub(crate) fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    // ===== Collection =====

    /// Run the collector
    ///
    /// Without [`CollectFlags::INCREMENTAL`] the current cycle (or a new
    /// one) runs to completion. If the calling thread is attached and inside
    /// the runtime, it acts as that thread; otherwise it stops the world as
    /// an outside thread.
    pub fn collect(&self, flags: CollectFlags) {
        let mut guard = self.lock();
        let me = mutator::bound_thread(self.id).filter(|&id| {
            guard
                .threads
                .get(id)
                .is_ok_and(|record| record.state() == ThreadState::Running)
        });
        self.collect_locked(&mut guard, me, flags, true);
    }

    /// Stop the world and run one collector call
    ///
    /// When another thread is already stopping the world, the caller waits
    /// for it and, if `must_run`, tries again; otherwise it returns without
    /// collecting.
    pub(crate) fn collect_locked(
        &self,
        guard: &mut MutexGuard<'_, HeapState>,
        me: Option<ThreadId>,
        flags: CollectFlags,
        must_run: bool,
    ) {
        while !self.coordinator.pause_all(guard, me) {
            if !must_run {
                return;
            }
        }

        let state = &mut **guard;
        let (collector, mut cx) = state.context(&self.descriptors);
        collector.collect(flags, &mut cx);
        self.marking.store(collector.status().is_marking(), Ordering::Release);

        self.coordinator.resume_all(guard, me);
    }

    /// Allocation trigger
    ///
    /// Fires once allocated cell bytes reach `trigger_bytes` and have grown
    /// by more than `growth_percent` over the post-collection baseline. An
    /// unfinished incremental cycle keeps firing until it completes.
    pub(crate) fn should_collect(&self, state: &HeapState) -> bool {
        let allocated = state.cells.allocated_bytes();
        if allocated < self.config.trigger_bytes {
            return false;
        }
        if state.collector.status().in_cycle() {
            return true;
        }
        let baseline = state.collector.baseline();
        allocated.saturating_mul(100) > baseline.saturating_mul(100 + self.config.growth_percent)
    }

    pub(crate) fn trigger_flags(&self) -> CollectFlags {
        if self.config.incremental_trigger {
            CollectFlags::INCREMENTAL
        } else {
            CollectFlags::empty()
        }
    }

    // ===== Roots =====

    /// Pin a cell, returning its pin count
    pub fn add_root(&self, cell: CellRef) -> u32 {
        self.lock().roots.add(cell)
    }

    /// Unpin a cell, returning the remaining pin count
    pub fn remove_root(&self, cell: CellRef) -> u32 {
        self.lock().roots.remove(cell)
    }

    // ===== Buffers =====

    /// Allocate a buffer of `size` bytes
    pub fn alloc_buf(&self, size: usize, flags: BufFlags) -> GcResult<NonNull<u8>> {
        self.lock().bufs.alloc(size, flags)
    }

    /// Resize a buffer
    ///
    /// A null `ptr` (or `old == 0`) allocates; `new == 0` frees and returns
    /// null. Shrinking keeps the address and releases the tail, so the
    /// buffer is later freed with the new size. Growing extends in place
    /// when the following space is free, otherwise moves and copies.
    pub fn realloc_buf(&self, ptr: *mut u8, old: usize, new: usize, flags: BufFlags) -> GcResult<*mut u8> {
        self.lock().bufs.realloc(ptr, old, new, flags)
    }

    /// Release a buffer; null or zero-sized is a no-op
    ///
    /// `size` is the size passed to the last alloc or realloc of `ptr`.
    pub fn free_buf(&self, ptr: *mut u8, size: usize, flags: BufFlags) {
        self.lock().bufs.free(ptr, size, flags)
    }

    /// Allocate `count` null values whose contents are scanned as roots
    ///
    /// Fails with [`GcError::OutOfMemory`] when the byte size overflows.
    pub fn alloc_value_buf(&self, count: usize) -> GcResult<NonNull<Value>> {
        let size = count
            .checked_mul(std::mem::size_of::<Value>())
            .ok_or(GcError::OutOfMemory { requested: usize::MAX })?;
        self.alloc_buf(size, BufFlags::PTR).map(NonNull::cast)
    }

    /// Release a buffer from [`alloc_value_buf`](Self::alloc_value_buf)
    pub fn free_value_buf(&self, ptr: NonNull<Value>, count: usize) {
        // No buffer of an overflowing size was ever handed out
        let Some(size) = count.checked_mul(std::mem::size_of::<Value>()) else {
            return;
        };
        self.free_buf(ptr.as_ptr().cast(), size, BufFlags::PTR)
    }

    // ===== Cells =====

    /// Address of an allocated cell
    ///
    /// The address stays valid while the cell is reachable or pinned.
    pub fn cell_ptr(&self, cell: CellRef) -> Option<NonNull<u8>> {
        self.lock().cells.cell_ptr(cell)
    }

    /// The handle names an allocated cell
    pub fn is_alive(&self, cell: CellRef) -> bool {
        self.lock().cells.obj_type(cell).is_some()
    }

    /// Object type of an allocated cell
    pub fn obj_type(&self, cell: CellRef) -> Option<ObjType> {
        self.lock().cells.obj_type(cell)
    }

    /// Read the value slot `slot` of a cell
    pub fn load_slot(&self, cell: CellRef, slot: usize) -> Option<Value> {
        let bits = self.lock().read_word(cell, slot, &self.descriptors)?;
        Value::from_bits(bits)
    }

    // ===== Decoding =====

    /// Decode a value, following pointer cells
    ///
    /// Returns `None` if the value references a freed cell or a cell whose
    /// object type does not match the value's tag.
    pub fn resolve(&self, value: Value) -> Option<Resolved> {
        let state = self.lock();
        match value.unpack() {
            Unpacked::Null => Some(Resolved::Null),
            Unpacked::Bool(b) => Some(Resolved::Bool(b)),
            Unpacked::Int(i) => Some(Resolved::Int(i)),
            Unpacked::Double(cell) => {
                let bits = state.read_typed(cell, ObjType::DOUBLE, 0, &self.descriptors)?;
                Some(Resolved::Double(f64::from_bits(bits)))
            }
            Unpacked::String(cell) => {
                (state.cells.obj_type(cell)? == ObjType::STRING).then_some(Resolved::String(cell))
            }
            Unpacked::Ptr(cell) => {
                let word = state.read_typed(cell, ObjType::PTR, 0, &self.descriptors)?;
                Some(match PtrTarget::from_word(word) {
                    None => Resolved::Null,
                    Some(PtrTarget { kind: PtrKind::Object, cell }) => Resolved::Object(cell),
                    Some(PtrTarget { kind: PtrKind::Closure, cell }) => Resolved::Closure(cell),
                    Some(PtrTarget { kind: PtrKind::Array, cell }) => Resolved::Array(cell),
                })
            }
        }
    }

    /// Uniform null test: the zero word or a pointer cell holding no target
    pub fn is_null(&self, value: Value) -> bool {
        if value.is_null() {
            return true;
        }
        match value.unpack() {
            Unpacked::Ptr(_) => matches!(self.resolve(value), Some(Resolved::Null)),
            _ => false,
        }
    }

    /// Copy out the contents of a string value
    ///
    /// Returns `None` unless the value names a live string cell.
    pub fn read_string(&self, value: Value) -> Option<String> {
        let Unpacked::String(cell) = value.unpack() else {
            return None;
        };
        let state = self.lock();
        let ptr = state.read_typed(cell, ObjType::STRING, 0, &self.descriptors)? as usize as *const u8;
        let len = state.read_typed(cell, ObjType::STRING, 1, &self.descriptors)? as usize;
        if len == 0 {
            return Some(String::new());
        }
        // SAFETY: a live string cell owns `len` initialized bytes at `ptr`.
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
        String::from_utf8(bytes.to_vec()).ok()
    }

    // ===== Inspection =====

    /// Collection statistics
    pub fn stats(&self) -> GcStats {
        self.lock().stats.clone()
    }

    /// Current collector phase
    pub fn status(&self) -> GcStatus {
        self.lock().collector.status()
    }

    /// Occupancy snapshot
    pub fn heap_stats(&self) -> HeapStats {
        let state = self.lock();
        HeapStats {
            allocated_bytes: state.cells.allocated_bytes(),
            baseline_bytes: state.collector.baseline(),
            live_cells: state.cells.live_cells(),
            pool_count: state.cells.pool_count(),
            buffer_bytes: state.bufs.allocated_bytes(),
            buffer_mapped_bytes: state.bufs.mapped_bytes(),
            root_count: state.roots.len(),
            thread_count: state.threads.thread_count(),
            paused_count: state.threads.paused_count(),
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let (collector, mut cx) = state.context(&self.descriptors);
        collector.collect(CollectFlags::CLEAR_ALL, &mut cx);
        tracing::debug!(target: "ming::gc", heap = self.id, "heap dropped");
    }
}
