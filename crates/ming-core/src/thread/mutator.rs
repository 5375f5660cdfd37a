//! Per-thread access to a heap
//!
//! A [`Mutator`] binds the current OS thread to a [`ThreadRecord`] in a
//! heap's registry. The binding lives in thread-local storage keyed by heap
//! id and is reference counted, so nested attaches on one thread share one
//! record. The record is removed when the last `Mutator` of the thread is
//! dropped.
//!
//! Cells returned by [`Mutator::alloc_cell`] sit on the thread's new-born
//! stack and cannot be freed until the stack is cut below them. Until
//! [`Mutator::promote`] is called their contents are not scanned, so a
//! half-initialized cell never exposes garbage words to the collector.

use crate::gc::buffer::BufFlags;
use crate::gc::collector::CollectFlags;
use crate::gc::descriptor::ObjType;
use crate::gc::heap::{Heap, HeapState};
use crate::handle::CellRef;
use crate::thread::registry::{NewbornSlot, ThreadId, ThreadRecord};
use crate::value::{PtrKind, PtrTarget, Unpacked, Value};
use crate::GcResult;
use parking_lot::MutexGuard;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

thread_local! {
    /// heap id -> (thread id, attach count)
    static BINDINGS: RefCell<FxHashMap<u64, (ThreadId, usize)>> = RefCell::new(FxHashMap::default());
}

/// Thread id the calling thread holds in the given heap, if attached
pub(crate) fn bound_thread(heap_id: u64) -> Option<ThreadId> {
    BINDINGS
        .try_with(|b| b.borrow().get(&heap_id).map(|&(id, _)| id))
        .ok()
        .flatten()
}

pub(crate) fn attach(heap: &Arc<Heap>) -> Mutator {
    let existing = BINDINGS.with(|b| {
        b.borrow_mut().get_mut(&heap.id()).map(|(id, count)| {
            *count += 1;
            *id
        })
    });

    let id = match existing {
        Some(id) => id,
        None => {
            let id = {
                let mut guard = heap.lock();
                heap.coordinator().register(&mut guard)
            };
            BINDINGS.with(|b| b.borrow_mut().insert(heap.id(), (id, 1)));
            id
        }
    };

    Mutator {
        heap: Arc::clone(heap),
        id,
        _not_send: PhantomData,
    }
}

fn record(state: &mut HeapState, id: ThreadId) -> &mut ThreadRecord {
    match state.threads.get_mut(id) {
        Ok(record) => record,
        Err(_) => panic!("{} has no thread record", id),
    }
}

/// An attached thread's handle to a heap
///
/// Not `Send`: the handle is tied to the thread that attached.
pub struct Mutator {
    heap: Arc<Heap>,
    id: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl Mutator {
    /// The heap this thread is attached to
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Thread id within the heap
    pub fn id(&self) -> ThreadId {
        self.id
    }

    // ===== Allocation =====

    /// Allocate a zeroed cell of type `ty`
    ///
    /// The cell is pushed on the new-born stack. It stays alive until the
    /// stack is cut below `slot`, and is scanned only after
    /// [`promote`](Self::promote). May run a collection first if the
    /// allocation trigger fires.
    pub fn alloc_cell(&self, ty: ObjType) -> GcResult<(CellRef, NewbornSlot)> {
        let mut guard = self.heap.lock();
        self.alloc_locked(&mut guard, ty)
    }

    fn alloc_locked(&self, guard: &mut MutexGuard<'_, HeapState>, ty: ObjType) -> GcResult<(CellRef, NewbornSlot)> {
        self.heap.coordinator().check(guard, self.id);

        let state = &mut **guard;
        let mark = state.collector.alloc_mark();
        let cell = state.cells.alloc(ty, mark)?;
        let slot = state.threads.get_mut(self.id)?.push_newborn(cell);

        if self.heap.should_collect(state) {
            self.heap.collect_locked(guard, Some(self.id), self.heap.trigger_flags(), false);
        }
        Ok((cell, slot))
    }

    /// Allocate, initialize and promote a cell in one locked section
    fn new_cell<F>(&self, ty: ObjType, init: F) -> GcResult<CellRef>
    where
        F: FnOnce(&mut HeapState, CellRef) -> GcResult<()>,
    {
        let mut guard = self.heap.lock();
        let (cell, slot) = self.alloc_locked(&mut guard, ty)?;
        init(&mut *guard, cell)?;
        record(&mut guard, self.id).promote(slot);
        Ok(cell)
    }

    /// Mark a new-born cell initialized so the collector scans it
    pub fn promote(&self, slot: NewbornSlot) {
        let mut guard = self.heap.lock();
        record(&mut guard, self.id).promote(slot);
    }

    /// Current depth of the new-born stack
    pub fn newborn_level(&self) -> usize {
        let mut guard = self.heap.lock();
        record(&mut guard, self.id).newborn_level()
    }

    /// Cut the new-born stack back to `level`
    ///
    /// # Panics
    ///
    /// Panics if `level` is above the current depth.
    pub fn set_newborn_level(&self, level: usize) {
        let mut guard = self.heap.lock();
        record(&mut guard, self.id).set_newborn_level(level);
    }

    /// Run `f`, then drop every new-born entry it pushed
    pub fn scope<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        struct Restore<'m> {
            mutator: &'m Mutator,
            level: usize,
        }

        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                let mut guard = self.mutator.heap.lock();
                let record = record(&mut guard, self.mutator.id);
                if record.newborn_level() > self.level {
                    record.set_newborn_level(self.level);
                }
            }
        }

        let _restore = Restore {
            mutator: self,
            level: self.newborn_level(),
        };
        f(self)
    }

    // ===== Value constructors =====

    /// Box a double
    pub fn new_double(&self, d: f64) -> GcResult<Value> {
        let descriptors = self.heap.descriptors();
        let cell = self.new_cell(ObjType::DOUBLE, |state, cell| {
            state.write_word(cell, 0, d.to_bits(), descriptors);
            Ok(())
        })?;
        Ok(Value::double(cell))
    }

    /// Encode a number: an integer immediate when exact, a boxed double otherwise
    pub fn new_number(&self, d: f64) -> GcResult<Value> {
        match Value::int_from_f64(d) {
            Some(value) => Ok(value),
            None => self.new_double(d),
        }
    }

    /// Allocate a string cell holding a copy of `s`
    pub fn new_string(&self, s: &str) -> GcResult<Value> {
        let descriptors = self.heap.descriptors();
        let cell = self.new_cell(ObjType::STRING, |state, cell| {
            if s.is_empty() {
                return Ok(());
            }
            let buf = state.bufs.alloc(s.len(), BufFlags::empty())?;
            // SAFETY: the buffer holds at least `s.len()` bytes.
            unsafe { std::ptr::copy_nonoverlapping(s.as_ptr(), buf.as_ptr(), s.len()) };
            state.write_word(cell, 0, buf.as_ptr() as usize as u64, descriptors);
            state.write_word(cell, 1, s.len() as u64, descriptors);
            Ok(())
        })?;
        Ok(Value::string(cell))
    }

    /// Allocate a pointer cell naming `target`
    pub fn new_ref(&self, kind: PtrKind, target: CellRef) -> GcResult<Value> {
        let descriptors = self.heap.descriptors();
        let cell = self.new_cell(ObjType::PTR, |state, cell| {
            state.write_word(cell, 0, PtrTarget { kind, cell: target }.to_word(), descriptors);
            state.collector.shade_cell(target, &mut state.cells, descriptors);
            Ok(())
        })?;
        Ok(Value::ptr(cell))
    }

    /// Allocate an empty object, closure or array and a pointer cell to it
    pub fn new_object(&self, kind: PtrKind) -> GcResult<Value> {
        let ty = match kind {
            PtrKind::Object => ObjType::OBJECT,
            PtrKind::Closure => ObjType::CLOSURE,
            PtrKind::Array => ObjType::ARRAY,
        };
        let target = self.new_cell(ty, |_, _| Ok(()))?;
        self.new_ref(kind, target)
    }

    // ===== Stores =====

    /// Store `value` into slot `slot` of `cell`, with the write barrier
    ///
    /// Returns `false` if the cell is not allocated or the slot is out of
    /// range.
    pub fn store_slot(&self, cell: CellRef, slot: usize, value: Value) -> bool {
        let descriptors = self.heap.descriptors();
        let mut guard = self.heap.lock();
        let state = &mut *guard;
        if !state.write_word(cell, slot, value.to_bits(), descriptors) {
            return false;
        }
        state.collector.shade(value, &mut state.cells, descriptors);
        true
    }

    /// Point an existing pointer cell at a new target, or at nothing
    ///
    /// Returns `false` if `ptr` is not a live pointer cell.
    pub fn retarget(&self, ptr: Value, target: Option<PtrTarget>) -> bool {
        let Unpacked::Ptr(cell) = ptr.unpack() else {
            return false;
        };
        let descriptors = self.heap.descriptors();
        let mut guard = self.heap.lock();
        let state = &mut *guard;
        if state.cells.obj_type(cell) != Some(ObjType::PTR) {
            return false;
        }
        let word = target.map_or(0, PtrTarget::to_word);
        state.write_word(cell, 0, word, descriptors);
        if let Some(target) = target {
            state.collector.shade_cell(target.cell, &mut state.cells, descriptors);
        }
        true
    }

    /// Shade a reference stored through a raw cell pointer
    ///
    /// Stores made with [`store_slot`](Self::store_slot) already do this.
    /// Only needed while an incremental cycle is marking; otherwise this is
    /// a single atomic load.
    pub fn write_barrier(&self, value: Value) {
        if value.cell().is_none() || !self.heap.is_marking() {
            return;
        }
        let descriptors = self.heap.descriptors();
        let mut guard = self.heap.lock();
        let state = &mut *guard;
        state.collector.shade(value, &mut state.cells, descriptors);
    }

    // ===== Actor =====

    /// Set the thread's current actor (a root while set)
    pub fn set_actor(&self, actor: Value) {
        let mut guard = self.heap.lock();
        record(&mut guard, self.id).set_actor(actor);
    }

    /// The thread's current actor
    pub fn actor(&self) -> Value {
        let mut guard = self.heap.lock();
        record(&mut guard, self.id).actor()
    }

    // ===== Safepoints =====

    /// Safepoint poll
    ///
    /// Parks while another thread stops the world. The common case is one
    /// atomic load without taking the lock.
    #[inline]
    pub fn check(&self) {
        if self.heap.coordinator().is_pending() {
            let mut guard = self.heap.lock();
            self.heap.coordinator().check(&mut guard, self.id);
        }
    }

    /// Leave the runtime before blocking or running native code
    ///
    /// No heap operation may be made through this mutator until
    /// [`enter`](Self::enter). Calling it again while outside is a no-op.
    pub fn leave(&self) {
        let mut guard = self.heap.lock();
        self.heap.coordinator().leave(&mut guard, self.id);
    }

    /// Re-enter the runtime, waiting out any stop in progress
    ///
    /// Calling it while already inside is a no-op.
    pub fn enter(&self) {
        let mut guard = self.heap.lock();
        self.heap.coordinator().enter(&mut guard, self.id);
    }

    /// Run a collection as this thread
    pub fn run_collection(&self, flags: CollectFlags) {
        let mut guard = self.heap.lock();
        self.heap.collect_locked(&mut guard, Some(self.id), flags, true);
    }
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("heap", &self.heap.id())
            .field("thread", &self.id)
            .finish()
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        let heap_id = self.heap.id();
        let last = BINDINGS
            .try_with(|b| {
                let mut b = b.borrow_mut();
                match b.get_mut(&heap_id) {
                    Some((_, count)) if *count > 1 => {
                        *count -= 1;
                        false
                    }
                    _ => {
                        b.remove(&heap_id);
                        true
                    }
                }
            })
            .unwrap_or(true);

        if last {
            let mut guard = self.heap.lock();
            self.heap.coordinator().detach(&mut guard, self.id);
        }
    }
}
