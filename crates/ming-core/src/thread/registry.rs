//! Thread records and the thread registry
//!
//! Every OS thread attached to a heap owns a [`ThreadRecord`]: its run
//! state, its new-born stack and its current actor. The registry keeps the
//! records together with the global `thread_count` / `paused_count`
//! counters and the world state driven by the safepoint coordinator.

use crate::defaults::MIN_NEWBORN_STACK;
use crate::handle::CellRef;
use crate::value::Value;
use crate::{GcError, GcResult};
use rustc_hash::FxHashMap;
use std::fmt;

/// Identifier of an attached thread, unique within one heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Raw id
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Run state of one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Executing runtime code
    Running,
    /// Parked at a safepoint (or running the collector)
    Paused,
    /// Outside the runtime between `leave` and `enter`
    Native,
}

impl ThreadState {
    /// Counted in `paused_count`
    #[inline]
    pub fn is_paused(self) -> bool {
        !matches!(self, ThreadState::Running)
    }
}

/// Position of an entry on a thread's new-born stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NewbornSlot(usize);

impl NewbornSlot {
    /// Stack position
    pub fn index(self) -> usize {
        self.0
    }
}

/// One new-born stack entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewbornEntry {
    /// The freshly allocated cell
    pub cell: CellRef,
    /// Set by `promote` once the cell is initialized
    pub scannable: bool,
}

/// Per-thread state
#[derive(Debug)]
pub struct ThreadRecord {
    id: ThreadId,
    state: ThreadState,
    newborn: Vec<NewbornEntry>,
    actor: Value,
}

impl ThreadRecord {
    fn new(id: ThreadId) -> Self {
        Self {
            id,
            state: ThreadState::Running,
            newborn: Vec::new(),
            actor: Value::null(),
        }
    }

    /// Thread id
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Current run state
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Current actor
    pub fn actor(&self) -> Value {
        self.actor
    }

    /// Replace the current actor
    pub fn set_actor(&mut self, actor: Value) {
        self.actor = actor;
    }

    /// Push a fresh, not yet scannable cell
    pub fn push_newborn(&mut self, cell: CellRef) -> NewbornSlot {
        if self.newborn.len() == self.newborn.capacity() {
            let target = (self.newborn.capacity() * 2).max(MIN_NEWBORN_STACK);
            self.newborn.reserve_exact(target - self.newborn.len());
            tracing::trace!(
                target: "ming::thread",
                thread = self.id.0,
                capacity = self.newborn.capacity(),
                "grew new-born stack"
            );
        }
        let slot = NewbornSlot(self.newborn.len());
        self.newborn.push(NewbornEntry {
            cell,
            scannable: false,
        });
        slot
    }

    /// Mark the entry at `slot` as initialized
    ///
    /// # Panics
    ///
    /// Panics if `slot` is above the top of the stack.
    pub fn promote(&mut self, slot: NewbornSlot) {
        let len = self.newborn.len();
        match self.newborn.get_mut(slot.0) {
            Some(entry) => entry.scannable = true,
            None => panic!("promote of slot {} above new-born top {}", slot.0, len),
        }
    }

    /// Current depth of the new-born stack
    pub fn newborn_level(&self) -> usize {
        self.newborn.len()
    }

    /// Drop every entry above `level`
    ///
    /// # Panics
    ///
    /// Panics if `level` is above the current depth.
    pub fn set_newborn_level(&mut self, level: usize) {
        assert!(
            level <= self.newborn.len(),
            "new-born level {} above current depth {}",
            level,
            self.newborn.len()
        );
        self.newborn.truncate(level);
    }

    /// Entries of the new-born stack, bottom first
    pub fn newborn(&self) -> &[NewbornEntry] {
        &self.newborn
    }

    pub(crate) fn clear_newborn(&mut self) {
        self.newborn.clear();
    }
}

/// World state as seen by every attached thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldState {
    /// Mutators run freely
    Running,
    /// A stop was requested; waiting for every thread to pause
    Stopping {
        /// Thread driving the stop, if attached
        by: Option<ThreadId>,
    },
    /// Every thread is paused
    Stopped {
        /// Thread driving the stop, if attached
        by: Option<ThreadId>,
    },
}

impl WorldState {
    /// No stop requested or in progress
    #[inline]
    pub fn is_running(self) -> bool {
        matches!(self, WorldState::Running)
    }
}

/// All thread records of a heap
#[derive(Debug)]
pub struct ThreadRegistry {
    records: FxHashMap<ThreadId, ThreadRecord>,
    next_id: u64,
    paused: usize,
    world: WorldState,
}

impl ThreadRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            records: FxHashMap::default(),
            next_id: 1,
            paused: 0,
            world: WorldState::Running,
        }
    }

    /// Add a running thread
    pub fn register(&mut self) -> ThreadId {
        let id = ThreadId(self.next_id);
        self.next_id += 1;
        self.records.insert(id, ThreadRecord::new(id));
        id
    }

    /// Remove a thread, returning its record
    pub fn unregister(&mut self, id: ThreadId) -> Option<ThreadRecord> {
        let record = self.records.remove(&id)?;
        if record.state.is_paused() {
            self.paused -= 1;
        }
        Some(record)
    }

    /// Record of a thread
    pub fn get(&self, id: ThreadId) -> GcResult<&ThreadRecord> {
        self.records.get(&id).ok_or(GcError::NotAttached)
    }

    /// Mutable record of a thread
    pub fn get_mut(&mut self, id: ThreadId) -> GcResult<&mut ThreadRecord> {
        self.records.get_mut(&id).ok_or(GcError::NotAttached)
    }

    /// Change a thread's run state, keeping `paused_count` in step
    ///
    /// # Panics
    ///
    /// Panics on an unknown thread or a transition to the current state.
    pub fn set_state(&mut self, id: ThreadId, state: ThreadState) {
        let record = self
            .records
            .get_mut(&id)
            .unwrap_or_else(|| panic!("{} is not registered", id));
        assert_ne!(record.state, state, "{} is already {:?}", id, state);

        match (record.state.is_paused(), state.is_paused()) {
            (false, true) => self.paused += 1,
            (true, false) => self.paused -= 1,
            _ => {}
        }
        record.state = state;
    }

    /// Iterate over every record
    pub fn records(&self) -> impl Iterator<Item = &ThreadRecord> {
        self.records.values()
    }

    /// Iterate mutably over every record
    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut ThreadRecord> {
        self.records.values_mut()
    }

    /// Number of attached threads
    #[inline]
    pub fn thread_count(&self) -> usize {
        self.records.len()
    }

    /// Number of paused or native threads
    #[inline]
    pub fn paused_count(&self) -> usize {
        self.paused
    }

    /// Every attached thread is paused
    #[inline]
    pub fn all_paused(&self) -> bool {
        self.paused == self.records.len()
    }

    /// Current world state
    #[inline]
    pub fn world(&self) -> WorldState {
        self.world
    }

    pub(crate) fn set_world(&mut self, world: WorldState) {
        self.world = world;
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Access to the thread registry inside the locked heap state
pub trait ThreadsMut {
    /// The registry
    fn threads_mut(&mut self) -> &mut ThreadRegistry;
}

impl ThreadsMut for ThreadRegistry {
    fn threads_mut(&mut self) -> &mut ThreadRegistry {
        self
    }
}
