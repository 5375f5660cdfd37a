//! Thread attachment and stop-the-world coordination
//!
//! - **registry**: per-thread records (run state, new-born stack, actor)
//! - **safepoint**: the pause/resume protocol on top of the GC lock
//! - **mutator**: the handle an attached OS thread uses to reach the heap

pub mod mutator;
pub mod registry;
pub mod safepoint;

pub use mutator::Mutator;
pub use registry::{NewbornEntry, NewbornSlot, ThreadId, ThreadRecord, ThreadRegistry, ThreadState, WorldState};
pub use safepoint::{SafepointCoordinator, SafepointStats};
