//! Ming Runtime Memory Core
//!
//! This crate provides the memory-management layer of the Ming runtime:
//! - Tagged word value encoding
//! - Pool-based cell allocator with 2-bit mark bitmaps
//! - Buffer allocator for variable-size data
//! - Incremental tri-color mark-sweep garbage collector
//! - Explicit root set
//! - Stop-the-world thread coordination (safepoints)
//!
//! A [`Heap`] is the runtime context. Each OS thread that touches the heap
//! attaches to it and receives a [`Mutator`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod defaults;
pub mod gc;
pub mod handle;
pub mod thread;
pub mod value;

pub use config::GcConfig;
pub use gc::{
    BufFlags, CollectFlags, DescriptorTable, GcStats, GcStatus, Heap, HeapStats, Mark,
    ObjDescriptor, ObjType, Resolved, Tracer,
};
pub use handle::{CellRef, PoolId};
pub use thread::{Mutator, NewbornSlot, ThreadId};
pub use value::{PtrKind, PtrTarget, Tag, Unpacked, Value};

/// Memory management errors
#[derive(Debug, thiserror::Error)]
pub enum GcError {
    /// The operating system refused to map memory
    #[error("Out of memory: failed to map {requested} bytes")]
    OutOfMemory {
        /// Size of the failed request in bytes
        requested: usize,
    },

    /// Configuration rejected by validation
    #[error("Invalid GC configuration: {0}")]
    InvalidConfig(String),

    /// Allocation with an object type missing from the descriptor table
    #[error("Unknown object type: {0}")]
    UnknownType(u16),

    /// Integer does not fit an immediate value
    #[error("Integer out of immediate range: {0}")]
    IntOutOfRange(i64),

    /// The calling thread is not attached to the heap
    #[error("Thread is not attached to the heap")]
    NotAttached,
}

/// Memory management result
pub type GcResult<T> = Result<T, GcError>;
