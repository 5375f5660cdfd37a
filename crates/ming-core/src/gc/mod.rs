//! Garbage collection system
//!
//! This module provides the incremental mark-sweep collector and the
//! allocators it manages.
//!
//! # Architecture
//!
//! - **mmap**: page-granular mappings from the OS
//! - **pool / cells**: fixed-size cells grouped by object type, each pool
//!   carrying a 2-bit mark bitmap
//! - **buffer**: variable-size buffers (strings, value arrays, code)
//! - **descriptor**: per-type size, scan and finalize callbacks
//! - **roots**: reference-counted explicit roots
//! - **collector**: the tri-color state machine
//! - **heap**: the runtime context tying everything to the GC lock
//!
//! # Cell Pool Layout
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ mark bitmap (2 bits per cell, u64 words)│
//! ├─────────────────────────────────────────┤
//! │ cell 0                                  │
//! │ cell 1                                  │
//! │ ...                                     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use ming_core::{CollectFlags, GcConfig, Heap, ObjType};
//!
//! let heap = Heap::new(GcConfig::default()).unwrap();
//! let m = heap.attach();
//!
//! let (cell, slot) = m.alloc_cell(ObjType::OBJECT).unwrap();
//! m.promote(slot);
//! heap.add_root(cell);
//!
//! m.run_collection(CollectFlags::empty());
//! ```

pub mod buffer;
pub mod cells;
pub mod collector;
pub mod descriptor;
pub mod heap;
pub mod mmap;
pub mod pool;
pub mod roots;
pub mod stats;

pub use buffer::{BufFlags, BufferAllocator};
pub use cells::CellAllocator;
pub use collector::{CollectFlags, Collector, GcStatus, Tracer};
pub use descriptor::{DescriptorTable, DescriptorTableBuilder, ObjDescriptor, ObjType};
pub use heap::{Heap, Resolved};
pub use pool::Mark;
pub use roots::RootSet;
pub use stats::{GcStats, HeapStats};
