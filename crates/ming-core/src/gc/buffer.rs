//! Buffer allocator
//!
//! Variable-size, untraced memory (string bytes, array storage, code).
//! Small buffers are carved out of arena mappings; free ranges are indexed
//! both by address (for coalescing) and by size (for best fit). Buffers at
//! or above the big-buffer threshold get a mapping of their own.
//!
//! Buffers live in one of three spaces selected by their flags:
//! - `EXECUTABLE`: arenas mapped with execute permission
//! - `OLD` or `PERMANENT`: long-lived data
//! - otherwise: the new space
//!
//! `PTR` buffers are zero-filled and registered; the collector scans them
//! word by word as roots.

use crate::gc::mmap::Mapping;
use crate::GcResult;
use bitflags::bitflags;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::ptr::NonNull;

bitflags! {
    /// Buffer allocation flags
    pub struct BufFlags: u32 {
        /// Long-lived buffer, kept apart from the new space
        const OLD = 1 << 0;
        /// Mapped with execute permission
        const EXECUTABLE = 1 << 1;
        /// Holds `Value` words that must be scanned as roots
        const PTR = 1 << 2;
        /// Never released by the collector
        const PERMANENT = 1 << 3;
    }
}

const WORD: usize = std::mem::size_of::<u64>();

/// Round a buffer size up to word alignment
#[inline]
pub fn align_size(size: usize) -> usize {
    (size + WORD - 1) & !(WORD - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpaceKind {
    New,
    Old,
    Exec,
}

impl SpaceKind {
    fn of(flags: BufFlags) -> Self {
        if flags.contains(BufFlags::EXECUTABLE) {
            SpaceKind::Exec
        } else if flags.intersects(BufFlags::OLD | BufFlags::PERMANENT) {
            SpaceKind::Old
        } else {
            SpaceKind::New
        }
    }
}

/// One group of arenas with its free-range index
#[derive(Debug)]
struct Space {
    exec: bool,
    arenas: BTreeMap<usize, Mapping>,
    free_by_addr: BTreeMap<usize, usize>,
    free_by_size: BTreeSet<(usize, usize)>,
}

impl Space {
    fn new(exec: bool) -> Self {
        Self {
            exec,
            arenas: BTreeMap::new(),
            free_by_addr: BTreeMap::new(),
            free_by_size: BTreeSet::new(),
        }
    }

    fn insert_free(&mut self, addr: usize, len: usize) {
        self.free_by_addr.insert(addr, len);
        self.free_by_size.insert((len, addr));
    }

    fn remove_free(&mut self, addr: usize, len: usize) {
        self.free_by_addr.remove(&addr);
        self.free_by_size.remove(&(len, addr));
    }

    fn arena_of(&self, addr: usize) -> Option<&Mapping> {
        self.arenas
            .range(..=addr)
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| m.contains(addr))
    }

    fn same_arena(&self, a: usize, b: usize) -> bool {
        match (self.arena_of(a), self.arena_of(b)) {
            (Some(x), Some(y)) => x.as_ptr() == y.as_ptr(),
            _ => false,
        }
    }

    fn alloc(&mut self, size: usize, arena_size: usize) -> GcResult<usize> {
        let fit = self.free_by_size.range((size, 0)..).next().copied();
        let (len, addr) = match fit {
            Some(fit) => fit,
            None => {
                let map = if self.exec {
                    Mapping::new_exec(arena_size.max(size))?
                } else {
                    Mapping::new(arena_size.max(size))?
                };
                let (addr, len) = (map.as_ptr() as usize, map.len());
                self.arenas.insert(addr, map);
                tracing::trace!(target: "ming::gc", addr, len, exec = self.exec, "mapped buffer arena");
                (len, addr)
            }
        };
        if fit.is_some() {
            self.remove_free(addr, len);
        }
        if len > size {
            self.insert_free(addr + size, len - size);
        }
        Ok(addr)
    }

    /// Grow the buffer at `addr` from `old` to `new` bytes if the range
    /// directly after it is free
    fn grow_in_place(&mut self, addr: usize, old: usize, new: usize) -> bool {
        let next = addr + old;
        let Some(&len) = self.free_by_addr.get(&next) else {
            return false;
        };
        let extra = new - old;
        if len < extra {
            return false;
        }
        self.remove_free(next, len);
        if len > extra {
            self.insert_free(next + extra, len - extra);
        }
        true
    }

    fn release(&mut self, addr: usize, size: usize) {
        assert!(
            self.arena_of(addr).is_some_and(|m| m.contains(addr + size - 1)),
            "free of unknown buffer {:#x} ({} bytes)",
            addr,
            size
        );

        let (mut start, mut len) = (addr, size);

        if let Some((&prev, &prev_len)) = self.free_by_addr.range(..=addr).next_back() {
            assert!(
                prev + prev_len <= addr,
                "double free of buffer {:#x} ({} bytes)",
                addr,
                size
            );
            if prev + prev_len == addr && self.same_arena(prev, addr) {
                self.remove_free(prev, prev_len);
                start = prev;
                len += prev_len;
            }
        }

        let end = addr + size;
        if let Some((&next, &next_len)) = self.free_by_addr.range(addr..).next() {
            assert!(
                next >= end,
                "double free of buffer {:#x} ({} bytes)",
                addr,
                size
            );
            if next == end && self.same_arena(addr, next) {
                self.remove_free(next, next_len);
                len += next_len;
            }
        }

        self.insert_free(start, len);
    }

    fn mapped_bytes(&self) -> usize {
        self.arenas.values().map(Mapping::len).sum()
    }
}

/// Allocator for variable-size buffers
#[derive(Debug)]
pub struct BufferAllocator {
    arena_size: usize,
    big_threshold: usize,
    new_space: Space,
    old_space: Space,
    exec_space: Space,
    big: FxHashMap<usize, Mapping>,
    ptr_bufs: FxHashMap<usize, usize>,
    allocated_bytes: usize,
}

impl BufferAllocator {
    /// Create an allocator with the given arena size and big-buffer threshold
    pub fn new(arena_size: usize, big_threshold: usize) -> Self {
        Self {
            arena_size,
            big_threshold,
            new_space: Space::new(false),
            old_space: Space::new(false),
            exec_space: Space::new(true),
            big: FxHashMap::default(),
            ptr_bufs: FxHashMap::default(),
            allocated_bytes: 0,
        }
    }

    fn space(&mut self, kind: SpaceKind) -> &mut Space {
        match kind {
            SpaceKind::New => &mut self.new_space,
            SpaceKind::Old => &mut self.old_space,
            SpaceKind::Exec => &mut self.exec_space,
        }
    }

    /// Allocate `size` bytes
    ///
    /// A zero-sized request returns a dangling, word-aligned pointer that
    /// must not be dereferenced.
    pub fn alloc(&mut self, size: usize, flags: BufFlags) -> GcResult<NonNull<u8>> {
        if size == 0 {
            return Ok(NonNull::<u64>::dangling().cast());
        }
        let size = align_size(size);

        let addr = if size >= self.big_threshold {
            let map = if flags.contains(BufFlags::EXECUTABLE) {
                Mapping::new_exec(size)?
            } else {
                Mapping::new(size)?
            };
            let addr = map.as_ptr() as usize;
            self.big.insert(addr, map);
            addr
        } else {
            let arena_size = self.arena_size;
            self.space(SpaceKind::of(flags)).alloc(size, arena_size)?
        };

        if flags.contains(BufFlags::PTR) {
            // SAFETY: addr..addr+size was just handed out by this allocator.
            unsafe { std::ptr::write_bytes(addr as *mut u8, 0, size) };
            self.ptr_bufs.insert(addr, size);
        }

        self.allocated_bytes += size;
        Ok(NonNull::new(addr as *mut u8).unwrap_or_else(|| unreachable!("mapped null address")))
    }

    /// Resize a buffer
    ///
    /// - a null `ptr` or zero `old` behaves like [`BufferAllocator::alloc`]
    /// - a zero `new` frees the buffer and returns null
    /// - a `new` not above `old` returns `ptr` unchanged; the tail past
    ///   `new` is released at once, so the buffer must later be freed or
    ///   resized with `new` as its size
    /// - otherwise the buffer grows in place when possible, or moves and
    ///   the old contents are copied
    pub fn realloc(&mut self, ptr: *mut u8, old: usize, new: usize, flags: BufFlags) -> GcResult<*mut u8> {
        if ptr.is_null() || old == 0 {
            if new == 0 {
                return Ok(std::ptr::null_mut());
            }
            return self.alloc(new, flags).map(NonNull::as_ptr);
        }
        if new == 0 {
            self.free(ptr, old, flags);
            return Ok(std::ptr::null_mut());
        }

        let (old, new) = (align_size(old), align_size(new));
        let addr = ptr as usize;

        if new <= old {
            if new < old {
                // Big mappings keep their pages until the buffer is freed
                if !self.big.contains_key(&addr) {
                    let kind = SpaceKind::of(flags);
                    self.space(kind).release(addr + new, old - new);
                }
                self.allocated_bytes -= old - new;
                if let Some(len) = self.ptr_bufs.get_mut(&addr) {
                    *len = new;
                }
            }
            return Ok(ptr);
        }

        if let Some(map) = self.big.get(&addr) {
            if map.len() >= new {
                self.grew(addr, old, new);
                return Ok(ptr);
            }
        } else if new < self.big_threshold {
            let kind = SpaceKind::of(flags);
            if self.space(kind).grow_in_place(addr, old, new) {
                self.grew(addr, old, new);
                return Ok(ptr);
            }
        }

        let moved = self.alloc(new, flags)?;
        // SAFETY: both ranges are live buffers of at least `old` bytes and
        // distinct allocations never overlap.
        unsafe { std::ptr::copy_nonoverlapping(ptr, moved.as_ptr(), old) };
        self.free(ptr, old, flags);
        Ok(moved.as_ptr())
    }

    fn grew(&mut self, addr: usize, old: usize, new: usize) {
        if let Some(len) = self.ptr_bufs.get_mut(&addr) {
            // SAFETY: addr+old..addr+new now belongs to this buffer.
            unsafe { std::ptr::write_bytes((addr + old) as *mut u8, 0, new - old) };
            *len = new;
        }
        self.allocated_bytes += new - old;
    }

    /// Free a buffer; a null `ptr` or zero `size` is a no-op
    ///
    /// `size` is the size of the last allocation or resize of the buffer.
    ///
    /// # Panics
    ///
    /// Panics if the range was not allocated by this allocator or is
    /// already free.
    pub fn free(&mut self, ptr: *mut u8, size: usize, flags: BufFlags) {
        if ptr.is_null() || size == 0 {
            return;
        }
        let size = align_size(size);
        let addr = ptr as usize;

        self.ptr_bufs.remove(&addr);

        if self.big.remove(&addr).is_some() {
            // Dropping the mapping unmaps it
        } else {
            self.space(SpaceKind::of(flags)).release(addr, size);
        }
        self.allocated_bytes -= size;
    }

    /// Registered `PTR` buffers as `(address, bytes)` pairs
    pub fn ptr_buffers(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.ptr_bufs.iter().map(|(a, l)| (*a, *l))
    }

    /// Bytes handed out and not yet freed
    #[inline]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Bytes mapped for arenas and big buffers
    pub fn mapped_bytes(&self) -> usize {
        self.new_space.mapped_bytes()
            + self.old_space.mapped_bytes()
            + self.exec_space.mapped_bytes()
            + self.big.values().map(Mapping::len).sum::<usize>()
    }
}
