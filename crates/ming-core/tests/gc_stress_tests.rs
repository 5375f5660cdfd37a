//! Garbage Collection Stress Tests
//!
//! Tests validate GC correctness under load:
//! - Rapid allocation with allocation-triggered collection
//! - Deep and wide object graphs
//! - Buffer churn and fragmentation
//! - Concurrent allocation from many attached threads
//!
//! # Test Categories
//! - Basic stress tests (run in CI)
//! - Long-running tests (marked with #[ignore])
//!
//! # Running Tests
//! ```bash
//! # Run all GC stress tests (except long-running)
//! cargo test --test gc_stress_tests
//!
//! # Run all tests including long-running ones
//! cargo test --test gc_stress_tests -- --include-ignored
//! ```

use ming_core::{BufFlags, CellRef, CollectFlags, GcConfig, Heap, ObjType, PtrKind, Resolved, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Helper to create a heap with a specific trigger threshold
fn heap_with_trigger(trigger_bytes: usize) -> Arc<Heap> {
    Heap::new(GcConfig::default().trigger_bytes(trigger_bytes)).unwrap()
}

/// Upper bound on allocated cell bytes while `run_threads` is running
///
/// Every thread keeps at most one round of values alive, each at most a
/// pointer cell plus an object cell. Collections fire once allocation
/// passes the trigger and the growth ratio over that live set; the factor
/// of two absorbs allocations racing a pending stop.
fn allocation_ceiling(heap: &Heap, threads: usize, per_round: usize) -> usize {
    let table = heap.descriptors();
    let per_value = table.get(ObjType::PTR).unwrap().size + table.get(ObjType::OBJECT).unwrap().size;
    let live = threads * (per_round + 8) * per_value;
    let config = heap.config();
    2 * config.trigger_bytes.max(live * (100 + config.growth_percent) / 100)
}

/// Run allocating threads and return the peak of allocated cell bytes
/// sampled while they run
fn run_threads(heap: &Arc<Heap>, threads: usize, rounds: usize, per_round: usize) -> usize {
    let peak = AtomicUsize::new(0);
    let done = AtomicBool::new(false);

    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            while !done.load(Ordering::Acquire) {
                peak.fetch_max(heap.heap_stats().allocated_bytes, Ordering::Relaxed);
                thread::sleep(Duration::from_micros(50));
            }
        });

        let peak = &peak;
        let workers: Vec<_> = (0..threads)
            .map(|t| {
                s.spawn(move |_| {
                    let m = heap.attach();
                    let anchor = m.new_object(PtrKind::Array).unwrap();
                    let Some(Resolved::Array(list)) = heap.resolve(anchor) else {
                        panic!("anchor is not an array");
                    };

                    for round in 0..rounds {
                        m.scope(|m| {
                            for i in 0..per_round {
                                let v = match i % 3 {
                                    0 => m.new_object(PtrKind::Object).unwrap(),
                                    1 => m.new_number(i as f64 + 0.5).unwrap(),
                                    _ => m.new_string("stress").unwrap(),
                                };
                                // Keep the latest value of each kind reachable
                                m.store_slot(list, i % 3, v);
                            }
                            peak.fetch_max(heap.heap_stats().allocated_bytes, Ordering::Relaxed);
                        });
                        if round % 4 == t % 4 {
                            m.check();
                        }
                    }

                    for slot in 0..3 {
                        assert!(heap.resolve(heap.load_slot(list, slot).unwrap()).is_some());
                    }
                })
            })
            .collect();

        let results: Vec<_> = workers.into_iter().map(|w| w.join()).collect();
        done.store(true, Ordering::Release);
        for result in results {
            result.unwrap();
        }
    })
    .unwrap();

    peak.into_inner()
}

// ===== Rapid Allocation Tests =====

#[test]
fn test_rapid_allocation_and_collection() {
    let heap = heap_with_trigger(64 * 1024);
    let m = heap.attach();

    for _ in 0..100 {
        m.scope(|m| {
            for _ in 0..1_000 {
                m.alloc_cell(ObjType::OBJECT).unwrap();
            }
        });
    }

    let stats = heap.stats();
    assert!(stats.collections > 10);
    // Garbage never piles up past the trigger by more than a round
    assert!(heap.heap_stats().allocated_bytes <= 64 * 1024 + 1_000 * 32 * 2);
}

#[test]
fn test_survivors_accumulate_without_loss() {
    let heap = heap_with_trigger(16 * 1024);
    let m = heap.attach();

    let mut survivors: Vec<(Value, CellRef)> = Vec::new();
    for i in 0..2_000 {
        m.scope(|m| {
            let v = m.new_object(PtrKind::Object).unwrap();
            if i % 10 == 0 {
                heap.add_root(v.cell().unwrap());
                let Some(Resolved::Object(target)) = heap.resolve(v) else {
                    panic!("expected object");
                };
                m.store_slot(target, 0, Value::int(i));
                survivors.push((v, target));
            }
        });
    }

    m.run_collection(CollectFlags::empty());
    assert_eq!(heap.heap_stats().live_cells, survivors.len() * 2);
    for (i, (_, target)) in survivors.iter().enumerate() {
        assert_eq!(heap.load_slot(*target, 0), Some(Value::int(i as i32 * 10)));
    }
}

// ===== Graph Shape Tests =====

#[test]
fn test_deep_linked_list() {
    let heap = Heap::new(GcConfig::default().gray_stack_capacity(8)).unwrap();
    let m = heap.attach();

    let head = m.scope(|m| {
        let mut next = Value::null();
        for i in 0..10_000 {
            let node = m.new_object(PtrKind::Object).unwrap();
            let Some(Resolved::Object(cell)) = heap.resolve(node) else {
                panic!("expected object");
            };
            m.store_slot(cell, 0, next);
            m.store_slot(cell, 1, Value::int(i));
            next = node;
        }
        next
    });
    heap.add_root(head.cell().unwrap());

    m.run_collection(CollectFlags::empty());
    assert_eq!(heap.heap_stats().live_cells, 20_000);
    assert_eq!(heap.stats().last_marked_count, 20_000);

    heap.remove_root(head.cell().unwrap());
    m.run_collection(CollectFlags::empty());
    assert_eq!(heap.heap_stats().live_cells, 0);
}

#[test]
fn test_wide_graph_with_tiny_gray_stack() {
    let heap = Heap::new(GcConfig::default().gray_stack_capacity(2)).unwrap();
    let m = heap.attach();

    let buf = heap.alloc_value_buf(256).unwrap();
    m.scope(|m| {
        for i in 0..256 {
            let (frame, slot) = m.alloc_cell(ObjType::FRAME).unwrap();
            m.promote(slot);
            for j in 0..8 {
                let v = m.new_object(PtrKind::Closure).unwrap();
                m.store_slot(frame, j, v);
            }
            unsafe { buf.as_ptr().add(i).write(Value::ptr(frame)) };
        }
    });

    m.run_collection(CollectFlags::empty());
    let stats = heap.stats();
    assert!(stats.gray_rescans > 0);
    assert_eq!(stats.last_freed_count, 0);
    assert_eq!(heap.heap_stats().live_cells, 256 * (1 + 8 * 2));

    heap.free_value_buf(buf, 256);
    m.run_collection(CollectFlags::empty());
    assert_eq!(heap.heap_stats().live_cells, 0);
}

// ===== Buffer Tests =====

#[test]
fn test_buffer_fragmentation_resistance() {
    let heap = heap_with_trigger(1 << 30);
    let mut live: Vec<(*mut u8, usize)> = Vec::new();

    for round in 0..20 {
        for i in 0..200 {
            let size = 8 + ((i * 37 + round * 11) % 512);
            let p = heap.alloc_buf(size, BufFlags::empty()).unwrap().as_ptr();
            unsafe { p.write(i as u8) };
            live.push((p, size));
        }
        // Free every other buffer to leave holes
        let mut kept = Vec::new();
        for (i, (p, size)) in live.drain(..).enumerate() {
            if i % 2 == 0 {
                heap.free_buf(p, size, BufFlags::empty());
            } else {
                kept.push((p, size));
            }
        }
        live = kept;
    }
    for (p, size) in live.drain(..) {
        heap.free_buf(p, size, BufFlags::empty());
    }

    let stats = heap.heap_stats();
    assert_eq!(stats.buffer_bytes, 0);
    // Coalescing keeps the arena count small
    assert!(stats.buffer_mapped_bytes <= 16 * GcConfig::default().buffer_arena_size);
}

#[test]
fn test_string_churn_releases_buffers() {
    let heap = heap_with_trigger(32 * 1024);
    let m = heap.attach();

    for i in 0..5_000 {
        m.scope(|m| {
            let s = "x".repeat(1 + i % 200);
            m.new_string(&s).unwrap();
        });
    }
    m.run_collection(CollectFlags::empty());
    assert_eq!(heap.heap_stats().buffer_bytes, 0);
    assert_eq!(heap.heap_stats().live_cells, 0);
}

// ===== Concurrent Allocation Tests =====

#[test]
fn test_concurrent_allocation() {
    let heap = heap_with_trigger(128 * 1024);
    let peak = run_threads(&heap, 16, 20, 1024);
    assert!(peak <= allocation_ceiling(&heap, 16, 1024));

    let stats = heap.heap_stats();
    assert_eq!(stats.thread_count, 0);
    assert_eq!(stats.paused_count, 0);
    assert!(heap.stats().collections > 0);

    heap.collect(CollectFlags::empty());
    let stats = heap.heap_stats();
    assert_eq!(stats.live_cells, 0);
    assert_eq!(stats.buffer_bytes, 0);
}

#[test]
fn test_memory_bounded_across_cycles() {
    let heap = heap_with_trigger(64 * 1024);
    let (threads, rounds, per_round) = (8, 40, 256);
    let peak = run_threads(&heap, threads, rounds, per_round);

    let ceiling = allocation_ceiling(&heap, threads, per_round);
    assert!(peak > 0);
    assert!(peak <= ceiling, "peak {} above ceiling {}", peak, ceiling);
    assert!(heap.stats().collections > 1);
    // Without collection every round would still be resident
    assert!(ceiling < threads * rounds * per_round * 20);
}

#[test]
fn test_concurrent_incremental_allocation() {
    let heap = Heap::new(GcConfig::default().trigger_bytes(64 * 1024).incremental_trigger(true)).unwrap();
    run_threads(&heap, 8, 10, 512);

    let stats = heap.stats();
    assert!(stats.steps >= stats.collections * 3);
    assert_eq!(heap.heap_stats().thread_count, 0);
}

#[test]
#[ignore]
fn test_concurrent_allocation_long() {
    let heap = heap_with_trigger(128 * 1024);
    let peak = run_threads(&heap, 64, 100, 1024);
    assert!(peak <= allocation_ceiling(&heap, 64, 1024));

    assert_eq!(heap.heap_stats().thread_count, 0);
    heap.collect(CollectFlags::empty());
    assert_eq!(heap.heap_stats().live_cells, 0);
}
