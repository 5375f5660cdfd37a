//! Integration tests for stop-the-world coordination
//!
//! Every test attaches real OS threads to a heap. A thread that blocks on
//! something other than the heap must `leave` first, or the next stop would
//! wait for it forever.

use crossbeam::channel;
use ming_core::{CollectFlags, GcConfig, Heap, ObjType, PtrKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn heap() -> Arc<Heap> {
    Heap::new(GcConfig::default()).unwrap()
}

#[test]
fn test_collect_without_threads() {
    let heap = heap();
    heap.collect(CollectFlags::empty());
    assert_eq!(heap.safepoint_stats().total_stops(), 1);
    assert_eq!(heap.safepoint_stats().total_parks(), 0);
}

#[test]
fn test_attached_caller_collects_as_itself() {
    let heap = heap();
    let m = heap.attach();
    heap.collect(CollectFlags::empty());
    m.run_collection(CollectFlags::empty());

    let stats = heap.heap_stats();
    assert_eq!(stats.thread_count, 1);
    assert_eq!(stats.paused_count, 0);
    assert_eq!(heap.stats().collections, 2);
}

#[test]
fn test_collect_waits_for_polling_thread() {
    let heap = heap();
    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = channel::bounded(1);

    let worker = {
        let heap = Arc::clone(&heap);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let m = heap.attach();
            ready_tx.send(()).unwrap();
            let mut allocated = 0usize;
            while !stop.load(Ordering::Acquire) {
                m.scope(|m| {
                    m.alloc_cell(ObjType::OBJECT).unwrap();
                });
                m.check();
                allocated += 1;
            }
            allocated
        })
    };

    ready_rx.recv().unwrap();
    for _ in 0..10 {
        heap.collect(CollectFlags::empty());
    }
    stop.store(true, Ordering::Release);
    let allocated = worker.join().unwrap();

    assert!(allocated > 0);
    assert!(heap.safepoint_stats().total_parks() >= 10);
    let stats = heap.heap_stats();
    assert_eq!(stats.thread_count, 0);
    assert_eq!(stats.paused_count, 0);
}

#[test]
fn test_native_thread_does_not_block_collection() {
    let heap = heap();
    let (ready_tx, ready_rx) = channel::bounded(1);
    let (go_tx, go_rx) = channel::bounded::<()>(1);

    let worker = {
        let heap = Arc::clone(&heap);
        thread::spawn(move || {
            let m = heap.attach();
            let kept = m.new_object(PtrKind::Array).unwrap();
            heap.add_root(kept.cell().unwrap());

            m.leave();
            ready_tx.send(()).unwrap();
            go_rx.recv().unwrap();
            m.enter();

            assert!(!heap.is_null(kept));
            m.check();
        })
    };

    ready_rx.recv().unwrap();
    assert_eq!(heap.heap_stats().paused_count, 1);
    heap.collect(CollectFlags::empty());
    heap.collect(CollectFlags::empty());
    assert_eq!(heap.safepoint_stats().total_parks(), 0);

    go_tx.send(()).unwrap();
    worker.join().unwrap();
    assert_eq!(heap.heap_stats().thread_count, 0);
}

#[test]
fn test_detach_releases_waiting_collector() {
    let heap = heap();
    let (ready_tx, ready_rx) = channel::bounded(1);

    let worker = {
        let heap = Arc::clone(&heap);
        thread::spawn(move || {
            let m = heap.attach();
            ready_tx.send(()).unwrap();
            // Never polls; exits while the collector waits
            thread::sleep(Duration::from_millis(50));
            drop(m);
        })
    };

    ready_rx.recv().unwrap();
    heap.collect(CollectFlags::empty());
    assert_eq!(heap.heap_stats().thread_count, 0);
    worker.join().unwrap();
}

#[test]
fn test_competing_collectors() {
    let heap = heap();
    let rounds = AtomicUsize::new(0);

    crossbeam::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|_| {
                let m = heap.attach();
                for _ in 0..25 {
                    m.scope(|m| {
                        for _ in 0..16 {
                            m.alloc_cell(ObjType::CLOSURE).unwrap();
                        }
                        m.run_collection(CollectFlags::empty());
                    });
                    rounds.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    })
    .unwrap();

    assert_eq!(rounds.load(Ordering::Relaxed), 100);
    assert!(heap.stats().collections >= 100);
    let stats = heap.heap_stats();
    assert_eq!(stats.thread_count, 0);
    assert_eq!(stats.paused_count, 0);

    heap.collect(CollectFlags::empty());
    assert_eq!(heap.heap_stats().live_cells, 0);
}

#[test]
fn test_incremental_steps_across_threads() {
    let heap = Heap::new(GcConfig::default().trigger_bytes(8 * 1024).incremental_trigger(true)).unwrap();

    crossbeam::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|_| {
                let m = heap.attach();
                let kept = m.new_object(PtrKind::Object).unwrap();
                m.set_actor(kept);
                for _ in 0..200 {
                    m.scope(|m| {
                        for _ in 0..8 {
                            m.new_object(PtrKind::Array).unwrap();
                        }
                    });
                    assert!(!heap.is_null(m.actor()));
                }
            });
        }
    })
    .unwrap();

    let stats = heap.stats();
    assert!(stats.collections > 0);
    assert!(stats.steps >= stats.collections * 3);
}
