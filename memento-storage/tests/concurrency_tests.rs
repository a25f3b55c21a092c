//! Concurrency tests: many threads sharing one cache handle
//!
//! Tests verify:
//! - Concurrent puts that share a result never lose a reference
//! - Interleaved put/invalidate/sweep leave a converged store

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use memento_test_utils::assertions::*;
use memento_test_utils::fixtures::TestCache;
use serde_json::json;

const THREADS: usize = 8;

#[test]
fn test_concurrent_puts_count_every_reference() {
    let (cache, _dir) = TestCache::new().into_parts();
    let cache = Arc::new(cache);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..10 {
                    cache
                        .put(&json!({"thread": t, "i": i}), &"shared-result")
                        .expect("put should succeed");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread should not panic");
    }

    assert_reference_count(&cache, "shared-result", (THREADS * 10) as u64);
    assert_eq!(cache.stats().expect("stats").entry_count, (THREADS * 10) as u64);
    assert_converged(&cache);
}

#[test]
fn test_mixed_operations_converge() {
    let (cache, _dir) = TestCache::with_ttl(Duration::from_millis(5)).into_parts();
    let cache = Arc::new(cache);
    let barrier = Arc::new(Barrier::new(THREADS + 1));

    let writers: Vec<_> = (0..THREADS)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..20i64 {
                    let request = json!({"slot": (t as i64 + i) % 5});
                    match i % 3 {
                        0 | 1 => cache.put(&request, &(i % 4)).expect("put should succeed"),
                        _ => {
                            cache.invalidate(&request).expect("invalidate should succeed");
                        }
                    }
                    let _ = cache.get::<_, i64>(&request);
                }
            })
        })
        .collect();

    let sweeper = {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..10 {
                cache.sweep_expired().expect("sweep should succeed");
                thread::sleep(Duration::from_millis(2));
            }
        })
    };

    for handle in writers {
        handle.join().expect("writer should not panic");
    }
    sweeper.join().expect("sweeper should not panic");

    // Counts, index and blobs agree even with entries still unswept.
    assert_converged(&cache);

    thread::sleep(Duration::from_millis(10));
    cache.sweep_expired().expect("final sweep");
    let stats = cache.stats().expect("stats");
    assert_eq!(stats.entry_count, 0);
    assert_eq!(stats.result_count, 0);
    assert_eq!(stats.total_bytes, 0);
}
