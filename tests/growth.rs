//! Growth must never lose or duplicate an entry, no matter how many threads
//! are hammering the map while the table doubles underneath them.

use scurry::IntMap;
use std::sync::Arc;
use std::thread;

#[test]
fn growth_keeps_every_key() {
    let map = IntMap::<i32>::with_capacity(16);
    let guard = map.guard();
    const N: i32 = if cfg!(debug_assertions) { 100_000 } else { 1_000_000 };
    for i in 0..N {
        map.insert(i, !i, &guard);
    }
    assert_eq!(map.len(), N as usize);
    for i in 0..N {
        assert_eq!(map.get(i, &guard), Some(&!i), "key {} lost by growth", i);
    }
}

#[test]
fn concurrent_growth_distinct_ranges() {
    let threads = num_cpus::get().clamp(2, 8) as i32;
    let per_thread: i32 = 50_000;
    let map = Arc::new(IntMap::<i32>::with_capacity(16));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                let start = t * per_thread;
                for i in start..start + per_thread {
                    let guard = map.guard();
                    map.insert(i, i.wrapping_mul(31), &guard);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("failed to join thread");
    }

    assert_eq!(map.len(), (threads * per_thread) as usize);
    let guard = map.guard();
    for i in 0..threads * per_thread {
        assert_eq!(map.get(i, &guard), Some(&i.wrapping_mul(31)));
    }
}

#[test]
fn concurrent_inserts_and_removes_reconcile() {
    // every key is inserted twice and removed once across racing threads;
    // after the dust settles each key must be present exactly once
    let map = Arc::new(IntMap::<i32>::with_capacity(16));
    const KEYS: i32 = 20_000;

    let writers: Vec<_> = (0..2)
        .map(|_| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 0..KEYS {
                    let guard = map.guard();
                    map.insert(i, i, &guard);
                }
            })
        })
        .collect();
    let remover = {
        let map = Arc::clone(&map);
        thread::spawn(move || {
            for i in 0..KEYS {
                let guard = map.guard();
                map.remove(i, &guard);
            }
        })
    };
    for w in writers {
        w.join().expect("failed to join writer");
    }
    remover.join().expect("failed to join remover");

    // re-insert everything so the final state is deterministic
    let guard = map.guard();
    for i in 0..KEYS {
        map.insert(i, i, &guard);
    }
    assert_eq!(map.len(), KEYS as usize);
    for i in 0..KEYS {
        assert_eq!(map.get(i, &guard), Some(&i));
    }
}

#[test]
fn size_reconciles_after_quiescence() {
    let map = Arc::new(IntMap::<usize>::with_capacity(16));
    let threads = 4;
    let per_thread = 10_000;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                // all threads fight over the same key range
                for i in 0..per_thread {
                    let guard = map.guard();
                    map.insert(i, t as usize, &guard);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("failed to join thread");
    }

    // inserts of the same key from many threads must deduplicate
    assert_eq!(map.len(), per_thread as usize);
    let guard = map.guard();
    let mut seen = 0;
    map.for_each(|_, _| seen += 1, &guard).unwrap();
    assert_eq!(seen, per_thread);
}
