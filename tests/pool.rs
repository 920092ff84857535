//! The worker pool contracts from the batch-pipeline side: every submitted
//! task runs exactly once, panics fail the pool fast, and idle workers cost
//! nothing once the burst is over.

use scurry::{IntMap, WorkerPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn ten_thousand_tasks_run_exactly_once() {
    let pool = WorkerPool::new(4, "burst");
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..10_000 {
        let ran = Arc::clone(&ran);
        pool.submit(move || {
            ran.fetch_add(1, Ordering::Relaxed);
        })
        .expect("the pool is live");
    }
    pool.shutdown_and_wait();
    assert_eq!(ran.load(Ordering::Relaxed), 10_000);
    assert_eq!(pool.live_threads(), 0);
}

#[test]
fn thread_cap_is_respected() {
    let pool = WorkerPool::new(2, "capped");
    let peak = Arc::new(AtomicUsize::new(0));
    let active = Arc::new(AtomicUsize::new(0));
    for _ in 0..200 {
        let peak = Arc::clone(&peak);
        let active = Arc::clone(&active);
        pool.submit(move || {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_micros(100));
            active.fetch_sub(1, Ordering::SeqCst);
        })
        .expect("the pool is live");
    }
    pool.shutdown_and_wait();
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[test]
fn panic_reaches_handler_exactly_once_and_pool_survives() {
    let caught = Arc::new(AtomicUsize::new(0));
    let pool = {
        let caught = Arc::clone(&caught);
        WorkerPool::new(2, "handled").with_panic_handler(move |_payload| {
            caught.fetch_add(1, Ordering::SeqCst);
        })
    };

    pool.submit(|| panic!("boom")).expect("the pool is live");

    // with a custom handler the pool keeps accepting and running work
    let ran = Arc::new(AtomicUsize::new(0));
    let deadline = Instant::now() + Duration::from_secs(5);
    while caught.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "handler never ran");
        thread::sleep(Duration::from_millis(1));
    }
    {
        let ran = Arc::clone(&ran);
        pool.submit(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        })
        .expect("a handled panic must not kill the pool");
    }
    pool.shutdown_and_wait();
    assert_eq!(caught.load(Ordering::SeqCst), 1);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(!pool.is_aborted());
}

#[test]
fn default_panic_policy_aborts_the_pool() {
    let pool = WorkerPool::new(2, "failfast");
    pool.submit(|| panic!("boom")).expect("the pool is live");

    let deadline = Instant::now() + Duration::from_secs(5);
    while !pool.is_aborted() {
        assert!(Instant::now() < deadline, "pool never aborted");
        thread::sleep(Duration::from_millis(1));
    }
    assert!(pool.submit(|| {}).is_err());
    pool.shutdown_and_wait();
}

#[test]
fn shutdown_now_discards_queued_work() {
    let pool = WorkerPool::new(1, "discarding").with_idle_timeout(Duration::from_millis(50));
    let ran = Arc::new(AtomicUsize::new(0));

    // one slow task to occupy the worker, then a backlog
    {
        let ran = Arc::clone(&ran);
        pool.submit(move || {
            thread::sleep(Duration::from_millis(100));
            ran.fetch_add(1, Ordering::SeqCst);
        })
        .expect("the pool is live");
    }
    for _ in 0..50 {
        let ran = Arc::clone(&ran);
        pool.submit(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        })
        .expect("the pool is live");
    }
    pool.shutdown_now();
    pool.shutdown_and_wait();

    // the in-flight task finished; the queued ones were dropped
    assert!(ran.load(Ordering::SeqCst) <= 1);
}

#[test]
fn idle_workers_expire() {
    let pool = WorkerPool::new(4, "expiring").with_idle_timeout(Duration::from_millis(50));
    for _ in 0..16 {
        pool.submit(|| {}).expect("the pool is live");
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.live_threads() > 0 {
        assert!(
            Instant::now() < deadline,
            "idle workers failed to expire without a shutdown"
        );
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn workers_respawn_after_expiry() {
    let pool = WorkerPool::new(2, "respawning").with_idle_timeout(Duration::from_millis(20));
    let ran = Arc::new(AtomicUsize::new(0));

    for round in 0..3 {
        {
            let ran = Arc::clone(&ran);
            pool.submit(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .expect("the pool is live");
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) <= round {
            assert!(Instant::now() < deadline, "task never ran");
            thread::sleep(Duration::from_millis(1));
        }
        // let the worker die of boredom before the next round
        thread::sleep(Duration::from_millis(60));
    }
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    pool.shutdown_and_wait();
}

#[test]
fn parallel_for_each_covers_the_table() {
    let map = Arc::new(IntMap::<i32>::new());
    {
        let guard = map.guard();
        for i in 0..10_000 {
            map.insert(i, i * 2, &guard);
        }
    }

    let pool = WorkerPool::new(4, "scan");
    let visited = Arc::new(AtomicUsize::new(0));
    let sum = Arc::new(AtomicUsize::new(0));
    {
        let visited = Arc::clone(&visited);
        let sum = Arc::clone(&sum);
        map.parallel_for_each(8, &pool, move |k, v| {
            assert_eq!(k * 2, *v);
            visited.fetch_add(1, Ordering::Relaxed);
            sum.fetch_add(*v as usize, Ordering::Relaxed);
        })
        .expect("no resize is in flight");
    }
    pool.shutdown_and_wait();

    assert_eq!(visited.load(Ordering::Relaxed), 10_000);
    assert_eq!(sum.load(Ordering::Relaxed), (0..10_000).map(|i| i * 2).sum());
}
