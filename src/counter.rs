use crate::reclaim::{self, Atomic, Collector, Guard, Shared};
use crossbeam_utils::CachePadded;
use std::cell::Cell;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

/// Number of partitioned cells. A thread whose probe hashes to 0 keeps using
/// the base counter, so 7 cells serve 8 probe values.
const SIZE_CELLS: usize = 7;

/// The logical size of the map.
///
/// Starts out as a single CAS-updated base counter. Once the map grows past
/// the partitioning threshold, writes spread over a small set of cache-padded
/// cells indexed by a hash of the calling thread, trading summation cost on
/// read for less write contention.
pub(crate) struct Counter {
    base: AtomicIsize,
    cells: Atomic<Box<[CachePadded<AtomicIsize>]>>,
}

impl Counter {
    pub(crate) fn new() -> Self {
        Self {
            base: AtomicIsize::new(0),
            cells: Atomic::null(),
        }
    }

    /// Activate the partitioned cells. Racing activations (two tables
    /// resizing at once) are settled by the compare-and-swap; the loser frees
    /// its allocation.
    pub(crate) fn activate_cells(&self, collector: &Collector, guard: &Guard<'_>) {
        if !self.cells.load(Ordering::SeqCst, guard).is_null() {
            return;
        }
        let cells: Box<[CachePadded<AtomicIsize>]> = (0..SIZE_CELLS)
            .map(|_| CachePadded::new(AtomicIsize::new(0)))
            .collect();
        let cells = Shared::boxed(cells, collector);
        if let Err(failed) = self.cells.compare_exchange(
            Shared::null(),
            cells,
            Ordering::SeqCst,
            Ordering::Relaxed,
            guard,
        ) {
            // safety: never published
            drop(unsafe { failed.new.into_box() });
        }
    }

    pub(crate) fn add(&self, value: isize, guard: &Guard<'_>) {
        let cells = self.cells.load(Ordering::SeqCst, guard);
        if !cells.is_null() {
            let probe = thread_probe();
            if probe != 0 {
                // safety: the cells are published under the guard and are
                // only freed when the counter itself is dropped
                let cell = &unsafe { cells.deref() }[probe - 1];
                loop {
                    let current = cell.load(Ordering::SeqCst);
                    if cell
                        .compare_exchange(
                            current,
                            current + value,
                            Ordering::SeqCst,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
            }
        }

        loop {
            let current = self.base.load(Ordering::SeqCst);
            if self
                .base
                .compare_exchange(current, current + value, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    pub(crate) fn sum(&self, guard: &Guard<'_>) -> isize {
        let mut sum = self.base.load(Ordering::SeqCst);
        let cells = self.cells.load(Ordering::SeqCst, guard);
        if !cells.is_null() {
            // safety: see `add`
            for cell in unsafe { cells.deref() }.iter() {
                sum += cell.load(Ordering::SeqCst);
            }
        }
        sum
    }
}

impl Drop for Counter {
    fn drop(&mut self) {
        // safety: we have &mut self, so nobody else can reach the cells
        let guard = unsafe { reclaim::unprotected() };
        let cells = self.cells.swap(Shared::null(), Ordering::SeqCst, &guard);
        if !cells.is_null() {
            // safety: unreachable now, and never retired elsewhere
            drop(unsafe { cells.into_box() });
        }
    }
}

/// A stable per-thread probe in `0..=7`, derived from a process-wide thread
/// ticket put through the same mixing as the map's key hash.
fn thread_probe() -> usize {
    static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);
    thread_local! {
        static PROBE: Cell<usize> = const { Cell::new(usize::MAX) };
    }

    PROBE.with(|probe| {
        let mut p = probe.get();
        if p == usize::MAX {
            let mut h = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed) as u32;
            h ^= (h >> 18) ^ (h >> 12);
            p = ((h ^ (h >> 10)) & SIZE_CELLS as u32) as usize;
            probe.set(p);
        }
        p
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_only() {
        let collector = Collector::new();
        let guard = collector.enter();
        let counter = Counter::new();
        counter.add(5, &guard);
        counter.add(-2, &guard);
        assert_eq!(counter.sum(&guard), 3);
    }

    #[test]
    fn partitioned() {
        let collector = Collector::new();
        let guard = collector.enter();
        let counter = Counter::new();
        counter.activate_cells(&collector, &guard);
        for _ in 0..100 {
            counter.add(1, &guard);
        }
        counter.add(-30, &guard);
        assert_eq!(counter.sum(&guard), 70);
    }

    #[test]
    fn probe_is_stable() {
        assert_eq!(thread_probe(), thread_probe());
        assert!(thread_probe() <= SIZE_CELLS);
    }
}
