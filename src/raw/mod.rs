use crate::node::BucketEntry;
use crate::reclaim::{self, Atomic, Collector, Guard, Shared};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicIsize, Ordering};

/// A bucket table.
///
/// The number of buckets is always a power of two. Alongside the buckets the
/// table carries the coordination state for draining it into its successor:
/// the two shared transfer sentinels that get installed in drained buckets,
/// the in-progress [`ResizeState`] (the typed rendition of the reserved spare
/// slot of the backing array), and the mutex that serializes only the
/// allocation of the next table.
pub(crate) struct Table<V> {
    bins: Box<[Atomic<BucketEntry<V>>]>,

    // one allocation of each sentinel is shared by all buckets of this table
    resizing: Atomic<BucketEntry<V>>,
    resized: Atomic<BucketEntry<V>>,

    /// Non-null exactly while this table is being drained into a bigger one.
    resize: Atomic<ResizeState<V>>,

    /// Allocating the next table is too expensive to race on.
    resize_lock: Mutex<()>,
}

impl<V> Table<V> {
    pub(crate) fn new(bins: usize, collector: &Collector) -> Self {
        Self {
            bins: vec![Atomic::null(); bins].into_boxed_slice(),
            resizing: Atomic::from(Shared::boxed(BucketEntry::Resizing, collector)),
            resized: Atomic::from(Shared::boxed(BucketEntry::Resized, collector)),
            resize: Atomic::null(),
            resize_lock: Mutex::new(()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bins.len()
    }

    #[inline]
    pub(crate) fn bini(&self, hash: u32) -> usize {
        (hash as usize) & (self.bins.len() - 1)
    }

    #[inline]
    pub(crate) fn bin<'g>(&self, i: usize, guard: &'g Guard<'_>) -> Shared<'g, BucketEntry<V>> {
        self.bins[i].load(Ordering::Acquire, guard)
    }

    #[inline]
    #[allow(clippy::type_complexity)]
    pub(crate) fn cas_bin<'g>(
        &self,
        i: usize,
        current: Shared<'_, BucketEntry<V>>,
        new: Shared<'g, BucketEntry<V>>,
        guard: &'g Guard<'_>,
    ) -> Result<Shared<'g, BucketEntry<V>>, reclaim::CompareExchangeError<'g, BucketEntry<V>>>
    {
        self.bins[i].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard)
    }

    #[inline]
    pub(crate) fn store_bin(&self, i: usize, new: Shared<'_, BucketEntry<V>>) {
        self.bins[i].store(new, Ordering::Release)
    }

    #[inline]
    pub(crate) fn resizing<'g>(&self, guard: &'g Guard<'_>) -> Shared<'g, BucketEntry<V>> {
        self.resizing.load(Ordering::Relaxed, guard)
    }

    #[inline]
    pub(crate) fn resized<'g>(&self, guard: &'g Guard<'_>) -> Shared<'g, BucketEntry<V>> {
        self.resized.load(Ordering::Relaxed, guard)
    }

    #[inline]
    pub(crate) fn resize_state<'g>(&self, guard: &'g Guard<'_>) -> Shared<'g, ResizeState<V>> {
        self.resize.load(Ordering::SeqCst, guard)
    }

    pub(crate) fn publish_resize_state(&self, state: Shared<'_, ResizeState<V>>) {
        self.resize.store(state, Ordering::SeqCst);
    }

    pub(crate) fn lock_resize(&self) -> MutexGuard<'_, ()> {
        self.resize_lock.lock()
    }

    /// Free every chain still rooted in this table, values included.
    ///
    /// Only for the final table of a dropped map: once a table has been
    /// drained by a resize its chains have either moved to the next table or
    /// been retired, and its buckets hold only shared sentinels.
    pub(crate) fn drop_bins(&mut self) {
        // safety: we have &mut self, so no guard can still observe the bins
        let guard = unsafe { reclaim::unprotected() };

        for bin in Vec::from(std::mem::replace(&mut self.bins, vec![].into_boxed_slice())) {
            let entry = bin.load(Ordering::SeqCst, &guard);
            if entry.is_null() {
                continue;
            }
            // safety: unshared, and the pointer was published, so it is valid
            if unsafe { entry.deref() }.is_sentinel() {
                // shared allocation, freed once in `drop`
                continue;
            }

            // safety: we own the chain; nodes are not shared across buckets
            let mut p = unsafe { bin.into_box() };
            loop {
                let node = match (*p).value {
                    BucketEntry::Node(node) => node,
                    _ => unreachable!("chains do not contain sentinels"),
                };

                // the final table holds each value allocation exactly once
                drop(unsafe { node.value.into_box() });

                if node.next.load(Ordering::SeqCst, &guard).is_null() {
                    break;
                }
                p = unsafe { node.next.into_box() };
            }
        }
    }
}

impl<V> Drop for Table<V> {
    fn drop(&mut self) {
        // safety: the table is no longer reachable, so we own its contents
        let guard = unsafe { reclaim::unprotected() };

        // a table is only dropped once its chains are gone: either drop_bins
        // ran (final table), or every bucket was drained and now holds one of
        // the shared sentinels (tables replaced by a resize)
        if cfg!(debug_assertions) {
            let resizing = self.resizing.load(Ordering::SeqCst, &guard);
            let resized = self.resized.load(Ordering::SeqCst, &guard);
            for bin in self.bins.iter() {
                let bin = bin.load(Ordering::SeqCst, &guard);
                assert!(
                    bin.is_null() || bin == resizing || bin == resized,
                    "dropped table with a live bucket chain"
                );
            }
        }

        let resizing = self.resizing.swap(Shared::null(), Ordering::SeqCst, &guard);
        let resized = self.resized.swap(Shared::null(), Ordering::SeqCst, &guard);
        // safety: allocated in `new`, owned by this table
        drop(unsafe { resizing.into_box() });
        drop(unsafe { resized.into_box() });

        let state = self.resize.swap(Shared::null(), Ordering::SeqCst, &guard);
        if !state.is_null() {
            // the resize state is reachable only through this table; the next
            // table it points at became the root and is freed separately
            drop(unsafe { state.into_box() });
        }
    }
}

/// Coordination state for one table-doubling transfer, published on the table
/// being drained before any of its buckets is marked.
pub(crate) struct ResizeState<V> {
    /// The table being filled.
    pub(crate) next: Atomic<Table<V>>,

    /// Number of threads actively draining buckets, starting at 1 for the
    /// resize owner.
    resizers: AtomicIsize,

    /// Cursor for helper threads draining the tail of the table backwards in
    /// fixed-size chunks, so they stay out of the owner's forward walk.
    queue_position: AtomicIsize,

    done_lock: Mutex<()>,
    done: Condvar,
}

impl<V> ResizeState<V> {
    pub(crate) fn new(next: Shared<'_, Table<V>>, old_bins: usize) -> Self {
        Self {
            next: Atomic::from(next),
            resizers: AtomicIsize::new(1),
            queue_position: AtomicIsize::new(old_bins as isize),
            done_lock: Mutex::new(()),
            done: Condvar::new(),
        }
    }

    /// Chunk claimed per reverse-transfer step: scales with the processor
    /// count, capped at 1024 buckets.
    pub(crate) fn queue_increment() -> isize {
        let ncpus = crate::map::num_cpus();
        let highest_one_bit = 1usize << (usize::BITS - 1 - ncpus.leading_zeros());
        std::cmp::min(1 << 10, highest_one_bit << 4) as isize
    }

    pub(crate) fn queue_position(&self) -> isize {
        self.queue_position.load(Ordering::SeqCst)
    }

    pub(crate) fn claim_reverse_chunk(&self) -> isize {
        self.queue_position
            .fetch_sub(Self::queue_increment(), Ordering::SeqCst)
            - Self::queue_increment()
    }

    pub(crate) fn zero_out_queue_position(&self) {
        self.queue_position.store(0, Ordering::SeqCst);
    }

    pub(crate) fn resizers(&self) -> isize {
        self.resizers.load(Ordering::SeqCst)
    }

    pub(crate) fn is_not_done(&self) -> bool {
        self.resizers() > 0
    }

    pub(crate) fn increment_resizer(&self) {
        self.resizers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_resizer_and_notify(&self) {
        if self.resizers.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _done = self.done_lock.lock();
            self.done.notify_all();
        }
    }

    /// Spin briefly, then yield, then block until every active resizer has
    /// finished draining its buckets.
    pub(crate) fn wait_for_all_resizers(&self) {
        if self.resizers() > 0 {
            for _ in 0..16 {
                if self.resizers() == 0 {
                    break;
                }
                std::hint::spin_loop();
            }
            for _ in 0..16 {
                if self.resizers() == 0 {
                    break;
                }
                std::thread::yield_now();
            }
        }
        if self.resizers() > 0 {
            let mut done = self.done_lock.lock();
            while self.resizers() > 0 {
                self.done.wait(&mut done);
            }
        }
    }
}
