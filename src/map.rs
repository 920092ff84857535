use crate::counter::Counter;
use crate::iter::*;
use crate::node::{self, BucketEntry, Node};
use crate::raw::{ResizeState, Table};
use crate::reclaim::{self, Atomic, Collector, Guard, RetireShared, Shared};
use crate::pool::WorkerPool;

use parking_lot::{Condvar, Mutex};
use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

/// The default capacity request: space for this many entries is reserved
/// before the first growth.
const DEFAULT_CAPACITY: usize = 16;

/// The maximum number of buckets. Must be a power of two at most 1<<30;
/// capacity requests above it are clamped.
const MAXIMUM_CAPACITY: usize = 1 << 30;

/// Once the table reaches this many buckets, size updates spread over
/// partitioned counter cells instead of a single contended word.
const PARTITIONED_SIZE_THRESHOLD: usize = 4096;

static NCPU_INITIALIZER: Once = Once::new();
static NCPU: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn num_cpus() -> usize {
    NCPU_INITIALIZER.call_once(|| NCPU.store(num_cpus::get(), Ordering::Relaxed));
    NCPU.load(Ordering::Relaxed)
}

/// Spread the key's entropy over the low bits used for bucket indexing.
pub(crate) fn spread(key: i32) -> u32 {
    let mut h = key as u32;
    h ^= (h >> 20) ^ (h >> 12);
    h ^ (h >> 7) ^ (h >> 4)
}

/// A lock-free hash map from `i32` keys to values, with cooperative resizing.
///
/// Readers and writers never take a lock on the hot path: lookups are plain
/// guarded loads, and every mutation is one successful compare-and-swap of a
/// bucket head. Chains are immutable once published, so a reader that
/// captured a bucket head keeps seeing a consistent chain even while writers
/// replace it.
///
/// When an insert pushes the map past three quarters of its capacity, the
/// inserting thread doubles the table and starts draining buckets into it.
/// Any thread that meets a bucket in mid-transfer helps finish the transfer
/// instead of blocking behind it; late helpers drain the table tail-first so
/// they stay out of the initiator's way.
///
/// All operations that touch entries take a [`Guard`] acquired from
/// [`IntMap::guard`]. References returned by the map stay valid until the
/// guard they were loaded under is dropped, even if the entry is concurrently
/// removed.
///
/// # Examples
///
/// ```
/// use scurry::IntMap;
///
/// let map = IntMap::new();
/// let guard = map.guard();
/// assert_eq!(map.insert(1, "a", &guard), None);
/// assert_eq!(map.get(1, &guard), Some(&"a"));
/// assert_eq!(map.remove(1, &guard), Some(&"a"));
/// assert_eq!(map.get(1, &guard), None);
/// ```
pub struct IntMap<V> {
    /// The current bucket table. Replaced only by a completed resize.
    table: Atomic<Table<V>>,

    count: Counter,

    /// All guards used with this map must come from this collector.
    collector: Collector,
}

impl<V> IntMap<V> {
    /// Creates an empty map with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates an empty map with room for at least `capacity` entries before
    /// the first growth. Requests beyond the maximum capacity are clamped.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(MAXIMUM_CAPACITY);
        let threshold = capacity + (capacity >> 1);
        let mut nbins = 1;
        while nbins < threshold {
            nbins <<= 1;
        }
        let nbins = nbins.min(MAXIMUM_CAPACITY);

        let collector = Collector::new();
        let table = Shared::boxed(Table::new(nbins, &collector), &collector);
        let map = Self {
            table: Atomic::from(table),
            count: Counter::new(),
            collector,
        };
        if nbins >= PARTITIONED_SIZE_THRESHOLD {
            let guard = map.collector.enter();
            map.count.activate_cells(&map.collector, &guard);
        }
        map
    }

    /// Pin the map for the duration of the returned guard.
    ///
    /// Keeping a guard alive holds up reclamation of everything retired while
    /// it exists, so prefer short-lived guards over one guard per program.
    pub fn guard(&self) -> Guard<'_> {
        self.collector.enter()
    }

    #[inline]
    fn check_guard(&self, guard: &Guard<'_>) {
        assert!(
            guard
                .collector()
                .map_or(false, |c| Collector::ptr_eq(c, &self.collector)),
            "a Guard from a different map cannot protect this map"
        );
    }

    /// Returns the number of live entries.
    ///
    /// The partitioned counter is summed on read, so during concurrent
    /// mutation the result is a point-in-time approximation; after the map
    /// quiesces it is exact.
    pub fn len(&self) -> usize {
        let guard = self.guard();
        self.count.sum(&guard).max(0) as usize
    }

    /// Returns `true` if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn root_table<'g>(&'g self, guard: &'g Guard<'_>) -> Shared<'g, Table<V>> {
        self.table.load(Ordering::SeqCst, guard)
    }
}

impl<V> Default for IntMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> IntMap<V>
where
    V: Send + Sync,
{
    /// Returns a reference to the value mapped to `key`.
    ///
    /// Lock-free: the fast path is a single guarded load of the bucket head
    /// followed by a chain walk. If the bucket is in mid-transfer the lookup
    /// helps finish the transfer and retries against the next table.
    pub fn get<'g>(&'g self, key: i32, guard: &'g Guard<'_>) -> Option<&'g V> {
        self.check_guard(guard);
        let hash = spread(key);
        let table = self.root_table(guard);
        // safety: the root table is allocated at construction; replaced
        // tables are retired only after the swap, and our guard was live
        // when we loaded this one
        let t = unsafe { table.deref() };
        let bin = t.bin(t.bini(hash), guard);
        if bin.is_null() {
            return None;
        }
        // safety: bucket contents loaded under the guard are not reclaimed
        // until after the guard is dropped
        let entry = unsafe { bin.deref() };
        if entry.is_sentinel() {
            return self.slow_get(key, hash, table, guard);
        }
        let node = entry.find(key, guard)?;
        let value = node.value(guard);
        // safety: the value was reachable under our guard; if it is replaced
        // it is retired, not freed
        Some(unsafe { &**value.deref() })
    }

    fn slow_get<'g>(
        &'g self,
        key: i32,
        hash: u32,
        mut table: Shared<'g, Table<V>>,
        guard: &'g Guard<'_>,
    ) -> Option<&'g V> {
        loop {
            // safety: same argument as in `get`
            let t = unsafe { table.deref() };
            let i = t.bini(hash);
            let bin = t.bin(i, guard);
            if bin.is_null() {
                return None;
            }
            // safety: same argument as in `get`
            let entry = unsafe { bin.deref() };
            if entry.is_sentinel() {
                table = self.help_with_resize_while_current_index(table, i, guard);
                continue;
            }
            let node = entry.find(key, guard)?;
            let value = node.value(guard);
            // safety: same argument as in `get`
            return Some(unsafe { &**value.deref() });
        }
    }

    /// Returns `true` if the map contains `key`.
    pub fn contains_key(&self, key: i32, guard: &Guard<'_>) -> bool {
        self.get(key, guard).is_some()
    }

    /// Maps `key` to `value`, returning the previous value if the key was
    /// present.
    ///
    /// An update never mutates the existing chain: the surviving entries of
    /// the bucket are copied into a fresh chain carrying the new value, and
    /// the bucket head is swung over with one compare-and-swap.
    pub fn insert<'g>(&'g self, key: i32, value: V, guard: &'g Guard<'_>) -> Option<&'g V> {
        self.check_guard(guard);
        let hash = spread(key);
        let value = Shared::boxed(value, &self.collector);
        let table = self.root_table(guard);
        // safety: same argument as in `get`
        let t = unsafe { table.deref() };
        let i = t.bini(hash);
        let bin = t.bin(i, guard);
        if bin.is_null() {
            // empty bucket: try to become its first entry
            let entry = Shared::boxed(
                BucketEntry::Node(Node::new(key, value, Shared::null())),
                &self.collector,
            );
            match t.cas_bin(i, Shared::null(), entry, guard) {
                Ok(_) => {
                    self.count.add(1, guard);
                    return None;
                }
                Err(failed) => {
                    // safety: never published; the value moves on into the
                    // slow path
                    drop(unsafe { failed.new.into_box() });
                }
            }
        }
        self.slow_insert(key, value, hash, table, guard)
    }

    fn slow_insert<'g>(
        &'g self,
        key: i32,
        value: Shared<'g, V>,
        hash: u32,
        mut table: Shared<'g, Table<V>>,
        guard: &'g Guard<'_>,
    ) -> Option<&'g V> {
        'outer: loop {
            // safety: same argument as in `get`
            let t = unsafe { table.deref() };
            let i = t.bini(hash);
            let bin = t.bin(i, guard);
            // safety: same argument as in `get`
            if !bin.is_null() && unsafe { bin.deref() }.is_sentinel() {
                table = self.help_with_resize_while_current_index(table, i, guard);
                continue 'outer;
            }

            let mut e = bin;
            while !e.is_null() {
                // safety: chain reached under our guard
                let n = unsafe { node::as_node(e) };
                if n.key == key {
                    let old_value = n.value(guard);
                    let chain = self.chain_without(bin, e, guard);
                    let new_head = Shared::boxed(
                        BucketEntry::Node(Node::new(key, value, chain.head)),
                        &self.collector,
                    );
                    match t.cas_bin(i, bin, new_head, guard) {
                        Ok(_) => {
                            chain.commit(guard);
                            // safety: the displaced node and the replaced
                            // value are unreachable from the bucket now; any
                            // thread still reading them read them under a
                            // guard that predates the retirement
                            unsafe { guard.retire_shared(e) };
                            unsafe { guard.retire_shared(old_value) };
                            return Some(unsafe { &**old_value.deref() });
                        }
                        Err(failed) => {
                            // safety: never published
                            drop(unsafe { failed.new.into_box() });
                            chain.abandon();
                            continue 'outer;
                        }
                    }
                }
                e = n.next_entry(guard);
            }

            // brand-new key: prepend
            let entry = Shared::boxed(
                BucketEntry::Node(Node::new(key, value, bin)),
                &self.collector,
            );
            match t.cas_bin(i, bin, entry, guard) {
                Ok(_) => {
                    self.increment_size_and_maybe_resize(table, t.len(), bin, guard);
                    return None;
                }
                Err(failed) => {
                    // safety: never published
                    drop(unsafe { failed.new.into_box() });
                    continue 'outer;
                }
            }
        }
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove<'g>(&'g self, key: i32, guard: &'g Guard<'_>) -> Option<&'g V> {
        self.check_guard(guard);
        self.remove_inner(key, |_| true, guard)
    }

    /// Removes `key` only if its current value satisfies `condition`.
    ///
    /// The conditional form of [`remove`](IntMap::remove): pass
    /// `|v| v == &expected` for a compare-and-remove.
    pub fn remove_if<'g, F>(&'g self, key: i32, condition: F, guard: &'g Guard<'_>) -> Option<&'g V>
    where
        F: FnMut(&V) -> bool,
    {
        self.check_guard(guard);
        self.remove_inner(key, condition, guard)
    }

    fn remove_inner<'g, F>(
        &'g self,
        key: i32,
        mut condition: F,
        guard: &'g Guard<'_>,
    ) -> Option<&'g V>
    where
        F: FnMut(&V) -> bool,
    {
        let hash = spread(key);
        let mut table = self.root_table(guard);
        'outer: loop {
            // safety: same argument as in `get`
            let t = unsafe { table.deref() };
            let i = t.bini(hash);
            let bin = t.bin(i, guard);
            // safety: same argument as in `get`
            if !bin.is_null() && unsafe { bin.deref() }.is_sentinel() {
                table = self.help_with_resize_while_current_index(table, i, guard);
                continue 'outer;
            }

            let mut e = bin;
            while !e.is_null() {
                // safety: chain reached under our guard
                let n = unsafe { node::as_node(e) };
                if n.key == key {
                    let value = n.value(guard);
                    // safety: value loaded under our guard
                    if !condition(unsafe { &**value.deref() }) {
                        return None;
                    }
                    let chain = self.chain_without(bin, e, guard);
                    match t.cas_bin(i, bin, chain.head, guard) {
                        Ok(_) => {
                            chain.commit(guard);
                            // safety: see the retire in `slow_insert`
                            unsafe { guard.retire_shared(e) };
                            unsafe { guard.retire_shared(value) };
                            self.count.add(-1, guard);
                            return Some(unsafe { &**value.deref() });
                        }
                        Err(_) => {
                            chain.abandon();
                            continue 'outer;
                        }
                    }
                }
                e = n.next_entry(guard);
            }
            return None;
        }
    }

    /// Removes every entry.
    ///
    /// Buckets are detached one compare-and-swap at a time, so entries
    /// inserted concurrently with `clear` may survive it.
    pub fn clear(&self, guard: &Guard<'_>) {
        self.check_guard(guard);
        let mut table = self.root_table(guard);
        loop {
            // safety: same argument as in `get`
            let t = unsafe { table.deref() };
            let mut resize_seen = Shared::null();
            for i in 0..t.len() {
                let bin = t.bin(i, guard);
                if bin.is_null() {
                    continue;
                }
                // safety: same argument as in `get`
                if unsafe { bin.deref() }.is_sentinel() {
                    resize_seen = t.resize_state(guard);
                } else if t.cas_bin(i, bin, Shared::null(), guard).is_ok() {
                    // the chain is detached; retire it, values included
                    let mut removed = 0;
                    let mut e = bin;
                    while !e.is_null() {
                        // safety: chain reached under our guard; we won the
                        // detach, so nobody else will retire these
                        let n = unsafe { node::as_node(e) };
                        let next = n.next_entry(guard);
                        unsafe { guard.retire_shared(n.value(guard)) };
                        unsafe { guard.retire_shared(e) };
                        e = next;
                        removed += 1;
                    }
                    self.count.add(-removed, guard);
                }
                // a lost race means another thread is mutating the bucket;
                // move on rather than retry
            }
            if resize_seen.is_null() {
                break;
            }
            // safety: the resize state outlives the table that published it
            let state = unsafe { resize_seen.deref() };
            if state.is_not_done() {
                self.help_with_resize(table, guard);
                state.wait_for_all_resizers();
            }
            table = state.next.load(Ordering::SeqCst, guard);
        }
    }

    /// Returns `true` if any entry maps to a value equal to `value`.
    ///
    /// Scans the whole table; if a resize is in flight the scan helps it
    /// finish and continues into the next table.
    pub fn contains_value(&self, value: &V, guard: &Guard<'_>) -> bool
    where
        V: PartialEq,
    {
        self.check_guard(guard);
        let mut table = self.root_table(guard);
        loop {
            // safety: same argument as in `get`
            let t = unsafe { table.deref() };
            let mut resize_seen = Shared::null();
            for i in 0..t.len() {
                let bin = t.bin(i, guard);
                if bin.is_null() {
                    continue;
                }
                // safety: same argument as in `get`
                if unsafe { bin.deref() }.is_sentinel() {
                    resize_seen = t.resize_state(guard);
                    continue;
                }
                let mut e = bin;
                while !e.is_null() {
                    // safety: chain reached under our guard
                    let n = unsafe { node::as_node(e) };
                    if unsafe { &**n.value(guard).deref() } == value {
                        return true;
                    }
                    e = n.next_entry(guard);
                }
            }
            if resize_seen.is_null() {
                return false;
            }
            // safety: the resize state outlives the table that published it
            let state = unsafe { resize_seen.deref() };
            if state.is_not_done() {
                self.help_with_resize(table, guard);
                state.wait_for_all_resizers();
            }
            table = state.next.load(Ordering::SeqCst, guard);
        }
    }

    /// Calls `f` for every entry, in bucket order.
    ///
    /// This is a raw scan: unlike [`iter`](IntMap::iter) it cannot traverse a
    /// table in mid-resize and fails with [`ConcurrentModification`] instead.
    pub fn for_each<F>(&self, mut f: F, guard: &Guard<'_>) -> Result<(), ConcurrentModification>
    where
        F: FnMut(i32, &V),
    {
        self.check_guard(guard);
        let table = self.root_table(guard);
        // safety: same argument as in `get`
        let t = unsafe { table.deref() };
        scan_table(t, 0..t.len(), &mut f, guard)
    }

    /// An iterator over every `(key, &value)` pair.
    ///
    /// Unlike the raw scans, the iterator cooperates with an in-flight
    /// resize: it helps drain the buckets it needs and follows them into the
    /// next table. It is weakly consistent — entries inserted or removed
    /// while iterating may or may not be observed.
    pub fn iter<'g>(&'g self, guard: &'g Guard<'g>) -> Iter<'g, V> {
        self.check_guard(guard);
        Iter {
            node_iter: NodeIter::new(self, guard),
            guard,
        }
    }

    /// An iterator over every key. See [`iter`](IntMap::iter).
    pub fn keys<'g>(&'g self, guard: &'g Guard<'g>) -> Keys<'g, V> {
        self.check_guard(guard);
        Keys {
            node_iter: NodeIter::new(self, guard),
        }
    }

    /// An iterator over every value. See [`iter`](IntMap::iter).
    pub fn values<'g>(&'g self, guard: &'g Guard<'g>) -> Values<'g, V> {
        self.check_guard(guard);
        Values {
            node_iter: NodeIter::new(self, guard),
            guard,
        }
    }

    fn chain_without<'g>(
        &'g self,
        head: Shared<'g, BucketEntry<V>>,
        omit: Shared<'g, BucketEntry<V>>,
        guard: &'g Guard<'_>,
    ) -> ReplacementChain<'g, V> {
        if head == omit {
            // safety: the caller found `omit` in this chain
            let next = unsafe { node::as_node(head) }.next_entry(guard);
            return ReplacementChain {
                head: next,
                copies: Vec::new(),
                displaced: Vec::new(),
            };
        }

        let mut copies = Vec::new();
        let mut displaced = Vec::new();
        let mut replacement = Shared::null();
        let mut e = head;
        while !e.is_null() {
            // safety: chain reached under the caller's guard
            let n = unsafe { node::as_node(e) };
            if e != omit {
                // the copy aliases the original's value allocation, so the
                // original is later retired shallowly
                let copy = Shared::boxed(
                    BucketEntry::Node(Node::new(n.key, n.value(guard), replacement)),
                    &self.collector,
                );
                copies.push(copy);
                displaced.push(e);
                replacement = copy;
            }
            e = n.next_entry(guard);
        }
        ReplacementChain {
            head: replacement,
            copies,
            displaced,
        }
    }

    fn increment_size_and_maybe_resize<'g>(
        &'g self,
        table: Shared<'g, Table<V>>,
        nbins: usize,
        prev_bin: Shared<'g, BucketEntry<V>>,
        guard: &'g Guard<'_>,
    ) {
        self.count.add(1, guard);
        if !prev_bin.is_null() {
            let size = self.count.sum(guard).max(0) as usize;
            let threshold = (nbins >> 1) + (nbins >> 2);
            if size + 1 > threshold {
                self.resize(table, guard);
            }
        }
    }

    /// Double `table`, draining its buckets into the new one, then swing the
    /// root pointer over. Loses the allocation race gracefully: if another
    /// thread owns the resize, this thread helps instead.
    fn resize<'g>(&'g self, table: Shared<'g, Table<V>>, guard: &'g Guard<'_>) {
        // safety: same argument as in `get`
        let t = unsafe { table.deref() };
        let nbins = t.len();
        assert!(nbins < MAXIMUM_CAPACITY, "map cannot grow past 2^30 buckets");

        let mut state = t.resize_state(guard);
        let mut own = false;
        if state.is_null() {
            // allocating the next table is too expensive to race on
            let _resize = t.lock_resize();
            state = t.resize_state(guard);
            if state.is_null() {
                if (nbins << 1) >= PARTITIONED_SIZE_THRESHOLD {
                    self.count.activate_cells(&self.collector, guard);
                }
                let next = Shared::boxed(Table::new(nbins << 1, &self.collector), &self.collector);
                let new_state = Shared::boxed(ResizeState::new(next, nbins), &self.collector);
                t.publish_resize_state(new_state);
                state = new_state;
                own = true;
            }
        }

        if !own {
            self.help_with_resize(table, guard);
            return;
        }

        // safety: published above; freed only when the table is
        let state = unsafe { state.deref() };
        self.transfer(t, state, guard);
        let next = state.next.load(Ordering::SeqCst, guard);
        loop {
            match self
                .table
                .compare_exchange(table, next, Ordering::SeqCst, Ordering::SeqCst, guard)
            {
                Ok(_) => {
                    // safety: the table is no longer the root; readers that
                    // are still inside hold guards from before this point
                    unsafe { guard.retire_shared(table) };
                    return;
                }
                Err(failed) => {
                    // we resized a table that never became the root (the
                    // table we grew out of is still mid-swap); help the older
                    // resize along until it is our turn
                    if failed.current != table {
                        self.help_with_resize(failed.current, guard);
                    }
                }
            }
        }
    }

    /// Walk every bucket of `src` front to back, claiming each with the
    /// `Resizing` sentinel and copying its chain into the next table.
    fn transfer<'g>(&'g self, src: &'g Table<V>, state: &'g ResizeState<V>, guard: &'g Guard<'_>) {
        let dest = state.next.load(Ordering::SeqCst, guard);
        let n = src.len();
        let queue_increment = ResizeState::<V>::queue_increment() as usize;
        let mut j = 0;
        while j < n {
            let bin = src.bin(j, guard);
            if bin.is_null() {
                if src
                    .cas_bin(j, Shared::null(), src.resized(guard), guard)
                    .is_ok()
                {
                    j += 1;
                }
            // safety: same argument as in `get`
            } else if unsafe { bin.deref() }.is_sentinel() {
                // a reverse-draining helper claimed this chunk; skip past it
                j = (j & !(queue_increment - 1)) + queue_increment;
                if state.resizers() == 1 {
                    // no helpers left, so the remaining chunks are all done
                    break;
                }
            } else if src.cas_bin(j, bin, src.resizing(guard), guard).is_ok() {
                self.drain_bucket(src, j, bin, dest, guard);
                j += 1;
            }
        }
        state.decrement_resizer_and_notify();
        state.wait_for_all_resizers();
    }

    /// Drain the tail of `src` backwards in fixed-size chunks, claimed
    /// through the shared queue cursor so reverse helpers never contend with
    /// each other or with the forward walk.
    fn reverse_transfer<'g>(
        &'g self,
        src: &'g Table<V>,
        state: &'g ResizeState<V>,
        guard: &'g Guard<'_>,
    ) {
        let dest = state.next.load(Ordering::SeqCst, guard);
        let queue_increment = ResizeState::<V>::queue_increment();
        while state.queue_position() > 0 {
            let start = state.claim_reverse_chunk();
            let end = start + queue_increment;
            if end > 0 {
                let start = start.max(0);
                let mut j = end - 1;
                while j >= start {
                    let i = j as usize;
                    let bin = src.bin(i, guard);
                    if bin.is_null() {
                        if src
                            .cas_bin(i, Shared::null(), src.resized(guard), guard)
                            .is_ok()
                        {
                            j -= 1;
                        }
                    // safety: same argument as in `get`
                    } else if unsafe { bin.deref() }.is_sentinel() {
                        // we ran into the forward walk; everything below is
                        // covered, so give up the rest of the queue
                        state.zero_out_queue_position();
                        return;
                    } else if src.cas_bin(i, bin, src.resizing(guard), guard).is_ok() {
                        self.drain_bucket(src, i, bin, dest, guard);
                        j -= 1;
                    }
                }
            }
        }
    }

    /// Copy the chain headed by `head` into the next table, then mark the
    /// source bucket as fully drained. The caller must have claimed the
    /// bucket with the `Resizing` sentinel.
    fn drain_bucket<'g>(
        &'g self,
        src: &'g Table<V>,
        i: usize,
        head: Shared<'g, BucketEntry<V>>,
        dest: Shared<'g, Table<V>>,
        guard: &'g Guard<'_>,
    ) {
        let mut e = head;
        while !e.is_null() {
            // safety: we claimed the bucket, so the chain is ours to walk;
            // readers that got in before the claim are protected by their
            // own guards
            let next = unsafe { node::as_node(e) }.next_entry(guard);
            self.copy_to(dest, e, guard);
            e = next;
        }
        src.store_bin(i, src.resized(guard));
    }

    /// Insert one existing entry into the destination table, following any
    /// resize of the destination itself. A lone entry landing in an empty
    /// bucket is moved wholesale; otherwise a copy aliasing the same value
    /// allocation is prepended and the original retired.
    fn copy_to<'g>(
        &'g self,
        dest: Shared<'g, Table<V>>,
        entry: Shared<'g, BucketEntry<V>>,
        guard: &'g Guard<'_>,
    ) {
        // safety: the caller claimed the entry's bucket
        let n = unsafe { node::as_node(entry) };
        let hash = spread(n.key);
        let mut table = dest;
        loop {
            // safety: same argument as in `get`
            let t = unsafe { table.deref() };
            let i = t.bini(hash);
            let bin = t.bin(i, guard);
            // safety: same argument as in `get`
            if !bin.is_null() && unsafe { bin.deref() }.is_sentinel() {
                let state = t.resize_state(guard);
                assert!(
                    !state.is_null(),
                    "resize sentinel observed without a published resize state"
                );
                // safety: the resize state outlives its table
                table = unsafe { state.deref() }.next.load(Ordering::SeqCst, guard);
                continue;
            }
            if bin.is_null() && n.next_entry(guard).is_null() {
                if t.cas_bin(i, Shared::null(), entry, guard).is_ok() {
                    return;
                }
            } else {
                let copy = Shared::boxed(
                    BucketEntry::Node(Node::new(n.key, n.value(guard), bin)),
                    &self.collector,
                );
                match t.cas_bin(i, bin, copy, guard) {
                    Ok(_) => {
                        // safety: the original is unreachable once its bucket
                        // is marked; its value allocation lives on in the copy
                        unsafe { guard.retire_shared(entry) };
                        return;
                    }
                    Err(failed) => {
                        // safety: never published
                        drop(unsafe { failed.new.into_box() });
                    }
                }
            }
        }
    }

    /// Contribute to an in-flight resize of `table` and return the table the
    /// entries are moving into.
    pub(crate) fn help_with_resize<'g>(
        &'g self,
        table: Shared<'g, Table<V>>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, Table<V>> {
        // safety: same argument as in `get`
        let t = unsafe { table.deref() };
        let state = t.resize_state(guard);
        assert!(
            !state.is_null(),
            "resize sentinel observed without a published resize state"
        );
        // safety: the resize state outlives its table
        let state = unsafe { state.deref() };
        let next = state.next.load(Ordering::SeqCst, guard);
        if state.queue_position() > ResizeState::<V>::queue_increment() {
            state.increment_resizer();
            self.reverse_transfer(t, state, guard);
            state.decrement_resizer_and_notify();
        }
        next
    }

    /// Keep helping the resize of `table` until the bucket at `index` has
    /// been fully drained, then return the next table.
    pub(crate) fn help_with_resize_while_current_index<'g>(
        &'g self,
        table: Shared<'g, Table<V>>,
        index: usize,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, Table<V>> {
        // safety: same argument as in `get`
        let t = unsafe { table.deref() };
        let mut next = self.help_with_resize(table, guard);
        let mut help_count = 0usize;
        loop {
            let bin = t.bin(index, guard);
            // safety: same argument as in `get`
            if !bin.is_null() && matches!(**unsafe { bin.deref() }, BucketEntry::Resized) {
                return next;
            }
            help_count += 1;
            next = self.help_with_resize(table, guard);
            if help_count & 7 == 0 {
                std::thread::yield_now();
            }
        }
    }
}

impl<V> IntMap<V>
where
    V: Send + Sync + 'static,
{
    /// Split the table into `chunks` ranges and scan them on `pool`, calling
    /// `f` for every entry. Blocks until every chunk has finished.
    ///
    /// Like [`for_each`](IntMap::for_each) this is a raw scan and fails with
    /// [`ConcurrentModification`] if any chunk observes a resize in flight.
    /// Chunks rejected by a shut-down pool run on the calling thread.
    pub fn parallel_for_each<F>(
        self: &Arc<Self>,
        chunks: usize,
        pool: &WorkerPool,
        f: F,
    ) -> Result<(), ConcurrentModification>
    where
        F: Fn(i32, &V) + Send + Sync + 'static,
    {
        let guard = self.guard();
        let table = self.root_table(&guard);
        // safety: same argument as in `get`
        let t = unsafe { table.deref() };
        let len = t.len();
        if chunks <= 1 {
            let mut f = f;
            return scan_table(t, 0..len, &mut f, &guard);
        }

        let chunk_size = len.div_ceil(chunks);
        let ranges: Vec<_> = (0..chunks)
            .map(|c| (c * chunk_size, ((c + 1) * chunk_size).min(len)))
            .filter(|(start, end)| start < end)
            .collect();

        let f = Arc::new(f);
        let outcome = Arc::new(Mutex::new(Ok(())));
        let pending = Arc::new((Mutex::new(ranges.len()), Condvar::new()));

        for (start, end) in ranges {
            let task = {
                let map = Arc::clone(self);
                let f = Arc::clone(&f);
                let outcome = Arc::clone(&outcome);
                let pending = Arc::clone(&pending);
                let table = TableRef(table.as_ptr());
                move || {
                    // capture the whole `TableRef` (which is `Send`) rather
                    // than the disjoint raw-pointer field under 2021 closure
                    // capture rules
                    let table = table;
                    let guard = map.guard();
                    // safety: the caller's guard outlives every chunk task,
                    // so the captured table cannot be reclaimed before they
                    // finish
                    let t: &Table<V> = unsafe { &*table.0 };
                    let result = scan_table(t, start..end, &mut |k, v| f(k, v), &guard);
                    if let Err(e) = result {
                        *outcome.lock() = Err(e);
                    }
                    let (left, done) = &*pending;
                    let mut left = left.lock();
                    *left -= 1;
                    if *left == 0 {
                        done.notify_all();
                    }
                }
            };
            if pool.submit(task).is_err() {
                let result = scan_table(t, start..end, &mut |k, v| f(k, v), &guard);
                if let Err(e) = result {
                    *outcome.lock() = Err(e);
                }
                let (left, done) = &*pending;
                let mut left = left.lock();
                *left -= 1;
                if *left == 0 {
                    done.notify_all();
                }
            }
        }

        let (left, done) = &*pending;
        let mut left = left.lock();
        while *left > 0 {
            done.wait(&mut left);
        }
        drop(left);

        let result = *outcome.lock();
        result
    }
}

/// A raw range scan over one table. Fails on a transfer sentinel: a table in
/// mid-resize cannot be scanned consistently.
fn scan_table<V, F>(
    t: &Table<V>,
    range: Range<usize>,
    f: &mut F,
    guard: &Guard<'_>,
) -> Result<(), ConcurrentModification>
where
    F: FnMut(i32, &V),
{
    for i in range {
        let bin = t.bin(i, guard);
        if bin.is_null() {
            continue;
        }
        // safety: bucket contents loaded under the guard are not reclaimed
        // until after the guard is dropped
        if unsafe { bin.deref() }.is_sentinel() {
            return Err(ConcurrentModification { _priv: () });
        }
        let mut e = bin;
        while !e.is_null() {
            // safety: chain reached under the guard
            let n = unsafe { node::as_node(e) };
            f(n.key, unsafe { &**n.value(guard).deref() });
            e = n.next_entry(guard);
        }
    }
    Ok(())
}

/// The raw table pointer a parallel scan hands to its chunk tasks. Kept
/// alive for the duration of the scan by the caller's guard.
struct TableRef<V>(*mut reclaim::Linked<Table<V>>);

unsafe impl<V: Send + Sync> Send for TableRef<V> {}

/// A not-yet-published replacement for a bucket chain, plus the original
/// nodes it displaces.
struct ReplacementChain<'g, V> {
    head: Shared<'g, BucketEntry<V>>,
    copies: Vec<Shared<'g, BucketEntry<V>>>,
    displaced: Vec<Shared<'g, BucketEntry<V>>>,
}

impl<'g, V> ReplacementChain<'g, V> {
    /// The replacement won its compare-and-swap: the displaced originals are
    /// garbage. Their value allocations live on in the copies.
    fn commit(self, guard: &Guard<'_>) {
        for displaced in self.displaced {
            // safety: unreachable from the bucket since the CAS succeeded
            unsafe { guard.retire_shared(displaced) };
        }
    }

    /// The compare-and-swap lost: free the copies, which were never
    /// published and own nothing.
    fn abandon(self) {
        for copy in self.copies {
            // safety: never published
            drop(unsafe { copy.into_box() });
        }
    }
}

impl<V> Drop for IntMap<V> {
    fn drop(&mut self) {
        // safety: we have &mut self, so no guards are outstanding
        let guard = unsafe { reclaim::unprotected() };

        let table = self.table.swap(Shared::null(), Ordering::SeqCst, &guard);
        // safety: a map always has a table, and we are its last owner
        let mut table = unsafe { table.into_box() };
        debug_assert!(
            table.resize_state(&guard).is_null(),
            "a resize cannot outlive the operation that started it"
        );
        table.drop_bins();
    }
}

impl<V> Debug for IntMap<V>
where
    V: Debug + Send + Sync,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let guard = self.guard();
        f.debug_map().entries(self.iter(&guard)).finish()
    }
}

/// The error returned by scan-style operations that observed a table in
/// mid-resize.
///
/// Point operations (`get`, `insert`, `remove`) never fail; only whole-table
/// scans do, because a table being drained cannot be walked consistently
/// without either helping the resize to completion ([`IntMap::iter`] does)
/// or failing fast (the raw scans do).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConcurrentModification {
    _priv: (),
}

impl Display for ConcurrentModification {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "the table is being resized; the scan cannot safely continue")
    }
}

impl Error for ConcurrentModification {}
