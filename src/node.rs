use crate::reclaim::{Atomic, Guard, Linked, Shared};
use std::sync::atomic::Ordering;

/// One state of a bucket slot.
///
/// A non-empty bucket normally points at the head `Node` of an immutable
/// chain. During a resize the slot may instead hold one of the two transfer
/// sentinels, which are shared allocations owned by the table being drained.
pub(crate) enum BucketEntry<V> {
    Node(Node<V>),
    /// The bucket's chain is currently being copied into the next table.
    Resizing,
    /// The bucket has been fully drained; its entries live in the next table.
    Resized,
}

impl<V> BucketEntry<V> {
    pub(crate) fn as_node(&self) -> Option<&Node<V>> {
        if let BucketEntry::Node(ref n) = *self {
            Some(n)
        } else {
            None
        }
    }

    pub(crate) fn is_sentinel(&self) -> bool {
        matches!(*self, BucketEntry::Resizing | BucketEntry::Resized)
    }

    /// Walk this chain looking for `key`. Must only be called on a
    /// `BucketEntry::Node`; sentinels are handled by the callers' slow paths.
    pub(crate) fn find<'g>(&'g self, key: i32, guard: &'g Guard<'_>) -> Option<&'g Node<V>> {
        let mut entry: &'g BucketEntry<V> = self;
        loop {
            let n = entry
                .as_node()
                .expect("chain nodes only ever link to chain nodes");
            if n.key == key {
                return Some(n);
            }
            let next = n.next.load(Ordering::SeqCst, guard);
            if next.is_null() {
                return None;
            }
            // safety: the chain was reached under our guard, and nodes are
            // not reclaimed until all guards that could have seen them are
            // dropped.
            entry = unsafe { &**next.deref() };
        }
    }
}

/// An entry in a bucket chain.
///
/// Nodes are immutable once published: an update or removal replaces the
/// affected part of the chain with newly allocated copies, so a reader that
/// captured the old head keeps seeing a consistent chain. Replacement copies
/// alias the value allocations of the nodes they displace; a value is retired
/// exactly once, when its key is removed or its value replaced.
pub(crate) struct Node<V> {
    pub(crate) key: i32,
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<BucketEntry<V>>,
}

impl<V> Node<V> {
    pub(crate) fn new(key: i32, value: Shared<'_, V>, next: Shared<'_, BucketEntry<V>>) -> Self {
        Self {
            key,
            value: Atomic::from(value),
            next: Atomic::from(next),
        }
    }

    pub(crate) fn value<'g>(&self, guard: &'g Guard<'_>) -> Shared<'g, V> {
        self.value.load(Ordering::SeqCst, guard)
    }

    pub(crate) fn next_entry<'g>(&self, guard: &'g Guard<'_>) -> Shared<'g, BucketEntry<V>> {
        self.next.load(Ordering::SeqCst, guard)
    }
}

/// Dereference a chain entry as a `Node`, panicking on a sentinel.
///
/// # Safety
///
/// `entry` must be a valid non-null pointer read under a live guard.
pub(crate) unsafe fn as_node<'g, V>(entry: Shared<'g, BucketEntry<V>>) -> &'g Node<V> {
    let entry: &Linked<BucketEntry<V>> = unsafe { entry.deref() };
    entry
        .as_node()
        .expect("expected a chain node, found a resize sentinel")
}
