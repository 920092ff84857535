use crate::map::IntMap;
use crate::node::{BucketEntry, Node};
use crate::raw::Table;
use crate::reclaim::{Guard, Linked, Shared};
use std::sync::atomic::Ordering;

/// An iterator over the live chain nodes of a map.
///
/// The traverser walks the current table bucket by bucket. When it meets a
/// bucket in mid-transfer it helps drain that bucket, then continues in the
/// next table: the run of already-drained buckets maps onto two ranges of
/// the doubled table, and whatever remains of the old table is pushed onto a
/// to-do stack to be picked back up afterwards.
pub(crate) struct NodeIter<'g, V> {
    map: &'g IntMap<V>,
    guard: &'g Guard<'g>,

    /// Table currently being walked; switches as resizes are followed.
    table: Shared<'g, Table<V>>,

    /// Index of the bucket to look at next.
    index: usize,

    /// Bucket bound for the current table range.
    end: usize,

    /// Ranges deferred while following a resize.
    todo: Vec<IterRange<'g, V>>,

    /// The next chain entry to yield.
    next: Option<&'g Linked<BucketEntry<V>>>,
}

struct IterRange<'g, V> {
    table: Shared<'g, Table<V>>,
    start: usize,
    end: usize,
}

impl<'g, V> NodeIter<'g, V>
where
    V: Send + Sync,
{
    pub(crate) fn new(map: &'g IntMap<V>, guard: &'g Guard<'g>) -> Self {
        let table = map.root_table(guard);
        // safety: the root table is valid under the guard
        let end = unsafe { table.deref() }.len();
        let mut iter = Self {
            map,
            guard,
            table,
            index: 0,
            end,
            todo: Vec::new(),
            next: None,
        };
        iter.find_next();
        iter
    }

    /// Advance to the head of the next non-empty bucket, helping and
    /// splitting around any resize encountered on the way.
    fn find_next(&mut self) {
        loop {
            while self.index < self.end {
                // safety: tables reached by the traverser were loaded under
                // the guard (directly or through a resize state) and outlive
                // it
                let t = unsafe { self.table.deref() };
                let bin = t.bin(self.index, self.guard);
                if bin.is_null() {
                    self.index += 1;
                    continue;
                }
                // safety: bucket contents loaded under the guard
                let entry = unsafe { bin.deref() };
                if !entry.is_sentinel() {
                    self.next = Some(entry);
                    self.index += 1;
                    return;
                }

                // the bucket moved; finish its transfer and follow it
                let next_table =
                    self.map
                        .help_with_resize_while_current_index(self.table, self.index, self.guard);

                // the drained run usually extends past this bucket
                let mut end_resized = self.index + 1;
                while end_resized < self.end {
                    let b = t.bin(end_resized, self.guard);
                    // safety: same as above
                    if b.is_null()
                        || !matches!(**unsafe { b.deref() }, BucketEntry::Resized)
                    {
                        break;
                    }
                    end_resized += 1;
                }

                let n = t.len();
                if end_resized < self.end {
                    // the rest of this table still needs walking
                    self.todo.push(IterRange {
                        table: self.table,
                        start: end_resized,
                        end: self.end,
                    });
                }
                // the drained run's entries re-hash to the same indices and
                // to the same indices plus the old table length
                self.todo.push(IterRange {
                    table: next_table,
                    start: self.index + n,
                    end: end_resized + n,
                });
                self.table = next_table;
                self.end = end_resized;
            }

            match self.todo.pop() {
                Some(range) => {
                    self.table = range.table;
                    self.index = range.start;
                    self.end = range.end;
                }
                None => return,
            }
        }
    }
}

impl<'g, V> Iterator for NodeIter<'g, V>
where
    V: Send + Sync,
{
    type Item = &'g Node<V>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.next?;
        let node = entry
            .as_node()
            .expect("the traverser only stops on chain nodes");
        let next = node.next.load(Ordering::SeqCst, self.guard);
        if next.is_null() {
            self.next = None;
            self.find_next();
        } else {
            // safety: chain reached under the guard
            self.next = Some(unsafe { next.deref() });
        }
        Some(node)
    }
}
