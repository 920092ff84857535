//! Iterators over a map's entries, keys, and values.
//!
//! All of them traverse cooperatively: a bucket caught in mid-resize is
//! helped to completion and followed into the next table, so iteration never
//! fails. The trade-off is weak consistency — entries inserted or removed
//! concurrently may or may not be observed.

mod traverser;
pub(crate) use traverser::NodeIter;

use crate::reclaim::Guard;
use std::sync::atomic::Ordering;

/// An iterator over a map's entries.
///
/// See [`IntMap::iter`](crate::IntMap::iter) for details.
pub struct Iter<'g, V> {
    pub(crate) node_iter: NodeIter<'g, V>,
    pub(crate) guard: &'g Guard<'g>,
}

impl<'g, V> Iterator for Iter<'g, V>
where
    V: Send + Sync,
{
    type Item = (i32, &'g V);
    fn next(&mut self) -> Option<Self::Item> {
        let node = self.node_iter.next()?;
        let value = node.value.load(Ordering::SeqCst, self.guard);
        // safety: the value was reachable under the guard, and a replaced
        // value is retired, not freed
        Some((node.key, unsafe { &**value.deref() }))
    }
}

/// An iterator over a map's keys.
///
/// See [`IntMap::keys`](crate::IntMap::keys) for details.
pub struct Keys<'g, V> {
    pub(crate) node_iter: NodeIter<'g, V>,
}

impl<'g, V> Iterator for Keys<'g, V>
where
    V: Send + Sync,
{
    type Item = i32;
    fn next(&mut self) -> Option<Self::Item> {
        let node = self.node_iter.next()?;
        Some(node.key)
    }
}

/// An iterator over a map's values.
///
/// See [`IntMap::values`](crate::IntMap::values) for details.
pub struct Values<'g, V> {
    pub(crate) node_iter: NodeIter<'g, V>,
    pub(crate) guard: &'g Guard<'g>,
}

impl<'g, V> Iterator for Values<'g, V>
where
    V: Send + Sync,
{
    type Item = &'g V;
    fn next(&mut self) -> Option<Self::Item> {
        let node = self.node_iter.next()?;
        let value = node.value.load(Ordering::SeqCst, self.guard);
        // safety: see Iter::next
        Some(unsafe { &**value.deref() })
    }
}

#[cfg(test)]
mod tests {
    use crate::IntMap;
    use std::collections::HashSet;

    #[test]
    fn iter() {
        let map = IntMap::<usize>::new();

        let guard = map.guard();
        map.insert(1, 42, &guard);
        map.insert(2, 84, &guard);

        assert_eq!(
            map.iter(&guard).collect::<HashSet<(i32, &usize)>>(),
            HashSet::from_iter(vec![(1, &42), (2, &84)])
        );
    }

    #[test]
    fn keys() {
        let map = IntMap::<usize>::new();

        let guard = map.guard();
        map.insert(1, 42, &guard);
        map.insert(2, 84, &guard);

        assert_eq!(
            map.keys(&guard).collect::<HashSet<i32>>(),
            HashSet::from_iter(vec![1, 2])
        );
    }

    #[test]
    fn values() {
        let map = IntMap::<usize>::new();

        let guard = map.guard();
        map.insert(1, 42, &guard);
        map.insert(2, 84, &guard);

        assert_eq!(
            map.values(&guard).collect::<HashSet<&usize>>(),
            HashSet::from_iter(vec![&42, &84])
        );
    }

    #[test]
    fn iter_sees_growth() {
        let map = IntMap::<i32>::with_capacity(0);
        let guard = map.guard();
        for i in 0..1000 {
            map.insert(i, i * 2, &guard);
        }
        let mut seen: Vec<_> = map.iter(&guard).map(|(k, v)| (k, *v)).collect();
        seen.sort_unstable();
        assert_eq!(seen.len(), 1000);
        for (i, (k, v)) in seen.into_iter().enumerate() {
            assert_eq!(k, i as i32);
            assert_eq!(v, k * 2);
        }
    }
}
