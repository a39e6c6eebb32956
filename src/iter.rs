use crate::node::Node;
use crate::table::Table;
use crate::StripeMap;
use crossbeam_epoch::{self as epoch, Guard};
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::ptr;
use std::sync::atomic::Ordering;

/// Error returned by the cursor removal methods when there is no entry to
/// remove.
#[derive(thiserror::Error, Clone, Copy, Debug, Eq, PartialEq)]
pub enum CursorError {
    /// The cursor has not returned an entry since it was created or since
    /// the last successful removal.
    #[error("cursor has no current entry")]
    NoCurrentEntry,
}

/// The traversal state shared by every cursor flavor.
///
/// Partitions are visited in reverse index order and buckets within each
/// partition in reverse index order; chains are walked head to tail. The
/// cursor pins an epoch guard for its whole lifetime and keeps the bucket
/// table that was live when it reached each partition, so a concurrent
/// rehash never invalidates the walk. Entries inserted after creation may
/// or may not be seen; no key is ever returned twice.
struct RawCursor<'a, K, V, S> {
    map: &'a StripeMap<K, V, S>,
    guard: Guard,
    partition_index: isize,
    bucket_index: isize,
    table: *const Table<K, V>,
    next: *const Node<K, V>,
    last: *const Node<K, V>,
}

impl<'a, K, V, S> RawCursor<'a, K, V, S> {
    fn new(map: &'a StripeMap<K, V, S>) -> Self {
        let mut cursor = Self {
            map,
            guard: epoch::pin(),
            partition_index: map.partition_count() as isize - 1,
            bucket_index: -1,
            table: ptr::null(),
            next: ptr::null(),
            last: ptr::null(),
        };
        cursor.advance();
        cursor
    }

    /// Positions `next` at the head of the nearest non-empty bucket.
    fn advance(&mut self) {
        loop {
            if self.bucket_index >= 0 {
                let table = unsafe { &*self.table };
                let head = table.head(self.bucket_index as usize, &self.guard);
                self.bucket_index -= 1;
                if !head.is_null() {
                    self.next = head.as_raw();
                    return;
                }
            } else if self.partition_index >= 0 {
                let index = self.partition_index as usize;
                self.partition_index -= 1;
                if let Some(partition) = self.map.partition_at(index, &self.guard) {
                    let table = partition.table(&self.guard);
                    self.table = table;
                    self.bucket_index = table.len() as isize - 1;
                }
            } else {
                self.next = ptr::null();
                return;
            }
        }
    }

    fn next_node(&mut self) -> Option<*const Node<K, V>> {
        if self.next.is_null() {
            return None;
        }
        let node = self.next;
        self.last = node;
        let next = unsafe { &*node }.next.load(Ordering::Acquire, &self.guard);
        self.next = next.as_raw();
        if self.next.is_null() {
            self.advance();
        }
        Some(node)
    }

    fn remove_last(&mut self) -> Result<Option<V>, CursorError>
    where
        K: Clone + Eq + Hash,
        V: Clone,
        S: BuildHasher,
    {
        if self.last.is_null() {
            return Err(CursorError::NoCurrentEntry);
        }
        let key = unsafe { &(*self.last).key }.clone();
        self.last = ptr::null();
        Ok(self.map.remove(&key))
    }
}

/// Weakly consistent cursor over the map's entries, yielding owned pairs.
///
/// # Examples
///
/// ```
/// use stripemap::StripeMap;
///
/// let map = StripeMap::new();
/// map.insert("hello", "world");
/// map.insert("alex", "steve");
/// assert_eq!(map.iter().count(), 2);
/// ```
pub struct Iter<'a, K, V, S = RandomState> {
    cursor: RawCursor<'a, K, V, S>,
}

impl<'a, K, V, S> Iter<'a, K, V, S> {
    pub(crate) fn new(map: &'a StripeMap<K, V, S>) -> Self {
        Self {
            cursor: RawCursor::new(map),
        }
    }
}

impl<'a, K: Clone, V: Clone, S> Iterator for Iter<'a, K, V, S> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.cursor.next_node()?;
        let node = unsafe { &*node };
        let value = unsafe { node.value.load(Ordering::Acquire, &self.cursor.guard).deref() };
        Some((node.key.clone(), value.clone()))
    }
}

impl<'a, K, V, S> Iter<'a, K, V, S>
where
    K: Clone + Eq + Hash,
    V: Clone,
    S: BuildHasher,
{
    /// Removes the last entry this cursor returned from the underlying map,
    /// by key. Returns the removed value, or `None` when another thread got
    /// to the key first.
    pub fn remove_last(&mut self) -> Result<Option<V>, CursorError> {
        self.cursor.remove_last()
    }
}

/// Weakly consistent cursor over the map's keys.
pub struct Keys<'a, K, V, S = RandomState> {
    cursor: RawCursor<'a, K, V, S>,
}

impl<'a, K, V, S> Keys<'a, K, V, S> {
    pub(crate) fn new(map: &'a StripeMap<K, V, S>) -> Self {
        Self {
            cursor: RawCursor::new(map),
        }
    }
}

impl<'a, K: Clone, V, S> Iterator for Keys<'a, K, V, S> {
    type Item = K;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.cursor.next_node()?;
        Some(unsafe { &*node }.key.clone())
    }
}

impl<'a, K, V, S> Keys<'a, K, V, S>
where
    K: Clone + Eq + Hash,
    V: Clone,
    S: BuildHasher,
{
    /// Removes the last key this cursor returned from the underlying map.
    pub fn remove_last(&mut self) -> Result<Option<V>, CursorError> {
        self.cursor.remove_last()
    }
}

/// Weakly consistent cursor over the map's values.
pub struct Values<'a, K, V, S = RandomState> {
    cursor: RawCursor<'a, K, V, S>,
}

impl<'a, K, V, S> Values<'a, K, V, S> {
    pub(crate) fn new(map: &'a StripeMap<K, V, S>) -> Self {
        Self {
            cursor: RawCursor::new(map),
        }
    }
}

impl<'a, K, V: Clone, S> Iterator for Values<'a, K, V, S> {
    type Item = V;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.cursor.next_node()?;
        let node = unsafe { &*node };
        let value = unsafe { node.value.load(Ordering::Acquire, &self.cursor.guard).deref() };
        Some(value.clone())
    }
}

impl<'a, K, V, S> Values<'a, K, V, S>
where
    K: Clone + Eq + Hash,
    V: Clone,
    S: BuildHasher,
{
    /// Removes the entry behind the last value this cursor returned.
    pub fn remove_last(&mut self) -> Result<Option<V>, CursorError> {
        self.cursor.remove_last()
    }
}

#[cfg(test)]
mod tests {
    use crate::StripeMap;

    #[test]
    fn iter_manual_count() {
        let map = StripeMap::new();

        map.insert("Johnny", 21);

        assert_eq!(map.len(), 1);
        assert_eq!(map.iter().count(), 1);
    }

    #[test]
    fn keys_and_values_agree() {
        let map = StripeMap::new();

        for i in 0..64 {
            map.insert(i, i * 2);
        }

        let mut keys: Vec<i32> = map.keys().collect();
        let mut values: Vec<i32> = map.values().collect();
        keys.sort_unstable();
        values.sort_unstable();

        assert_eq!(keys, (0..64).collect::<Vec<_>>());
        assert_eq!(values, (0..64).map(|i| i * 2).collect::<Vec<_>>());
    }
}
