use crate::node::Node;
use crossbeam_epoch::{Atomic, Guard, Shared};
use std::iter;
use std::sync::atomic::Ordering;

/// A power-of-two array of chain heads. Head loads are acquire and head
/// stores are release, so a published head carries every prior store to the
/// node it points at. A table is never resized in place; rehashing swaps in
/// a fresh table and retires this one through the epoch collector.
pub(crate) struct Table<K, V> {
    buckets: Box<[Atomic<Node<K, V>>]>,
}

impl<K, V> Table<K, V> {
    pub(crate) fn new(len: usize) -> Self {
        debug_assert!(len.is_power_of_two());

        let buckets = iter::repeat_with(Atomic::null).take(len).collect();
        Self { buckets }
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn bucket_index(&self, hash: u32) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    pub(crate) fn head<'g>(&self, index: usize, guard: &'g Guard) -> Shared<'g, Node<K, V>> {
        self.buckets[index].load(Ordering::Acquire, guard)
    }

    /// Publishes `node` as the head of bucket `index`.
    pub(crate) fn publish_head(&self, index: usize, node: Shared<'_, Node<K, V>>) {
        self.buckets[index].store(node, Ordering::Release);
    }
}
