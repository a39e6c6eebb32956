use crate::node::{self, Node};
use crate::table::Table;
use crate::MAX_CAPACITY;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use std::borrow::Borrow;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread;

/// Lock attempts made while scanning a chain before falling back to a
/// blocking acquire. Bounded retries keep the bucket's cache lines warm
/// while the lock is contended; on a uniprocessor spinning buys nothing.
static MAX_SCAN_RETRIES: Lazy<i32> = Lazy::new(|| {
    let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    if cpus > 1 {
        64
    } else {
        1
    }
});

/// One lock-guarded stripe of the map.
///
/// The mutex gates every structural change; readers never touch it and see
/// a consistent chain purely through the acquire/release publication of
/// bucket heads and `next` links. The bucket table is replaced wholesale on
/// rehash and the old one stays intact for readers that already hold it.
pub(crate) struct Partition<K, V> {
    pub(crate) lock: Mutex<()>,
    table: Atomic<Table<K, V>>,
    pub(crate) count: AtomicUsize,
    /// Bumped by every mutation; wraps at 32 bits, which still gives the
    /// aggregate stability checks enough entropy.
    pub(crate) mod_stamp: AtomicU32,
    threshold: AtomicUsize,
    pub(crate) load_factor: f32,
}

/// A put's key/value pair during the scan phase: still raw, or already
/// packed into a speculatively allocated node.
enum Pending<K, V> {
    Pair(K, V),
    Node(Owned<Node<K, V>>),
}

impl<K, V> Pending<K, V> {
    fn key(&self) -> &K {
        match self {
            Pending::Pair(key, _) => key,
            Pending::Node(node) => &node.key,
        }
    }

    fn into_parts(self) -> (K, V) {
        match self {
            Pending::Pair(key, value) => (key, value),
            Pending::Node(node) => node::into_parts(node),
        }
    }

    fn into_node(self, hash: u32, next: Shared<'_, Node<K, V>>) -> Owned<Node<K, V>> {
        match self {
            Pending::Pair(key, value) => Owned::new(Node::with_next(hash, key, value, next)),
            Pending::Node(node) => {
                node.next.store(next, Ordering::Release);
                node
            }
        }
    }
}

impl<K, V> Partition<K, V> {
    pub(crate) fn new(capacity: usize, load_factor: f32) -> Self {
        debug_assert!(capacity.is_power_of_two());

        Self {
            lock: Mutex::new(()),
            table: Atomic::new(Table::new(capacity)),
            count: AtomicUsize::new(0),
            mod_stamp: AtomicU32::new(0),
            threshold: AtomicUsize::new((capacity as f32 * load_factor) as usize),
            load_factor,
        }
    }

    /// The live bucket table. Never null once the partition exists.
    pub(crate) fn table<'g>(&self, guard: &'g Guard) -> &'g Table<K, V> {
        unsafe { self.table.load(Ordering::Acquire, guard).deref() }
    }

    fn head_for_hash<'g>(&self, guard: &'g Guard, hash: u32) -> Shared<'g, Node<K, V>> {
        let table = self.table(guard);
        table.head(table.bucket_index(hash), guard)
    }

    /// Lock-free lookup. Walks whichever table version the acquire load
    /// observes; a concurrent rehash leaves that chain intact.
    pub(crate) fn get_with<'g, Q, F, T>(
        &self,
        guard: &'g Guard,
        hash: u32,
        key: &Q,
        with_entry: F,
    ) -> Option<T>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
        F: FnOnce(&K, &V) -> T,
    {
        let mut e = self.head_for_hash(guard, hash);
        while let Some(n) = unsafe { e.as_ref() } {
            if n.hash == hash && key == n.key.borrow() {
                let value = unsafe { n.value.load(Ordering::Acquire, guard).deref() };
                return Some(with_entry(&n.key, value));
            }
            e = n.next.load(Ordering::Acquire, guard);
        }
        None
    }

    /// Lock-free full walk, used by the aggregate value-membership pass.
    pub(crate) fn contains_value(&self, guard: &Guard, value: &V) -> bool
    where
        V: PartialEq,
    {
        let table = self.table(guard);
        for index in 0..table.len() {
            let mut e = table.head(index, guard);
            while let Some(n) = unsafe { e.as_ref() } {
                if unsafe { n.value.load(Ordering::Acquire, guard).deref() } == value {
                    return true;
                }
                e = n.next.load(Ordering::Acquire, guard);
            }
        }
        false
    }

    pub(crate) fn clear(&self, guard: &Guard) {
        let lock = self.lock.lock();
        let table = self.table(guard);
        for index in 0..table.len() {
            let mut e = table.head(index, guard);
            if e.is_null() {
                continue;
            }
            table.publish_head(index, Shared::null());
            while let Some(n) = unsafe { e.as_ref() } {
                let next = n.next.load(Ordering::Acquire, guard);
                // In-flight readers keep walking the detached chain; the
                // collector frees it once they quiesce.
                unsafe { node::defer_destroy_node(guard, e) };
                e = next;
            }
        }
        self.mod_stamp.fetch_add(1, Ordering::AcqRel);
        self.count.store(0, Ordering::Release);
        drop(lock);
    }
}

impl<K, V> Partition<K, V>
where
    K: Eq,
    V: Clone,
{
    pub(crate) fn put(
        &self,
        guard: &Guard,
        key: K,
        hash: u32,
        value: V,
        only_if_absent: bool,
    ) -> Option<V>
    where
        K: Clone,
    {
        let (lock, pending) = match self.lock.try_lock() {
            Some(lock) => (lock, Pending::Pair(key, value)),
            None => self.scan_and_lock_for_put(guard, hash, Pending::Pair(key, value)),
        };

        let table = self.table(guard);
        let index = table.bucket_index(hash);
        let first = table.head(index, guard);

        let mut e = first;
        loop {
            if let Some(n) = unsafe { e.as_ref() } {
                if n.hash == hash && pending.key() == &n.key {
                    let old = unsafe { n.value.load(Ordering::Acquire, guard).deref() }.clone();
                    // unpack the pair either way so a speculative node frees
                    // its boxed value
                    let (_, value) = pending.into_parts();
                    if !only_if_absent {
                        let stale = n.value.swap(Owned::new(value), Ordering::AcqRel, guard);
                        unsafe { guard.defer_destroy(stale) };
                        self.mod_stamp.fetch_add(1, Ordering::AcqRel);
                    }
                    drop(lock);
                    return Some(old);
                }
                e = n.next.load(Ordering::Acquire, guard);
            } else {
                let node = pending.into_node(hash, first);
                let c = self.count.load(Ordering::Relaxed) + 1;
                if c > self.threshold.load(Ordering::Relaxed) && table.len() < MAX_CAPACITY {
                    self.rehash(guard, table, node);
                } else {
                    table.publish_head(index, node.into_shared(guard));
                }
                self.mod_stamp.fetch_add(1, Ordering::AcqRel);
                self.count.store(c, Ordering::Release);
                drop(lock);
                return None;
            }
        }
    }

    /// Removes the node bound to `key` if `condition` accepts its current
    /// value. Returns the removed value.
    pub(crate) fn remove_if<Q, F>(
        &self,
        guard: &Guard,
        key: &Q,
        hash: u32,
        condition: F,
    ) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
        F: FnOnce(&V) -> bool,
    {
        let lock = match self.lock.try_lock() {
            Some(lock) => lock,
            None => self.scan_and_lock(guard, hash, key),
        };

        let mut removed = None;
        let table = self.table(guard);
        let index = table.bucket_index(hash);
        let mut e = table.head(index, guard);
        let mut pred: Shared<'_, Node<K, V>> = Shared::null();
        while let Some(n) = unsafe { e.as_ref() } {
            let next = n.next.load(Ordering::Acquire, guard);
            if n.hash == hash && key == n.key.borrow() {
                let value = unsafe { n.value.load(Ordering::Acquire, guard).deref() };
                if condition(value) {
                    // Unlink by rewriting the head or the predecessor link;
                    // the node itself is left untouched so stale readers
                    // walk on into the live successor chain.
                    match unsafe { pred.as_ref() } {
                        None => table.publish_head(index, next),
                        Some(p) => p.next.store(next, Ordering::Release),
                    }
                    removed = Some(value.clone());
                    self.mod_stamp.fetch_add(1, Ordering::AcqRel);
                    self.count.fetch_sub(1, Ordering::Release);
                    unsafe { node::defer_destroy_node(guard, e) };
                }
                break;
            }
            pred = e;
            e = next;
        }
        drop(lock);
        removed
    }

    pub(crate) fn replace<Q>(&self, guard: &Guard, key: &Q, hash: u32, value: V) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        let lock = match self.lock.try_lock() {
            Some(lock) => lock,
            None => self.scan_and_lock(guard, hash, key),
        };

        let mut old = None;
        let mut e = self.head_for_hash(guard, hash);
        while let Some(n) = unsafe { e.as_ref() } {
            if n.hash == hash && key == n.key.borrow() {
                old = Some(unsafe { n.value.load(Ordering::Acquire, guard).deref() }.clone());
                let stale = n.value.swap(Owned::new(value), Ordering::AcqRel, guard);
                unsafe { guard.defer_destroy(stale) };
                self.mod_stamp.fetch_add(1, Ordering::AcqRel);
                break;
            }
            e = n.next.load(Ordering::Acquire, guard);
        }
        drop(lock);
        old
    }

    pub(crate) fn replace_if_equals<Q>(
        &self,
        guard: &Guard,
        key: &Q,
        hash: u32,
        expected: &V,
        value: V,
    ) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
        V: PartialEq,
    {
        let lock = match self.lock.try_lock() {
            Some(lock) => lock,
            None => self.scan_and_lock(guard, hash, key),
        };

        let mut replaced = false;
        let mut e = self.head_for_hash(guard, hash);
        while let Some(n) = unsafe { e.as_ref() } {
            if n.hash == hash && key == n.key.borrow() {
                if unsafe { n.value.load(Ordering::Acquire, guard).deref() } == expected {
                    let stale = n.value.swap(Owned::new(value), Ordering::AcqRel, guard);
                    unsafe { guard.defer_destroy(stale) };
                    self.mod_stamp.fetch_add(1, Ordering::AcqRel);
                    replaced = true;
                }
                break;
            }
            e = n.next.load(Ordering::Acquire, guard);
        }
        drop(lock);
        replaced
    }

    /// Interleaves lock polling with a chain walk so the critical section
    /// starts with warm cache lines, speculatively allocating the node a
    /// put will need if the key turns out to be absent. Anything found
    /// during the scan is a hint only; the caller re-walks under the lock.
    fn scan_and_lock_for_put<'a>(
        &'a self,
        guard: &Guard,
        hash: u32,
        mut pending: Pending<K, V>,
    ) -> (MutexGuard<'a, ()>, Pending<K, V>) {
        let mut first = self.head_for_hash(guard, hash);
        let mut e = first;
        let mut retries = -1i32;
        loop {
            if let Some(lock) = self.lock.try_lock() {
                return (lock, pending);
            }
            if retries < 0 {
                match unsafe { e.as_ref() } {
                    None => {
                        pending = match pending {
                            Pending::Pair(key, value) => {
                                Pending::Node(Owned::new(Node::new(hash, key, value)))
                            }
                            speculated => speculated,
                        };
                        retries = 0;
                    }
                    Some(n) if pending.key() == &n.key => retries = 0,
                    Some(n) => e = n.next.load(Ordering::Acquire, guard),
                }
            } else {
                retries += 1;
                if retries > *MAX_SCAN_RETRIES {
                    return (self.lock.lock(), pending);
                }
                if retries & 1 == 0 {
                    let f = self.head_for_hash(guard, hash);
                    if f != first {
                        // the chain changed under us; rescan from the new head
                        first = f;
                        e = f;
                        retries = -1;
                    }
                }
            }
        }
    }

    /// The simpler scan for remove and replace. The lock is taken even when
    /// the key is absent so updates stay sequentially consistent.
    fn scan_and_lock<'a, Q>(&'a self, guard: &Guard, hash: u32, key: &Q) -> MutexGuard<'a, ()>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        let mut first = self.head_for_hash(guard, hash);
        let mut e = first;
        let mut retries = -1i32;
        loop {
            if let Some(lock) = self.lock.try_lock() {
                return lock;
            }
            if retries < 0 {
                match unsafe { e.as_ref() } {
                    None => retries = 0,
                    Some(n) if key == n.key.borrow() => retries = 0,
                    Some(n) => e = n.next.load(Ordering::Acquire, guard),
                }
            } else {
                retries += 1;
                if retries > *MAX_SCAN_RETRIES {
                    return self.lock.lock();
                }
                if retries & 1 == 0 {
                    let f = self.head_for_hash(guard, hash);
                    if f != first {
                        first = f;
                        e = f;
                        retries = -1;
                    }
                }
            }
        }
    }

    /// Doubles the bucket table, called with the lock held and the new node
    /// in hand.
    ///
    /// Because the new length is double the old one, each chain splits into
    /// at most two. The longest suffix whose members all land in one new
    /// bucket is relinked as-is; only the nodes ahead of it are cloned, and
    /// the originals they shadow retire with the old table. Readers still
    /// holding the old table keep traversing its chains untouched.
    fn rehash<'g>(&self, guard: &'g Guard, old: &Table<K, V>, node: Owned<Node<K, V>>)
    where
        K: Clone,
    {
        let old_len = old.len();
        let new_len = old_len << 1;
        self.threshold
            .store((new_len as f32 * self.load_factor) as usize, Ordering::Relaxed);
        let new = Table::new(new_len);
        let mask = new_len as u32 - 1;
        let mut retired = Vec::new();

        for index in 0..old_len {
            let e = old.head(index, guard);
            let Some(head) = (unsafe { e.as_ref() }) else {
                continue;
            };
            let next = head.next.load(Ordering::Acquire, guard);
            let head_index = (head.hash & mask) as usize;
            if next.is_null() {
                // single node: relink it wholesale
                new.publish_head(head_index, e);
            } else {
                let mut last_run = e;
                let mut last_index = head_index;
                let mut p = next;
                while let Some(n) = unsafe { p.as_ref() } {
                    let candidate = (n.hash & mask) as usize;
                    if candidate != last_index {
                        last_index = candidate;
                        last_run = p;
                    }
                    p = n.next.load(Ordering::Acquire, guard);
                }
                new.publish_head(last_index, last_run);

                // clone the nodes ahead of the reused suffix
                let mut p = e;
                while p != last_run {
                    let n = unsafe { p.deref() };
                    let target = (n.hash & mask) as usize;
                    let value = unsafe { n.value.load(Ordering::Acquire, guard).deref() }.clone();
                    let cloned =
                        Node::with_next(n.hash, n.key.clone(), value, new.head(target, guard));
                    new.publish_head(target, Owned::new(cloned).into_shared(guard));
                    retired.push(p);
                    p = n.next.load(Ordering::Acquire, guard);
                }
            }
        }

        let index = (node.hash & mask) as usize;
        node.next.store(new.head(index, guard), Ordering::Release);
        new.publish_head(index, node.into_shared(guard));

        let old_table = self.table.swap(Owned::new(new), Ordering::Release, guard);
        unsafe {
            for p in retired {
                node::defer_destroy_node(guard, p);
            }
            guard.defer_destroy(old_table);
        }
    }
}

impl<K, V> Drop for Partition<K, V> {
    fn drop(&mut self) {
        // Either the whole map is going away or this partition lost its
        // publication race and was never shared.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let table = self.table.swap(Shared::null(), Ordering::Relaxed, guard);
        if table.is_null() {
            return;
        }
        let t = unsafe { table.deref() };
        for index in 0..t.len() {
            let mut e = t.head(index, guard);
            while let Some(n) = unsafe { e.as_ref() } {
                let next = n.next.load(Ordering::Relaxed, guard);
                unsafe { node::destroy_node(e) };
                e = next;
            }
        }
        drop(unsafe { table.into_owned() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch as epoch;

    #[test]
    fn put_get_remove_roundtrip() {
        let partition: Partition<u32, u32> = Partition::new(2, 0.75);
        let guard = &epoch::pin();

        assert_eq!(partition.put(guard, 1, 1, 10, false), None);
        assert_eq!(partition.get_with(guard, 1, &1, |_, v| *v), Some(10));
        assert_eq!(partition.put(guard, 1, 1, 11, false), Some(10));
        assert_eq!(partition.put(guard, 1, 1, 12, true), Some(11));
        assert_eq!(partition.get_with(guard, 1, &1, |_, v| *v), Some(11));
        assert_eq!(partition.remove_if(guard, &1, 1, |_| true), Some(11));
        assert_eq!(partition.get_with(guard, 1, &1, |_, v| *v), None);
        assert_eq!(partition.count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn chains_survive_doubling() {
        let partition: Partition<u32, u32> = Partition::new(2, 0.75);
        let guard = &epoch::pin();

        // hash == key keeps bucket placement deterministic across growth
        for i in 0..64u32 {
            assert_eq!(partition.put(guard, i, i, i, false), None);
        }
        assert!(partition.table(guard).len() >= 64);
        for i in 0..64u32 {
            assert_eq!(partition.get_with(guard, i, &i, |_, v| *v), Some(i));
        }
        assert_eq!(partition.count.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn doubles_at_threshold_plus_one() {
        let partition: Partition<u32, u32> = Partition::new(4, 0.75);
        let guard = &epoch::pin();

        for i in 0..3u32 {
            partition.put(guard, i, i, i, false);
            assert_eq!(partition.table(guard).len(), 4);
        }
        partition.put(guard, 3, 3, 3, false);
        assert_eq!(partition.table(guard).len(), 8);
        for i in 0..4u32 {
            assert_eq!(partition.get_with(guard, i, &i, |_, v| *v), Some(i));
        }
    }

    #[test]
    fn colliding_keys_share_a_chain() {
        let partition: Partition<u32, u32> = Partition::new(2, 0.75);
        let guard = &epoch::pin();

        // same low bits, distinct keys
        assert_eq!(partition.put(guard, 4, 0, 40, false), None);
        assert_eq!(partition.put(guard, 8, 0, 80, false), None);
        assert_eq!(partition.get_with(guard, 0, &4, |_, v| *v), Some(40));
        assert_eq!(partition.get_with(guard, 0, &8, |_, v| *v), Some(80));
    }

    #[test]
    fn conditional_ops() {
        let partition: Partition<u32, u32> = Partition::new(2, 0.75);
        let guard = &epoch::pin();

        assert_eq!(partition.replace(guard, &1, 1, 10), None);
        partition.put(guard, 1, 1, 10, false);
        assert!(!partition.replace_if_equals(guard, &1, 1, &9, 11));
        assert!(partition.replace_if_equals(guard, &1, 1, &10, 11));
        assert_eq!(partition.remove_if(guard, &1, 1, |v| *v == 9), None);
        assert_eq!(partition.remove_if(guard, &1, 1, |v| *v == 11), Some(11));
    }

    #[test]
    fn clear_empties_every_bucket() {
        let partition: Partition<u32, u32> = Partition::new(2, 0.75);
        let guard = &epoch::pin();

        for i in 0..32u32 {
            partition.put(guard, i, i, i, false);
        }
        partition.clear(guard);
        assert_eq!(partition.count.load(Ordering::Relaxed), 0);
        for i in 0..32u32 {
            assert_eq!(partition.get_with(guard, i, &i, |_, v| *v), None);
        }
    }
}
