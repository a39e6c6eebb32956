//! StripeMap is an implementation of a concurrent associative array/hashmap
//! in Rust, structured as a set of independently locked partitions.
//!
//! Readers are wait-free: a lookup takes no lock and never blocks a writer,
//! relying on acquire/release publication of bucket heads and chain links.
//! Writers lock only the partition their key hashes into, so updates to
//! distinct partitions proceed in parallel. Per-key operations are
//! linearizable; the aggregate operations ([`len`], [`is_empty`],
//! [`contains_value`]) are eventually consistent and fall back to locking
//! every partition after two unstable passes, which bounds their worst
//! case.
//!
//! All methods take `&self`, so a `StripeMap` can be put in an `Arc` and
//! shared between threads while remaining fully usable.
//!
//! Memory reclamation is epoch-based: nodes and tables unlinked by a writer
//! are only freed once every reader that could still observe them has
//! moved on.
//!
//! [`len`]: StripeMap::len
//! [`is_empty`]: StripeMap::is_empty
//! [`contains_value`]: StripeMap::contains_value

mod iter;
mod node;
mod partition;
#[cfg(feature = "serde")]
mod serde;
mod spread;
mod table;

pub use iter::{CursorError, Iter, Keys, Values};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;
use partition::Partition;
use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::Ordering;

/// Largest bucket table a single partition may grow to.
pub(crate) const MAX_CAPACITY: usize = 1 << 30;

/// Smallest bucket table a partition may start from.
const MIN_BUCKET_CAPACITY: usize = 2;

/// Upper bound on the partition directory length.
const MAX_PARTITIONS: usize = 1 << 16;

const DEFAULT_INITIAL_CAPACITY: usize = 16;
const DEFAULT_LOAD_FACTOR: f32 = 0.75;
const DEFAULT_CONCURRENCY_LEVEL: usize = 16;

/// Unstable aggregate passes tolerated before locking every partition.
const RETRIES_BEFORE_LOCK: i32 = 2;

/// Construction-time tuning knobs.
///
/// `initial_capacity` is the total number of entries the map should
/// accommodate before any partition rehashes, `load_factor` the fill ratio
/// that triggers a partition rehash, and `concurrency_level` a hint for how
/// many writers should be able to proceed in parallel. The partition count
/// becomes the smallest power of two at or above the hint, capped at 2¹⁶.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    pub initial_capacity: usize,
    pub load_factor: f32,
    pub concurrency_level: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            load_factor: DEFAULT_LOAD_FACTOR,
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
        }
    }
}

/// A segmented, lock-striped concurrent hash map.
///
/// # Examples
///
/// ```
/// use stripemap::StripeMap;
///
/// let reviews = StripeMap::new();
/// reviews.insert("Veloren", "What a fantastic game!");
/// assert_eq!(reviews.get("Veloren"), Some("What a fantastic game!"));
/// ```
pub struct StripeMap<K, V, S = RandomState> {
    /// Fixed-length directory; slot 0 is always live, the rest are
    /// published lazily by CAS and never replaced afterwards.
    partitions: Box<[Atomic<CachePadded<Partition<K, V>>>]>,
    partition_shift: u32,
    partition_mask: u32,
    hash_seed: u32,
    build_hasher: S,
}

impl<K, V> StripeMap<K, V, RandomState> {
    /// Creates an empty map with default options.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::StripeMap;
    ///
    /// let map = StripeMap::new();
    /// map.insert("I am the key!", "And I am the value!");
    /// ```
    pub fn new() -> Self {
        Self::with_capacity_and_hasher(DEFAULT_INITIAL_CAPACITY, RandomState::new())
    }

    /// Creates an empty map sized for `capacity` total entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V, S: BuildHasher> StripeMap<K, V, S> {
    /// Creates an empty map with default options and the provided hasher.
    pub fn with_hasher(build_hasher: S) -> Self {
        Self::with_capacity_and_hasher(DEFAULT_INITIAL_CAPACITY, build_hasher)
    }

    /// Creates an empty map sized for `capacity` total entries, using
    /// `build_hasher` to hash the keys.
    pub fn with_capacity_and_hasher(capacity: usize, build_hasher: S) -> Self {
        Self::with_options_and_hasher(
            Options {
                initial_capacity: capacity,
                ..Options::default()
            },
            build_hasher,
        )
    }

    /// Creates an empty map from explicit [`Options`].
    ///
    /// Partition 0 is materialized eagerly and serves as the shape
    /// prototype for its lazily created siblings.
    ///
    /// # Panics
    ///
    /// Panics if `options.load_factor` is not a positive finite number or
    /// `options.concurrency_level` is zero.
    pub fn with_options_and_hasher(options: Options, build_hasher: S) -> Self {
        assert!(
            options.load_factor.is_finite() && options.load_factor > 0.0,
            "load factor must be positive"
        );
        assert!(
            options.concurrency_level > 0,
            "concurrency level must be positive"
        );

        let concurrency = options.concurrency_level.min(MAX_PARTITIONS);
        let partition_count = concurrency.next_power_of_two();
        let partition_shift = 32 - partition_count.trailing_zeros();
        let partition_mask = partition_count as u32 - 1;

        let initial_capacity = options.initial_capacity.min(MAX_CAPACITY);
        let mut per_partition = initial_capacity / partition_count;
        if per_partition * partition_count < initial_capacity {
            per_partition += 1;
        }
        let capacity = per_partition
            .next_power_of_two()
            .clamp(MIN_BUCKET_CAPACITY, MAX_CAPACITY);

        let mut partitions = Vec::with_capacity(partition_count);
        partitions.push(Atomic::new(CachePadded::new(Partition::new(
            capacity,
            options.load_factor,
        ))));
        for _ in 1..partition_count {
            partitions.push(Atomic::null());
        }

        Self {
            partitions: partitions.into_boxed_slice(),
            partition_shift,
            partition_mask,
            hash_seed: spread::random_seed(),
            build_hasher,
        }
    }
}

impl<K, V, S> StripeMap<K, V, S> {
    /// The number of partitions backing this map.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Create a weakly consistent cursor over all entries.
    ///
    /// The cursor never observes a torn chain and never yields a key twice;
    /// entries inserted while it runs may or may not be seen.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter::new(self)
    }

    /// Create a weakly consistent cursor over all keys.
    pub fn keys(&self) -> Keys<'_, K, V, S> {
        Keys::new(self)
    }

    /// Create a weakly consistent cursor over all values.
    pub fn values(&self) -> Values<'_, K, V, S> {
        Values::new(self)
    }

    fn partition_index(&self, hash: u32) -> usize {
        if self.partition_shift == 32 {
            0
        } else {
            ((hash >> self.partition_shift) & self.partition_mask) as usize
        }
    }

    pub(crate) fn partition_at<'g>(
        &self,
        index: usize,
        guard: &'g Guard,
    ) -> Option<&'g Partition<K, V>> {
        let partition = self.partitions[index].load(Ordering::Acquire, guard);
        unsafe { partition.as_ref() }.map(|p| &**p)
    }

    /// Returns the partition at `index`, publishing a fresh one by CAS if
    /// the slot is still empty. Losers of the race adopt the winner.
    fn ensure_partition<'g>(&self, index: usize, guard: &'g Guard) -> &'g Partition<K, V> {
        if let Some(partition) = self.partition_at(index, guard) {
            return partition;
        }

        let proto = self
            .partition_at(0, guard)
            .expect("partition 0 is materialized at construction");
        let capacity = proto.table(guard).len();
        let fresh = Owned::new(CachePadded::new(Partition::new(capacity, proto.load_factor)));

        match self.partitions[index].compare_exchange(
            Shared::null(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            Ok(published) => unsafe { &**published.deref() },
            Err(race) => {
                drop(race.new);
                unsafe { &**race.current.deref() }
            }
        }
    }
}

impl<K, V, S> StripeMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn hash_of<Q: ?Sized + Hash>(&self, key: &Q) -> u32 {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        spread::spread(self.hash_seed, hasher.finish())
    }

    /// Returns a clone of the value bound to `key`.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::StripeMap;
    ///
    /// let map = StripeMap::new();
    /// map.insert(2, 4);
    /// assert_eq!(map.get(&2), Some(4));
    /// assert_eq!(map.get(&8), None);
    /// ```
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: Clone,
    {
        self.get_with(key, |_, v| v.clone())
    }

    /// Runs a closure over the entry bound to `key`, without cloning.
    pub fn get_with<Q, F, T>(&self, key: &Q, with_entry: F) -> Option<T>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        F: FnOnce(&K, &V) -> T,
    {
        let hash = self.hash_of(key);
        let guard = &epoch::pin();
        let partition = self.partition_at(self.partition_index(hash), guard)?;
        partition.get_with(guard, hash, key, with_entry)
    }

    /// Check if the map contains a specific key.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.get_with(key, |_, _| ()).is_some()
    }

    /// Maps `key` to `value`, returning the previously bound value.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::StripeMap;
    ///
    /// let map = StripeMap::new();
    /// assert_eq!(map.insert("alive", true), None);
    /// assert_eq!(map.insert("alive", false), Some(true));
    /// ```
    pub fn insert(&self, key: K, value: V) -> Option<V>
    where
        K: Clone,
        V: Clone,
    {
        self.put(key, value, false)
    }

    /// Maps `key` to `value` only if no binding exists yet; returns the
    /// existing value otherwise.
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<V>
    where
        K: Clone,
        V: Clone,
    {
        self.put(key, value, true)
    }

    fn put(&self, key: K, value: V, only_if_absent: bool) -> Option<V>
    where
        K: Clone,
        V: Clone,
    {
        let hash = self.hash_of(&key);
        let guard = &epoch::pin();
        let partition = self.ensure_partition(self.partition_index(hash), guard);
        partition.put(guard, key, hash, value, only_if_absent)
    }

    /// Removes the binding for `key`, returning the removed value.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: Clone,
    {
        let hash = self.hash_of(key);
        let guard = &epoch::pin();
        let partition = self.partition_at(self.partition_index(hash), guard)?;
        partition.remove_if(guard, key, hash, |_| true)
    }

    /// Removes the binding for `key` only if it currently equals
    /// `expected`. Returns whether a removal happened.
    pub fn remove_if_equals<Q>(&self, key: &Q, expected: &V) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: Clone + PartialEq,
    {
        let hash = self.hash_of(key);
        let guard = &epoch::pin();
        let Some(partition) = self.partition_at(self.partition_index(hash), guard) else {
            return false;
        };
        partition
            .remove_if(guard, key, hash, |v| v == expected)
            .is_some()
    }

    /// Rebinds `key` to `value` only if a binding already exists; returns
    /// the previous value.
    pub fn replace<Q>(&self, key: &Q, value: V) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: Clone,
    {
        let hash = self.hash_of(key);
        let guard = &epoch::pin();
        let partition = self.partition_at(self.partition_index(hash), guard)?;
        partition.replace(guard, key, hash, value)
    }

    /// Rebinds `key` to `value` only if it is currently bound to
    /// `expected`. Returns whether a replacement happened.
    pub fn replace_if_equals<Q>(&self, key: &Q, expected: &V, value: V) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: Clone + PartialEq,
    {
        let hash = self.hash_of(key);
        let guard = &epoch::pin();
        let Some(partition) = self.partition_at(self.partition_index(hash), guard) else {
            return false;
        };
        partition.replace_if_equals(guard, key, hash, expected, value)
    }

    /// Clear all entries in the map.
    pub fn clear(&self) {
        let guard = &epoch::pin();
        for index in 0..self.partitions.len() {
            if let Some(partition) = self.partition_at(index, guard) {
                partition.clear(guard);
            }
        }
    }

    /// The number of entries in the map.
    ///
    /// Sums per-partition counts without locking and accepts the result
    /// once two consecutive passes observe the same modification stamps;
    /// after two unstable passes every partition is locked for one
    /// authoritative pass.
    pub fn len(&self) -> usize {
        let guard = &epoch::pin();
        let mut locked = Vec::new();
        let mut last_sum = 0u64;
        let mut retries = -1i32;
        loop {
            if retries == RETRIES_BEFORE_LOCK {
                for index in 0..self.partitions.len() {
                    locked.push(self.ensure_partition(index, guard).lock.lock());
                }
            }
            retries += 1;

            let mut sum = 0u64;
            let mut size = 0usize;
            for index in 0..self.partitions.len() {
                if let Some(partition) = self.partition_at(index, guard) {
                    sum = sum.wrapping_add(u64::from(partition.mod_stamp.load(Ordering::Acquire)));
                    size = size.saturating_add(partition.count.load(Ordering::Acquire));
                }
            }
            if sum == last_sum {
                return size;
            }
            last_sum = sum;
        }
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();

        // A per-partition check alone could miss entries bouncing between
        // partitions mid-scan; the stamp sum catches that, accurate up to
        // 2³¹ modifications per partition between the two passes.
        let mut sum = 0u64;
        for index in 0..self.partitions.len() {
            if let Some(partition) = self.partition_at(index, guard) {
                if partition.count.load(Ordering::Acquire) != 0 {
                    return false;
                }
                sum = sum.wrapping_add(u64::from(partition.mod_stamp.load(Ordering::Acquire)));
            }
        }
        if sum != 0 {
            for index in 0..self.partitions.len() {
                if let Some(partition) = self.partition_at(index, guard) {
                    if partition.count.load(Ordering::Acquire) != 0 {
                        return false;
                    }
                    sum = sum.wrapping_sub(u64::from(partition.mod_stamp.load(Ordering::Acquire)));
                }
            }
            if sum != 0 {
                return false;
            }
        }
        true
    }

    /// Whether any key is currently bound to `value`. Walks every chain, so
    /// this is far slower than [`contains_key`](Self::contains_key).
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        let guard = &epoch::pin();
        let mut locked = Vec::new();
        let mut last_sum = 0u64;
        let mut retries = -1i32;
        loop {
            if retries == RETRIES_BEFORE_LOCK {
                for index in 0..self.partitions.len() {
                    locked.push(self.ensure_partition(index, guard).lock.lock());
                }
            }
            retries += 1;

            let mut sum = 0u64;
            for index in 0..self.partitions.len() {
                if let Some(partition) = self.partition_at(index, guard) {
                    if partition.contains_value(guard, value) {
                        return true;
                    }
                    sum = sum.wrapping_add(u64::from(partition.mod_stamp.load(Ordering::Acquire)));
                }
            }
            if retries > 0 && sum == last_sum {
                return false;
            }
            last_sum = sum;
        }
    }
}

impl<K, V, S> Drop for StripeMap<K, V, S> {
    fn drop(&mut self) {
        let guard = unsafe { epoch::unprotected() };
        for slot in self.partitions.iter() {
            let partition = slot.swap(Shared::null(), Ordering::Relaxed, guard);
            if !partition.is_null() {
                drop(unsafe { partition.into_owned() });
            }
        }
    }
}

impl<K, V, S> Default for StripeMap<K, V, S>
where
    S: BuildHasher + Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> fmt::Debug for StripeMap<K, V, S>
where
    K: fmt::Debug + Clone,
    V: fmt::Debug + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S> FromIterator<(K, V)> for StripeMap<K, V, S>
where
    K: Eq + Hash + Clone,
    V: Clone,
    S: BuildHasher + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(entries: I) -> Self {
        let entries = entries.into_iter();
        let (lower, _) = entries.size_hint();
        let capacity = ((lower as f32 / DEFAULT_LOAD_FACTOR) as usize + 1)
            .max(DEFAULT_INITIAL_CAPACITY);
        let map = Self::with_capacity_and_hasher(capacity, S::default());
        for (key, value) in entries {
            map.insert(key, value);
        }
        map
    }
}

impl<K, V, S> Extend<(K, V)> for StripeMap<K, V, S>
where
    K: Eq + Hash + Clone,
    V: Clone,
    S: BuildHasher,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, entries: I) {
        for (key, value) in entries {
            self.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_count_rounds_up() {
        let map: StripeMap<u32, u32> =
            StripeMap::with_options_and_hasher(
                Options {
                    concurrency_level: 3,
                    ..Options::default()
                },
                RandomState::new(),
            );
        assert_eq!(map.partition_count(), 4);
    }

    #[test]
    fn partition_count_clamps_to_maximum() {
        let map: StripeMap<u32, u32> = StripeMap::with_options_and_hasher(
            Options {
                concurrency_level: 100_000,
                ..Options::default()
            },
            RandomState::new(),
        );
        assert_eq!(map.partition_count(), MAX_PARTITIONS);
    }

    #[test]
    #[should_panic(expected = "load factor")]
    fn rejects_non_positive_load_factor() {
        let _: StripeMap<u32, u32> = StripeMap::with_options_and_hasher(
            Options {
                load_factor: 0.0,
                ..Options::default()
            },
            RandomState::new(),
        );
    }

    #[test]
    #[should_panic(expected = "concurrency level")]
    fn rejects_zero_concurrency_level() {
        let _: StripeMap<u32, u32> = StripeMap::with_options_and_hasher(
            Options {
                concurrency_level: 0,
                ..Options::default()
            },
            RandomState::new(),
        );
    }
}
