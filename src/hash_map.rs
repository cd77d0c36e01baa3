use core::borrow::Borrow;
use core::fmt::Debug;
use core::hash::BuildHasher;
use core::hash::Hash;
use core::num::NonZeroUsize;
use core::sync::atomic::AtomicIsize;
use core::sync::atomic::Ordering;

use crossbeam_epoch::Atomic;
use crossbeam_epoch::Guard;
use crossbeam_epoch::Owned;
use crossbeam_epoch::Shared;
use crossbeam_epoch as epoch;

use crate::DefaultHashBuilder;
use crate::coordinator::ResizeCoordinator;
use crate::coordinator::TableState;
use crate::error::Error;
use crate::error::Result;
use crate::hash_table::Cursor;
use crate::hash_table::Entry;
use crate::hash_table::HOP_RANGE;
use crate::hash_table::MAX_SEGMENT_LEN;
use crate::hash_table::MAX_SEGMENTS;
use crate::hash_table::Outcome;
use crate::hash_table::SegmentTable;
use crate::hash_table::Upsert;
use crate::hash_table::Upserted;
use crate::spread::spread_u64;

/// Slot count used when no capacity is requested.
pub const DEFAULT_CAPACITY: usize = 96;

/// Construction parameters for a [`ConcurrentMap`].
///
/// # Examples
///
/// ```rust
/// use concurrent_hopscotch::{ConcurrentMap, Options};
///
/// let options = Options {
///     capacity: 1024,
///     max_segments: 64,
///     ..Options::default()
/// };
/// let map: ConcurrentMap<u32, u32> = ConcurrentMap::with_options(options).unwrap();
/// assert!(map.capacity() >= 1024);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Number of slots to allocate initially. Rounded up to a power of two no
    /// smaller than one neighborhood, and at most 65536.
    pub capacity: usize,
    /// Expected number of concurrently writing threads. Must be at least 1.
    ///
    /// Writers only contend on the locks of the neighborhoods they touch, so
    /// this is recorded for diagnostics rather than used for lock striping.
    pub concurrency_level: usize,
    /// Upper bound on the number of segments. Must be a power of two no larger
    /// than [`MAX_SEGMENTS`](crate::MAX_SEGMENTS).
    pub max_segments: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            concurrency_level: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            max_segments: MAX_SEGMENTS,
        }
    }
}

impl Options {
    fn validate(&self) -> Result<()> {
        if self.concurrency_level == 0 {
            return Err(Error::InvalidArgument("concurrency level must be at least 1"));
        }
        if !self.max_segments.is_power_of_two() || self.max_segments > MAX_SEGMENTS {
            return Err(Error::InvalidArgument(
                "max segments must be a power of two no larger than 65536",
            ));
        }
        if self.capacity > MAX_SEGMENT_LEN {
            return Err(Error::InvalidArgument("capacity too large"));
        }
        Ok(())
    }

    fn segment_len(&self) -> usize {
        self.capacity.max(HOP_RANGE).next_power_of_two()
    }
}

/// A concurrent hash map built on segmented hopscotch hashing.
///
/// Every key lives within [`HOP_RANGE`](crate::HOP_RANGE) slots of its home
/// slot, and each home keeps a bitmap of which of those slots hold its keys.
///
/// - Lookups never block. They read the home's bitmap optimistically and
///   retry if a concurrent relocation disturbed the neighborhood.
/// - Writers lock only the home slot, plus, while making room, the home of
///   the entry being moved.
/// - When no room can be made near a home, the map doubles its number of
///   segments. Growth briefly blocks writers but not readers.
///
/// All operations take `&self`; share the map between threads with a
/// reference, `Arc`, or scoped threads. Values are returned by clone since
/// another thread may replace or remove them at any time.
///
/// # Examples
///
/// ```rust
/// use concurrent_hopscotch::ConcurrentMap;
///
/// let map = ConcurrentMap::new();
/// std::thread::scope(|s| {
///     for t in 0..4u64 {
///         let map = &map;
///         s.spawn(move || {
///             for i in 0..100 {
///                 map.try_insert(t * 100 + i, i).unwrap();
///             }
///         });
///     }
/// });
/// assert_eq!(map.len(), 400);
/// assert_eq!(map.get(&250), Some(50));
/// ```
pub struct ConcurrentMap<K, V, S = DefaultHashBuilder> {
    table: Atomic<SegmentTable<K, V>>,
    count: AtomicIsize,
    coordinator: ResizeCoordinator,
    hash_builder: S,
    options: Options,
}

impl<K, V> ConcurrentMap<K, V, DefaultHashBuilder> {
    /// Creates an empty map with the default capacity and hasher.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use concurrent_hopscotch::ConcurrentMap;
    ///
    /// let map: ConcurrentMap<String, i32> = ConcurrentMap::new();
    /// assert!(map.is_empty());
    /// assert!(map.capacity() >= 96);
    /// ```
    pub fn new() -> Self {
        Self::with_hasher(DefaultHashBuilder::default())
    }

    /// Creates an empty map with room for at least `capacity` entries before
    /// the first growth, assuming an even spread of keys.
    ///
    /// Capacities beyond what a single segment can hold (65536 slots) are
    /// clamped; the map grows past that by adding segments.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, DefaultHashBuilder::default())
    }

    /// Creates an empty map from explicit [`Options`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `concurrency_level` is zero, if
    /// `max_segments` is not a power of two in `1..=65536`, or if `capacity`
    /// is too large.
    pub fn with_options(options: Options) -> Result<Self> {
        Self::with_options_and_hasher(options, DefaultHashBuilder::default())
    }
}

impl<K, V, S> ConcurrentMap<K, V, S> {
    /// Creates an empty map that hashes keys with `hash_builder`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use core::hash::BuildHasher;
    /// # use siphasher::sip::SipHasher;
    /// #
    /// # use concurrent_hopscotch::ConcurrentMap;
    /// #
    /// # struct SimpleHasher;
    /// # impl BuildHasher for SimpleHasher {
    /// #     type Hasher = SipHasher;
    /// #
    /// #     fn build_hasher(&self) -> Self::Hasher {
    /// #         SipHasher::new()
    /// #     }
    /// # }
    /// #
    /// let map: ConcurrentMap<i32, String, _> = ConcurrentMap::with_hasher(SimpleHasher);
    /// assert!(map.is_empty());
    /// ```
    pub fn with_hasher(hash_builder: S) -> Self {
        Self::with_capacity_and_hasher(DEFAULT_CAPACITY, hash_builder)
    }

    /// Creates an empty map with the given capacity and hasher.
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        let options = Options {
            capacity: capacity.min(MAX_SEGMENT_LEN),
            ..Options::default()
        };
        Self::from_valid_options(options, hash_builder)
    }

    /// Creates an empty map from explicit [`Options`] and a hasher.
    ///
    /// # Errors
    ///
    /// See [`with_options`](ConcurrentMap::with_options).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use concurrent_hopscotch::{ConcurrentMap, DefaultHashBuilder, Error, Options};
    ///
    /// let options = Options { concurrency_level: 0, ..Options::default() };
    /// let result: Result<ConcurrentMap<u8, u8>, _> =
    ///     ConcurrentMap::with_options_and_hasher(options, DefaultHashBuilder::default());
    /// assert!(matches!(result, Err(Error::InvalidArgument(_))));
    /// ```
    pub fn with_options_and_hasher(options: Options, hash_builder: S) -> Result<Self> {
        options.validate()?;
        Ok(Self::from_valid_options(options, hash_builder))
    }

    fn from_valid_options(options: Options, hash_builder: S) -> Self {
        Self {
            table: Atomic::new(SegmentTable::new(options.segment_len())),
            count: AtomicIsize::new(0),
            coordinator: ResizeCoordinator::new(),
            hash_builder,
            options,
        }
    }

    #[inline]
    fn table<'g>(&'g self, guard: &'g Guard) -> &'g SegmentTable<K, V> {
        // SAFETY: The table pointer is only null after `drop` has started.
        // Replaced tables are retired through `defer_destroy`, so a table
        // loaded under `guard` outlives it.
        unsafe { self.table.load(Ordering::Acquire, guard).deref() }
    }

    /// Returns the number of entries in the map.
    ///
    /// The count is maintained with relaxed atomics; while writers are active
    /// it is a snapshot that may already be stale.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed).max(0) as usize
    }

    /// Returns `true` if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the total number of slots currently allocated.
    ///
    /// Because keys must stay close to their home slot, the map usually grows
    /// before every slot is used.
    pub fn capacity(&self) -> usize {
        let guard = epoch::pin();
        let table = self.table(&guard);
        table.segment_count() * table.segment_len()
    }

    /// Returns the number of segments the table is currently split into.
    pub fn segment_count(&self) -> usize {
        let guard = epoch::pin();
        self.table(&guard).segment_count()
    }

    /// Returns whether a growth is in progress.
    pub fn state(&self) -> TableState {
        self.coordinator.state()
    }

    /// Returns the options this map was built with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Returns a reference to the map's hasher builder.
    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }

    /// Returns an iterator over clones of the entries.
    ///
    /// The iterator is weakly consistent: it never yields the same key twice
    /// from a single slot and never blocks writers, but entries inserted,
    /// removed or relocated while it runs may or may not be observed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use concurrent_hopscotch::ConcurrentMap;
    ///
    /// let map = ConcurrentMap::new();
    /// map.insert("a", 1).unwrap();
    /// map.insert("b", 2).unwrap();
    ///
    /// let mut pairs: Vec<_> = map.iter().collect();
    /// pairs.sort();
    /// assert_eq!(pairs, vec![("a", 1), ("b", 2)]);
    /// ```
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter {
            map: self,
            cursor: Cursor::default(),
        }
    }

    /// Collects a snapshot of the entries in a single pass.
    pub fn to_vec(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let guard = epoch::pin();
        let table = self.table(&guard);
        let mut cursor = Cursor::default();
        let mut pairs = Vec::with_capacity(self.len());
        while let Some(entry) = table.next_entry(&mut cursor, &guard) {
            pairs.push((entry.key.clone(), entry.value(&guard).clone()));
        }
        pairs
    }
}

impl<K, V, S> ConcurrentMap<K, V, S>
where
    K: Hash + Eq + Send + 'static,
    V: Send + 'static,
    S: BuildHasher,
{
    #[inline]
    fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u32 {
        spread_u64(self.hash_builder.hash_one(key))
    }

    /// Lock-free lookup.
    ///
    /// A miss is only trusted if the table was not replaced meanwhile: growth
    /// empties relocated slots of the old directory after publishing the new
    /// one, so a reader still walking the old directory retries on the new.
    fn find<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<&'g Entry<K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        let mut current = self.table.load(Ordering::Acquire, guard);
        loop {
            // SAFETY: See `table`.
            let table = unsafe { current.deref() };
            if let Some(entry) = table.find(hash, |k| k.borrow() == key, guard) {
                return Some(entry);
            }

            let latest = self.table.load(Ordering::Acquire, guard);
            if latest == current {
                return None;
            }
            current = latest;
        }
    }

    /// Runs `request` under shared access, growing and retrying while the
    /// table reports that no slot can be made available near the key's home.
    fn write<R, T>(&self, mut request: R, finish: impl FnOnce(Outcome<'_, V>) -> T) -> Result<T>
    where
        R: Upsert<K, V>,
    {
        let hash = self.hash(request.key());
        loop {
            let observed_segments = {
                let _shared = self.coordinator.shared();
                let guard = epoch::pin();
                let table = self.table(&guard);
                match table.upsert(hash, request, &guard) {
                    Upserted::Done(outcome) => {
                        if let Outcome::Added(_) = outcome {
                            self.count.fetch_add(1, Ordering::Relaxed);
                        }
                        return Ok(finish(outcome));
                    }
                    Upserted::Full(returned) => {
                        request = returned;
                        table.segment_count()
                    }
                }
            };
            self.grow(observed_segments)?;
        }
    }

    /// Returns a clone of the value for `key`.
    ///
    /// Never blocks.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use concurrent_hopscotch::ConcurrentMap;
    ///
    /// let map = ConcurrentMap::new();
    /// map.insert(String::from("one"), 1).unwrap();
    /// assert_eq!(map.get("one"), Some(1));
    /// assert_eq!(map.get("two"), None);
    /// ```
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let guard = epoch::pin();
        self.find(key, &guard)
            .map(|entry| entry.value(&guard).clone())
    }

    /// Returns a clone of the value for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent.
    pub fn get_value<Q>(&self, key: &Q) -> Result<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.get(key).ok_or(Error::KeyNotFound)
    }

    /// Returns `true` if the map holds an entry for `key`.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = epoch::pin();
        self.find(key, &guard).is_some()
    }

    /// Inserts `key` with `value` unless the key is already present.
    ///
    /// Returns `true` if the entry was added. An existing value is left
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if the table would have to grow
    /// past its segment ceiling to make room.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use concurrent_hopscotch::ConcurrentMap;
    ///
    /// let map = ConcurrentMap::new();
    /// assert!(map.try_insert(1, "a").unwrap());
    /// assert!(!map.try_insert(1, "b").unwrap());
    /// assert_eq!(map.get(&1), Some("a"));
    /// ```
    pub fn try_insert(&self, key: K, value: V) -> Result<bool> {
        let request = AddOrUpdate {
            key,
            add: move |_: &K| value,
            update: None::<fn(&K, &V) -> V>,
        };
        self.write(request, |outcome| matches!(outcome, Outcome::Added(_)))
    }

    /// Inserts or overwrites the value for `key`, returning the previous
    /// value if there was one.
    ///
    /// # Errors
    ///
    /// See [`try_insert`](ConcurrentMap::try_insert).
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>>
    where
        V: Clone,
    {
        self.write(Assign { key, value }, |outcome| match outcome {
            Outcome::Added(_) => None,
            Outcome::Occupied { previous, .. } => Some(previous.clone()),
        })
    }

    /// Returns the value for `key`, inserting `value` first if the key is
    /// absent.
    ///
    /// # Errors
    ///
    /// See [`try_insert`](ConcurrentMap::try_insert).
    pub fn get_or_add(&self, key: K, value: V) -> Result<V>
    where
        V: Clone,
    {
        self.get_or_add_with(key, move |_| value)
    }

    /// Returns the value for `key`, inserting the result of `factory` first
    /// if the key is absent.
    ///
    /// The factory runs at most once, while the key's neighborhood is locked.
    /// It must not call back into the map.
    ///
    /// # Errors
    ///
    /// See [`try_insert`](ConcurrentMap::try_insert).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use concurrent_hopscotch::ConcurrentMap;
    ///
    /// let map = ConcurrentMap::new();
    /// assert_eq!(map.get_or_add_with(3, |k| k * 10).unwrap(), 30);
    /// assert_eq!(map.get_or_add_with(3, |_| unreachable!()).unwrap(), 30);
    /// ```
    pub fn get_or_add_with<F>(&self, key: K, factory: F) -> Result<V>
    where
        F: FnOnce(&K) -> V,
        V: Clone,
    {
        let request = AddOrUpdate {
            key,
            add: factory,
            update: None::<fn(&K, &V) -> V>,
        };
        self.write(request, |outcome| match outcome {
            Outcome::Added(current) | Outcome::Occupied { current, .. } => current.clone(),
        })
    }

    /// Inserts `value` if `key` is absent, otherwise replaces the stored value
    /// with `update(key, old)`. Returns the value now stored.
    ///
    /// `update` runs at most once, while the key's neighborhood is locked.
    ///
    /// # Errors
    ///
    /// See [`try_insert`](ConcurrentMap::try_insert).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use concurrent_hopscotch::ConcurrentMap;
    ///
    /// let counts = ConcurrentMap::new();
    /// for word in ["a", "b", "a"] {
    ///     counts.upsert(word, 1, |_, n| n + 1).unwrap();
    /// }
    /// assert_eq!(counts.get("a"), Some(2));
    /// assert_eq!(counts.get("b"), Some(1));
    /// ```
    pub fn upsert<U>(&self, key: K, value: V, update: U) -> Result<V>
    where
        U: FnOnce(&K, &V) -> V,
        V: Clone,
    {
        self.upsert_with(key, move |_| value, update)
    }

    /// Like [`upsert`](ConcurrentMap::upsert), but computes the inserted value
    /// with `add` only when the key is absent.
    ///
    /// # Errors
    ///
    /// See [`try_insert`](ConcurrentMap::try_insert).
    pub fn upsert_with<A, U>(&self, key: K, add: A, update: U) -> Result<V>
    where
        A: FnOnce(&K) -> V,
        U: FnOnce(&K, &V) -> V,
        V: Clone,
    {
        let request = AddOrUpdate {
            key,
            add,
            update: Some(update),
        };
        self.write(request, |outcome| match outcome {
            Outcome::Added(current) | Outcome::Occupied { current, .. } => current.clone(),
        })
    }

    /// Replaces the value for `key` with `value`, but only if it currently
    /// equals `expected`. Returns `true` if the value was replaced.
    ///
    /// The comparison and the replacement happen atomically with respect to
    /// every other write to the same key.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use concurrent_hopscotch::ConcurrentMap;
    ///
    /// let map = ConcurrentMap::new();
    /// map.insert("k", 1).unwrap();
    /// assert!(!map.try_update("k", 5, &2));
    /// assert!(map.try_update("k", 5, &1));
    /// assert_eq!(map.get("k"), Some(5));
    /// ```
    pub fn try_update<Q>(&self, key: &Q, value: V, expected: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let hash = self.hash(key);
        let _shared = self.coordinator.shared();
        let guard = epoch::pin();
        self.table(&guard)
            .compare_exchange(hash, |k| k.borrow() == key, expected, value, &guard)
    }

    /// Removes the entry for `key`, returning its value.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use concurrent_hopscotch::ConcurrentMap;
    ///
    /// let map = ConcurrentMap::new();
    /// map.insert(1, "a").unwrap();
    /// assert_eq!(map.remove(&1), Some("a"));
    /// assert_eq!(map.remove(&1), None);
    /// assert!(map.is_empty());
    /// ```
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let hash = self.hash(key);
        let _shared = self.coordinator.shared();
        let guard = epoch::pin();
        let removed = self
            .table(&guard)
            .remove(hash, |k| k.borrow() == key, &guard)
            .cloned();
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Removes every entry.
    ///
    /// Waits for in-flight writers and blocks new ones until done. The
    /// allocated capacity is kept.
    pub fn clear(&self) {
        let _exclusive = self.coordinator.exclusive();
        let guard = epoch::pin();
        self.table(&guard).clear(&guard);
        self.count.store(0, Ordering::Relaxed);
    }

    /// Doubles the segment count, unless another thread already grew the
    /// table past `observed_segments`.
    #[cold]
    fn grow(&self, observed_segments: usize) -> Result<()> {
        let _exclusive = self.coordinator.exclusive();
        let guard = epoch::pin();

        let current = self.table.load(Ordering::Acquire, &guard);
        // SAFETY: See `table`.
        let table = unsafe { current.deref() };
        if table.segment_count() != observed_segments {
            return Ok(());
        }

        let max_segments = self.options.max_segments;
        if observed_segments * 2 > max_segments {
            tracing::warn!(
                segments = observed_segments,
                max_segments,
                "segment ceiling reached, cannot grow"
            );
            return Err(Error::ResourceExhausted { max_segments });
        }

        let (grown, relocations) = table.grow(&guard);
        self.table.store(Owned::new(grown), Ordering::Release);
        table.retire_relocated(&relocations);
        // SAFETY: The old directory is unreachable now. Its segments are shared
        // with the new one and outlive it.
        unsafe { guard.defer_destroy(current) };

        tracing::debug!(
            from = observed_segments,
            to = observed_segments * 2,
            relocated = relocations.len(),
            "grew segment table"
        );
        Ok(())
    }
}

#[cfg(any(test, feature = "stats"))]
impl<K, V, S> ConcurrentMap<K, V, S>
where
    K: Hash + Eq + Send + 'static,
    V: Send + 'static,
    S: BuildHasher,
{
    /// Collects slot utilization statistics.
    pub fn debug_stats(&self) -> crate::DebugStats {
        let guard = epoch::pin();
        self.table(&guard).debug_stats(&guard)
    }

    /// Returns the number of entries at each distance from their home slot.
    pub fn probe_histogram(&self) -> Vec<usize> {
        let guard = epoch::pin();
        self.table(&guard).probe_histogram(&guard)
    }

    /// Prints the probe-distance histogram as a bar chart.
    pub fn print_probe_histogram(&self) {
        let histogram = self.probe_histogram();
        let total = histogram.iter().sum::<usize>().max(1);
        let widest = histogram.iter().copied().max().unwrap_or(0).max(1);

        println!("=== Probe Distance Histogram ===");
        for (distance, &count) in histogram.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let bar = "#".repeat(count * 40 / widest);
            println!(
                "{distance:>2}: {count:>8} ({:>6.2}%) {bar}",
                count as f64 * 100.0 / total as f64
            );
        }
    }

    /// Checks every neighborhood invariant, and that each stored key still
    /// hashes to the home it is filed under.
    ///
    /// Must not run concurrently with writers to give a meaningful answer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InternalInvariantViolation`] naming the first broken
    /// invariant.
    pub fn validate(&self) -> Result<()> {
        let guard = epoch::pin();
        let table = self.table(&guard);
        table.validate(&guard)?;

        let mut cursor = Cursor::default();
        while let Some(entry) = table.next_entry(&mut cursor, &guard) {
            let hash = self.hash(&entry.key);
            if table.find(hash, |k| k == &entry.key, &guard).is_none() {
                return Err(Error::InternalInvariantViolation(
                    "stored key is not reachable from its home",
                ));
            }
        }
        Ok(())
    }
}

/// A weakly consistent iterator over clones of a map's entries.
///
/// Created by [`ConcurrentMap::iter`]. Each call to `next` pins the current
/// epoch on its own, so holding an iterator never delays memory reclamation.
pub struct Iter<'a, K, V, S> {
    map: &'a ConcurrentMap<K, V, S>,
    cursor: Cursor,
}

impl<K, V, S> Iter<'_, K, V, S> {
    /// Starts over from the first slot.
    pub fn restart(&mut self) {
        self.cursor = Cursor::default();
    }
}

impl<K, V, S> Clone for Iter<'_, K, V, S> {
    fn clone(&self) -> Self {
        Self {
            map: self.map,
            cursor: self.cursor,
        }
    }
}

impl<K, V, S> Iterator for Iter<'_, K, V, S>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        let guard = epoch::pin();
        let table = self.map.table(&guard);
        table
            .next_entry(&mut self.cursor, &guard)
            .map(|entry| (entry.key.clone(), entry.value(&guard).clone()))
    }
}

impl<'a, K, V, S> IntoIterator for &'a ConcurrentMap<K, V, S>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K, V, S> Debug for ConcurrentMap<K, V, S>
where
    K: Debug + Clone,
    V: Debug + Clone,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S> Default for ConcurrentMap<K, V, S>
where
    S: Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> Extend<(K, V)> for &ConcurrentMap<K, V, S>
where
    K: Hash + Eq + Send + 'static,
    V: Clone + Send + 'static,
    S: BuildHasher,
{
    /// Inserts every pair, overwriting existing values.
    ///
    /// # Panics
    ///
    /// Panics if the table cannot grow to make room for a pair.
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (key, value) in iter {
            if let Err(error) = self.insert(key, value) {
                panic!("{error}");
            }
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for ConcurrentMap<K, V, S>
where
    K: Hash + Eq + Send + 'static,
    V: Clone + Send + 'static,
    S: BuildHasher + Default,
{
    /// # Panics
    ///
    /// Panics if the table cannot grow to make room for a pair.
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let iter = iter.into_iter();
        let map = Self::with_capacity_and_hasher(iter.size_hint().0, S::default());
        (&map).extend(iter);
        map
    }
}

impl<K, V, S> Drop for ConcurrentMap<K, V, S> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` guarantees that no other thread can reach the
        // table any more.
        unsafe {
            let guard = epoch::unprotected();
            let table = self.table.swap(Shared::null(), Ordering::Relaxed, guard);
            if table.is_null() {
                return;
            }
            let table = table.into_owned();
            table.drop_entries();
        }
    }
}

/// Inserts the result of `add` when the key is absent; applies `update`, if
/// any, when it is present.
struct AddOrUpdate<K, A, U> {
    key: K,
    add: A,
    update: Option<U>,
}

impl<K, V, A, U> Upsert<K, V> for AddOrUpdate<K, A, U>
where
    A: FnOnce(&K) -> V,
    U: FnOnce(&K, &V) -> V,
{
    fn key(&self) -> &K {
        &self.key
    }

    fn vacant(self) -> (K, V) {
        let value = (self.add)(&self.key);
        (self.key, value)
    }

    fn occupied(self, current: &V) -> Option<V> {
        let key = self.key;
        self.update.map(|update| update(&key, current))
    }
}

/// Stores `value` whether or not the key is present.
struct Assign<K, V> {
    key: K,
    value: V,
}

impl<K, V> Upsert<K, V> for Assign<K, V> {
    fn key(&self) -> &K {
        &self.key
    }

    fn vacant(self) -> (K, V) {
        (self.key, self.value)
    }

    fn occupied(self, _current: &V) -> Option<V> {
        Some(self.value)
    }
}
