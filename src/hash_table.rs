use core::sync::atomic::AtomicBool;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_epoch::Atomic;
use crossbeam_epoch::Guard;
use crossbeam_epoch::Owned;
use crossbeam_epoch::Shared;
use parking_lot::Mutex;

use crate::error::invariant_violation;

/// Number of slots in a neighborhood. An entry always lives within this
/// distance of its home slot, and a home's bitmap has one bit per offset.
pub const HOP_RANGE: usize = 32;

/// How far past its home an insert probes for a free slot before giving up
/// and growing the table.
pub const ADD_RANGE: usize = 64;

/// Hard ceiling on the number of segments.
pub const MAX_SEGMENTS: usize = 1 << 16;

/// Optimistic lookup attempts before falling back to a full neighborhood
/// scan.
pub(crate) const MAX_TRIES: usize = 2;

/// Largest shift that still leaves room for `MAX_SEGMENTS` worth of segment
/// index bits in a 32-bit hash.
const MAX_SEGMENT_SHIFT: u32 = 32 - MAX_SEGMENTS.trailing_zeros();

/// Largest number of homes per segment. Home offset bits and segment index
/// bits never overlap up to this length.
pub(crate) const MAX_SEGMENT_LEN: usize = 1 << MAX_SEGMENT_SHIFT;

/// A stored key/value pair.
///
/// Slots point at entries, so a reader always sees a complete pair or
/// nothing. The value sits behind its own pointer so that updates do not
/// need to rebuild the entry.
pub(crate) struct Entry<K, V> {
    hash: u32,
    pub(crate) key: K,
    value: Atomic<V>,
}

impl<K, V> Entry<K, V> {
    fn new(hash: u32, key: K, value: V) -> Self {
        Self {
            hash,
            key,
            value: Atomic::new(value),
        }
    }

    #[inline]
    pub(crate) fn value<'g>(&'g self, guard: &'g Guard) -> &'g V {
        // SAFETY: The value pointer is never null while the entry exists.
        // Replaced values are retired through `defer_destroy`, so they outlive
        // every guard that could have loaded them.
        unsafe { self.value.load(Ordering::Acquire, guard).deref() }
    }

    fn replace_value<'g>(&'g self, value: V, guard: &'g Guard) -> &'g V {
        let replaced = self.value.swap(Owned::new(value), Ordering::AcqRel, guard);
        // SAFETY: `replaced` is no longer reachable from the entry. Readers that
        // loaded it before the swap are protected by their own guards.
        unsafe {
            let previous = replaced.deref();
            guard.defer_destroy(replaced);
            previous
        }
    }
}

impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        // SAFETY: An entry is only dropped once it is unreachable from every
        // slot, so nobody else can observe its value any more.
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let value = self.value.swap(Shared::null(), Ordering::Relaxed, guard);
            if !value.is_null() {
                drop(value.into_owned());
            }
        }
    }
}

/// One table cell.
///
/// `hop_info`, `timestamp` and `lock` describe the slot in its role as a
/// home; `occupied` and `entry` describe what is stored in the slot itself.
struct Slot<K, V> {
    /// Bit `i` is set when slot `home + i` holds an entry whose home is this
    /// slot. Only modified while `lock` is held (or under exclusive growth).
    hop_info: AtomicU32,
    /// Bumped whenever an entry homed here is moved by someone else, so that
    /// optimistic readers can detect that they raced with a relocation.
    timestamp: AtomicU32,
    /// Claim flag. Set before `entry` is written and cleared after it is
    /// emptied, so an inserter can reserve the slot with a single CAS.
    occupied: AtomicBool,
    entry: Atomic<Entry<K, V>>,
    lock: Mutex<()>,
}

impl<K, V> Slot<K, V> {
    fn new() -> Self {
        Self {
            hop_info: AtomicU32::new(0),
            timestamp: AtomicU32::new(0),
            occupied: AtomicBool::new(false),
            entry: Atomic::null(),
            lock: Mutex::new(()),
        }
    }

    #[inline]
    fn try_claim(&self) -> bool {
        self.occupied
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn release(&self) {
        self.occupied.store(false, Ordering::Release);
    }
}

/// A claimed slot that has not been filled yet. Dropping it gives the slot
/// back, so a failed insert (or a panicking value factory) never leaks it.
struct Claim<'a, K, V> {
    slot: &'a Slot<K, V>,
}

impl<K, V> Claim<'_, K, V> {
    fn fill(self, entry: Shared<'_, Entry<K, V>>) {
        self.slot.entry.store(entry, Ordering::Release);
        core::mem::forget(self);
    }
}

impl<K, V> Drop for Claim<'_, K, V> {
    fn drop(&mut self) {
        self.slot.release();
    }
}

/// A fixed-length array of slots.
///
/// Homes are the first `segment_len` slots. Neighborhoods never wrap, so the
/// segment carries `ADD_RANGE - 1` trailing slots that can hold entries but
/// are never a home; every home gets its full `ADD_RANGE` window.
pub(crate) struct Segment<K, V> {
    slots: Box<[Slot<K, V>]>,
}

impl<K, V> Segment<K, V> {
    fn new(segment_len: usize) -> Self {
        Self {
            slots: (0..segment_len + ADD_RANGE - 1).map(|_| Slot::new()).collect(),
        }
    }

    /// Looks at the slots named by `hop_info` and returns the offset and entry
    /// of the first one matching `hash` and `eq`.
    fn scan_hop_info<'g>(
        &'g self,
        home: usize,
        hop_info: u32,
        hash: u32,
        eq: impl Fn(&K) -> bool,
        guard: &'g Guard,
    ) -> Option<(usize, &'g Entry<K, V>)> {
        let mut mask = hop_info;
        while mask != 0 {
            let offset = mask.trailing_zeros() as usize;
            mask &= mask - 1;

            let Some(slot) = self.slots.get(home + offset) else {
                break;
            };
            // SAFETY: Entries are retired through `defer_destroy` after being
            // unlinked, so a pointer loaded under `guard` stays valid.
            if let Some(entry) = unsafe { slot.entry.load(Ordering::Acquire, guard).as_ref() } {
                if entry.hash == hash && eq(&entry.key) {
                    return Some((offset, entry));
                }
            }
        }

        None
    }

    /// Checks every slot of the neighborhood, ignoring the bitmap.
    fn scan_window<'g>(
        &'g self,
        home: usize,
        hash: u32,
        eq: impl Fn(&K) -> bool,
        guard: &'g Guard,
    ) -> Option<&'g Entry<K, V>> {
        self.slots[home..home + HOP_RANGE]
            .iter()
            // SAFETY: See `scan_hop_info`.
            .filter_map(|slot| unsafe { slot.entry.load(Ordering::Acquire, guard).as_ref() })
            .find(|entry| entry.hash == hash && eq(&entry.key))
    }

    /// Moves an entry from in front of `free` into it, so that the free slot
    /// ends up closer to the inserter's home. Returns the new free slot.
    ///
    /// The caller owns the claim on `free` and holds the lock of a home that
    /// lies more than `HOP_RANGE - 1` slots before it, so every candidate
    /// locked here sits strictly after the caller's home.
    fn find_closer_free_slot(&self, free: usize, guard: &Guard) -> Option<usize> {
        for candidate in free + 1 - HOP_RANGE..free {
            let distance = free - candidate;
            let mover = &self.slots[candidate];

            let snapshot = mover.hop_info.load(Ordering::Acquire);
            let movable = snapshot & ((1u32 << distance) - 1);
            if movable == 0 {
                continue;
            }
            let offset = movable.trailing_zeros() as usize;

            let _mover_lock = mover.lock.lock();
            if mover.hop_info.load(Ordering::Acquire) != snapshot {
                continue;
            }

            let source = &self.slots[candidate + offset];
            let entry = source.entry.load(Ordering::Acquire, guard);
            if entry.is_null() {
                invariant_violation("neighborhood bitmap points at an empty slot");
            }

            // The entry is visible at its new position before it disappears
            // from the old one, and the timestamp moves before the old slot is
            // emptied, so a reader that misses it also sees the bump.
            self.slots[free].entry.store(entry, Ordering::Release);
            mover.hop_info.fetch_or(1 << distance, Ordering::Release);
            mover.timestamp.fetch_add(1, Ordering::Release);
            source.entry.store(Shared::null(), Ordering::Release);
            mover.hop_info.fetch_and(!(1 << offset), Ordering::Release);

            return Some(candidate + offset);
        }

        None
    }
}

/// A write applied to a key under its home lock.
pub(crate) trait Upsert<K, V> {
    fn key(&self) -> &K;

    /// Produces the entry to store when the key is absent.
    fn vacant(self) -> (K, V);

    /// Produces a replacement value when the key is present. `None` leaves the
    /// stored value untouched.
    fn occupied(self, current: &V) -> Option<V>;
}

pub(crate) enum Outcome<'g, V> {
    Added(&'g V),
    Occupied { previous: &'g V, current: &'g V },
}

pub(crate) enum Upserted<'g, V, R> {
    Done(Outcome<'g, V>),
    /// No slot could be found or freed near the home; the request is handed
    /// back untouched so it can be retried after growing.
    Full(R),
}

/// An entry copied into its mirror segment during growth, still to be
/// removed from its old position.
pub(crate) struct Relocation {
    segment: usize,
    slot: usize,
    home: usize,
}

/// Position of a weakly consistent scan over every slot of a table.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Cursor {
    segment: usize,
    slot: usize,
}

/// The segment directory.
///
/// A spread hash is split into a segment index
/// (`(hash >> segment_shift) & segment_mask`) and a home offset within the
/// segment (`hash & bucket_mask`). Growth never modifies a published table's
/// shape: it builds a new directory that shares the existing segments.
pub(crate) struct SegmentTable<K, V> {
    segments: Vec<Arc<Segment<K, V>>>,
    segment_mask: u32,
    bucket_mask: u32,
    segment_shift: u32,
}

impl<K, V> SegmentTable<K, V> {
    /// Creates a single-segment table. `segment_len` must be a power of two
    /// between `HOP_RANGE` and `MAX_SEGMENT_LEN`.
    pub(crate) fn new(segment_len: usize) -> Self {
        debug_assert!(segment_len.is_power_of_two());
        debug_assert!((HOP_RANGE..=MAX_SEGMENT_LEN).contains(&segment_len));
        Self {
            segments: vec![Arc::new(Segment::new(segment_len))],
            segment_mask: 0,
            bucket_mask: (segment_len - 1) as u32,
            segment_shift: segment_len.trailing_zeros().min(MAX_SEGMENT_SHIFT),
        }
    }

    #[inline]
    pub(crate) fn segment_count(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    pub(crate) fn segment_len(&self) -> usize {
        self.bucket_mask as usize + 1
    }

    #[inline]
    fn locate(&self, hash: u32) -> (&Segment<K, V>, usize) {
        let segment = ((hash >> self.segment_shift) & self.segment_mask) as usize;
        (&self.segments[segment], (hash & self.bucket_mask) as usize)
    }

    /// Lock-free lookup.
    ///
    /// Scans the home's bitmap, and if nothing matched while the home's
    /// timestamp moved, tries again. After `MAX_TRIES` disturbed attempts it
    /// checks every slot of the neighborhood instead.
    pub(crate) fn find<'g>(
        &'g self,
        hash: u32,
        eq: impl Fn(&K) -> bool,
        guard: &'g Guard,
    ) -> Option<&'g Entry<K, V>> {
        let (segment, home) = self.locate(hash);
        let home_slot = &segment.slots[home];

        for _ in 0..MAX_TRIES {
            let timestamp = home_slot.timestamp.load(Ordering::Acquire);
            let hop_info = home_slot.hop_info.load(Ordering::Acquire);
            if let Some((_, entry)) = segment.scan_hop_info(home, hop_info, hash, &eq, guard) {
                return Some(entry);
            }
            if home_slot.timestamp.load(Ordering::Acquire) == timestamp {
                return None;
            }
        }

        tracing::trace!(home, "optimistic lookup disturbed, scanning whole neighborhood");
        segment.scan_window(home, hash, &eq, guard)
    }

    /// Applies `request` under the home lock: updates the entry if the key is
    /// present, otherwise claims a slot (displacing entries if needed) and
    /// stores a new one.
    pub(crate) fn upsert<'g, R>(&'g self, hash: u32, request: R, guard: &'g Guard) -> Upserted<'g, V, R>
    where
        K: Eq,
        R: Upsert<K, V>,
    {
        let (segment, home) = self.locate(hash);
        let home_slot = &segment.slots[home];
        let _home_lock = home_slot.lock.lock();

        let hop_info = home_slot.hop_info.load(Ordering::Acquire);
        let found = segment.scan_hop_info(home, hop_info, hash, |k| k == request.key(), guard);
        if let Some((_, entry)) = found {
            let current = entry.value(guard);
            return Upserted::Done(match request.occupied(current) {
                Some(value) => Outcome::Occupied {
                    previous: entry.replace_value(value, guard),
                    current: entry.value(guard),
                },
                None => Outcome::Occupied {
                    previous: current,
                    current,
                },
            });
        }

        let Some(mut free) = (home..home + ADD_RANGE).find(|&index| segment.slots[index].try_claim())
        else {
            return Upserted::Full(request);
        };
        let mut claim = Claim {
            slot: &segment.slots[free],
        };

        while free - home >= HOP_RANGE {
            match segment.find_closer_free_slot(free, guard) {
                Some(closer) => {
                    free = closer;
                    claim.slot = &segment.slots[free];
                }
                None => {
                    tracing::trace!(home, free, "no displacement candidate");
                    return Upserted::Full(request);
                }
            }
        }

        let (key, value) = request.vacant();
        let entry = Owned::new(Entry::new(hash, key, value)).into_shared(guard);
        claim.fill(entry);
        home_slot.hop_info.fetch_or(1 << (free - home), Ordering::Release);

        // SAFETY: The entry was just published and can only be reclaimed
        // through `defer_destroy`, which waits for `guard`.
        Upserted::Done(Outcome::Added(unsafe { entry.deref() }.value(guard)))
    }

    /// Unlinks the entry matching `hash` and `eq`, returning its value.
    pub(crate) fn remove<'g>(
        &'g self,
        hash: u32,
        eq: impl Fn(&K) -> bool,
        guard: &'g Guard,
    ) -> Option<&'g V> {
        let (segment, home) = self.locate(hash);
        let home_slot = &segment.slots[home];
        let _home_lock = home_slot.lock.lock();

        let hop_info = home_slot.hop_info.load(Ordering::Acquire);
        let (offset, _) = segment.scan_hop_info(home, hop_info, hash, eq, guard)?;

        let slot = &segment.slots[home + offset];
        let entry = slot.entry.swap(Shared::null(), Ordering::AcqRel, guard);
        home_slot.hop_info.fetch_and(!(1 << offset), Ordering::Release);
        slot.release();

        // SAFETY: `entry` was unlinked above. Its value stays valid until
        // `guard` is dropped because destruction is deferred.
        unsafe {
            let value = entry.deref().value(guard);
            guard.defer_destroy(entry);
            Some(value)
        }
    }

    /// Replaces the value for the key with `value` if it currently equals
    /// `expected`. Runs entirely under the home lock.
    pub(crate) fn compare_exchange(
        &self,
        hash: u32,
        eq: impl Fn(&K) -> bool,
        expected: &V,
        value: V,
        guard: &Guard,
    ) -> bool
    where
        V: PartialEq,
    {
        let (segment, home) = self.locate(hash);
        let home_slot = &segment.slots[home];
        let _home_lock = home_slot.lock.lock();

        let hop_info = home_slot.hop_info.load(Ordering::Acquire);
        match segment.scan_hop_info(home, hop_info, hash, eq, guard) {
            Some((_, entry)) if entry.value(guard) == expected => {
                entry.replace_value(value, guard);
                true
            }
            _ => false,
        }
    }

    /// Builds the directory with twice as many segments.
    ///
    /// Existing segments are shared with the new directory. Every entry whose
    /// hash selects the upper half is copied to the same offset of its mirror
    /// segment; it is *not* removed from its old slot yet, so lookups through
    /// either directory keep finding it until the returned relocations are
    /// retired with [`retire_relocated`](Self::retire_relocated).
    ///
    /// Must only be called with exclusive access, so that no slot changes
    /// underneath.
    pub(crate) fn grow(&self, guard: &Guard) -> (Self, Vec<Relocation>) {
        let old_count = self.segments.len();
        let old_mask = self.segment_mask;
        let new_mask = ((old_count << 1) - 1) as u32;
        let segment_len = self.segment_len();

        let mut segments = Vec::with_capacity(old_count << 1);
        segments.extend(self.segments.iter().cloned());
        segments.extend((0..old_count).map(|_| Arc::new(Segment::new(segment_len))));

        let mut relocations = Vec::new();
        for (index, segment) in self.segments.iter().enumerate() {
            let mirror = &segments[index + old_count];
            for (offset, slot) in segment.slots.iter().enumerate() {
                let shared = slot.entry.load(Ordering::Acquire, guard);
                // SAFETY: See `Segment::scan_hop_info`.
                let Some(entry) = (unsafe { shared.as_ref() }) else {
                    continue;
                };

                let target = (entry.hash >> self.segment_shift) & new_mask;
                if target & old_mask != index as u32 {
                    invariant_violation("entry stored in the wrong segment");
                }
                if target == index as u32 {
                    continue;
                }

                let home = (entry.hash & self.bucket_mask) as usize;
                let distance = offset
                    .checked_sub(home)
                    .filter(|&distance| distance < HOP_RANGE)
                    .unwrap_or_else(|| invariant_violation("entry outside its home neighborhood"));

                let destination = &mirror.slots[offset];
                destination.occupied.store(true, Ordering::Relaxed);
                destination.entry.store(shared, Ordering::Release);
                let mirror_home = &mirror.slots[home];
                mirror_home.hop_info.fetch_or(1 << distance, Ordering::Release);
                if distance != 0 {
                    mirror_home.timestamp.fetch_add(1, Ordering::Release);
                }

                relocations.push(Relocation {
                    segment: index,
                    slot: offset,
                    home,
                });
            }
        }

        let grown = Self {
            segments,
            segment_mask: new_mask,
            bucket_mask: self.bucket_mask,
            segment_shift: self.segment_shift,
        };
        (grown, relocations)
    }

    /// Removes relocated entries from their old slots once the grown
    /// directory is published.
    pub(crate) fn retire_relocated(&self, relocations: &[Relocation]) {
        for relocation in relocations {
            let segment = &self.segments[relocation.segment];
            let home = &segment.slots[relocation.home];
            let slot = &segment.slots[relocation.slot];

            home.timestamp.fetch_add(1, Ordering::Release);
            slot.entry.store(Shared::null(), Ordering::Release);
            home.hop_info
                .fetch_and(!(1 << (relocation.slot - relocation.home)), Ordering::Release);
            slot.release();
        }
    }

    /// Empties every slot. Must only be called with exclusive access.
    pub(crate) fn clear(&self, guard: &Guard) {
        for segment in &self.segments {
            for slot in segment.slots.iter() {
                let entry = slot.entry.swap(Shared::null(), Ordering::AcqRel, guard);
                if !entry.is_null() {
                    // SAFETY: The entry is unlinked; readers are protected by
                    // their guards.
                    unsafe { guard.defer_destroy(entry) };
                }
                slot.hop_info.store(0, Ordering::Release);
                slot.timestamp.fetch_add(1, Ordering::Release);
                slot.release();
            }
        }
    }

    /// Returns the next stored entry at or after `cursor`, advancing it past
    /// the returned slot.
    pub(crate) fn next_entry<'g>(
        &'g self,
        cursor: &mut Cursor,
        guard: &'g Guard,
    ) -> Option<&'g Entry<K, V>> {
        while let Some(segment) = self.segments.get(cursor.segment) {
            while let Some(slot) = segment.slots.get(cursor.slot) {
                cursor.slot += 1;
                // SAFETY: See `Segment::scan_hop_info`.
                if let Some(entry) = unsafe { slot.entry.load(Ordering::Acquire, guard).as_ref() } {
                    return Some(entry);
                }
            }
            cursor.segment += 1;
            cursor.slot = 0;
        }

        None
    }

    /// Frees every stored entry.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no other thread can reach this table or
    /// any of its entries.
    pub(crate) unsafe fn drop_entries(&self) {
        // SAFETY: Exclusive access is guaranteed by the caller.
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            for segment in &self.segments {
                for slot in segment.slots.iter() {
                    let entry = slot.entry.swap(Shared::null(), Ordering::Relaxed, guard);
                    if !entry.is_null() {
                        drop(entry.into_owned());
                    }
                }
            }
        }
    }
}

/// Debug statistics for table analysis.
#[cfg(any(test, feature = "stats"))]
#[derive(Debug, Clone)]
pub struct DebugStats {
    /// Number of entries found by walking every slot
    pub populated: usize,
    /// Number of segments
    pub segments: usize,
    /// Number of slots per segment
    pub segment_len: usize,
    /// Total number of slots allocated
    pub total_slots: usize,
    /// Number of entries not stored in their home slot
    pub displaced: usize,
    /// Largest distance between an entry and its home
    pub max_distance: usize,
    /// Slot utilization (populated / total_slots)
    pub load_factor: f64,
}

#[cfg(any(test, feature = "stats"))]
impl DebugStats {
    /// Pretty-print the debug statistics.
    pub fn print(&self) {
        println!("=== Concurrent Hopscotch Table Statistics ===");
        println!(
            "Segments: {} x {} slots ({} total)",
            self.segments, self.segment_len, self.total_slots
        );
        println!(
            "Population: {}/{} ({:.2}% load factor)",
            self.populated,
            self.total_slots,
            self.load_factor * 100.0
        );
        println!(
            "Displaced: {} entries (max distance {})",
            self.displaced, self.max_distance
        );
    }
}

#[cfg(any(test, feature = "stats"))]
impl<K, V> SegmentTable<K, V> {
    /// Counts entries by their distance from their home slot. Index `i`
    /// holds the number of entries stored `i` slots after their home.
    pub(crate) fn probe_histogram(&self, guard: &Guard) -> Vec<usize> {
        let mut histogram = vec![0usize; HOP_RANGE];
        for segment in &self.segments {
            for (offset, slot) in segment.slots.iter().enumerate() {
                // SAFETY: See `Segment::scan_hop_info`.
                if let Some(entry) = unsafe { slot.entry.load(Ordering::Acquire, guard).as_ref() } {
                    let home = (entry.hash & self.bucket_mask) as usize;
                    if let Some(bin) = offset.checked_sub(home).and_then(|d| histogram.get_mut(d)) {
                        *bin += 1;
                    }
                }
            }
        }
        histogram
    }

    pub(crate) fn debug_stats(&self, guard: &Guard) -> DebugStats {
        let histogram = self.probe_histogram(guard);
        let populated = histogram.iter().sum::<usize>();
        let total_slots: usize = self.segments.iter().map(|segment| segment.slots.len()).sum();

        DebugStats {
            populated,
            segments: self.segments.len(),
            segment_len: self.segment_len(),
            total_slots,
            displaced: populated - histogram[0],
            max_distance: histogram.iter().rposition(|&count| count > 0).unwrap_or(0),
            load_factor: populated as f64 / total_slots as f64,
        }
    }

    /// Checks the neighborhood invariants of every slot: each stored entry
    /// sits in the segment its hash selects, within `HOP_RANGE` of its home,
    /// and is claimed by exactly one home bitmap, namely its own; every bitmap
    /// bit names a stored entry.
    pub(crate) fn validate(&self, guard: &Guard) -> crate::Result<()> {
        use crate::error::Error;

        for (index, segment) in self.segments.iter().enumerate() {
            let segment_len = self.segment_len();
            for (offset, slot) in segment.slots.iter().enumerate() {
                let hop_info = slot.hop_info.load(Ordering::Acquire);
                let mut mask = hop_info;
                while mask != 0 {
                    let bit = mask.trailing_zeros() as usize;
                    mask &= mask - 1;
                    let occupied = segment
                        .slots
                        .get(offset + bit)
                        .is_some_and(|target| !target.entry.load(Ordering::Acquire, guard).is_null());
                    if !occupied {
                        return Err(Error::InternalInvariantViolation(
                            "neighborhood bitmap points at an empty slot",
                        ));
                    }
                }

                // SAFETY: See `Segment::scan_hop_info`.
                let Some(entry) = (unsafe { slot.entry.load(Ordering::Acquire, guard).as_ref() }) else {
                    continue;
                };
                if !slot.occupied.load(Ordering::Acquire) {
                    return Err(Error::InternalInvariantViolation(
                        "stored entry in an unclaimed slot",
                    ));
                }
                if ((entry.hash >> self.segment_shift) & self.segment_mask) as usize != index {
                    return Err(Error::InternalInvariantViolation(
                        "entry stored in the wrong segment",
                    ));
                }

                let home = (entry.hash & self.bucket_mask) as usize;
                if home > offset || offset - home >= HOP_RANGE || home >= segment_len {
                    return Err(Error::InternalInvariantViolation(
                        "entry outside its home neighborhood",
                    ));
                }

                let owners: Vec<usize> = (offset.saturating_sub(HOP_RANGE - 1)..=offset)
                    .filter(|&candidate| {
                        segment.slots[candidate].hop_info.load(Ordering::Acquire)
                            & (1 << (offset - candidate))
                            != 0
                    })
                    .collect();
                if owners != [home] {
                    return Err(Error::InternalInvariantViolation(
                        "entry not owned by exactly its home bitmap",
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use core::hash::Hasher;

    use crossbeam_epoch as epoch;
    use rand::TryRngCore;
    use rand::rngs::OsRng;
    use siphasher::sip::SipHasher;

    use super::*;
    use crate::spread::spread_u64;

    struct HashState {
        k0: u64,
        k1: u64,
    }

    impl HashState {
        fn new() -> Self {
            let mut rng = OsRng;
            Self {
                k0: rng.try_next_u64().unwrap(),
                k1: rng.try_next_u64().unwrap(),
            }
        }

        fn hash(&self, key: u64) -> u32 {
            let mut h = SipHasher::new_with_keys(self.k0, self.k1);
            h.write_u64(key);
            spread_u64(h.finish())
        }
    }

    /// Stores `value` when absent, leaves an existing entry untouched.
    struct Put {
        key: u64,
        value: u64,
    }

    impl Upsert<u64, u64> for Put {
        fn key(&self) -> &u64 {
            &self.key
        }

        fn vacant(self) -> (u64, u64) {
            (self.key, self.value)
        }

        fn occupied(self, _current: &u64) -> Option<u64> {
            None
        }
    }

    /// Overwrites any existing value.
    struct Set {
        key: u64,
        value: u64,
    }

    impl Upsert<u64, u64> for Set {
        fn key(&self) -> &u64 {
            &self.key
        }

        fn vacant(self) -> (u64, u64) {
            (self.key, self.value)
        }

        fn occupied(self, _current: &u64) -> Option<u64> {
            Some(self.value)
        }
    }

    fn put(table: &SegmentTable<u64, u64>, hash: u32, key: u64, value: u64) -> bool {
        let guard = epoch::pin();
        match table.upsert(hash, Put { key, value }, &guard) {
            Upserted::Done(Outcome::Added(stored)) => {
                assert_eq!(*stored, value);
                true
            }
            Upserted::Done(Outcome::Occupied { .. }) => panic!("{key} already present"),
            Upserted::Full(_) => false,
        }
    }

    fn find(table: &SegmentTable<u64, u64>, hash: u32, key: u64) -> Option<u64> {
        let guard = epoch::pin();
        table
            .find(hash, |&k| k == key, &guard)
            .map(|entry| *entry.value(&guard))
    }

    fn drop_table(table: SegmentTable<u64, u64>) {
        // SAFETY: Tests own their tables outright.
        unsafe { table.drop_entries() };
    }

    #[test]
    fn insert_and_find() {
        let state = HashState::new();
        let table = SegmentTable::new(128);
        for k in 0..48u64 {
            assert!(put(&table, state.hash(k), k, k * 2));
            assert_eq!(find(&table, state.hash(k), k), Some(k * 2));
        }
        for k in 0..48u64 {
            assert_eq!(find(&table, state.hash(k), k), Some(k * 2));
        }
        assert_eq!(find(&table, state.hash(999), 999), None);

        let guard = epoch::pin();
        assert!(table.validate(&guard).is_ok());
        assert_eq!(table.debug_stats(&guard).populated, 48);
        drop(guard);
        drop_table(table);
    }

    #[test]
    fn occupied_keeps_or_replaces_value() {
        let table = SegmentTable::new(32);
        assert!(put(&table, 5, 1, 10));

        let guard = epoch::pin();
        match table.upsert(5, Put { key: 1, value: 20 }, &guard) {
            Upserted::Done(Outcome::Occupied { previous, current }) => {
                assert_eq!((*previous, *current), (10, 10));
            }
            _ => panic!("expected occupied"),
        }
        match table.upsert(5, Set { key: 1, value: 30 }, &guard) {
            Upserted::Done(Outcome::Occupied { previous, current }) => {
                assert_eq!((*previous, *current), (10, 30));
            }
            _ => panic!("expected occupied"),
        }
        drop(guard);

        assert_eq!(find(&table, 5, 1), Some(30));
        drop_table(table);
    }

    #[test]
    fn remove_items() {
        let state = HashState::new();
        let table = SegmentTable::new(64);
        for k in 0..8u64 {
            assert!(put(&table, state.hash(k), k, k));
        }

        let guard = epoch::pin();
        for k in [0u64, 3, 7] {
            assert_eq!(table.remove(state.hash(k), |&x| x == k, &guard), Some(&k));
        }
        assert_eq!(table.remove(state.hash(1000), |&x| x == 1000, &guard), None);
        assert_eq!(table.remove(state.hash(3), |&x| x == 3, &guard), None);
        assert!(table.validate(&guard).is_ok());
        assert_eq!(table.debug_stats(&guard).populated, 5);
        drop(guard);

        for k in [1u64, 2, 4, 5, 6] {
            assert_eq!(find(&table, state.hash(k), k), Some(k));
        }
        drop_table(table);
    }

    #[test]
    fn removed_slot_is_reused() {
        let table = SegmentTable::new(32);
        for k in 0..32u64 {
            assert!(put(&table, 0, k, k));
        }
        assert!(!put(&table, 0, 32, 32));

        let guard = epoch::pin();
        assert_eq!(table.remove(0, |&k| k == 17, &guard), Some(&17));
        drop(guard);

        assert!(put(&table, 0, 32, 32));
        assert_eq!(find(&table, 0, 32), Some(32));
        drop_table(table);
    }

    #[test]
    fn explicit_collision_fills_neighborhood() {
        let table = SegmentTable::new(128);
        for k in 0..HOP_RANGE as u64 {
            assert!(put(&table, 0, k, k));
        }
        // Every slot of home 0's neighborhood now belongs to home 0, so nothing
        // can be displaced out of the way.
        assert!(!put(&table, 0, 100, 100));
        for k in 0..HOP_RANGE as u64 {
            assert_eq!(find(&table, 0, k), Some(k));
        }

        let guard = epoch::pin();
        assert!(table.validate(&guard).is_ok());
        // The failed insert must not leave a claimed slot behind.
        assert!(table.segments[0].slots[HOP_RANGE..].iter().all(|slot| !slot.occupied.load(Ordering::Relaxed)));
        drop(guard);
        drop_table(table);
    }

    #[test]
    fn last_home_spills_into_trailing_slots() {
        let table = SegmentTable::new(32);
        assert_eq!(table.segments[0].slots.len(), 32 + ADD_RANGE - 1);
        for k in 0..HOP_RANGE as u64 {
            assert!(put(&table, 31, k, k));
        }
        assert!(!put(&table, 31, 100, 100));
        for k in 0..HOP_RANGE as u64 {
            assert_eq!(find(&table, 31, k), Some(k));
        }

        let guard = epoch::pin();
        assert!(table.validate(&guard).is_ok());
        assert_eq!(table.segments[0].slots[31].hop_info.load(Ordering::Relaxed), u32::MAX);
        let histogram = table.probe_histogram(&guard);
        assert!(histogram.iter().all(|&count| count == 1));
        drop(guard);
        drop_table(table);
    }

    #[test]
    fn panicking_value_factory_releases_claim() {
        struct Explode(u64);

        impl Upsert<u64, u64> for Explode {
            fn key(&self) -> &u64 {
                &self.0
            }

            fn vacant(self) -> (u64, u64) {
                panic!("value factory failed")
            }

            fn occupied(self, _current: &u64) -> Option<u64> {
                None
            }
        }

        let table = SegmentTable::new(128);
        for home in 0..64u32 {
            assert!(put(&table, home, home as u64, home as u64));
        }
        // Home 100 claims its own slot. Home 1 claims slot 64 and displaces
        // it back to slot 2 before the factory runs.
        for hash in [100, 1] {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let guard = epoch::pin();
                let _ = table.upsert(hash, Explode(1000), &guard);
            }));
            assert!(result.is_err());
        }

        let guard = epoch::pin();
        assert!(table.validate(&guard).is_ok());
        let claimed = table.segments[0]
            .slots
            .iter()
            .filter(|slot| slot.occupied.load(Ordering::Relaxed))
            .count();
        assert_eq!(claimed, 64);
        assert!(!table.segments[0].slots[2].occupied.load(Ordering::Relaxed));
        drop(guard);

        assert!(put(&table, 1, 1000, 1000));
        assert!(put(&table, 100, 1001, 1001));
        assert_eq!(find(&table, 1, 1000), Some(1000));
        assert_eq!(find(&table, 100, 1001), Some(1001));
        for home in 0..64u32 {
            assert_eq!(find(&table, home, home as u64), Some(home as u64));
        }
        drop_table(table);
    }

    #[test]
    fn window_scan_ignores_the_bitmap() {
        let table = SegmentTable::new(32);
        assert!(put(&table, 6, 1, 10));
        assert!(put(&table, 6, 2, 20));
        let segment = &table.segments[0];
        // Simulate a reader racing a displacement: the entry at slot 7 is in
        // place but its bit is not visible yet.
        segment.slots[6].hop_info.fetch_and(!(1 << 1), Ordering::Relaxed);

        let guard = epoch::pin();
        assert!(segment.scan_hop_info(6, 0b1, 6, |&k| k == 2, &guard).is_none());
        let entry = segment.scan_window(6, 6, |&k| k == 2, &guard);
        assert_eq!(entry.map(|e| *e.value(&guard)), Some(20));
        assert!(segment.scan_window(6, 6, |&k| k == 3, &guard).is_none());
        assert!(segment.scan_window(6, 7, |&k| k == 2, &guard).is_none());

        segment.slots[6].hop_info.fetch_or(1 << 1, Ordering::Relaxed);
        drop(guard);
        drop_table(table);
    }

    #[test]
    fn displacement_chain() {
        let table = SegmentTable::new(128);
        // One entry per home in 0..64, each in its home slot.
        for home in 0..64u32 {
            assert!(put(&table, home, home as u64, home as u64));
        }

        // Home 1's first free slot is 64; two moves bring it back to 2.
        assert!(put(&table, 1, 1000, 1000));
        assert_eq!(find(&table, 1, 1000), Some(1000));
        for home in 0..64u32 {
            assert_eq!(find(&table, home, home as u64), Some(home as u64));
        }

        let guard = epoch::pin();
        assert!(table.validate(&guard).is_ok());
        let stats = table.debug_stats(&guard);
        assert_eq!(stats.populated, 65);
        assert_eq!(stats.displaced, 3);
        let histogram = table.probe_histogram(&guard);
        assert_eq!(histogram[0], 62);
        assert_eq!(histogram[1], 1);
        assert_eq!(histogram[HOP_RANGE - 1], 2);
        assert!(table.segments[0].slots[1].timestamp.load(Ordering::Relaxed) == 0);
        assert!(table.segments[0].slots[2].timestamp.load(Ordering::Relaxed) > 0);
        assert!(table.segments[0].slots[33].timestamp.load(Ordering::Relaxed) > 0);
        drop(guard);
        drop_table(table);
    }

    #[test]
    fn compare_exchange_requires_expected_value() {
        let table = SegmentTable::new(32);
        assert!(put(&table, 3, 7, 70));

        let guard = epoch::pin();
        assert!(!table.compare_exchange(3, |&k| k == 7, &71, 80, &guard));
        assert!(table.compare_exchange(3, |&k| k == 7, &70, 80, &guard));
        assert!(!table.compare_exchange(3, |&k| k == 8, &80, 90, &guard));
        drop(guard);

        assert_eq!(find(&table, 3, 7), Some(80));
        drop_table(table);
    }

    #[test]
    fn grow_moves_upper_half_to_mirror() {
        let table = SegmentTable::new(32);
        // With 32-slot segments the segment index starts at bit 5.
        let low: Vec<u32> = (0..10).map(|i| i * 3).collect();
        let high: Vec<u32> = (0..10).map(|i| (i * 3) | (1 << 5)).collect();
        for (k, &hash) in low.iter().chain(&high).enumerate() {
            assert!(put(&table, hash, k as u64, k as u64));
        }

        let guard = epoch::pin();
        let (grown, relocations) = table.grow(&guard);
        assert_eq!(grown.segment_count(), 2);
        assert_eq!(relocations.len(), high.len());

        // Before retiring, both directories resolve every key.
        for (k, &hash) in low.iter().chain(&high).enumerate() {
            assert!(table.find(hash, |&x| x == k as u64, &guard).is_some());
            assert!(grown.find(hash, |&x| x == k as u64, &guard).is_some());
        }

        grown.retire_relocated(&relocations);
        assert!(grown.validate(&guard).is_ok());
        for (k, &hash) in low.iter().chain(&high).enumerate() {
            let entry = grown.find(hash, |&x| x == k as u64, &guard);
            assert_eq!(entry.map(|e| *e.value(&guard)), Some(k as u64));
        }
        let stats = grown.debug_stats(&guard);
        assert_eq!(stats.populated, 20);
        assert_eq!(stats.total_slots, 2 * (32 + ADD_RANGE - 1));
        drop(guard);

        drop_table(grown);
    }

    #[test]
    fn clear_empties_every_slot() {
        let state = HashState::new();
        let table = SegmentTable::new(64);
        for k in 0..20u64 {
            assert!(put(&table, state.hash(k), k, k));
        }

        let guard = epoch::pin();
        table.clear(&guard);
        assert!(table.validate(&guard).is_ok());
        assert_eq!(table.debug_stats(&guard).populated, 0);
        drop(guard);

        for k in 0..20u64 {
            assert_eq!(find(&table, state.hash(k), k), None);
        }
        assert!(put(&table, state.hash(3), 3, 33));
        assert_eq!(find(&table, state.hash(3), 3), Some(33));
        drop_table(table);
    }

    #[test]
    fn cursor_visits_every_entry_once() {
        let table = SegmentTable::new(32);
        // Two keys per home, spaced out so every insert fits.
        for k in 0..25u64 {
            assert!(put(&table, (k / 2 * 2) as u32, k, k));
        }

        let guard = epoch::pin();
        let mut cursor = Cursor::default();
        let mut seen = Vec::new();
        while let Some(entry) = table.next_entry(&mut cursor, &guard) {
            seen.push(entry.key);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..25).collect::<Vec<_>>());
        assert!(table.next_entry(&mut cursor, &guard).is_none());
        drop(guard);
        drop_table(table);
    }

    #[test]
    fn validate_reports_broken_bitmap() {
        let table = SegmentTable::new(32);
        assert!(put(&table, 4, 1, 1));
        table.segments[0].slots[4].hop_info.fetch_or(1 << 3, Ordering::Relaxed);

        let guard = epoch::pin();
        assert_eq!(
            table.validate(&guard),
            Err(crate::Error::InternalInvariantViolation(
                "neighborhood bitmap points at an empty slot"
            ))
        );
        drop(guard);
        drop_table(table);
    }
}
