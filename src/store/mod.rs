//! Lock-free, fixed-capacity state store.
//!
//! An open-addressed table of 64-bit bucket words plus a parallel array of
//! state vectors. A bucket word packs, from the top:
//!
//! ```text
//!  63 .. 17   hash memo (bit 63 always set, so occupied words are non-zero)
//!  16         DONE: the vector copy is published
//!  15 .. 0    satellite bits, see [`satellite`]
//! ```
//!
//! Claiming a bucket is a single CAS from `EMPTY` to the memo. The winner
//! copies the vector and then sets DONE with release ordering; racing
//! readers with a matching memo wait for DONE and compare full contents.
//! Probing stays inside one cache line of buckets before jumping to another
//! line, which keeps most lookups on a single line.

pub mod satellite;

use crate::core::atomics::{update, Update, CACHE_LINE_SIZE};
use crate::core::config::{HashKind, StoreConfig};
use crate::core::errors::{CheckError, Result};
use crossbeam::utils::Backoff;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use tracing::{debug, error};
use xxhash_rust::xxh3::Xxh3;

pub use satellite::{SatField, SatLayout, GLOBAL_COLORS, SAT_BITS};

/// Dense handle of a stored state vector
pub type Ref = usize;

const EMPTY: u64 = 0;
const DONE: u64 = 1 << SAT_BITS;
const MEMO_MASK: u64 = !((DONE << 1) - 1);
const OCCUPIED: u64 = 1 << 63;
const SAT_MASK: u64 = DONE - 1;

const BUCKETS_PER_LINE: usize = CACHE_LINE_SIZE / std::mem::size_of::<u64>();
const LINE_SHIFT: u32 = BUCKETS_PER_LINE.trailing_zeros();
const REHASH_PRIME: u64 = 4_294_967_291;
const MAX_THRESHOLD: usize = 1 << 16;

pub struct StateStore {
    width: usize,
    size: usize,
    mask: usize,
    threshold: usize,
    hash: HashKind,
    seed: u64,
    layout: SatLayout,
    buckets: Box<[AtomicU64]>,
    data: Box<[AtomicI32]>,
}

/// Allocate `len` elements without aborting the process when memory runs out
fn try_alloc<T>(len: usize, init: impl Fn() -> T) -> Result<Box<[T]>> {
    let mut items = Vec::new();
    items.try_reserve_exact(len).map_err(|err| {
        CheckError::store_full(0, len as u64).with_details(format!("cannot allocate the table: {}", err))
    })?;
    items.extend((0..len).map(|_| init()));
    Ok(items.into_boxed_slice())
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("width", &self.width)
            .field("capacity", &self.size)
            .field("threshold", &self.threshold)
            .field("hash", &self.hash)
            .field("layout", &self.layout)
            .finish()
    }
}

impl StateStore {
    /// Allocate a table for `1 << config.log2_capacity` vectors of `width` integers.
    pub fn new(width: usize, config: &StoreConfig, layout: SatLayout) -> Result<Self> {
        if width == 0 {
            return Err(CheckError::configuration_field(
                "state vectors must have at least one slot",
                "width",
                width,
            ));
        }
        if !(4..=40).contains(&config.log2_capacity) {
            return Err(CheckError::configuration_field(
                "log2_capacity must be between 4 and 40",
                "store.log2_capacity",
                config.log2_capacity,
            ));
        }
        let size = 1usize << config.log2_capacity;
        let threshold = (size / 100).max(size.min(1024)).min(MAX_THRESHOLD);
        let slots = size
            .checked_mul(width)
            .filter(|&n| {
                n.checked_mul(std::mem::size_of::<AtomicI32>())
                    .map_or(false, |bytes| bytes <= isize::MAX as usize)
            })
            .ok_or_else(|| {
                CheckError::store_full(0, size as u64)
                    .with_details(format!("{} vectors of width {} exceed the address space", size, width))
            })?;
        let buckets = try_alloc(size, || AtomicU64::new(EMPTY))?;
        let data = try_alloc(slots, || AtomicI32::new(0))?;
        debug!(
            capacity = size,
            width,
            threshold,
            hash = ?config.hash,
            "State store allocated"
        );
        Ok(Self {
            width,
            size,
            mask: size - 1,
            threshold,
            hash: config.hash,
            seed: config.seed,
            layout,
            buckets,
            data,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn layout(&self) -> &SatLayout {
        &self.layout
    }

    /// Number of occupied buckets. Scans the table.
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .filter(|b| b.load(Ordering::Relaxed) != EMPTY)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hash_vector(&self, state: &[i32]) -> u64 {
        match self.hash {
            HashKind::Xxh3 => {
                let mut hasher = Xxh3::with_seed(self.seed);
                for value in state {
                    hasher.update(&value.to_le_bytes());
                }
                hasher.digest()
            }
            HashKind::Fx => {
                let mut hasher = FxHasher::default();
                self.seed.hash(&mut hasher);
                state.hash(&mut hasher);
                fmix64(hasher.finish())
            }
        }
    }

    /// Find the reference of `state`, inserting it when absent.
    ///
    /// Returns `(ref, true)` only for the single caller whose insertion
    /// created the entry.
    pub fn insert_or_find(&self, state: &[i32]) -> Result<(Ref, bool)> {
        let hash = self.hash_vector(state);
        self.find_or_put(state, hash)
    }

    fn find_or_put(&self, state: &[i32], hash: u64) -> Result<(Ref, bool)> {
        if state.len() != self.width {
            return Err(CheckError::internal(format!(
                "state vector has {} slots, store expects {}",
                state.len(),
                self.width
            )));
        }
        let memo = (hash & MEMO_MASK) | OCCUPIED;
        let mut h = hash;
        let mut probes = 0;
        loop {
            let line = (h as usize) & self.mask & !(BUCKETS_PER_LINE - 1);
            let start = (h as usize) & (BUCKETS_PER_LINE - 1);
            for i in 0..BUCKETS_PER_LINE {
                let idx = line | ((start + i) & (BUCKETS_PER_LINE - 1));
                let bucket = &self.buckets[idx];
                let mut word = bucket.load(Ordering::Acquire);
                if word == EMPTY {
                    match bucket.compare_exchange(EMPTY, memo, Ordering::AcqRel, Ordering::Acquire) {
                        Ok(_) => {
                            self.write_vector(idx, state);
                            bucket.fetch_or(DONE, Ordering::Release);
                            return Ok((idx, true));
                        }
                        Err(actual) => word = actual,
                    }
                }
                if word & MEMO_MASK == memo {
                    let word = self.wait_done(bucket, word);
                    debug_assert!(word & DONE != 0);
                    if self.vector_equals(idx, state) {
                        return Ok((idx, false));
                    }
                }
                probes += 1;
                if probes >= self.threshold {
                    let occupied = self.len();
                    error!(
                        occupied,
                        capacity = self.size,
                        state = ?state,
                        "State store full"
                    );
                    return Err(CheckError::store_full(occupied as u64, self.size as u64)
                        .with_details(format!("gave up after {} probes", probes)));
                }
            }
            h = h.wrapping_add(REHASH_PRIME << LINE_SHIFT);
        }
    }

    #[inline]
    fn wait_done(&self, bucket: &AtomicU64, mut word: u64) -> u64 {
        let backoff = Backoff::new();
        while word & DONE == 0 {
            backoff.snooze();
            word = bucket.load(Ordering::Acquire);
        }
        word
    }

    fn write_vector(&self, idx: Ref, state: &[i32]) {
        let base = idx * self.width;
        for (slot, value) in self.data[base..base + self.width].iter().zip(state) {
            slot.store(*value, Ordering::Relaxed);
        }
    }

    fn vector_equals(&self, idx: Ref, state: &[i32]) -> bool {
        let base = idx * self.width;
        self.data[base..base + self.width]
            .iter()
            .zip(state)
            .all(|(slot, value)| slot.load(Ordering::Relaxed) == *value)
    }

    /// Copy the vector behind `r` into `out`
    pub fn get_into(&self, r: Ref, out: &mut [i32]) {
        debug_assert!(self.is_published(r), "read of unpublished ref {}", r);
        let base = r * self.width;
        for (dst, slot) in out.iter_mut().zip(&self.data[base..base + self.width]) {
            *dst = slot.load(Ordering::Relaxed);
        }
    }

    pub fn get(&self, r: Ref) -> Vec<i32> {
        let mut out = vec![0; self.width];
        self.get_into(r, &mut out);
        out
    }

    pub fn is_published(&self, r: Ref) -> bool {
        self.buckets
            .get(r)
            .map(|b| b.load(Ordering::Acquire) & DONE != 0)
            .unwrap_or(false)
    }

    /// References of every published state, in bucket order
    pub fn published(&self) -> impl Iterator<Item = Ref> + '_ {
        (0..self.capacity()).filter(move |&r| self.is_published(r))
    }

    // Satellite accessors. All of them operate on published buckets only.

    #[inline]
    fn sat_word(&self, r: Ref) -> &AtomicU64 {
        &self.buckets[r]
    }

    pub fn get_sat_bits(&self, r: Ref, field: SatField) -> u64 {
        field.extract(self.sat_word(r).load(Ordering::Acquire))
    }

    #[inline]
    pub fn get_sat_bit(&self, r: Ref, bit: u32) -> bool {
        debug_assert!(bit < SAT_BITS);
        self.sat_word(r).load(Ordering::Acquire) & (1 << bit) != 0
    }

    /// Set `bit`; `true` only for the call that changed it
    pub fn try_set_sat_bit(&self, r: Ref, bit: u32) -> bool {
        debug_assert!(bit < SAT_BITS);
        let mask = 1u64 << bit;
        update(self.sat_word(r), |w| if w & mask != 0 { None } else { Some(w | mask) }).applied()
    }

    /// Clear `bit`; `true` only for the call that changed it
    pub fn unset_sat_bit(&self, r: Ref, bit: u32) -> bool {
        debug_assert!(bit < SAT_BITS);
        let mask = 1u64 << bit;
        update(self.sat_word(r), |w| if w & mask == 0 { None } else { Some(w & !mask) }).applied()
    }

    /// Replace `field` by `new` if it currently holds `expected`
    pub fn try_set_sat_bits(&self, r: Ref, field: SatField, expected: u64, new: u64) -> bool {
        debug_assert!(field.offset + field.width <= SAT_BITS);
        update(self.sat_word(r), |w| {
            (field.extract(w) == expected).then(|| field.insert(w, new))
        })
        .applied()
    }

    /// Increment the counter in `field`, saturating at its maximum.
    /// Returns the value after the call.
    pub fn inc_sat_bits(&self, r: Ref, field: SatField) -> u64 {
        let res = update(self.sat_word(r), |w| {
            let v = field.extract(w);
            (v < field.max()).then(|| field.insert(w, v + 1))
        });
        match res {
            Update::Applied { new, .. } => field.extract(new),
            Update::Declined { current } => field.extract(current),
        }
    }

    /// Decrement the counter in `field`. A counter already at zero means
    /// some worker released more than it acquired.
    pub fn dec_sat_bits(&self, r: Ref, field: SatField) -> Result<u64> {
        let res = update(self.sat_word(r), |w| {
            let v = field.extract(w);
            (v > 0).then(|| field.insert(w, v - 1))
        });
        match res {
            Update::Applied { new, .. } => Ok(field.extract(new)),
            Update::Declined { .. } => Err(CheckError::protocol_at(
                "satellite counter decremented below zero",
                r,
            )),
        }
    }

    /// Raw satellite bits of `r`, for diagnostics
    pub fn sat_snapshot(&self, r: Ref) -> u64 {
        self.sat_word(r).load(Ordering::Acquire) & SAT_MASK
    }
}

/// MurmurHash3 finalizer; spreads Fx output over the low bits used for indexing
#[inline]
fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^ (k >> 33)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::thread;

    fn small_store(width: usize, log2: u32, hash: HashKind) -> StateStore {
        let config = StoreConfig {
            log2_capacity: log2,
            hash,
            seed: 42,
        };
        StateStore::new(width, &config, SatLayout::new(2).unwrap()).unwrap()
    }

    #[test]
    fn test_insert_then_find() {
        let store = small_store(3, 10, HashKind::Xxh3);
        let (a, new_a) = store.insert_or_find(&[1, 2, 3]).unwrap();
        let (b, new_b) = store.insert_or_find(&[3, 2, 1]).unwrap();
        let (c, new_c) = store.insert_or_find(&[1, 2, 3]).unwrap();
        assert!(new_a && new_b && !new_c);
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(store.get(a), vec![1, 2, 3]);
        assert_eq!(store.get(b), vec![3, 2, 1]);
        assert_eq!(store.len(), 2);
        let mut published: Vec<Ref> = store.published().collect();
        published.sort_unstable();
        let mut expected = vec![a, b];
        expected.sort_unstable();
        assert_eq!(published, expected);
    }

    #[test]
    fn test_colliding_hashes_are_not_merged() {
        let store = small_store(2, 8, HashKind::Fx);
        let (a, _) = store.find_or_put(&[1, 1], 0xDEAD_BEEF).unwrap();
        let (b, new_b) = store.find_or_put(&[2, 2], 0xDEAD_BEEF).unwrap();
        assert!(new_b);
        assert_ne!(a, b);
        assert_eq!(store.find_or_put(&[2, 2], 0xDEAD_BEEF).unwrap(), (b, false));
    }

    #[test]
    fn test_oversized_table_is_a_capacity_error() {
        let config = StoreConfig {
            log2_capacity: 40,
            hash: HashKind::Xxh3,
            seed: 42,
        };
        let err = StateStore::new(1 << 24, &config, SatLayout::default()).unwrap_err();
        assert_eq!(err.category(), "capacity");
        match err {
            CheckError::StoreFull { occupied, details, .. } => {
                assert_eq!(occupied, 0);
                assert!(details.unwrap_or_default().contains("address space"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_full_table_is_a_capacity_error() {
        let store = small_store(1, 4, HashKind::Xxh3);
        for i in 0..16 {
            store.insert_or_find(&[i]).unwrap();
        }
        let err = store.insert_or_find(&[99]).unwrap_err();
        match err {
            CheckError::StoreFull { occupied, capacity, .. } => {
                assert_eq!(occupied, 16);
                assert_eq!(capacity, 16);
            }
            other => panic!("unexpected error {other}"),
        }
        // lookups of present states still succeed
        assert_eq!(store.insert_or_find(&[3]).unwrap().1, false);
    }

    #[test]
    fn test_wrong_width_rejected() {
        let store = small_store(2, 6, HashKind::Xxh3);
        assert!(store.insert_or_find(&[1]).is_err());
    }

    #[test]
    fn test_concurrent_inserts_agree_on_ref() {
        let store = Arc::new(small_store(2, 14, HashKind::Xxh3));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    let mut refs = Vec::new();
                    let mut created = 0;
                    for i in 0..2000 {
                        let (r, new) = store.insert_or_find(&[i, i * 7]).unwrap();
                        refs.push(r);
                        created += new as usize;
                    }
                    (refs, created)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let total_created: usize = results.iter().map(|(_, c)| c).sum();
        assert_eq!(total_created, 2000);
        for (refs, _) in &results[1..] {
            assert_eq!(refs, &results[0].0);
        }
    }

    #[test]
    fn test_sat_bit_single_winner() {
        let store = Arc::new(small_store(1, 8, HashKind::Xxh3));
        let (r, _) = store.insert_or_find(&[5]).unwrap();
        let bit = store.layout().color_bit(0);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || store.try_set_sat_bit(r, bit))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(store.get_sat_bit(r, bit));
        assert!(store.unset_sat_bit(r, bit));
        assert!(!store.get_sat_bit(r, bit));
    }

    #[test]
    fn test_sat_counter_saturates_and_rejects_underflow() {
        let store = small_store(1, 8, HashKind::Xxh3);
        let (r, _) = store.insert_or_find(&[5]).unwrap();
        let field = store.layout().wip;
        assert_eq!(store.inc_sat_bits(r, field), 1);
        assert_eq!(store.inc_sat_bits(r, field), 2);
        assert_eq!(store.inc_sat_bits(r, field), 3);
        assert_eq!(store.inc_sat_bits(r, field), 3);
        assert_eq!(store.dec_sat_bits(r, field).unwrap(), 2);
        store.dec_sat_bits(r, field).unwrap();
        store.dec_sat_bits(r, field).unwrap();
        let err = store.dec_sat_bits(r, field).unwrap_err();
        assert_eq!(err.category(), "protocol");
        // counter updates leave the vector intact
        assert_eq!(store.get(r), vec![5]);
    }

    #[test]
    fn test_try_set_sat_bits_is_conditional() {
        let store = small_store(1, 8, HashKind::Fx);
        let (r, _) = store.insert_or_find(&[1]).unwrap();
        let field = SatField::new(8, 2);
        assert!(store.try_set_sat_bits(r, field, 0, 2));
        assert!(!store.try_set_sat_bits(r, field, 0, 1));
        assert_eq!(store.get_sat_bits(r, field), 2);
        assert_eq!(store.sat_snapshot(r), 2 << 8);
    }
}
