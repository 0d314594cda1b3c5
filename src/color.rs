//! Local and global coloring used by the nested depth-first searches.
//!
//! Local colors are two bits per reference in a worker-private bit vector.
//! Global colors live in the store's satellite bits and only ever go from
//! unset to set. The wip counter shares the same word.

use crate::core::atomics::spin_until;
use crate::core::errors::{CheckError, Result};
use crate::store::{Ref, StateStore};

/// Per-worker DFS colors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LocalColor {
    White = 0,
    Cyan = 1,
    Blue = 2,
    Pink = 3,
}

impl From<u64> for LocalColor {
    fn from(value: u64) -> Self {
        match value & 0b11 {
            0 => LocalColor::White,
            1 => LocalColor::Cyan,
            2 => LocalColor::Blue,
            _ => LocalColor::Pink,
        }
    }
}

const REFS_PER_WORD: usize = 32;

/// Packed two-bit color per reference, owned by a single worker
#[derive(Debug, Clone)]
pub struct ColorMap {
    words: Vec<u64>,
}

impl ColorMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(REFS_PER_WORD)],
        }
    }

    #[inline]
    pub fn get(&self, r: Ref) -> LocalColor {
        let shift = (r % REFS_PER_WORD) * 2;
        LocalColor::from(self.words[r / REFS_PER_WORD] >> shift)
    }

    #[inline]
    pub fn set(&mut self, r: Ref, color: LocalColor) {
        let shift = (r % REFS_PER_WORD) * 2;
        let word = &mut self.words[r / REFS_PER_WORD];
        *word = (*word & !(0b11 << shift)) | ((color as u64) << shift);
    }

    #[inline]
    pub fn is(&self, r: Ref, color: LocalColor) -> bool {
        self.get(r) == color
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }
}

/// Colors shared by all workers through the store's satellite bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GlobalColor {
    Red = 0,
    Green = 1,
    Dangerous = 2,
}

/// Outcome of a [`GlobalColors::wait_seed`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedWait {
    /// The caller had to spin at least once
    pub waited: bool,
    /// The run was stopped before the counter drained
    pub interrupted: bool,
}

/// Global color and wip accessors over a shared store
#[derive(Clone, Copy)]
pub struct GlobalColors<'a> {
    store: &'a StateStore,
}

impl<'a> GlobalColors<'a> {
    pub fn new(store: &'a StateStore) -> Self {
        Self { store }
    }

    #[inline]
    pub fn has(&self, r: Ref, color: GlobalColor) -> bool {
        self.store
            .get_sat_bit(r, self.store.layout().color_bit(color as u32))
    }

    /// Atomic test-and-set; `true` for the unique call that set the color
    #[inline]
    pub fn try_color(&self, r: Ref, color: GlobalColor) -> bool {
        self.store
            .try_set_sat_bit(r, self.store.layout().color_bit(color as u32))
    }

    /// Set a color that must not have been set before
    pub fn color_once(&self, r: Ref, color: GlobalColor) -> Result<()> {
        if self.try_color(r, color) {
            Ok(())
        } else {
            Err(CheckError::protocol_at(
                format!("global color {:?} set twice", color),
                r,
            ))
        }
    }

    pub fn wip(&self, r: Ref) -> u64 {
        self.store.get_sat_bits(r, self.store.layout().wip)
    }

    /// Announce a sub-search seeded at `r`
    pub fn inc_wip(&self, r: Ref) -> Result<u64> {
        let field = self.store.layout().wip;
        if field.width == 0 {
            return Err(CheckError::protocol_at(
                "wip counter used without reserved satellite bits",
                r,
            ));
        }
        Ok(self.store.inc_sat_bits(r, field))
    }

    /// Retire a sub-search seeded at `r`
    pub fn dec_wip(&self, r: Ref) -> Result<u64> {
        self.store.dec_sat_bits(r, self.store.layout().wip)
    }

    /// Spin until no sub-search seeded at `seed` is in progress, or `stopped` fires
    pub fn wait_seed<S: FnMut() -> bool>(&self, seed: Ref, stopped: S) -> SeedWait {
        let (polls, drained) = spin_until(|| self.wip(seed) == 0, stopped);
        SeedWait {
            waited: polls > 0,
            interrupted: !drained,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StoreConfig;
    use crate::store::SatLayout;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn store(wip_bits: u32) -> StateStore {
        let config = StoreConfig {
            log2_capacity: 8,
            ..Default::default()
        };
        StateStore::new(1, &config, SatLayout::new(wip_bits).unwrap()).unwrap()
    }

    #[test]
    fn test_color_map_packs_neighbours_independently() {
        let mut map = ColorMap::new(100);
        map.set(31, LocalColor::Pink);
        map.set(32, LocalColor::Cyan);
        map.set(33, LocalColor::Blue);
        assert_eq!(map.get(30), LocalColor::White);
        assert_eq!(map.get(31), LocalColor::Pink);
        assert_eq!(map.get(32), LocalColor::Cyan);
        assert_eq!(map.get(33), LocalColor::Blue);
        map.set(32, LocalColor::White);
        assert!(map.is(33, LocalColor::Blue));
        map.clear();
        assert!(map.is(31, LocalColor::White));
    }

    #[test]
    fn test_global_colors_are_exactly_once() {
        let store = store(2);
        let (r, _) = store.insert_or_find(&[1]).unwrap();
        let colors = GlobalColors::new(&store);
        assert!(colors.try_color(r, GlobalColor::Green));
        assert!(!colors.try_color(r, GlobalColor::Green));
        assert!(!colors.has(r, GlobalColor::Red));
        colors.color_once(r, GlobalColor::Red).unwrap();
        assert!(colors.color_once(r, GlobalColor::Red).is_err());
        assert_eq!(colors.wip(r), 0);
    }

    #[test]
    fn test_wip_requires_reserved_bits() {
        let store = store(0);
        let (r, _) = store.insert_or_find(&[1]).unwrap();
        assert!(GlobalColors::new(&store).inc_wip(r).is_err());
    }

    #[test]
    fn test_wait_seed_returns_after_release() {
        let store = Arc::new(store(2));
        let (r, _) = store.insert_or_find(&[1]).unwrap();
        GlobalColors::new(&store).inc_wip(r).unwrap();
        let releaser = {
            let store = store.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                GlobalColors::new(&store).dec_wip(r).unwrap();
            })
        };
        let wait = GlobalColors::new(&store).wait_seed(r, || false);
        releaser.join().unwrap();
        assert!(wait.waited);
        assert!(!wait.interrupted);
    }

    #[test]
    fn test_wait_seed_observes_stop() {
        let store = store(2);
        let (r, _) = store.insert_or_find(&[1]).unwrap();
        let colors = GlobalColors::new(&store);
        colors.inc_wip(r).unwrap();
        let stop = AtomicBool::new(true);
        let wait = colors.wait_seed(r, || stop.load(Ordering::Relaxed));
        assert!(wait.interrupted);
    }
}
