//! Typed layout of the per-state satellite bits.
//!
//! Every bucket word of the store reserves its low [`SAT_BITS`] bits for
//! bookkeeping owned by the algorithms. The layout from least to most
//! significant bit:
//!
//! ```text
//!  0 .. wip_bits                   wip counter (LNDFS only, else empty)
//!  wip_bits .. wip_bits + COLORS   one bit per global color
//!  remaining                       unused
//! ```

use crate::core::errors::{CheckError, Result};

/// Bits per bucket word available for satellite data
pub const SAT_BITS: u32 = 16;

/// Number of global colors with a reserved bit
pub const GLOBAL_COLORS: u32 = 3;

/// A contiguous bit field inside the satellite bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SatField {
    pub offset: u32,
    pub width: u32,
}

impl SatField {
    pub const fn new(offset: u32, width: u32) -> Self {
        Self { offset, width }
    }

    /// Largest value the field can hold
    pub const fn max(&self) -> u64 {
        (1u64 << self.width) - 1
    }

    /// Field mask positioned within the word
    pub const fn mask(&self) -> u64 {
        self.max() << self.offset
    }

    #[inline]
    pub fn extract(&self, word: u64) -> u64 {
        (word >> self.offset) & self.max()
    }

    #[inline]
    pub fn insert(&self, word: u64, value: u64) -> u64 {
        (word & !self.mask()) | ((value & self.max()) << self.offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SatLayout {
    pub wip: SatField,
    pub colors: SatField,
}

impl SatLayout {
    pub fn new(wip_bits: u32) -> Result<Self> {
        if wip_bits + GLOBAL_COLORS > SAT_BITS {
            return Err(CheckError::configuration_field(
                format!("satellite bits exhausted, {} available", SAT_BITS),
                "wip_bits",
                wip_bits,
            ));
        }
        Ok(Self {
            wip: SatField::new(0, wip_bits),
            colors: SatField::new(wip_bits, GLOBAL_COLORS),
        })
    }

    /// Absolute bit index of global color number `color`
    #[inline]
    pub fn color_bit(&self, color: u32) -> u32 {
        debug_assert!(color < GLOBAL_COLORS);
        self.colors.offset + color
    }
}

impl Default for SatLayout {
    fn default() -> Self {
        Self {
            wip: SatField::new(0, 0),
            colors: SatField::new(0, GLOBAL_COLORS),
        }
    }
}
