//! Bit mixing applied to every key hash before it is split into a segment
//! index and a home offset.
//!
//! Weak `Hash` implementations (identity hashes of small integers, for
//! example) tend to produce values that only differ in a handful of bits.
//! Without mixing, such keys would pile up in the same few neighborhoods and
//! force the table to grow long before it is full.

/// Mixes a 32-bit hash so that both the low (home offset) and the high
/// (segment index) bits depend on every input bit.
///
/// This is a variant of the single-word Wang/Jenkins integer hash. It is
/// deterministic and stateless.
///
/// # Examples
///
/// ```rust
/// use concurrent_hopscotch::spread::spread;
///
/// assert_eq!(spread(42), spread(42));
/// assert_ne!(spread(1) & 0xFF, spread(2) & 0xFF);
/// ```
#[inline]
pub fn spread(hash: u32) -> u32 {
    let mut h = hash;
    h = h.wrapping_add((h << 15) ^ 0xffff_cd7d);
    h ^= h >> 10;
    h = h.wrapping_add(h << 3);
    h ^= h >> 6;
    h = h.wrapping_add((h << 2).wrapping_add(h << 14));
    h ^ (h >> 16)
}

/// Folds a 64-bit hasher output into 32 bits and spreads it.
///
/// This is the hash every table operation works with.
#[inline]
pub fn spread_u64(hash: u64) -> u32 {
    spread((hash ^ (hash >> 32)) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        for raw in [0u32, 1, 7, 0xdead_beef, u32::MAX] {
            assert_eq!(spread(raw), spread(raw));
        }
    }

    #[test]
    fn fold_matches_spread_of_low_word() {
        for raw in [0u64, 1, 96, 0xffff_ffff] {
            assert_eq!(spread_u64(raw), spread(raw as u32));
        }
        assert_eq!(spread_u64(1 << 32), spread(1));
    }

    #[test]
    fn sequential_keys_cover_low_bits() {
        // Sequential integers must not collapse onto a few home offsets.
        let mut seen = [false; 128];
        for raw in 0..4096u32 {
            seen[(spread(raw) & 127) as usize] = true;
        }
        assert!(seen.iter().filter(|&&s| s).count() > 120);
    }

    #[test]
    fn sequential_keys_cover_high_bits() {
        let mut seen = [false; 64];
        for raw in 0..4096u32 {
            seen[(spread(raw) >> 26) as usize] = true;
        }
        assert!(seen.iter().filter(|&&s| s).count() > 56);
    }
}
