//! Dense bit markers for block presence and block-map indexes.
//!
//! Two flavors live here:
//!
//! - [`Marker`]: an atomic one-bit-per-block presence marker shared between
//!   the fetch path and concurrent readers. Marking a block released-publishes
//!   the preceding write; checking acquires it, so a reader that observes the
//!   bit also observes the block bytes.
//! - [`BlockSet`]: a plain growable bitset with a predecessor query, used for
//!   header start-block indexes and diff metadata where no concurrency is
//!   involved.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: u64 = 64;

#[inline]
fn word_of(idx: u64) -> (usize, u64) {
    ((idx / WORD_BITS) as usize, 1u64 << (idx % WORD_BITS))
}

// ─────────────────────────────────────────────────────────────────────────────
// Marker — atomic presence tracking
// ─────────────────────────────────────────────────────────────────────────────

/// One atomic bit per block. Fixed length, set-only.
pub struct Marker {
    words: Box<[AtomicU64]>,
    bits: u64,
}

impl Marker {
    pub fn new(bits: u64) -> Self {
        let words = bits.div_ceil(WORD_BITS) as usize;
        let words = (0..words).map(|_| AtomicU64::new(0)).collect();
        Marker { words, bits }
    }

    /// Number of bits the marker tracks.
    pub fn len(&self) -> u64 {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Sets bit `idx`. Returns `true` when this call flipped the bit, i.e.
    /// the caller is the first writer of the block.
    pub fn mark(&self, idx: u64) -> bool {
        assert!(idx < self.bits, "marker index {idx} out of range");
        let (w, mask) = word_of(idx);
        let prev = self.words[w].fetch_or(mask, Ordering::Release);
        prev & mask == 0
    }

    pub fn is_marked(&self, idx: u64) -> bool {
        assert!(idx < self.bits, "marker index {idx} out of range");
        let (w, mask) = word_of(idx);
        self.words[w].load(Ordering::Acquire) & mask != 0
    }

    /// True only if every bit in `range` is set.
    pub fn all_marked(&self, range: Range<u64>) -> bool {
        range.into_iter().all(|idx| self.is_marked(idx))
    }

    /// Total number of set bits.
    pub fn marked_count(&self) -> u64 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as u64)
            .sum()
    }

    /// Copies the current bits into a plain [`BlockSet`]. Marks racing the
    /// snapshot may or may not be included.
    pub fn snapshot(&self) -> BlockSet {
        let mut set = BlockSet::new(self.bits);
        for (wi, word) in self.words.iter().enumerate() {
            set.words[wi] = word.load(Ordering::Acquire);
        }
        set
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// BlockSet — plain bitset with predecessor query
// ─────────────────────────────────────────────────────────────────────────────

/// Non-atomic bitset sized at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSet {
    words: Vec<u64>,
    bits: u64,
}

impl BlockSet {
    pub fn new(bits: u64) -> Self {
        BlockSet {
            words: vec![0; bits.div_ceil(WORD_BITS) as usize],
            bits,
        }
    }

    pub fn len(&self) -> u64 {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn set(&mut self, idx: u64) {
        assert!(idx < self.bits, "bitset index {idx} out of range");
        let (w, mask) = word_of(idx);
        self.words[w] |= mask;
    }

    pub fn get(&self, idx: u64) -> bool {
        assert!(idx < self.bits, "bitset index {idx} out of range");
        let (w, mask) = word_of(idx);
        self.words[w] & mask != 0
    }

    /// Greatest set bit ≤ `idx`, or `None` if no such bit exists.
    pub fn prev_set(&self, idx: u64) -> Option<u64> {
        if self.bits == 0 {
            return None;
        }
        let idx = idx.min(self.bits - 1);
        let (mut w, _) = word_of(idx);
        // Mask off bits above idx in its own word, then scan downward.
        let within = idx % WORD_BITS;
        let mut word = self.words[w] & (u64::MAX >> (WORD_BITS - 1 - within));
        loop {
            if word != 0 {
                let top = WORD_BITS - 1 - word.leading_zeros() as u64;
                return Some(w as u64 * WORD_BITS + top);
            }
            if w == 0 {
                return None;
            }
            w -= 1;
            word = self.words[w];
        }
    }

    /// Iterates set bit indices in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = u64> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(move |(wi, &word)| {
                let base = wi as u64 * WORD_BITS;
                BitIter { word, base }
            })
            .filter(move |&idx| idx < self.bits)
    }

    pub fn set_count(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }
}

struct BitIter {
    word: u64,
    base: u64,
}

impl Iterator for BitIter {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.word == 0 {
            return None;
        }
        let tz = self.word.trailing_zeros() as u64;
        self.word &= self.word - 1;
        Some(self.base + tz)
    }
}
