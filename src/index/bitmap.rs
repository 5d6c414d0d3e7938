//! Word bitmaps over record slots
//!
//! Every stored record occupies a slot. Each value of a dimension (a type,
//! a subType, a device id, a weekday) owns a bitmap where bit N is set when
//! the record in slot N carries that value. Filters compose by AND / OR /
//! AND-NOT over these bitmaps.
//!
//! # Performance
//!
//! - Single value lookup: O(1)
//! - Multi-value AND/OR: O(n) where n is bitmap size in words
//! - Memory: ~1 bit per slot per dimension value
//!
//! # Example
//!
//! ```rust
//! use diabetes_data_engine::index::bitmap::{DimensionIndex, SlotBitmap};
//!
//! let mut by_type: DimensionIndex<String> = DimensionIndex::new();
//! by_type.add("basal".to_string(), 0);
//! by_type.add("bolus".to_string(), 1);
//! by_type.add("basal".to_string(), 2);
//!
//! let basals = by_type.get(&"basal".to_string());
//! assert_eq!(basals.iter().collect::<Vec<_>>(), vec![0, 2]);
//!
//! let mut live = SlotBitmap::new();
//! live.set(2);
//! assert_eq!(basals.and(&live).cardinality(), 1);
//! ```

use std::collections::HashMap;
use std::hash::Hash;

/// Position of a record in the index's slot table
pub type Slot = usize;

// ============================================================================
// Slot Bitmap
// ============================================================================

/// A simple bitmap for tracking slot membership
///
/// Uses a vector of u64 words, where each bit represents one slot. Slots
/// are reused after removal, so ids stay dense.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotBitmap {
    /// Bitmap words (64 bits each)
    words: Vec<u64>,

    /// Number of bits set (cached for fast cardinality)
    cardinality: usize,
}

impl SlotBitmap {
    /// Create an empty bitmap
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bitmap with pre-allocated capacity for N slots
    pub fn with_capacity(num_slots: usize) -> Self {
        Self {
            words: vec![0; num_slots.div_ceil(64)],
            cardinality: 0,
        }
    }

    /// Build from an iterator of slots
    pub fn from_slots<I: IntoIterator<Item = Slot>>(slots: I) -> Self {
        let mut bitmap = Self::new();
        for slot in slots {
            bitmap.set(slot);
        }
        bitmap
    }

    /// Set a bit
    pub fn set(&mut self, slot: Slot) {
        let word_idx = slot / 64;
        if word_idx >= self.words.len() {
            self.words.resize(word_idx + 1, 0);
        }

        let mask = 1u64 << (slot % 64);
        if self.words[word_idx] & mask == 0 {
            self.words[word_idx] |= mask;
            self.cardinality += 1;
        }
    }

    /// Clear a bit
    pub fn clear(&mut self, slot: Slot) {
        let word_idx = slot / 64;
        if let Some(word) = self.words.get_mut(word_idx) {
            let mask = 1u64 << (slot % 64);
            if *word & mask != 0 {
                *word &= !mask;
                self.cardinality -= 1;
            }
        }
    }

    /// Check if a bit is set
    pub fn contains(&self, slot: Slot) -> bool {
        self.words
            .get(slot / 64)
            .is_some_and(|word| word & (1u64 << (slot % 64)) != 0)
    }

    /// Get the number of bits set
    pub fn cardinality(&self) -> usize {
        self.cardinality
    }

    /// Check if bitmap is empty
    pub fn is_empty(&self) -> bool {
        self.cardinality == 0
    }

    /// Bitwise AND with another bitmap (intersection)
    pub fn and(&self, other: &SlotBitmap) -> SlotBitmap {
        let words: Vec<u64> = self
            .words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| a & b)
            .collect();
        Self::from_words(words)
    }

    /// Bitwise OR with another bitmap (union)
    pub fn or(&self, other: &SlotBitmap) -> SlotBitmap {
        let len = self.words.len().max(other.words.len());
        let words: Vec<u64> = (0..len)
            .map(|i| {
                self.words.get(i).copied().unwrap_or(0) | other.words.get(i).copied().unwrap_or(0)
            })
            .collect();
        Self::from_words(words)
    }

    /// Bitwise AND-NOT (difference: self AND NOT other)
    pub fn and_not(&self, other: &SlotBitmap) -> SlotBitmap {
        let words: Vec<u64> = self
            .words
            .iter()
            .enumerate()
            .map(|(i, w)| w & !other.words.get(i).copied().unwrap_or(0))
            .collect();
        Self::from_words(words)
    }

    fn from_words(words: Vec<u64>) -> SlotBitmap {
        let cardinality = words.iter().map(|w| w.count_ones() as usize).sum();
        SlotBitmap { words, cardinality }
    }

    /// Iterate over all set bits in ascending slot order
    pub fn iter(&self) -> BitmapIterator<'_> {
        BitmapIterator {
            words: &self.words,
            word_idx: 0,
            current: self.words.first().copied().unwrap_or(0),
        }
    }
}

/// Iterator over set bits in a bitmap
pub struct BitmapIterator<'a> {
    words: &'a [u64],
    word_idx: usize,
    current: u64,
}

impl Iterator for BitmapIterator<'_> {
    type Item = Slot;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current != 0 {
                let bit = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1;
                return Some(self.word_idx * 64 + bit);
            }
            self.word_idx += 1;
            self.current = *self.words.get(self.word_idx)?;
        }
    }
}

// ============================================================================
// Dimension Index
// ============================================================================

/// One bitmap per distinct value of a dimension
#[derive(Debug, Clone)]
pub struct DimensionIndex<K: Eq + Hash> {
    bitmaps: HashMap<K, SlotBitmap>,
    empty: SlotBitmap,
}

impl<K: Eq + Hash> DimensionIndex<K> {
    /// Create an empty dimension
    pub fn new() -> Self {
        Self {
            bitmaps: HashMap::new(),
            empty: SlotBitmap::new(),
        }
    }

    /// Mark `slot` as having `key`
    pub fn add(&mut self, key: K, slot: Slot) {
        self.bitmaps.entry(key).or_default().set(slot);
    }

    /// Unmark `slot`; drops the value once no slot has it
    pub fn remove(&mut self, key: &K, slot: Slot) {
        if let Some(bitmap) = self.bitmaps.get_mut(key) {
            bitmap.clear(slot);
            if bitmap.is_empty() {
                self.bitmaps.remove(key);
            }
        }
    }

    /// Slots having `key` (empty when none)
    pub fn get(&self, key: &K) -> &SlotBitmap {
        self.bitmaps.get(key).unwrap_or(&self.empty)
    }

    /// Union over several keys
    pub fn union<'k, I>(&self, keys: I) -> SlotBitmap
    where
        I: IntoIterator<Item = &'k K>,
        K: 'k,
    {
        keys.into_iter()
            .fold(SlotBitmap::new(), |acc, key| acc.or(self.get(key)))
    }

    /// Distinct values currently present
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.bitmaps.keys()
    }

    /// Number of distinct values
    pub fn len(&self) -> usize {
        self.bitmaps.len()
    }

    /// True when no value is present
    pub fn is_empty(&self) -> bool {
        self.bitmaps.is_empty()
    }
}

impl<K: Eq + Hash> Default for DimensionIndex<K> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_basic() {
        let mut bitmap = SlotBitmap::new();

        bitmap.set(1);
        bitmap.set(5);
        bitmap.set(100);
        bitmap.set(100);

        assert!(bitmap.contains(1));
        assert!(bitmap.contains(100));
        assert!(!bitmap.contains(2));
        assert!(!bitmap.contains(5000));
        assert_eq!(bitmap.cardinality(), 3);
    }

    #[test]
    fn test_bitmap_clear() {
        let mut bitmap = SlotBitmap::with_capacity(128);
        bitmap.set(1);
        bitmap.set(5);
        bitmap.clear(1);
        bitmap.clear(1);
        bitmap.clear(9999);
        assert!(!bitmap.contains(1));
        assert_eq!(bitmap.cardinality(), 1);
    }

    #[test]
    fn test_bitmap_set_operations() {
        let a = SlotBitmap::from_slots([1, 2, 3, 70]);
        let b = SlotBitmap::from_slots([2, 3, 4]);

        assert_eq!(a.and(&b).iter().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(a.or(&b).iter().collect::<Vec<_>>(), vec![1, 2, 3, 4, 70]);
        assert_eq!(a.and_not(&b).iter().collect::<Vec<_>>(), vec![1, 70]);
        assert_eq!(a.and_not(&b).cardinality(), 2);
    }

    #[test]
    fn test_bitmap_iterator_spans_words() {
        let bitmap = SlotBitmap::from_slots([0, 63, 64, 200]);
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![0, 63, 64, 200]);
        assert_eq!(SlotBitmap::new().iter().count(), 0);
    }

    #[test]
    fn test_dimension_add_remove() {
        let mut dim: DimensionIndex<&str> = DimensionIndex::new();
        dim.add("pump", 0);
        dim.add("cgm", 1);
        dim.add("pump", 2);
        assert_eq!(dim.len(), 2);
        assert_eq!(dim.union(&["pump", "cgm"]).cardinality(), 3);

        dim.remove(&"cgm", 1);
        assert_eq!(dim.len(), 1);
        assert!(dim.get(&"cgm").is_empty());
    }
}
