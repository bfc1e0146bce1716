//! Bitmap data structure helper, used as vote sets keyed by node ID.

use std::fmt;

use crate::ordering::NodeId;
use crate::utils::MiradorError;

use fixedbitset::FixedBitSet;

/// Compact bitmap for NodeId -> bool mapping.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates a new bitmap of given size. If `ones` is true, all slots are
    /// marked true initially; otherwise, all slots are initially false.
    pub fn new(size: usize, ones: bool) -> Self {
        let mut bitset = FixedBitSet::with_capacity(size);

        if ones {
            bitset.set_range(.., true);
        }

        Bitmap(bitset)
    }

    /// Creates a new bitmap of given size from vec literal. Indices in the
    /// vec are bits to be set as true.
    pub fn from(size: usize, ones: Vec<NodeId>) -> Result<Self, MiradorError> {
        let mut bitmap = Self::new(size, false);
        for idx in ones {
            bitmap.set(idx, true)?;
        }
        Ok(bitmap)
    }

    /// Sets bit at index to given flag.
    #[inline]
    pub fn set(&mut self, idx: NodeId, flag: bool) -> Result<(), MiradorError> {
        if idx as usize >= self.0.len() {
            return Err(MiradorError::msg(format!(
                "node {} out of bound {}",
                idx,
                self.0.len()
            )));
        }
        self.0.set(idx as usize, flag);
        Ok(())
    }

    /// Sets bit at index to true. Returns false if it was already set, so
    /// callers can deduplicate repeated votes from one source.
    #[inline]
    pub fn insert(&mut self, idx: NodeId) -> Result<bool, MiradorError> {
        let was_set = self.get(idx)?;
        if !was_set {
            self.0.insert(idx as usize);
        }
        Ok(!was_set)
    }

    /// Gets the bit flag at index.
    #[inline]
    pub fn get(&self, idx: NodeId) -> Result<bool, MiradorError> {
        if idx as usize >= self.0.len() {
            return Err(MiradorError::msg(format!(
                "node {} out of bound {}",
                idx,
                self.0.len()
            )));
        }
        Ok(self.0[idx as usize])
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.len()
    }

    /// Returns the number of trues in the bitmap.
    #[inline]
    pub fn count(&self) -> usize {
        self.0.count_ones(..)
    }

    /// Allows `for id in map.ones()`, in ascending order.
    #[inline]
    pub fn ones(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.0.ones().map(|i| i as NodeId)
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; [", self.size())?;
        let mut first_idx = true;
        for i in self.ones() {
            if !first_idx {
                write!(f, ", {}", i)?;
            } else {
                write!(f, "{}", i)?;
                first_idx = false;
            }
        }
        write!(f, "]}}")
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;

    #[test]
    fn bitmap_set_get() {
        let mut map = Bitmap::new(7, false);
        assert!(map.set(0, true).is_ok());
        assert!(map.set(1, false).is_ok());
        assert!(map.set(2, true).is_ok());
        assert!(map.set(7, true).is_err());
        assert_eq!(map.get(0), Ok(true));
        assert_eq!(map.get(1), Ok(false));
        assert_eq!(map.get(2), Ok(true));
        assert_eq!(map.get(3), Ok(false));
        assert!(map.get(7).is_err());
    }

    #[test]
    fn bitmap_insert_dedup() -> Result<(), MiradorError> {
        let mut map = Bitmap::new(4, false);
        assert!(map.insert(3)?);
        assert!(!map.insert(3)?);
        assert!(map.insert(0)?);
        assert_eq!(map.count(), 2);
        assert!(map.insert(4).is_err());
        Ok(())
    }

    #[test]
    fn bitmap_ones_and_debug() -> Result<(), MiradorError> {
        let map = Bitmap::from(5, vec![4, 1, 3])?;
        assert_eq!(map.ones().collect::<Vec<_>>(), vec![1, 3, 4]);
        assert_eq!(format!("{:?}", map), "{5; [1, 3, 4]}");
        assert_eq!(Bitmap::new(3, true).count(), 3);
        Ok(())
    }
}
