//! array utilities

use alloc::{vec, vec::Vec};
use core::fmt;

/// simple bitset, acts sorta like an array but you access single bits
///
/// the size is fixed at creation; out of range accesses are ignored rather
/// than panicking since callers index with externally provided addresses
pub struct BitSet {
    /// the words backing the set
    words: Vec<u32>,

    /// amount of bits we can set
    size: usize,

    /// amount of bits we have set
    bits_used: usize,
}

impl BitSet {
    /// create a bitset with every bit clear
    pub fn new(size: usize) -> Self {
        Self {
            words: vec![0; size.div_ceil(32)],
            size,
            bits_used: 0,
        }
    }

    /// set a bit in the set
    pub fn set(&mut self, addr: usize) {
        if addr >= self.size {
            return;
        }

        let idx = addr / 32;
        let off = addr % 32;

        if (self.words[idx] & 1 << off) == 0 {
            // if bit is unset, increment bits_used and set bit
            self.bits_used += 1;
            self.words[idx] |= 1 << off;
        }
    }

    /// clear a bit in the set
    pub fn clear(&mut self, addr: usize) {
        if addr >= self.size {
            return;
        }

        let idx = addr / 32;
        let off = addr % 32;

        if (self.words[idx] & 1 << off) > 0 {
            // if bit is set, decrement bits_used and clear bit
            self.bits_used -= 1;
            self.words[idx] &= !(1 << off);
        }
    }

    /// set every bit in the set, faster than calling set() in a loop
    pub fn set_all(&mut self) {
        for word in self.words.iter_mut() {
            *word = 0xffffffff;
        }
        self.bits_used = self.size;
    }

    /// clear every bit in the set
    pub fn clear_all(&mut self) {
        for word in self.words.iter_mut() {
            *word = 0;
        }
        self.bits_used = 0;
    }

    /// check if bit is set
    pub fn test(&self, addr: usize) -> bool {
        if addr < self.size {
            let idx = addr / 32;
            let off = addr % 32;
            (self.words[idx] & 1 << off) > 0
        } else {
            false
        }
    }

    /// gets the first unset bit at or after `start`, wrapping around to the
    /// beginning of the set before giving up
    pub fn first_unset_from(&self, start: usize) -> Option<usize> {
        if self.bits_used >= self.size {
            return None;
        }

        let start = if start >= self.size { 0 } else { start };

        for i in (start..self.size).chain(0..start) {
            if !self.test(i) {
                return Some(i);
            }
        }

        None
    }

    /// gets first unset bit
    pub fn first_unset(&self) -> Option<usize> {
        self.first_unset_from(0)
    }

    /// amount of bits this set holds
    pub fn size(&self) -> usize {
        self.size
    }

    /// amount of bits currently set
    pub fn bits_used(&self) -> usize {
        self.bits_used
    }
}

impl fmt::Debug for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "BitSet {{ {}/{} set }}", self.bits_used, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::BitSet;

    #[test]
    fn set_clear_test() {
        let mut set = BitSet::new(100);
        assert_eq!(set.bits_used(), 0);

        set.set(0);
        set.set(31);
        set.set(32);
        set.set(99);
        assert_eq!(set.bits_used(), 4);
        assert!(set.test(0));
        assert!(set.test(31));
        assert!(set.test(32));
        assert!(set.test(99));
        assert!(!set.test(1));

        // setting twice doesn't double count
        set.set(0);
        assert_eq!(set.bits_used(), 4);

        set.clear(31);
        assert_eq!(set.bits_used(), 3);
        assert!(!set.test(31));

        // clearing a clear bit is a no-op
        set.clear(31);
        assert_eq!(set.bits_used(), 3);
    }

    #[test]
    fn out_of_range_is_ignored() {
        let mut set = BitSet::new(10);
        set.set(10);
        set.set(usize::MAX);
        assert_eq!(set.bits_used(), 0);
        assert!(!set.test(10));
    }

    #[test]
    fn set_all_clear_all() {
        let mut set = BitSet::new(65);
        set.set_all();
        assert_eq!(set.bits_used(), 65);
        assert!(set.first_unset().is_none());

        set.clear_all();
        assert_eq!(set.bits_used(), 0);
        assert_eq!(set.first_unset(), Some(0));
    }

    #[test]
    fn first_unset_wraps() {
        let mut set = BitSet::new(8);
        set.set_all();
        set.clear(2);

        assert_eq!(set.first_unset_from(0), Some(2));
        assert_eq!(set.first_unset_from(2), Some(2));
        // searching past the hole wraps around to find it
        assert_eq!(set.first_unset_from(5), Some(2));
        // out of range hints restart from the beginning
        assert_eq!(set.first_unset_from(100), Some(2));
    }
}
