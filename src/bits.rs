use alloy_primitives::{B256, U256};
use serde::{Deserialize, Serialize};

pub type Bit = bool;

#[derive(
    Copy, Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct Bits {
    /// The number of bits in this sequence.
    pub count: usize,
    /// A packed encoding of these bits. Only the first (least significant)
    /// `count` bits are used. The rest are unused and should be zero.
    pub packed: U256,
}

impl From<U256> for Bits {
    fn from(packed: U256) -> Self {
        Bits { count: 256, packed }
    }
}

impl From<B256> for Bits {
    fn from(packed: B256) -> Self {
        Bits {
            count: 256,
            packed: U256::from_be_bytes(packed.0),
        }
    }
}

impl Bits {
    pub const fn empty() -> Self {
        Bits {
            count: 0,
            packed: U256::ZERO,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Removes and returns the most recently pushed bit.
    pub fn pop_next_bit(&mut self) -> Bit {
        assert!(!self.is_empty(), "Cannot pop from empty bits");
        let bit = self.packed.bit(0);
        self.packed >>= 1;
        self.count -= 1;
        bit
    }

    /// The `i`-th bit in push order.
    pub fn get_bit(&self, i: usize) -> Bit {
        assert!(i < self.count, "Index out of bounds");
        self.packed.bit(self.count - 1 - i)
    }

    pub fn push_bit(&mut self, bit: Bit) {
        self.packed = (self.packed << 1) | U256::from(bit as u64);
        self.count += 1;
    }

    pub fn add_bit(&self, bit: Bit) -> Self {
        let mut x = *self;
        x.push_bit(bit);
        x
    }

    /// Whether `prefix` is a prefix of this sequence, in push order.
    pub fn starts_with(&self, prefix: &Bits) -> bool {
        prefix.count <= self.count && self.packed >> (self.count - prefix.count) == prefix.packed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_order() {
        let mut bits = Bits::empty();
        bits.push_bit(true);
        bits.push_bit(false);
        bits.push_bit(true);
        assert_eq!(bits.count, 3);
        assert!(bits.get_bit(0));
        assert!(!bits.get_bit(1));
        assert!(bits.get_bit(2));
        assert!(bits.pop_next_bit());
        assert!(!bits.pop_next_bit());
        assert!(bits.pop_next_bit());
        assert!(bits.is_empty());
    }

    #[test]
    fn test_starts_with() {
        let mut path = Bits::empty();
        path.push_bit(false);
        path.push_bit(true);
        path.push_bit(true);

        let mut prefix = Bits::empty();
        assert!(path.starts_with(&prefix));
        prefix.push_bit(false);
        assert!(path.starts_with(&prefix));
        prefix.push_bit(true);
        assert!(path.starts_with(&prefix));
        assert!(!prefix.starts_with(&path));

        let other = Bits::empty().add_bit(true);
        assert!(!path.starts_with(&other));
        assert!(path.starts_with(&path));
    }
}
