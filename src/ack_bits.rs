use super::Error;

/// Largest supported window, in bytes.
pub const WIDTH_BYTES_MAX: usize = 8;

/// A fixed-width window of acknowledgement bits stored in a single integer.
///
/// Bit 0 is the least significant bit of the backing integer. Bits at or above the configured
/// width are always zero.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AckBitArray {
    width_bytes: u8,
    value: u64,
}

fn mask(width_bits: usize) -> u64 {
    if width_bits >= 64 {
        u64::MAX
    } else {
        (1u64 << width_bits) - 1
    }
}

impl AckBitArray {
    /// Creates a window `width_bytes` bytes wide. Any bits of `value` beyond the width are
    /// discarded.
    ///
    /// Panics if `width_bytes` is zero or greater than 8.
    pub fn new(width_bytes: usize, value: u64) -> Self {
        assert!(
            width_bytes > 0 && width_bytes <= WIDTH_BYTES_MAX,
            "invalid ack window width: {} bytes",
            width_bytes
        );

        Self {
            width_bytes: width_bytes as u8,
            value: value & mask(width_bytes * 8),
        }
    }

    pub fn width_bytes(&self) -> usize {
        usize::from(self.width_bytes)
    }

    pub fn width_bits(&self) -> usize {
        usize::from(self.width_bytes) * 8
    }

    pub fn to_u64(&self) -> u64 {
        self.value
    }

    pub fn count_ones(&self) -> u32 {
        self.value.count_ones()
    }

    fn check_index(&self, index: usize) -> Result<(), Error> {
        if index < self.width_bits() {
            Ok(())
        } else {
            Err(Error::IndexOutOfRange {
                index,
                width: self.width_bits(),
            })
        }
    }

    /// Returns bit `index`, or an error if the index lies outside the window.
    pub fn try_get(&self, index: usize) -> Result<bool, Error> {
        self.check_index(index)?;
        Ok(self.value & (1u64 << index) != 0)
    }

    /// Assigns bit `index`, or returns an error if the index lies outside the window.
    pub fn try_set(&mut self, index: usize, bit: bool) -> Result<(), Error> {
        self.check_index(index)?;

        if bit {
            self.value |= 1u64 << index;
        } else {
            self.value &= !(1u64 << index);
        }

        Ok(())
    }

    /// Returns bit `index`.
    ///
    /// Panics if `index >= self.width_bits()`.
    pub fn get(&self, index: usize) -> bool {
        match self.try_get(index) {
            Ok(bit) => bit,
            Err(err) => panic!("{}", err),
        }
    }

    /// Assigns bit `index`.
    ///
    /// Panics if `index >= self.width_bits()`.
    pub fn set(&mut self, index: usize, bit: bool) {
        if let Err(err) = self.try_set(index, bit) {
            panic!("{}", err);
        }
    }

    /// Shifts the window towards the most significant bit by `n` places. Returns the bits which
    /// left the window, most significant first.
    pub fn shift_left(&mut self, n: usize) -> Vec<bool> {
        let width = self.width_bits();
        let count = n.min(width);

        let dropped = (0..count).map(|i| self.get(width - 1 - i)).collect();

        self.value = if n >= width {
            0
        } else {
            (self.value << n) & mask(width)
        };

        dropped
    }

    /// Shifts the window towards the least significant bit by `n` places. Returns the bits which
    /// left the window, least significant first.
    pub fn shift_right(&mut self, n: usize) -> Vec<bool> {
        let width = self.width_bits();
        let count = n.min(width);

        let dropped = (0..count).map(|i| self.get(i)).collect();

        self.value = if n >= width { 0 } else { self.value >> n };

        dropped
    }
}

impl From<AckBitArray> for u64 {
    fn from(bits: AckBitArray) -> u64 {
        bits.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_bits() {
        let a = AckBitArray::new(2, 0x7E18);

        let expected = [
            false, false, false, true, true, false, false, false, false, true, true, true, true,
            true, true, false,
        ];

        for (idx, &bit) in expected.iter().enumerate() {
            assert_eq!(a.get(idx), bit, "bit {}", idx);
        }
    }

    #[test]
    fn set_bits() {
        let mut a = AckBitArray::new(2, 0xFF00);

        a.set(3, true);
        a.set(4, true);
        a.set(5, true);
        a.set(8, false);
        a.set(15, false);

        assert_eq!(a.to_u64(), 0x7E38);
        assert_eq!(a, AckBitArray::new(2, 0x7E38));
    }

    #[test]
    fn shift_left() {
        let mut a = AckBitArray::new(2, 0xFA74);

        let dropped = a.shift_left(4);

        assert_eq!(a.to_u64(), 0xA740);
        assert_eq!(dropped, vec![true, true, true, true]);
    }

    #[test]
    fn shift_right() {
        let mut a = AckBitArray::new(2, 0xFA74);

        let dropped = a.shift_right(4);

        assert_eq!(a.to_u64(), 0x0FA7);
        assert_eq!(dropped, vec![false, false, true, false]);
    }

    #[test]
    fn shift_past_width() {
        let mut a = AckBitArray::new(1, 0x81);
        assert_eq!(a.shift_left(100).len(), 8);
        assert_eq!(a.to_u64(), 0);

        let mut b = AckBitArray::new(8, u64::MAX);
        assert_eq!(b.shift_right(64).iter().filter(|&&bit| bit).count(), 64);
        assert_eq!(b.to_u64(), 0);
    }

    #[test]
    fn value_masked_to_width() {
        let a = AckBitArray::new(1, 0xABCD);
        assert_eq!(a.to_u64(), 0xCD);
        assert_ne!(a, AckBitArray::new(2, 0xCD));
    }

    #[test]
    fn index_out_of_range() {
        let mut a = AckBitArray::new(2, 0);

        assert_eq!(
            a.try_get(16),
            Err(Error::IndexOutOfRange {
                index: 16,
                width: 16
            })
        );
        assert!(a.try_set(16, true).is_err());
        assert_eq!(a.to_u64(), 0);
    }

    #[test]
    #[should_panic]
    fn get_out_of_range_panics() {
        AckBitArray::new(1, 0).get(8);
    }
}
