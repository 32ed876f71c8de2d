//! Bit vector indexed by page number

/// Fixed-size bitmap over the 1-based range `1..=size`.
#[derive(Clone, Debug, Default)]
pub struct BitVec {
    bits: Vec<u8>,
    size: u32,
}

impl BitVec {
    pub fn new(size: u32) -> Self {
        let byte_len = (size as usize + 8) / 8;
        Self {
            bits: vec![0; byte_len],
            size,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// True if bit `i` is set. Out-of-range indices read as clear.
    pub fn test(&self, i: u32) -> bool {
        if i == 0 || i > self.size {
            return false;
        }
        let i = i as usize;
        (self.bits[i / 8] & (1u8 << (i % 8))) != 0
    }

    /// Set bit `i`. Returns false if `i` is outside `1..=size`.
    pub fn set(&mut self, i: u32) -> bool {
        if i == 0 || i > self.size {
            return false;
        }
        let i = i as usize;
        self.bits[i / 8] |= 1u8 << (i % 8);
        true
    }
}
