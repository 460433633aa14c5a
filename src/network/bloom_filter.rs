use super::BloomFilterData;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BloomFilterError {
    #[error("Invalid padding: {0}")]
    InvalidPadding(u8),

    #[error("Invalid hash count: {0}")]
    InvalidHashCount(u32),

    #[error("Invalid padding when bitmap length is 0: {0}")]
    InvalidPaddingForEmptyBitmap(u8),
}

/// Bloom filter sent by the backend with an existence filter.
///
/// A member is hashed with blake3; the first 16 digest bytes form two
/// little-endian u64 values `h1` and `h2`, and bit `i` of `hash_count` is
/// `(h1 + i * h2) mod bit_count` with wrapping 64-bit arithmetic. Bit `n`
/// lives in byte `n / 8` at position `n % 8`, least significant first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(
        bitmap: Vec<u8>,
        padding: u8,
        hash_count: u32,
    ) -> Result<Self, BloomFilterError> {
        if padding >= 8 {
            return Err(BloomFilterError::InvalidPadding(padding));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(BloomFilterError::InvalidPaddingForEmptyBitmap(padding));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(BloomFilterError::InvalidHashCount(hash_count));
        }
        let bit_count = bitmap.len() as u64 * 8 - padding as u64;
        Ok(Self {
            bitmap,
            hash_count,
            bit_count,
        })
    }

    pub fn from_data(data: &BloomFilterData) -> Result<Self, BloomFilterError> {
        Self::new(data.bitmap.clone(), data.padding, data.hash_count)
    }

    /// Empty filter of `bit_count` bits, for building one locally.
    pub fn with_size(
        bit_count: u64,
        hash_count: u32,
    ) -> Self {
        let bytes = bit_count.div_ceil(8) as usize;
        Self {
            bitmap: vec![0; bytes],
            hash_count,
            bit_count,
        }
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn might_contain(
        &self,
        value: &str,
    ) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        self.bit_indexes(value).all(|index| self.is_bit_set(index))
    }

    pub fn insert(
        &mut self,
        value: &str,
    ) {
        if self.bit_count == 0 {
            return;
        }
        let indexes: Vec<u64> = self.bit_indexes(value).collect();
        for index in indexes {
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    pub fn to_data(&self) -> BloomFilterData {
        let padding = (self.bitmap.len() as u64 * 8 - self.bit_count) as u8;
        BloomFilterData {
            bitmap: self.bitmap.clone(),
            padding,
            hash_count: self.hash_count,
        }
    }

    fn bit_indexes<'a>(
        &'a self,
        value: &str,
    ) -> impl Iterator<Item = u64> + 'a {
        let digest = blake3::hash(value.as_bytes());
        let bytes = digest.as_bytes();
        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        first.copy_from_slice(&bytes[0..8]);
        second.copy_from_slice(&bytes[8..16]);
        let h1 = u64::from_le_bytes(first);
        let h2 = u64::from_le_bytes(second);
        (0..self.hash_count as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.bit_count)
    }

    fn is_bit_set(
        &self,
        index: u64,
    ) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }
}
