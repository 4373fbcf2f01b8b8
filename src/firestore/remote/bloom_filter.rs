use sha2::{Digest, Sha256};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Bloom filter as sent with an existence filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilterPayload {
    pub bitmap: Vec<u8>,
    /// Unused bits at the end of the last byte.
    pub padding: u8,
    pub hash_count: u32,
}

/// Probabilistic set of document names. `might_contain` has no false
/// negatives.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: u8, hash_count: u32) -> FirestoreResult<Self> {
        if padding > 7 {
            return Err(invalid_argument(format!("Invalid padding: {padding}")));
        }
        if bitmap.is_empty() {
            if padding != 0 || hash_count != 0 {
                return Err(invalid_argument(format!(
                    "Invalid padding and hash count when bitmap is empty: {padding}, {hash_count}"
                )));
            }
        } else if hash_count == 0 {
            return Err(invalid_argument("Invalid hash count: 0"));
        }
        let bit_count = bitmap.len() as u64 * 8 - u64::from(padding);
        Ok(Self {
            bitmap,
            hash_count,
            bit_count,
        })
    }

    pub fn from_payload(payload: &BloomFilterPayload) -> FirestoreResult<Self> {
        Self::new(payload.bitmap.clone(), payload.padding, payload.hash_count)
    }

    /// Builds a filter of `bit_count` bits holding `names`.
    pub fn with_names<'a>(
        names: impl IntoIterator<Item = &'a str>,
        bit_count: u64,
        hash_count: u32,
    ) -> FirestoreResult<Self> {
        if bit_count == 0 {
            return Self::new(Vec::new(), 0, 0);
        }
        let bytes = bit_count.div_ceil(8);
        let padding = (bytes * 8 - bit_count) as u8;
        let mut filter = Self::new(vec![0; bytes as usize], padding, hash_count)?;
        for name in names {
            filter.insert(name);
        }
        Ok(filter)
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn to_payload(&self) -> BloomFilterPayload {
        BloomFilterPayload {
            bitmap: self.bitmap.clone(),
            padding: (self.bitmap.len() as u64 * 8 - self.bit_count) as u8,
            hash_count: self.hash_count,
        }
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        self.bit_indexes(value)
            .all(|index| self.bitmap[(index / 8) as usize] & (1 << (index % 8)) != 0)
    }

    fn insert(&mut self, value: &str) {
        let indexes: Vec<u64> = self.bit_indexes(value).collect();
        for index in indexes {
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    /// Double hashing over the two little-endian halves of the digest prefix.
    fn bit_indexes(&self, value: &str) -> impl Iterator<Item = u64> + '_ {
        let digest = Sha256::digest(value.as_bytes());
        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        first.copy_from_slice(&digest[0..8]);
        second.copy_from_slice(&digest[8..16]);
        let hash1 = u64::from_le_bytes(first);
        let hash2 = u64::from_le_bytes(second);
        (0..u64::from(self.hash_count)).map(move |i| {
            hash1.wrapping_add(hash2.wrapping_mul(i)) % self.bit_count
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_payload() {
        assert!(BloomFilter::new(vec![0xff], 8, 1).is_err());
        assert!(BloomFilter::new(vec![], 1, 0).is_err());
        assert!(BloomFilter::new(vec![0xff], 0, 0).is_err());
        let empty = BloomFilter::new(vec![], 0, 0).unwrap();
        assert_eq!(empty.bit_count(), 0);
        assert!(!empty.might_contain("anything"));
    }

    #[test]
    fn never_reports_false_negatives() {
        let names: Vec<String> = (0..200)
            .map(|i| format!("projects/p/databases/(default)/documents/rooms/{i}"))
            .collect();
        let filter =
            BloomFilter::with_names(names.iter().map(String::as_str), 2_000, 7).unwrap();
        assert!(names.iter().all(|name| filter.might_contain(name)));

        let payload = filter.to_payload();
        let decoded = BloomFilter::from_payload(&payload).unwrap();
        assert_eq!(decoded.bit_count(), 2_000);
        assert!(names.iter().all(|name| decoded.might_contain(name)));
    }

    #[test]
    fn rejects_most_absent_values() {
        let filter = BloomFilter::with_names(["a", "b", "c"], 1_024, 5).unwrap();
        let false_positives = (0..1_000)
            .filter(|i| filter.might_contain(&format!("missing-{i}")))
            .count();
        assert!(false_positives < 50, "{false_positives} false positives");
    }
}
