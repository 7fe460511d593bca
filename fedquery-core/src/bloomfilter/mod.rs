//! Keyed Bloom filter primitives for pseudonymizing identity fields.
//!
//! Every identity field value is split into bi-grams; each bi-gram is hashed
//! by two independent (keyed) hash functions and mapped into
//! [`NUMBER_OF_HASH_FUNCTIONS`] filter positions via double hashing
//! (`h1 + i * h2 mod length`). Sites sharing the same keys therefore map
//! equal values to equal positions, while anyone without the keys cannot
//! reproduce the mapping.
//!
//! The concrete hash primitive pair is a parameter of the protocol, not
//! fixed: implement [`BigramHasher`] to substitute another pair.

pub(crate) mod record;

pub use self::record::{
    BloomFilterConfig,
    FieldBloomFilter,
    FieldLengths,
    FieldWeights,
    HmacKey,
    IdentityField,
    IdentityRecord,
    RecordBloomFilter,
    RecordBloomFilterGenerator,
    DEFAULT_RECORD_FILTER_LENGTH,
};

use num::{bigint::BigUint, traits::ToPrimitive};
use sodiumoxide::crypto::{
    auth::{hmacsha256, hmacsha512},
    hash::{sha256, sha512},
};

/// The number of double-hash iterations per bi-gram.
pub const NUMBER_OF_HASH_FUNCTIONS: u32 = 15;

/// A fixed-length bit set.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Bits {
    length: usize,
    words: Vec<u64>,
}

impl Bits {
    /// Creates a bit set of `length` bits, all zero.
    pub fn new(length: usize) -> Self {
        Self {
            length,
            words: vec![0; (length + 63) / 64],
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Sets the bit at `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn set(&mut self, index: usize) {
        assert!(index < self.length, "bit index out of bounds");
        self.words[index / 64] |= 1 << (index % 64);
    }

    /// Whether the bit at `index` is set.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.length, "bit index out of bounds");
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// The number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// The number of positions set in both `self` and `other`.
    ///
    /// # Panics
    /// Panics if the lengths differ; filters of different configurations are
    /// never comparable.
    pub fn intersection_count(&self, other: &Self) -> usize {
        assert_eq!(self.length, other.length, "bit set lengths differ");
        self.words
            .iter()
            .zip(other.words.iter())
            .map(|(a, b)| (a & b).count_ones() as usize)
            .sum()
    }

    /// Serializes the bit set into little-endian packed bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0_u8; (self.length + 7) / 8];
        for (index, byte) in bytes.iter_mut().enumerate() {
            let word = self.words[index / 8];
            *byte = (word >> ((index % 8) * 8)) as u8;
        }
        bytes
    }

    /// Deserializes a bit set of `length` bits from packed bytes.
    ///
    /// Returns `None` if `bytes` is not exactly the packed size of `length`
    /// bits or if padding bits beyond `length` are set.
    pub fn from_bytes(length: usize, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != (length + 7) / 8 {
            return None;
        }
        let mut bits = Self::new(length);
        for (index, byte) in bytes.iter().enumerate() {
            bits.words[index / 8] |= (*byte as u64) << ((index % 8) * 8);
        }
        let padding = bits.words.len() * 64 - length;
        if padding > 0 && bits.words[bits.words.len() - 1] >> (64 - padding) != 0 {
            return None;
        }
        Some(bits)
    }
}

/// The two independent hash functions applied to every bi-gram.
pub trait BigramHasher {
    fn first_hash(&self, bigram: &[u8]) -> Vec<u8>;

    fn second_hash(&self, bigram: &[u8]) -> Vec<u8>;
}

/// Unkeyed SHA-256/SHA-512 bi-gram hasher.
///
/// Positions derived from it are reproducible by anyone; only suitable where
/// the filters themselves stay local.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha256Sha512Hasher;

impl BigramHasher for Sha256Sha512Hasher {
    fn first_hash(&self, bigram: &[u8]) -> Vec<u8> {
        sha256::hash(bigram).as_ref().to_vec()
    }

    fn second_hash(&self, bigram: &[u8]) -> Vec<u8> {
        sha512::hash(bigram).as_ref().to_vec()
    }
}

/// Keyed HMAC-SHA-256/HMAC-SHA-512 bi-gram hasher.
///
/// Sites sharing the two keys produce identical filters for identical
/// values; without the keys the bit positions are not linkable to values.
#[derive(Clone)]
pub struct HmacSha256HmacSha512Hasher {
    first_key: hmacsha256::Key,
    second_key: hmacsha512::Key,
}

impl HmacSha256HmacSha512Hasher {
    pub fn new(first_key: &HmacKey, second_key: &HmacKey) -> Self {
        Self {
            first_key: hmacsha256::Key(*first_key.as_bytes()),
            second_key: hmacsha512::Key(*second_key.as_bytes()),
        }
    }
}

impl BigramHasher for HmacSha256HmacSha512Hasher {
    fn first_hash(&self, bigram: &[u8]) -> Vec<u8> {
        hmacsha256::authenticate(bigram, &self.first_key)
            .as_ref()
            .to_vec()
    }

    fn second_hash(&self, bigram: &[u8]) -> Vec<u8> {
        hmacsha512::authenticate(bigram, &self.second_key)
            .as_ref()
            .to_vec()
    }
}

/// Generates one Bloom filter per input value.
#[derive(Clone, Debug)]
pub struct BloomFilterGenerator<H> {
    length: usize,
    hasher: H,
}

impl<H> BloomFilterGenerator<H>
where
    H: BigramHasher,
{
    pub fn new(length: usize, hasher: H) -> Self {
        Self { length, hasher }
    }

    /// Hashes `input` into a bit set of this generator's length.
    pub fn bit_set(&self, input: &str) -> Bits {
        let mut bits = Bits::new(self.length);
        for bigram in bigrams(input) {
            for iteration in 0..NUMBER_OF_HASH_FUNCTIONS {
                bits.set(self.position(&bigram, iteration));
            }
        }
        bits
    }

    fn position(&self, bigram: &[u8], iteration: u32) -> usize {
        let first = BigUint::from_bytes_be(&self.hasher.first_hash(bigram));
        let second = BigUint::from_bytes_be(&self.hasher.second_hash(bigram));
        let position = (first + second * iteration) % self.length;
        // safe unwrap: the remainder is smaller than `length`
        position.to_usize().unwrap()
    }
}

/// Splits a value into bi-grams, padded with one leading and one trailing
/// space so that single-character values still produce bi-grams.
fn bigrams(input: &str) -> Vec<Vec<u8>> {
    let padded: Vec<char> = std::iter::once(' ')
        .chain(input.chars())
        .chain(std::iter::once(' '))
        .collect();
    padded
        .windows(2)
        .map(|pair| {
            let mut bigram = String::with_capacity(8);
            bigram.push(pair[0]);
            bigram.push(pair[1]);
            bigram.into_bytes()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_roundtrip_bytes() {
        let mut bits = Bits::new(70);
        bits.set(0);
        bits.set(13);
        bits.set(69);
        let restored = Bits::from_bytes(70, &bits.to_bytes()).unwrap();
        assert_eq!(bits, restored);
        assert_eq!(restored.count_ones(), 3);
    }

    #[test]
    fn test_bits_from_bytes_rejects_wrong_size() {
        assert!(Bits::from_bytes(70, &[0_u8; 8]).is_none());
        assert!(Bits::from_bytes(70, &[0_u8; 10]).is_none());
    }

    #[test]
    fn test_bits_intersection_count() {
        let mut a = Bits::new(16);
        let mut b = Bits::new(16);
        a.set(1);
        a.set(5);
        a.set(9);
        b.set(5);
        b.set(9);
        b.set(12);
        assert_eq!(a.intersection_count(&b), 2);
    }

    #[test]
    fn test_generator_is_deterministic() {
        let generator = BloomFilterGenerator::new(500, Sha256Sha512Hasher);
        assert_eq!(generator.bit_set("mueller"), generator.bit_set("mueller"));
        assert_ne!(generator.bit_set("mueller"), generator.bit_set("meier"));
    }

    #[test]
    fn test_keyed_generators_agree_only_on_shared_keys() {
        let key1 = HmacKey::generate();
        let key2 = HmacKey::generate();
        let shared_a =
            BloomFilterGenerator::new(500, HmacSha256HmacSha512Hasher::new(&key1, &key2));
        let shared_b =
            BloomFilterGenerator::new(500, HmacSha256HmacSha512Hasher::new(&key1, &key2));
        assert_eq!(shared_a.bit_set("mueller"), shared_b.bit_set("mueller"));

        let other_keys = BloomFilterGenerator::new(
            500,
            HmacSha256HmacSha512Hasher::new(&HmacKey::generate(), &HmacKey::generate()),
        );
        assert_ne!(shared_a.bit_set("mueller"), other_keys.bit_set("mueller"));
    }

    #[test]
    fn test_bigrams_pad_input() {
        assert_eq!(
            bigrams("ab"),
            vec![b" a".to_vec(), b"ab".to_vec(), b"b ".to_vec()]
        );
        assert_eq!(bigrams(""), vec![b"  ".to_vec()]);
    }
}
