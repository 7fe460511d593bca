//! Assembly of per-field Bloom filters into one record Bloom filter (RBF).
//!
//! Each identity field is hashed into its own filter, sized and weighted by
//! how well the field distinguishes persons. The record filter samples bits
//! from the field filters proportionally to their weights and shuffles the
//! result with a permutation derived from a shared seed, so that all sites
//! holding the same configuration place the same source bits at the same
//! record positions.

use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sodiumoxide::randombytes::randombytes;

use crate::bloomfilter::{
    BigramHasher,
    Bits,
    BloomFilterGenerator,
    HmacSha256HmacSha512Hasher,
};

/// The default record Bloom filter length in bits.
pub const DEFAULT_RECORD_FILTER_LENGTH: usize = 3000;

/// The identity fields a record Bloom filter is assembled from.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum IdentityField {
    FirstName,
    LastName,
    Birthday,
    Sex,
    Street,
    ZipCode,
    City,
    Country,
    InsuranceNumber,
}

impl IdentityField {
    pub const ALL: [IdentityField; 9] = [
        IdentityField::FirstName,
        IdentityField::LastName,
        IdentityField::Birthday,
        IdentityField::Sex,
        IdentityField::Street,
        IdentityField::ZipCode,
        IdentityField::City,
        IdentityField::Country,
        IdentityField::InsuranceNumber,
    ];
}

/// One patient's identity data, as resolved from a site's patient index.
///
/// These values never leave a site; only the record Bloom filter derived
/// from them does.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IdentityRecord {
    pub first_name: String,
    pub last_name: String,
    pub birthday: String,
    pub sex: String,
    pub street: String,
    pub zip_code: String,
    pub city: String,
    pub country: String,
    pub insurance_number: String,
}

impl IdentityRecord {
    fn field(&self, field: IdentityField) -> &str {
        match field {
            IdentityField::FirstName => &self.first_name,
            IdentityField::LastName => &self.last_name,
            IdentityField::Birthday => &self.birthday,
            IdentityField::Sex => &self.sex,
            IdentityField::Street => &self.street,
            IdentityField::ZipCode => &self.zip_code,
            IdentityField::City => &self.city,
            IdentityField::Country => &self.country,
            IdentityField::InsuranceNumber => &self.insurance_number,
        }
    }
}

/// Per-field sampling weights. Must sum to 1 for the record filter to be
/// filled exactly.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct FieldWeights {
    pub first_name: f64,
    pub last_name: f64,
    pub birthday: f64,
    pub sex: f64,
    pub street: f64,
    pub zip_code: f64,
    pub city: f64,
    pub country: f64,
    pub insurance_number: f64,
}

impl FieldWeights {
    fn field(&self, field: IdentityField) -> f64 {
        match field {
            IdentityField::FirstName => self.first_name,
            IdentityField::LastName => self.last_name,
            IdentityField::Birthday => self.birthday,
            IdentityField::Sex => self.sex,
            IdentityField::Street => self.street,
            IdentityField::ZipCode => self.zip_code,
            IdentityField::City => self.city,
            IdentityField::Country => self.country,
            IdentityField::InsuranceNumber => self.insurance_number,
        }
    }
}

impl Default for FieldWeights {
    fn default() -> Self {
        Self {
            first_name: 0.1,
            last_name: 0.1,
            birthday: 0.1,
            sex: 0.2,
            street: 0.05,
            zip_code: 0.1,
            city: 0.05,
            country: 0.2,
            insurance_number: 0.1,
        }
    }
}

/// Per-field filter lengths in bits. Rarely distinguishing fields get short
/// filters, highly distinguishing fields long ones.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct FieldLengths {
    pub first_name: usize,
    pub last_name: usize,
    pub birthday: usize,
    pub sex: usize,
    pub street: usize,
    pub zip_code: usize,
    pub city: usize,
    pub country: usize,
    pub insurance_number: usize,
}

impl FieldLengths {
    fn field(&self, field: IdentityField) -> usize {
        match field {
            IdentityField::FirstName => self.first_name,
            IdentityField::LastName => self.last_name,
            IdentityField::Birthday => self.birthday,
            IdentityField::Sex => self.sex,
            IdentityField::Street => self.street,
            IdentityField::ZipCode => self.zip_code,
            IdentityField::City => self.city,
            IdentityField::Country => self.country,
            IdentityField::InsuranceNumber => self.insurance_number,
        }
    }
}

impl Default for FieldLengths {
    fn default() -> Self {
        Self {
            first_name: 500,
            last_name: 500,
            birthday: 250,
            sex: 50,
            street: 500,
            zip_code: 250,
            city: 500,
            country: 500,
            insurance_number: 500,
        }
    }
}

/// A 32-byte HMAC key shared between the sites of one study.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HmacKey([u8; 32]);

impl HmacKey {
    pub const LENGTH: usize = 32;

    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let bytes = randombytes(Self::LENGTH);
        let mut key = [0_u8; Self::LENGTH];
        key.copy_from_slice(&bytes);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// The shared secrets of one study's record-linkage path: a permutation seed
/// and two HMAC keys.
///
/// A capability, not data: it is minted fresh per study and must never be
/// reused across studies, since filter reuse across studies would allow
/// linkage-based deanonymization between them.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BloomFilterConfig {
    pub permutation_seed: u64,
    pub first_hmac_key: HmacKey,
    pub second_hmac_key: HmacKey,
}

impl BloomFilterConfig {
    /// Mints a fresh configuration.
    pub fn generate() -> Self {
        Self {
            permutation_seed: rand::thread_rng().gen(),
            first_hmac_key: HmacKey::generate(),
            second_hmac_key: HmacKey::generate(),
        }
    }
}

/// A weighted per-field Bloom filter.
#[derive(Clone, Debug)]
pub struct FieldBloomFilter {
    bits: Bits,
    weight: f64,
}

impl FieldBloomFilter {
    pub fn new(bits: Bits, weight: f64) -> Self {
        Self { bits, weight }
    }
}

/// One patient's pseudonymized record: the fixed-length filter assembled
/// from the weighted field filters.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RecordBloomFilter {
    bits: Bits,
}

impl RecordBloomFilter {
    /// Samples `weight * length` bits from each field filter (cycling over
    /// short filters) and shuffles the sampled sequence with the seeded
    /// permutation.
    pub fn assemble(length: usize, permutation_seed: u64, fields: &[FieldBloomFilter]) -> Self {
        let mut sampled = Vec::with_capacity(length);
        for field in fields {
            let share = (field.weight * length as f64).round() as usize;
            for index in 0..share {
                sampled.push(field.bits.get(index % field.bits.len()));
            }
        }
        // weight rounding may drift by a few bits
        sampled.truncate(length);
        sampled.resize(length, false);

        let mut positions: Vec<usize> = (0..length).collect();
        positions.shuffle(&mut ChaCha20Rng::seed_from_u64(permutation_seed));

        let mut bits = Bits::new(length);
        for (target, &source) in positions.iter().enumerate() {
            if sampled[source] {
                bits.set(target);
            }
        }
        Self { bits }
    }

    pub fn from_bits(bits: Bits) -> Self {
        Self { bits }
    }

    pub fn bits(&self) -> &Bits {
        &self.bits
    }

    pub fn into_bits(self) -> Bits {
        self.bits
    }
}

/// Generates record Bloom filters for a fixed study configuration.
#[derive(Clone, Debug)]
pub struct RecordBloomFilterGenerator<H> {
    length: usize,
    permutation_seed: u64,
    weights: FieldWeights,
    lengths: FieldLengths,
    hasher: H,
}

impl RecordBloomFilterGenerator<HmacSha256HmacSha512Hasher> {
    /// Creates a generator using the study's shared secrets and the default
    /// keyed hasher.
    pub fn from_config(
        config: &BloomFilterConfig,
        length: usize,
        weights: FieldWeights,
        lengths: FieldLengths,
    ) -> Self {
        Self::new(
            length,
            config.permutation_seed,
            weights,
            lengths,
            HmacSha256HmacSha512Hasher::new(&config.first_hmac_key, &config.second_hmac_key),
        )
    }
}

impl<H> RecordBloomFilterGenerator<H>
where
    H: BigramHasher + Clone,
{
    pub fn new(
        length: usize,
        permutation_seed: u64,
        weights: FieldWeights,
        lengths: FieldLengths,
        hasher: H,
    ) -> Self {
        Self {
            length,
            permutation_seed,
            weights,
            lengths,
            hasher,
        }
    }

    /// The record filter length in bits.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Pseudonymizes one identity record.
    pub fn generate(&self, record: &IdentityRecord) -> RecordBloomFilter {
        let fields: Vec<FieldBloomFilter> = IdentityField::ALL
            .iter()
            .map(|&field| {
                let generator =
                    BloomFilterGenerator::new(self.lengths.field(field), self.hasher.clone());
                FieldBloomFilter::new(generator.bit_set(record.field(field)), self.weights.field(field))
            })
            .collect();
        RecordBloomFilter::assemble(self.length, self.permutation_seed, &fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(first_name: &str, insurance_number: &str) -> IdentityRecord {
        IdentityRecord {
            first_name: first_name.to_string(),
            last_name: "mueller".to_string(),
            birthday: "1980-05-04".to_string(),
            sex: "f".to_string(),
            street: "teststr. 5".to_string(),
            zip_code: "12345".to_string(),
            city: "berlin".to_string(),
            country: "de".to_string(),
            insurance_number: insurance_number.to_string(),
        }
    }

    #[test]
    fn test_generators_with_shared_config_agree_across_sites() {
        let config = BloomFilterConfig::generate();
        let site_a = RecordBloomFilterGenerator::from_config(
            &config,
            DEFAULT_RECORD_FILTER_LENGTH,
            FieldWeights::default(),
            FieldLengths::default(),
        );
        let site_b = RecordBloomFilterGenerator::from_config(
            &config,
            DEFAULT_RECORD_FILTER_LENGTH,
            FieldWeights::default(),
            FieldLengths::default(),
        );

        let patient = record("erika", "A123456789");
        assert_eq!(site_a.generate(&patient), site_b.generate(&patient));
    }

    #[test]
    fn test_generators_with_fresh_configs_disagree() {
        let patient = record("erika", "A123456789");
        let site_a = RecordBloomFilterGenerator::from_config(
            &BloomFilterConfig::generate(),
            DEFAULT_RECORD_FILTER_LENGTH,
            FieldWeights::default(),
            FieldLengths::default(),
        );
        let site_b = RecordBloomFilterGenerator::from_config(
            &BloomFilterConfig::generate(),
            DEFAULT_RECORD_FILTER_LENGTH,
            FieldWeights::default(),
            FieldLengths::default(),
        );
        assert_ne!(site_a.generate(&patient), site_b.generate(&patient));
    }

    #[test]
    fn test_record_filter_has_configured_length() {
        let generator = RecordBloomFilterGenerator::from_config(
            &BloomFilterConfig::generate(),
            DEFAULT_RECORD_FILTER_LENGTH,
            FieldWeights::default(),
            FieldLengths::default(),
        );
        let filter = generator.generate(&record("erika", "A123456789"));
        assert_eq!(filter.bits().len(), DEFAULT_RECORD_FILTER_LENGTH);
        assert!(filter.bits().count_ones() > 0);
    }

    #[test]
    fn test_similar_records_have_high_overlap() {
        let generator = RecordBloomFilterGenerator::from_config(
            &BloomFilterConfig::generate(),
            DEFAULT_RECORD_FILTER_LENGTH,
            FieldWeights::default(),
            FieldLengths::default(),
        );
        let a = generator.generate(&record("erika", "A123456789"));
        let b = generator.generate(&record("erika", "A123456789"));
        let c = generator.generate(&record("friedrich", "Z999999999"));

        let identical = a.bits().intersection_count(b.bits());
        let different = a.bits().intersection_count(c.bits());
        assert!(identical > different);
    }
}
