//! Translation between raw identifier result sets and their pseudonymized
//! form.
//!
//! On the site side, [`pseudonymize`] replaces an identifier row set with a
//! single-column result set of base64-encoded record Bloom filters, looking
//! up each row's identity data through an [`IdentityResolver`]. On the
//! trusted-third-party side, [`records_from_result_set`] parses those rows
//! back into [`LinkageRecord`]s for the federated matcher.
//!
//! A row that cannot be translated is dropped from the cohort's filter set
//! with an error record; translation failures are never fatal to a batch.

use thiserror::Error;

use crate::{
    bloomfilter::{BigramHasher, Bits, IdentityRecord, RecordBloomFilter, RecordBloomFilterGenerator},
    linkage::LinkageRecord,
    result::{Column, ResultSet},
    OrganizationIdentifier,
};

/// The column carrying the queried identifier on the site side.
pub const EHR_ID_COLUMN: &str = "EHRID";

/// The column carrying the record Bloom filter after pseudonymization.
pub const RBF_COLUMN: &str = "RBF";

#[derive(Debug, Error, Eq, PartialEq)]
pub enum TranslationError {
    #[error("result set has no '{0}' column")]
    MissingColumn(&'static str),

    #[error("row {row} has no value in the '{column}' column")]
    MissingValue { row: usize, column: &'static str },

    #[error("no identity data found for identifier '{0}'")]
    UnknownIdentity(String),

    #[error("row {row} does not hold a valid record Bloom filter of {length} bits")]
    InvalidFilter { row: usize, length: usize },
}

/// Resolves a queried identifier to the patient's identity data, typically
/// through a site's master patient index.
pub trait IdentityResolver {
    fn resolve(&self, ehr_id: &str) -> Result<IdentityRecord, TranslationError>;
}

/// Pseudonymizes a raw identifier result set into a single-column result set
/// of record Bloom filters.
///
/// Rows that cannot be resolved or translated are dropped and reported in
/// the second tuple element. Fails only if the input has no identifier
/// column at all.
pub fn pseudonymize<H, R>(
    result_set: &ResultSet,
    generator: &RecordBloomFilterGenerator<H>,
    resolver: &R,
) -> Result<(ResultSet, Vec<TranslationError>), TranslationError>
where
    H: BigramHasher + Clone,
    R: IdentityResolver + ?Sized,
{
    let id_column = result_set
        .column_index(EHR_ID_COLUMN)
        .ok_or(TranslationError::MissingColumn(EHR_ID_COLUMN))?;

    let mut rows = Vec::with_capacity(result_set.rows.len());
    let mut dropped = Vec::new();
    for (index, row) in result_set.rows.iter().enumerate() {
        match translate_row(index, row, id_column, generator, resolver) {
            Ok(filter) => rows.push(vec![base64::encode(filter.bits().to_bytes())]),
            Err(error) => dropped.push(error),
        }
    }

    let translated = ResultSet::new(vec![Column::new(RBF_COLUMN, "/rbf")], rows);
    Ok((translated, dropped))
}

fn translate_row<H, R>(
    index: usize,
    row: &[String],
    id_column: usize,
    generator: &RecordBloomFilterGenerator<H>,
    resolver: &R,
) -> Result<RecordBloomFilter, TranslationError>
where
    H: BigramHasher + Clone,
    R: IdentityResolver + ?Sized,
{
    let ehr_id = row.get(id_column).ok_or(TranslationError::MissingValue {
        row: index,
        column: EHR_ID_COLUMN,
    })?;
    let identity = resolver.resolve(ehr_id)?;
    Ok(generator.generate(&identity))
}

/// Parses a pseudonymized result set back into linkage records for the
/// federated matcher.
///
/// Rows that do not decode to a filter of `filter_length` bits are dropped
/// and reported. Fails only if the input has no filter column at all.
pub fn records_from_result_set(
    organization: &OrganizationIdentifier,
    result_set: &ResultSet,
    filter_length: usize,
) -> Result<(Vec<LinkageRecord>, Vec<TranslationError>), TranslationError> {
    let rbf_column = result_set
        .column_index(RBF_COLUMN)
        .ok_or(TranslationError::MissingColumn(RBF_COLUMN))?;

    let mut records = Vec::with_capacity(result_set.rows.len());
    let mut dropped = Vec::new();
    for (index, row) in result_set.rows.iter().enumerate() {
        match parse_row(index, row, rbf_column, filter_length) {
            Ok(bits) => records.push(LinkageRecord::new(
                organization.clone(),
                RecordBloomFilter::from_bits(bits),
            )),
            Err(error) => dropped.push(error),
        }
    }
    Ok((records, dropped))
}

fn parse_row(
    index: usize,
    row: &[String],
    rbf_column: usize,
    filter_length: usize,
) -> Result<Bits, TranslationError> {
    let encoded = row.get(rbf_column).ok_or(TranslationError::MissingValue {
        row: index,
        column: RBF_COLUMN,
    })?;
    let bytes = base64::decode(encoded).map_err(|_| TranslationError::InvalidFilter {
        row: index,
        length: filter_length,
    })?;
    Bits::from_bytes(filter_length, &bytes).ok_or(TranslationError::InvalidFilter {
        row: index,
        length: filter_length,
    })
}
