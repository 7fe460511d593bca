//! # Fedquery: privacy-preserving federated feasibility queries
//!
//! A *feasibility query* asks a federation of independent, mutually
//! distrusting medical data sites how many patients matching each of a set of
//! cohort definitions they hold. No site may learn another site's raw data,
//! and no aggregate may be disclosed unless enough sites contributed to it
//! that a single site cannot infer another's count by subtraction.
//!
//! This crate contains the domain model and the privacy primitives of the
//! protocol:
//!
//! - identifiers and unguessable per-participant [correlation
//!   keys](CorrelationKey) that join a dispatched request to its response,
//! - the [study model](study) describing cohorts and participating
//!   organizations,
//! - pure [query validation and rewriting](query),
//! - the tabular [result model](result) exchanged between sites,
//! - keyed [record Bloom filters](bloomfilter) for pseudonymizing patient
//!   identities, and
//! - the [federated matcher](linkage) that deduplicates pseudonymized
//!   records across sites without ever seeing a plaintext identity.
//!
//! The orchestration of these pieces into a running batch lives in the
//! `fedquery-server` crate.

#[macro_use]
extern crate serde;

pub mod bloomfilter;
pub mod linkage;
pub mod query;
pub mod result;
pub mod study;
pub mod translation;

use derive_more::{AsRef, Display, From, Into};
use uuid::Uuid;

/// An opaque identifier of a participating organization.
///
/// Organization identifiers are consumed by the aggregation stage and never
/// appear in a batch outcome.
#[derive(
    AsRef,
    Clone,
    Debug,
    Deserialize,
    Display,
    Eq,
    From,
    Hash,
    Into,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct OrganizationIdentifier(String);

impl OrganizationIdentifier {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self(identifier.into())
    }
}

impl From<&str> for OrganizationIdentifier {
    fn from(identifier: &str) -> Self {
        Self(identifier.to_string())
    }
}

/// The site-qualified, globally unique identifier of a cohort definition.
#[derive(
    AsRef,
    Clone,
    Debug,
    Deserialize,
    Display,
    Eq,
    From,
    Hash,
    Into,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct CohortId(String);

impl CohortId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl From<&str> for CohortId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// An unguessable token joining one participant's dispatched request to its
/// eventual response.
///
/// A correlation key is minted once per (batch, participant) pair and dies
/// with the batch. Possession of the key is the only authorization a
/// responder needs to attach a result to the batch, which is why it must be
/// random rather than derived.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, From, Hash, PartialEq, Serialize)]
pub struct CorrelationKey(Uuid);

impl CorrelationKey {
    /// Mints a fresh random key.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

/// The identifier of one batch instance.
///
/// Two executions of the same study are two distinct batches with disjoint
/// correlation key spaces.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, From, Hash, PartialEq, Serialize)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}
