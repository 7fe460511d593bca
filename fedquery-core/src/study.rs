//! The study model: cohort definitions, participating organizations and the
//! per-batch participant set.

use crate::{CohortId, CorrelationKey, OrganizationIdentifier};

/// The lowest admissible k-anonymity floor.
///
/// Must be 3 or larger, as otherwise it is possible to draw conclusions about
/// an individual site's count: with two contributing sites, a site that
/// already knows its own cohort size recovers the other's by subtraction.
pub const PARTICIPATING_MEDICS_FLOOR: u64 = 3;

/// A named, opaque patient-selection query definition.
///
/// Immutable once a batch has started; the batch's cohort set is closed.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Cohort {
    /// The site-qualified cohort identifier, e.g. `Group/42`.
    pub id: CohortId,
    /// The raw query string against a site's local data repository. Opaque to
    /// this crate except for the syntactic prefix check in [`crate::query`].
    pub query: String,
}

impl Cohort {
    pub fn new(id: impl Into<CohortId>, query: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
        }
    }
}

/// An unresolved reference to an organization, as listed in a study
/// definition.
///
/// References are resolved to [`OrganizationIdentifier`]s by the participant
/// resolver through an organization provider.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct OrganizationRef(String);

impl OrganizationRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// What a site returns for a cohort: a scalar count, or the identifier row
/// set that feeds the record-linkage path.
///
/// The mode is fixed for the whole batch when the participant set is
/// resolved.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum QueryMode {
    Count,
    Identifier,
}

/// The input to a batch: cohorts, participating organizations and whether
/// cross-site deduplication through record linkage is required.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StudyDefinition {
    /// The study identifier, for logging and audit records only.
    pub id: String,
    /// The cohort definitions to evaluate.
    pub cohorts: Vec<Cohort>,
    /// References to the participating medical data sites.
    pub participating_medics: Vec<OrganizationRef>,
    /// Reference to the trusted third party, required iff record linkage is.
    pub participating_ttp: Option<OrganizationRef>,
    /// Whether per-patient results must be deduplicated across sites.
    pub needs_record_linkage: bool,
}

impl StudyDefinition {
    /// The query mode this study runs in.
    pub fn mode(&self) -> QueryMode {
        if self.needs_record_linkage {
            QueryMode::Identifier
        } else {
            QueryMode::Count
        }
    }
}

/// One organization taking part in one batch.
///
/// The correlation key is minted when the participant set is resolved and is
/// never regenerated for the lifetime of the batch.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Participant {
    pub organization: OrganizationIdentifier,
    pub correlation_key: CorrelationKey,
}

impl Participant {
    /// Creates a participant with a freshly minted correlation key (the
    /// leading site's side of the protocol).
    pub fn new(organization: OrganizationIdentifier) -> Self {
        Self {
            organization,
            correlation_key: CorrelationKey::generate(),
        }
    }

    /// Creates a participant from a key assigned by the leading site (the
    /// responding site's side of the protocol).
    pub fn assigned(organization: OrganizationIdentifier, correlation_key: CorrelationKey) -> Self {
        Self {
            organization,
            correlation_key,
        }
    }
}
