//! Result types exchanged between sites and produced by a batch.

use crate::{CohortId, OrganizationIdentifier};

/// A column of a tabular query result.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Column {
    /// The column name, e.g. `EHRID`.
    pub name: String,
    /// The path the column was projected from, e.g. `/ehr_id/value`.
    pub path: String,
}

impl Column {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// A tabular result set as returned by a site's local data repository, or as
/// produced by the pseudonymization step (one Bloom filter column).
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ResultSet {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<String>>,
}

impl ResultSet {
    pub fn new(columns: Vec<Column>, rows: Vec<Vec<String>>) -> Self {
        Self { columns, rows }
    }

    /// The index of the column with the given name, if any.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// What one site reports for one cohort.
///
/// Exactly one of the three cases; consumers must handle all of them. A
/// failed execution is a first-class result so that one site's outage never
/// stalls the batch.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SitePayload {
    /// The scalar result of a count query.
    Count(u64),
    /// The row set of an identifier query. On the record-linkage path the
    /// rows carry pseudonymized record Bloom filters, never raw identifiers.
    Rows(ResultSet),
    /// The site could not produce a result; the message is for the audit
    /// trail only.
    Failed(String),
}

impl SitePayload {
    /// Whether this payload contributes to a cohort's participant count.
    pub fn is_contributing(&self) -> bool {
        !matches!(self, SitePayload::Failed(_))
    }
}

/// One site's result for one cohort of one batch.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SiteResult {
    pub organization: OrganizationIdentifier,
    pub cohort_id: CohortId,
    pub payload: SitePayload,
}

impl SiteResult {
    pub fn count(
        organization: impl Into<OrganizationIdentifier>,
        cohort_id: impl Into<CohortId>,
        count: u64,
    ) -> Self {
        Self {
            organization: organization.into(),
            cohort_id: cohort_id.into(),
            payload: SitePayload::Count(count),
        }
    }

    pub fn rows(
        organization: impl Into<OrganizationIdentifier>,
        cohort_id: impl Into<CohortId>,
        rows: ResultSet,
    ) -> Self {
        Self {
            organization: organization.into(),
            cohort_id: cohort_id.into(),
            payload: SitePayload::Rows(rows),
        }
    }

    pub fn failed(
        organization: impl Into<OrganizationIdentifier>,
        cohort_id: impl Into<CohortId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            organization: organization.into(),
            cohort_id: cohort_id.into(),
            payload: SitePayload::Failed(message.into()),
        }
    }
}

/// The combined cross-site result for one cohort.
///
/// Carries no organization identifiers: a site's identity is consumed by the
/// aggregation stage and never forwarded.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AggregatedCohortResult {
    pub cohort_id: CohortId,
    /// The number of distinct sites that contributed a non-error result.
    pub participant_count: u64,
    /// The summed count, or the matched distinct-patient count on the
    /// record-linkage path.
    pub value: u64,
}
