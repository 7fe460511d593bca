//! Per-batch state and the batch outcome.
//!
//! A batch's entire mutable state lives in one [`BatchState`] value owned by
//! the state machine that executes it; sibling batches never share state.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::settings::{BatchSettings, LinkageSettings};
use fedquery_core::{
    bloomfilter::BloomFilterConfig,
    result::{AggregatedCohortResult, SiteResult},
    study::{Participant, QueryMode, StudyDefinition},
    BatchId,
    CohortId,
    CorrelationKey,
    OrganizationIdentifier,
};

/// The audit trail of one batch: one human-readable entry per dropped
/// cohort, rejected query, translation failure or partial collection.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct AuditLog {
    entries: Vec<String>,
}

impl AuditLog {
    /// Appends an entry.
    pub fn record(&mut self, entry: impl Into<String>) {
        self.entries.push(entry.into());
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<String> {
        self.entries
    }
}

/// The state of one batch instance.
///
/// Created when the participant set is resolved, destroyed when the batch
/// reaches a terminal phase. The cohort set and the participant set are
/// closed once filled: no cohort is added after validation and no participant
/// joins after resolution.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BatchState {
    /// The batch identifier.
    pub id: BatchId,
    /// The study this batch executes.
    pub study: StudyDefinition,
    /// Whether sites report counts or identifier row sets.
    pub mode: QueryMode,
    /// Snapshot of the batch settings taken at initialization.
    pub batch: BatchSettings,
    /// Snapshot of the linkage settings taken at initialization.
    pub linkage: LinkageSettings,

    /// The resolved participants, one correlation key each. Filled by the
    /// resolve phase.
    pub participants: Vec<Participant>,
    /// The trusted third party, on the record-linkage path.
    pub ttp: Option<Participant>,
    /// The study's shared linkage secrets, on the record-linkage path.
    pub bloom_filter_config: Option<BloomFilterConfig>,

    /// The validated (and, in identifier mode, rewritten) queries, in cohort
    /// order. Filled by the validate phase.
    pub queries: Vec<(CohortId, String)>,

    /// Correlation keys under which a result has been accepted.
    pub satisfied: HashSet<CorrelationKey>,
    /// All accepted per-site per-cohort results.
    pub accepted: Vec<SiteResult>,

    /// The per-cohort linkage output, in identifier mode.
    pub linked: Vec<AggregatedCohortResult>,
    /// The combined per-cohort results before the privacy gate.
    pub aggregated: Vec<AggregatedCohortResult>,

    /// The audit trail.
    pub audit: AuditLog,
}

impl BatchState {
    pub fn new(study: StudyDefinition, batch: BatchSettings, linkage: LinkageSettings) -> Self {
        let mode = study.mode();
        Self {
            id: BatchId::generate(),
            study,
            mode,
            batch,
            linkage,
            participants: Vec::new(),
            ttp: None,
            bloom_filter_config: None,
            queries: Vec::new(),
            satisfied: HashSet::new(),
            accepted: Vec::new(),
            linked: Vec::new(),
            aggregated: Vec::new(),
            audit: AuditLog::default(),
        }
    }

    /// The participant holding the given correlation key, if any.
    pub fn participant_by_key(&self, key: &CorrelationKey) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|participant| participant.correlation_key == *key)
    }

    /// The participant of the given organization, if it takes part in this
    /// batch.
    pub fn participant_by_organization(
        &self,
        organization: &OrganizationIdentifier,
    ) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|participant| participant.organization == *organization)
    }

    /// Whether the cohort belongs to this batch's validated cohort set.
    pub fn is_known_cohort(&self, cohort_id: &CohortId) -> bool {
        self.queries.iter().any(|(id, _)| id == cohort_id)
    }
}

/// The final output of a batch.
///
/// Contains no organization identifiers: a site's identity is consumed by
/// aggregation and never disclosed with the outcome.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BatchOutcome {
    /// One entry per cohort that cleared the privacy gate; cohorts without
    /// any accepted result are absent rather than zero.
    pub cohorts: Vec<AggregatedCohortResult>,
    /// The audit trail: rejected queries, dropped cohorts, partial
    /// collection, translation failures.
    pub errors: Vec<String>,
    /// Whether the batch failed as a whole. A batch that dropped every
    /// cohort is reported distinctly from one that had nothing to report.
    pub hard_failure: bool,
}
