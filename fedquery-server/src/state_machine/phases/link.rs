//! The link phase: cross-site deduplication of pseudonymized records.
//!
//! Runs only on the record-linkage path. For every cohort the accepted
//! filter sets of all sites are matched into distinct persons; the cohort's
//! linked value is the size of the matched set. The matcher never sees
//! plaintext identifiers, only record Bloom filters.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::state_machine::{
    phases::{Aggregate, Phase, PhaseName, PhaseState, Shared},
    BatchError,
    StateMachine,
};
use fedquery_core::{
    linkage::{FederatedMatcher, LinkageRecord, MatchStrategy},
    result::{AggregatedCohortResult, ResultSet, SitePayload},
    translation,
    CohortId,
    OrganizationIdentifier,
};

/// The link state.
#[derive(Debug)]
pub struct Link;

#[async_trait]
impl Phase for PhaseState<Link> {
    const NAME: PhaseName = PhaseName::Link;

    async fn process(&mut self) -> Result<(), BatchError> {
        let state = &mut self.shared.state;
        let matcher = FederatedMatcher::new(MatchStrategy::Min, state.linkage.match_threshold);
        let filter_length = state.linkage.record_filter_length;

        // group the accepted row sets by cohort, in validated cohort order
        let mut by_cohort: HashMap<&CohortId, Vec<(&OrganizationIdentifier, &ResultSet)>> =
            HashMap::new();
        for result in &state.accepted {
            if let SitePayload::Rows(rows) = &result.payload {
                by_cohort
                    .entry(&result.cohort_id)
                    .or_default()
                    .push((&result.organization, rows));
            }
        }

        let mut linked = Vec::new();
        let mut audit_entries = Vec::new();
        for (cohort_id, _) in &state.queries {
            let site_sets = match by_cohort.get(cohort_id) {
                Some(site_sets) => site_sets,
                None => continue,
            };
            debug!("matching {} filter sets for cohort {}", site_sets.len(), cohort_id);

            let mut lists = Vec::with_capacity(site_sets.len());
            for (organization, rows) in site_sets {
                match translation::records_from_result_set(organization, rows, filter_length) {
                    Ok((records, dropped)) => {
                        for error in dropped {
                            warn!("dropping record of cohort {}: {}", cohort_id, error);
                            audit_entries
                                .push(format!("cohort {}: record dropped: {}", cohort_id, error));
                        }
                        lists.push(records);
                    }
                    Err(error) => {
                        warn!(
                            "dropping a site's filter set for cohort {}: {}",
                            cohort_id, error,
                        );
                        audit_entries.push(format!(
                            "cohort {}: filter set dropped: {}",
                            cohort_id, error,
                        ));
                    }
                }
            }

            let participant_count = lists.iter().filter(|list| !list.is_empty()).count() as u64;
            let matched = matcher.match_records(lists);
            linked.push(AggregatedCohortResult {
                cohort_id: cohort_id.clone(),
                participant_count,
                value: matched.len() as u64,
            });
        }

        for entry in audit_entries {
            state.audit.record(entry);
        }
        state.linked = linked;
        Ok(())
    }

    fn next(self) -> Option<StateMachine> {
        Some(PhaseState::<Aggregate>::new(self.shared).into())
    }
}

impl PhaseState<Link> {
    /// Creates a new link state.
    pub fn new(shared: Shared) -> Self {
        Self {
            private: Link,
            shared,
        }
    }
}
