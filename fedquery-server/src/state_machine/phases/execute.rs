//! The execute phase: the local site's own query execution.
//!
//! The engine coordinates the batch but is usually also one of the
//! participating sites; this phase produces the local site's results and
//! records them under the local correlation key. When the local organization
//! is not a participant (pure coordination roles), the phase is a no-op.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{
    executor,
    state_machine::{
        phases::{Collect, Phase, PhaseName, PhaseState, Shared},
        BatchError,
        StateMachine,
    },
};
use fedquery_core::{
    bloomfilter::RecordBloomFilterGenerator,
    result::{SitePayload, SiteResult},
    study::QueryMode,
    translation,
};

/// The execute state.
#[derive(Debug)]
pub struct Execute;

#[async_trait]
impl Phase for PhaseState<Execute> {
    const NAME: PhaseName = PhaseName::Execute;

    async fn process(&mut self) -> Result<(), BatchError> {
        let local = self.shared.services.organizations.local_identifier();
        let local_key = match self.shared.state.participant_by_organization(&local) {
            Some(participant) => participant.correlation_key,
            None => {
                debug!("local organization is not a participant, nothing to execute");
                return Ok(());
            }
        };

        let mut results = executor::execute_queries(
            self.shared.services.repository.as_ref(),
            &local,
            &self.shared.state.queries,
            self.shared.state.mode,
        )
        .await;

        if self.shared.state.mode == QueryMode::Identifier {
            results = self.pseudonymize(results)?;
        }

        info!(
            "recorded {} local results under the local correlation key",
            results.len(),
        );
        self.shared.state.satisfied.insert(local_key);
        self.shared.state.accepted.extend(results);
        Ok(())
    }

    fn next(self) -> Option<StateMachine> {
        Some(PhaseState::<Collect>::new(self.shared).into())
    }
}

impl PhaseState<Execute> {
    /// Creates a new execute state.
    pub fn new(shared: Shared) -> Self {
        Self {
            private: Execute,
            shared,
        }
    }

    /// Replaces every raw identifier row set with its pseudonymized form
    /// before it enters the batch state.
    fn pseudonymize(&mut self, results: Vec<SiteResult>) -> Result<Vec<SiteResult>, BatchError> {
        let state = &mut self.shared.state;
        let config = state
            .bloom_filter_config
            .as_ref()
            .ok_or(BatchError::Internal("identifier mode without linkage secrets"))?;
        let resolver = self
            .shared
            .services
            .identities
            .as_ref()
            .ok_or(BatchError::Internal("identifier mode without identity resolver"))?;
        let generator = RecordBloomFilterGenerator::from_config(
            config,
            state.linkage.record_filter_length,
            state.linkage.field_weights,
            state.linkage.field_lengths,
        );

        let mut pseudonymized = Vec::with_capacity(results.len());
        for result in results {
            let payload = match result.payload {
                SitePayload::Rows(rows) => {
                    match translation::pseudonymize(&rows, &generator, resolver.as_ref()) {
                        Ok((translated, dropped)) => {
                            for error in dropped {
                                warn!(
                                    "dropping row of cohort {} from the filter set: {}",
                                    result.cohort_id, error,
                                );
                                state.audit.record(format!(
                                    "cohort {}: row dropped during pseudonymization: {}",
                                    result.cohort_id, error,
                                ));
                            }
                            SitePayload::Rows(translated)
                        }
                        Err(error) => {
                            warn!(
                                "pseudonymization of cohort {} failed: {}",
                                result.cohort_id, error,
                            );
                            SitePayload::Failed(error.to_string())
                        }
                    }
                }
                payload => payload,
            };
            pseudonymized.push(SiteResult {
                organization: result.organization,
                cohort_id: result.cohort_id,
                payload,
            });
        }
        Ok(pseudonymized)
    }
}
