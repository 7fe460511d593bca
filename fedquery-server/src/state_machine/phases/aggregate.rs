//! The aggregate phase: combining per-site values into one result per
//! cohort.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::info;

use crate::state_machine::{
    phases::{Gate, Phase, PhaseName, PhaseState, Shared},
    BatchError,
    StateMachine,
};
use fedquery_core::{
    result::{AggregatedCohortResult, SitePayload},
    study::QueryMode,
};

/// The aggregate state.
#[derive(Debug)]
pub struct Aggregate;

#[async_trait]
impl Phase for PhaseState<Aggregate> {
    const NAME: PhaseName = PhaseName::Aggregate;

    /// Groups the accepted results by cohort and combines them into one
    /// (participant count, value) pair each.
    ///
    /// A cohort without any accepted result is absent from the output
    /// rather than reported as zero; presence is itself a signal. Site
    /// identities are consumed here and do not travel further.
    async fn process(&mut self) -> Result<(), BatchError> {
        let state = &mut self.shared.state;

        let aggregated = match state.mode {
            QueryMode::Identifier => state.linked.drain(..).collect(),
            QueryMode::Count => {
                let mut aggregated = Vec::new();
                for (cohort_id, _) in &state.queries {
                    let results: Vec<_> = state
                        .accepted
                        .iter()
                        .filter(|result| result.cohort_id == *cohort_id)
                        .collect();
                    if results.is_empty() {
                        continue;
                    }

                    // no double counting: each site reports once per key
                    let contributing: BTreeSet<_> = results
                        .iter()
                        .filter(|result| result.payload.is_contributing())
                        .map(|result| &result.organization)
                        .collect();
                    let value = results
                        .iter()
                        .map(|result| match &result.payload {
                            SitePayload::Count(count) => *count,
                            _ => 0,
                        })
                        .sum();

                    aggregated.push(AggregatedCohortResult {
                        cohort_id: cohort_id.clone(),
                        participant_count: contributing.len() as u64,
                        value,
                    });
                }
                aggregated
            }
        };

        info!("aggregated results for {} cohort(s)", aggregated.len());
        state.aggregated = aggregated;
        Ok(())
    }

    fn next(self) -> Option<StateMachine> {
        Some(PhaseState::<Gate>::new(self.shared).into())
    }
}

impl PhaseState<Aggregate> {
    /// Creates a new aggregate state.
    pub fn new(shared: Shared) -> Self {
        Self {
            private: Aggregate,
            shared,
        }
    }
}
