//! The privacy gate: k-anonymity enforcement on the aggregated results.

use async_trait::async_trait;
use tracing::warn;

use crate::state_machine::{
    phases::{Complete, Phase, PhaseName, PhaseState, Shared},
    BatchError,
    StateMachine,
};

/// The gate state.
#[derive(Debug)]
pub struct Gate;

#[async_trait]
impl Phase for PhaseState<Gate> {
    const NAME: PhaseName = PhaseName::Gate;

    /// Drops every cohort whose participant count is below the configured
    /// floor, with one audit entry per drop. A batch where no cohort
    /// survives is a hard failure, reported distinctly from an empty study.
    async fn process(&mut self) -> Result<(), BatchError> {
        let state = &mut self.shared.state;
        let min = state.batch.min_participating_medics;

        let (surviving, dropped): (Vec<_>, Vec<_>) = state
            .aggregated
            .drain(..)
            .partition(|result| result.participant_count >= min);

        for result in dropped {
            warn!(
                "removing result of cohort {} from batch {}: only {} of {} required sites contributed",
                result.cohort_id, state.id, result.participant_count, min,
            );
            state.audit.record(format!(
                "removed result of cohort {} because of not enough participating sites",
                result.cohort_id,
            ));
        }

        if surviving.is_empty() {
            warn!(
                "did not receive enough results from participating sites for any cohort of batch {}",
                state.id,
            );
            state
                .audit
                .record("did not receive enough results from participating sites for any cohort");
            return Err(BatchError::NotEnoughParticipation(min));
        }

        state.aggregated = surviving;
        Ok(())
    }

    fn next(self) -> Option<StateMachine> {
        Some(PhaseState::<Complete>::new(self.shared).into())
    }
}

impl PhaseState<Gate> {
    /// Creates a new gate state.
    pub fn new(shared: Shared) -> Self {
        Self {
            private: Gate,
            shared,
        }
    }
}
