//! The terminal success phase.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::state_machine::{
    batch::BatchOutcome,
    events::OutcomeUpdate,
    phases::{Phase, PhaseName, PhaseState, Shared},
    requests::CollectError,
    BatchError,
    StateMachine,
};

/// The complete state.
#[derive(Debug)]
pub struct Complete;

#[async_trait]
impl Phase for PhaseState<Complete> {
    const NAME: PhaseName = PhaseName::Complete;

    /// Publishes the batch outcome and performs a clean shutdown of the
    /// request channel, rejecting any straggler submissions.
    async fn process(&mut self) -> Result<(), BatchError> {
        let state = &mut self.shared.state;
        let outcome = BatchOutcome {
            cohorts: state.aggregated.drain(..).collect(),
            errors: state.audit.entries().to_vec(),
            hard_failure: false,
        };
        info!(
            "batch {} completed with results for {} cohort(s)",
            state.id,
            outcome.cohorts.len(),
        );
        self.shared
            .events
            .broadcast_outcome(OutcomeUpdate::New(Arc::new(outcome)));

        self.shared.request_rx.close();
        while let Some((_, _, resp_tx)) = self.shared.request_rx.try_recv() {
            let _ = resp_tx.send(Err(CollectError::NotCollecting));
        }
        Ok(())
    }

    fn next(self) -> Option<StateMachine> {
        None
    }
}

impl PhaseState<Complete> {
    /// Creates a new complete state.
    pub fn new(shared: Shared) -> Self {
        Self {
            private: Complete,
            shared,
        }
    }
}
