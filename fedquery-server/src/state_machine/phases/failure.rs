//! The terminal failure phase.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::state_machine::{
    batch::BatchOutcome,
    events::OutcomeUpdate,
    phases::{Phase, PhaseName, PhaseState, Shared},
    requests::CollectError,
    BatchError,
    StateMachine,
};

/// The failure state.
#[derive(Debug)]
pub struct Failure {
    error: BatchError,
}

#[async_trait]
impl Phase for PhaseState<Failure> {
    const NAME: PhaseName = PhaseName::Failure;

    /// Publishes the hard-failure outcome and performs a clean shutdown of
    /// the request channel.
    ///
    /// Every path into this phase is batch-fatal: pre-dispatch validation
    /// failures and a privacy gate that dropped every cohort. The failure is
    /// reported as an explicit outcome, never as an empty success.
    async fn process(&mut self) -> Result<(), BatchError> {
        let state = &mut self.shared.state;
        warn!("batch {} failed: {}", state.id, self.private.error);

        let mut errors = state.audit.entries().to_vec();
        errors.push(self.private.error.to_string());
        let outcome = BatchOutcome {
            cohorts: Vec::new(),
            errors,
            hard_failure: true,
        };
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

impl PhaseState<Failure> {
    /// Creates a new failure state.
    pub fn new(shared: Shared, error: BatchError) -> Self {
        Self {
            private: Failure { error },
            shared,
        }
    }
}
