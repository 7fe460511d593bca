//! The collect phase: correlation-keyed fan-in of site results.
//!
//! One submission per participant, accepted exactly once per correlation
//! key. The phase owns the batch's request channel, so submissions are
//! processed strictly one at a time regardless of how the transport delivers
//! them; there is no locking because there is nothing to race against.

use async_trait::async_trait;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::state_machine::{
    phases::{Aggregate, Link, Phase, PhaseName, PhaseState, Shared},
    requests::{CollectError, ResultSubmission},
    BatchError,
    StateMachine,
};
use fedquery_core::{
    result::{SitePayload, SiteResult},
    study::QueryMode,
};

/// The collect state.
#[derive(Debug)]
pub struct Collect {
    /// The number of submissions accepted during this phase.
    accepted: u64,
    /// The number of submissions rejected as anomalies.
    rejected: u64,
}

#[async_trait]
impl Phase for PhaseState<Collect> {
    const NAME: PhaseName = PhaseName::Collect;

    /// Receives submissions until every participant has reported, or until
    /// the collection deadline forces the batch onward with whatever
    /// arrived. Partial collection is not an error; the privacy gate decides
    /// downstream whether enough sites contributed.
    async fn process(&mut self) -> Result<(), BatchError> {
        if self.pending_count() == 0 {
            debug!("all participants have already reported");
            return Ok(());
        }

        let deadline = self.shared.state.batch.collect_timeout_secs;
        if deadline == 0 {
            self.collect_until_complete().await?;
        } else {
            match timeout(Duration::from_secs(deadline), self.collect_until_complete()).await {
                Ok(completed) => completed?,
                Err(_elapsed) => {
                    let pending = self.pending_count();
                    warn!(
                        "collection deadline elapsed, proceeding with {} of {} participants",
                        self.shared.state.participants.len() - pending,
                        self.shared.state.participants.len(),
                    );
                    self.shared.state.audit.record(format!(
                        "collection deadline elapsed, {} participant(s) did not report",
                        pending,
                    ));
                }
            }
        }

        info!(
            "{} submissions accepted, {} rejected",
            self.private.accepted, self.private.rejected,
        );
        Ok(())
    }

    fn next(self) -> Option<StateMachine> {
        match self.shared.state.mode {
            QueryMode::Identifier => Some(PhaseState::<Link>::new(self.shared).into()),
            QueryMode::Count => Some(PhaseState::<Aggregate>::new(self.shared).into()),
        }
    }
}

impl PhaseState<Collect> {
    /// Creates a new collect state.
    pub fn new(shared: Shared) -> Self {
        Self {
            private: Collect {
                accepted: 0,
                rejected: 0,
            },
            shared,
        }
    }

    /// The number of participants that have not reported yet.
    fn pending_count(&self) -> usize {
        self.shared
            .state
            .participants
            .iter()
            .filter(|participant| {
                !self
                    .shared
                    .state
                    .satisfied
                    .contains(&participant.correlation_key)
            })
            .count()
    }

    /// Processes submissions until the batch is complete.
    async fn collect_until_complete(&mut self) -> Result<(), BatchError> {
        while self.pending_count() > 0 {
            let (submission, span, resp_tx) = self
                .shared
                .request_rx
                .recv()
                .await
                .ok_or(BatchError::RequestChannelClosed)?;
            let _enter = span.enter();

            let outcome = self.handle_submission(submission);
            match &outcome {
                Ok(()) => self.private.accepted += 1,
                Err(error) => {
                    self.private.rejected += 1;
                    warn!("discarding result submission: {}", error);
                }
            }
            // the submitter may have given up on the response
            let _ = resp_tx.send(outcome);
        }
        Ok(())
    }

    /// Validates one submission and folds it into the batch state.
    fn handle_submission(&mut self, submission: ResultSubmission) -> Result<(), CollectError> {
        let state = &mut self.shared.state;

        let participant = state
            .participant_by_key(&submission.correlation_key)
            .ok_or(CollectError::UnknownKey)?;
        let organization = participant.organization.clone();
        if state.satisfied.contains(&submission.correlation_key) {
            return Err(CollectError::DuplicateKey);
        }

        for result in &submission.results {
            if !state.is_known_cohort(&result.cohort_id) {
                return Err(CollectError::UnknownCohort);
            }
            let mode_matches = match (&result.payload, state.mode) {
                (SitePayload::Failed(_), _) => true,
                (SitePayload::Count(_), QueryMode::Count) => true,
                (SitePayload::Rows(_), QueryMode::Identifier) => true,
                _ => false,
            };
            if !mode_matches {
                return Err(CollectError::ModeMismatch);
            }
        }

        debug!("accepting submission of organization {}", organization);
        state.satisfied.insert(submission.correlation_key);
        // the key, not the submitted organization field, decides attribution
        state
            .accepted
            .extend(submission.results.into_iter().map(|result| SiteResult {
                organization: organization.clone(),
                cohort_id: result.cohort_id,
                payload: result.payload,
            }));
        Ok(())
    }
}
