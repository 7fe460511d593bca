//! The validate phase: per-cohort query checking and normalization.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::state_machine::{
    events::{DispatchOrder, DispatchSet, DispatchUpdate},
    phases::{Execute, Phase, PhaseName, PhaseState, Shared},
    BatchError,
    StateMachine,
};
use fedquery_core::{
    query,
    study::QueryMode,
};

/// The validate state.
#[derive(Debug)]
pub struct Validate;

#[async_trait]
impl Phase for PhaseState<Validate> {
    const NAME: PhaseName = PhaseName::Validate;

    /// Checks every cohort query against the required prefix and, in
    /// identifier mode, rewrites the count projection into an identifier
    /// projection.
    ///
    /// A malformed query excludes only its own cohort: the cohort is left
    /// out of the dispatched set with an audit entry, and its siblings
    /// proceed. Only a batch with no dispatchable query left fails here.
    async fn process(&mut self) -> Result<(), BatchError> {
        let state = &mut self.shared.state;
        let prefix = state.batch.query_prefix.clone();

        let mut queries = Vec::with_capacity(state.study.cohorts.len());
        for cohort in &state.study.cohorts {
            let validated = query::check(&cohort.query, &prefix).and_then(|()| match state.mode {
                QueryMode::Count => Ok(cohort.query.clone()),
                QueryMode::Identifier => query::rewrite_for_identifiers(&cohort.query, &prefix),
            });
            match validated {
                Ok(validated) => queries.push((cohort.id.clone(), validated)),
                Err(error) => {
                    warn!("excluding cohort {} from dispatch: {}", cohort.id, error);
                    state
                        .audit
                        .record(format!("cohort {} excluded from dispatch: {}", cohort.id, error));
                }
            }
        }

        if queries.is_empty() {
            return Err(BatchError::NothingToDispatch);
        }

        info!(
            "validated {} of {} cohort queries",
            queries.len(),
            state.study.cohorts.len(),
        );
        state.queries = queries;
        Ok(())
    }

    /// Broadcasts the per-participant work orders for the transport to
    /// deliver.
    fn broadcast(&mut self) {
        let state = &self.shared.state;
        let orders = state
            .participants
            .iter()
            .map(|participant| DispatchOrder {
                organization: participant.organization.clone(),
                correlation_key: participant.correlation_key,
                mode: state.mode,
                queries: state.queries.clone(),
                bloom_filter_config: state.bloom_filter_config.clone(),
            })
            .collect();
        let set = DispatchSet {
            orders,
            ttp: state.ttp.clone(),
        };
        self.shared
            .events
            .broadcast_dispatch(DispatchUpdate::New(Arc::new(set)));
    }

    fn next(self) -> Option<StateMachine> {
        Some(PhaseState::<Execute>::new(self.shared).into())
    }
}

impl PhaseState<Validate> {
    /// Creates a new validate state.
    pub fn new(shared: Shared) -> Self {
        Self {
            private: Validate,
            shared,
        }
    }
}
