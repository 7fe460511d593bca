//! The resolve phase: pre-dispatch validation and participant resolution.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    organizations::OrganizationProvider,
    state_machine::{
        phases::{Phase, PhaseName, PhaseState, Shared, Validate},
        BatchError,
        StateMachine,
    },
};
use fedquery_core::{
    bloomfilter::BloomFilterConfig,
    study::{OrganizationRef, Participant},
    OrganizationIdentifier,
};

/// The resolve state.
#[derive(Debug)]
pub struct Resolve;

#[async_trait]
impl Phase for PhaseState<Resolve> {
    const NAME: PhaseName = PhaseName::Resolve;

    /// Validates the study against the configured minima, resolves every
    /// organization reference and mints the batch's correlation keys (plus
    /// the shared linkage secrets on the record-linkage path).
    ///
    /// Nothing has been dispatched yet, so every error here fails the batch
    /// before any site sees a request.
    async fn process(&mut self) -> Result<(), BatchError> {
        let state = &mut self.shared.state;

        if state.study.cohorts.len() < state.batch.min_cohort_definitions {
            return Err(BatchError::TooFewCohorts {
                min: state.batch.min_cohort_definitions,
                got: state.study.cohorts.len(),
            });
        }
        if (state.study.participating_medics.len() as u64) < state.batch.min_participating_medics {
            return Err(BatchError::TooFewParticipants {
                min: state.batch.min_participating_medics,
                got: state.study.participating_medics.len(),
            });
        }

        let organizations = &self.shared.services.organizations;
        let mut participants = Vec::with_capacity(state.study.participating_medics.len());
        for reference in &state.study.participating_medics {
            participants.push(Participant::new(resolve(organizations.as_ref(), reference)?));
        }

        info!(
            "resolved {} participating organizations for study {}",
            participants.len(),
            state.study.id,
        );
        state.participants = participants;

        if state.study.needs_record_linkage {
            let reference = state
                .study
                .participating_ttp
                .as_ref()
                .ok_or(BatchError::MissingTtp)?;
            state.ttp = Some(Participant::new(resolve(organizations.as_ref(), reference)?));
            // fresh secrets per batch; reusing them across studies would
            // allow linking pseudonyms between studies
            state.bloom_filter_config = Some(BloomFilterConfig::generate());
            debug!("minted record-linkage secrets");
        }

        Ok(())
    }

    fn next(self) -> Option<StateMachine> {
        Some(PhaseState::<Validate>::new(self.shared).into())
    }
}

impl PhaseState<Resolve> {
    /// Creates a new resolve state.
    pub fn new(shared: Shared) -> Self {
        Self {
            private: Resolve,
            shared,
        }
    }
}

fn resolve(
    organizations: &(dyn OrganizationProvider + Send + Sync),
    reference: &OrganizationRef,
) -> Result<OrganizationIdentifier, BatchError> {
    organizations
        .resolve(reference)
        .ok_or_else(|| BatchError::ReferenceNotFound(reference.as_str().to_string()))
}
