//! The state machine that executes one feasibility batch.
//!
//! # Overview
//!
//! A batch moves through one phase per protocol stage:
//!
//! ```text
//! Resolve -> Validate -> Execute -> Collect -> [Link] -> Aggregate -> Gate -> Complete
//!     \          \           \          \         \           \         \
//!      +----------+-----------+----------+---------+-----------+--------+--> Failure
//! ```
//!
//! **Resolve** validates the study against the configured minima, resolves
//! the participating organizations and mints one fresh correlation key per
//! participant (plus the shared linkage secrets on the record-linkage path).
//!
//! **Validate** checks every cohort query against the required prefix,
//! rewrites count projections into identifier projections in identifier
//! mode, and broadcasts the per-participant work orders for the transport.
//!
//! **Execute** runs the validated queries against the local site's data
//! repository and records the local results; in identifier mode the raw
//! rows are pseudonymized into record Bloom filters before they enter the
//! batch state.
//!
//! **Collect** receives the remote sites' submissions over the batch's
//! request channel until every participant reported or the collection
//! deadline elapsed. Unknown and duplicate correlation keys are rejected as
//! anomalies without affecting the batch.
//!
//! **Link** (identifier mode only) matches the pseudonymized records across
//! sites into distinct persons per cohort.
//!
//! **Aggregate** combines the per-site values into one (participant count,
//! value) pair per cohort.
//!
//! **Gate** drops every cohort below the k-anonymity floor and fails the
//! batch hard if nothing survives.
//!
//! **Complete** / **Failure** publish the batch outcome and shut the
//! request channel down.
//!
//! # Requests
//!
//! Initializing a batch via [`BatchInitializer::init()`] creates the batch's
//! request channel. The sender half ([`RequestSender`]) is handed to the
//! transport for result submissions; the receiver half is owned by the state
//! machine, which serializes all submissions through the one task that runs
//! the batch.
//!
//! # Events
//!
//! The state machine publishes phase changes, the dispatch orders and the
//! final outcome through the [`EventSubscriber`] returned by
//! [`BatchInitializer::init()`].

pub mod batch;
pub mod events;
pub mod phases;
pub mod requests;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use derive_more::From;
use thiserror::Error;

use self::{
    batch::BatchState,
    events::{EventPublisher, EventSubscriber},
    phases::{
        Aggregate,
        Collect,
        Complete,
        Execute,
        Failure,
        Gate,
        Link,
        PhaseName,
        PhaseState,
        Resolve,
        Shared,
        Validate,
    },
    requests::{RequestReceiver, RequestSender},
};
use crate::{
    executor::CohortRepository,
    organizations::OrganizationProvider,
    settings::{BatchSettings, LinkageSettings},
};
use fedquery_core::{study::StudyDefinition, translation::IdentityResolver};

/// Error returned when a batch cannot make progress.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("initializing crypto library failed")]
    CryptoInit,

    #[error("study defines {got} cohort(s), but at least {min} are required")]
    TooFewCohorts { min: usize, got: usize },

    #[error("study lists {got} participating organization(s), but at least {min} are required")]
    TooFewParticipants { min: u64, got: usize },

    #[error("record linkage requested but no trusted third party referenced")]
    MissingTtp,

    #[error("organization reference '{0}' could not be resolved")]
    ReferenceNotFound(String),

    #[error("no validated query left to dispatch")]
    NothingToDispatch,

    #[error("no cohort reached the minimum of {0} participating organizations")]
    NotEnoughParticipation(u64),

    #[error("request channel closed while collecting results")]
    RequestChannelClosed,

    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// The external collaborators a batch needs.
#[derive(Clone)]
pub struct Services {
    /// Resolution of organization references.
    pub organizations: Arc<dyn OrganizationProvider + Send + Sync>,
    /// The local site's data repository.
    pub repository: Arc<dyn CohortRepository + Send + Sync>,
    /// The local site's patient index; required on the record-linkage path.
    pub identities: Option<Arc<dyn IdentityResolver + Send + Sync>>,
}

/// The state machine with all its states.
#[derive(From)]
pub enum StateMachine {
    Resolve(PhaseState<Resolve>),
    Validate(PhaseState<Validate>),
    Execute(PhaseState<Execute>),
    Collect(PhaseState<Collect>),
    Link(PhaseState<Link>),
    Aggregate(PhaseState<Aggregate>),
    Gate(PhaseState<Gate>),
    Complete(PhaseState<Complete>),
    Failure(PhaseState<Failure>),
}

impl StateMachine {
    /// Moves the [`StateMachine`] to the next state and consumes the current
    /// one. Returns the next state, or `None` once a terminal phase has run.
    pub async fn next(self) -> Option<Self> {
        match self {
            StateMachine::Resolve(state) => state.run_phase().await,
            StateMachine::Validate(state) => state.run_phase().await,
            StateMachine::Execute(state) => state.run_phase().await,
            StateMachine::Collect(state) => state.run_phase().await,
            StateMachine::Link(state) => state.run_phase().await,
            StateMachine::Aggregate(state) => state.run_phase().await,
            StateMachine::Gate(state) => state.run_phase().await,
            StateMachine::Complete(state) => state.run_phase().await,
            StateMachine::Failure(state) => state.run_phase().await,
        }
    }

    /// Runs the batch to its terminal state.
    pub async fn run(mut self) {
        while let Some(machine) = self.next().await {
            self = machine;
        }
    }
}

/// Initializes a new [`StateMachine`] for one batch.
pub struct BatchInitializer {
    batch: BatchSettings,
    linkage: LinkageSettings,
    study: StudyDefinition,
    services: Services,
}

impl BatchInitializer {
    /// Creates a new initializer from validated settings snapshots.
    pub fn new(
        batch: BatchSettings,
        linkage: LinkageSettings,
        study: StudyDefinition,
        services: Services,
    ) -> Self {
        Self {
            batch,
            linkage,
            study,
            services,
        }
    }

    /// Creates the batch state, the request channel and the event pipeline,
    /// and returns the initial state machine.
    ///
    /// # Errors
    /// Fails if the crypto library cannot be initialized, or if the study
    /// requires record linkage but no identity resolver was provided.
    pub fn init(self) -> Result<(StateMachine, RequestSender, EventSubscriber), BatchError> {
        // crucial: init must be called before anything else in this module
        sodiumoxide::init().or(Err(BatchError::CryptoInit))?;

        let Self {
            batch,
            linkage,
            study,
            services,
        } = self;

        if study.needs_record_linkage && services.identities.is_none() {
            return Err(BatchError::Internal(
                "record linkage requires an identity resolver",
            ));
        }

        let state = BatchState::new(study, batch, linkage);
        let (request_rx, request_tx) = RequestReceiver::new();
        let (publisher, subscriber) = EventPublisher::init(state.id, PhaseName::Resolve);
        let shared = Shared::new(state, publisher, request_rx, services);

        Ok((
            PhaseState::<Resolve>::new(shared).into(),
            request_tx,
            subscriber,
        ))
    }
}
