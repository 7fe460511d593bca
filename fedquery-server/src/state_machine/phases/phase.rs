use std::fmt;

use async_trait::async_trait;
use derive_more::Display;
use tracing::{error_span, info, warn};
use tracing_futures::Instrument;

use crate::state_machine::{
    batch::BatchState,
    events::EventPublisher,
    phases::Failure,
    requests::RequestReceiver,
    BatchError,
    Services,
    StateMachine,
};

/// The name of the current phase.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "Resolve")]
    Resolve,
    #[display(fmt = "Validate")]
    Validate,
    #[display(fmt = "Execute")]
    Execute,
    #[display(fmt = "Collect")]
    Collect,
    #[display(fmt = "Link")]
    Link,
    #[display(fmt = "Aggregate")]
    Aggregate,
    #[display(fmt = "Gate")]
    Gate,
    #[display(fmt = "Complete")]
    Complete,
    #[display(fmt = "Failure")]
    Failure,
}

/// A trait that must be implemented by a state in order to move to a next
/// state.
///
/// See the [module level documentation] for more details.
///
/// [module level documentation]: crate::state_machine
#[async_trait]
pub trait Phase {
    /// The name of the current phase.
    const NAME: PhaseName;

    /// Performs the tasks of this phase.
    async fn process(&mut self) -> Result<(), BatchError>;

    /// Broadcasts data of this phase (nothing by default).
    fn broadcast(&mut self) {}

    /// Moves from this phase to the next phase.
    fn next(self) -> Option<StateMachine>;
}

/// A struct that contains the batch state and the I/O interfaces that are
/// shared and accessible by all `PhaseState`s.
pub struct Shared {
    /// The batch state.
    pub(in crate::state_machine) state: BatchState,
    /// The request receiver half.
    pub(in crate::state_machine) request_rx: RequestReceiver,
    /// The event publisher.
    pub(in crate::state_machine) events: EventPublisher,
    /// The external collaborators of the batch.
    pub(in crate::state_machine) services: Services,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("state", &self.state)
            .field("request_rx", &self.request_rx)
            .field("events", &self.events)
            .finish()
    }
}

impl Shared {
    /// Creates a new shared state.
    pub fn new(
        state: BatchState,
        events: EventPublisher,
        request_rx: RequestReceiver,
        services: Services,
    ) -> Self {
        Self {
            state,
            request_rx,
            events,
            services,
        }
    }
}

/// The state corresponding to a phase of the batch protocol.
///
/// This contains the phase-dependent `private` state and the
/// phase-independent `shared` state which is carried across state
/// transitions.
pub struct PhaseState<S> {
    /// The private state.
    pub(in crate::state_machine) private: S,
    /// The shared batch state and I/O interfaces.
    pub(in crate::state_machine) shared: Shared,
}

impl<S> PhaseState<S>
where
    S: Send,
    Self: Phase,
{
    /// Runs the current phase to completion.
    ///
    /// 1. Performs the phase tasks.
    /// 2. Broadcasts the phase data.
    /// 3. Transitions to the next phase.
    pub async fn run_phase(mut self) -> Option<StateMachine> {
        let phase = Self::NAME;
        let span = error_span!("run_phase", phase = %phase);

        async move {
            info!("starting phase");
            self.shared.events.broadcast_phase(phase);

            if let Err(err) = self.process().await {
                warn!("failed to perform the phase tasks");
                return Some(self.into_failure_state(err));
            }
            self.broadcast();
            info!("phase ran successfully");

            self.next()
        }
        .instrument(span)
        .await
    }

    fn into_failure_state(self, err: BatchError) -> StateMachine {
        PhaseState::<Failure>::new(self.shared, err).into()
    }
}
