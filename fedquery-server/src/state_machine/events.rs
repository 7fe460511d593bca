//! This module provides the [`StateMachine`]'s `Events`, `EventSubscriber`
//! and `EventPublisher` types.
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

use std::sync::Arc;

use tokio::sync::watch;

use crate::state_machine::{batch::BatchOutcome, phases::PhaseName};
use fedquery_core::{
    bloomfilter::BloomFilterConfig,
    study::{Participant, QueryMode},
    BatchId,
    CohortId,
    CorrelationKey,
    OrganizationIdentifier,
};

/// An event emitted by the batch state machine.
#[derive(Clone, Debug, PartialEq)]
pub struct Event<E> {
    /// Metadata that associates this event to the batch in which it is
    /// emitted.
    pub batch_id: BatchId,
    /// The event itself.
    pub event: E,
}

/// The work order the transport must deliver to one participating site.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchOrder {
    /// The site the order is addressed to.
    pub organization: OrganizationIdentifier,
    /// The key the site must attach to its result submission.
    pub correlation_key: CorrelationKey,
    /// Whether the site reports counts or pseudonymized identifier rows.
    pub mode: QueryMode,
    /// The validated query per cohort.
    pub queries: Vec<(CohortId, String)>,
    /// The study's shared linkage secrets, on the record-linkage path.
    pub bloom_filter_config: Option<BloomFilterConfig>,
}

/// The full fan-out of one batch.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchSet {
    /// One order per participating site.
    pub orders: Vec<DispatchOrder>,
    /// The trusted third party, on the record-linkage path.
    pub ttp: Option<Participant>,
}

/// Dispatch update event.
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchUpdate {
    Invalidate,
    New(Arc<DispatchSet>),
}

/// Batch outcome event.
#[derive(Clone, Debug, PartialEq)]
pub enum OutcomeUpdate {
    Invalidate,
    New(Arc<BatchOutcome>),
}

/// A convenience type to emit any batch event.
#[derive(Debug)]
pub struct EventPublisher {
    batch_id: BatchId,
    phase_tx: watch::Sender<Event<PhaseName>>,
    dispatch_tx: watch::Sender<Event<DispatchUpdate>>,
    outcome_tx: watch::Sender<Event<OutcomeUpdate>>,
}

/// The `EventSubscriber` hands out `EventListener`s for any batch event.
#[derive(Debug)]
pub struct EventSubscriber {
    phase_rx: EventListener<PhaseName>,
    dispatch_rx: EventListener<DispatchUpdate>,
    outcome_rx: EventListener<OutcomeUpdate>,
}

impl EventPublisher {
    /// Initializes a new event publisher with the given initial phase.
    pub fn init(batch_id: BatchId, phase: PhaseName) -> (Self, EventSubscriber) {
        let (phase_tx, phase_rx) = watch::channel::<Event<PhaseName>>(Event {
            batch_id,
            event: phase,
        });

        let (dispatch_tx, dispatch_rx) = watch::channel::<Event<DispatchUpdate>>(Event {
            batch_id,
            event: DispatchUpdate::Invalidate,
        });

        let (outcome_tx, outcome_rx) = watch::channel::<Event<OutcomeUpdate>>(Event {
            batch_id,
            event: OutcomeUpdate::Invalidate,
        });

        let publisher = EventPublisher {
            batch_id,
            phase_tx,
            dispatch_tx,
            outcome_tx,
        };

        let subscriber = EventSubscriber {
            phase_rx: listener_from(phase_rx),
            dispatch_rx: listener_from(dispatch_rx),
            outcome_rx: listener_from(outcome_rx),
        };

        (publisher, subscriber)
    }

    fn event<T>(&self, event: T) -> Event<T> {
        Event {
            batch_id: self.batch_id,
            event,
        }
    }

    /// Emits a phase event.
    pub fn broadcast_phase(&mut self, phase: PhaseName) {
        let _ = self.phase_tx.broadcast(self.event(phase));
    }

    /// Emits a dispatch event.
    pub fn broadcast_dispatch(&mut self, update: DispatchUpdate) {
        let _ = self.dispatch_tx.broadcast(self.event(update));
    }

    /// Emits a batch outcome event.
    pub fn broadcast_outcome(&mut self, update: OutcomeUpdate) {
        let _ = self.outcome_tx.broadcast(self.event(update));
    }
}

fn listener_from<E>(receiver: watch::Receiver<Event<E>>) -> EventListener<E> {
    EventListener(receiver)
}

impl EventSubscriber {
    /// Gets a listener for new phase events.
    pub fn phase_listener(&self) -> EventListener<PhaseName> {
        self.phase_rx.clone()
    }

    /// Gets a listener for new dispatch events.
    pub fn dispatch_listener(&self) -> EventListener<DispatchUpdate> {
        self.dispatch_rx.clone()
    }

    /// Gets a listener for batch outcome events.
    pub fn outcome_listener(&self) -> EventListener<OutcomeUpdate> {
        self.outcome_rx.clone()
    }
}

/// A listener for one kind of batch event.
#[derive(Clone, Debug)]
pub struct EventListener<E>(watch::Receiver<Event<E>>);

impl<E> EventListener<E>
where
    E: Clone,
{
    /// The most recently broadcasted event.
    pub fn get_latest(&self) -> Event<E> {
        self.0.borrow().clone()
    }

    /// Waits for the next event. Returns `None` once the publisher is
    /// dropped and all events have been observed.
    pub async fn next(&mut self) -> Option<Event<E>> {
        self.0.recv().await
    }
}
