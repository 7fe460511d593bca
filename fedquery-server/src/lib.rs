//! # Fedquery server: orchestration of federated feasibility batches
//!
//! This crate executes one feasibility batch at a time as a phase-structured
//! state machine: participant resolution, query validation, local execution,
//! correlation-keyed result collection, optional federated record linkage,
//! aggregation and k-anonymity gating. Sibling batches run as fully
//! independent state machines with disjoint state.
//!
//! The crate is embedded by its collaborators rather than running
//! standalone: the process scheduler drives [`StateMachine::next`], the
//! message transport feeds result submissions into the [`RequestSender`] and
//! delivers the dispatch orders published on the event pipeline, and the
//! presentation layer consumes the final [`BatchOutcome`].
//!
//! [`StateMachine::next`]: crate::state_machine::StateMachine::next
//! [`RequestSender`]: crate::state_machine::requests::RequestSender
//! [`BatchOutcome`]: crate::state_machine::batch::BatchOutcome

pub mod executor;
pub mod organizations;
pub mod settings;
pub mod state_machine;
