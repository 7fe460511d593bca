//! The phases of the batch state machine, one per protocol stage.

mod aggregate;
mod collect;
mod complete;
mod execute;
mod failure;
mod gate;
mod link;
mod phase;
mod resolve;
mod validate;

pub use self::{
    aggregate::Aggregate,
    collect::Collect,
    complete::Complete,
    execute::Execute,
    failure::Failure,
    gate::Gate,
    link::Link,
    phase::{Phase, PhaseName, PhaseState, Shared},
    resolve::Resolve,
    validate::Validate,
};
