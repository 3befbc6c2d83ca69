//! Pipeline state machine: the single serialization point of the orchestrator.

pub mod machine;
pub mod types;

pub use machine::{StateMachine, SubscriptionId, TransitionError, TransitionHandler};
pub use types::{
    MachineSnapshot, PipelineState, StateSnapshot, StateTimeouts, TransitionEvent, Trigger,
};
