//! Loop state: the immutable record threaded through one message turn.
//!
//! Every transition produces a new [`AgentLoopState`]; nothing in the core
//! mutates a shared state. Middleware keeps its own typed records inside the
//! state via [`SlotMap`]; see [`slots`] for the canonical set.

mod loop_state;
pub mod slots;

pub use loop_state::{AgentLoopState, TerminationReason};
pub use slots::{
    BatchPermissionState, CircuitBreakerState, ContinuationPermissionState, ErrorTrackingState,
    MiddlewareSlot, SlotMap, TotalErrorThresholdState, TurnPermissionState,
};
