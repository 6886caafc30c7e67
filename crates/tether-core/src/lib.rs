//! Domain types shared by every tether crate: identifiers, the session
//! model and its state machine, typed events, and the narrow traits the
//! orchestrator uses to reach its external collaborators.

pub mod errors;
pub mod events;
pub mod ids;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod state;
