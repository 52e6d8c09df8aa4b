//! Live-session lifecycle.
//!
//! - [`registry`]: per-subscriber session slots with insert-if-absent semantics
//! - [`orchestrator`]: login, credential persistence, background open and teardown

pub mod orchestrator;
pub mod registry;

pub use orchestrator::{
    EstablishOutcome, LoginIntent, LoginMethod, OrchestratorConfig, SessionOrchestrator,
    TeardownOutcome,
};
pub use registry::{SessionCancelled, SessionFuture, SessionRegistry, SlotState};
