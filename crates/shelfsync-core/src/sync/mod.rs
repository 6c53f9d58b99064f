//! Synchronization engine
//!
//! - **connectivity**: debounced liveness probing
//! - **orchestrator**: drains the mutation queue and reconciles responses
//! - **status**: the user-facing status derived from both
//! - **endpoint**: REST mapping of mutations and list responses
//! - **event**: diagnostics for the UI layer

pub mod connectivity;
pub mod endpoint;
mod event;
pub mod orchestrator;
pub mod status;

pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use event::{EventSink, SyncEvent};
pub use orchestrator::{DrainReport, Orchestrator, OrchestratorState, StopReason};
pub use status::{derive_status, StatusMachine, SyncStatus};
