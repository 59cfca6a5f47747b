//! Durable run state for the Cadence orchestrator.
//!
//! Owns the persisted `RunState` document, the append-only archive document,
//! the compactor that moves overflow from one to the other, and ingestion of
//! the optional per-cycle report written by the unit-of-work.

pub mod archive_store;
pub mod cycle_report;
pub mod run_state;
pub mod run_state_store;
pub mod state_compactor;

pub use archive_store::*;
pub use cycle_report::*;
pub use run_state::*;
pub use run_state_store::*;
pub use state_compactor::*;
