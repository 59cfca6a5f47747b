//! Runtime components of the Cadence orchestrator: singleton locking, child
//! process supervision, the completion heuristic, the cycle scheduler, and
//! operator-facing reports.

pub mod completion_runtime;
pub mod lock_runtime;
pub mod orchestrator_config;
pub mod run_report_runtime;
pub mod scheduler_runtime;
pub mod supervisor_runtime;

pub use completion_runtime::*;
pub use lock_runtime::*;
pub use orchestrator_config::*;
pub use run_report_runtime::*;
pub use scheduler_runtime::*;
pub use supervisor_runtime::*;
