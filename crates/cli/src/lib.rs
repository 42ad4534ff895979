//! # relay launcher library
//!
//! Everything behind the `launch` binary: configuration, logging, the error
//! taxonomy, signal-driven cleanup and the launch state machine.

pub mod cleanup;
pub mod config;
pub mod deps;
pub mod errors;
pub mod logging;
pub mod orchestrator;
pub mod plan;
pub mod selector;

pub use cleanup::{CleanupGuard, Finalizer, ShutdownSignal};
pub use config::{HandoffMode, LaunchConfig};
pub use errors::{ExitCode, LaunchError, LaunchResult};
pub use orchestrator::{LaunchOrchestrator, LaunchOutcome, LaunchRequest, LaunchStage};
pub use plan::LaunchPlan;
pub use selector::{Choice, PromptSelector, ScriptedSelector, Selector};
