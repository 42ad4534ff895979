// # -----------------------------
// # crates/supervisor/src/lib.rs
// # -----------------------------
pub mod error;
pub mod ports;
pub mod supervisor;
pub mod sweep;
pub mod terminate;

pub use error::{SupervisorError, SupervisorResult};
pub use ports::{find_free_port, is_port_free};
pub use supervisor::{ProcessSupervisor, ProxyCommand, SupervisorOptions, SupervisorState};
pub use sweep::{sweep_orphans, SweepReport};
pub use terminate::{terminate, TerminationOutcome};
