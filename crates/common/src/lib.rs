// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod fs;
pub mod paths;
pub mod process_registry;
pub mod process_utils;

pub use paths::RelayPaths;
pub use process_registry::{ProcessRegistry, RegistryLock, TrackedProcess};
