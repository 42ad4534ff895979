// External program lookup.

use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use tracing::debug;

use crate::errors::{LaunchError, LaunchResult};

/// Resolve `program` on `PATH`, or check it directly when it is a path.
pub fn resolve_program(program: &str) -> LaunchResult<PathBuf> {
    let missing = || LaunchError::DependencyMissing {
        program: program.to_string(),
    };

    if program.contains('/') || program.contains(MAIN_SEPARATOR) {
        let path = Path::new(program);
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(missing())
        };
    }

    let resolved = which::which(program).map_err(|_| missing())?;
    debug!(program, path = %resolved.display(), "resolved program");
    Ok(resolved)
}
