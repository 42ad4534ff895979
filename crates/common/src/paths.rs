// Per-user locations of relay's persisted state.

use std::io;
use std::path::{Path, PathBuf};

/// Overrides every location below with a single root directory.
pub const RELAY_HOME_ENV: &str = "RELAY_HOME";

const APP_DIR: &str = "relay";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPaths {
    pub catalog_cache: PathBuf,
    pub registry: PathBuf,
    pub proxy_log: PathBuf,
    pub log_dir: PathBuf,
    pub user_config: PathBuf,
}

impl RelayPaths {
    /// Resolve from `RELAY_HOME` when set, otherwise from the platform directories.
    pub fn from_env() -> io::Result<Self> {
        match std::env::var_os(RELAY_HOME_ENV) {
            Some(home) if !home.is_empty() => Ok(Self::under(PathBuf::from(home))),
            _ => Self::platform(),
        }
    }

    /// Everything rooted at `home`.
    pub fn under(home: impl AsRef<Path>) -> Self {
        let home = home.as_ref();
        Self {
            catalog_cache: home.join("cache").join("catalog.json"),
            registry: home.join("run").join("proxy.json"),
            proxy_log: home.join("run").join("proxy.log"),
            log_dir: home.join("logs"),
            user_config: home.join("config.toml"),
        }
    }

    fn platform() -> io::Result<Self> {
        let cache = dirs::cache_dir().ok_or_else(|| missing_dir("cache"))?;
        let runtime = dirs::runtime_dir().unwrap_or_else(|| cache.clone());
        let data = dirs::data_local_dir().ok_or_else(|| missing_dir("data"))?;
        let config = dirs::config_dir().ok_or_else(|| missing_dir("config"))?;

        Ok(Self {
            catalog_cache: cache.join(APP_DIR).join("catalog.json"),
            registry: runtime.join(APP_DIR).join("proxy.json"),
            proxy_log: runtime.join(APP_DIR).join("proxy.log"),
            log_dir: data.join(APP_DIR).join("logs"),
            user_config: config.join(APP_DIR).join("config.toml"),
        })
    }
}

fn missing_dir(kind: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!(
            "Cannot determine the user {} directory; set {} to choose a location",
            kind, RELAY_HOME_ENV
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_roots_every_path() {
        let paths = RelayPaths::under("/tmp/relay-home");
        for path in [
            &paths.catalog_cache,
            &paths.registry,
            &paths.proxy_log,
            &paths.log_dir,
            &paths.user_config,
        ] {
            assert!(path.starts_with("/tmp/relay-home"), "{}", path.display());
        }
        assert_eq!(paths.registry.file_name().unwrap(), "proxy.json");
    }
}
