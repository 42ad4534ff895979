// Durable file replacement: temp file + fsync + rename + directory fsync.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(target_family = "unix")]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

/// Permission bits applied when creating the parent directory and the file.
#[derive(Debug, Clone, Copy)]
pub struct AtomicWriteOptions {
    pub dir_mode: u32,
    pub file_mode: u32,
}

impl Default for AtomicWriteOptions {
    fn default() -> Self {
        Self {
            dir_mode: 0o755,
            file_mode: 0o644,
        }
    }
}

impl AtomicWriteOptions {
    /// Owner-only permissions, used for runtime state such as the process registry.
    pub fn private() -> Self {
        Self {
            dir_mode: 0o700,
            file_mode: 0o600,
        }
    }
}

/// Replace `path` with `contents` so that readers observe either the old file or
/// the complete new one, never a partial write.
///
/// The temp file lives next to the target (same filesystem, so `rename` is atomic)
/// and carries the writer's pid plus a timestamp; concurrent writers never share a
/// temp path and the last rename wins.
pub fn write_atomic(path: &Path, contents: &[u8], options: AtomicWriteOptions) -> io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    create_dir(parent, options.dir_mode)?;

    let temp_path = temp_path_for(path);
    let result = write_and_rename(&temp_path, path, contents, options.file_mode);
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
        return result;
    }

    // fsync directory so the rename itself is durable
    #[cfg(target_family = "unix")]
    {
        let dir = File::open(parent)?;
        dir.sync_all()?;
    }

    Ok(())
}

fn write_and_rename(temp: &Path, target: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(target_family = "unix")]
    options.mode(mode);
    #[cfg(not(target_family = "unix"))]
    let _ = mode;

    let mut file = options.open(temp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(temp, target)
}

#[cfg(target_family = "unix")]
fn create_dir(dir: &Path, mode: u32) -> io::Result<()> {
    fs::DirBuilder::new().mode(mode).recursive(true).create(dir)
}

#[cfg(not(target_family = "unix"))]
fn create_dir(dir: &Path, _mode: u32) -> io::Result<()> {
    fs::create_dir_all(dir)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "relay".to_string());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    path.with_file_name(format!(".{}.{}.{}.tmp", name, std::process::id(), nanos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_atomic_creates_parent_and_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("nested/dir/state.json");

        write_atomic(&target, b"{\"a\":1}", AtomicWriteOptions::default()).unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "{\"a\":1}");
        let leftovers: Vec<_> = fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn write_atomic_replaces_existing_content() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("state.json");
        fs::write(&target, "old").unwrap();

        write_atomic(&target, b"new", AtomicWriteOptions::default()).unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "new");
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn private_options_restrict_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let target = temp.path().join("run/registry.json");
        write_atomic(&target, b"{}", AtomicWriteOptions::private()).unwrap();

        let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
