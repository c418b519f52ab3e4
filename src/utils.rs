//! Directory management following the XDG Base Directory specification
//!
//! # Directory Structure
//!
//! - Data: `~/.local/share/vpn-bypass/` - configuration and app selection
//! - State: `~/.local/state/vpn-bypass/` - audit log, log files
//!
//! # Example
//!
//! ```no_run
//! use vpn_bypass::utils::{get_data_dir, ensure_dirs};
//!
//! // Ensure directories exist before use
//! ensure_dirs().expect("Failed to create directories");
//!
//! if let Some(data_path) = get_data_dir() {
//!     // Load configuration from data_path
//! }
//! ```

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "vpn-bypass", "vpn-bypass")
}

pub fn get_data_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

/// Creates the data and state directories with mode 0700
pub fn ensure_dirs() -> std::io::Result<()> {
    use std::fs::DirBuilder;
    use std::os::unix::fs::DirBuilderExt;

    let mut builder = DirBuilder::new();
    builder.mode(0o700); // User read/write/execute only
    builder.recursive(true);

    if let Some(dir) = get_data_dir() {
        builder.create(dir)?;
    }
    if let Some(dir) = get_state_dir() {
        builder.create(dir)?;
    }
    Ok(())
}

/// Replaces `path` with `contents` using an atomic write pattern.
/// 1. Writes to `<path>.tmp` next to the target.
/// 2. Sets restrictive permissions (0o600) at creation, so the file is never
///    world-readable.
/// 3. Atomically renames to the target path.
pub async fn write_private_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use tokio::fs::OpenOptions;
    use tokio::io::AsyncWriteExt;

    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(&temp_path)
        .await?;
    file.write_all(contents).await?;
    file.sync_all().await?;

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                format!(
                    "Disk full: cannot save {}. Free up space and try again.",
                    path.display()
                ),
            )
        } else {
            e
        }
    })
}
