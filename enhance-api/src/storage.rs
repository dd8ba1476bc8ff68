//! Temp file handling for staged uploads and enhanced outputs.
//!
//! Every request stages its upload as `temp_<uuid><ext>` in the configured temp directory and
//! writes its result next to it. Nothing in here ever fails a request: deletions go through
//! [`remove_quietly`], which ignores files that are already gone and logs anything else.

use scopeguard::ScopeGuard;
use std::{
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of every staged upload. The startup sweep only touches files carrying it.
pub const STAGED_PREFIX: &str = "temp_";

/// Owns the temp directory.
#[derive(Debug, Clone)]
pub struct TempStorage {
    dir: PathBuf,
}

impl TempStorage {
    /// Creates the directory (and parents) if it does not exist yet.
    pub async fn prepare(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "Temp directory ready");
        Ok(Self { dir })
    }

    /// A fresh staging path for an upload. `extension` includes the leading dot and keeps the
    /// caller's casing.
    pub fn staging_path(&self, extension: &str) -> PathBuf {
        self.dir.join(format!("{STAGED_PREFIX}{}{extension}", Uuid::new_v4()))
    }

    /// Removes staged uploads left behind by a previous process. Returns how many were found.
    pub async fn sweep(&self) -> io::Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut stale = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let is_staged = entry.file_name().to_str().is_some_and(|name| name.starts_with(STAGED_PREFIX));
            if is_staged && entry.file_type().await?.is_file() {
                stale.push(entry.path());
            }
        }

        let count = stale.len();
        if count > 0 {
            info!(count, dir = %self.dir.display(), "Removing stale temp files");
            cleanup(&stale);
        }
        Ok(count)
    }
}

/// Path of the enhanced output for `input`: same directory, `<stem><suffix>.png`.
///
/// The input's own extension is dropped on purpose rather than kept after the suffix: outputs are
/// always PNG-encoded, so `temp_1.jpg` becomes `temp_1_enhanced.png`, not `temp_1_enhanced.jpg`.
pub fn output_path(input: &Path, suffix: &str) -> PathBuf {
    let stem = input.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    input.with_file_name(format!("{stem}{suffix}.png"))
}

/// Deletes `path`, ignoring a missing file and logging any other failure.
pub fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed temp file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
    }
}

/// Deletes the wrapped file when dropped. Defuse with [`ScopeGuard::into_inner`].
pub type TempFileGuard = ScopeGuard<PathBuf, fn(PathBuf)>;

/// Ties the lifetime of a temp file to a value.
pub fn guard(path: PathBuf) -> TempFileGuard {
    scopeguard::guard(path, remove_owned as fn(PathBuf))
}

fn remove_owned(path: PathBuf) {
    remove_quietly(&path);
}

/// Best-effort removal of a batch of files.
pub fn cleanup<P: AsRef<Path>>(paths: &[P]) {
    for path in paths {
        remove_quietly(path.as_ref());
    }
}
