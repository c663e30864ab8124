//! Per-execution scratch directories.
//!
//! Every execution gets its own directory for sources, artifacts and working
//! state. The directory is removed when the guard drops, which covers every
//! exit path of an execution: success, compile error, timeout, cancellation
//! and panic unwinds.

use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

use crate::env::SCRATCH_DIR_PREFIX;

/// Owned scratch directory, deleted on drop.
#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    /// Create a fresh scratch directory under the system temp root.
    pub fn create() -> io::Result<Self> {
        Self::create_in(std::env::temp_dir())
    }

    /// Create a fresh scratch directory under `root`.
    pub fn create_in(root: impl AsRef<Path>) -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(SCRATCH_DIR_PREFIX)
            .tempdir_in(root)?;
        debug!(path = %dir.path().display(), "created scratch directory");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `contents` to `name` inside the scratch directory and return the
    /// absolute path.
    pub async fn write_file(&self, name: &str, contents: &[u8]) -> io::Result<PathBuf> {
        let path = self.dir.path().join(name);
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }
}
