//! Per-job scratch directories (`spec.md` §4.6 phase 2, §5 "resource
//! discipline"): one worktree per job under an OS-specific cache root,
//! removed on every exit path including panics.

use cinch_core::{Error, JobId, Result};
use std::path::PathBuf;

/// Root directory under which every job's worktree is created. Falls
/// back to the system temp dir if no cache dir is resolvable (e.g. a
/// minimal container with no `HOME`), mirroring how the sibling daemon
/// examples resolve their own state directories via `dirs`.
pub fn cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cinch-agent")
}

/// A job's scratch worktree. Removed when dropped, so a panic anywhere
/// during job execution still cleans up the directory on unwind.
pub struct Scratch {
    path: PathBuf,
}

impl Scratch {
    pub fn create(job_id: JobId) -> Result<Self> {
        let path = cache_root().join("jobs").join(job_id.to_string());
        std::fs::create_dir_all(&path)
            .map_err(|e| Error::Infra { phase: "clone".to_string(), message: e.to_string() })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove job scratch directory");
            }
        }
    }
}

/// Cache mounts are host-durable across jobs, unlike the worktree
/// (`spec.md` §4.6 phase 5): "these mounts are host-durable across
/// jobs on the same executor".
pub fn cache_mount_root() -> PathBuf {
    cache_root().join("caches")
}
