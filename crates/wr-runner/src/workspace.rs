use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Per-activation workspaces
// ---------------------------------------------------------------------------

/// Creates and destroys isolated per-activation filesystem roots under a
/// per-runner parent. Every activation gets a unique directory; it is
/// removed after completion regardless of outcome.
pub struct WorkspaceManager {
    parent: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, runner_id: &str) -> Self {
        Self {
            parent: root.into().join(runner_id),
        }
    }

    /// Create a fresh workspace for one activation.
    pub async fn create(&self, agent_id: &str) -> std::io::Result<Workspace> {
        let path = self
            .parent
            .join(format!("{agent_id}-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&path).await?;
        debug!(path = %path.display(), "workspace created");
        Ok(Workspace { path })
    }
}

/// An activation's sandbox root. Removed by [`Workspace::remove`]; the
/// runner calls it on every exit path.
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the directory tree. Idempotent; failures are logged, not
    /// fatal.
    pub async fn remove(self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "workspace cleanup failed");
            }
        } else {
            debug!(path = %self.path.display(), "workspace removed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
