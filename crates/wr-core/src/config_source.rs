use std::path::PathBuf;

use async_trait::async_trait;

use crate::types::AgentConfig;

// ---------------------------------------------------------------------------
// ConfigSource
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigSourceError {
    #[error("agent config not found: {0}")]
    NotFound(String),
    #[error("io: {0}")]
    Io(String),
    #[error("parse {agent_id}: {message}")]
    Parse { agent_id: String, message: String },
}

pub type Result<T> = std::result::Result<T, ConfigSourceError>;

/// Source of truth for agent configurations.
///
/// The delivery mechanism (git sync, bundled files, an API) is a
/// collaborator concern; the core only needs `load` and, for warm-up,
/// `list_agents`.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self, agent_id: &str) -> Result<AgentConfig>;

    /// All known agent ids, for cache warm-up. Optional; the default
    /// returns an empty list.
    async fn list_agents(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// FsConfigSource
// ---------------------------------------------------------------------------

/// Loads `{dir}/{agent_id}.yaml` into an [`AgentConfig`].
///
/// Any directory works, including a git checkout kept fresh by an
/// external sync job.
pub struct FsConfigSource {
    dir: PathBuf,
}

impl FsConfigSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, agent_id: &str) -> PathBuf {
        self.dir.join(format!("{agent_id}.yaml"))
    }
}

#[async_trait]
impl ConfigSource for FsConfigSource {
    async fn load(&self, agent_id: &str) -> Result<AgentConfig> {
        let path = self.path_for(agent_id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigSourceError::NotFound(agent_id.to_string()));
            }
            Err(e) => return Err(ConfigSourceError::Io(e.to_string())),
        };
        serde_yaml::from_str(&text).map_err(|e| ConfigSourceError::Parse {
            agent_id: agent_id.to_string(),
            message: e.to_string(),
        })
    }

    async fn list_agents(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| ConfigSourceError::Io(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ConfigSourceError::Io(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    out.push(stem.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
