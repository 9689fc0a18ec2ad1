//! Runner library: the claim-execute-report loop, the two-tier agent
//! config cache, and per-activation workspaces.

pub mod config_cache;
pub mod runner;
pub mod workspace;

pub use config_cache::{ConfigCache, ConfigCacheError};
pub use runner::{Runner, RunnerError};
pub use workspace::{Workspace, WorkspaceManager};
