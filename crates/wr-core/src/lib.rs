//! Shared data model, configuration, and collaborator contracts for the
//! warren work-coordination core.

pub mod config;
pub mod config_source;
pub mod secrets;
pub mod shutdown;
pub mod types;

pub use config::Config;
pub use types::{
    ActivationOutcome, AgentConfig, ErrorKind, Priority, RunnerMode, TaskType, WorkItem,
};
