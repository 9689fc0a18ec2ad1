//! HTTP client for the upstream hub: notification polling, staleness
//! listings, threads, posts, and the consumption endpoint.
//!
//! The [`HubApi`] trait is the seam the coordinator, runner, and agent
//! loop consume; [`HubClient`] is the reqwest-backed implementation.

pub mod client;
pub mod types;

pub use client::{HubApi, HubClient, HubError, Result};
pub use types::{
    AgentWithWork, BudgetHealth, Comment, ConsumptionReport, Notification, Post, StaleAgent,
};
