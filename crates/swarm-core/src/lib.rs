//! # swarm-core
//!
//! Shared types for the Swarm worker supervisor:
//!
//! - [`errors::HubError`]: the error taxonomy surfaced to callers
//! - [`tools`]: tool descriptors and call outcomes
//! - [`worker`]: worker configuration and internal-name encoding
//! - [`events`]: the lifecycle event envelope
//! - [`config::HubConfig`]: resolved runtime configuration
//! - [`logging::init_subscriber`]: tracing setup

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod profile;
pub mod tools;
pub mod worker;

pub use config::{HubConfig, HubMode};
pub use errors::{HubError, Result};
pub use events::{EventKind, HubEvent};
pub use profile::{ProfileBundle, ProfileEntry};
pub use tools::{ToolCallOutcome, ToolContent, ToolDescriptor};
pub use worker::{InternalName, WorkerConfig, WorkerTransport};
