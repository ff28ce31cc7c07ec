//! # swarm-server
//!
//! The control surface over the supervisor runtime: the `/mcp`
//! session endpoint, the `/events` stream, the admin REST routes, the
//! fifteen meta-tools, the stdio single-client surface, and graceful
//! shutdown coordination.

#![deny(unsafe_code)]

pub mod events_route;
pub mod health;
pub mod hub_tools;
pub mod mcp;
pub mod rpc;
pub mod server;
pub mod shutdown;
pub mod stdio_mode;

pub use hub_tools::HubTools;
pub use server::{AppState, HubServer};
pub use shutdown::{ShutdownCoordinator, SHUTDOWN_DEADLINE};
