//! # swarm-runtime
//!
//! The supervisor runtime: per-worker lifecycle state machine, shared
//! worker pools with FIFO admission queues and dynamic scaling,
//! session isolation for stateful workers, the reconnect/health
//! watchdog, and the event bus gluing it all together.

#![deny(unsafe_code)]

pub mod bus;
pub mod catalog;
pub mod instance;
pub mod profiles;
pub mod queue;
pub mod sessions;
pub mod supervisor;

pub use bus::EventBus;
pub use instance::{Instance, InstanceSnapshot, WorkerState};
pub use queue::AdmissionQueue;
pub use sessions::SessionRegistry;
pub use supervisor::Supervisor;
