//! Job lifecycle management for QETL.
//!
//! Tracks submitted pipelines through their state machine, runs each one on
//! its own Tokio task, and exposes handles for waiting, cancelling,
//! subscribing to notifications, and following logs.

pub mod handle;
pub mod manager;
pub mod notify;
mod runner;
pub mod store;

#[cfg(test)]
mod testing;

pub use handle::JobHandle;
pub use manager::{InstanceInfo, Manager, ManagerConfig, ValidationReport};
pub use store::{JobStore, Transition};
