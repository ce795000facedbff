//! Berth Scheduler - places pods awaiting provisioning
//!
//! This crate provides:
//! - The pod controller (watch, pause/resume, provision with compensation)
//! - The `Provisioner` seam and a recording mock

pub mod controller;
pub mod error;
pub mod provision;

// Re-export commonly used types
pub use controller::{ControllerState, PodController, PodControllerConfig};
pub use error::{Result, SchedulerError};
pub use provision::{MockProvisioner, ProvisionCall, Provisioner};
