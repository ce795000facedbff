//! Berth State - cluster topology and the lease coordinator
//!
//! This crate provides:
//! - The resource ledger (nodes, volumes, ingresses) owned by one coordinator task
//! - First-fit lease and release of node resources
//! - Change subscribers that keep the ledger in sync with storage
//! - The `ClusterState` handle used by controllers
//! - IP address management

pub mod cluster_state;
pub mod coordinator;
pub mod error;
pub mod filter;
pub mod ipam;
pub mod lease;
pub mod ledger;
pub mod subscriber;

// Re-export commonly used types
pub use cluster_state::{ClusterState, ClusterStateConfig, TopologyKind};
pub use coordinator::ClusterSummary;
pub use error::{Result, StateError};
pub use filter::{default_filters, FilterFailure, FilterPredicate, FilterResult};
pub use ipam::{parse_cidr, CidrConfig, CidrIpam, IpAllocation, Ipam};
pub use lease::{LeaseKind, LeaseOptions, LeaseRequest};
pub use ledger::{Ledger, UpsertOutcome};
pub use subscriber::{ChangeSubscriber, Observed, SubscriberConfig, SubscriberStatus};
