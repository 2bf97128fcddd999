//! multipc-sync Library
//!
//! This module exposes the sync core for use by the daemon, integration
//! tests and embedding applications.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod replication;

// Re-export commonly used types
pub use config::load_config;
pub use domain::entities::{Delta, DeltaOperation, EntityKey, EntityRecord, EntityValue, Mutation, Snapshot};
pub use domain::ports::{ConfigRepository, SyncStore};
pub use replication::{ConnectionManager, NetworkModeConfig, NodeIdentity, NodeRole, NotificationHub};
