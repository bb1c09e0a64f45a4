//! Reconcilers for the Hetzner Cluster API infrastructure provider
//!
//! Each top-level module exposes a `reconcile` / `error_policy` pair for one
//! kind. They share a [`context::Context`] holding the Kubernetes object
//! store, the cloud client factory and the target-cluster registry.

#![deny(missing_docs)]

pub mod cluster;
pub mod context;
pub mod csr;
pub mod hcloud;
pub mod machine;
pub mod machine_template;
pub mod owners;
pub mod remediation;
pub mod scope;
pub mod secrets;
pub mod services;
pub mod store;
pub mod target_cluster;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{Context, ContextBuilder};

use std::time::Duration;

/// Requeue delay when an owner reference is not set yet
pub const OWNER_REQUEUE: Duration = Duration::from_secs(2);

/// Requeue delay while the credentials secret is missing
pub const SECRET_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue delay while waiting on machines or bootstrap data
pub const WAIT_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue delay after a failed reconcile
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);
