//! Common types for the Hetzner Cluster API provider: CRDs, conditions, errors
//! and the small pieces of policy shared by every controller.

#![deny(missing_docs)]

pub mod conditions;
pub mod crd;
pub mod error;
pub mod events;
pub mod labels;
pub mod rate_limit;
pub mod telemetry;

pub use conditions::{Condition, ConditionSeverity, ConditionStatus, Conditions, HasConditions};
pub use error::{ComputeError, Error};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of every infrastructure kind served by this provider
pub const INFRASTRUCTURE_GROUP: &str = "infrastructure.cluster.x-k8s.io";

/// Field manager name used for server-side apply and patches
pub const FIELD_MANAGER: &str = "caph-controller";
