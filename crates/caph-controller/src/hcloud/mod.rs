//! Cloud API access
//!
//! Reconcilers only see [`ComputeApi`]; the reqwest client lives in
//! [`client`]. A [`ComputeApiFactory`] hands out a client per token since
//! every cluster brings its own credentials.

pub mod client;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use caph_common::ComputeError;

#[cfg(test)]
use mockall::automock;

pub use client::{HCloudClient, HCloudClientFactory, DEFAULT_ENDPOINT};
pub use types::*;

/// Result of a cloud API call
pub type ComputeResult<T> = std::result::Result<T, ComputeError>;

/// Trait abstracting the cloud REST API
///
/// Selectors use the API's label selector syntax. Calls that the API answers
/// with an asynchronous action return as soon as the action is accepted.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Servers matching a label selector
    async fn list_servers(&self, selector: String) -> ComputeResult<Vec<Server>>;
    /// A server by ID; `None` when it does not exist
    async fn get_server(&self, id: i64) -> ComputeResult<Option<Server>>;
    /// Create a server
    async fn create_server(&self, opts: ServerCreateOpts) -> ComputeResult<Server>;
    /// Delete a server
    async fn delete_server(&self, id: i64) -> ComputeResult<()>;
    /// Hard reset a server
    async fn reboot_server(&self, id: i64) -> ComputeResult<()>;
    /// Power a server on
    async fn power_on_server(&self, id: i64) -> ComputeResult<()>;
    /// Ask a server to shut down gracefully
    async fn shutdown_server(&self, id: i64) -> ComputeResult<()>;
    /// Attach a server to a private network
    async fn attach_server_to_network(&self, server: i64, network: i64) -> ComputeResult<()>;

    /// Networks matching a label selector
    async fn list_networks(&self, selector: String) -> ComputeResult<Vec<Network>>;
    /// Create a network
    async fn create_network(&self, opts: NetworkCreateOpts) -> ComputeResult<Network>;
    /// Delete a network
    async fn delete_network(&self, id: i64) -> ComputeResult<()>;

    /// Load balancers matching a label selector
    async fn list_load_balancers(&self, selector: String) -> ComputeResult<Vec<LoadBalancer>>;
    /// Create a load balancer
    async fn create_load_balancer(&self, opts: LoadBalancerCreateOpts)
        -> ComputeResult<LoadBalancer>;
    /// Delete a load balancer
    async fn delete_load_balancer(&self, id: i64) -> ComputeResult<()>;
    /// Rename a load balancer
    async fn rename_load_balancer(&self, id: i64, name: String) -> ComputeResult<LoadBalancer>;
    /// Switch the balancing algorithm
    async fn change_load_balancer_algorithm(&self, id: i64, algorithm: String)
        -> ComputeResult<()>;
    /// Switch the load balancer type
    async fn change_load_balancer_type(&self, id: i64, type_: String) -> ComputeResult<()>;
    /// Attach a load balancer to a private network
    async fn attach_load_balancer_to_network(&self, id: i64, network: i64) -> ComputeResult<()>;
    /// Add a server target
    async fn add_target_server(
        &self,
        id: i64,
        server: i64,
        use_private_ip: bool,
    ) -> ComputeResult<()>;
    /// Remove a server target
    async fn remove_target_server(&self, id: i64, server: i64) -> ComputeResult<()>;
    /// Add a service
    async fn add_service(&self, id: i64, service: LoadBalancerService) -> ComputeResult<()>;
    /// Delete the service listening on `listen_port`
    async fn delete_service(&self, id: i64, listen_port: u16) -> ComputeResult<()>;

    /// Placement groups matching a label selector
    async fn list_placement_groups(&self, selector: String) -> ComputeResult<Vec<PlacementGroup>>;
    /// Create a placement group
    async fn create_placement_group(
        &self,
        opts: PlacementGroupCreateOpts,
    ) -> ComputeResult<PlacementGroup>;
    /// Delete a placement group
    async fn delete_placement_group(&self, id: i64) -> ComputeResult<()>;

    /// All server types
    async fn list_server_types(&self) -> ComputeResult<Vec<ServerType>>;
    /// Images matching a query
    async fn list_images(&self, query: ImageQuery) -> ComputeResult<Vec<Image>>;
}

/// Creates API clients for a token
#[cfg_attr(test, automock)]
pub trait ComputeApiFactory: Send + Sync {
    /// Client authenticating with `token`
    fn for_token(&self, token: &str) -> Arc<dyn ComputeApi>;
}

/// Whether the error is an API error with the given code
pub fn has_code(error: &ComputeError, code: &str) -> bool {
    matches!(error, ComputeError::Api { code: c, .. } if c == code)
}

/// API error codes the reconcilers branch on
pub mod codes {
    /// Target is already registered at the load balancer
    pub const TARGET_ALREADY_DEFINED: &str = "target_already_defined";
    /// Resource is already attached to the network
    pub const ALREADY_ATTACHED: &str = "server_already_attached";
    /// Load balancer is already attached to the network
    pub const LOAD_BALANCER_ALREADY_ATTACHED: &str = "load_balancer_already_attached";
    /// Resource is protected against deletion
    pub const PROTECTED: &str = "protected";
}
