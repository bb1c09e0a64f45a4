//! Per-resource reconcilers
//!
//! Each service drives one slice of the cloud resource graph towards the
//! declared state and mirrors what it observed into the owner's status.
//! They are plain async functions over a [`ComputeApi`](crate::hcloud::ComputeApi)
//! so the orchestrating reconcilers decide ordering and persistence.

pub mod load_balancer;
pub mod machine_template;
pub mod network;
pub mod placement_group;
pub mod server;

use caph_common::{ComputeError, Error};

/// Wrap a cloud error with the resource it concerns
pub(crate) fn cloud(resource: impl Into<String>) -> impl FnOnce(ComputeError) -> Error {
    let resource = resource.into();
    move |e| Error::compute(resource, e)
}

/// Treat a missing resource as success
pub(crate) fn ignore_not_found(result: Result<(), ComputeError>) -> Result<(), ComputeError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
