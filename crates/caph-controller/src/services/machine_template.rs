//! Capacity of machine templates
//!
//! The cluster autoscaler scales node groups from zero by reading the
//! resources of one machine from the template status.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use tracing::debug;

use caph_common::conditions::{reasons, types};
use caph_common::crd::HCloudMachineTemplate;
use caph_common::{ConditionSeverity, Error, HasConditions, Result};

use super::cloud;
use crate::hcloud::{ComputeApi, ServerType};

/// Fill `status.capacity` from the server type of the template
pub async fn reconcile_capacity(
    api: &dyn ComputeApi,
    template: &mut HCloudMachineTemplate,
) -> Result<()> {
    let type_name = template.spec.template.spec.type_.clone();
    let server_types = api
        .list_server_types()
        .await
        .map_err(cloud("server types"))?;

    let Some(server_type) = server_types.iter().find(|t| t.name == type_name) else {
        template.conditions_mut().mark_false(
            types::CAPACITY_READY,
            reasons::SERVER_TYPE_NOT_FOUND,
            ConditionSeverity::Error,
            format!("server type {type_name:?} does not exist"),
        );
        return Err(Error::validation_for(
            template.name_any(),
            format!("unknown server type {type_name}"),
        ));
    };

    debug!(server_type = %type_name, cores = server_type.cores, "setting template capacity");
    template.status_mut().capacity = capacity(server_type);
    template.conditions_mut().mark_true(types::CAPACITY_READY);
    Ok(())
}

/// CPU and memory of one server of the given type
pub fn capacity(server_type: &ServerType) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(server_type.cores.to_string())),
        (
            "memory".to_string(),
            Quantity(format!("{}G", server_type.memory)),
        ),
    ])
}
