//! Placement groups
//!
//! Cloud names are `<cluster>-<name>`; the status carries the spec names.

use std::collections::BTreeSet;

use kube::ResourceExt;
use tracing::info;

use caph_common::conditions::{reasons, types};
use caph_common::crd::{HetznerCluster, PlacementGroupStatus};
use caph_common::labels::{cluster_selector, cluster_tags};
use caph_common::{ConditionSeverity, HasConditions, Result};

use super::{cloud, ignore_not_found};
use crate::hcloud::{ComputeApi, PlacementGroup, PlacementGroupCreateOpts};

/// Create missing groups, delete surplus ones, mirror the result
pub async fn reconcile_placement_groups(
    api: &dyn ComputeApi,
    cluster: &mut HetznerCluster,
) -> Result<()> {
    match sync(api, cluster).await {
        Ok(groups) => {
            cluster.status_mut().hcloud_placement_groups = groups;
            cluster
                .conditions_mut()
                .mark_true(types::PLACEMENT_GROUPS_SYNCED);
            Ok(())
        }
        Err(e) => {
            cluster.conditions_mut().mark_false(
                types::PLACEMENT_GROUPS_SYNCED,
                reasons::PLACEMENT_GROUP_RECONCILE_FAILED,
                ConditionSeverity::Warning,
                e.to_string(),
            );
            Err(e)
        }
    }
}

async fn sync(api: &dyn ComputeApi, cluster: &HetznerCluster) -> Result<Vec<PlacementGroupStatus>> {
    let name = cluster.name_any();
    let prefix = format!("{name}-");
    let existing = list(api, &name).await?;
    let existing_names: BTreeSet<&str> = existing
        .iter()
        .map(|g| g.name.strip_prefix(&prefix).unwrap_or(&g.name))
        .collect();
    let desired: BTreeSet<&str> = cluster
        .spec
        .hcloud_placement_groups
        .iter()
        .map(|g| g.name.as_str())
        .collect();

    let mut changed = false;
    for spec in cluster
        .spec
        .hcloud_placement_groups
        .iter()
        .filter(|g| !existing_names.contains(g.name.as_str()))
    {
        let group = api
            .create_placement_group(PlacementGroupCreateOpts {
                name: format!("{prefix}{}", spec.name),
                type_: spec.type_.clone(),
                labels: cluster_tags(&name),
            })
            .await
            .map_err(cloud(format!("placement group {prefix}{}", spec.name)))?;
        info!(group = group.id, name = %group.name, "created placement group");
        changed = true;
    }

    for group in existing
        .iter()
        .filter(|g| !desired.contains(g.name.strip_prefix(&prefix).unwrap_or(&g.name)))
    {
        ignore_not_found(api.delete_placement_group(group.id).await)
            .map_err(cloud(format!("placement group {}", group.id)))?;
        info!(group = group.id, name = %group.name, "deleted placement group");
        changed = true;
    }

    let current = if changed { list(api, &name).await? } else { existing };
    Ok(current.iter().map(|g| status_from(g, &prefix)).collect())
}

async fn list(api: &dyn ComputeApi, cluster_name: &str) -> Result<Vec<PlacementGroup>> {
    api.list_placement_groups(cluster_selector(cluster_name))
        .await
        .map_err(cloud(format!("placement groups of {cluster_name}")))
}

fn status_from(group: &PlacementGroup, prefix: &str) -> PlacementGroupStatus {
    PlacementGroupStatus {
        id: group.id,
        name: group
            .name
            .strip_prefix(prefix)
            .unwrap_or(&group.name)
            .to_string(),
        type_: group.type_.clone(),
        servers: group.servers.clone(),
    }
}

/// Delete every group recorded in the status
pub async fn delete_placement_groups(
    api: &dyn ComputeApi,
    cluster: &mut HetznerCluster,
) -> Result<()> {
    let groups = cluster
        .status
        .as_ref()
        .map(|s| s.hcloud_placement_groups.clone())
        .unwrap_or_default();
    for group in groups {
        ignore_not_found(api.delete_placement_group(group.id).await)
            .map_err(cloud(format!("placement group {}", group.id)))?;
        info!(group = group.id, name = %group.name, "deleted placement group");
    }
    cluster.status_mut().hcloud_placement_groups.clear();
    Ok(())
}
