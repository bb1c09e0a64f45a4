//! Server lifecycle of an HCloudMachine
//!
//! Creation, power state, network and load balancer membership on the way
//! up; graceful shutdown with a bounded grace period on the way down.

use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use caph_common::conditions::{reasons, types};
use caph_common::crd::capi::Machine;
use caph_common::crd::{
    provider_id, AddressType, HCloudMachine, HetznerCluster, InstanceState, MachineAddress,
};
use caph_common::events::{actions, reasons as event_reasons, EventPublisher};
use caph_common::labels::{cluster_selector, cluster_tags, IMAGE_NAME_TAG_KEY, MACHINE_NAME_TAG_KEY};
use caph_common::{ConditionSeverity, Error, HasConditions, Result};

use super::{cloud, ignore_not_found};
use crate::hcloud::{
    codes, has_code, ComputeApi, ImageQuery, PublicNetOpts, Server, ServerCreateOpts,
};

/// Cloud label telling control-plane servers from workers
pub const MACHINE_TYPE_TAG_KEY: &str = "machine_type";

/// Requeue while a server is booting
pub const SERVER_STARTING_REQUEUE: Duration = Duration::from_secs(2);

/// Requeue while a server shuts down for deletion
pub const SHUTDOWN_REQUEUE: Duration = Duration::from_secs(30);

/// Requeue while a server is in a transitional state during deletion
pub const TRANSITION_REQUEUE: Duration = Duration::from_secs(5);

/// How long a graceful shutdown may take before the server is deleted anyway
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2 * 60);

/// Steps of the machine lifecycle shown in `status.bootState`
pub mod boot_states {
    /// Server was just created
    pub const INITIALIZING: &str = "Initializing";
    /// Waiting for the server to report running
    pub const WAIT_FOR_RUNNING: &str = "WaitForServerRunning";
    /// Server is running and wired up
    pub const READY: &str = "Ready";
    /// Server is shutting down for deletion
    pub const SHUTTING_DOWN: &str = "ShuttingDown";
}

/// Outcome of a deletion step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deletion {
    /// The server is gone
    Complete,
    /// Check again after the delay
    Pending(Duration),
}

/// Drives the server behind one HCloudMachine
pub struct ServerService<'a> {
    /// Cloud API of the cluster
    pub api: &'a dyn ComputeApi,
    /// Event sink
    pub events: &'a dyn EventPublisher,
    /// Infrastructure cluster, read only
    pub cluster: &'a HetznerCluster,
    /// Owning CAPI machine
    pub machine: &'a Machine,
}

impl ServerService<'_> {
    /// Bring the server up and mirror it into the machine status
    pub async fn reconcile(&self, hm: &mut HCloudMachine, user_data: &str) -> Result<Action> {
        let server = match self.find_server(hm).await? {
            Some(server) => server,
            None if hm.spec.provider_id.is_some() => {
                warn!(machine = %hm.name_any(), "server vanished");
                hm.set_failure("UpdateMachineError", "server not found");
                hm.mark_remediation_requested();
                return Ok(Action::await_change());
            }
            None => self.create_server(hm, user_data).await?,
        };

        self.update_status(hm, &server);

        match server.status {
            InstanceState::Running => {}
            InstanceState::Off => {
                self.api
                    .power_on_server(server.id)
                    .await
                    .map_err(cloud(format!("server {}", server.id)))?;
                info!(server = server.id, "powered on server");
                return Ok(self.starting(hm));
            }
            _ => return Ok(self.starting(hm)),
        }

        self.attach_to_network(&server).await?;
        if self.machine.is_control_plane() {
            self.add_load_balancer_target(&server).await?;
        }

        hm.spec.provider_id = Some(provider_id(server.id));
        let status = hm.status_mut();
        status.ready = true;
        status.boot_state = Some(boot_states::READY.to_string());
        hm.conditions_mut().mark_true(types::INSTANCE_READY);
        Ok(Action::await_change())
    }

    fn starting(&self, hm: &mut HCloudMachine) -> Action {
        let status = hm.status_mut();
        status.ready = false;
        status.boot_state = Some(boot_states::WAIT_FOR_RUNNING.to_string());
        hm.conditions_mut().mark_false(
            types::INSTANCE_READY,
            reasons::SERVER_STARTING,
            ConditionSeverity::Info,
            "server is starting",
        );
        Action::requeue(SERVER_STARTING_REQUEUE)
    }

    /// Take the server down
    ///
    /// A running server first gets a graceful shutdown; once the grace
    /// period has passed it is deleted regardless.
    pub async fn delete(&self, hm: &mut HCloudMachine) -> Result<Deletion> {
        self.delete_at(hm, Utc::now()).await
    }

    /// [`Self::delete`] at a fixed point in time
    pub async fn delete_at(&self, hm: &mut HCloudMachine, now: DateTime<Utc>) -> Result<Deletion> {
        let Some(server) = self.find_server(hm).await? else {
            debug!(machine = %hm.name_any(), "server already gone");
            return Ok(Deletion::Complete);
        };
        let resource = format!("server {}", server.id);

        if self.machine.is_control_plane() {
            self.remove_load_balancer_target(&server).await?;
        }

        match server.status {
            InstanceState::Running if self.shutdown_pending(hm, now) => {
                self.api
                    .shutdown_server(server.id)
                    .await
                    .map_err(cloud(&resource))?;
                info!(server = server.id, "shutting down server");
                hm.status_mut().boot_state = Some(boot_states::SHUTTING_DOWN.to_string());
                hm.conditions_mut().mark_false(
                    types::INSTANCE_READY,
                    reasons::INSTANCE_TERMINATED,
                    ConditionSeverity::Info,
                    "instance is shutting down",
                );
                Ok(Deletion::Pending(SHUTDOWN_REQUEUE))
            }
            InstanceState::Running | InstanceState::Off => {
                ignore_not_found(self.api.delete_server(server.id).await).map_err(cloud(&resource))?;
                info!(server = server.id, machine = %hm.name_any(), "deleted server");
                self.events
                    .publish(
                        &hm.object_ref(&()),
                        EventType::Normal,
                        event_reasons::SUCCESSFUL_DELETE,
                        actions::DELETE,
                        Some(format!("deleted server {}", server.name)),
                    )
                    .await;
                Ok(Deletion::Complete)
            }
            other => {
                debug!(server = server.id, state = %other, "waiting for server to settle");
                Ok(Deletion::Pending(TRANSITION_REQUEUE))
            }
        }
    }

    /// Whether a running server should (still) get a graceful shutdown
    fn shutdown_pending(&self, hm: &HCloudMachine, now: DateTime<Utc>) -> bool {
        let Some(condition) = hm.conditions().get(types::INSTANCE_READY) else {
            return true;
        };
        if condition.is_true() {
            return true;
        }
        if condition.reason != reasons::INSTANCE_TERMINATED {
            return true;
        }
        let grace = TimeDelta::from_std(SHUTDOWN_GRACE).unwrap_or(TimeDelta::MAX);
        now < condition.last_transition_time + grace
    }

    async fn find_server(&self, hm: &HCloudMachine) -> Result<Option<Server>> {
        let selector = format!(
            "{},{MACHINE_NAME_TAG_KEY}=={}",
            cluster_selector(&self.cluster.name_any()),
            hm.name_any()
        );
        let mut servers = self
            .api
            .list_servers(selector)
            .await
            .map_err(cloud(format!("servers of {}", hm.name_any())))?;
        if servers.len() > 1 {
            return Err(Error::validation_for(
                hm.name_any(),
                format!("found {} servers for one machine", servers.len()),
            ));
        }
        Ok(servers.pop())
    }

    async fn create_server(&self, hm: &mut HCloudMachine, user_data: &str) -> Result<Server> {
        let opts = match self.create_opts(hm, user_data).await {
            Ok(opts) => opts,
            Err(e) => {
                hm.conditions_mut().mark_false(
                    types::SERVER_CREATE_SUCCEEDED,
                    reasons::SERVER_CREATE_FAILED,
                    ConditionSeverity::Warning,
                    e.to_string(),
                );
                return Err(e);
            }
        };

        let name = opts.name.clone();
        match self.api.create_server(opts).await {
            Ok(server) => {
                info!(server = server.id, %name, "created server");
                self.events
                    .publish(
                        &hm.object_ref(&()),
                        EventType::Normal,
                        event_reasons::SUCCESSFUL_CREATE,
                        actions::CREATE,
                        Some(format!("created server {name} with id {}", server.id)),
                    )
                    .await;
                hm.conditions_mut().mark_true(types::SERVER_CREATE_SUCCEEDED);
                hm.status_mut().boot_state = Some(boot_states::INITIALIZING.to_string());
                Ok(server)
            }
            Err(e) => {
                if !e.is_rate_limited() {
                    self.events
                        .publish(
                            &hm.object_ref(&()),
                            EventType::Warning,
                            event_reasons::FAILED_CREATE_SERVER,
                            actions::CREATE,
                            Some(e.to_string()),
                        )
                        .await;
                }
                hm.conditions_mut().mark_false(
                    types::SERVER_CREATE_SUCCEEDED,
                    reasons::SERVER_CREATE_FAILED,
                    ConditionSeverity::Warning,
                    e.to_string(),
                );
                Err(Error::compute(format!("server {name}"), e))
            }
        }
    }

    async fn create_opts(&self, hm: &HCloudMachine, user_data: &str) -> Result<ServerCreateOpts> {
        let name = hm.name_any();
        let image = self.image_id(&hm.spec.image_name).await?;

        let placement_group = match &hm.spec.placement_group_name {
            None => None,
            Some(group) => {
                let found = self
                    .cluster
                    .status
                    .as_ref()
                    .and_then(|s| s.hcloud_placement_groups.iter().find(|g| &g.name == group))
                    .ok_or_else(|| {
                        Error::validation_for(&name, format!("placement group {group:?} not found"))
                    })?;
                Some(found.id)
            }
        };

        let ssh_keys = if hm.spec.ssh_keys.is_empty() {
            &self.cluster.spec.ssh_keys.hcloud
        } else {
            &hm.spec.ssh_keys
        };

        let mut labels: BTreeMap<String, String> = cluster_tags(&self.cluster.name_any());
        labels.insert(MACHINE_NAME_TAG_KEY.to_string(), name.clone());
        let machine_type = if self.machine.is_control_plane() {
            "control_plane"
        } else {
            "worker"
        };
        labels.insert(MACHINE_TYPE_TAG_KEY.to_string(), machine_type.to_string());

        Ok(ServerCreateOpts {
            name,
            server_type: hm.spec.type_.clone(),
            image: image.to_string(),
            location: self
                .machine
                .spec
                .failure_domain
                .clone()
                .or_else(|| self.cluster.spec.control_plane_regions.first().cloned()),
            labels,
            user_data: user_data.to_string(),
            ssh_keys: ssh_keys.iter().map(|k| k.name.clone()).collect(),
            networks: self
                .cluster
                .spec
                .hcloud_network
                .enabled
                .then(|| self.cluster.network_id())
                .flatten()
                .into_iter()
                .collect(),
            placement_group,
            public_net: PublicNetOpts {
                enable_ipv4: hm.spec.public_network.enable_ipv4,
                enable_ipv6: hm.spec.public_network.enable_ipv6,
            },
            start_after_create: true,
            automount: false,
        })
    }

    /// Resolve an image by its `caph-image-name` label or its name
    async fn image_id(&self, image_name: &str) -> Result<i64> {
        let resource = format!("image {image_name}");
        let labelled = self
            .api
            .list_images(ImageQuery {
                label_selector: Some(format!("{IMAGE_NAME_TAG_KEY}=={image_name}")),
                ..Default::default()
            })
            .await
            .map_err(cloud(&resource))?;
        let named = self
            .api
            .list_images(ImageQuery {
                name: Some(image_name.to_string()),
                ..Default::default()
            })
            .await
            .map_err(cloud(&resource))?;

        let mut ids: Vec<i64> = labelled.iter().chain(named.iter()).map(|i| i.id).collect();
        ids.sort_unstable();
        ids.dedup();
        match ids.as_slice() {
            [id] => Ok(*id),
            [] => Err(Error::validation_for(
                resource,
                "no image found by label or name",
            )),
            many => Err(Error::validation_for(
                resource,
                format!("image is ambiguous, {} images match", many.len()),
            )),
        }
    }

    fn update_status(&self, hm: &mut HCloudMachine, server: &Server) {
        let status = hm.status_mut();
        status.addresses = addresses(server);
        status.region = server.location().map(str::to_string);
        status.instance_state = Some(server.status);
    }

    async fn attach_to_network(&self, server: &Server) -> Result<()> {
        let Some(network) = self
            .cluster
            .status
            .as_ref()
            .and_then(|s| s.network_status.as_ref())
        else {
            return Ok(());
        };
        if network.attached_servers.contains(&server.id)
            || server.private_net.iter().any(|n| n.network == network.id)
        {
            return Ok(());
        }

        match self.api.attach_server_to_network(server.id, network.id).await {
            Ok(()) => {
                info!(server = server.id, network = network.id, "attached server to network");
                Ok(())
            }
            Err(e) if has_code(&e, codes::ALREADY_ATTACHED) => Ok(()),
            Err(e) => Err(Error::compute(format!("server {}", server.id), e)),
        }
    }

    async fn add_load_balancer_target(&self, server: &Server) -> Result<()> {
        if !self.cluster.spec.control_plane_load_balancer.enabled {
            return Ok(());
        }
        let Some(lb) = self
            .cluster
            .status
            .as_ref()
            .and_then(|s| s.control_plane_load_balancer.as_ref())
        else {
            return Ok(());
        };
        if lb.targets.contains(&server.id) {
            return Ok(());
        }

        let use_private_ip = !server.private_net.is_empty();
        if use_private_ip && !lb.attached_to_network {
            debug!(server = server.id, lb = lb.id, "load balancer not in network yet");
            return Ok(());
        }

        match self
            .api
            .add_target_server(lb.id, server.id, use_private_ip)
            .await
        {
            Ok(()) => {
                info!(server = server.id, lb = lb.id, "added load balancer target");
                Ok(())
            }
            Err(e) if has_code(&e, codes::TARGET_ALREADY_DEFINED) => Ok(()),
            Err(e) => Err(Error::compute(format!("load balancer {}", lb.id), e)),
        }
    }

    async fn remove_load_balancer_target(&self, server: &Server) -> Result<()> {
        let Some(lb) = self
            .cluster
            .status
            .as_ref()
            .and_then(|s| s.control_plane_load_balancer.as_ref())
        else {
            return Ok(());
        };
        if !lb.targets.contains(&server.id) {
            return Ok(());
        }
        ignore_not_found(self.api.remove_target_server(lb.id, server.id).await)
            .map_err(cloud(format!("load balancer {}", lb.id)))?;
        info!(server = server.id, lb = lb.id, "removed load balancer target");
        Ok(())
    }
}

/// Machine addresses of a server
///
/// The API reports the public IPv6 network; the server uses its first host
/// address.
pub fn addresses(server: &Server) -> Vec<MachineAddress> {
    let mut addresses = vec![MachineAddress {
        type_: AddressType::Hostname,
        address: server.name.clone(),
    }];
    if let Some(v4) = &server.public_net.ipv4 {
        addresses.push(MachineAddress {
            type_: AddressType::ExternalIP,
            address: v4.ip.clone(),
        });
    }
    if let Some(v6) = &server.public_net.ipv6 {
        let network = v6.ip.split('/').next().unwrap_or_default();
        if let Ok(addr) = network.parse::<Ipv6Addr>() {
            let mut octets = addr.octets();
            octets[15] = octets[15].wrapping_add(1);
            addresses.push(MachineAddress {
                type_: AddressType::ExternalIP,
                address: Ipv6Addr::from(octets).to_string(),
            });
        }
    }
    for net in &server.private_net {
        addresses.push(MachineAddress {
            type_: AddressType::InternalIP,
            address: net.ip.clone(),
        });
    }
    addresses
}
