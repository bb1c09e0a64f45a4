//! Reboot-then-replace remediation of unhealthy machines
//!
//! A remediation object lives next to a machine that a MachineHealthCheck
//! flagged. It walks Running -> Waiting -> Deleting: reboot up to the retry
//! limit, wait one more timeout, then hand the machine back to Cluster API
//! for replacement by marking its `OwnerRemediated` condition False.
//!
//! The phase logic is shared; [`hcloud`] and [`baremetal`] only differ in
//! how an instance is found and rebooted, see [`Remediator`].

pub mod baremetal;
pub mod hcloud;

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use caph_common::conditions::{reasons, types};
use caph_common::crd::capi::{is_paused, Cluster, Machine};
use caph_common::crd::{
    HCloudRemediation, HetznerBareMetalRemediation, RemediationPhase, RemediationStatus,
    RemediationStrategy, RemediationType,
};
use caph_common::events::{actions, reasons as event_reasons};
use caph_common::{ConditionSeverity, HasConditions, Result};

#[cfg(test)]
use mockall::automock;

use crate::context::Context;
use crate::owners;
use crate::scope::Scope;
use crate::store::{resource_of, ObjectPatch, ObjectStore};

/// Access to the instance behind a remediated machine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Remediator: Send + Sync {
    /// Whether the instance still exists and can be rebooted
    async fn instance_exists(&self) -> Result<bool>;
    /// Reboot the instance
    async fn reboot(&self) -> Result<()>;
}

/// The remediation kinds sharing the phase logic
pub trait RemediationObject:
    Resource<DynamicType = ()> + Serialize + DeserializeOwned + HasConditions + Clone + Debug + Send + Sync
{
    /// Configured strategy
    fn strategy(&self) -> Option<&RemediationStrategy>;
    /// Remediation progress
    fn remediation(&self) -> RemediationStatus;
    /// Mutable remediation progress
    fn remediation_mut(&mut self) -> &mut RemediationStatus;
}

impl RemediationObject for HCloudRemediation {
    fn strategy(&self) -> Option<&RemediationStrategy> {
        self.spec.strategy.as_ref()
    }

    fn remediation(&self) -> RemediationStatus {
        self.status.clone().unwrap_or_default()
    }

    fn remediation_mut(&mut self) -> &mut RemediationStatus {
        self.status_mut()
    }
}

impl RemediationObject for HetznerBareMetalRemediation {
    fn strategy(&self) -> Option<&RemediationStrategy> {
        self.spec.strategy.as_ref()
    }

    fn remediation(&self) -> RemediationStatus {
        self.status.clone().unwrap_or_default()
    }

    fn remediation_mut(&mut self) -> &mut RemediationStatus {
        self.status_mut()
    }
}

/// What a remediation pass decided
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Look again after the delay
    Requeue(Duration),
    /// Give the machine back to Cluster API; carries the event reason
    Escalate(&'static str),
    /// The strategy is not one we can execute
    Unsupported,
    /// Nothing left to do
    Done,
}

/// Advance the phase machine by one pass
///
/// Reboot failures leave the phase untouched and bubble up; the next pass
/// retries.
pub async fn advance(
    remediator: &dyn Remediator,
    strategy: Option<&RemediationStrategy>,
    status: &mut RemediationStatus,
    now: DateTime<Utc>,
) -> Result<Step> {
    if status.phase() == RemediationPhase::Deleting {
        return Ok(Step::Done);
    }
    let Some(strategy) = strategy.filter(|s| s.type_ == RemediationType::Reboot) else {
        return Ok(Step::Unsupported);
    };
    let timeout = strategy.timeout()?;

    if !remediator.instance_exists().await? {
        info!("instance is gone, skipping reboots");
        return Ok(Step::Escalate(event_reasons::EXIT_REMEDIATION));
    }

    if status.phase() == RemediationPhase::Running {
        if status.last_remediated.is_none() {
            reboot(remediator, status, now).await?;
            return Ok(Step::Requeue(timeout));
        }
        if strategy.retry_limit == 0 || status.retry_count >= strategy.retry_limit {
            debug!(retries = status.retry_count, "retry limit reached, waiting");
            status.phase = Some(RemediationPhase::Waiting);
        } else {
            let wait = status.time_until_next_remediation(timeout, now);
            if !wait.is_zero() {
                return Ok(Step::Requeue(wait));
            }
            reboot(remediator, status, now).await?;
            return Ok(Step::Requeue(timeout));
        }
    }

    let wait = status.time_until_next_remediation(timeout, now);
    if wait.is_zero() {
        return Ok(Step::Escalate(event_reasons::SET_OWNER_REMEDIATED_CONDITION));
    }
    Ok(Step::Requeue(wait))
}

async fn reboot(
    remediator: &dyn Remediator,
    status: &mut RemediationStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    remediator.reboot().await?;
    status.record_remediation(now);
    info!(retries = status.retry_count, "rebooted instance");
    Ok(())
}

/// Owner machine and cluster of a remediation, if the chain is complete
/// and not paused
pub(crate) async fn resolve_owners<R: RemediationObject>(
    store: &dyn ObjectStore,
    remediation: &R,
) -> Result<Option<(Machine, Cluster)>> {
    let Some(machine) = owners::owner_machine(store, remediation.meta()).await? else {
        return Ok(None);
    };
    let Some(cluster) = owners::machine_cluster(store, &machine).await? else {
        debug!(machine = %machine.name_any(), "cluster of machine not found");
        return Ok(None);
    };
    if is_paused(&cluster, remediation.meta()) {
        debug!(remediation = %remediation.name_any(), "reconciliation is paused");
        return Ok(None);
    }
    Ok(Some((machine, cluster)))
}

/// Run one pass and turn its outcome into an action
pub(crate) async fn execute<R: RemediationObject>(
    ctx: &Context,
    scope: &mut Scope<R>,
    remediator: &dyn Remediator,
    machine: &Machine,
    now: DateTime<Utc>,
) -> Result<Action> {
    let strategy = scope.object().strategy().cloned();
    let mut status = scope.object().remediation();
    let retries = status.retry_count;
    let step = advance(remediator, strategy.as_ref(), &mut status, now).await;
    let rebooted = status.retry_count > retries;
    *scope.object_mut().remediation_mut() = status;
    if rebooted {
        ctx.events
            .publish(
                &scope.object().object_ref(&()),
                EventType::Normal,
                event_reasons::REBOOTED,
                actions::REBOOT,
                Some(format!("rebooted instance of machine {}", machine.name_any())),
            )
            .await;
    }

    match step? {
        Step::Requeue(after) => Ok(Action::requeue(after)),
        Step::Done => Ok(Action::await_change()),
        Step::Unsupported => {
            warn!(remediation = %scope.name(), "unsupported remediation strategy");
            ctx.events
                .publish(
                    &scope.object().object_ref(&()),
                    EventType::Warning,
                    event_reasons::UNSUPPORTED_REMEDIATION_STRATEGY,
                    actions::REMEDIATE,
                    Some("only the Reboot strategy is supported".to_string()),
                )
                .await;
            Ok(Action::await_change())
        }
        Step::Escalate(reason) => escalate(ctx, scope, machine, reason).await,
    }
}

/// Move to Deleting and let Cluster API replace the machine
pub(crate) async fn escalate<R: RemediationObject>(
    ctx: &Context,
    scope: &mut Scope<R>,
    machine: &Machine,
    reason: &'static str,
) -> Result<Action> {
    scope.object_mut().remediation_mut().phase = Some(RemediationPhase::Deleting);
    mark_owner_remediated(ctx.store.as_ref(), machine).await?;
    info!(remediation = %scope.name(), machine = %machine.name_any(), reason, "handing machine over for replacement");
    ctx.events
        .publish(
            &scope.object().object_ref(&()),
            EventType::Normal,
            reason,
            actions::REMEDIATE,
            Some(format!("machine {} will be replaced", machine.name_any())),
        )
        .await;
    Ok(Action::await_change())
}

/// Set `OwnerRemediated=False/WaitingForRemediation` on the CAPI machine
///
/// Written as a status patch guarded by the resource version; the rest of
/// the machine's conditions belong to Cluster API and are left as read.
pub(crate) async fn mark_owner_remediated(store: &dyn ObjectStore, machine: &Machine) -> Result<()> {
    let already = machine
        .conditions()
        .get(types::MACHINE_OWNER_REMEDIATED)
        .is_some_and(|c| c.is_false() && c.reason == reasons::WAITING_FOR_REMEDIATION);
    if already {
        return Ok(());
    }

    let mut machine = machine.clone();
    machine.conditions_mut().mark_false(
        types::MACHINE_OWNER_REMEDIATED,
        reasons::WAITING_FOR_REMEDIATION,
        ConditionSeverity::Warning,
        "remediation finished, machine is due for replacement",
    );
    let patch = ObjectPatch {
        status: Some(json!({ "conditions": machine.conditions() })),
        resource_version: machine.resource_version(),
        ..Default::default()
    };
    store
        .patch(
            &resource_of::<Machine>(),
            &machine.namespace().unwrap_or_default(),
            &machine.name_any(),
            &patch,
        )
        .await
}
