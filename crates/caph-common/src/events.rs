//! Kubernetes Event recording for the provider controllers.
//!
//! Controllers publish through the [`EventPublisher`] trait so tests can
//! record or drop events. Publishing is fire-and-forget: failures are logged
//! and never fail a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "SuccessfulCreate")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// A cloud resource was created
    pub const SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
    /// Creating a server failed
    pub const FAILED_CREATE_SERVER: &str = "FailedCreateHCloudServer";
    /// A cloud resource was deleted
    pub const SUCCESSFUL_DELETE: &str = "SuccessfulDelete";
    /// Cluster deletion is blocked on remaining machines
    pub const WAITING_FOR_MACHINE_DELETION: &str = "WaitingForMachineDeletion";
    /// The cloud API rate limited a call
    pub const RATE_LIMIT_EXCEEDED: &str = "RateLimitExceeded";
    /// The token was rejected
    pub const CREDENTIALS_INVALID: &str = "CredentialsInvalid";
    /// A server was rebooted as remediation
    pub const REBOOTED: &str = "Rebooted";
    /// Remediation ended without a reboot because there is nothing to reboot
    pub const EXIT_REMEDIATION: &str = "ExitRemediation";
    /// Remediation gave up and handed over to CAPI
    pub const SET_OWNER_REMEDIATED_CONDITION: &str = "SetOwnerRemediatedCondition";
    /// The remediation strategy is not implemented
    pub const UNSUPPORTED_REMEDIATION_STRATEGY: &str = "UnsupportedRemediationStrategy";
    /// The machine was flagged for replacement
    pub const MACHINE_WILL_BE_REMEDIATED: &str = "HCloudMachineWillBeRemediated";
    /// A kubelet CSR was approved
    pub const CSR_APPROVED: &str = "CSRApproved";
    /// A kubelet CSR was denied
    pub const CSR_DENIED: &str = "CSRDenied";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating a cloud resource
    pub const CREATE: &str = "Create";
    /// Deleting a cloud resource or object
    pub const DELETE: &str = "Delete";
    /// Rebooting a server or host
    pub const REBOOT: &str = "Reboot";
    /// Remediating an unhealthy machine
    pub const REMEDIATE: &str = "Remediate";
    /// Approving or denying a CSR
    pub const APPROVE: &str = "Approve";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[tokio::test]
    async fn mock_publisher_sees_reason_and_action() {
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .withf(|_, type_, reason, action, _| {
                *type_ == EventType::Normal
                    && reason == reasons::CSR_APPROVED
                    && action == actions::APPROVE
            })
            .times(1)
            .returning(|_, _, _, _, _| ());

        publisher
            .publish(
                &ObjectReference::default(),
                EventType::Normal,
                reasons::CSR_APPROVED,
                actions::APPROVE,
                None,
            )
            .await;
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::WAITING_FOR_MACHINE_DELETION,
                actions::DELETE,
                Some("2 machines left".to_string()),
            )
            .await;
    }
}
