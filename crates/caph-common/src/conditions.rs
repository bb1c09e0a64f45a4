//! Condition ledger shared by every reconciled object
//!
//! Conditions follow the Cluster API conventions: a type, a status, an
//! optional severity for False conditions, a reason, a message and the time of
//! the last status flip. A [`Conditions`] set holds at most one condition per
//! type and serializes as the usual Kubernetes list.
//!
//! The last-transition-time only moves when the status flips. Backoff logic
//! (see [`crate::rate_limit`]) measures waits from it, so rewriting the reason
//! or message of a False condition must not restart the clock.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// How bad a False condition is
///
/// Ordered from least to most severe so that `max()` picks the worst.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
)]
pub enum ConditionSeverity {
    /// Expected transient state
    Info,
    /// Something needs attention but may resolve by itself
    Warning,
    /// Something is broken
    Error,
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready, InstanceReady)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Severity, only meaningful when status is False
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,

    /// Machine-readable reason for the condition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            severity: None,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Attach a severity
    pub fn with_severity(mut self, severity: ConditionSeverity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Whether the condition is True
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    /// Whether the condition is False
    pub fn is_false(&self) -> bool {
        self.status == ConditionStatus::False
    }

    /// Equal in everything but the timestamp
    fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status
            && self.severity == other.severity
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Set of conditions keyed by type
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Condition>", into = "Vec<Condition>")]
pub struct Conditions(BTreeMap<String, Condition>);

static EMPTY_CONDITIONS: Conditions = Conditions(BTreeMap::new());

impl Conditions {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// A shared empty set, for objects without a status yet
    pub fn empty() -> &'static Conditions {
        &EMPTY_CONDITIONS
    }

    /// Insert or update a condition
    ///
    /// If a condition of the same type exists with the same status, its
    /// last-transition-time is kept. If nothing but the timestamp differs the
    /// set is left untouched.
    pub fn set(&mut self, mut condition: Condition) {
        if let Some(existing) = self.0.get(&condition.type_) {
            if existing.same_state(&condition) {
                return;
            }
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
        }
        self.0.insert(condition.type_.clone(), condition);
    }

    /// Mark a condition True, clearing reason, message and severity
    pub fn mark_true(&mut self, type_: &str) {
        self.set(Condition::new(type_, ConditionStatus::True, "", ""));
    }

    /// Mark a condition False with the given reason and severity
    pub fn mark_false(
        &mut self,
        type_: &str,
        reason: &str,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) {
        self.set(Condition::new(type_, ConditionStatus::False, reason, message).with_severity(severity));
    }

    /// Mark a condition Unknown
    pub fn mark_unknown(&mut self, type_: &str, reason: &str, message: impl Into<String>) {
        self.set(Condition::new(type_, ConditionStatus::Unknown, reason, message));
    }

    /// Look up a condition by type
    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.get(type_)
    }

    /// Whether the condition exists and is True
    pub fn is_true(&self, type_: &str) -> bool {
        self.get(type_).is_some_and(Condition::is_true)
    }

    /// Whether the condition exists and is False
    pub fn is_false(&self, type_: &str) -> bool {
        self.get(type_).is_some_and(Condition::is_false)
    }

    /// Remove a condition
    pub fn delete(&mut self, type_: &str) -> Option<Condition> {
        self.0.remove(type_)
    }

    /// Iterate in type order
    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.values()
    }

    /// Number of conditions
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Recompute the `Ready` summary from all other conditions
    ///
    /// Ready is True when every other condition is True. Otherwise it mirrors
    /// the most severe False condition; Unknown conditions make it Unknown.
    pub fn set_summary(&mut self) {
        let others: Vec<&Condition> = self
            .0
            .values()
            .filter(|c| c.type_ != types::READY)
            .collect();

        let worst_false = others
            .iter()
            .filter(|c| c.is_false())
            .max_by_key(|c| c.severity.unwrap_or(ConditionSeverity::Info));

        let summary = if let Some(worst) = worst_false {
            let severity = worst.severity.unwrap_or(ConditionSeverity::Info);
            let message = worst.message.clone();
            let reason = worst.reason.clone();
            Condition::new(types::READY, ConditionStatus::False, reason, message)
                .with_severity(severity)
        } else if let Some(unknown) = others
            .iter()
            .find(|c| c.status == ConditionStatus::Unknown)
        {
            Condition::new(
                types::READY,
                ConditionStatus::Unknown,
                unknown.reason.clone(),
                unknown.message.clone(),
            )
        } else {
            Condition::new(types::READY, ConditionStatus::True, "", "")
        };
        self.set(summary);
    }
}

impl From<Vec<Condition>> for Conditions {
    fn from(list: Vec<Condition>) -> Self {
        Self(list.into_iter().map(|c| (c.type_.clone(), c)).collect())
    }
}

impl From<Conditions> for Vec<Condition> {
    fn from(set: Conditions) -> Self {
        set.0.into_values().collect()
    }
}

impl JsonSchema for Conditions {
    fn schema_name() -> String {
        "Conditions".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        gen.subschema_for::<Vec<Condition>>()
    }
}

/// Objects that carry a condition set in their status
pub trait HasConditions {
    /// Read access, empty if the object has no status
    fn conditions(&self) -> &Conditions;

    /// Write access, creating the status if needed
    fn conditions_mut(&mut self) -> &mut Conditions;
}

/// Implement [`HasConditions`] for a kube custom resource whose status is an
/// `Option<Status>` with a `conditions: Conditions` field.
#[macro_export]
macro_rules! impl_has_conditions {
    ($kind:ty) => {
        impl $crate::conditions::HasConditions for $kind {
            fn conditions(&self) -> &$crate::conditions::Conditions {
                self.status
                    .as_ref()
                    .map(|s| &s.conditions)
                    .unwrap_or_else(|| $crate::conditions::Conditions::empty())
            }

            fn conditions_mut(&mut self) -> &mut $crate::conditions::Conditions {
                &mut self.status.get_or_insert_with(Default::default).conditions
            }
        }
    };
}

/// Condition types
pub mod types {
    /// Summary of all other conditions
    pub const READY: &str = "Ready";
    /// The cloud token could be read and was accepted
    pub const HCLOUD_TOKEN_AVAILABLE: &str = "HCloudTokenAvailable";
    /// The cloud API is not rate limiting us
    pub const HETZNER_API_REACHABLE: &str = "HetznerAPIReachable";
    /// The workload cluster sub-manager is running
    pub const TARGET_CLUSTER_READY: &str = "TargetClusterReady";
    /// The provider secret exists in the workload cluster
    pub const TARGET_CLUSTER_SECRET_READY: &str = "TargetClusterSecretReady";
    /// The control plane endpoint is known
    pub const CONTROL_PLANE_ENDPOINT_SET: &str = "ControlPlaneEndpointSet";
    /// The cluster network exists
    pub const NETWORK_READY: &str = "NetworkReady";
    /// The control plane load balancer exists
    pub const LOAD_BALANCER_READY: &str = "LoadBalancerReady";
    /// The load balancer is attached to the cluster network
    pub const LOAD_BALANCER_ATTACHED_TO_NETWORK: &str = "LoadBalancerAttachedToNetwork";
    /// Placement groups match the spec
    pub const PLACEMENT_GROUPS_SYNCED: &str = "PlacementGroupsSynced";
    /// The server backing a machine is running
    pub const INSTANCE_READY: &str = "InstanceReady";
    /// The machine's bootstrap data is available
    pub const BOOTSTRAP_READY: &str = "BootstrapReady";
    /// The server was created
    pub const SERVER_CREATE_SUCCEEDED: &str = "ServerCreateSucceeded";
    /// The server type's capacity was resolved
    pub const CAPACITY_READY: &str = "CapacityReady";
    /// Nobody asked CAPI to remediate the machine
    pub const NO_REMEDIATE_MACHINE_ANNOTATION: &str = "NoRemediateMachineAnnotation";
    /// CAPI Machine condition owned by the remediation controller
    pub const MACHINE_OWNER_REMEDIATED: &str = "OwnerRemediated";
}

/// Condition reasons
pub mod reasons {
    /// The credentials secret could not be read
    pub const HETZNER_SECRET_UNREACHABLE: &str = "HetznerSecretUnreachable";
    /// The token is empty or was rejected
    pub const CREDENTIALS_INVALID: &str = "CredentialsInvalid";
    /// The cloud API rate limited a call
    pub const RATE_LIMIT_EXCEEDED: &str = "RateLimitExceeded";
    /// No kubeconfig secret for the workload cluster yet
    pub const KUBECONFIG_NOT_FOUND: &str = "KubeConfigNotFound";
    /// The workload control plane is not ready
    pub const TARGET_CLUSTER_CONTROL_PLANE_NOT_READY: &str = "TargetClusterControlPlaneNotReady";
    /// The workload API server does not answer
    pub const KUBE_API_SERVER_NOT_RESPONDING: &str = "KubeAPIServerNotResponding";
    /// The workload client could not be built
    pub const TARGET_CLUSTER_CREATE_FAILED: &str = "TargetClusterCreateFailed";
    /// The provider secret could not be written in the workload cluster
    pub const TARGET_SECRET_SYNC_FAILED: &str = "TargetSecretSyncFailed";
    /// No endpoint is known yet
    pub const CONTROL_PLANE_ENDPOINT_NOT_SET: &str = "ControlPlaneEndpointNotSet";
    /// Creating or adopting the network failed
    pub const NETWORK_RECONCILE_FAILED: &str = "NetworkReconcileFailed";
    /// Creating or adopting the load balancer failed
    pub const LOAD_BALANCER_RECONCILE_FAILED: &str = "LoadBalancerReconcileFailed";
    /// No network exists to attach the load balancer to
    pub const LOAD_BALANCER_NO_NETWORK_FOUND: &str = "LoadBalancerNoNetworkFound";
    /// Attaching the load balancer to the network failed
    pub const LOAD_BALANCER_ATTACH_FAILED: &str = "LoadBalancerAttachFailed";
    /// Placement group reconciliation failed
    pub const PLACEMENT_GROUP_RECONCILE_FAILED: &str = "PlacementGroupReconcileFailed";
    /// The machine is waiting for its bootstrap secret
    pub const BOOTSTRAP_NOT_READY: &str = "BootstrapNotReady";
    /// Server creation failed
    pub const SERVER_CREATE_FAILED: &str = "ServerCreateFailed";
    /// The server is starting
    pub const SERVER_STARTING: &str = "ServerStarting";
    /// The server is being shut down and deleted
    pub const INSTANCE_TERMINATED: &str = "InstanceTerminated";
    /// The server type could not be resolved
    pub const SERVER_TYPE_NOT_FOUND: &str = "ServerTypeNotFound";
    /// Remediation failed; CAPI should replace the machine
    pub const WAITING_FOR_REMEDIATION: &str = "WaitingForRemediation";
    /// The remediate-machine annotation is set on the CAPI Machine
    pub const REMEDIATE_MACHINE_ANNOTATION_IS_SET: &str = "RemediateMachineAnnotationIsSet";
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    /// Story: conditions follow Kubernetes conventions
    #[test]
    fn story_conditions_follow_kubernetes_conventions() {
        let before = Utc::now();
        let condition = Condition::new(
            types::INSTANCE_READY,
            ConditionStatus::False,
            reasons::SERVER_STARTING,
            "server is starting",
        )
        .with_severity(ConditionSeverity::Info);
        let after = Utc::now();

        assert_eq!(condition.type_, "InstanceReady");
        assert!(condition.is_false());
        assert_eq!(condition.severity, Some(ConditionSeverity::Info));
        assert!(condition.last_transition_time >= before);
        assert!(condition.last_transition_time <= after);
    }

    /// Story: the transition time only moves when the status flips
    ///
    /// The rate-limit gate measures its wait from the transition time, so a
    /// second rate-limit observation with a new message must not restart the
    /// wait.
    #[test]
    fn story_transition_time_only_moves_on_flip() {
        let mut set = Conditions::new();
        set.mark_false(
            types::HETZNER_API_REACHABLE,
            reasons::RATE_LIMIT_EXCEEDED,
            ConditionSeverity::Warning,
            "first",
        );
        let earlier = Utc::now() - Duration::minutes(3);
        set.0
            .get_mut(types::HETZNER_API_REACHABLE)
            .expect("condition was just set")
            .last_transition_time = earlier;

        // Same status, new message: time is kept
        set.mark_false(
            types::HETZNER_API_REACHABLE,
            reasons::RATE_LIMIT_EXCEEDED,
            ConditionSeverity::Warning,
            "second",
        );
        let cond = set.get(types::HETZNER_API_REACHABLE).expect("present");
        assert_eq!(cond.message, "second");
        assert_eq!(cond.last_transition_time, earlier);

        // Flip: time moves
        set.mark_true(types::HETZNER_API_REACHABLE);
        let cond = set.get(types::HETZNER_API_REACHABLE).expect("present");
        assert!(cond.is_true());
        assert!(cond.last_transition_time > earlier);
        assert!(cond.reason.is_empty());
    }

    #[test]
    fn keys_are_unique_per_type() {
        let mut set = Conditions::new();
        set.mark_true(types::NETWORK_READY);
        set.mark_true(types::NETWORK_READY);
        set.mark_false(
            types::NETWORK_READY,
            reasons::NETWORK_RECONCILE_FAILED,
            ConditionSeverity::Error,
            "boom",
        );
        assert_eq!(set.len(), 1);
        assert!(set.is_false(types::NETWORK_READY));
    }

    #[test]
    fn deserializing_a_list_with_duplicates_keeps_the_last() {
        let json = r#"[
            {"type":"Ready","status":"False","lastTransitionTime":"2024-01-01T00:00:00Z"},
            {"type":"Ready","status":"True","lastTransitionTime":"2024-01-02T00:00:00Z"}
        ]"#;
        let set: Conditions = serde_json::from_str(json).expect("valid condition list");
        assert_eq!(set.len(), 1);
        assert!(set.is_true(types::READY));
    }

    #[test]
    fn serializes_as_sorted_list_without_empty_fields() {
        let mut set = Conditions::new();
        set.mark_true(types::NETWORK_READY);
        set.mark_true(types::INSTANCE_READY);
        let value = serde_json::to_value(&set).expect("serializable");
        let list = value.as_array().expect("conditions serialize as a list");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["type"], "InstanceReady");
        assert!(list[0].get("reason").is_none());
        assert!(list[0].get("severity").is_none());
    }

    /// Story: the Ready summary reports the worst problem
    #[test]
    fn story_summary_reports_most_severe_false_condition() {
        let mut set = Conditions::new();
        set.mark_true(types::NETWORK_READY);
        set.mark_false(
            types::TARGET_CLUSTER_READY,
            reasons::KUBECONFIG_NOT_FOUND,
            ConditionSeverity::Info,
            "no kubeconfig yet",
        );
        set.mark_false(
            types::HCLOUD_TOKEN_AVAILABLE,
            reasons::CREDENTIALS_INVALID,
            ConditionSeverity::Error,
            "empty token",
        );

        set.set_summary();
        let ready = set.get(types::READY).expect("summary is set");
        assert!(ready.is_false());
        assert_eq!(ready.reason, reasons::CREDENTIALS_INVALID);
        assert_eq!(ready.severity, Some(ConditionSeverity::Error));

        set.mark_true(types::HCLOUD_TOKEN_AVAILABLE);
        set.mark_true(types::TARGET_CLUSTER_READY);
        set.set_summary();
        assert!(set.is_true(types::READY));
    }

    #[test]
    fn empty_set_is_shared_and_empty() {
        assert!(Conditions::empty().is_empty());
        assert_eq!(Conditions::empty().get(types::READY), None);
    }
}
