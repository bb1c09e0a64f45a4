//! HCloudRemediation CRD and the remediation types shared with bare metal

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Conditions;
use crate::impl_has_conditions;

/// HCloudRemediation reboots the server of an unhealthy machine before
/// handing the machine back to CAPI for replacement.
///
/// Created by a MachineHealthCheck from an HCloudRemediationTemplate; owned by
/// the CAPI Machine it remediates.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "HCloudRemediation",
    namespaced,
    status = "RemediationStatus",
    shortname = "hcr",
    category = "cluster-api",
    printcolumn = r#"{"name":"Strategy","type":"string","jsonPath":".spec.strategy.type"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Retries","type":"integer","jsonPath":".status.retryCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct HCloudRemediationSpec {
    /// How to remediate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RemediationStrategy>,
}

/// Remediation strategy
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemediationStrategy {
    /// Kind of remediation
    #[serde(rename = "type", default)]
    pub type_: RemediationType,

    /// Reboots after the first one before giving up
    #[serde(default)]
    pub retry_limit: u32,

    /// Time to wait for the machine to become healthy after each reboot,
    /// as a duration string such as `5m` or `1m30s`
    pub timeout: String,
}

impl RemediationStrategy {
    /// The parsed timeout
    pub fn timeout(&self) -> crate::Result<Duration> {
        parse_duration(&self.timeout)
    }
}

/// Kind of remediation
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RemediationType {
    /// Reboot the server
    #[default]
    Reboot,
    /// Anything this provider cannot do
    #[serde(other)]
    Unsupported,
}

/// Phase of a remediation
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RemediationPhase {
    /// Rebooting and waiting between reboots
    #[default]
    Running,
    /// Out of retries, waiting for the last reboot to take effect
    Waiting,
    /// Handed over to CAPI, which deletes the machine
    #[serde(rename = "Deleting machine")]
    Deleting,
}

/// Observed state of a remediation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemediationStatus {
    /// Current phase; Running when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<RemediationPhase>,

    /// Reboots performed so far
    #[serde(default)]
    pub retry_count: u32,

    /// Time of the last reboot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_remediated: Option<DateTime<Utc>>,

    /// Conditions
    #[serde(default)]
    pub conditions: Conditions,
}

impl RemediationStatus {
    /// The phase, treating unset as Running
    pub fn phase(&self) -> RemediationPhase {
        self.phase.unwrap_or_default()
    }

    /// Time to wait before the next remediation step
    ///
    /// The full timeout when nothing was remediated yet, zero once the
    /// timeout has elapsed since the last reboot (the boundary included),
    /// otherwise the remaining time plus one second.
    pub fn time_until_next_remediation(&self, timeout: Duration, now: DateTime<Utc>) -> Duration {
        let Some(last) = self.last_remediated else {
            return timeout;
        };
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        if elapsed >= timeout {
            return Duration::ZERO;
        }
        timeout - elapsed + Duration::from_secs(1)
    }

    /// Record a reboot at `now`
    pub fn record_remediation(&mut self, now: DateTime<Utc>) {
        self.last_remediated = Some(now);
        self.retry_count += 1;
    }
}

impl_has_conditions!(HCloudRemediation);

impl HCloudRemediation {
    /// Mutable status, created on first use
    pub fn status_mut(&mut self) -> &mut RemediationStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

/// Parse a duration string of the form `300ms`, `1.5h` or `2h45m`
///
/// Units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. A bare `0` is
/// accepted; anything else needs a unit.
pub fn parse_duration(input: &str) -> crate::Result<Duration> {
    let invalid = || crate::Error::validation_for("timeout", format!("invalid duration {input:?}"));

    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total += value * seconds_per_unit;
    }

    Duration::try_from_secs_f64(total).map_err(|_| invalid())
}
