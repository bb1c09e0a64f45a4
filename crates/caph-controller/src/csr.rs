//! Kubelet serving certificate approval
//!
//! Runs inside a workload cluster manager. Kubelets ask for serving
//! certificates through CertificateSigningRequests; a request is approved
//! only if it names a machine of the cluster and asks for nothing beyond
//! that machine's name and addresses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::{watcher, Controller};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

#[cfg(test)]
use mockall::automock;

use caph_common::crd::{AddressType, HCloudMachine};
use caph_common::events::{actions, reasons as event_reasons, EventPublisher};
use caph_common::{Error, Result, FIELD_MANAGER};

use crate::store::{self, ObjectStore};
use crate::ERROR_REQUEUE;

/// Username prefix of kubelets
pub const NODE_USER_PREFIX: &str = "system:node:";

/// Organization of kubelet certificates
pub const NODES_GROUP: &str = "system:nodes";

/// Requests older than this are denied
pub const MAX_CSR_AGE: Duration = Duration::from_secs(60 * 60);

/// Requeue while the machine of a request is not known yet
pub const MACHINE_REQUEUE: Duration = Duration::from_secs(5);

/// Reason of an approval
pub const APPROVED_REASON: &str = "CSRValidationSucceed";

/// Reason of a denial after validation
pub const DENIED_REASON: &str = "CSRValidationFailed";

/// Reason of a denial of a stale request
pub const TOO_OLD_REASON: &str = "CSRTooOld";

/// Verdict on a request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    /// Approve or deny
    pub approved: bool,
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable message
    pub message: String,
}

impl Decision {
    fn approve(message: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: APPROVED_REASON.to_string(),
            message: message.into(),
        }
    }

    fn deny(reason: &str, message: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

/// Writes decisions to the approval subresource
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CsrDecider: Send + Sync {
    /// Record the decision on the named request
    async fn decide(&self, name: &str, decision: Decision) -> Result<()>;
}

/// [`CsrDecider`] against a workload cluster
pub struct KubeCsrDecider {
    api: Api<CertificateSigningRequest>,
}

impl KubeCsrDecider {
    /// Decider using the given workload client
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl CsrDecider for KubeCsrDecider {
    async fn decide(&self, name: &str, decision: Decision) -> Result<()> {
        let condition_type = if decision.approved { "Approved" } else { "Denied" };
        let now = Utc::now().to_rfc3339();
        let patch = json!({
            "status": {
                "conditions": [{
                    "type": condition_type,
                    "status": "True",
                    "reason": decision.reason,
                    "message": decision.message,
                    "lastUpdateTime": now,
                    "lastTransitionTime": now,
                }]
            }
        });
        self.api
            .patch_subresource(
                "approval",
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

/// Shared state of the approval loop
pub struct CsrContext {
    /// Management cluster store, to look up machines
    pub store: Arc<dyn ObjectStore>,
    /// Writes decisions into the workload cluster
    pub decider: Arc<dyn CsrDecider>,
    /// Event sink in the management cluster
    pub events: Arc<dyn EventPublisher>,
    /// Namespace of the cluster's machines
    pub namespace: String,
}

/// Watch requests in the workload cluster until cancelled
pub async fn run(client: Client, ctx: Arc<CsrContext>, cancel: CancellationToken) {
    let namespace = ctx.namespace.clone();
    info!(namespace = %namespace, "starting CSR approval");
    Controller::new(Api::<CertificateSigningRequest>::all(client), watcher::Config::default())
        .graceful_shutdown_on(cancel.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Err(e) = result {
                debug!(error = %e, "CSR reconcile failed");
            }
        })
        .await;
    info!(namespace = %namespace, "CSR approval stopped");
}

/// Decide one request
#[instrument(skip(csr, ctx), fields(csr = %csr.name_any()))]
pub async fn reconcile(csr: Arc<CertificateSigningRequest>, ctx: Arc<CsrContext>) -> Result<Action> {
    if is_decided(&csr) {
        return Ok(Action::await_change());
    }
    let Some(node) = csr
        .spec
        .username
        .as_deref()
        .and_then(|u| u.strip_prefix(NODE_USER_PREFIX))
    else {
        return Ok(Action::await_change());
    };
    let name = csr.name_any();

    let created = csr.metadata.creation_timestamp.as_ref().map(|t| t.0);
    let max_age = TimeDelta::from_std(MAX_CSR_AGE).unwrap_or(TimeDelta::MAX);
    if created.is_some_and(|c| Utc::now() - c > max_age) {
        info!(csr = %name, node, "denying stale CSR");
        ctx.decider
            .decide(&name, Decision::deny(TOO_OLD_REASON, "request is older than one hour"))
            .await?;
        return Ok(Action::await_change());
    }

    let Some(machine) = store::get::<HCloudMachine>(ctx.store.as_ref(), &ctx.namespace, node).await?
    else {
        debug!(csr = %name, node, "machine not found yet");
        return Ok(Action::requeue(MACHINE_REQUEUE));
    };

    let decision = match validate(&csr.spec.request.0, node, &machine) {
        Ok(()) => Decision::approve(format!("approved by caph for machine {node}")),
        Err(reason) => Decision::deny(DENIED_REASON, reason),
    };
    ctx.decider.decide(&name, decision.clone()).await?;

    let (type_, reason) = if decision.approved {
        info!(csr = %name, node, "approved CSR");
        (EventType::Normal, event_reasons::CSR_APPROVED)
    } else {
        warn!(csr = %name, node, message = %decision.message, "denied CSR");
        (EventType::Warning, event_reasons::CSR_DENIED)
    };
    ctx.events
        .publish(
            &machine.object_ref(&()),
            type_,
            reason,
            actions::APPROVE,
            Some(format!("{name}: {}", decision.message)),
        )
        .await;
    Ok(Action::await_change())
}

/// Requeue failed decisions
pub fn error_policy(csr: Arc<CertificateSigningRequest>, error: &Error, _ctx: Arc<CsrContext>) -> Action {
    warn!(csr = %csr.name_any(), error = %error, "CSR reconcile failed");
    Action::requeue(ERROR_REQUEUE)
}

fn is_decided(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|c| {
            c.iter()
                .any(|c| c.type_ == "Approved" || c.type_ == "Denied")
        })
}

/// Check a PEM encoded request against the machine it claims to be
pub fn validate(request: &[u8], node: &str, machine: &HCloudMachine) -> std::result::Result<(), String> {
    let pem = pem::parse(request).map_err(|e| format!("invalid PEM: {e}"))?;
    if pem.tag() != "CERTIFICATE REQUEST" {
        return Err(format!("unexpected PEM block {:?}", pem.tag()));
    }
    let (_, csr) = X509CertificationRequest::from_der(pem.contents())
        .map_err(|e| format!("invalid certificate request: {e}"))?;
    csr.verify_signature()
        .map_err(|e| format!("signature does not verify: {e}"))?;

    let subject = &csr.certification_request_info.subject;
    let common_names: Vec<&str> = subject
        .iter_common_name()
        .filter_map(|a| a.as_str().ok())
        .collect();
    let expected_cn = format!("{NODE_USER_PREFIX}{node}");
    if common_names != [expected_cn.as_str()] {
        return Err(format!("subject common name must be {expected_cn}"));
    }
    let organizations: Vec<&str> = subject
        .iter_organization()
        .filter_map(|a| a.as_str().ok())
        .collect();
    if organizations != [NODES_GROUP] {
        return Err(format!("subject organization must be {NODES_GROUP}"));
    }

    let allowed_ips: Vec<IpAddr> = machine
        .status
        .iter()
        .flat_map(|s| s.addresses.iter())
        .filter(|a| matches!(a.type_, AddressType::ExternalIP | AddressType::InternalIP))
        .filter_map(|a| a.address.parse().ok())
        .collect();

    let Some(extensions) = csr.requested_extensions() else {
        return Ok(());
    };
    for extension in extensions {
        let ParsedExtension::SubjectAlternativeName(san) = extension else {
            continue;
        };
        for name in &san.general_names {
            match name {
                GeneralName::DNSName(dns) if *dns == node => {}
                GeneralName::DNSName(dns) => {
                    return Err(format!("DNS name {dns} is not the machine name"));
                }
                GeneralName::RFC822Name(email) => {
                    return Err(format!("email address {email} is not allowed"));
                }
                GeneralName::IPAddress(raw) => {
                    let ip = ip_from_bytes(raw)
                        .ok_or_else(|| format!("malformed IP address of {} bytes", raw.len()))?;
                    if !allowed_ips.contains(&ip) {
                        return Err(format!("IP address {ip} does not belong to the machine"));
                    }
                }
                other => return Err(format!("subject alternative name {other:?} is not allowed")),
            }
        }
    }
    Ok(())
}

fn ip_from_bytes(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => <[u8; 4]>::try_from(raw).ok().map(|b| IpAddr::V4(Ipv4Addr::from(b))),
        16 => <[u8; 16]>::try_from(raw).ok().map(|b| IpAddr::V6(Ipv6Addr::from(b))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::FakeStore;
    use crate::testing::{hcloud_machine, quiet_events};
    use caph_common::crd::MachineAddress;
    use k8s_openapi::api::certificates::v1::CertificateSigningRequestSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use k8s_openapi::ByteString;
    use kube::core::ObjectMeta;
    use rcgen::string::Ia5String;
    use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair, SanType};

    fn machine() -> HCloudMachine {
        let mut machine = hcloud_machine("worker-0");
        machine.status_mut().addresses = vec![
            MachineAddress {
                type_: AddressType::Hostname,
                address: "worker-0".to_string(),
            },
            MachineAddress {
                type_: AddressType::ExternalIP,
                address: "1.2.3.4".to_string(),
            },
            MachineAddress {
                type_: AddressType::InternalIP,
                address: "10.0.0.2".to_string(),
            },
        ];
        machine
    }

    fn request(cn: &str, org: &str, sans: Vec<SanType>) -> String {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(cn.to_string()));
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.to_string()));
        params.distinguished_name = dn;
        params.subject_alt_names = sans;
        let key = KeyPair::generate().expect("key pair");
        params
            .serialize_request(&key)
            .expect("csr")
            .pem()
            .expect("pem")
    }

    fn dns(name: &str) -> SanType {
        SanType::DnsName(Ia5String::try_from(name).expect("ia5"))
    }

    fn ip(addr: &str) -> SanType {
        SanType::IpAddress(addr.parse().expect("ip"))
    }

    #[test]
    fn kubelet_request_for_own_addresses_is_valid() {
        let pem = request(
            "system:node:worker-0",
            "system:nodes",
            vec![dns("worker-0"), ip("1.2.3.4"), ip("10.0.0.2")],
        );
        assert_eq!(validate(pem.as_bytes(), "worker-0", &machine()), Ok(()));
    }

    #[test]
    fn foreign_ip_is_rejected() {
        let pem = request(
            "system:node:worker-0",
            "system:nodes",
            vec![dns("worker-0"), ip("9.9.9.9")],
        );
        let err = validate(pem.as_bytes(), "worker-0", &machine()).unwrap_err();
        assert!(err.contains("9.9.9.9"));
    }

    #[test]
    fn other_dns_names_are_rejected() {
        let pem = request(
            "system:node:worker-0",
            "system:nodes",
            vec![dns("kubernetes.default")],
        );
        assert!(validate(pem.as_bytes(), "worker-0", &machine()).is_err());
    }

    #[test]
    fn email_addresses_are_rejected() {
        let pem = request(
            "system:node:worker-0",
            "system:nodes",
            vec![SanType::Rfc822Name(
                Ia5String::try_from("ops@example.com").expect("ia5"),
            )],
        );
        let err = validate(pem.as_bytes(), "worker-0", &machine()).unwrap_err();
        assert!(err.contains("email"));
    }

    #[test]
    fn subject_must_name_the_node() {
        let wrong_cn = request("system:node:worker-1", "system:nodes", vec![]);
        assert!(validate(wrong_cn.as_bytes(), "worker-0", &machine()).is_err());

        let wrong_org = request("system:node:worker-0", "system:masters", vec![]);
        assert!(validate(wrong_org.as_bytes(), "worker-0", &machine()).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(validate(b"not a pem", "worker-0", &machine()).is_err());
    }

    fn csr_object(username: &str, pem: &str, age: TimeDelta) -> CertificateSigningRequest {
        CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some("csr-abc".to_string()),
                creation_timestamp: Some(Time(Utc::now() - age)),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(pem.as_bytes().to_vec()),
                signer_name: "kubernetes.io/kubelet-serving".to_string(),
                username: Some(username.to_string()),
                ..Default::default()
            },
            status: None,
        }
    }

    fn context(store: FakeStore, decider: MockCsrDecider) -> Arc<CsrContext> {
        Arc::new(CsrContext {
            store: Arc::new(store),
            decider: Arc::new(decider),
            events: Arc::new(quiet_events()),
            namespace: "default".to_string(),
        })
    }

    /// Story: a kubelet of a known machine gets its serving certificate
    #[tokio::test]
    async fn story_known_machine_is_approved() {
        let store = FakeStore::new();
        store.insert(&machine());
        let mut decider = MockCsrDecider::new();
        decider
            .expect_decide()
            .withf(|name, d| name == "csr-abc" && d.approved && d.reason == APPROVED_REASON)
            .times(1)
            .returning(|_, _| Ok(()));

        let pem = request(
            "system:node:worker-0",
            "system:nodes",
            vec![dns("worker-0"), ip("10.0.0.2")],
        );
        let csr = csr_object("system:node:worker-0", &pem, TimeDelta::minutes(1));
        let action = reconcile(Arc::new(csr), context(store, decider))
            .await
            .expect("reconciled");
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn stale_request_is_denied_without_lookup() {
        let mut decider = MockCsrDecider::new();
        decider
            .expect_decide()
            .withf(|_, d| !d.approved && d.reason == TOO_OLD_REASON)
            .times(1)
            .returning(|_, _| Ok(()));

        let csr = csr_object("system:node:worker-0", "", TimeDelta::hours(2));
        reconcile(Arc::new(csr), context(FakeStore::new(), decider))
            .await
            .expect("reconciled");
    }

    #[tokio::test]
    async fn unknown_machine_is_retried() {
        let mut decider = MockCsrDecider::new();
        decider.expect_decide().never();

        let csr = csr_object("system:node:worker-0", "", TimeDelta::minutes(1));
        let action = reconcile(Arc::new(csr), context(FakeStore::new(), decider))
            .await
            .expect("reconciled");
        assert_eq!(action, Action::requeue(MACHINE_REQUEUE));
    }

    #[tokio::test]
    async fn non_node_users_are_ignored() {
        let mut decider = MockCsrDecider::new();
        decider.expect_decide().never();

        let csr = csr_object("system:serviceaccount:default:x", "", TimeDelta::minutes(1));
        reconcile(Arc::new(csr), context(FakeStore::new(), decider))
            .await
            .expect("reconciled");
    }
}
