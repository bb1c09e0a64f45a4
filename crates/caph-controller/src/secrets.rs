//! Shared credential secrets
//!
//! Several clusters may point at the same secret. Each holder leaves a marker
//! annotation on it; the secret carries the shared finalizer exactly while at
//! least one marker is present, so it cannot be deleted from under a cluster
//! that still needs it.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use caph_common::conditions::{reasons, types};
use caph_common::labels::{OWNED, SECRET_ENVIRONMENT_LABEL, SECRET_FINALIZER, SECRET_HOLDER_PREFIX};
use caph_common::{ConditionSeverity, Conditions, Error, Result};

use crate::store::{self, resource_of, ObjectPatch, ObjectStore};
use crate::SECRET_REQUEUE;

/// Namespace and name of a secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretKey {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl SecretKey {
    /// Key for `namespace/name`
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The object holding a reference to a secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretHolder {
    /// UID of the holder
    pub uid: String,
    /// Kind of the holder
    pub kind: String,
    /// Namespace of the holder
    pub namespace: String,
    /// Name of the holder
    pub name: String,
}

impl SecretHolder {
    /// Holder identity of a typed resource
    pub fn of<K: kube::Resource<DynamicType = ()>>(object: &K) -> Self {
        Self {
            uid: object.meta().uid.clone().unwrap_or_default(),
            kind: K::kind(&()).to_string(),
            namespace: object.meta().namespace.clone().unwrap_or_default(),
            name: object.meta().name.clone().unwrap_or_default(),
        }
    }

    fn marker_key(&self) -> String {
        format!("{SECRET_HOLDER_PREFIX}{}", self.uid)
    }

    fn marker_value(&self) -> String {
        format!("{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Reference-counts secrets through holder markers
pub struct SecretManager {
    store: Arc<dyn ObjectStore>,
}

impl SecretManager {
    /// Manager writing through `store`
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Fetch a secret and, if asked, register `holder` on it
    ///
    /// A missing secret is an error only when `required`. Registration adds
    /// the holder marker, the environment label and the shared finalizer in
    /// one write guarded by the resource version that was read.
    pub async fn acquire_secret(
        &self,
        key: &SecretKey,
        holder: &SecretHolder,
        required: bool,
        add_finalizer: bool,
    ) -> Result<Option<Secret>> {
        let secret = match store::get::<Secret>(self.store.as_ref(), &key.namespace, &key.name).await {
            Ok(Some(secret)) => secret,
            Ok(None) if required => {
                return Err(Error::SecretUnreachable {
                    namespace: key.namespace.clone(),
                    name: key.name.clone(),
                    message: "secret not found".to_string(),
                })
            }
            Ok(None) => return Ok(None),
            Err(e) => {
                return Err(Error::SecretUnreachable {
                    namespace: key.namespace.clone(),
                    name: key.name.clone(),
                    message: e.to_string(),
                })
            }
        };

        if !add_finalizer {
            return Ok(Some(secret));
        }

        let marker = holder.marker_key();
        let has_marker = secret.annotations().get(&marker) == Some(&holder.marker_value());
        let has_label = secret.labels().get(SECRET_ENVIRONMENT_LABEL).map(String::as_str) == Some(OWNED);
        let has_finalizer = secret.finalizers().iter().any(|f| f == SECRET_FINALIZER);
        if has_marker && has_label && has_finalizer {
            return Ok(Some(secret));
        }

        let mut finalizers = secret.finalizers().to_vec();
        if !has_finalizer {
            finalizers.push(SECRET_FINALIZER.to_string());
        }
        let patch = ObjectPatch {
            metadata: Some(json!({
                "annotations": { marker: holder.marker_value() },
                "labels": { SECRET_ENVIRONMENT_LABEL: OWNED },
                "finalizers": finalizers,
            })),
            resource_version: secret.resource_version(),
            ..Default::default()
        };
        self.store
            .patch(&resource_of::<Secret>(), &key.namespace, &key.name, &patch)
            .await?;
        info!(secret = %key, holder = %holder.marker_value(), "acquired secret");
        Ok(Some(secret))
    }

    /// Drop `holder`'s marker; the finalizer goes with the last marker
    ///
    /// A missing secret is not an error.
    pub async fn release_secret(&self, key: &SecretKey, holder: &SecretHolder) -> Result<()> {
        let Some(secret) = store::get::<Secret>(self.store.as_ref(), &key.namespace, &key.name).await?
        else {
            debug!(secret = %key, "secret already gone");
            return Ok(());
        };

        let marker = holder.marker_key();
        let annotations = secret.annotations();
        let others = annotations
            .keys()
            .filter(|k| k.starts_with(SECRET_HOLDER_PREFIX) && **k != marker)
            .count();
        let holds = annotations.contains_key(&marker);
        let has_finalizer = secret.finalizers().iter().any(|f| f == SECRET_FINALIZER);
        let drop_finalizer = others == 0 && has_finalizer;
        if !holds && !drop_finalizer {
            return Ok(());
        }

        let mut metadata = Map::new();
        if holds {
            metadata.insert("annotations".to_string(), json!({ marker: Value::Null }));
        }
        if drop_finalizer {
            let finalizers: Vec<&String> = secret
                .finalizers()
                .iter()
                .filter(|f| *f != SECRET_FINALIZER)
                .collect();
            metadata.insert("finalizers".to_string(), json!(finalizers));
        }
        let patch = ObjectPatch {
            metadata: Some(Value::Object(metadata)),
            resource_version: secret.resource_version(),
            ..Default::default()
        };
        match self
            .store
            .patch(&resource_of::<Secret>(), &key.namespace, &key.name, &patch)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }
        info!(secret = %key, holder = %holder.marker_value(), remaining = others, "released secret");
        Ok(())
    }
}

/// Read the API token stored under `data_key`
///
/// A missing or blank value means the credentials are invalid; retrying will
/// not help until the secret changes.
pub fn token_from_secret(secret: &Secret, key: &SecretKey, data_key: &str) -> Result<String> {
    let value = secret
        .data
        .as_ref()
        .and_then(|d| d.get(data_key))
        .map(|v| String::from_utf8_lossy(&v.0).trim().to_string())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|d| d.get(data_key))
                .map(|v| v.trim().to_string())
        })
        .unwrap_or_default();

    if value.is_empty() {
        return Err(Error::CredentialsInvalid {
            namespace: key.namespace.clone(),
            name: key.name.clone(),
            message: format!("key {data_key:?} is missing or empty"),
        });
    }
    Ok(value)
}

/// Mirror the outcome of a credentials lookup into `HCloudTokenAvailable`
pub fn mark_token_availability<T>(conditions: &mut Conditions, result: &Result<T>) {
    match result {
        Ok(_) => conditions.mark_true(types::HCLOUD_TOKEN_AVAILABLE),
        Err(e @ Error::CredentialsInvalid { .. }) => conditions.mark_false(
            types::HCLOUD_TOKEN_AVAILABLE,
            reasons::CREDENTIALS_INVALID,
            ConditionSeverity::Error,
            e.to_string(),
        ),
        Err(e) => conditions.mark_false(
            types::HCLOUD_TOKEN_AVAILABLE,
            reasons::HETZNER_SECRET_UNREACHABLE,
            ConditionSeverity::Error,
            e.to_string(),
        ),
    }
}

/// Turn a credentials failure into the retry it calls for
///
/// An unreachable secret is retried on a fixed delay. Invalid credentials
/// wait for the secret to change.
pub fn credentials_failure(error: Error) -> Result<Action> {
    match error {
        Error::SecretUnreachable { .. } => {
            warn!(error = %error, "cloud credentials unreachable");
            Ok(Action::requeue(SECRET_REQUEUE))
        }
        Error::CredentialsInvalid { .. } => {
            warn!(error = %error, "cloud credentials invalid");
            Ok(Action::await_change())
        }
        other => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::FakeStore;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret(token: &str) -> Secret {
        Secret {
            metadata: kube::core::ObjectMeta {
                name: Some("hetzner".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "hcloud".to_string(),
                ByteString(token.as_bytes().to_vec()),
            )])),
            ..Default::default()
        }
    }

    fn holder(n: usize) -> SecretHolder {
        SecretHolder {
            uid: format!("uid-{n}"),
            kind: "HetznerCluster".to_string(),
            namespace: "default".to_string(),
            name: format!("cluster-{n}"),
        }
    }

    fn key() -> SecretKey {
        SecretKey::new("default", "hetzner")
    }

    fn markers(secret: &Secret) -> usize {
        secret
            .annotations()
            .keys()
            .filter(|k| k.starts_with(SECRET_HOLDER_PREFIX))
            .count()
    }

    fn has_finalizer(secret: &Secret) -> bool {
        secret.finalizers().iter().any(|f| f == SECRET_FINALIZER)
    }

    /// Story: a secret shared by three clusters outlives all but the last
    ///
    /// Three clusters acquire the same secret. Releasing two of them must
    /// leave the third marker and the finalizer in place; the final release
    /// removes both.
    #[tokio::test]
    async fn story_refcount_keeps_finalizer_until_last_release() {
        let store = Arc::new(FakeStore::new());
        store.insert(&secret("token"));
        let manager = SecretManager::new(store.clone());

        for n in 0..3 {
            manager
                .acquire_secret(&key(), &holder(n), true, true)
                .await
                .expect("acquire");
        }
        let current: Secret = store.read("default", "hetzner").expect("secret");
        assert_eq!(markers(&current), 3);
        assert!(has_finalizer(&current));
        assert_eq!(
            current.labels().get(SECRET_ENVIRONMENT_LABEL).map(String::as_str),
            Some(OWNED)
        );

        for n in 0..2 {
            manager.release_secret(&key(), &holder(n)).await.expect("release");
        }
        let current: Secret = store.read("default", "hetzner").expect("secret");
        assert_eq!(markers(&current), 1);
        assert!(has_finalizer(&current));

        manager.release_secret(&key(), &holder(2)).await.expect("release");
        let current: Secret = store.read("default", "hetzner").expect("secret");
        assert_eq!(markers(&current), 0);
        assert!(!has_finalizer(&current));
    }

    #[tokio::test]
    async fn acquiring_twice_writes_once() {
        let store = Arc::new(FakeStore::new());
        store.insert(&secret("token"));
        let manager = SecretManager::new(store.clone());

        manager.acquire_secret(&key(), &holder(0), true, true).await.expect("acquire");
        manager.acquire_secret(&key(), &holder(0), true, true).await.expect("acquire");
        assert_eq!(store.patch_count(), 1);
    }

    #[tokio::test]
    async fn missing_secret_is_only_an_error_when_required() {
        let store = Arc::new(FakeStore::new());
        let manager = SecretManager::new(store);

        let optional = manager
            .acquire_secret(&key(), &holder(0), false, false)
            .await
            .expect("optional lookup succeeds");
        assert!(optional.is_none());

        let err = manager
            .acquire_secret(&key(), &holder(0), true, true)
            .await
            .expect_err("required lookup fails");
        assert!(matches!(err, Error::SecretUnreachable { .. }));
        assert!(err.is_credentials_error());

        manager
            .release_secret(&key(), &holder(0))
            .await
            .expect("release of a missing secret is a no-op");
    }

    #[test]
    fn blank_token_is_invalid_credentials() {
        assert_eq!(
            token_from_secret(&secret(" abc \n"), &key(), "hcloud").expect("token"),
            "abc"
        );

        let err = token_from_secret(&secret(""), &key(), "hcloud").expect_err("blank");
        assert!(matches!(err, Error::CredentialsInvalid { .. }));

        let err = token_from_secret(&secret("abc"), &key(), "other").expect_err("missing key");
        assert!(matches!(err, Error::CredentialsInvalid { .. }));
    }
}
