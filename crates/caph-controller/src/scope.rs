//! Reconcile transactions over a single object
//!
//! A [`Scope`] snapshots the object when opened. Reconcilers mutate the
//! in-memory copy and [`Scope::close`] writes the difference back in one
//! patch, whatever the outcome of the reconcile was.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use caph_common::conditions::{reasons, types};
use caph_common::rate_limit::{mark_rate_limited, RATE_LIMIT_REQUEUE};
use caph_common::{ConditionSeverity, HasConditions, Result};

use crate::store::{merge_diff, resource_of, ObjectPatch, ObjectStore};

/// Open transaction over one object
pub struct Scope<K> {
    store: Arc<dyn ObjectStore>,
    snapshot: Value,
    object: K,
}

impl<K> Scope<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + HasConditions,
{
    /// Open a scope over `object` as read from the API
    pub fn open(store: Arc<dyn ObjectStore>, object: K) -> Result<Self> {
        let snapshot = serde_json::to_value(&object)?;
        Ok(Self {
            store,
            snapshot,
            object,
        })
    }

    /// The working copy
    pub fn object(&self) -> &K {
        &self.object
    }

    /// Mutable working copy
    pub fn object_mut(&mut self) -> &mut K {
        &mut self.object
    }

    /// Store used for the final flush
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Name of the object
    pub fn name(&self) -> String {
        self.object.name_any()
    }

    /// Namespace of the object
    pub fn namespace(&self) -> String {
        self.object.namespace().unwrap_or_default()
    }

    /// Condition set of the working copy
    pub fn conditions_mut(&mut self) -> &mut caph_common::Conditions {
        self.object.conditions_mut()
    }

    /// Write pending changes now and take a fresh snapshot
    ///
    /// Used to persist finalizers before any external side effect.
    pub async fn persist(&mut self) -> Result<()> {
        let current = serde_json::to_value(&self.object)?;
        let patch = diff(&self.snapshot, &current);
        if !patch.is_empty() {
            self.write(&patch).await?;
        }
        self.snapshot = current;
        Ok(())
    }

    /// Finish the reconcile
    ///
    /// Folds cloud API failures into conditions, recomputes the Ready
    /// summary and flushes. A rate-limited pass turns into a plain requeue.
    /// If the flush fails after a successful pass its error is returned;
    /// after a failed pass the original error wins.
    pub async fn close(mut self, result: Result<Action>) -> Result<Action> {
        let result = match result {
            Err(e) if e.is_unauthorized() => {
                self.object.conditions_mut().mark_false(
                    types::HCLOUD_TOKEN_AVAILABLE,
                    reasons::CREDENTIALS_INVALID,
                    ConditionSeverity::Error,
                    e.to_string(),
                );
                Err(e)
            }
            Err(e) if e.is_rate_limited() => {
                mark_rate_limited(self.object.conditions_mut(), &e.to_string());
                Ok(Action::requeue(RATE_LIMIT_REQUEUE))
            }
            other => other,
        };

        if !self.object.conditions().is_empty() {
            self.object.conditions_mut().set_summary();
        }

        let current = serde_json::to_value(&self.object)?;
        let patch = diff(&self.snapshot, &current);
        if patch.is_empty() {
            return result;
        }

        match (self.write(&patch).await, result) {
            (Ok(()), result) => result,
            (Err(e), result) if e.is_not_found() => {
                debug!(name = %self.object.name_any(), "object gone before flush");
                result
            }
            (Err(e), Ok(_)) => Err(e),
            (Err(flush), Err(e)) => {
                warn!(name = %self.object.name_any(), error = %flush, "failed to flush after error");
                Err(e)
            }
        }
    }

    async fn write(&self, patch: &ObjectPatch) -> Result<()> {
        self.store
            .patch(
                &resource_of::<K>(),
                &self.object.namespace().unwrap_or_default(),
                &self.object.name_any(),
                patch,
            )
            .await
    }
}

fn tracked_metadata(object: &Value) -> Value {
    let meta = &object["metadata"];
    json!({
        "finalizers": meta.get("finalizers").cloned().unwrap_or(Value::Null),
        "annotations": meta.get("annotations").cloned().unwrap_or(Value::Null),
        "labels": meta.get("labels").cloned().unwrap_or(Value::Null),
    })
}

/// The patch turning `old` into `new`, limited to what a scope may change
fn diff(old: &Value, new: &Value) -> ObjectPatch {
    let part = |key: &str| {
        let old = old.get(key).cloned().unwrap_or(Value::Null);
        let new = new.get(key).cloned().unwrap_or(Value::Null);
        merge_diff(&old, &new)
    };
    ObjectPatch {
        metadata: merge_diff(&tracked_metadata(old), &tracked_metadata(new)),
        spec: part("spec"),
        status: part("status"),
        resource_version: None,
    }
}
