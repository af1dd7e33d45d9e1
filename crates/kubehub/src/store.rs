//! [`Store`] over the Kubernetes API.

use async_trait::async_trait;
use gensec_core::{Blueprint, BlueprintStatus, DerivedSecret, ObjectKey};
use gensec_reconcile::{Store, StoreError};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::debug;

use crate::crd::{derived_from_secret, secret_from_derived, GeneratedSecret};

/// Reads and writes `GeneratedSecret`s and their `Secret`s with a live client.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn blueprints(&self, ns: &str) -> Api<GeneratedSecret> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn secrets(&self, ns: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), ns)
    }
}

/// 409 is the only status the engine treats differently from "try again".
pub(crate) fn store_error(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message),
        e => StoreError::Transient(e.to_string()),
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn fetch_blueprint(&self, key: &ObjectKey) -> Result<Option<Blueprint>, StoreError> {
        let gs = self.blueprints(&key.namespace).get_opt(&key.name).await.map_err(store_error)?;
        Ok(gs.map(|gs| gs.to_blueprint()))
    }

    async fn fetch_derived(&self, key: &ObjectKey) -> Result<Option<DerivedSecret>, StoreError> {
        let secret = self.secrets(&key.namespace).get_opt(&key.name).await.map_err(store_error)?;
        Ok(secret.as_ref().map(derived_from_secret))
    }

    async fn upsert_derived(&self, secret: &DerivedSecret, field_manager: &str) -> Result<(), StoreError> {
        let body = secret_from_derived(secret);
        let pp = PatchParams::apply(field_manager);
        self.secrets(&secret.key.namespace)
            .patch(&secret.key.name, &pp, &Patch::Apply(&body))
            .await
            .map_err(store_error)?;
        debug!(key = %secret.key, field_manager, "secret applied");
        Ok(())
    }

    async fn update_status(&self, blueprint: &Blueprint, status: BlueprintStatus) -> Result<(), StoreError> {
        // resourceVersion in a merge patch turns it into a conditional write.
        let patch = json!({
            "metadata": { "resourceVersion": blueprint.resource_version },
            "status": { "observedGeneration": status.observed_generation },
        });
        self.blueprints(&blueprint.key.namespace)
            .patch_status(&blueprint.key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(store_error)?;
        Ok(())
    }
}
