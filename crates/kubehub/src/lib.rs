//! Gensec kubehub: the `GeneratedSecret` custom resource, a [`gensec_reconcile::Store`]
//! backed by the API server and the controller loop.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::Client;

pub mod controller;
pub mod crd;
pub mod store;

pub use controller::{run_controller, ControllerOptions};
pub use crd::{GeneratedSecret, GeneratedSecretSpec, GeneratedSecretStatus, KeySpec, TemplateSpec};
pub use store::KubeStore;

/// Client from the ambient kubeconfig or in-cluster service account.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client (kubeconfig or in-cluster)")
}
