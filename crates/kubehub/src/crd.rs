//! The `GeneratedSecret` custom resource and its mapping onto the core model.

use std::collections::BTreeMap;

use gensec_core::{Blueprint, BlueprintStatus, DerivedSecret, FieldSpec, ObjectKey, OwnerRef, SecretTemplate};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired secret keys and how to generate them.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "mkm.pub",
    version = "v1alpha1",
    kind = "GeneratedSecret",
    namespaced,
    status = "GeneratedSecretStatus",
    shortname = "gs",
    printcolumn = r#"{"name":"Observed","type":"integer","jsonPath":".status.observedGeneration"}"#
)]
pub struct GeneratedSecretSpec {
    /// Secret data keys to maintain.
    #[serde(default)]
    pub data: BTreeMap<String, KeySpec>,
    /// Fallback for unset per-key attributes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<KeySpec>,
    /// Labels and annotations stamped on the generated Secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct KeySpec {
    /// Value length in characters (or bytes when binary). 0 means unset.
    #[serde(default)]
    pub length: u32,
    /// Characters to draw from; empty means the built-in alphanumeric set.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alphabet: String,
    /// Raw random bytes instead of characters.
    #[serde(default)]
    pub binary: bool,
    /// Maximum age before the value is rotated, e.g. `720h`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct TemplateSpec {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedSecretStatus {
    #[serde(default)]
    pub observed_generation: i64,
}

impl From<&KeySpec> for FieldSpec {
    fn from(k: &KeySpec) -> Self {
        FieldSpec { length: k.length, alphabet: k.alphabet.clone(), binary: k.binary, ttl: k.ttl.clone() }
    }
}

impl From<&TemplateSpec> for SecretTemplate {
    fn from(t: &TemplateSpec) -> Self {
        SecretTemplate { labels: t.labels.clone(), annotations: t.annotations.clone() }
    }
}

impl GeneratedSecret {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn to_blueprint(&self) -> Blueprint {
        Blueprint {
            key: self.key(),
            uid: self.uid().unwrap_or_default(),
            api_version: GeneratedSecret::api_version(&()).into_owned(),
            kind: GeneratedSecret::kind(&()).into_owned(),
            generation: self.metadata.generation.unwrap_or_default(),
            resource_version: self.resource_version(),
            fields: self.spec.data.iter().map(|(k, v)| (k.clone(), v.into())).collect(),
            default: self.spec.default.as_ref().map(Into::into),
            template: self.spec.template.as_ref().map(Into::into),
            status: BlueprintStatus {
                observed_generation: self.status.as_ref().map(|s| s.observed_generation).unwrap_or_default(),
            },
        }
    }
}

pub fn derived_from_secret(secret: &Secret) -> DerivedSecret {
    let mut out = DerivedSecret::new(ObjectKey::new(secret.namespace().unwrap_or_default(), secret.name_any()));
    out.owners = secret
        .owner_references()
        .iter()
        .map(|o| OwnerRef { api_version: o.api_version.clone(), kind: o.kind.clone(), name: o.name.clone(), uid: o.uid.clone() })
        .collect();
    out.labels = secret.labels().clone();
    out.annotations = secret.annotations().clone();
    if let Some(data) = &secret.data {
        out.data = data.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect();
    }
    out
}

/// Apply body for `derived`: only the keys this controller manages.
pub fn secret_from_derived(derived: &DerivedSecret) -> Secret {
    let owners = derived
        .owners
        .iter()
        .map(|o| OwnerReference {
            api_version: o.api_version.clone(),
            kind: o.kind.clone(),
            name: o.name.clone(),
            uid: o.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
        .collect();
    Secret {
        metadata: ObjectMeta {
            name: Some(derived.key.name.clone()),
            namespace: Some(derived.key.namespace.clone()),
            labels: Some(derived.labels.clone()),
            annotations: Some(derived.annotations.clone()),
            owner_references: Some(owners),
            ..Default::default()
        },
        data: Some(derived.data.iter().map(|(k, v)| (k.clone(), ByteString(v.clone()))).collect()),
        ..Default::default()
    }
}
