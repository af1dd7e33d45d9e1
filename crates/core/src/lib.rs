//! Gensec core types: blueprints, derived secrets and the per-field logic
//! (spec resolution, validation, sampling). Nothing in here does I/O.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod annotations;
pub mod sample;
pub mod spec;
pub mod validate;

pub use annotations::{field_from_timestamp_key, is_engine_key, timestamp_key, ANNOTATION_PREFIX};
pub use sample::{sample, Entropy, EntropyError, OsEntropy};
pub use spec::{resolve, EffectiveSpec, InheritPolicy, DEFAULT_ALPHABET, DEFAULT_LENGTH};
pub use validate::{check_field_name, format_timestamp, parse_timestamp, parse_ttl, validate, Validity};

/// Namespace + name identity shared by a blueprint and its derived secret.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Parse `namespace/name`.
    pub fn parse(s: &str) -> Option<Self> {
        let (ns, name) = s.split_once('/')?;
        if ns.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(ns, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Per-field generation parameters as written in the blueprint.
///
/// Zero/empty values mean "unset"; see [`spec::resolve`] for how they are filled.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    #[serde(default)]
    pub length: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alphabet: String,
    #[serde(default)]
    pub binary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

/// Labels and annotations copied onto the derived secret.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintStatus {
    pub observed_generation: i64,
}

/// Declarative description of the secret fields to maintain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Blueprint {
    pub key: ObjectKey,
    pub uid: String,
    pub api_version: String,
    pub kind: String,
    /// Bumped by the storage layer on every spec change.
    pub generation: i64,
    /// Opaque version token used for conditional status writes.
    pub resource_version: Option<String>,
    pub fields: BTreeMap<String, FieldSpec>,
    pub default: Option<FieldSpec>,
    pub template: Option<SecretTemplate>,
    pub status: BlueprintStatus,
}

impl Blueprint {
    pub fn owner_ref(&self) -> OwnerRef {
        OwnerRef {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.key.name.clone(),
            uid: self.uid.clone(),
        }
    }

    pub fn is_observed(&self) -> bool {
        self.status.observed_generation == self.generation
    }
}

/// Back-reference from the derived secret to its blueprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

/// The secret object maintained from a blueprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DerivedSecret {
    pub key: ObjectKey,
    pub owners: Vec<OwnerRef>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl DerivedSecret {
    pub fn new(key: ObjectKey) -> Self {
        Self { key, owners: Vec::new(), labels: BTreeMap::new(), annotations: BTreeMap::new(), data: BTreeMap::new() }
    }
}

/// Errors raised while evaluating a single field.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("field {field}: malformed timestamp {value:?}: {source}")]
    Timestamp {
        field: String,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("field {field}: malformed ttl {value:?}: {reason}")]
    Duration { field: String, value: String, reason: String },
    #[error("field {field}: {source}")]
    Entropy {
        field: String,
        #[source]
        source: EntropyError,
    },
    #[error("invalid field name {0:?} (expect [-._a-zA-Z0-9]+, at most 61 chars)")]
    InvalidFieldName(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use super::{
        Blueprint, BlueprintStatus, DerivedSecret, EffectiveSpec, Entropy, FieldSpec, InheritPolicy, ObjectKey, OwnerRef,
        SecretTemplate, Validity,
    };
}
