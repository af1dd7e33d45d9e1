//! Gensec reconciliation engine.
//!
//! One call to [`Reconciler::reconcile`] reads a blueprint and its derived
//! secret, computes the full target secret in memory, writes it with a merge
//! (server-side apply style) write and then advances
//! `status.observedGeneration`. Every call starts from fresh reads; nothing
//! is cached between calls.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use gensec_core::prelude::*;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

mod assemble;
pub mod memory;

pub use assemble::{assemble, Assembled};
pub use memory::{ManualClock, MemoryStore, Op};

/// Writer identity used for merge writes unless configured otherwise.
pub const DEFAULT_FIELD_MANAGER: &str = "generated-secret";

/// Collaborator failures. Absence is `Ok(None)`, not an error.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient: {0}")]
    Transient(String),
}

/// Storage for blueprints and derived secrets.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn fetch_blueprint(&self, key: &ObjectKey) -> Result<Option<Blueprint>, StoreError>;

    async fn fetch_derived(&self, key: &ObjectKey) -> Result<Option<DerivedSecret>, StoreError>;

    /// Create or merge `secret`, attributed to `field_manager`. Keys owned by
    /// other writers must survive.
    async fn upsert_derived(&self, secret: &DerivedSecret, field_manager: &str) -> Result<(), StoreError>;

    /// Persist `status` for `blueprint`, conditional on the resource version
    /// it was fetched at.
    async fn update_status(&self, blueprint: &Blueprint, status: BlueprintStatus) -> Result<(), StoreError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub field_manager: String,
    /// Return early when `observedGeneration == generation` and the secret
    /// still carries every field.
    pub fast_skip: bool,
    pub inherit: InheritPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            fast_skip: true,
            inherit: InheritPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    /// Blueprint not found.
    Deleted,
    /// Status already reflects the current generation.
    UpToDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub generation: i64,
    pub kept: Vec<String>,
    pub generated: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    NoOp(NoOpReason),
    Applied(Applied),
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::NoOp(NoOpReason::Deleted) => "deleted",
            Outcome::NoOp(NoOpReason::UpToDate) => "up_to_date",
            Outcome::Applied(_) => "applied",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Conflict,
    TimestampParse,
    DurationParse,
    Entropy,
    InvalidFieldName,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Conflict => "conflict",
            ErrorKind::TimestampParse => "timestamp_parse",
            ErrorKind::DurationParse => "duration_parse",
            ErrorKind::Entropy => "entropy",
            ErrorKind::InvalidFieldName => "invalid_field_name",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("could not fetch GeneratedSecret {key}: {source}")]
    FetchBlueprint {
        key: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error("could not fetch Secret {key}: {source}")]
    FetchDerived {
        key: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Field(#[from] gensec_core::Error),
    #[error("could not apply Secret {key}: {source}")]
    Upsert {
        key: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error("cannot update status of {key}: {source}")]
    Status {
        key: ObjectKey,
        #[source]
        source: StoreError,
    },
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::FetchBlueprint { source, .. }
            | ReconcileError::FetchDerived { source, .. }
            | ReconcileError::Upsert { source, .. }
            | ReconcileError::Status { source, .. } => match source {
                StoreError::Conflict(_) => ErrorKind::Conflict,
                StoreError::Transient(_) => ErrorKind::Transient,
            },
            ReconcileError::Field(e) => match e {
                gensec_core::Error::Timestamp { .. } => ErrorKind::TimestampParse,
                gensec_core::Error::Duration { .. } => ErrorKind::DurationParse,
                gensec_core::Error::Entropy { .. } => ErrorKind::Entropy,
                gensec_core::Error::InvalidFieldName(_) => ErrorKind::InvalidFieldName,
            },
        }
    }
}

/// The engine. Holds collaborators only; no per-key state.
pub struct Reconciler {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    entropy: Arc<dyn Entropy>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, entropy: Arc<dyn Entropy>, config: ReconcilerConfig) -> Self {
        Self { store, clock, entropy, config }
    }

    /// Bring the derived secret for `key` in line with its blueprint.
    ///
    /// Safe to call repeatedly; once converged further calls change nothing.
    /// Callers must not run two calls for the same key concurrently.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
        let t0 = Instant::now();
        let res = self.reconcile_once(key).await;
        histogram!("gensec_reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(outcome) => counter!("gensec_reconcile_total", 1u64, "outcome" => outcome.as_str()),
            Err(e) => {
                counter!("gensec_reconcile_errors_total", 1u64, "kind" => e.kind().as_str());
                warn!(key = %key, kind = e.kind().as_str(), error = %e, "reconcile failed");
            }
        }
        res
    }

    async fn reconcile_once(&self, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
        info!(key = %key, "reconciling");
        let blueprint = match self.store.fetch_blueprint(key).await {
            Ok(Some(bp)) => bp,
            Ok(None) => {
                info!(key = %key, "GeneratedSecret deleted");
                return Ok(Outcome::NoOp(NoOpReason::Deleted));
            }
            Err(source) => return Err(ReconcileError::FetchBlueprint { key: key.clone(), source }),
        };
        debug!(key = %key, generation = blueprint.generation, observed = blueprint.status.observed_generation, "fetched blueprint");

        let prior = self
            .store
            .fetch_derived(key)
            .await
            .map_err(|source| ReconcileError::FetchDerived { key: key.clone(), source })?;

        // A deleted secret or a dropped key must be healed even when the generation is unchanged.
        let complete = prior.as_ref().is_some_and(|p| blueprint.fields.keys().all(|f| p.data.contains_key(f)));
        if self.config.fast_skip && blueprint.is_observed() && complete {
            debug!(key = %key, generation = blueprint.generation, "generation already observed");
            return Ok(Outcome::NoOp(NoOpReason::UpToDate));
        }
        if prior.is_none() {
            info!(key = %key, "secret doesn't already exist, generating");
        }

        let now = self.clock.now();
        let assembled = assemble(&blueprint, prior.as_ref(), now, self.entropy.as_ref(), &self.config)?;

        debug!(key = %key, fields = assembled.secret.data.len(), "applying");
        self.store
            .upsert_derived(&assembled.secret, &self.config.field_manager)
            .await
            .map_err(|source| ReconcileError::Upsert { key: key.clone(), source })?;

        let status = BlueprintStatus { observed_generation: blueprint.generation };
        self.store
            .update_status(&blueprint, status)
            .await
            .map_err(|source| ReconcileError::Status { key: key.clone(), source })?;

        counter!("gensec_fields_generated_total", assembled.generated.len() as u64);
        counter!("gensec_fields_kept_total", assembled.kept.len() as u64);
        info!(
            key = %key,
            generation = blueprint.generation,
            kept = assembled.kept.len(),
            generated = assembled.generated.len(),
            "done"
        );
        Ok(Outcome::Applied(Applied {
            generation: blueprint.generation,
            kept: assembled.kept,
            generated: assembled.generated,
        }))
    }
}
