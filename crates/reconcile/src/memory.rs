//! In-memory [`Store`] and [`Clock`] for tests and local dry runs.
//!
//! The store mimics the API server closely enough to exercise the engine:
//! generations bump on spec changes, status writes are conditional on the
//! resource version, and secret writes merge per field manager the way
//! server-side apply does (a manager's stale keys are pruned, keys owned by
//! someone else survive, and overwriting another manager's value conflicts).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use gensec_core::prelude::*;
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::{Clock, Store, StoreError};

/// Store operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    FetchBlueprint,
    FetchDerived,
    Upsert,
    Status,
}

#[derive(Debug, Default)]
struct Owned {
    labels: BTreeSet<String>,
    annotations: BTreeSet<String>,
    data: BTreeSet<String>,
}

#[derive(Debug)]
struct StoredSecret {
    secret: DerivedSecret,
    managers: BTreeMap<String, Owned>,
}

#[derive(Debug, Default)]
struct Inner {
    rv: u64,
    blueprints: FxHashMap<ObjectKey, Blueprint>,
    secrets: FxHashMap<ObjectKey, StoredSecret>,
    faults: FxHashMap<Op, StoreError>,
    upserts: usize,
}

impl Inner {
    fn next_rv(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }

    fn take_fault(&mut self, op: Op) -> Result<(), StoreError> {
        match self.faults.remove(&op) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or update a blueprint the way the API server would: new
    /// objects get a uid and generation 1, spec changes bump the generation,
    /// status is left alone. Returns the stored copy.
    pub fn put_blueprint(&self, mut bp: Blueprint) -> Blueprint {
        let mut inner = self.lock();
        let rv = inner.next_rv();
        match inner.blueprints.get(&bp.key) {
            Some(cur) => {
                let changed = cur.fields != bp.fields || cur.default != bp.default || cur.template != bp.template;
                bp.uid = cur.uid.clone();
                bp.generation = if changed { cur.generation + 1 } else { cur.generation };
                bp.status = cur.status;
            }
            None => {
                bp.uid = Uuid::new_v4().to_string();
                bp.generation = 1;
                bp.status = BlueprintStatus::default();
            }
        }
        bp.resource_version = Some(rv);
        inner.blueprints.insert(bp.key.clone(), bp.clone());
        bp
    }

    /// Delete a blueprint and, like owner-reference garbage collection,
    /// every secret it owns.
    pub fn delete_blueprint(&self, key: &ObjectKey) -> Option<Blueprint> {
        let mut inner = self.lock();
        let bp = inner.blueprints.remove(key)?;
        inner.secrets.retain(|_, s| !s.secret.owners.iter().any(|o| o.uid == bp.uid));
        Some(bp)
    }

    pub fn blueprint(&self, key: &ObjectKey) -> Option<Blueprint> {
        self.lock().blueprints.get(key).cloned()
    }

    pub fn secret(&self, key: &ObjectKey) -> Option<DerivedSecret> {
        self.lock().secrets.get(key).map(|s| s.secret.clone())
    }

    pub fn delete_secret(&self, key: &ObjectKey) -> Option<DerivedSecret> {
        self.lock().secrets.remove(key).map(|s| s.secret)
    }

    /// Merge-write as another actor would.
    pub fn apply_secret(&self, secret: &DerivedSecret, field_manager: &str) -> Result<(), StoreError> {
        merge_secret(&mut self.lock(), secret, field_manager)
    }

    /// Make the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: Op, err: StoreError) {
        self.lock().faults.insert(op, err);
    }

    /// Number of successful secret writes.
    pub fn upserts(&self) -> usize {
        self.lock().upserts
    }
}

fn merge_secret(inner: &mut Inner, incoming: &DerivedSecret, manager: &str) -> Result<(), StoreError> {
    let stored = inner
        .secrets
        .entry(incoming.key.clone())
        .or_insert_with(|| StoredSecret { secret: DerivedSecret::new(incoming.key.clone()), managers: BTreeMap::new() });

    // Taking over a key another manager holds with a different value is a conflict.
    for (other, owned) in stored.managers.iter().filter(|(m, _)| m.as_str() != manager) {
        let clash = owned
            .labels
            .iter()
            .find(|k| differs(&stored.secret.labels, &incoming.labels, k))
            .or_else(|| owned.annotations.iter().find(|k| differs(&stored.secret.annotations, &incoming.annotations, k)))
            .or_else(|| owned.data.iter().find(|k| differs(&stored.secret.data, &incoming.data, k)));
        if let Some(k) = clash {
            return Err(StoreError::Conflict(format!("{} is owned by {}", k, other)));
        }
    }

    let previous = stored.managers.remove(manager).unwrap_or_default();
    let others: Vec<&Owned> = stored.managers.values().collect();
    prune(&mut stored.secret.labels, &previous.labels, &incoming.labels, |k| others.iter().any(|o| o.labels.contains(k)));
    prune(&mut stored.secret.annotations, &previous.annotations, &incoming.annotations, |k| {
        others.iter().any(|o| o.annotations.contains(k))
    });
    prune(&mut stored.secret.data, &previous.data, &incoming.data, |k| others.iter().any(|o| o.data.contains(k)));

    stored.secret.labels.extend(incoming.labels.clone());
    stored.secret.annotations.extend(incoming.annotations.clone());
    stored.secret.data.extend(incoming.data.clone());
    if !incoming.owners.is_empty() {
        stored.secret.owners = incoming.owners.clone();
    }
    stored.managers.insert(
        manager.to_string(),
        Owned {
            labels: incoming.labels.keys().cloned().collect(),
            annotations: incoming.annotations.keys().cloned().collect(),
            data: incoming.data.keys().cloned().collect(),
        },
    );
    inner.upserts += 1;
    Ok(())
}

fn differs<V: PartialEq>(cur: &BTreeMap<String, V>, incoming: &BTreeMap<String, V>, key: &str) -> bool {
    match (cur.get(key), incoming.get(key)) {
        (Some(a), Some(b)) => a != b,
        _ => false,
    }
}

/// Drop keys this manager wrote last time, no longer sends, and nobody else owns.
fn prune<V>(
    cur: &mut BTreeMap<String, V>,
    previous: &BTreeSet<String>,
    incoming: &BTreeMap<String, V>,
    held_elsewhere: impl Fn(&str) -> bool,
) {
    for k in previous {
        if !incoming.contains_key(k) && !held_elsewhere(k) {
            cur.remove(k);
        }
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn fetch_blueprint(&self, key: &ObjectKey) -> Result<Option<Blueprint>, StoreError> {
        let mut inner = self.lock();
        inner.take_fault(Op::FetchBlueprint)?;
        Ok(inner.blueprints.get(key).cloned())
    }

    async fn fetch_derived(&self, key: &ObjectKey) -> Result<Option<DerivedSecret>, StoreError> {
        let mut inner = self.lock();
        inner.take_fault(Op::FetchDerived)?;
        Ok(inner.secrets.get(key).map(|s| s.secret.clone()))
    }

    async fn upsert_derived(&self, secret: &DerivedSecret, field_manager: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.take_fault(Op::Upsert)?;
        merge_secret(&mut inner, secret, field_manager)
    }

    async fn update_status(&self, blueprint: &Blueprint, status: BlueprintStatus) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.take_fault(Op::Status)?;
        let rv = inner.next_rv();
        let cur = inner
            .blueprints
            .get_mut(&blueprint.key)
            .ok_or_else(|| StoreError::Conflict(format!("GeneratedSecret {} is gone", blueprint.key)))?;
        if cur.resource_version != blueprint.resource_version {
            return Err(StoreError::Conflict(format!(
                "resource version {:?} is stale (now {:?})",
                blueprint.resource_version, cur.resource_version
            )));
        }
        cur.status = status;
        cur.resource_version = Some(rv);
        Ok(())
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A blueprint with only identity and fields set, ready for [`MemoryStore::put_blueprint`].
pub fn draft(key: ObjectKey, fields: impl IntoIterator<Item = (String, FieldSpec)>) -> Blueprint {
    Blueprint {
        key,
        uid: String::new(),
        api_version: "mkm.pub/v1alpha1".to_string(),
        kind: "GeneratedSecret".to_string(),
        generation: 0,
        resource_version: None,
        fields: fields.into_iter().collect(),
        default: None,
        template: None,
        status: BlueprintStatus::default(),
    }
}
