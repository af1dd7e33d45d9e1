use chrono::{DateTime, Utc};
use gensec_core::{
    check_field_name, field_from_timestamp_key, format_timestamp, is_engine_key, resolve, sample, timestamp_key,
    validate, Blueprint, DerivedSecret, Entropy, Error,
};
use tracing::debug;

use crate::ReconcilerConfig;

/// Apply body plus the per-field decisions that produced it.
///
/// The secret holds only keys this engine owns: template labels and
/// annotations, timestamp annotations and generated data. Keys written by
/// other actors are left out so the merge write keeps them with their owner.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub secret: DerivedSecret,
    pub kept: Vec<String>,
    pub generated: Vec<String>,
}

/// Compute the target secret for `blueprint` given the `prior` one.
///
/// Pure apart from entropy consumption. Any field error aborts the whole
/// assembly, so callers never see a partially evaluated target.
pub fn assemble(
    blueprint: &Blueprint,
    prior: Option<&DerivedSecret>,
    now: DateTime<Utc>,
    entropy: &dyn Entropy,
    config: &ReconcilerConfig,
) -> Result<Assembled, Error> {
    for name in blueprint.fields.keys() {
        check_field_name(name)?;
    }

    let mut secret = DerivedSecret::new(blueprint.key.clone());
    // Ownership is re-stamped on every pass from the blueprint as fetched.
    secret.owners = vec![blueprint.owner_ref()];
    if let Some(template) = &blueprint.template {
        secret.labels = template.labels.clone();
        secret.annotations = template.annotations.clone();
    }

    if let Some(prior) = prior {
        // Fields dropped from the blueprint keep their last value.
        for (k, v) in &prior.annotations {
            if !is_engine_key(k) {
                continue;
            }
            secret.annotations.insert(k.clone(), v.clone());
            if let Some((field, value)) = field_from_timestamp_key(k).and_then(|f| prior.data.get_key_value(f)) {
                secret.data.insert(field.clone(), value.clone());
            }
        }
    }

    let mut kept = Vec::new();
    let mut generated = Vec::new();
    let stamp = format_timestamp(now);
    for (name, field) in &blueprint.fields {
        let spec = resolve(field, blueprint.default.as_ref(), config.inherit);
        let ts_key = timestamp_key(name);
        let stored = prior.and_then(|p| p.data.get(name)).map(Vec::as_slice);
        let stored_ts = prior.and_then(|p| p.annotations.get(&ts_key)).map(String::as_str);

        let validity = validate(name, stored, stored_ts, &spec, now)?;
        if validity.is_valid() {
            debug!(field = %name, "secret exists, skipping");
            if let Some(value) = stored {
                secret.data.insert(name.clone(), value.to_vec());
            }
            kept.push(name.clone());
            continue;
        }

        let value = sample(&spec, entropy).map_err(|source| Error::Entropy { field: name.clone(), source })?;
        debug!(field = %name, reason = validity.as_str(), length = spec.length, binary = spec.binary, "generated");
        secret.data.insert(name.clone(), value);
        secret.annotations.insert(ts_key, stamp.clone());
        generated.push(name.clone());
    }

    Ok(Assembled { secret, kept, generated })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gensec_core::{FieldSpec, ObjectKey, OsEntropy, SecretTemplate, DEFAULT_ALPHABET};
    use std::collections::BTreeMap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn blueprint(fields: &[(&str, FieldSpec)]) -> Blueprint {
        Blueprint {
            key: ObjectKey::new("ns", "creds"),
            uid: "8b0c7a9e-0000-4000-8000-000000000001".into(),
            api_version: "mkm.pub/v1alpha1".into(),
            kind: "GeneratedSecret".into(),
            generation: 1,
            resource_version: Some("1".into()),
            fields: fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            default: None,
            template: None,
            status: Default::default(),
        }
    }

    fn len(n: u32) -> FieldSpec {
        FieldSpec { length: n, ..Default::default() }
    }

    #[test]
    fn fresh_target_generates_every_field() {
        let bp = blueprint(&[("password", len(10)), ("token", FieldSpec::default())]);
        let out = assemble(&bp, None, now(), &OsEntropy, &ReconcilerConfig::default()).unwrap();
        assert_eq!(out.generated, vec!["password", "token"]);
        assert!(out.kept.is_empty());
        assert_eq!(out.secret.data["password"].len(), 10);
        assert_eq!(out.secret.data["token"].len(), 12);
        assert!(out.secret.data["password"].iter().all(|b| DEFAULT_ALPHABET.as_bytes().contains(b)));
        assert_eq!(out.secret.annotations[&timestamp_key("password")], "2024-01-01T00:00:00Z");
        assert_eq!(out.secret.owners, vec![bp.owner_ref()]);
    }

    #[test]
    fn valid_fields_are_carried_bit_identical() {
        let bp = blueprint(&[("password", len(10))]);
        let first = assemble(&bp, None, now(), &OsEntropy, &ReconcilerConfig::default()).unwrap();
        let second = assemble(&bp, Some(&first.secret), now(), &OsEntropy, &ReconcilerConfig::default()).unwrap();
        assert_eq!(second.kept, vec!["password"]);
        assert!(second.generated.is_empty());
        assert_eq!(second.secret, first.secret);
    }

    #[test]
    fn orphaned_data_is_retained() {
        let bp = blueprint(&[("a", len(4)), ("b", len(4))]);
        let first = assemble(&bp, None, now(), &OsEntropy, &ReconcilerConfig::default()).unwrap();
        let narrowed = blueprint(&[("a", len(4))]);
        let second = assemble(&narrowed, Some(&first.secret), now(), &OsEntropy, &ReconcilerConfig::default()).unwrap();
        assert_eq!(second.secret.data["b"], first.secret.data["b"]);
        assert!(second.secret.annotations.contains_key(&timestamp_key("b")));
    }

    #[test]
    fn invalid_field_name_aborts_before_sampling() {
        let bp = blueprint(&[("ok", len(4)), ("not/ok", len(4))]);
        let err = assemble(&bp, None, now(), &OsEntropy, &ReconcilerConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidFieldName(ref n) if n == "not/ok"));
    }

    #[test]
    fn malformed_timestamp_aborts_everything() {
        let ttl = FieldSpec { length: 4, ttl: Some("1h".into()), ..Default::default() };
        let bp = blueprint(&[("a", len(4)), ("b", ttl)]);
        let mut prior = DerivedSecret::new(bp.key.clone());
        prior.data.insert("b".into(), b"abcd".to_vec());
        prior.annotations.insert(timestamp_key("b"), "not-a-time".into());
        let err = assemble(&bp, Some(&prior), now(), &OsEntropy, &ReconcilerConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Timestamp { .. }));
    }

    fn prior_with_foreign(bp: &Blueprint) -> DerivedSecret {
        let mut prior = DerivedSecret::new(bp.key.clone());
        prior.annotations.insert("example.com/owner".into(), "team-a".into());
        prior.data.insert("ca.crt".into(), b"-----BEGIN".to_vec());
        prior
    }

    #[test]
    fn foreign_keys_are_left_to_their_writers() {
        let mut bp = blueprint(&[("a", len(4))]);
        let mut annotations = BTreeMap::new();
        annotations.insert("team".to_string(), "payments".to_string());
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "db".to_string());
        bp.template = Some(SecretTemplate { labels, annotations });
        let prior = prior_with_foreign(&bp);
        let out = assemble(&bp, Some(&prior), now(), &OsEntropy, &ReconcilerConfig::default()).unwrap();
        assert!(!out.secret.annotations.contains_key("example.com/owner"));
        assert!(!out.secret.data.contains_key("ca.crt"));
        assert_eq!(out.secret.annotations["team"], "payments");
        assert_eq!(out.secret.labels["app"], "db");
        assert!(out.secret.annotations.contains_key(&timestamp_key("a")));
    }

    #[test]
    fn stamped_keys_without_a_field_are_still_claimed() {
        let mut prior = DerivedSecret::new(ObjectKey::new("ns", "creds"));
        prior.data.insert("old".into(), b"xyzw".to_vec());
        prior.annotations.insert(timestamp_key("old"), "2023-01-01T00:00:00Z".into());
        prior.data.insert("foreign".into(), b"f".to_vec());
        let bp = blueprint(&[("a", len(4))]);
        let out = assemble(&bp, Some(&prior), now(), &OsEntropy, &ReconcilerConfig::default()).unwrap();
        assert_eq!(out.secret.data["old"], b"xyzw");
        assert!(!out.secret.data.contains_key("foreign"));
    }

    #[test]
    fn fields_are_evaluated_independently() {
        let bp = blueprint(&[("a", len(4)), ("b", len(6))]);
        let first = assemble(&bp, None, now(), &OsEntropy, &ReconcilerConfig::default()).unwrap();
        let mut prior = first.secret.clone();
        prior.data.insert("a".into(), b"!!!!".to_vec());
        let out = assemble(&bp, Some(&prior), now(), &OsEntropy, &ReconcilerConfig::default()).unwrap();
        assert_eq!(out.generated, vec!["a"]);
        assert_eq!(out.kept, vec!["b"]);
        assert_eq!(out.secret.data["b"], first.secret.data["b"]);
    }
}
