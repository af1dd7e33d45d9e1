//! Field spec resolution: merge a field's spec with the blueprint default.

use serde::{Deserialize, Serialize};

use crate::FieldSpec;

/// Used when neither the field nor the default sets a length.
pub const DEFAULT_LENGTH: usize = 12;

pub const DEFAULT_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Which attributes the blueprint default may fill in.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InheritPolicy {
    /// Only `length` and `ttl` come from the default; `alphabet` and `binary`
    /// are always the field's own.
    #[default]
    FieldOnly,
    /// `alphabet` and `binary` are inherited too when the field leaves them unset.
    Full,
}

/// A field spec with every attribute filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveSpec {
    pub length: usize,
    pub alphabet: String,
    pub binary: bool,
    pub ttl: Option<String>,
}

fn non_empty(s: &Option<String>) -> Option<&String> {
    s.as_ref().filter(|v| !v.is_empty())
}

/// Resolve `field` against `default`. Field wins over default, default wins
/// over the built-in fallbacks.
pub fn resolve(field: &FieldSpec, default: Option<&FieldSpec>, policy: InheritPolicy) -> EffectiveSpec {
    let length = match (field.length, default.map(|d| d.length).unwrap_or(0)) {
        (0, 0) => DEFAULT_LENGTH,
        (0, d) => d as usize,
        (f, _) => f as usize,
    };
    let ttl = non_empty(&field.ttl).or_else(|| default.and_then(|d| non_empty(&d.ttl))).cloned();

    let (alphabet, binary) = match (policy, default) {
        (InheritPolicy::Full, Some(d)) => {
            let alphabet = if field.alphabet.is_empty() { d.alphabet.clone() } else { field.alphabet.clone() };
            (alphabet, field.binary || d.binary)
        }
        _ => (field.alphabet.clone(), field.binary),
    };
    let alphabet = if alphabet.is_empty() { DEFAULT_ALPHABET.to_string() } else { alphabet };

    EffectiveSpec { length, alphabet, binary, ttl }
}
