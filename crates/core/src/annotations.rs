//! Timestamp annotation keys.
//!
//! Each generated field records when it was produced under
//! `<prefix>Z<field>Z`. The `Z`s keep the name part starting and ending with
//! an alphanumeric for any valid field name (e.g. `.env` or `key-`).

pub const ANNOTATION_PREFIX: &str = "ts.mkmik.github.com/";

pub fn timestamp_key(field: &str) -> String {
    format!("{}Z{}Z", ANNOTATION_PREFIX, field)
}

/// Recover the field name from a key produced by [`timestamp_key`].
pub fn field_from_timestamp_key(key: &str) -> Option<&str> {
    let rest = key.strip_prefix(ANNOTATION_PREFIX)?;
    let inner = rest.strip_prefix('Z')?.strip_suffix('Z')?;
    if inner.is_empty() { None } else { Some(inner) }
}

/// True for annotations in the engine-owned namespace.
pub fn is_engine_key(key: &str) -> bool {
    key.starts_with(ANNOTATION_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_field_names() {
        for f in ["password", "Z", "ZZ", ".env", "a-b_c.d", "key-"] {
            let k = timestamp_key(f);
            assert!(is_engine_key(&k));
            assert_eq!(field_from_timestamp_key(&k), Some(f), "key={}", k);
        }
    }

    #[test]
    fn distinct_fields_never_share_a_key() {
        assert_ne!(timestamp_key("a"), timestamp_key("aZ"));
        assert_ne!(timestamp_key("Za"), timestamp_key("a"));
    }

    #[test]
    fn foreign_keys_are_not_decoded() {
        assert_eq!(field_from_timestamp_key("example.com/Zpassword"), None);
        assert_eq!(field_from_timestamp_key("ts.mkmik.github.com/password"), None);
        assert_eq!(field_from_timestamp_key("ts.mkmik.github.com/ZZ"), None);
        assert!(!is_engine_key("kubectl.kubernetes.io/last-applied-configuration"));
    }
}
