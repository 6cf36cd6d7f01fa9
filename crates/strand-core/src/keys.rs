//! Storage key families and reserved record fields.
//!
//! Node and relationship records live under their bare UUID. Everything
//! else the engine writes lives under a `$`-prefixed key so it can never
//! collide with a record.

use serde_json::Value;

/// The full schema.
pub const SCHEMA_KEY: &str = "$schema";

/// Registry of every node UID, grouped by node kind.
pub const NODE_UIDS_KEY: &str = "$nodeUids";

/// Prefix shared by all index keys.
pub const INDEX_PREFIX: &str = "$index:";

/// Placeholder marker for batch-local UIDs.
pub const TEMP_UID_PREFIX: &str = "_:";

/// Placeholder replaced by the current timestamp in `isoString` props.
pub const ISO_NOW: &str = "now";

/// Slug of the setting node that switches permission enforcement on.
pub const ENFORCE_PERMISSIONS_SLUG: &str = "enforcePermissions";

// ── Record fields ────────────────────────────────────────────────

/// Node kind stored on every node record.
pub const NODE_NAME_FIELD: &str = "$nodeName";

/// Relationship kind stored on every relationship record.
pub const RELATIONSHIP_NAME_FIELD: &str = "$relationshipName";

/// Node UID field.
pub const NODE_UID_FIELD: &str = "uid";

/// Relationship UID field.
pub const RELATIONSHIP_UID_FIELD: &str = "_uid";

/// Relationship endpoints.
pub const ENDPOINT_A: &str = "a";
pub const ENDPOINT_B: &str = "b";

const RELATIONSHIP_LIST_PREFIX: &str = "$r:";

// ── Key construction ─────────────────────────────────────────────

/// Field on a node record holding the UIDs of attached `relationship` records.
pub fn relationship_list_field(relationship: &str) -> String {
    format!("{RELATIONSHIP_LIST_PREFIX}{relationship}")
}

/// Inverse of [`relationship_list_field`].
pub fn relationship_from_list_field(field: &str) -> Option<&str> {
    field.strip_prefix(RELATIONSHIP_LIST_PREFIX)
}

/// Key for an exact index entry: `$index:exact:{node}:{prop}:{value}`.
pub fn exact_index_key(node: &str, prop: &str, value: &Value) -> String {
    format!("{INDEX_PREFIX}exact:{node}:{prop}:{}", index_value(value))
}

/// Key for a unique index entry: `$index:unique:{node}:{prop}:{value}`.
pub fn unique_index_key(node: &str, prop: &str, value: &Value) -> String {
    format!("{INDEX_PREFIX}unique:{node}:{prop}:{}", index_value(value))
}

/// Key for a sort index list: `$index:sort:{node}:{prop}`.
pub fn sort_index_key(node: &str, prop: &str) -> String {
    format!("{INDEX_PREFIX}sort:{node}:{prop}")
}

/// Whether a UID is a batch-local placeholder.
pub fn is_temp_uid(uid: &str) -> bool {
    uid.starts_with(TEMP_UID_PREFIX)
}

/// Whether a storage key names a record rather than engine metadata.
pub fn is_record_key(key: &str) -> bool {
    !key.starts_with('$')
}

/// String form of a scalar used in index keys and sort-index ordering.
///
/// Strings are used verbatim so `"Ann"` and `Ann` index the same way.
pub fn index_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_shapes() {
        assert_eq!(
            exact_index_key("User", "name", &json!("Ann")),
            "$index:exact:User:name:Ann"
        );
        assert_eq!(
            unique_index_key("User", "age", &json!(30)),
            "$index:unique:User:age:30"
        );
        assert_eq!(sort_index_key("User", "age"), "$index:sort:User:age");
        assert_eq!(relationship_list_field("follows"), "$r:follows");
        assert_eq!(relationship_from_list_field("$r:follows"), Some("follows"));
        assert_eq!(relationship_from_list_field("name"), None);
    }

    #[test]
    fn temp_and_record_keys() {
        assert!(is_temp_uid("_:u1"));
        assert!(!is_temp_uid("5f0c"));
        assert!(is_record_key("5f0c7a4e"));
        assert!(!is_record_key(SCHEMA_KEY));
        assert!(!is_record_key(&sort_index_key("User", "age")));
    }

    #[test]
    fn index_value_stringifies() {
        assert_eq!(index_value(&json!("x")), "x");
        assert_eq!(index_value(&json!(2.5)), "2.5");
        assert_eq!(index_value(&json!(true)), "true");
        assert_eq!(index_value(&Value::Null), "");
    }
}
