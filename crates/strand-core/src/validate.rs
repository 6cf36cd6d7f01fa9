//! Schema validation and additive merging.
//!
//! Validation is fail-fast: the first violation found is returned.

use serde_json::json;

use crate::error::{Result, StrandError};
use crate::keys::{ENDPOINT_A, ENDPOINT_B, NODE_UID_FIELD};
use crate::schema::{
    DataType, Direction, Has, IndexKind, PropDef, RelationshipKind, Schema, ScalarProp,
};

const RESERVED_PREFIX: &str = "strand";

/// Check every structural and naming rule on a complete schema.
pub fn validate(schema: &Schema) -> Result<()> {
    for (node, props) in &schema.nodes {
        check_node_name(node)?;

        for (prop, def) in props {
            match def {
                PropDef::Prop(scalar) => {
                    check_scalar_prop_name(node, prop)?;
                    if prop == NODE_UID_FIELD {
                        return Err(StrandError::schema(
                            format!("Node {node} may not declare the reserved prop {prop}"),
                            json!({ "nodeName": node, "propName": prop }),
                        ));
                    }
                    check_indices(node, prop, scalar)?;
                }
                _ => {
                    let Some((_, rel)) = def.as_relationship() else {
                        continue;
                    };
                    check_relationship_prop_name(node, prop)?;
                    if !schema.nodes.contains_key(&rel.node_name) {
                        return Err(StrandError::schema(
                            format!(
                                "{node}.{prop} points to node {} which is not defined",
                                rel.node_name
                            ),
                            json!({ "nodeName": node, "propName": prop, "target": rel.node_name }),
                        ));
                    }
                    if !schema.relationships.contains_key(&rel.relationship_name) {
                        return Err(StrandError::schema(
                            format!(
                                "{node}.{prop} uses relationship {} which is not defined",
                                rel.relationship_name
                            ),
                            json!({
                                "nodeName": node,
                                "propName": prop,
                                "relationshipName": rel.relationship_name
                            }),
                        ));
                    }
                }
            }
        }
    }

    for (name, def) in &schema.relationships {
        check_relationship_name(name)?;

        for (prop, scalar) in &def.props {
            check_scalar_prop_name(name, prop)?;
            if prop == ENDPOINT_A || prop == ENDPOINT_B {
                return Err(StrandError::schema(
                    format!("Relationship {name} may not declare the endpoint prop {prop}"),
                    json!({ "relationshipName": name, "propName": prop }),
                ));
            }
            check_indices(name, prop, scalar)?;
        }

        check_arrangement(schema, name, def.kind)?;
    }

    Ok(())
}

/// Merge `addition` into `existing`, returning the validated result.
///
/// Existing definitions are immutable: reusing a node or relationship name is
/// a collision, not an overwrite.
pub fn merge_addition(existing: &Schema, addition: Schema) -> Result<Schema> {
    let mut merged = existing.clone();

    for (node, props) in addition.nodes {
        check_not_reserved(&node)?;
        for prop in props.keys() {
            check_not_reserved(prop)?;
        }
        if merged.nodes.contains_key(&node) {
            return Err(StrandError::schema(
                format!("Node {node} is already defined"),
                json!({ "nodeName": node }),
            ));
        }
        merged.nodes.insert(node, props);
    }

    for (name, def) in addition.relationships {
        check_not_reserved(&name)?;
        for prop in def.props.keys() {
            check_not_reserved(prop)?;
        }
        if merged.relationships.contains_key(&name) {
            return Err(StrandError::schema(
                format!("Relationship {name} is already defined"),
                json!({ "relationshipName": name }),
            ));
        }
        merged.relationships.insert(name, def);
    }

    validate(&merged)?;
    Ok(merged)
}

impl Schema {
    /// Additive merge; see [`merge_addition`].
    pub fn merge_addition(&self, addition: Schema) -> Result<Schema> {
        merge_addition(self, addition)
    }

    /// Check this schema; see [`validate`].
    pub fn validate(&self) -> Result<()> {
        validate(self)
    }
}

// ── Rules ────────────────────────────────────────────────────────

fn check_arrangement(schema: &Schema, name: &str, kind: RelationshipKind) -> Result<()> {
    let props = schema.props_for_relationship(name);
    let count = |d: Direction| props.iter().filter(|p| p.direction == d).count();
    let (forward, reverse, bidirectional) = (
        count(Direction::Forward),
        count(Direction::Reverse),
        count(Direction::Bidirectional),
    );

    let context = json!({
        "relationshipName": name,
        "props": props.iter().map(|p| format!("{}.{}", p.owner, p.prop)).collect::<Vec<_>>(),
    });

    match (forward, reverse, bidirectional) {
        (0, 0, 1) => {
            let p = &props[0];
            if p.def.node_name != p.owner {
                return Err(StrandError::schema(
                    format!(
                        "Bidirectional prop {}.{} must point back to {}",
                        p.owner, p.prop, p.owner
                    ),
                    context,
                ));
            }
            let ok = match kind {
                RelationshipKind::OneToOne => p.def.has == Has::One,
                RelationshipKind::ManyToMany => p.def.has == Has::Many,
                RelationshipKind::OneToMany => false,
            };
            if !ok {
                return Err(StrandError::schema(
                    format!("Bidirectional relationship {name} has a cardinality that does not match {kind:?}"),
                    context,
                ));
            }
        }
        (1, 1, 0) => {
            let (fwd, rev) = match props[0].direction {
                Direction::Forward => (&props[0], &props[1]),
                _ => (&props[1], &props[0]),
            };
            if fwd.def.node_name != rev.owner || rev.def.node_name != fwd.owner {
                return Err(StrandError::schema(
                    format!(
                        "Props {}.{} and {}.{} of relationship {name} do not point at each other",
                        fwd.owner, fwd.prop, rev.owner, rev.prop
                    ),
                    context,
                ));
            }
            let ok = match kind {
                RelationshipKind::OneToOne => fwd.def.has == Has::One && rev.def.has == Has::One,
                RelationshipKind::ManyToMany => {
                    fwd.def.has == Has::Many && rev.def.has == Has::Many
                }
                RelationshipKind::OneToMany => fwd.def.has != rev.def.has,
            };
            if !ok {
                return Err(StrandError::schema(
                    format!("Relationship {name} has a cardinality that does not match {kind:?}"),
                    context,
                ));
            }
        }
        (0, 0, 0) => {
            return Err(StrandError::schema(
                format!("Relationship {name} is not used by any node prop"),
                context,
            ));
        }
        _ => {
            return Err(StrandError::schema(
                format!(
                    "Relationship {name} needs exactly one bidirectional prop or one forward and one reverse prop"
                ),
                context,
            ));
        }
    }

    Ok(())
}

fn check_indices(owner: &str, prop: &str, scalar: &ScalarProp) -> Result<()> {
    if scalar.data_type == DataType::Hash && !scalar.indices.is_empty() {
        return Err(StrandError::schema(
            format!("Hash prop {owner}.{prop} may not be indexed"),
            json!({ "owner": owner, "propName": prop }),
        ));
    }
    for (i, index) in scalar.indices.iter().enumerate() {
        if scalar.indices[..i].contains(index) {
            return Err(StrandError::schema(
                format!("Prop {owner}.{prop} declares the {index:?} index twice"),
                json!({ "owner": owner, "propName": prop }),
            ));
        }
    }
    if scalar.has_index(IndexKind::Exact) && scalar.has_index(IndexKind::Unique) {
        return Err(StrandError::schema(
            format!("Prop {owner}.{prop} may declare exact or unique, not both"),
            json!({ "owner": owner, "propName": prop }),
        ));
    }
    Ok(())
}

fn check_node_name(name: &str) -> Result<()> {
    let valid = name.starts_with(|c: char| c.is_ascii_uppercase()) && is_word(name);
    if !valid {
        return Err(StrandError::schema(
            format!("Node name {name:?} must start uppercase and contain only letters or _"),
            json!({ "nodeName": name }),
        ));
    }
    Ok(())
}

fn check_relationship_name(name: &str) -> Result<()> {
    let valid = name.starts_with(|c: char| c.is_ascii_lowercase()) && is_word(name);
    if !valid {
        return Err(StrandError::schema(
            format!("Relationship name {name:?} must start lowercase and contain only letters or _"),
            json!({ "relationshipName": name }),
        ));
    }
    Ok(())
}

fn check_scalar_prop_name(owner: &str, prop: &str) -> Result<()> {
    let valid = prop.starts_with(|c: char| c.is_ascii_alphabetic()) && is_word(prop);
    if !valid {
        return Err(StrandError::schema(
            format!("Prop {owner}.{prop} must start with a letter and contain only letters or _"),
            json!({ "owner": owner, "propName": prop }),
        ));
    }
    Ok(())
}

fn check_relationship_prop_name(owner: &str, prop: &str) -> Result<()> {
    let valid = prop.len() > 1 && prop.starts_with('_') && is_word(prop);
    if !valid {
        return Err(StrandError::schema(
            format!("Relationship prop {owner}.{prop} must start with _"),
            json!({ "owner": owner, "propName": prop }),
        ));
    }
    Ok(())
}

fn check_not_reserved(name: &str) -> Result<()> {
    if name
        .trim_start_matches('_')
        .to_ascii_lowercase()
        .starts_with(RESERVED_PREFIX)
    {
        return Err(StrandError::schema(
            format!("Name {name:?} uses the reserved prefix {RESERVED_PREFIX:?}"),
            json!({ "name": name }),
        ));
    }
    Ok(())
}

fn is_word(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphabetic() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn parse(value: Value) -> Schema {
        serde_json::from_value(value).unwrap()
    }

    fn follows_schema() -> Value {
        json!({
            "nodes": {
                "User": {
                    "name": { "is": "Prop", "dataType": "string" },
                    "_following": { "is": "ForwardRelationshipProp", "has": "many", "nodeName": "User", "relationshipName": "follows" },
                    "_followers": { "is": "ReverseRelationshipProp", "has": "many", "nodeName": "User", "relationshipName": "follows" }
                }
            },
            "relationships": { "follows": { "kind": "ManyToMany" } }
        })
    }

    #[test]
    fn core_schema_is_valid() {
        validate(&Schema::core()).unwrap();
    }

    #[test]
    fn forward_reverse_pair_is_valid() {
        validate(&parse(follows_schema())).unwrap();
    }

    #[test]
    fn single_bidirectional_is_valid() {
        let schema = parse(json!({
            "nodes": { "User": {
                "_friends": { "is": "BidirectionalRelationshipProp", "has": "many", "nodeName": "User", "relationshipName": "isFriendsWith" }
            } },
            "relationships": { "isFriendsWith": { "kind": "ManyToMany" } }
        }));
        validate(&schema).unwrap();
    }

    #[test]
    fn two_bidirectional_props_are_rejected() {
        let schema = parse(json!({
            "nodes": { "User": {
                "_friends": { "is": "BidirectionalRelationshipProp", "has": "many", "nodeName": "User", "relationshipName": "isFriendsWith" },
                "_pals": { "is": "BidirectionalRelationshipProp", "has": "many", "nodeName": "User", "relationshipName": "isFriendsWith" }
            } },
            "relationships": { "isFriendsWith": { "kind": "ManyToMany" } }
        }));
        assert_eq!(validate(&schema).unwrap_err().kind(), "schema");
    }

    #[test]
    fn two_forward_props_are_rejected() {
        let mut raw = follows_schema();
        raw["nodes"]["User"]["_followers"]["is"] = json!("ForwardRelationshipProp");
        assert!(validate(&parse(raw)).is_err());
    }

    #[test]
    fn unknown_relationship_is_rejected() {
        let mut raw = follows_schema();
        raw["relationships"] = json!({});
        let err = validate(&parse(raw)).unwrap_err();
        assert!(err.to_string().contains("not defined"));
    }

    #[test]
    fn unused_relationship_is_rejected() {
        let mut raw = follows_schema();
        raw["relationships"]["blocks"] = json!({ "kind": "ManyToMany" });
        assert!(validate(&parse(raw)).is_err());
    }

    #[test]
    fn unknown_target_node_is_rejected() {
        let mut raw = follows_schema();
        raw["nodes"]["User"]["_following"]["nodeName"] = json!("Ghost");
        assert!(validate(&parse(raw)).is_err());
    }

    #[test]
    fn cardinality_must_match_kind() {
        let mut raw = follows_schema();
        raw["relationships"]["follows"]["kind"] = json!("OneToOne");
        assert!(validate(&parse(raw)).is_err());

        let mut raw = follows_schema();
        raw["relationships"]["follows"]["kind"] = json!("OneToMany");
        raw["nodes"]["User"]["_followers"]["has"] = json!("one");
        validate(&parse(raw)).unwrap();
    }

    #[test]
    fn naming_rules() {
        let lower_node = parse(json!({ "nodes": { "user": {} } }));
        assert!(validate(&lower_node).is_err());

        let underscored_scalar = parse(json!({ "nodes": { "User": {
            "_name": { "is": "Prop", "dataType": "string" }
        } } }));
        assert!(validate(&underscored_scalar).is_err());

        let mut bare_relationship_prop = follows_schema();
        let def = bare_relationship_prop["nodes"]["User"]["_following"].take();
        bare_relationship_prop["nodes"]["User"]["following"] = def;
        bare_relationship_prop["nodes"]["User"]
            .as_object_mut()
            .unwrap()
            .remove("_following");
        assert!(validate(&parse(bare_relationship_prop)).is_err());

        let reserved_uid = parse(json!({ "nodes": { "User": {
            "uid": { "is": "Prop", "dataType": "string" }
        } } }));
        assert!(validate(&reserved_uid).is_err());
    }

    #[test]
    fn hash_props_cannot_be_indexed() {
        let schema = parse(json!({ "nodes": { "User": {
            "password": { "is": "Prop", "dataType": "hash", "indices": ["exact"] }
        } } }));
        assert!(validate(&schema).is_err());
    }

    #[test]
    fn merge_rejects_collisions_and_reserved_names() {
        let base = Schema::core();
        let merged = merge_addition(&base, parse(follows_schema())).unwrap();
        assert!(merged.nodes.contains_key("User"));
        assert!(merged.nodes.contains_key("StrandUser"));

        let err = merge_addition(&merged, parse(json!({ "nodes": { "User": {} } }))).unwrap_err();
        assert!(err.to_string().contains("already defined"));

        let err = merge_addition(&base, parse(json!({ "nodes": { "StrandThing": {} } })))
            .unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn merge_validates_the_combined_schema() {
        let addition = parse(json!({ "nodes": { "Post": {
            "_author": { "is": "ForwardRelationshipProp", "has": "one", "nodeName": "User", "relationshipName": "authored" }
        } } }));
        assert!(merge_addition(&Schema::core(), addition).is_err());
    }
}
