//! Typed graph schema: node kinds, relationship kinds, and their props.
//!
//! Serialized as camelCase JSON, with relationship-carrying props tagged by
//! `is`:
//!
//! ```json
//! { "nodes": { "User": {
//!     "name": { "is": "Prop", "dataType": "string", "indices": ["exact"] },
//!     "_following": { "is": "ForwardRelationshipProp", "has": "many",
//!                     "nodeName": "User", "relationshipName": "follows" } } },
//!   "relationships": { "follows": { "kind": "ManyToMany" } } }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Runtime type of a scalar prop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum DataType {
    String,
    Number,
    Boolean,
    /// RFC 3339 timestamp stored as a string.
    IsoString,
    /// Signature over a one-way digest of a secret; never compared directly.
    Hash,
}

impl DataType {
    /// Whether `value` has this type. Hash and ISO values are strings.
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::String | Self::IsoString | Self::Hash => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Exact,
    Unique,
    Sort,
}

/// Cardinality of one side of a relationship.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Has {
    One,
    Many,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RelationshipKind {
    OneToOne,
    OneToMany,
    ManyToMany,
}

/// Which endpoint of a relationship record a prop's owner sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Owner is endpoint `a`.
    Forward,
    /// Owner is endpoint `b`.
    Reverse,
    /// Owner may be either endpoint.
    Bidirectional,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScalarProp {
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "is_false")]
    pub must_be_defined: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indices: Vec<IndexKind>,
}

impl ScalarProp {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            must_be_defined: false,
            indices: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.must_be_defined = true;
        self
    }

    pub fn indexed(mut self, index: IndexKind) -> Self {
        self.indices.push(index);
        self
    }

    pub fn has_index(&self, index: IndexKind) -> bool {
        self.indices.contains(&index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipProp {
    pub has: Has,
    pub node_name: String,
    pub relationship_name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub must_be_defined: bool,
}

/// Definition of one prop on a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "is")]
pub enum PropDef {
    Prop(ScalarProp),
    ForwardRelationshipProp(RelationshipProp),
    ReverseRelationshipProp(RelationshipProp),
    BidirectionalRelationshipProp(RelationshipProp),
}

impl PropDef {
    pub fn forward(has: Has, node_name: &str, relationship_name: &str) -> Self {
        Self::ForwardRelationshipProp(RelationshipProp::new(has, node_name, relationship_name))
    }

    pub fn reverse(has: Has, node_name: &str, relationship_name: &str) -> Self {
        Self::ReverseRelationshipProp(RelationshipProp::new(has, node_name, relationship_name))
    }

    pub fn bidirectional(has: Has, node_name: &str, relationship_name: &str) -> Self {
        Self::BidirectionalRelationshipProp(RelationshipProp::new(
            has,
            node_name,
            relationship_name,
        ))
    }

    pub fn as_scalar(&self) -> Option<&ScalarProp> {
        match self {
            Self::Prop(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_relationship(&self) -> Option<(Direction, &RelationshipProp)> {
        match self {
            Self::Prop(_) => None,
            Self::ForwardRelationshipProp(r) => Some((Direction::Forward, r)),
            Self::ReverseRelationshipProp(r) => Some((Direction::Reverse, r)),
            Self::BidirectionalRelationshipProp(r) => Some((Direction::Bidirectional, r)),
        }
    }
}

impl RelationshipProp {
    pub fn new(has: Has, node_name: &str, relationship_name: &str) -> Self {
        Self {
            has,
            node_name: node_name.to_string(),
            relationship_name: relationship_name.to_string(),
            must_be_defined: false,
        }
    }
}

/// Definition of a relationship kind and its own scalar props.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipDef {
    pub kind: RelationshipKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub props: BTreeMap<String, ScalarProp>,
}

pub type NodeDef = BTreeMap<String, PropDef>;

/// A node kind's view of one of its relationship props.
///
/// Built from `(node, prop)`; `counterpart` is the prop on the other side of
/// the relationship, absent for bidirectional relationships.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipBinding {
    pub relationship: String,
    pub direction: Direction,
    pub has: Has,
    pub node_name: String,
    pub counterpart: Option<String>,
}

/// A relationship prop together with the node that owns it.
#[derive(Debug, Clone, Copy)]
pub struct OwnedRelationshipProp<'a> {
    pub owner: &'a str,
    pub prop: &'a str,
    pub direction: Direction,
    pub def: &'a RelationshipProp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Schema {
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeDef>,
    #[serde(default)]
    pub relationships: BTreeMap<String, RelationshipDef>,
}

impl Schema {
    /// The built-in kinds backing identity and permissions.
    pub fn core() -> Self {
        let mut nodes = BTreeMap::new();
        let mut relationships = BTreeMap::new();

        nodes.insert(
            "StrandSetting".to_string(),
            node_def([
                (
                    "slug",
                    PropDef::Prop(
                        ScalarProp::new(DataType::String)
                            .required()
                            .indexed(IndexKind::Unique),
                    ),
                ),
                (
                    "isOn",
                    PropDef::Prop(ScalarProp::new(DataType::Boolean).required()),
                ),
            ]),
        );

        nodes.insert(
            "StrandToken".to_string(),
            node_def([
                ("name", PropDef::Prop(ScalarProp::new(DataType::String))),
                (
                    "_user",
                    PropDef::forward(Has::One, "StrandUser", "strandTokenUser"),
                ),
            ]),
        );

        nodes.insert(
            "StrandUser".to_string(),
            node_def([
                ("name", PropDef::Prop(ScalarProp::new(DataType::String))),
                ("password", PropDef::Prop(ScalarProp::new(DataType::Hash))),
                (
                    "_tokens",
                    PropDef::reverse(Has::Many, "StrandToken", "strandTokenUser"),
                ),
                (
                    "_role",
                    PropDef::forward(Has::One, "StrandRole", "strandUserRole"),
                ),
            ]),
        );

        nodes.insert(
            "StrandRole".to_string(),
            node_def([
                ("name", PropDef::Prop(ScalarProp::new(DataType::String))),
                (
                    "slug",
                    PropDef::Prop(ScalarProp::new(DataType::String).indexed(IndexKind::Unique)),
                ),
                (
                    "_users",
                    PropDef::reverse(Has::Many, "StrandUser", "strandUserRole"),
                ),
                (
                    "_revokesPermissions",
                    PropDef::forward(Has::Many, "StrandRevokesPermission", "strandRoleRevokes"),
                ),
            ]),
        );

        nodes.insert(
            "StrandRevokesPermission".to_string(),
            node_def([
                (
                    "action",
                    PropDef::Prop(ScalarProp::new(DataType::String).required()),
                ),
                ("nodeName", PropDef::Prop(ScalarProp::new(DataType::String))),
                (
                    "relationshipName",
                    PropDef::Prop(ScalarProp::new(DataType::String)),
                ),
                ("propName", PropDef::Prop(ScalarProp::new(DataType::String))),
                ("schema", PropDef::Prop(ScalarProp::new(DataType::Boolean))),
                (
                    "_role",
                    PropDef::reverse(Has::One, "StrandRole", "strandRoleRevokes"),
                ),
            ]),
        );

        for name in ["strandTokenUser", "strandUserRole", "strandRoleRevokes"] {
            relationships.insert(
                name.to_string(),
                RelationshipDef {
                    kind: RelationshipKind::OneToMany,
                    props: BTreeMap::new(),
                },
            );
        }

        Self {
            nodes,
            relationships,
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeDef> {
        self.nodes.get(name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipDef> {
        self.relationships.get(name)
    }

    /// Scalar prop `prop` on node kind `node`.
    pub fn scalar_prop(&self, node: &str, prop: &str) -> Option<&ScalarProp> {
        self.nodes.get(node)?.get(prop)?.as_scalar()
    }

    /// Scalar prop `prop` on relationship kind `relationship`.
    pub fn relationship_scalar_prop(&self, relationship: &str, prop: &str) -> Option<&ScalarProp> {
        self.relationships.get(relationship)?.props.get(prop)
    }

    /// Resolve `(node, prop)` through the relationship map.
    pub fn relationship_prop(&self, node: &str, prop: &str) -> Option<RelationshipBinding> {
        let (direction, def) = self.nodes.get(node)?.get(prop)?.as_relationship()?;
        let counterpart = self
            .props_for_relationship(&def.relationship_name)
            .into_iter()
            .find(|p| !(p.owner == node && p.prop == prop))
            .map(|p| p.prop.to_string());

        Some(RelationshipBinding {
            relationship: def.relationship_name.clone(),
            direction,
            has: def.has,
            node_name: def.node_name.clone(),
            counterpart,
        })
    }

    /// Every node prop that carries `relationship`.
    pub fn props_for_relationship(&self, relationship: &str) -> Vec<OwnedRelationshipProp<'_>> {
        let mut found = Vec::new();
        for (owner, props) in &self.nodes {
            for (prop, def) in props {
                if let Some((direction, rel)) = def.as_relationship() {
                    if rel.relationship_name == relationship {
                        found.push(OwnedRelationshipProp {
                            owner,
                            prop,
                            direction,
                            def: rel,
                        });
                    }
                }
            }
        }
        found
    }
}

fn node_def<const N: usize>(props: [(&str, PropDef); N]) -> NodeDef {
    props
        .into_iter()
        .map(|(name, def)| (name.to_string(), def))
        .collect()
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prop_def_uses_is_tag() {
        let def: PropDef = serde_json::from_value(json!({
            "is": "ForwardRelationshipProp",
            "has": "many",
            "nodeName": "User",
            "relationshipName": "follows"
        }))
        .unwrap();
        let (direction, rel) = def.as_relationship().unwrap();
        assert_eq!(direction, Direction::Forward);
        assert_eq!(rel.has, Has::Many);
        assert!(!rel.must_be_defined);

        let scalar: PropDef = serde_json::from_value(json!({
            "is": "Prop",
            "dataType": "isoString",
            "indices": ["sort", "exact"]
        }))
        .unwrap();
        let p = scalar.as_scalar().unwrap();
        assert_eq!(p.data_type, DataType::IsoString);
        assert!(p.has_index(IndexKind::Sort));
        assert!(!p.has_index(IndexKind::Unique));
    }

    #[test]
    fn unknown_data_type_is_rejected() {
        let res: Result<PropDef, _> =
            serde_json::from_value(json!({ "is": "Prop", "dataType": "decimal" }));
        assert!(res.is_err());
    }

    #[test]
    fn relationship_map_finds_counterpart() {
        let schema = Schema::core();
        let binding = schema.relationship_prop("StrandToken", "_user").unwrap();
        assert_eq!(binding.relationship, "strandTokenUser");
        assert_eq!(binding.direction, Direction::Forward);
        assert_eq!(binding.node_name, "StrandUser");
        assert_eq!(binding.counterpart.as_deref(), Some("_tokens"));

        assert!(schema.relationship_prop("StrandToken", "name").is_none());
        assert!(schema.relationship_prop("Missing", "_user").is_none());
    }

    #[test]
    fn data_type_accepts() {
        assert!(DataType::Number.accepts(&json!(3)));
        assert!(!DataType::Number.accepts(&json!("3")));
        assert!(DataType::Hash.accepts(&json!("c2ln")));
        assert!(DataType::Boolean.accepts(&json!(false)));
    }
}
