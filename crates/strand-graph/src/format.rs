//! Query format trees and their schema binding.
//!
//! A format section is a JSON object mixing projections (`"name": true`),
//! nested relationship sections (`"_following": {…}`) and `$`-prefixed
//! options. [`bind_section`] resolves it against the schema once per query,
//! checks read permissions, and produces a [`GeneratedSection`] whose
//! options are a closed set of typed [`QueryOption`]s.

use serde::Deserialize;
use serde_json::{json, Value};

use strand_core::keys::{NODE_UID_FIELD, RELATIONSHIP_UID_FIELD};
use strand_core::schema::{Has, RelationshipBinding};
use strand_core::{Result, Schema, StrandError};

use crate::passport::{Action, Scope, Stamp};

// ── Option types ─────────────────────────────────────────────────

/// A property name, optionally reached through relationship props.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "PropertyRefRepr")]
pub struct PropertyRef {
    pub prop: String,
    pub relationships: Vec<String>,
}

impl PropertyRef {
    pub fn plain(prop: &str) -> Self {
        Self {
            prop: prop.to_string(),
            relationships: Vec::new(),
        }
    }

    pub fn is_plain(&self) -> bool {
        self.relationships.is_empty()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PropertyRefRepr {
    Name(String),
    Path {
        prop: String,
        #[serde(default)]
        relationships: Vec<String>,
    },
}

impl From<PropertyRefRepr> for PropertyRef {
    fn from(repr: PropertyRefRepr) -> Self {
        match repr {
            PropertyRefRepr::Name(prop) => Self::plain(&prop),
            PropertyRefRepr::Path {
                prop,
                relationships,
            } => Self {
                prop,
                relationships,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueSource {
    Value(Value),
    Property(PropertyRef),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    pub left: ValueSource,
    pub right: ValueSource,
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    DoesNotEqual,
    GreaterThan,
    LessThan,
    GreaterThanOrEqualTo,
    LessThanOrEqualTo,
    StartsWith,
    EndsWith,
    Contains,
    DoesNotContain,
    IsoIsBefore,
    IsoIsAfter,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Condition {
    Equals(Comparison),
    DoesNotEqual(Comparison),
    GreaterThan(Comparison),
    LessThan(Comparison),
    GreaterThanOrEqualTo(Comparison),
    LessThanOrEqualTo(Comparison),
    StartsWith(Comparison),
    EndsWith(Comparison),
    Contains(Comparison),
    DoesNotContain(Comparison),
    IsoIsBefore(Comparison),
    IsoIsAfter(Comparison),
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

/// A condition is either a single comparison or a group.
pub enum ConditionKind<'a> {
    Compare(Operator, &'a Comparison),
    And(&'a [Condition]),
    Or(&'a [Condition]),
}

impl Condition {
    pub fn kind(&self) -> ConditionKind<'_> {
        use Operator as Op;
        match self {
            Self::Equals(c) => ConditionKind::Compare(Op::Equals, c),
            Self::DoesNotEqual(c) => ConditionKind::Compare(Op::DoesNotEqual, c),
            Self::GreaterThan(c) => ConditionKind::Compare(Op::GreaterThan, c),
            Self::LessThan(c) => ConditionKind::Compare(Op::LessThan, c),
            Self::GreaterThanOrEqualTo(c) => ConditionKind::Compare(Op::GreaterThanOrEqualTo, c),
            Self::LessThanOrEqualTo(c) => ConditionKind::Compare(Op::LessThanOrEqualTo, c),
            Self::StartsWith(c) => ConditionKind::Compare(Op::StartsWith, c),
            Self::EndsWith(c) => ConditionKind::Compare(Op::EndsWith, c),
            Self::Contains(c) => ConditionKind::Compare(Op::Contains, c),
            Self::DoesNotContain(c) => ConditionKind::Compare(Op::DoesNotContain, c),
            Self::IsoIsBefore(c) => ConditionKind::Compare(Op::IsoIsBefore, c),
            Self::IsoIsAfter(c) => ConditionKind::Compare(Op::IsoIsAfter, c),
            Self::And(children) => ConditionKind::And(children),
            Self::Or(children) => ConditionKind::Or(children),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WhereClause {
    /// Keep only the first match.
    Find(Condition),
    /// Keep every match.
    Filter(Condition),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SortOption {
    pub property: PropertyRef,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Symbol {
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DerivedItem {
    Value(Value),
    Property(PropertyRef),
    Group(DerivedGroup),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DerivedGroup {
    pub symbol: Symbol,
    pub items: Vec<DerivedItem>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedOption {
    pub new_prop: String,
    #[serde(flatten)]
    pub expression: DerivedGroup,
    #[serde(default)]
    pub is_response_hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsProperty {
    pub compute_prop: PropertyRef,
    pub new_prop: String,
    #[serde(default)]
    pub is_response_hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountAsProperty {
    pub new_prop: String,
    #[serde(default)]
    pub is_response_hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Aggregate {
    SumAsProperty(AsProperty),
    AverageAsProperty(AsProperty),
    MinAmountAsProperty(AsProperty),
    MaxAmountAsProperty(AsProperty),
    CountAsProperty(CountAsProperty),
    SumAsResponse(PropertyRef),
    AverageAsResponse(PropertyRef),
    MinAmountAsResponse(PropertyRef),
    MaxAmountAsResponse(PropertyRef),
    MinNodeAsResponse(PropertyRef),
    MaxNodeAsResponse(PropertyRef),
    CountAsResponse,
}

impl Aggregate {
    pub fn is_as_response(&self) -> bool {
        !matches!(
            self,
            Self::SumAsProperty(_)
                | Self::AverageAsProperty(_)
                | Self::MinAmountAsProperty(_)
                | Self::MaxAmountAsProperty(_)
                | Self::CountAsProperty(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PropertyAsResponse {
    pub property: PropertyRef,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyAdjacentToResponse {
    pub property: PropertyRef,
    pub adjacent_key: String,
}

/// Post-processing stages, in the order the pipeline runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Derived,
    Where,
    Sort,
    Limit,
    AggregateAsProperty,
    AggregateAsResponse,
    PropertyResponse,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOption {
    Derived(DerivedOption),
    Where(WhereClause),
    Sort(SortOption),
    Limit {
        skip: Option<usize>,
        count: Option<usize>,
    },
    Aggregate(Aggregate),
    PropertyAsResponse(PropertyAsResponse),
    PropertyAdjacentToResponse(PropertyAdjacentToResponse),
}

impl QueryOption {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Derived(_) => Stage::Derived,
            Self::Where(_) => Stage::Where,
            Self::Sort(_) => Stage::Sort,
            Self::Limit { .. } => Stage::Limit,
            Self::Aggregate(a) if a.is_as_response() => Stage::AggregateAsResponse,
            Self::Aggregate(_) => Stage::AggregateAsProperty,
            Self::PropertyAsResponse(_) | Self::PropertyAdjacentToResponse(_) => {
                Stage::PropertyResponse
            }
        }
    }

    /// Every property this option reads.
    pub fn property_refs(&self) -> Vec<&PropertyRef> {
        let mut refs = Vec::new();
        match self {
            Self::Derived(d) => group_refs(&d.expression, &mut refs),
            Self::Where(WhereClause::Find(c) | WhereClause::Filter(c)) => {
                condition_refs(c, &mut refs)
            }
            Self::Sort(s) => refs.push(&s.property),
            Self::Limit { .. } => {}
            Self::Aggregate(a) => match a {
                Aggregate::SumAsProperty(p)
                | Aggregate::AverageAsProperty(p)
                | Aggregate::MinAmountAsProperty(p)
                | Aggregate::MaxAmountAsProperty(p) => refs.push(&p.compute_prop),
                Aggregate::SumAsResponse(p)
                | Aggregate::AverageAsResponse(p)
                | Aggregate::MinAmountAsResponse(p)
                | Aggregate::MaxAmountAsResponse(p)
                | Aggregate::MinNodeAsResponse(p)
                | Aggregate::MaxNodeAsResponse(p) => refs.push(p),
                Aggregate::CountAsProperty(_) | Aggregate::CountAsResponse => {}
            },
            Self::PropertyAsResponse(p) => refs.push(&p.property),
            Self::PropertyAdjacentToResponse(p) => refs.push(&p.property),
        }
        refs
    }

    /// Whether this option replaces the section with a single value.
    fn shapes_response(&self) -> bool {
        match self {
            Self::Aggregate(a) => a.is_as_response(),
            Self::PropertyAsResponse(_) => true,
            _ => false,
        }
    }
}

fn group_refs<'a>(group: &'a DerivedGroup, refs: &mut Vec<&'a PropertyRef>) {
    for item in &group.items {
        match item {
            DerivedItem::Value(_) => {}
            DerivedItem::Property(p) => refs.push(p),
            DerivedItem::Group(g) => group_refs(g, refs),
        }
    }
}

fn condition_refs<'a>(condition: &'a Condition, refs: &mut Vec<&'a PropertyRef>) {
    match condition.kind() {
        ConditionKind::Compare(_, c) => {
            for side in [&c.left, &c.right] {
                if let ValueSource::Property(p) = side {
                    refs.push(p);
                }
            }
        }
        ConditionKind::And(children) | ConditionKind::Or(children) => {
            for child in children {
                condition_refs(child, refs);
            }
        }
    }
}

// ── Generated section ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    NodeUid {
        key: String,
    },
    RelationshipUid {
        key: String,
    },
    Scalar {
        prop: String,
        key: String,
    },
    /// A prop stored on the relationship record, requested as `_<prop>`.
    RelationshipScalar {
        prop: String,
        field: String,
        key: String,
    },
    /// `hidden` sections feed `original` only; options read through them.
    Relationship {
        prop: String,
        binding: RelationshipBinding,
        section: Box<GeneratedSection>,
        hidden: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSection {
    pub node_name: String,
    pub has: Has,
    pub alias: Option<String>,
    pub fields: Vec<Field>,
    pub options: Vec<QueryOption>,
}

impl GeneratedSection {
    pub fn sort(&self) -> Option<&SortOption> {
        self.options.iter().find_map(|o| match o {
            QueryOption::Sort(s) => Some(s),
            _ => None,
        })
    }

    pub fn options_in(&self, stage: Stage) -> impl Iterator<Item = &QueryOption> {
        self.options.iter().filter(move |o| o.stage() == stage)
    }
}

// ── Binding ──────────────────────────────────────────────────────

/// Bind a top-level format section for node kind `node_name`.
pub fn bind_section(
    schema: &Schema,
    node_name: &str,
    has: Has,
    format: &Value,
    access: Option<&Stamp>,
) -> Result<GeneratedSection> {
    bind(schema, node_name, has, format, access, None)
}

fn bind(
    schema: &Schema,
    node_name: &str,
    has: Has,
    format: &Value,
    access: Option<&Stamp>,
    via: Option<&RelationshipBinding>,
) -> Result<GeneratedSection> {
    let Some(entries) = format.as_object() else {
        return Err(StrandError::validation(
            "Format section must be an object",
            json!({ "node": node_name, "format": format }),
        ));
    };
    if schema.node(node_name).is_none() {
        return Err(StrandError::validation(
            format!("Unknown node kind {node_name}"),
            json!({ "node": node_name }),
        ));
    }
    gate(access, Scope::Node(node_name.to_string()))?;
    if let Some(binding) = via {
        gate(access, Scope::Relationship(binding.relationship.clone()))?;
    }

    let mut section = GeneratedSection {
        node_name: node_name.to_string(),
        has,
        alias: None,
        fields: Vec::new(),
        options: Vec::new(),
    };
    let mut skip = None;
    let mut count = None;

    for (key, value) in entries {
        if let Some(option) = key.strip_prefix('$') {
            match option {
                "alias" => section.alias = Some(parse_option::<String>(key, value)?),
                "where" => section.options.push(QueryOption::Where(parse_option(key, value)?)),
                "sort" => section.options.push(QueryOption::Sort(parse_option(key, value)?)),
                "skip" => skip = Some(parse_option::<usize>(key, value)?),
                "count" => count = Some(parse_option::<usize>(key, value)?),
                "derived" => section.options.extend(
                    parse_option::<Vec<DerivedOption>>(key, value)?
                        .into_iter()
                        .map(QueryOption::Derived),
                ),
                "aggregate" => section.options.extend(
                    parse_option::<Vec<Aggregate>>(key, value)?
                        .into_iter()
                        .map(QueryOption::Aggregate),
                ),
                "propertyAsResponse" => section
                    .options
                    .push(QueryOption::PropertyAsResponse(parse_option(key, value)?)),
                "propertyAdjacentToResponse" => section
                    .options
                    .push(QueryOption::PropertyAdjacentToResponse(parse_option(
                        key, value,
                    )?)),
                _ => {
                    return Err(StrandError::validation(
                        format!("Unknown query option {key}"),
                        json!({ "node": node_name, "option": key }),
                    ))
                }
            }
            continue;
        }

        if key == NODE_UID_FIELD {
            if let Some(alias) = projection_key(key, value)? {
                section.fields.push(Field::NodeUid { key: alias });
            }
            continue;
        }

        if key == RELATIONSHIP_UID_FIELD {
            if via.is_none() {
                return Err(StrandError::validation(
                    "_uid is only available inside a relationship section",
                    json!({ "node": node_name }),
                ));
            }
            if let Some(alias) = projection_key(key, value)? {
                section.fields.push(Field::RelationshipUid { key: alias });
            }
            continue;
        }

        if let Some(binding) = schema.relationship_prop(node_name, key) {
            gate(
                access,
                Scope::NodeProp {
                    node: node_name.to_string(),
                    prop: key.clone(),
                },
            )?;
            let nested = bind(
                schema,
                &binding.node_name,
                binding.has,
                value,
                access,
                Some(&binding),
            )?;
            section.fields.push(Field::Relationship {
                prop: key.clone(),
                binding,
                section: Box::new(nested),
                hidden: false,
            });
            continue;
        }

        if let Some(prop) = key.strip_prefix('_') {
            let relationship = via
                .filter(|b| schema.relationship_scalar_prop(&b.relationship, prop).is_some())
                .map(|b| b.relationship.clone());
            let Some(relationship) = relationship else {
                return Err(StrandError::validation(
                    format!("Unknown relationship prop {key} on {node_name}"),
                    json!({ "node": node_name, "prop": key }),
                ));
            };
            gate(
                access,
                Scope::RelationshipProp {
                    relationship,
                    prop: prop.to_string(),
                },
            )?;
            if let Some(alias) = projection_key(key, value)? {
                section.fields.push(Field::RelationshipScalar {
                    prop: prop.to_string(),
                    field: key.clone(),
                    key: alias,
                });
            }
            continue;
        }

        if schema.scalar_prop(node_name, key).is_none() {
            return Err(StrandError::validation(
                format!("Unknown prop {key} on {node_name}"),
                json!({ "node": node_name, "prop": key }),
            ));
        }
        gate(
            access,
            Scope::NodeProp {
                node: node_name.to_string(),
                prop: key.clone(),
            },
        )?;
        if let Some(alias) = projection_key(key, value)? {
            section.fields.push(Field::Scalar {
                prop: key.clone(),
                key: alias,
            });
        }
    }

    if skip.is_some() || count.is_some() {
        section.options.push(QueryOption::Limit { skip, count });
    }
    let paths: Vec<Vec<String>> = section
        .options
        .iter()
        .flat_map(QueryOption::property_refs)
        .filter(|p| !p.is_plain())
        .map(|p| p.relationships.clone())
        .collect();
    for path in &paths {
        bind_path(schema, &mut section, path, access)?;
    }
    if section.options.iter().filter(|o| o.shapes_response()).count() > 1 {
        return Err(StrandError::validation(
            "At most one of $propertyAsResponse and the AsResponse aggregates may be used per section",
            json!({ "node": node_name }),
        ));
    }

    Ok(section)
}

/// Make sure `path` is traversed below `section`, adding hidden
/// relationship sections where the format does not project one.
fn bind_path(
    schema: &Schema,
    section: &mut GeneratedSection,
    path: &[String],
    access: Option<&Stamp>,
) -> Result<()> {
    let Some((first, rest)) = path.split_first() else {
        return Ok(());
    };

    let existing = section.fields.iter_mut().find_map(|f| match f {
        Field::Relationship { prop, section, .. } if prop == first => Some(section),
        _ => None,
    });
    if let Some(nested) = existing {
        return bind_path(schema, nested, rest, access);
    }

    let node_name = section.node_name.clone();
    let Some(binding) = schema.relationship_prop(&node_name, first) else {
        return Err(StrandError::validation(
            format!("Unknown relationship prop {first} on {node_name} in property path"),
            json!({ "node": node_name, "prop": first, "path": path }),
        ));
    };
    gate(
        access,
        Scope::NodeProp {
            node: node_name,
            prop: first.clone(),
        },
    )?;
    let mut nested = bind(
        schema,
        &binding.node_name,
        binding.has,
        &json!({}),
        access,
        Some(&binding),
    )?;
    bind_path(schema, &mut nested, rest, access)?;
    section.fields.push(Field::Relationship {
        prop: first.clone(),
        binding,
        section: Box::new(nested),
        hidden: true,
    });
    Ok(())
}

fn gate(access: Option<&Stamp>, scope: Scope) -> Result<()> {
    match access {
        Some(stamp) => stamp.check(Action::Read, &scope),
        None => Ok(()),
    }
}

fn parse_option<T: serde::de::DeserializeOwned>(key: &str, value: &Value) -> Result<T> {
    serde_json::from_value(value.clone()).map_err(|e| {
        StrandError::validation(
            format!("Invalid {key}: {e}"),
            json!({ "option": key, "value": value }),
        )
    })
}

/// Output key for a projection: `true` keeps the name, `{alias}` renames,
/// `false` skips.
fn projection_key(key: &str, value: &Value) -> Result<Option<String>> {
    match value {
        Value::Bool(true) => Ok(Some(key.to_string())),
        Value::Bool(false) => Ok(None),
        Value::Object(map) => match map.get("alias").and_then(Value::as_str) {
            Some(alias) => Ok(Some(alias.to_string())),
            None => Err(invalid_projection(key, value)),
        },
        _ => Err(invalid_projection(key, value)),
    }
}

fn invalid_projection(key: &str, value: &Value) -> StrandError {
    StrandError::validation(
        format!("Projection {key} must be true or {{\"alias\": …}}"),
        json!({ "prop": key, "value": value }),
    )
}

/// Read a property through nested projections in an `original` item.
///
/// Arrays along the path yield their first element.
pub fn resolve_property(item: &Value, property: &PropertyRef) -> Value {
    let mut current = item;
    for relationship in &property.relationships {
        current = first(current.get(relationship).unwrap_or(&Value::Null));
    }
    first(current).get(&property.prop).cloned().unwrap_or(Value::Null)
}

fn first(value: &Value) -> &Value {
    match value {
        Value::Array(items) => items.first().unwrap_or(&Value::Null),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_core::schema::{DataType, IndexKind, PropDef, RelationshipDef, RelationshipKind, ScalarProp};
    use std::collections::BTreeMap;

    fn social() -> Schema {
        let mut schema = Schema::core();
        let mut user = BTreeMap::new();
        user.insert(
            "name".to_string(),
            PropDef::Prop(ScalarProp::new(DataType::String).indexed(IndexKind::Exact)),
        );
        user.insert(
            "age".to_string(),
            PropDef::Prop(ScalarProp::new(DataType::Number).indexed(IndexKind::Sort)),
        );
        user.insert(
            "_following".to_string(),
            PropDef::forward(Has::Many, "User", "follows"),
        );
        user.insert(
            "_followers".to_string(),
            PropDef::reverse(Has::Many, "User", "follows"),
        );
        schema.nodes.insert("User".to_string(), user);
        let mut props = BTreeMap::new();
        props.insert("since".to_string(), ScalarProp::new(DataType::IsoString));
        schema.relationships.insert(
            "follows".to_string(),
            RelationshipDef {
                kind: RelationshipKind::ManyToMany,
                props,
            },
        );
        schema
    }

    #[test]
    fn binds_projections_and_nested_sections() {
        let schema = social();
        let section = bind_section(
            &schema,
            "User",
            Has::Many,
            &json!({
                "uid": { "alias": "id" },
                "name": true,
                "_following": { "$alias": "follows", "name": true, "_since": true, "_uid": true }
            }),
            None,
        )
        .unwrap();

        assert!(section.fields.contains(&Field::NodeUid { key: "id".into() }));
        let nested = section
            .fields
            .iter()
            .find_map(|f| match f {
                Field::Relationship { section, .. } => Some(section),
                _ => None,
            })
            .unwrap();
        assert_eq!(nested.alias.as_deref(), Some("follows"));
        assert!(nested.fields.contains(&Field::RelationshipScalar {
            prop: "since".into(),
            field: "_since".into(),
            key: "_since".into()
        }));
        assert!(nested.fields.contains(&Field::RelationshipUid { key: "_uid".into() }));
    }

    #[test]
    fn parses_typed_options() {
        let schema = social();
        let section = bind_section(
            &schema,
            "User",
            Has::Many,
            &json!({
                "name": true,
                "$where": { "filter": { "and": [
                    { "greaterThan": { "left": { "property": "age" }, "right": { "value": 20 } } },
                    { "startsWith": { "left": { "property": "name" }, "right": { "value": "A" } } }
                ] } },
                "$sort": { "property": "age", "direction": "desc" },
                "$skip": 1,
                "$count": 2,
                "$derived": [{ "newProp": "next", "symbol": "add", "items": [{ "property": "age" }, { "value": 1 }] }],
                "$aggregate": ["countAsResponse"]
            }),
            None,
        )
        .unwrap();

        assert_eq!(section.sort().map(|s| s.direction), Some(SortDirection::Desc));
        assert!(section.options.contains(&QueryOption::Limit {
            skip: Some(1),
            count: Some(2)
        }));
        assert_eq!(section.options_in(Stage::AggregateAsResponse).count(), 1);
        assert_eq!(section.options_in(Stage::Derived).count(), 1);
    }

    #[test]
    fn rejects_unknown_props_and_options() {
        let schema = social();
        let err = bind_section(&schema, "User", Has::Many, &json!({ "email": true }), None).unwrap_err();
        assert_eq!(err.kind(), "validation");

        let err = bind_section(&schema, "User", Has::Many, &json!({ "$groupBy": 1 }), None).unwrap_err();
        assert_eq!(err.kind(), "validation");

        let err = bind_section(&schema, "User", Has::Many, &json!({ "_uid": true }), None).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn rejects_two_response_shapers() {
        let schema = social();
        let err = bind_section(
            &schema,
            "User",
            Has::Many,
            &json!({
                "$aggregate": ["countAsResponse", { "sumAsResponse": "age" }]
            }),
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn option_paths_bind_hidden_sections() {
        let schema = social();
        let section = bind_section(
            &schema,
            "User",
            Has::Many,
            &json!({
                "name": true,
                "_followers": { "name": true },
                "$where": { "filter": { "equals": {
                    "left": { "property": { "prop": "age", "relationships": ["_following", "_following"] } },
                    "right": { "property": { "prop": "name", "relationships": ["_followers"] } }
                } } }
            }),
            None,
        )
        .unwrap();

        let relationships: Vec<(&str, bool, &GeneratedSection)> = section
            .fields
            .iter()
            .filter_map(|f| match f {
                Field::Relationship { prop, hidden, section, .. } => Some((prop.as_str(), *hidden, section.as_ref())),
                _ => None,
            })
            .collect();
        assert_eq!(relationships.len(), 2);

        let (_, hidden, following) = relationships.iter().find(|(p, ..)| *p == "_following").unwrap();
        assert!(*hidden);
        assert!(following.fields.iter().any(|f| matches!(
            f,
            Field::Relationship { prop, hidden: true, .. } if prop == "_following"
        )));
        let (_, hidden, _) = relationships.iter().find(|(p, ..)| *p == "_followers").unwrap();
        assert!(!*hidden);

        let err = bind_section(
            &schema,
            "User",
            Has::Many,
            &json!({ "$sort": { "property": { "prop": "name", "relationships": ["_nemesis"] } } }),
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn property_refs_walk_nested_projections() {
        let item = json!({ "name": "Ann", "_following": [{ "name": "Bob" }, { "name": "Cy" }] });
        assert_eq!(resolve_property(&item, &PropertyRef::plain("name")), json!("Ann"));
        let via = PropertyRef {
            prop: "name".into(),
            relationships: vec!["_following".into()],
        };
        assert_eq!(resolve_property(&item, &via), json!("Bob"));
        assert_eq!(resolve_property(&item, &PropertyRef::plain("missing")), Value::Null);
    }

    #[test]
    fn property_ref_accepts_both_shapes() {
        let a: PropertyRef = serde_json::from_value(json!("age")).unwrap();
        let b: PropertyRef =
            serde_json::from_value(json!({ "prop": "age", "relationships": ["_role"] })).unwrap();
        assert!(a.is_plain());
        assert_eq!(b.relationships, vec!["_role".to_string()]);
    }
}
