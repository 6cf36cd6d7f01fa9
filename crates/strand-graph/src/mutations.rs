//! Write operations for the graph.
//!
//! A mutation batch ("sert") is validated entirely in memory and committed
//! with a single `put_many`. Node items upsert by UID; temp UIDs (`_:name`)
//! are minted in a first pass so relationship items anywhere in the batch
//! can point at them. Exact and unique index entries are last-write-wins.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use strand_core::keys::{
    self, ENDPOINT_A, ENDPOINT_B, ISO_NOW, NODE_NAME_FIELD, NODE_UIDS_KEY, NODE_UID_FIELD,
    RELATIONSHIP_NAME_FIELD, RELATIONSHIP_UID_FIELD,
};
use strand_core::schema::{DataType, Direction, IndexKind, ScalarProp};
use strand_core::{Result, Schema, StrandError};

use crate::client::Storage;
use crate::passport::{Action, Passport, Scope, Stamp};
use crate::queries::RequestCache;

// ── Request types ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutationRequest {
    #[serde(default)]
    pub insert: Vec<SertItem>,
}

/// One node or relationship to insert or upsert; `kind` decides which.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SertItem {
    pub kind: String,
    #[serde(default)]
    pub x: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationResponse {
    /// Temp UID → minted UID.
    pub identity: BTreeMap<String, String>,
    /// Every storage key written.
    pub put: Vec<String>,
}

// ── Identity resolution ──────────────────────────────────────────

/// Temp UID → graph UID map for one batch.
#[derive(Debug, Default)]
pub struct IdentityResolver {
    assigned: BTreeMap<String, String>,
}

impl IdentityResolver {
    /// Claim `uid` as an item's own UID. Temp UIDs get a fresh UUID and may
    /// be claimed once; known UIDs pass through.
    pub fn assign(&mut self, uid: &str) -> Result<String> {
        if !keys::is_temp_uid(uid) {
            return Ok(uid.to_string());
        }
        if self.assigned.contains_key(uid) {
            return Err(StrandError::validation(
                format!("Duplicate temp UID {uid}"),
                json!({ "uid": uid }),
            ));
        }
        let minted = Uuid::new_v4().to_string();
        self.assigned.insert(uid.to_string(), minted.clone());
        Ok(minted)
    }

    /// Graph UID for a reference to `uid`.
    pub fn resolve(&self, uid: &str) -> Result<String> {
        if !keys::is_temp_uid(uid) {
            return Ok(uid.to_string());
        }
        self.assigned.get(uid).cloned().ok_or_else(|| {
            StrandError::validation(
                format!("Unresolved temp UID {uid}"),
                json!({ "uid": uid }),
            )
        })
    }

    pub fn mapping(&self) -> &BTreeMap<String, String> {
        &self.assigned
    }

    pub fn into_mapping(self) -> BTreeMap<String, String> {
        self.assigned
    }
}

// ── Batch phases ─────────────────────────────────────────────────

#[derive(Debug)]
struct NodeSert {
    kind: String,
    uid: String,
    props: Map<String, Value>,
}

#[derive(Debug)]
struct RelationshipSert {
    kind: String,
    uid: String,
    a: String,
    b: String,
    props: Map<String, Value>,
}

/// Every item classified and checked, own UIDs assigned. Endpoints may
/// still hold temp UIDs.
struct StagedBatch {
    nodes: Vec<NodeSert>,
    relationships: Vec<RelationshipSert>,
    resolver: IdentityResolver,
}

/// Endpoints rewritten to graph UIDs. Only this phase can write.
struct ResolvedBatch {
    nodes: Vec<NodeSert>,
    relationships: Vec<RelationshipSert>,
    identity: BTreeMap<String, String>,
}

impl StagedBatch {
    fn stage(stamp: &Stamp, request: &MutationRequest) -> Result<Self> {
        let mut batch = Self {
            nodes: Vec::new(),
            relationships: Vec::new(),
            resolver: IdentityResolver::default(),
        };
        let now = Utc::now().to_rfc3339();

        for (index, item) in request.insert.iter().enumerate() {
            if stamp.schema.node(&item.kind).is_some() {
                let node = stage_node(stamp, &mut batch.resolver, item, &now)?;
                batch.nodes.push(node);
            } else if stamp.schema.relationship(&item.kind).is_some() {
                let relationship = stage_relationship(stamp, &mut batch.resolver, item, &now)?;
                batch.relationships.push(relationship);
            } else {
                return Err(StrandError::validation(
                    format!("Unknown kind {}", item.kind),
                    json!({ "kind": item.kind, "index": index }),
                ));
            }
        }
        Ok(batch)
    }

    fn resolve(self) -> Result<ResolvedBatch> {
        let Self {
            nodes,
            relationships,
            resolver,
        } = self;

        let nodes = nodes
            .into_iter()
            .map(|mut node| {
                resolve_props(&resolver, &mut node.props)?;
                Ok(node)
            })
            .collect::<Result<Vec<_>>>()?;

        let relationships = relationships
            .into_iter()
            .map(|mut rel| {
                rel.a = resolver.resolve(&rel.a)?;
                rel.b = resolver.resolve(&rel.b)?;
                resolve_props(&resolver, &mut rel.props)?;
                Ok(rel)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ResolvedBatch {
            nodes,
            relationships,
            identity: resolver.into_mapping(),
        })
    }
}

/// Rewrite every temp-UID-valued string prop to its graph UID.
fn resolve_props(resolver: &IdentityResolver, props: &mut Map<String, Value>) -> Result<()> {
    for value in props.values_mut() {
        let Some(raw) = value.as_str().filter(|v| keys::is_temp_uid(v)) else {
            continue;
        };
        *value = Value::String(resolver.resolve(raw)?);
    }
    Ok(())
}

fn stage_node(
    stamp: &Stamp,
    resolver: &mut IdentityResolver,
    item: &SertItem,
    now: &str,
) -> Result<NodeSert> {
    let kind = &item.kind;
    let (uid, action) = claim_uid(resolver, item, NODE_UID_FIELD)?;
    stamp.check(action, &Scope::Node(kind.clone()))?;

    let mut props = Map::new();
    for (prop, value) in &item.x {
        if prop == NODE_UID_FIELD {
            continue;
        }
        let Some(def) = stamp.schema.scalar_prop(kind, prop) else {
            return Err(StrandError::validation(
                format!("Unknown prop {prop} on {kind}"),
                json!({ "kind": kind, "prop": prop }),
            ));
        };
        stamp.check(
            action,
            &Scope::NodeProp {
                node: kind.clone(),
                prop: prop.clone(),
            },
        )?;
        props.insert(prop.clone(), checked_value(def, value, now, kind, prop)?);
    }

    Ok(NodeSert {
        kind: kind.clone(),
        uid,
        props,
    })
}

fn stage_relationship(
    stamp: &Stamp,
    resolver: &mut IdentityResolver,
    item: &SertItem,
    now: &str,
) -> Result<RelationshipSert> {
    let kind = &item.kind;
    let endpoint = |field: &str| {
        item.x
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                StrandError::validation(
                    format!("Relationship {kind} needs a string endpoint {field}"),
                    json!({ "kind": kind, "field": field }),
                )
            })
    };
    let a = endpoint(ENDPOINT_A)?;
    let b = endpoint(ENDPOINT_B)?;
    let (uid, action) = claim_uid(resolver, item, RELATIONSHIP_UID_FIELD)?;
    stamp.check(action, &Scope::Relationship(kind.clone()))?;

    let mut props = Map::new();
    for (prop, value) in &item.x {
        if [ENDPOINT_A, ENDPOINT_B, RELATIONSHIP_UID_FIELD].contains(&prop.as_str()) {
            continue;
        }
        let Some(def) = stamp.schema.relationship_scalar_prop(kind, prop) else {
            return Err(StrandError::validation(
                format!("Unknown prop {prop} on relationship {kind}"),
                json!({ "kind": kind, "prop": prop }),
            ));
        };
        stamp.check(
            action,
            &Scope::RelationshipProp {
                relationship: kind.clone(),
                prop: prop.clone(),
            },
        )?;
        props.insert(prop.clone(), checked_value(def, value, now, kind, prop)?);
    }

    Ok(RelationshipSert {
        kind: kind.clone(),
        uid,
        a,
        b,
        props,
    })
}

/// The item's own UID and whether writing it inserts or upserts.
fn claim_uid(resolver: &mut IdentityResolver, item: &SertItem, field: &str) -> Result<(String, Action)> {
    match item.x.get(field) {
        None => Ok((Uuid::new_v4().to_string(), Action::Insert)),
        Some(Value::String(raw)) if !keys::is_record_key(raw) => Err(StrandError::validation(
            format!("{field} {raw} names an engine key"),
            json!({ "kind": item.kind, "field": field, "value": raw }),
        )),
        Some(Value::String(raw)) => {
            let action = if keys::is_temp_uid(raw) {
                Action::Insert
            } else {
                Action::Upsert
            };
            Ok((resolver.assign(raw)?, action))
        }
        Some(other) => Err(StrandError::validation(
            format!("{field} must be a string"),
            json!({ "kind": item.kind, "field": field, "value": other }),
        )),
    }
}

/// Type-check a scalar and substitute the current time for `"now"`.
fn checked_value(def: &ScalarProp, value: &Value, now: &str, owner: &str, prop: &str) -> Result<Value> {
    if !def.data_type.accepts(value) {
        return Err(StrandError::validation(
            format!("{owner}.{prop} has the wrong type"),
            json!({ "kind": owner, "prop": prop, "expected": def.data_type, "value": value }),
        ));
    }
    if def.data_type == DataType::IsoString && value.as_str() == Some(ISO_NOW) {
        return Ok(Value::String(now.to_string()));
    }
    Ok(value.clone())
}

// ── Staged writes ────────────────────────────────────────────────

/// Pending writes layered over a request cache of stored values.
struct Staging<'a> {
    cache: RequestCache<'a>,
    writes: BTreeMap<String, Value>,
}

impl<'a> Staging<'a> {
    fn new(storage: &'a dyn Storage) -> Self {
        Self {
            cache: RequestCache::new(storage),
            writes: BTreeMap::new(),
        }
    }

    /// Staged value if any, else the stored one.
    async fn load(&mut self, key: &str) -> Result<Option<Value>> {
        if let Some(value) = self.writes.get(key) {
            return Ok(Some(value.clone()));
        }
        self.cache.get(key).await
    }

    async fn load_many(&mut self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        let unstaged: Vec<String> = keys
            .iter()
            .filter(|k| !self.writes.contains_key(*k))
            .cloned()
            .collect();
        self.cache.get_or_fetch(&unstaged).await?;

        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.load(key).await?);
        }
        Ok(values)
    }

    fn stage(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        debug!(key = %key, "Staged write");
        self.writes.insert(key, value);
    }

    async fn registry(&mut self) -> Result<Map<String, Value>> {
        Ok(self
            .load(NODE_UIDS_KEY)
            .await?
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default())
    }
}

impl ResolvedBatch {
    async fn commit(self, schema: &Schema, storage: &dyn Storage) -> Result<MutationResponse> {
        let mut staging = Staging::new(storage);
        let mut registry = staging.registry().await?;
        let mut registry_changed = false;
        let mut sort_touched: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
        let mut touched: BTreeSet<String> = BTreeSet::new();

        // ── Nodes
        for node in &self.nodes {
            let record = match staging.load(&node.uid).await? {
                Some(mut existing) => {
                    let existing_kind = existing.get(NODE_NAME_FIELD).and_then(Value::as_str);
                    if existing_kind != Some(node.kind.as_str()) {
                        return Err(StrandError::validation(
                            format!("UID {} does not hold a {} node", node.uid, node.kind),
                            json!({ "uid": node.uid, "kind": node.kind, "found": existing_kind }),
                        ));
                    }
                    if let Some(fields) = existing.as_object_mut() {
                        fields.extend(node.props.clone());
                    }
                    existing
                }
                None => {
                    let mut fields = Map::new();
                    fields.insert(NODE_NAME_FIELD.to_string(), json!(node.kind));
                    fields.insert(NODE_UID_FIELD.to_string(), json!(node.uid));
                    fields.extend(node.props.clone());
                    Value::Object(fields)
                }
            };
            staging.stage(node.uid.clone(), record);

            let members = registry
                .entry(node.kind.clone())
                .or_insert_with(|| json!([]));
            if let Some(members) = members.as_array_mut() {
                if !members.iter().any(|u| u.as_str() == Some(node.uid.as_str())) {
                    members.push(json!(node.uid));
                    registry_changed = true;
                }
            }

            for (prop, value) in &node.props {
                let Some(def) = schema.scalar_prop(&node.kind, prop) else {
                    continue;
                };
                if def.has_index(IndexKind::Exact) {
                    staging.stage(keys::exact_index_key(&node.kind, prop, value), json!(node.uid));
                }
                if def.has_index(IndexKind::Unique) {
                    staging.stage(keys::unique_index_key(&node.kind, prop, value), json!(node.uid));
                }
                if def.has_index(IndexKind::Sort) {
                    sort_touched
                        .entry((node.kind.clone(), prop.clone()))
                        .or_default()
                        .push(node.uid.clone());
                }
            }
            touched.insert(node.uid.clone());
        }
        if registry_changed {
            staging.stage(NODE_UIDS_KEY, Value::Object(registry));
        }

        // ── Relationships
        for rel in &self.relationships {
            let a_kind = endpoint_kind(&mut staging, rel, &rel.a).await?;
            let b_kind = endpoint_kind(&mut staging, rel, &rel.b).await?;
            check_endpoints(schema, rel, &a_kind, &b_kind)?;

            let record = match staging.load(&rel.uid).await? {
                Some(mut existing) => {
                    let same_kind = existing.get(RELATIONSHIP_NAME_FIELD).and_then(Value::as_str)
                        == Some(rel.kind.as_str());
                    let same_ends = existing.get(ENDPOINT_A).and_then(Value::as_str) == Some(rel.a.as_str())
                        && existing.get(ENDPOINT_B).and_then(Value::as_str) == Some(rel.b.as_str());
                    if !same_kind || !same_ends {
                        return Err(StrandError::validation(
                            format!("Relationship {} cannot change kind or endpoints", rel.uid),
                            json!({ "uid": rel.uid, "kind": rel.kind, "a": rel.a, "b": rel.b }),
                        ));
                    }
                    if let Some(fields) = existing.as_object_mut() {
                        fields.extend(rel.props.clone());
                    }
                    existing
                }
                None => {
                    let mut fields = Map::new();
                    fields.insert(RELATIONSHIP_NAME_FIELD.to_string(), json!(rel.kind));
                    fields.insert(RELATIONSHIP_UID_FIELD.to_string(), json!(rel.uid));
                    fields.insert(ENDPOINT_A.to_string(), json!(rel.a));
                    fields.insert(ENDPOINT_B.to_string(), json!(rel.b));
                    fields.extend(rel.props.clone());
                    Value::Object(fields)
                }
            };
            staging.stage(rel.uid.clone(), record);

            attach(&mut staging, &rel.a, &rel.kind, &rel.uid).await?;
            if rel.b != rel.a {
                attach(&mut staging, &rel.b, &rel.kind, &rel.uid).await?;
            }
        }

        // ── Required props
        for uid in &touched {
            check_required(schema, &mut staging, uid).await?;
        }

        // ── Sort indexes
        for ((kind, prop), uids) in sort_touched {
            rewrite_sort_index(&mut staging, &kind, &prop, uids).await?;
        }

        let put: Vec<String> = staging.writes.keys().cloned().collect();
        if !staging.writes.is_empty() {
            storage.put_many(staging.writes).await?;
        }

        info!(
            nodes = self.nodes.len(),
            relationships = self.relationships.len(),
            keys = put.len(),
            "Mutation batch committed"
        );
        Ok(MutationResponse {
            identity: self.identity,
            put,
        })
    }
}

async fn endpoint_kind(staging: &mut Staging<'_>, rel: &RelationshipSert, uid: &str) -> Result<String> {
    let record = staging.load(uid).await?;
    record
        .as_ref()
        .and_then(|r| r.get(NODE_NAME_FIELD))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            StrandError::validation(
                format!("Relationship {} points at missing node {uid}", rel.kind),
                json!({ "kind": rel.kind, "uid": uid }),
            )
        })
}

/// Endpoint kinds must follow the relationship's prop arrangement: `a` owns
/// the forward prop, `b` the reverse one; bidirectional props join two
/// nodes of the owning kind.
fn check_endpoints(schema: &Schema, rel: &RelationshipSert, a_kind: &str, b_kind: &str) -> Result<()> {
    let props = schema.props_for_relationship(&rel.kind);
    let owner = |direction: Direction| props.iter().find(|p| p.direction == direction).map(|p| p.owner);

    let expected = match owner(Direction::Bidirectional) {
        Some(node) => Some((node, node)),
        None => owner(Direction::Forward).zip(owner(Direction::Reverse)),
    };
    let Some((want_a, want_b)) = expected else {
        return Err(StrandError::schema(
            format!("Relationship {} is not carried by any node", rel.kind),
            json!({ "kind": rel.kind }),
        ));
    };

    if (a_kind, b_kind) != (want_a, want_b) {
        return Err(StrandError::validation(
            format!(
                "Relationship {} joins {want_a} to {want_b}, got {a_kind} to {b_kind}",
                rel.kind
            ),
            json!({ "kind": rel.kind, "a": rel.a, "b": rel.b }),
        ));
    }
    Ok(())
}

/// Add `rel_uid` to the node's attachment list for `relationship`, once.
async fn attach(staging: &mut Staging<'_>, uid: &str, relationship: &str, rel_uid: &str) -> Result<()> {
    let Some(mut record) = staging.load(uid).await? else {
        return Ok(());
    };
    let field = keys::relationship_list_field(relationship);
    if let Some(fields) = record.as_object_mut() {
        let list = fields.entry(field).or_insert_with(|| json!([]));
        if let Some(list) = list.as_array_mut() {
            if list.iter().any(|u| u.as_str() == Some(rel_uid)) {
                return Ok(());
            }
            list.push(json!(rel_uid));
        }
    }
    staging.stage(uid, record);
    Ok(())
}

async fn detach(staging: &mut Staging<'_>, uid: &str, relationship: &str, rel_uid: &str) -> Result<()> {
    let Some(mut record) = staging.load(uid).await? else {
        return Ok(());
    };
    let field = keys::relationship_list_field(relationship);
    if let Some(list) = record.get_mut(&field).and_then(Value::as_array_mut) {
        list.retain(|u| u.as_str() != Some(rel_uid));
    }
    staging.stage(uid, record);
    Ok(())
}

/// Every `mustBeDefined` prop of the node's final shape is present.
async fn check_required(schema: &Schema, staging: &mut Staging<'_>, uid: &str) -> Result<()> {
    let Some(record) = staging.load(uid).await? else {
        return Ok(());
    };
    let kind = record
        .get(NODE_NAME_FIELD)
        .and_then(Value::as_str)
        .unwrap_or_default();
    let Some(def) = schema.node(kind) else {
        return Ok(());
    };

    for (prop, prop_def) in def {
        if let Some(scalar) = prop_def.as_scalar() {
            let present = record.get(prop).is_some_and(|v| scalar.data_type.accepts(v));
            if scalar.must_be_defined && !present {
                return Err(StrandError::validation(
                    format!("{kind}.{prop} must be defined"),
                    json!({ "kind": kind, "uid": uid, "prop": prop }),
                ));
            }
            continue;
        }
        let Some((direction, rel)) = prop_def.as_relationship() else {
            continue;
        };
        if !rel.must_be_defined {
            continue;
        }

        let attached = string_list(record.get(&keys::relationship_list_field(&rel.relationship_name)));
        let present = match direction {
            Direction::Bidirectional => !attached.is_empty(),
            Direction::Forward | Direction::Reverse => {
                let own_end = if direction == Direction::Forward {
                    ENDPOINT_A
                } else {
                    ENDPOINT_B
                };
                staging
                    .load_many(&attached)
                    .await?
                    .iter()
                    .flatten()
                    .any(|r| r.get(own_end).and_then(Value::as_str) == Some(uid))
            }
        };
        if !present {
            return Err(StrandError::validation(
                format!("{kind}.{prop} must be defined"),
                json!({ "kind": kind, "uid": uid, "prop": prop }),
            ));
        }
    }
    Ok(())
}

/// Merge `uids` into the stored list and re-rank every member by the
/// stringified value of `prop`. Members without the prop are dropped.
async fn rewrite_sort_index(staging: &mut Staging<'_>, kind: &str, prop: &str, uids: Vec<String>) -> Result<()> {
    let key = keys::sort_index_key(kind, prop);
    let mut members = string_list(staging.load(&key).await?.as_ref());
    let mut seen: BTreeSet<String> = members.iter().cloned().collect();
    for uid in uids {
        if seen.insert(uid.clone()) {
            members.push(uid);
        }
    }

    let records = staging.load_many(&members).await?;
    let mut ranked: Vec<(String, String)> = members
        .into_iter()
        .zip(records)
        .filter_map(|(uid, record)| {
            let record = record?;
            let value = record.get(prop).filter(|v| !v.is_null())?;
            Some((keys::index_value(value), uid))
        })
        .collect();
    ranked.sort_by(|x, y| x.0.cmp(&y.0));

    debug!(index = %key, size = ranked.len(), "Sort index rewritten");
    let ordered: Vec<String> = ranked.into_iter().map(|(_, uid)| uid).collect();
    staging.stage(key, json!(ordered));
    Ok(())
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

// ── Passport entry points ────────────────────────────────────────

impl Passport {
    /// Validate and commit one insert/upsert batch.
    pub async fn mutate(&self, request: &MutationRequest) -> Result<MutationResponse> {
        let stamp = self.stamped()?;
        let staged = StagedBatch::stage(stamp, request)?;
        debug!(
            nodes = staged.nodes.len(),
            relationships = staged.relationships.len(),
            temp_uids = staged.resolver.mapping().len(),
            "Batch staged"
        );
        let resolved = staged.resolve()?;
        resolved.commit(&stamp.schema, self.client.storage()).await
    }

    /// Delete nodes with their attached relationships and index entries.
    ///
    /// Unknown UIDs are skipped. Returns every deleted storage key.
    pub async fn delete_nodes(&self, uids: &[String]) -> Result<Vec<String>> {
        let stamp = self.stamped()?;
        let schema = &stamp.schema;
        let storage = self.client.storage();
        let mut staging = Staging::new(storage);

        let mut doomed: BTreeSet<String> = BTreeSet::new();
        let mut targets: Vec<(String, String, Value)> = Vec::new();
        for (uid, record) in uids.iter().zip(staging.load_many(uids).await?) {
            let kind = record
                .as_ref()
                .and_then(|r| r.get(NODE_NAME_FIELD))
                .and_then(Value::as_str)
                .map(str::to_string);
            let (Some(kind), Some(record)) = (kind, record) else {
                debug!(uid = %uid, "No node to delete");
                continue;
            };
            stamp.check(Action::Write, &Scope::Node(kind.clone()))?;
            if doomed.insert(uid.clone()) {
                targets.push((uid.clone(), kind, record));
            }
        }

        let mut registry = staging.registry().await?;
        for (uid, kind, record) in &targets {
            for (field, list) in record.as_object().into_iter().flatten() {
                let Some(relationship) = keys::relationship_from_list_field(field) else {
                    continue;
                };
                for rel_uid in string_list(Some(list)) {
                    if !doomed.insert(rel_uid.clone()) {
                        continue;
                    }
                    let Some(rel) = staging.load(&rel_uid).await? else {
                        continue;
                    };
                    for end in [ENDPOINT_A, ENDPOINT_B] {
                        let Some(other) = rel.get(end).and_then(Value::as_str) else {
                            continue;
                        };
                        if !doomed.contains(other) {
                            detach(&mut staging, other, relationship, &rel_uid).await?;
                        }
                    }
                }
            }

            if let Some(members) = registry.get_mut(kind).and_then(Value::as_array_mut) {
                members.retain(|u| u.as_str() != Some(uid.as_str()));
            }

            for (prop, def) in schema.node(kind).into_iter().flatten() {
                let Some(scalar) = def.as_scalar() else {
                    continue;
                };
                if scalar.has_index(IndexKind::Sort) {
                    let key = keys::sort_index_key(kind, prop);
                    if let Some(mut list) = staging.load(&key).await? {
                        if let Some(items) = list.as_array_mut() {
                            items.retain(|u| u.as_str() != Some(uid.as_str()));
                        }
                        staging.stage(key, list);
                    }
                }
                let Some(value) = record.get(prop) else {
                    continue;
                };
                let mut index_keys = Vec::new();
                if scalar.has_index(IndexKind::Exact) {
                    index_keys.push(keys::exact_index_key(kind, prop, value));
                }
                if scalar.has_index(IndexKind::Unique) {
                    index_keys.push(keys::unique_index_key(kind, prop, value));
                }
                for key in index_keys {
                    let points_here = staging
                        .load(&key)
                        .await?
                        .is_some_and(|v| v.as_str() == Some(uid.as_str()));
                    if points_here {
                        doomed.insert(key);
                    }
                }
            }
        }

        if !targets.is_empty() {
            staging.stage(NODE_UIDS_KEY, Value::Object(registry));
        }
        let mut writes = staging.writes;
        writes.retain(|key, _| !doomed.contains(key));
        if !writes.is_empty() {
            storage.put_many(writes).await?;
        }
        let deleted: Vec<String> = doomed.into_iter().collect();
        if !deleted.is_empty() {
            storage.delete_many(&deleted).await?;
        }

        info!(nodes = targets.len(), keys = deleted.len(), "Nodes deleted");
        Ok(deleted)
    }
}
