//! Read operations for the graph.
//!
//! A query names an entry point (one UID, an exact-index lookup, or every
//! node of a kind) and a format tree. The format is bound to the schema once,
//! records are pulled through a request-scoped cache, projected into paired
//! `current`/`original` trees, and post-processed section by section.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use strand_core::keys::{
    self, ENDPOINT_A, ENDPOINT_B, NODE_NAME_FIELD, NODE_UIDS_KEY, NODE_UID_FIELD,
    RELATIONSHIP_NAME_FIELD, RELATIONSHIP_UID_FIELD,
};
use strand_core::schema::{Direction, Has, IndexKind, RelationshipBinding};
use strand_core::{Result, Schema, StrandError};

use crate::client::{GraphClient, Storage};
use crate::format::{bind_section, Field, GeneratedSection, SortDirection};
use crate::passport::{Action, Passport, Scope, Stamp};
use crate::pipeline::Pipeline;
use crate::response::ResponsePair;

// ── Request types ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub queries: Vec<QueryItem>,
    /// Key name → base64 ed25519 public key, for hashed-prop comparisons.
    #[serde(default)]
    pub public_keys: BTreeMap<String, String>,
}

impl QueryRequest {
    pub fn single(item: QueryItem) -> Self {
        Self {
            queries: vec![item],
            public_keys: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "by")]
pub enum QueryItem {
    Uid {
        kind: String,
        uid: String,
        #[serde(default)]
        key: Option<String>,
        format: Value,
    },
    ExactIndex {
        kind: String,
        property: String,
        value: Value,
        #[serde(default)]
        key: Option<String>,
        format: Value,
    },
    Kind {
        kind: String,
        #[serde(default)]
        key: Option<String>,
        format: Value,
    },
}

impl QueryItem {
    pub fn kind(&self) -> &str {
        match self {
            Self::Uid { kind, .. } | Self::ExactIndex { kind, .. } | Self::Kind { kind, .. } => kind,
        }
    }

    /// Response key, defaulting to the kind.
    pub fn key(&self) -> &str {
        let key = match self {
            Self::Uid { key, .. } | Self::ExactIndex { key, .. } | Self::Kind { key, .. } => key,
        };
        key.as_deref().unwrap_or_else(|| self.kind())
    }

    pub fn format(&self) -> &Value {
        match self {
            Self::Uid { format, .. }
            | Self::ExactIndex { format, .. }
            | Self::Kind { format, .. } => format,
        }
    }

    fn has(&self) -> Has {
        match self {
            Self::Kind { .. } => Has::Many,
            Self::Uid { .. } | Self::ExactIndex { .. } => Has::One,
        }
    }
}

// ── Request cache ────────────────────────────────────────────────

/// Storage key → fetched value, for one `query` call.
///
/// Misses are remembered too, so no key reaches the backend twice.
pub struct RequestCache<'a> {
    storage: &'a dyn Storage,
    entries: HashMap<String, Option<Value>>,
}

impl<'a> RequestCache<'a> {
    pub fn new(storage: &'a dyn Storage) -> Self {
        Self {
            storage,
            entries: HashMap::new(),
        }
    }

    /// Values for `keys`, in order, fetching every uncached key in one batch.
    pub async fn get_or_fetch(&mut self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        let mut seen = HashSet::new();
        let missing: Vec<String> = keys
            .iter()
            .filter(|k| !self.entries.contains_key(*k) && seen.insert(k.as_str()))
            .cloned()
            .collect();

        if !missing.is_empty() {
            debug!(keys = missing.len(), "Cache miss batch");
            let mut found = self.storage.get_many(&missing).await?;
            for key in missing {
                let value = found.remove(&key);
                self.entries.insert(key, value);
            }
        }

        Ok(keys
            .iter()
            .map(|k| self.entries.get(k).cloned().flatten())
            .collect())
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<Value>> {
        let mut values = self.get_or_fetch(&[key.to_string()]).await?;
        Ok(values.pop().flatten())
    }

    /// Number of distinct keys looked up so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Passport entry point ─────────────────────────────────────────

impl Passport {
    /// Run every query in `request`, returning `{ key: value }`.
    pub async fn query(&self, request: &QueryRequest) -> Result<Map<String, Value>> {
        let stamp = self.stamped()?;
        run_queries(&self.client, &stamp.schema, Some(stamp), request).await
    }
}

/// Resolve `request`; `access: None` skips read checks.
pub(crate) async fn run_queries(
    client: &GraphClient,
    schema: &Schema,
    access: Option<&Stamp>,
    request: &QueryRequest,
) -> Result<Map<String, Value>> {
    let mut resolver = Resolver {
        schema,
        access,
        pipeline: Pipeline::new(schema, &request.public_keys),
        cache: RequestCache::new(client.storage()),
    };
    let mut response = Map::new();

    for item in &request.queries {
        let section = bind_section(schema, item.kind(), item.has(), item.format(), access)?;
        let (entries, presorted) = resolver.entry_points(item, &section).await?;
        let found = entries.len();
        let value = resolver.resolve_section(entries, &section, presorted).await?;

        debug!(kind = %item.kind(), key = %item.key(), found, presorted, "Query item resolved");
        response.insert(item.key().to_string(), value.current);
        for (key, adjacent) in value.adjacent {
            response.insert(key, adjacent);
        }
    }

    info!(
        queries = request.queries.len(),
        keys_read = resolver.cache.len(),
        "Query complete"
    );
    Ok(response)
}

// ── Resolution ───────────────────────────────────────────────────

/// A node record plus the relationship record it was reached through.
struct Entry {
    node: Value,
    relationship: Option<Value>,
}

struct SectionValue {
    current: Value,
    original: Value,
    adjacent: Vec<(String, Value)>,
}

type SectionFuture<'s> = Pin<Box<dyn Future<Output = Result<SectionValue>> + Send + 's>>;

struct Resolver<'a> {
    schema: &'a Schema,
    access: Option<&'a Stamp>,
    pipeline: Pipeline<'a>,
    cache: RequestCache<'a>,
}

impl<'a> Resolver<'a> {
    /// Initial records for a query item, and whether they are already in
    /// `$sort` order.
    async fn entry_points(
        &mut self,
        item: &QueryItem,
        section: &GeneratedSection,
    ) -> Result<(Vec<Entry>, bool)> {
        match item {
            QueryItem::Uid { kind, uid, .. } => {
                let node = self.node_of_kind(uid, kind).await?;
                Ok((node.map(top_level).into_iter().collect(), false))
            }
            QueryItem::ExactIndex {
                kind,
                property,
                value,
                ..
            } => {
                let index_key = self.lookup_key(kind, property, value)?;
                let uid = self
                    .cache
                    .get(&index_key)
                    .await?
                    .and_then(|v| v.as_str().map(str::to_string));
                let Some(uid) = uid else {
                    return Ok((Vec::new(), false));
                };
                // Index entries are last-write-wins; skip ones the node no longer matches.
                let node = self.node_of_kind(&uid, kind).await?.filter(|n| {
                    n.get(property)
                        .is_some_and(|v| keys::index_value(v) == keys::index_value(value))
                });
                if node.is_none() {
                    debug!(key = %index_key, "Stale index entry");
                }
                Ok((node.map(top_level).into_iter().collect(), false))
            }
            QueryItem::Kind { kind, .. } => {
                let (uids, presorted) = self.kind_uids(kind, section).await?;
                let records = self.cache.get_or_fetch(&uids).await?;
                let entries = records
                    .into_iter()
                    .flatten()
                    .filter(|r| is_kind(r, kind))
                    .map(top_level)
                    .collect();
                Ok((entries, presorted))
            }
        }
    }

    fn lookup_key(&self, kind: &str, property: &str, value: &Value) -> Result<String> {
        let prop = self.schema.scalar_prop(kind, property);
        match prop {
            Some(p) if p.has_index(IndexKind::Exact) => Ok(keys::exact_index_key(kind, property, value)),
            Some(p) if p.has_index(IndexKind::Unique) => {
                Ok(keys::unique_index_key(kind, property, value))
            }
            _ => Err(StrandError::validation(
                format!("{kind}.{property} has no exact or unique index"),
                json!({ "kind": kind, "property": property }),
            )),
        }
    }

    /// UIDs of every `kind` node, taken from the sort index when `$sort`
    /// names a plain sort-indexed prop.
    async fn kind_uids(&mut self, kind: &str, section: &GeneratedSection) -> Result<(Vec<String>, bool)> {
        let indexed_sort = section.sort().filter(|s| {
            s.property.is_plain()
                && self
                    .schema
                    .scalar_prop(kind, &s.property.prop)
                    .is_some_and(|p| p.has_index(IndexKind::Sort))
        });

        let registry = self.cache.get(NODE_UIDS_KEY).await?;
        let all = string_list(registry.as_ref().and_then(|r| r.get(kind)));

        let Some(sort) = indexed_sort else {
            return Ok((all, false));
        };
        let key = keys::sort_index_key(kind, &sort.property.prop);
        let indexed = string_list(self.cache.get(&key).await?.as_ref());

        // Nodes without the prop are absent from the index and sort as nulls.
        let listed: HashSet<&str> = indexed.iter().map(String::as_str).collect();
        let unset: Vec<String> = all
            .iter()
            .filter(|uid| !listed.contains(uid.as_str()))
            .cloned()
            .collect();
        debug!(kind, index = %key, unset = unset.len(), "Reading sort index");

        let uids = match sort.direction {
            SortDirection::Asc => unset.into_iter().chain(indexed).collect(),
            SortDirection::Desc => indexed.into_iter().rev().chain(unset).collect(),
        };
        Ok((uids, true))
    }

    async fn node_of_kind(&mut self, uid: &str, kind: &str) -> Result<Option<Value>> {
        Ok(self.cache.get(uid).await?.filter(|r| is_kind(r, kind)))
    }

    /// Project, post-process and shape one section.
    fn resolve_section<'s>(
        &'s mut self,
        entries: Vec<Entry>,
        section: &'s GeneratedSection,
        presorted: bool,
    ) -> SectionFuture<'s> {
        Box::pin(async move {
            let mut pair = ResponsePair::new();
            for entry in &entries {
                let (current, original) = self.project(entry, section).await?;
                pair.push(current, original);
            }

            let outcome = self.pipeline.run(section, &mut pair, presorted);
            let (current, original) = if outcome.collapse || section.has == Has::One {
                pair.into_single()
            } else {
                pair.into_arrays()
            };
            Ok(SectionValue {
                current,
                original,
                adjacent: outcome.adjacent,
            })
        })
    }

    async fn project(&mut self, entry: &Entry, section: &GeneratedSection) -> Result<(Value, Value)> {
        let mut current = Map::new();
        let mut original = self.readable_scalars(entry, &section.node_name);
        let relationship = entry.relationship.as_ref();

        for field in &section.fields {
            match field {
                Field::NodeUid { key } => {
                    copy_field(&entry.node, NODE_UID_FIELD, NODE_UID_FIELD, key, &mut current, &mut original);
                }
                Field::RelationshipUid { key } => {
                    if let Some(rel) = relationship {
                        copy_field(rel, RELATIONSHIP_UID_FIELD, RELATIONSHIP_UID_FIELD, key, &mut current, &mut original);
                    }
                }
                Field::Scalar { prop, key } => {
                    copy_field(&entry.node, prop, prop, key, &mut current, &mut original);
                }
                Field::RelationshipScalar { prop, field, key } => {
                    if let Some(rel) = relationship {
                        copy_field(rel, prop, field, key, &mut current, &mut original);
                    }
                }
                Field::Relationship {
                    prop,
                    binding,
                    section: nested,
                    hidden,
                } => {
                    let neighbors = self.neighbors(&entry.node, binding).await?;
                    let value = self.resolve_section(neighbors, nested, false).await?;
                    original.insert(prop.clone(), value.original);
                    if *hidden {
                        continue;
                    }
                    let key = nested.alias.clone().unwrap_or_else(|| prop.clone());
                    current.insert(key, value.current);
                    for (adjacent_key, adjacent) in value.adjacent {
                        current.insert(adjacent_key.clone(), adjacent.clone());
                        original.insert(adjacent_key, adjacent);
                    }
                }
            }
        }
        Ok((Value::Object(current), Value::Object(original)))
    }

    /// Every stored scalar the caller may read, keyed by schema name. Options
    /// compare against these even when the format does not project them.
    fn readable_scalars(&self, entry: &Entry, node_name: &str) -> Map<String, Value> {
        let readable = |scope: Scope| self.access.map_or(true, |s| s.allows(Action::Read, &scope));
        let mut original = Map::new();

        if let Some(node) = self.schema.node(node_name) {
            for prop in node.iter().filter(|(_, def)| def.as_scalar().is_some()).map(|(p, _)| p) {
                let Some(value) = entry.node.get(prop) else {
                    continue;
                };
                if readable(Scope::NodeProp {
                    node: node_name.to_string(),
                    prop: prop.clone(),
                }) {
                    original.insert(prop.clone(), value.clone());
                }
            }
        }

        let Some(rel) = entry.relationship.as_ref() else {
            return original;
        };
        let kind = rel.get(RELATIONSHIP_NAME_FIELD).and_then(Value::as_str).unwrap_or_default();
        if let Some(def) = self.schema.relationship(kind) {
            for prop in def.props.keys() {
                let Some(value) = rel.get(prop) else {
                    continue;
                };
                if readable(Scope::RelationshipProp {
                    relationship: kind.to_string(),
                    prop: prop.clone(),
                }) {
                    original.insert(format!("_{prop}"), value.clone());
                }
            }
        }
        original
    }

    /// Nodes on the far side of `binding`'s relationship records.
    async fn neighbors(&mut self, node: &Value, binding: &RelationshipBinding) -> Result<Vec<Entry>> {
        let uid = node.get(NODE_UID_FIELD).and_then(Value::as_str).unwrap_or_default();
        let list_field = keys::relationship_list_field(&binding.relationship);
        let relationship_uids = string_list(node.get(&list_field));
        let relationships = self.cache.get_or_fetch(&relationship_uids).await?;

        let mut attached = Vec::new();
        for rel in relationships.into_iter().flatten() {
            let a = rel.get(ENDPOINT_A).and_then(Value::as_str);
            let b = rel.get(ENDPOINT_B).and_then(Value::as_str);
            let other = match binding.direction {
                Direction::Forward if a == Some(uid) => b,
                Direction::Reverse if b == Some(uid) => a,
                Direction::Bidirectional if a == Some(uid) => b,
                Direction::Bidirectional if b == Some(uid) => a,
                _ => None,
            };
            if let Some(other) = other.map(str::to_string) {
                attached.push((other, rel));
            }
        }

        let neighbor_uids: Vec<String> = attached.iter().map(|(uid, _)| uid.clone()).collect();
        let neighbors = self.cache.get_or_fetch(&neighbor_uids).await?;
        Ok(attached
            .into_iter()
            .zip(neighbors)
            .filter_map(|((_, rel), node)| {
                let node = node.filter(|n| is_kind(n, &binding.node_name))?;
                Some(Entry {
                    node,
                    relationship: Some(rel),
                })
            })
            .collect())
    }
}

fn top_level(node: Value) -> Entry {
    Entry {
        node,
        relationship: None,
    }
}

fn is_kind(record: &Value, kind: &str) -> bool {
    record.get(NODE_NAME_FIELD).and_then(Value::as_str) == Some(kind)
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

/// Copy `record[source]` to `current[key]` and `original[name]`, when set.
fn copy_field(
    record: &Value,
    source: &str,
    name: &str,
    key: &str,
    current: &mut Map<String, Value>,
    original: &mut Map<String, Value>,
) {
    if let Some(value) = record.get(source) {
        current.insert(key.to_string(), value.clone());
        original.insert(name.to_string(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryStorage;

    fn request(value: Value) -> QueryRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn query_items_parse_by_entry_mode() {
        let req = request(json!({
            "queries": [
                { "by": "Uid", "kind": "User", "uid": "u1", "format": { "name": true } },
                { "by": "ExactIndex", "kind": "User", "property": "name", "value": "Ann", "key": "ann", "format": {} },
                { "by": "Kind", "kind": "User", "format": {} }
            ],
            "publicKeys": { "main": "abc" }
        }));
        assert_eq!(req.queries.len(), 3);
        assert_eq!(req.queries[0].key(), "User");
        assert_eq!(req.queries[1].key(), "ann");
        assert!(matches!(req.queries[2], QueryItem::Kind { .. }));
        assert_eq!(req.public_keys["main"], "abc");
    }

    #[tokio::test]
    async fn cache_fetches_each_key_once() {
        let storage = MemoryStorage::new();
        storage.put("k1", json!(1)).await.unwrap();
        let mut cache = RequestCache::new(&storage);

        let first = cache
            .get_or_fetch(&["k1".to_string(), "k2".to_string(), "k1".to_string()])
            .await
            .unwrap();
        assert_eq!(first, vec![Some(json!(1)), None, Some(json!(1))]);
        assert_eq!(cache.len(), 2);

        storage.put("k2", json!(2)).await.unwrap();
        assert_eq!(cache.get("k2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_uid_resolves_to_null() {
        let client = GraphClient::in_memory();
        let passport = client.passport(None).await.unwrap();
        let response = passport
            .query(&request(json!({
                "queries": [{ "by": "Uid", "kind": "StrandUser", "uid": "missing", "format": { "name": true } }]
            })))
            .await
            .unwrap();
        assert_eq!(response["StrandUser"], Value::Null);
    }

    #[tokio::test]
    async fn exact_index_requires_an_index() {
        let client = GraphClient::in_memory();
        let passport = client.passport(None).await.unwrap();
        let err = passport
            .query(&request(json!({
                "queries": [{ "by": "ExactIndex", "kind": "StrandUser", "property": "name", "value": "x", "format": {} }]
            })))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
