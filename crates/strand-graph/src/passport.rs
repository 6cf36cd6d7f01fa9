//! Per-request authorization context.
//!
//! A [`Passport`] starts unstamped. Stamping loads the schema, reads the
//! global enforcement setting and, when enforcement is on, resolves the
//! bearer token to a user, a role and the role's revocations. Every gated
//! operation checks the resulting deny-set before touching storage.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use strand_core::keys::{ENFORCE_PERMISSIONS_SLUG, SCHEMA_KEY};
use strand_core::{Result, Schema, StrandError};

use crate::client::GraphClient;
use crate::queries::{run_queries, QueryItem, QueryRequest};

// ── Revocation keys ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    /// Covers both `Insert` and `Upsert`.
    Write,
    Insert,
    Upsert,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Schema,
    Node(String),
    Relationship(String),
    NodeProp { node: String, prop: String },
    RelationshipProp { relationship: String, prop: String },
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schema => write!(f, "schema"),
            Self::Node(n) => write!(f, "node {n}"),
            Self::Relationship(r) => write!(f, "relationship {r}"),
            Self::NodeProp { node, prop } => write!(f, "prop {node}.{prop}"),
            Self::RelationshipProp { relationship, prop } => {
                write!(f, "prop {relationship}.{prop}")
            }
        }
    }
}

/// One denied `(action, scope)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revocation {
    pub action: Action,
    pub scope: Scope,
}

impl Revocation {
    pub fn new(action: Action, scope: Scope) -> Self {
        Self { action, scope }
    }

    /// Parse a stored `StrandRevokesPermission` projection.
    ///
    /// `schema: true` wins over names; a prop name narrows a node or
    /// relationship scope. Records naming both a node and a relationship
    /// are ambiguous and yield `None`.
    pub fn from_record(record: &Value) -> Option<Self> {
        let action: Action = serde_json::from_value(record.get("action")?.clone()).ok()?;
        let text = |key: &str| record.get(key).and_then(Value::as_str).map(str::to_string);

        let scope = if record.get("schema").and_then(Value::as_bool) == Some(true) {
            Scope::Schema
        } else {
            match (text("nodeName"), text("relationshipName"), text("propName")) {
                (Some(node), None, Some(prop)) => Scope::NodeProp { node, prop },
                (Some(node), None, None) => Scope::Node(node),
                (None, Some(relationship), Some(prop)) => {
                    Scope::RelationshipProp { relationship, prop }
                }
                (None, Some(relationship), None) => Scope::Relationship(relationship),
                _ => return None,
            }
        };
        Some(Self { action, scope })
    }
}

// ── Stamp ────────────────────────────────────────────────────────

/// Everything resolved by [`Passport::stamp`].
#[derive(Debug, Clone)]
pub struct Stamp {
    pub(crate) schema: Schema,
    enforce: bool,
    user: Option<Value>,
    role: Option<Value>,
    revocations: HashSet<Revocation>,
}

impl Stamp {
    /// Whether `(action, scope)` is permitted, without logging.
    pub(crate) fn allows(&self, action: Action, scope: &Scope) -> bool {
        if !self.enforce {
            return true;
        }
        let revoked = |a: Action| {
            self.revocations.contains(&Revocation {
                action: a,
                scope: scope.clone(),
            })
        };
        !(revoked(action)
            || (matches!(action, Action::Insert | Action::Upsert) && revoked(Action::Write)))
    }

    /// Fail with `Auth` when enforcement is on and `(action, scope)` is revoked.
    pub(crate) fn check(&self, action: Action, scope: &Scope) -> Result<()> {
        if self.allows(action, scope) {
            return Ok(());
        }
        warn!(action = ?action, scope = %scope, "Permission revoked");
        Err(StrandError::auth(
            format!("Permission to {action:?} {scope} is revoked"),
            json!({ "action": action, "scope": scope.to_string() }),
        ))
    }
}

// ── Passport ─────────────────────────────────────────────────────

pub struct Passport {
    pub(crate) client: GraphClient,
    token: Option<String>,
    stamp: Option<Stamp>,
}

impl Passport {
    pub fn new(client: GraphClient, token: Option<String>) -> Self {
        Self {
            client,
            token,
            stamp: None,
        }
    }

    pub fn is_stamped(&self) -> bool {
        self.stamp.is_some()
    }

    /// Resolve schema, enforcement and identity. Later calls are no-ops.
    pub async fn stamp(&mut self) -> Result<()> {
        if self.stamp.is_some() {
            return Ok(());
        }

        let schema = self
            .client
            .get_typed::<Schema>(SCHEMA_KEY)
            .await?
            .unwrap_or_else(Schema::core);
        let enforce = enforcement_on(&self.client, &schema).await?;

        let mut stamp = Stamp {
            schema,
            enforce,
            user: None,
            role: None,
            revocations: HashSet::new(),
        };

        if enforce {
            let token = self.token.as_deref().ok_or_else(|| {
                StrandError::auth("Permissions are enforced but no token was given", Value::Null)
            })?;
            let (user, role) = resolve_identity(&self.client, &stamp.schema, token).await?;
            stamp.revocations = role
                .get("_revokesPermissions")
                .and_then(Value::as_array)
                .map(|records| records.iter().filter_map(Revocation::from_record).collect())
                .unwrap_or_default();
            stamp.user = Some(user);
            stamp.role = Some(role);
        }

        info!(
            enforce = stamp.enforce,
            revocations = stamp.revocations.len(),
            "Passport stamped"
        );
        self.stamp = Some(stamp);
        Ok(())
    }

    pub(crate) fn stamped(&self) -> Result<&Stamp> {
        self.stamp
            .as_ref()
            .ok_or_else(|| StrandError::auth("Passport has not been stamped", Value::Null))
    }

    pub(crate) fn stamped_mut(&mut self) -> Result<&mut Stamp> {
        self.stamp
            .as_mut()
            .ok_or_else(|| StrandError::auth("Passport has not been stamped", Value::Null))
    }

    /// Check `(action, scope)` against the revocation set.
    pub fn authorize(&self, action: Action, scope: Scope) -> Result<()> {
        self.stamped()?.check(action, &scope)
    }

    pub fn enforces_permissions(&self) -> bool {
        self.stamp.as_ref().is_some_and(|s| s.enforce)
    }

    /// The resolved user projection, when enforcement is on.
    pub fn user(&self) -> Option<&Value> {
        self.stamp.as_ref()?.user.as_ref()
    }

    /// The resolved role projection, when enforcement is on.
    pub fn role(&self) -> Option<&Value> {
        self.stamp.as_ref()?.role.as_ref()
    }

    pub fn revocations(&self) -> Option<&HashSet<Revocation>> {
        self.stamp.as_ref().map(|s| &s.revocations)
    }

    // ── Schema operations ────────────────────────────────────────

    pub fn schema(&self) -> Result<&Schema> {
        let stamp = self.stamped()?;
        stamp.check(Action::Read, &Scope::Schema)?;
        Ok(&stamp.schema)
    }

    /// Merge `addition` into the stored schema and persist it.
    pub async fn add_to_schema(&mut self, addition: Schema) -> Result<Schema> {
        let client = self.client.clone();
        let stamp = self.stamped_mut()?;
        stamp.check(Action::Write, &Scope::Schema)?;

        let (nodes, relationships) = (addition.nodes.len(), addition.relationships.len());
        let merged = stamp.schema.merge_addition(addition)?;
        client
            .storage()
            .put(SCHEMA_KEY, serde_json::to_value(&merged)?)
            .await?;

        info!(nodes, relationships, "Schema extended");
        stamp.schema = merged.clone();
        Ok(merged)
    }

    /// Wipe schema and data.
    pub async fn delete_all(&mut self) -> Result<()> {
        let client = self.client.clone();
        let stamp = self.stamped_mut()?;
        stamp.check(Action::Write, &Scope::Schema)?;

        client.storage().delete_all().await?;
        stamp.schema = Schema::core();
        info!("All schema and data deleted");
        Ok(())
    }
}

// ── Stamping helpers ─────────────────────────────────────────────

async fn enforcement_on(client: &GraphClient, schema: &Schema) -> Result<bool> {
    let request = QueryRequest::single(QueryItem::ExactIndex {
        kind: "StrandSetting".to_string(),
        property: "slug".to_string(),
        value: json!(ENFORCE_PERMISSIONS_SLUG),
        key: Some("setting".to_string()),
        format: json!({ "isOn": true }),
    });
    let response = run_queries(client, schema, None, &request).await?;
    let on = response
        .get("setting")
        .and_then(|s| s.get("isOn"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    debug!(on, "Enforcement setting read");
    Ok(on)
}

async fn resolve_identity(
    client: &GraphClient,
    schema: &Schema,
    token: &str,
) -> Result<(Value, Value)> {
    let request = QueryRequest::single(QueryItem::Uid {
        kind: "StrandToken".to_string(),
        uid: token.to_string(),
        key: Some("token".to_string()),
        format: json!({
            "uid": true,
            "_user": {
                "uid": true,
                "name": true,
                "_role": {
                    "uid": true,
                    "name": true,
                    "slug": true,
                    "_revokesPermissions": {
                        "uid": true,
                        "action": true,
                        "nodeName": true,
                        "relationshipName": true,
                        "propName": true,
                        "schema": true
                    }
                }
            }
        }),
    });
    let mut response = run_queries(client, schema, None, &request).await?;
    let token_node = response.remove("token").unwrap_or(Value::Null);

    let user = token_node.get("_user").cloned().unwrap_or(Value::Null);
    if user.is_null() {
        return Err(StrandError::auth(
            "Token does not resolve to a user",
            json!({ "token": token }),
        ));
    }
    let role = user.get("_role").cloned().unwrap_or(Value::Null);
    if role.is_null() {
        return Err(StrandError::auth(
            "User has no role",
            json!({ "token": token, "user": user.get("uid") }),
        ));
    }
    Ok((user, role))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(enforce: bool, revocations: &[Revocation]) -> Stamp {
        Stamp {
            schema: Schema::core(),
            enforce,
            user: None,
            role: None,
            revocations: revocations.iter().cloned().collect(),
        }
    }

    #[test]
    fn revocation_from_record_scopes() {
        let r = Revocation::from_record(&json!({ "action": "write", "nodeName": "Secret" }));
        assert_eq!(
            r,
            Some(Revocation::new(Action::Write, Scope::Node("Secret".into())))
        );

        let r = Revocation::from_record(
            &json!({ "action": "read", "relationshipName": "follows", "propName": "since" }),
        );
        assert_eq!(
            r.map(|r| r.scope),
            Some(Scope::RelationshipProp {
                relationship: "follows".into(),
                prop: "since".into()
            })
        );

        let r = Revocation::from_record(&json!({ "action": "read", "schema": true, "nodeName": "X" }));
        assert_eq!(r.map(|r| r.scope), Some(Scope::Schema));

        assert!(Revocation::from_record(&json!({ "action": "fly", "nodeName": "X" })).is_none());
        assert!(Revocation::from_record(&json!({ "action": "read" })).is_none());
    }

    #[test]
    fn scopes_do_not_collide_across_kinds() {
        let s = stamp(
            true,
            &[Revocation::new(Action::Read, Scope::Node("follows".into()))],
        );
        assert!(s.check(Action::Read, &Scope::Node("follows".into())).is_err());
        assert!(s
            .check(Action::Read, &Scope::Relationship("follows".into()))
            .is_ok());
    }

    #[test]
    fn write_covers_insert_and_upsert() {
        let s = stamp(
            true,
            &[Revocation::new(Action::Write, Scope::Node("Secret".into()))],
        );
        let scope = Scope::Node("Secret".into());
        assert!(s.check(Action::Insert, &scope).is_err());
        assert!(s.check(Action::Upsert, &scope).is_err());
        assert!(s.check(Action::Read, &scope).is_ok());

        let s = stamp(
            true,
            &[Revocation::new(Action::Insert, Scope::Node("Secret".into()))],
        );
        assert!(s.check(Action::Insert, &scope).is_err());
        assert!(s.check(Action::Upsert, &scope).is_ok());
    }

    #[test]
    fn enforcement_off_allows_everything() {
        let s = stamp(false, &[Revocation::new(Action::Write, Scope::Schema)]);
        assert!(s.check(Action::Write, &Scope::Schema).is_ok());
    }

    #[tokio::test]
    async fn unstamped_passport_is_refused() {
        let passport = Passport::new(GraphClient::in_memory(), None);
        let err = passport.schema().unwrap_err();
        assert_eq!(err.kind(), "auth");
    }

    #[tokio::test]
    async fn stamp_without_enforcement_loads_core_schema() {
        let mut passport = Passport::new(GraphClient::in_memory(), None);
        passport.stamp().await.unwrap();
        passport.stamp().await.unwrap();
        assert!(!passport.enforces_permissions());
        assert!(passport.schema().unwrap().node("StrandUser").is_some());
    }
}
