//! One function per CLI command. Each returns the JSON printed on stdout.

use std::collections::BTreeMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use strand_core::Schema;
use strand_graph::{hash, MutationRequest, Passport, QueryRequest};

use crate::error::{CliError, Result};

/// Parse a JSON request file.
pub fn read_request<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| CliError::Request {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

pub fn show_schema(passport: &Passport) -> Result<Value> {
    Ok(serde_json::to_value(passport.schema()?)?)
}

pub async fn add_schema(passport: &mut Passport, addition: Schema) -> Result<Value> {
    let merged = passport.add_to_schema(addition).await?;
    Ok(serde_json::to_value(merged)?)
}

pub async fn mutate(passport: &Passport, request: &MutationRequest) -> Result<Value> {
    let response = passport.mutate(request).await?;
    Ok(serde_json::to_value(response)?)
}

/// Run `request`, filling in configured public keys it does not name.
pub async fn query(
    passport: &Passport,
    mut request: QueryRequest,
    configured_keys: &BTreeMap<String, String>,
) -> Result<Value> {
    for (name, key) in configured_keys {
        request
            .public_keys
            .entry(name.clone())
            .or_insert_with(|| key.clone());
    }
    Ok(Value::Object(passport.query(&request).await?))
}

pub async fn delete(passport: &Passport, uids: &[String]) -> Result<Value> {
    let deleted = passport.delete_nodes(uids).await?;
    Ok(json!({ "deleted": deleted }))
}

pub async fn delete_all(passport: &mut Passport) -> Result<Value> {
    passport.delete_all().await?;
    Ok(json!({ "deleted": "all" }))
}

/// Sign `plaintext` with a base64 32-byte seed, returning the value to store
/// in a hash prop and the public key that verifies it.
pub fn sign(secret_b64: &str, plaintext: &str) -> Result<Value> {
    let bytes = STANDARD
        .decode(secret_b64)
        .map_err(|e| CliError::Secret(e.to_string()))?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| CliError::Secret(format!("expected 32 bytes, got {}", b.len())))?;

    Ok(json!({
        "hash": hash::sign(&seed, plaintext),
        "publicKey": hash::public_key(&seed),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_graph::GraphClient;

    fn pet_schema() -> Schema {
        serde_json::from_value(json!({
            "nodes": {
                "Pet": {
                    "name": { "is": "Prop", "dataType": "string", "mustBeDefined": true },
                    "secret": { "is": "Prop", "dataType": "hash" },
                    "_friends": { "is": "BidirectionalRelationshipProp", "has": "many",
                                  "nodeName": "Pet", "relationshipName": "friendsWith" }
                }
            },
            "relationships": { "friendsWith": { "kind": "ManyToMany" } }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn schema_mutate_query_delete_flow() {
        let client = GraphClient::in_memory();
        let mut passport = client.passport(None).await.unwrap();

        let merged = add_schema(&mut passport, pet_schema()).await.unwrap();
        assert!(merged["nodes"]["Pet"].is_object());
        assert!(show_schema(&passport).unwrap()["nodes"]["StrandUser"].is_object());

        let request: MutationRequest = serde_json::from_value(json!({ "insert": [
            { "kind": "Pet", "x": { "uid": "_:rex", "name": "Rex" } },
            { "kind": "Pet", "x": { "uid": "_:tom", "name": "Tom" } },
            { "kind": "friendsWith", "x": { "a": "_:rex", "b": "_:tom" } }
        ] }))
        .unwrap();
        let response = mutate(&passport, &request).await.unwrap();
        let rex = response["identity"]["_:rex"].as_str().unwrap().to_string();

        let request: QueryRequest = serde_json::from_value(json!({
            "queries": [{ "by": "Uid", "kind": "Pet", "uid": rex,
                          "format": { "name": true, "_friends": { "name": true } } }]
        }))
        .unwrap();
        let found = query(&passport, request, &BTreeMap::new()).await.unwrap();
        assert_eq!(found["Pet"], json!({ "name": "Rex", "_friends": [{ "name": "Tom" }] }));

        let removed = delete(&passport, &[rex.clone()]).await.unwrap();
        let removed = removed["deleted"].as_array().unwrap();
        assert_eq!(removed.len(), 2, "node and its friendship: {removed:?}");
        assert!(removed.contains(&json!(rex)));

        delete_all(&mut passport).await.unwrap();
        assert!(show_schema(&passport).unwrap()["nodes"].get("Pet").is_none());
    }

    #[tokio::test]
    async fn configured_public_keys_fill_gaps() {
        let seed = [7u8; 32];
        let client = GraphClient::in_memory();
        let mut passport = client.passport(None).await.unwrap();
        add_schema(&mut passport, pet_schema()).await.unwrap();

        let request: MutationRequest = serde_json::from_value(json!({ "insert": [
            { "kind": "Pet", "x": { "uid": "p1", "name": "Rex", "secret": hash::sign(&seed, "bone") } }
        ] }))
        .unwrap();
        mutate(&passport, &request).await.unwrap();

        let request: QueryRequest = serde_json::from_value(json!({
            "queries": [{ "by": "Kind", "kind": "Pet", "format": {
                "name": true,
                "$where": { "find": { "equals": {
                    "left": { "property": "secret" }, "right": { "value": "bone" }, "publicKey": "pets"
                } } }
            } }]
        }))
        .unwrap();
        let keys = BTreeMap::from([("pets".to_string(), hash::public_key(&seed))]);
        let found = query(&passport, request, &keys).await.unwrap();
        assert_eq!(found["Pet"], json!({ "name": "Rex" }));
    }

    #[test]
    fn sign_needs_a_32_byte_seed() {
        let seed = STANDARD.encode([1u8; 32]);
        let signed = sign(&seed, "pw").unwrap();
        let verified = hash::verify(
            signed["publicKey"].as_str().unwrap(),
            signed["hash"].as_str().unwrap(),
            "pw",
        );
        assert!(verified);

        let short = STANDARD.encode([1u8; 16]);
        assert!(matches!(sign(&short, "pw"), Err(CliError::Secret(_))));
        assert!(matches!(sign("***", "pw"), Err(CliError::Secret(_))));
    }

    #[test]
    fn unreadable_request_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ \"insert\": 3 }").unwrap();

        let err = read_request::<MutationRequest>(&path).unwrap_err();
        assert!(matches!(err, CliError::Request { .. }));
    }
}
