//! Storage gateway contract and the shared graph client.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use strand_core::StrandError;

use crate::passport::Passport;

/// Errors from storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend rejected write: {0}")]
    WriteRejected(String),

    #[error("Corrupt value under key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<StorageError> for StrandError {
    fn from(e: StorageError) -> Self {
        StrandError::Storage(e.to_string())
    }
}

/// Range and paging options for [`Storage::list`].
///
/// `start` is inclusive, `start_after` and `end` are exclusive.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub start: Option<String>,
    pub start_after: Option<String>,
    pub end: Option<String>,
    pub prefix: Option<String>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

/// Transactional key-value backend the engine runs on.
///
/// Every call may suspend. `put_many` is the engine's only durability
/// primitive: a mutation batch is committed with exactly one call.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Fetch several keys; missing keys are absent from the result.
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Value>, StorageError>;

    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError>;

    /// Write all entries as one logical operation.
    async fn put_many(&self, entries: BTreeMap<String, Value>) -> Result<(), StorageError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Returns how many keys existed.
    async fn delete_many(&self, keys: &[String]) -> Result<usize, StorageError>;

    async fn delete_all(&self) -> Result<(), StorageError>;

    async fn list(&self, options: &ListOptions) -> Result<BTreeMap<String, Value>, StorageError>;
}

/// Ordered in-memory backend.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a backend pre-populated with `entries`.
    pub fn from_snapshot(entries: BTreeMap<String, Value>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Copy of every stored entry.
    pub async fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Value>, StorageError> {
        let entries = self.entries.read().await;
        Ok(keys
            .iter()
            .filter_map(|k| entries.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn put_many(&self, entries: BTreeMap<String, Value>) -> Result<(), StorageError> {
        self.entries.write().await.extend(entries);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize, StorageError> {
        let mut entries = self.entries.write().await;
        Ok(keys.iter().filter(|k| entries.remove(*k).is_some()).count())
    }

    async fn delete_all(&self) -> Result<(), StorageError> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn list(&self, options: &ListOptions) -> Result<BTreeMap<String, Value>, StorageError> {
        let entries = self.entries.read().await;

        let lower = match (&options.start_after, &options.start) {
            (Some(after), _) => Bound::Excluded(after.clone()),
            (None, Some(start)) => Bound::Included(start.clone()),
            (None, None) => Bound::Unbounded,
        };
        let upper = match &options.end {
            Some(end) => Bound::Excluded(end.clone()),
            None => Bound::Unbounded,
        };
        if let (Bound::Included(l) | Bound::Excluded(l), Bound::Excluded(u)) = (&lower, &upper) {
            if l >= u {
                return Ok(BTreeMap::new());
            }
        }

        let matching = entries
            .range::<String, _>((lower, upper))
            .filter(|(k, _)| {
                options
                    .prefix
                    .as_deref()
                    .map_or(true, |p| k.starts_with(p))
            });

        let limit = options.limit.unwrap_or(usize::MAX);
        let picked: Vec<(&String, &Value)> = if options.reverse {
            matching.rev().take(limit).collect()
        } else {
            matching.take(limit).collect()
        };

        Ok(picked
            .into_iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Shared handle to a storage backend.
///
/// This is the single point of access for all graph operations.
/// Clone is cheap (inner Arc).
#[derive(Clone)]
pub struct GraphClient {
    storage: Arc<dyn Storage>,
}

impl GraphClient {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Client over a fresh [`MemoryStorage`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    /// Build and stamp a passport for one request.
    pub async fn passport(&self, token: Option<String>) -> strand_core::Result<Passport> {
        let mut passport = Passport::new(self.clone(), token);
        passport.stamp().await?;
        Ok(passport)
    }

    /// Read a key and deserialize it, treating a missing key as `None`.
    pub(crate) async fn get_typed<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> strand_core::Result<Option<T>> {
        match self.storage.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value).map_err(|e| {
                StorageError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
            })?)),
            None => Ok(None),
        }
    }
}
