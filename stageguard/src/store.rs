//! Document store abstraction.
//!
//! Cost documents, budget state, decisions and review items are persisted
//! as JSON documents addressed by `(collection, id)`. The store is an
//! injected trait so runs can be backed by memory in tests and by files
//! or a remote document database in production.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::StoreError;

/// Well-known collection names.
pub mod collections {
    /// Per-run cost documents.
    pub const COSTS: &str = "costs";
    /// Budget state.
    pub const BUDGET: &str = "budget";
    /// Document id of the single budget state document.
    pub const BUDGET_STATE_ID: &str = "state";
    /// Per-run quality decisions.
    pub const QUALITY_DECISIONS: &str = "quality_decisions";
    /// Human review items.
    pub const REVIEWS: &str = "reviews";
}

/// Async key/document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reads a document, `None` if absent.
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// Writes a document, replacing any previous version.
    async fn set_document(&self, collection: &str, id: &str, document: Value)
        -> Result<(), StoreError>;
}

/// Reads and deserializes a document.
pub async fn load_document<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
) -> Result<Option<T>, StoreError> {
    match store.get_document(collection, id).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StoreError::new(collection, id, format!("decode failed: {e}"))),
        None => Ok(None),
    }
}

/// Serializes and writes a document.
pub async fn save_document<T: Serialize + Sync>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    document: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(document)
        .map_err(|e| StoreError::new(collection, id, format!("encode failed: {e}")))?;
    store.set_document(collection, id, value).await
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: DashMap<(String, String), Value>,
}

impl InMemoryDocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Ids stored in a collection, sorted.
    #[must_use]
    pub fn ids(&self, collection: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .documents
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .map(|entry| entry.key().1.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .documents
            .get(&(collection.to_string(), id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn set_document(
        &self,
        collection: &str,
        id: &str,
        document: Value,
    ) -> Result<(), StoreError> {
        self.documents
            .insert((collection.to_string(), id.to_string()), document);
        Ok(())
    }
}

/// Store writing one pretty-printed JSON file per document under
/// `<root>/<collection>/<id>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Creates a store rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, collection: &str, id: &str) -> Result<PathBuf, StoreError> {
        for (label, part) in [("collection", collection), ("id", id)] {
            let bad = part.is_empty()
                || part == "."
                || part == ".."
                || part.contains(['/', '\\']);
            if bad {
                return Err(StoreError::new(
                    collection,
                    id,
                    format!("invalid {label} '{part}'"),
                ));
            }
        }
        Ok(self.root.join(collection).join(format!("{id}.json")))
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(collection, id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::new(collection, id, e.to_string())),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::new(collection, id, format!("invalid JSON: {e}")))
    }

    async fn set_document(
        &self,
        collection: &str,
        id: &str,
        document: Value,
    ) -> Result<(), StoreError> {
        let path = self.path_for(collection, id)?;
        let dir = self.root.join(collection);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::new(collection, id, e.to_string()))?;

        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| StoreError::new(collection, id, format!("encode failed: {e}")))?;

        // Write-then-rename so readers never observe a torn document.
        let tmp = dir.join(format!(".{id}.json.tmp"));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StoreError::new(collection, id, e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::new(collection, id, e.to_string()))?;

        debug!(path = %path.display(), "Wrote document");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        value: u32,
    }

    #[tokio::test]
    async fn test_in_memory_roundtrip_and_missing() {
        let store = InMemoryDocumentStore::new();
        assert!(store.get_document("costs", "2024-01-01").await.unwrap().is_none());

        store
            .set_document("costs", "2024-01-01", json!({"total": 1.5}))
            .await
            .unwrap();
        let doc = store.get_document("costs", "2024-01-01").await.unwrap().unwrap();
        assert_eq!(doc["total"], 1.5);
        assert_eq!(store.ids("costs"), vec!["2024-01-01"]);
        assert!(store.ids("budget").is_empty());
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        let store = InMemoryDocumentStore::new();
        let doc = Doc {
            name: "a".into(),
            value: 7,
        };
        save_document(&store, "things", "a", &doc).await.unwrap();
        let loaded: Option<Doc> = load_document(&store, "things", "a").await.unwrap();
        assert_eq!(loaded, Some(doc));
    }

    #[tokio::test]
    async fn test_typed_load_reports_decode_failure() {
        let store = InMemoryDocumentStore::new();
        store.set_document("things", "bad", json!([1, 2])).await.unwrap();
        let err = load_document::<Doc>(&store, "things", "bad").await.unwrap_err();
        assert!(err.message.contains("decode failed"));
    }

    #[tokio::test]
    async fn test_json_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());

        assert!(store.get_document("budget", "state").await.unwrap().is_none());
        store
            .set_document("budget", "state", json!({"remaining": 12.5}))
            .await
            .unwrap();
        store
            .set_document("budget", "state", json!({"remaining": 10.0}))
            .await
            .unwrap();

        assert!(dir.path().join("budget").join("state.json").exists());
        let doc = store.get_document("budget", "state").await.unwrap().unwrap();
        assert_eq!(doc["remaining"], 10.0);
    }

    #[tokio::test]
    async fn test_json_file_store_rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.set_document("..", "x", json!({})).await.is_err());
        assert!(store.get_document("costs", "a/b").await.is_err());
    }
}
