//! In-memory backend implementations.
//!
//! [`MemoryDocumentBackend`] implements the full [`DocumentBackend`]
//! surface, including a simulated search-index control plane:
//! `createSearchIndexes` / `updateSearchIndex` / `dropSearchIndex`
//! commands, `$listSearchIndexes` introspection, and `$search` execution
//! (compound `must` text clauses, `knnBeta` with dot-product scoring,
//! `$addFields` with `$meta: "searchScore"`, `$limit`).
//!
//! Index builds are asynchronous like the real control plane: a created
//! or updated index reports `BUILDING` until the configured build delay
//! elapses, and a building index returns no search hits. The default
//! delay is zero.
//!
//! Searching an index name that does not exist yields no hits rather than
//! an error, so freshly-dropped indexes degrade the way an
//! eventually-consistent backend does.
//!
//! Every administrative command is recorded in a log so tests can assert
//! that fast paths issue no backend commands.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::backend::{BlobId, BlobInfo, BlobStore, Document, DocumentBackend};
use crate::error::{EngramError, Result};

#[derive(Debug, Clone)]
struct SearchIndexEntry {
    id: String,
    name: String,
    definition: Value,
    created_at: Instant,
}

#[derive(Debug, Default)]
struct BackendState {
    /// collection name -> (`_id` -> document)
    collections: BTreeMap<String, BTreeMap<String, Document>>,
    /// collection name -> search-index definitions
    search_indexes: BTreeMap<String, Vec<SearchIndexEntry>>,
    /// Names of administrative commands run, in order.
    command_log: Vec<String>,
}

/// An in-memory document database with a simulated search control plane.
#[derive(Debug, Default)]
pub struct MemoryDocumentBackend {
    state: Mutex<BackendState>,
    build_delay: Duration,
}

impl MemoryDocumentBackend {
    /// Create a backend whose index builds complete immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend whose index builds stay `BUILDING` for `delay`.
    pub fn with_build_delay(delay: Duration) -> Self {
        Self {
            state: Mutex::new(BackendState::default()),
            build_delay: delay,
        }
    }

    /// Names of administrative commands run so far, in order.
    pub fn command_log(&self) -> Vec<String> {
        self.state.lock().command_log.clone()
    }

    /// How many administrative commands with the given name have run.
    pub fn commands_issued(&self, name: &str) -> usize {
        self.state
            .lock()
            .command_log
            .iter()
            .filter(|c| c.as_str() == name)
            .count()
    }

    fn index_status(&self, entry: &SearchIndexEntry) -> &'static str {
        if entry.created_at.elapsed() >= self.build_delay {
            "READY"
        } else {
            "BUILDING"
        }
    }

    fn list_search_indexes(&self, collection: &str, name_filter: Option<&str>) -> Vec<Document> {
        let state = self.state.lock();
        let entries = state.search_indexes.get(collection);
        entries
            .into_iter()
            .flatten()
            .filter(|e| name_filter.is_none_or(|n| e.name == n))
            .map(|e| {
                let queryable = self.index_status(e) == "READY";
                as_document(json!({
                    "id": e.id,
                    "name": e.name,
                    "status": self.index_status(e),
                    "queryable": queryable,
                    "latestDefinition": e.definition,
                }))
            })
            .collect()
    }

    fn run_search(&self, collection: &str, pipeline: &[Document]) -> Result<Vec<Document>> {
        let search = pipeline[0]
            .get("$search")
            .and_then(Value::as_object)
            .ok_or_else(|| EngramError::backend("malformed $search stage"))?;
        let index_name = search
            .get("index")
            .and_then(Value::as_str)
            .ok_or_else(|| EngramError::backend("$search without index name"))?;

        let state = self.state.lock();
        let ready = state
            .search_indexes
            .get(collection)
            .into_iter()
            .flatten()
            .any(|e| e.name == index_name && self.index_status(e) == "READY");
        if !ready {
            return Ok(Vec::new());
        }

        let docs = state.collections.get(collection);
        let mut hits: Vec<(Document, f64)> = Vec::new();

        if let Some(knn) = search.get("knnBeta").and_then(Value::as_object) {
            let query_vector = knn
                .get("vector")
                .and_then(Value::as_array)
                .ok_or_else(|| EngramError::backend("knnBeta without vector"))?
                .iter()
                .filter_map(Value::as_f64)
                .collect::<Vec<f64>>();
            let path = knn
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| EngramError::backend("knnBeta without path"))?;
            let k = knn.get("k").and_then(Value::as_u64).unwrap_or(u64::MAX) as usize;
            let filter = knn
                .get("filter")
                .and_then(Value::as_object)
                .and_then(|f| f.get("compound"))
                .and_then(Value::as_object);

            for doc in docs.into_iter().flatten().map(|(_, d)| d) {
                if let Some(compound) = filter {
                    if !matches_compound(doc, compound) {
                        continue;
                    }
                }
                let Some(stored) = doc.get(path).and_then(Value::as_array) else {
                    continue;
                };
                let stored: Vec<f64> = stored.iter().filter_map(Value::as_f64).collect();
                if stored.len() != query_vector.len() {
                    continue;
                }
                let score: f64 = query_vector
                    .iter()
                    .zip(stored.iter())
                    .map(|(a, b)| a * b)
                    .sum();
                hits.push((doc.clone(), score));
            }
            hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            hits.truncate(k);
        } else if let Some(compound) = search.get("compound").and_then(Value::as_object) {
            for doc in docs.into_iter().flatten().map(|(_, d)| d) {
                if matches_compound(doc, compound) {
                    hits.push((doc.clone(), 1.0));
                }
            }
        } else {
            return Err(EngramError::backend("unsupported $search operator"));
        }
        drop(state);

        let mut results: Vec<Document> = Vec::with_capacity(hits.len());
        let mut scores: Vec<f64> = Vec::with_capacity(hits.len());
        for (doc, score) in hits {
            results.push(doc);
            scores.push(score);
        }

        for stage in &pipeline[1..] {
            if let Some(fields) = stage.get("$addFields").and_then(Value::as_object) {
                for (field, spec) in fields {
                    if spec.get("$meta").and_then(Value::as_str) == Some("searchScore") {
                        for (doc, score) in results.iter_mut().zip(scores.iter()) {
                            doc.insert(field.clone(), json!(score));
                        }
                    }
                }
            } else if let Some(limit) = stage.get("$limit").and_then(Value::as_u64) {
                results.truncate(limit as usize);
                scores.truncate(limit as usize);
            } else {
                return Err(EngramError::backend("unsupported pipeline stage"));
            }
        }

        Ok(results)
    }
}

fn as_document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

/// Evaluate a compound clause: every `must` entry is a `text` predicate
/// whose `query` must equal the document value at `path` (or be contained
/// in it when the value is an array).
fn matches_compound(doc: &Document, compound: &Document) -> bool {
    let Some(must) = compound.get("must").and_then(Value::as_array) else {
        return true;
    };
    must.iter().all(|clause| {
        let Some(text) = clause.get("text").and_then(Value::as_object) else {
            return false;
        };
        let (Some(query), Some(path)) = (
            text.get("query").and_then(Value::as_str),
            text.get("path").and_then(Value::as_str),
        ) else {
            return false;
        };
        match doc.get(path) {
            Some(Value::Array(values)) => values.iter().any(|v| v.as_str() == Some(query)),
            Some(Value::String(value)) => value == query,
            _ => false,
        }
    })
}

#[async_trait]
impl DocumentBackend for MemoryDocumentBackend {
    async fn create_collection(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.collections.contains_key(name) {
            return Err(EngramError::backend(format!(
                "collection already exists: {name}"
            )));
        }
        state.collections.insert(name.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.collections.remove(name);
        state.search_indexes.remove(name);
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().collections.contains_key(name))
    }

    async fn list_collection_names(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().collections.keys().cloned().collect())
    }

    async fn replace_document(
        &self,
        collection: &str,
        id: &str,
        mut document: Document,
    ) -> Result<()> {
        document.insert("_id".to_string(), json!(id));
        self.state
            .lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document);
        Ok(())
    }

    async fn find_document(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        Ok(self
            .state
            .lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<()> {
        if let Some(docs) = self.state.lock().collections.get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }

    async fn delete_documents_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        let Some(docs) = state.collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|_, doc| doc.get(field).and_then(Value::as_str) != Some(value));
        Ok((before - docs.len()) as u64)
    }

    async fn aggregate(&self, collection: &str, pipeline: &[Document]) -> Result<Vec<Document>> {
        let Some(first) = pipeline.first() else {
            return Err(EngramError::backend("empty aggregation pipeline"));
        };
        if let Some(list) = first.get("$listSearchIndexes") {
            let name_filter = list.get("name").and_then(Value::as_str);
            return Ok(self.list_search_indexes(collection, name_filter));
        }
        if first.contains_key("$search") {
            return self.run_search(collection, pipeline);
        }
        Err(EngramError::backend("unsupported aggregation pipeline"))
    }

    async fn run_command(&self, command: Document) -> Result<Document> {
        if let Some(collection) = command.get("createSearchIndexes").and_then(Value::as_str) {
            let mut created = Vec::new();
            let mut state = self.state.lock();
            state.command_log.push("createSearchIndexes".to_string());
            let indexes = command
                .get("indexes")
                .and_then(Value::as_array)
                .ok_or_else(|| EngramError::backend("createSearchIndexes without indexes"))?;
            for index in indexes {
                let name = index
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| EngramError::backend("index without name"))?;
                let definition = index
                    .get("definition")
                    .cloned()
                    .ok_or_else(|| EngramError::backend("index without definition"))?;
                let entry = SearchIndexEntry {
                    id: Uuid::new_v4().to_string(),
                    name: name.to_string(),
                    definition,
                    created_at: Instant::now(),
                };
                created.push(json!({ "id": entry.id, "name": entry.name }));
                state
                    .search_indexes
                    .entry(collection.to_string())
                    .or_default()
                    .push(entry);
            }
            return Ok(as_document(json!({
                "ok": 1,
                "indexesCreated": created,
            })));
        }

        if let Some(collection) = command.get("updateSearchIndex").and_then(Value::as_str) {
            let mut state = self.state.lock();
            state.command_log.push("updateSearchIndex".to_string());
            let name = command
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| EngramError::backend("updateSearchIndex without name"))?;
            let definition = command
                .get("definition")
                .cloned()
                .ok_or_else(|| EngramError::backend("updateSearchIndex without definition"))?;
            let entry = state
                .search_indexes
                .get_mut(collection)
                .and_then(|entries| entries.iter_mut().find(|e| e.name == name))
                .ok_or_else(|| {
                    EngramError::backend(format!("no search index {name} on {collection}"))
                })?;
            entry.definition = definition;
            entry.created_at = Instant::now();
            return Ok(as_document(json!({ "ok": 1 })));
        }

        if let Some(collection) = command.get("dropSearchIndex").and_then(Value::as_str) {
            let mut state = self.state.lock();
            state.command_log.push("dropSearchIndex".to_string());
            let id = command
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| EngramError::backend("dropSearchIndex without id"))?;
            if let Some(entries) = state.search_indexes.get_mut(collection) {
                entries.retain(|e| e.id != id);
            }
            return Ok(as_document(json!({ "ok": 1 })));
        }

        Err(EngramError::backend("unrecognized administrative command"))
    }
}

/// An in-memory blob store with GridFS-like append-only uploads.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    entries: Mutex<Vec<(BlobInfo, Bytes)>>,
}

impl MemoryBlobStore {
    /// Create an empty blob store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored objects, duplicates included.
    pub fn object_count(&self) -> usize {
        self.entries.lock().len()
    }
}

fn metadata_matches(metadata: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, value)| metadata.get(key) == Some(value))
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(
        &self,
        file_name: &str,
        content: Bytes,
        metadata: Document,
    ) -> Result<BlobId> {
        let info = BlobInfo {
            id: Uuid::new_v4(),
            file_name: file_name.to_string(),
            length: content.len() as u64,
            upload_date: Utc::now(),
            metadata,
        };
        let id = info.id;
        self.entries.lock().push((info, content));
        Ok(id)
    }

    async fn download(&self, id: BlobId) -> Result<Bytes> {
        self.entries
            .lock()
            .iter()
            .find(|(info, _)| info.id == id)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| EngramError::not_found(format!("blob {id}")))
    }

    async fn find(&self, metadata_filter: &Document) -> Result<Vec<BlobInfo>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|(info, _)| metadata_matches(&info.metadata, metadata_filter))
            .map(|(info, _)| info.clone())
            .collect())
    }

    async fn delete(&self, id: BlobId) -> Result<()> {
        self.entries.lock().retain(|(info, _)| info.id != id);
        Ok(())
    }
}
