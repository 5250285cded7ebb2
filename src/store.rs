//! Per-index record storage and retrieval.
//!
//! [`RecordStore`] is the caller-facing surface for memory records:
//! upsert, delete, filtered listing, vector-similarity listing, and
//! index enumeration. It composes the document codec
//! ([`crate::record`]), the query compiler ([`crate::query`]), and the
//! index lifecycle manager ([`crate::index`]).
//!
//! Writes are not conditioned on index readiness: an upsert may land
//! while the index is still building, and the record simply stays
//! unsearchable until the build catches up.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{Document, DocumentBackend, await_cancellable};
use crate::config::MemoryDbConfig;
use crate::error::Result;
use crate::index::{IndexManager, collection_name, index_name_from_collection, search_index_name};
use crate::query::{TagFilter, compound_clause};
use crate::record::{self, MemoryRecord, VECTOR_FIELD, tag_field_name};

/// Document field carrying the relevance score in similarity results.
const SCORE_FIELD: &str = "score";

/// Store for memory records, one backend collection per logical index.
#[derive(Debug)]
pub struct RecordStore {
    backend: Arc<dyn DocumentBackend>,
    indexes: Arc<IndexManager>,
    config: MemoryDbConfig,
}

impl RecordStore {
    /// Create a store over a shared backend.
    pub fn new(backend: Arc<dyn DocumentBackend>, config: MemoryDbConfig) -> Self {
        let indexes = Arc::new(IndexManager::new(backend.clone(), config.clone()));
        Self {
            backend,
            indexes,
            config,
        }
    }

    /// The lifecycle manager this store drives.
    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    /// Create the index and wait (bounded) for its build to finish.
    ///
    /// The wait is best-effort: on timeout the index may still be
    /// building, and searches return nothing until it is ready.
    pub async fn create_index(
        &self,
        index: &str,
        dimension: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.indexes.create_index(index, dimension, cancel).await?;
        self.indexes
            .wait_for_ready(index, self.config.create_wait_timeout, cancel)
            .await
    }

    /// Delete the index: every search-index definition first, then the
    /// collection.
    ///
    /// Definitions are dropped explicitly before the collection so a
    /// failed teardown never leaves a dangling definition on a dropped
    /// collection.
    pub async fn delete_index(&self, index: &str, cancel: &CancellationToken) -> Result<()> {
        let collection = collection_name(index);
        self.indexes
            .delete_all_index_definitions(&collection, cancel)
            .await?;
        await_cancellable(
            cancel,
            "delete_index",
            self.backend.drop_collection(&collection),
        )
        .await?;
        self.indexes.forget(index);
        debug!(index, "deleted index and collection");
        Ok(())
    }

    /// Enumerate logical indexes by their collection naming convention.
    pub async fn list_indexes(&self, cancel: &CancellationToken) -> Result<BTreeSet<String>> {
        let names = await_cancellable(
            cancel,
            "list_indexes",
            self.backend.list_collection_names(),
        )
        .await?;
        Ok(names
            .iter()
            .filter_map(|name| index_name_from_collection(name))
            .map(str::to_string)
            .collect())
    }

    /// Insert or replace a record by its identity. Returns the identity.
    pub async fn upsert(
        &self,
        index: &str,
        record: &MemoryRecord,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let document = record::encode(record);
        await_cancellable(
            cancel,
            "upsert",
            self.backend
                .replace_document(&collection_name(index), &record.id, document),
        )
        .await?;
        Ok(record.id.clone())
    }

    /// Remove a record by its identity. Removing an unknown identity is a
    /// no-op success.
    pub async fn delete(
        &self,
        index: &str,
        record: &MemoryRecord,
        cancel: &CancellationToken,
    ) -> Result<()> {
        await_cancellable(
            cancel,
            "delete",
            self.backend
                .delete_document(&collection_name(index), &record.id),
        )
        .await
    }

    /// List records matching every tag condition, newest index definition
    /// permitting.
    ///
    /// Filterable tag fields are reconciled into the index definition
    /// before the query runs, then the query executes against the search
    /// index derived from `index` - never a fixed name - so records in
    /// one index are invisible to queries against another.
    pub async fn get_list(
        &self,
        index: &str,
        filters: &[TagFilter],
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<BoxStream<'static, Result<MemoryRecord>>> {
        self.reconcile_filter_fields(index, filters, cancel).await?;

        let collection = collection_name(index);
        let mut search = Document::new();
        search.insert(
            "$search".to_string(),
            json!({
                "index": search_index_name(&collection),
                "compound": compound_clause(filters),
            }),
        );
        let mut limit_stage = Document::new();
        limit_stage.insert("$limit".to_string(), json!(limit as u64));

        let documents = await_cancellable(
            cancel,
            "get_list",
            self.backend.aggregate(&collection, &[search, limit_stage]),
        )
        .await?;
        debug!(index, hits = documents.len(), "tag-filtered list");

        Ok(futures::stream::iter(
            documents.into_iter().map(|doc| record::decode(&doc)),
        )
        .boxed())
    }

    /// List records by vector similarity, tag filters ANDed in, ranked by
    /// dot-product relevance and cut off below `min_relevance`.
    pub async fn get_similar_list(
        &self,
        index: &str,
        vector: &[f32],
        filters: &[TagFilter],
        min_relevance: f64,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<BoxStream<'static, Result<(MemoryRecord, f64)>>> {
        self.reconcile_filter_fields(index, filters, cancel).await?;

        let mut knn = serde_json::Map::new();
        knn.insert("vector".to_string(), json!(vector));
        knn.insert("path".to_string(), json!(VECTOR_FIELD));
        knn.insert("k".to_string(), json!(limit as u64));
        let compound = compound_clause(filters);
        let has_conditions = compound["must"]
            .as_array()
            .is_some_and(|must| !must.is_empty());
        if has_conditions {
            knn.insert("filter".to_string(), json!({ "compound": compound }));
        }

        let collection = collection_name(index);
        let mut search = Document::new();
        search.insert(
            "$search".to_string(),
            json!({
                "index": search_index_name(&collection),
                "knnBeta": knn,
            }),
        );
        let mut score_stage = Document::new();
        score_stage.insert(
            "$addFields".to_string(),
            json!({ SCORE_FIELD: { "$meta": "searchScore" } }),
        );

        let documents = await_cancellable(
            cancel,
            "get_similar_list",
            self.backend.aggregate(&collection, &[search, score_stage]),
        )
        .await?;
        debug!(index, hits = documents.len(), "similarity list");

        Ok(futures::stream::iter(documents.into_iter().filter_map(
            move |doc| {
                let score = doc
                    .get(SCORE_FIELD)
                    .and_then(Value::as_f64)
                    .unwrap_or(f64::MIN);
                if score < min_relevance {
                    return None;
                }
                Some(record::decode(&doc).map(|record| (record, score)))
            },
        ))
        .boxed())
    }

    async fn reconcile_filter_fields(
        &self,
        index: &str,
        filters: &[TagFilter],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let fields: BTreeSet<String> = filters
            .iter()
            .flat_map(|filter| filter.tag_names())
            .map(tag_field_name)
            .collect();
        self.indexes
            .ensure_string_fields_indexed(index, &fields, cancel)
            .await
    }
}
