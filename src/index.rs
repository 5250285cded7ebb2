//! Search-index lifecycle management.
//!
//! [`IndexManager`] owns all interaction with the search-index control
//! plane: status introspection, idempotent creation, bounded readiness
//! polling, definition teardown, and incremental extension of the field
//! mappings through a per-index schema cache.
//!
//! The backend builds indexes asynchronously and offers no synchronous
//! "index is ready" guarantee, so readiness is observed by bounded
//! polling; a write that lands before the build finishes is simply not
//! searchable until the index catches up.
//!
//! # Naming
//!
//! One logical index maps 1:1 to one backend collection and at most one
//! search index; both names are derived deterministically:
//! collection `_ix_{index}`, search index `searchix_{collection}`. More
//! than one matching definition is corruption and fails fatally.
//!
//! # Schema cache
//!
//! The cache remembers, per index, which string fields the live
//! definition already declares (lower-cased). It hydrates lazily from
//! the backend, and requests covered by the cached set issue zero
//! backend commands. The cache is process-local and safe to lose: a
//! concurrent writer in another process can at worst cause a redundant,
//! idempotent update command.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{Document, DocumentBackend, await_cancellable};
use crate::config::MemoryDbConfig;
use crate::error::{EngramError, Result};
use crate::schema::{
    IndexMappings, create_search_indexes_command, drop_search_index_command,
    update_search_index_command,
};

/// Prefix deriving a collection name from a logical index name.
pub const COLLECTION_PREFIX: &str = "_ix_";

/// Prefix deriving a search-index name from a collection name.
pub const SEARCH_INDEX_PREFIX: &str = "searchix_";

/// Backend collection name for a logical index.
pub fn collection_name(index: &str) -> String {
    format!("{COLLECTION_PREFIX}{index}")
}

/// Search-index name for a collection.
pub fn search_index_name(collection: &str) -> String {
    format!("{SEARCH_INDEX_PREFIX}{collection}")
}

/// Recover the logical index name from a collection name, if the
/// collection follows the index naming convention.
pub fn index_name_from_collection(collection: &str) -> Option<&str> {
    collection.strip_prefix(COLLECTION_PREFIX)
}

/// Readiness of one search index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    /// No index (or no collection) exists.
    Absent,
    /// The index exists but its build has not completed.
    Building,
    /// The index is queryable.
    Ready,
}

impl IndexStatus {
    /// Map a backend-reported status string onto the three-state model.
    /// Anything that is not `READY` still counts as building.
    fn from_backend(status: &str) -> Self {
        if status.eq_ignore_ascii_case("ready") {
            IndexStatus::Ready
        } else {
            IndexStatus::Building
        }
    }
}

/// Introspection result for one index.
///
/// A failed or absent index is reported through `exists == false`, not an
/// error; callers must check.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    /// Whether the index exists at all.
    pub exists: bool,
    /// Build status.
    pub status: IndexStatus,
    /// Declared field mappings of the latest definition.
    pub mappings: IndexMappings,
}

impl IndexInfo {
    /// The "does not exist" result.
    pub fn absent() -> Self {
        Self {
            exists: false,
            status: IndexStatus::Absent,
            mappings: IndexMappings::default(),
        }
    }

    /// Whether the index exists and is queryable.
    pub fn is_ready(&self) -> bool {
        self.exists && self.status == IndexStatus::Ready
    }
}

/// Cached knowledge about one index's declared schema.
#[derive(Debug, Clone)]
struct SchemaEntry {
    dimension: u32,
    fields: BTreeSet<String>,
}

type SchemaSlot = Arc<RwLock<Option<SchemaEntry>>>;

/// Owner of index lifecycle and the schema cache.
pub struct IndexManager {
    backend: Arc<dyn DocumentBackend>,
    config: MemoryDbConfig,
    /// Registry of per-index cache slots. The outer lock only guards slot
    /// lookup; mutation of a slot takes that slot's own lock, so updates
    /// to different indexes proceed fully in parallel.
    schema_cache: Mutex<HashMap<String, SchemaSlot>>,
}

impl std::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexManager")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl IndexManager {
    /// Create a manager over a shared backend.
    pub fn new(backend: Arc<dyn DocumentBackend>, config: MemoryDbConfig) -> Self {
        Self {
            backend,
            config,
            schema_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Inspect the current state of an index.
    ///
    /// Short-circuits to [`IndexInfo::absent`] when the underlying
    /// collection does not exist (an index cannot exist without its
    /// collection). Fails with [`EngramError::AmbiguousIndex`] when more
    /// than one definition matches the derived name.
    pub async fn get_status(&self, index: &str, cancel: &CancellationToken) -> Result<IndexInfo> {
        let collection = collection_name(index);
        let exists = await_cancellable(
            cancel,
            "get_status",
            self.backend.collection_exists(&collection),
        )
        .await?;
        if !exists {
            return Ok(IndexInfo::absent());
        }

        let name = search_index_name(&collection);
        let mut stage = Document::new();
        stage.insert("$listSearchIndexes".to_string(), json!({ "name": name }));
        let definitions = await_cancellable(
            cancel,
            "get_status",
            self.backend.aggregate(&collection, &[stage]),
        )
        .await?;

        match definitions.len() {
            0 => Ok(IndexInfo::absent()),
            1 => parse_index_info(&definitions[0]),
            _ => {
                let names: Vec<&str> = definitions
                    .iter()
                    .filter_map(|d| d.get("name").and_then(Value::as_str))
                    .collect();
                Err(EngramError::ambiguous_index(format!(
                    "collection {collection} reports {} search indexes: {}",
                    definitions.len(),
                    names.join(",")
                )))
            }
        }
    }

    /// Create the index for `index` with the given vector dimensionality.
    ///
    /// Ensures the collection exists first. Calling create on an existing
    /// index is a no-op success returning the current info. A backend
    /// response reporting zero indexes created yields
    /// [`IndexInfo::absent`] rather than an error.
    pub async fn create_index(
        &self,
        index: &str,
        dimension: u32,
        cancel: &CancellationToken,
    ) -> Result<IndexInfo> {
        let collection = collection_name(index);
        let exists = await_cancellable(
            cancel,
            "create_index",
            self.backend.collection_exists(&collection),
        )
        .await?;
        if !exists {
            await_cancellable(
                cancel,
                "create_index",
                self.backend.create_collection(&collection),
            )
            .await?;
        }

        let info = self.get_status(index, cancel).await?;
        if info.exists {
            debug!(index, "index already exists, create is a no-op");
            return Ok(info);
        }

        let command = create_search_indexes_command(
            &collection,
            &search_index_name(&collection),
            dimension,
            &BTreeSet::new(),
        );
        let response =
            await_cancellable(cancel, "create_index", self.backend.run_command(command)).await?;
        let created = response
            .get("indexesCreated")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        if created == 0 {
            warn!(index, "backend reported no indexes created");
            return Ok(IndexInfo::absent());
        }
        debug!(index, dimension, "submitted search index build");
        self.get_status(index, cancel).await
    }

    /// Poll until the index reports ready, the timeout elapses, or the
    /// token is cancelled.
    ///
    /// Returns silently on timeout; callers needing a hard guarantee must
    /// re-check status themselves (see [`IndexManager::assert_ready`]).
    pub async fn wait_for_ready(
        &self,
        index: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(EngramError::cancelled("wait_for_ready"));
            }
            let info = self.get_status(index, cancel).await?;
            if info.is_ready() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                debug!(index, "timed out waiting for index readiness");
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngramError::cancelled("wait_for_ready")),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Fail with [`EngramError::IndexNotReady`] unless the index is ready.
    ///
    /// Opt-in: write paths never perform this check automatically.
    pub async fn assert_ready(&self, index: &str, cancel: &CancellationToken) -> Result<()> {
        let info = self.get_status(index, cancel).await?;
        if info.is_ready() {
            Ok(())
        } else {
            Err(EngramError::index_not_ready(index))
        }
    }

    /// Drop every search-index definition attached to a collection.
    ///
    /// Enumerates all definitions rather than assuming exactly one, since
    /// teardown is also used defensively against inconsistent state.
    pub async fn delete_all_index_definitions(
        &self,
        collection: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut stage = Document::new();
        stage.insert("$listSearchIndexes".to_string(), json!({}));
        let definitions = await_cancellable(
            cancel,
            "delete_all_index_definitions",
            self.backend.aggregate(collection, &[stage]),
        )
        .await?;
        for definition in definitions {
            let Some(id) = definition.get("id").and_then(Value::as_str) else {
                return Err(EngramError::backend(
                    "search index definition without an id",
                ));
            };
            let command = drop_search_index_command(collection, id);
            await_cancellable(
                cancel,
                "delete_all_index_definitions",
                self.backend.run_command(command),
            )
            .await?;
            debug!(collection, id, "dropped search index definition");
        }
        Ok(())
    }

    /// Make sure every field in `fields` is declared in the index's
    /// string mappings, extending the definition if needed.
    ///
    /// `fields` are document field names (tag-prefixed); matching is
    /// case-insensitive. The fast path - every requested field already in
    /// the cached set - issues zero backend commands and must dominate
    /// steady-state traffic. The slow path serializes per index: one
    /// updater at a time, other callers wait. An index that does not
    /// exist is left alone (nothing to reconcile, nothing cached).
    pub async fn ensure_string_fields_indexed(
        &self,
        index: &str,
        fields: &BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let requested: BTreeSet<String> = fields.iter().map(|f| f.to_lowercase()).collect();
        let slot = self.slot(index);

        {
            let cached = slot.read().await;
            if let Some(entry) = cached.as_ref() {
                if requested.is_subset(&entry.fields) {
                    return Ok(());
                }
            }
        }

        let mut cached = slot.write().await;
        if cached.is_none() {
            let info = self.get_status(index, cancel).await?;
            if !info.exists {
                return Ok(());
            }
            let dimension = info.mappings.vector_dimension().ok_or_else(|| {
                EngramError::backend(format!("index for {index} declares no vector field"))
            })?;
            *cached = Some(SchemaEntry {
                dimension,
                fields: info.mappings.string_field_names(),
            });
        }
        let Some(entry) = cached.as_mut() else {
            return Ok(());
        };

        if requested.is_subset(&entry.fields) {
            // another writer extended the mapping while we waited
            return Ok(());
        }

        let merged: BTreeSet<String> = entry.fields.union(&requested).cloned().collect();
        let collection = collection_name(index);
        let command = update_search_index_command(
            &collection,
            &search_index_name(&collection),
            entry.dimension,
            &merged,
        );
        await_cancellable(
            cancel,
            "ensure_string_fields_indexed",
            self.backend.run_command(command),
        )
        .await?;
        debug!(
            index,
            added = merged.len() - entry.fields.len(),
            "extended index string mappings"
        );
        entry.fields = merged;
        Ok(())
    }

    /// Drop the cached schema knowledge for an index. Called after the
    /// index is deleted so a later recreation rehydrates from the
    /// backend.
    pub fn forget(&self, index: &str) {
        self.schema_cache.lock().remove(index);
    }

    fn slot(&self, index: &str) -> SchemaSlot {
        self.schema_cache
            .lock()
            .entry(index.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(None)))
            .clone()
    }
}

fn parse_index_info(definition: &Document) -> Result<IndexInfo> {
    let status = definition
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| EngramError::backend("search index definition without a status"))?;
    let mappings = match definition
        .get("latestDefinition")
        .and_then(|d| d.get("mappings"))
    {
        Some(raw) => serde_json::from_value(raw.clone())?,
        None => IndexMappings::default(),
    };
    Ok(IndexInfo {
        exists: true,
        status: IndexStatus::from_backend(status),
        mappings,
    })
}
