//! Backend abstraction traits and common types.
//!
//! The store core never talks to a concrete database driver. It goes
//! through two seams:
//!
//! - [`DocumentBackend`] - a schema-free document database: named
//!   collections, documents keyed by `_id`, plus a generic
//!   administrative-command escape hatch used for search-index control
//!   and aggregation-style queries.
//! - [`BlobStore`] - bulk binary storage addressed by name, with
//!   metadata tags and find-by-metadata filtering.
//!
//! Implementations are expected to be long-lived, shared, and safe for
//! unsynchronized concurrent use (`Send + Sync`); the crate itself holds
//! no lock around backend calls.

pub mod memory;

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{EngramError, Result};

/// A generic backend document: a flat map of named JSON values.
///
/// This is the portable analog of a BSON document; field names carry the
/// prefix conventions defined in [`crate::record`].
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Identifier the blob store assigns to an uploaded object.
pub type BlobId = Uuid;

/// Descriptor for one stored blob.
#[derive(Debug, Clone)]
pub struct BlobInfo {
    /// Backend-assigned identifier.
    pub id: BlobId,
    /// File name the blob was uploaded under. Not unique: repeated uploads
    /// of the same name create distinct objects.
    pub file_name: String,
    /// Content length in bytes.
    pub length: u64,
    /// Upload timestamp.
    pub upload_date: DateTime<Utc>,
    /// Caller-supplied metadata tags.
    pub metadata: Document,
}

/// A schema-free document database.
///
/// Collections are created implicitly on first write (as document stores
/// do); [`DocumentBackend::create_collection`] exists so an index can be
/// built on an empty collection. `run_command` is the administrative
/// escape hatch: search-index create/update/drop commands are passed
/// through as documents and interpreted by the backend.
#[async_trait]
pub trait DocumentBackend: Send + Sync + fmt::Debug {
    /// Create an empty collection. Creating an existing collection is an error.
    async fn create_collection(&self, name: &str) -> Result<()>;

    /// Drop a collection and its documents. Dropping a missing collection
    /// is a no-op success.
    async fn drop_collection(&self, name: &str) -> Result<()>;

    /// Check whether a collection exists.
    async fn collection_exists(&self, name: &str) -> Result<bool>;

    /// List all collection names.
    async fn list_collection_names(&self) -> Result<Vec<String>>;

    /// Insert or replace the document with the given `_id`.
    async fn replace_document(
        &self,
        collection: &str,
        id: &str,
        document: Document,
    ) -> Result<()>;

    /// Fetch a document by `_id`.
    async fn find_document(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Delete a document by `_id`. Deleting an absent id is a no-op success.
    async fn delete_document(&self, collection: &str, id: &str) -> Result<()>;

    /// Delete every document whose `field` equals `value`. Returns the
    /// number of documents removed.
    async fn delete_documents_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<u64>;

    /// Run an aggregation pipeline against a collection. Used for
    /// `$listSearchIndexes` introspection and `$search` queries.
    async fn aggregate(&self, collection: &str, pipeline: &[Document]) -> Result<Vec<Document>>;

    /// Run an administrative command against the database.
    async fn run_command(&self, command: Document) -> Result<Document>;
}

/// Bulk binary storage with metadata tags.
///
/// Uploads are append-only: writing the same file name twice creates two
/// distinct objects with distinct [`BlobId`]s. Deduplication, when wanted,
/// is the caller's job (see [`crate::content`]).
#[async_trait]
pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Upload content under a file name with metadata tags.
    async fn upload(
        &self,
        file_name: &str,
        content: Bytes,
        metadata: Document,
    ) -> Result<BlobId>;

    /// Download a blob's content by id.
    async fn download(&self, id: BlobId) -> Result<Bytes>;

    /// Find blobs whose metadata matches every (key, value) pair in the
    /// filter exactly.
    async fn find(&self, metadata_filter: &Document) -> Result<Vec<BlobInfo>>;

    /// Delete a blob by id. Deleting an absent id is a no-op success.
    async fn delete(&self, id: BlobId) -> Result<()>;
}

/// Race a backend future against a cancellation token.
///
/// On cancellation the in-flight future is dropped, which aborts the
/// outstanding backend call, and a [`EngramError::Cancelled`] carrying the
/// operation name is returned.
pub async fn await_cancellable<F, T>(
    cancel: &CancellationToken,
    operation: &str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngramError::cancelled(operation)),
        result = fut => result,
    }
}
