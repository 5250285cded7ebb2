//! Suffix-routed content storage for (index, document) pairs.
//!
//! [`ContentRouter`] decides where a named piece of content lives by its
//! file-name suffix:
//!
//! - `.txt` (extracted text) - stored inline in the document store,
//!   keyed `"{documentId}/{fileName}"`, replace-or-insert.
//! - `.text_embedding` (embedding metadata, itself JSON) - same inline
//!   path, but the incoming JSON is merged with the identity/metadata
//!   fields before storage.
//! - anything else - uploaded to the bulk blob store keyed by file name
//!   with metadata tags `{index, documentId, fileName}`.
//!
//! **Caller-visible asymmetry**: the two inline suffixes replace on
//! rewrite; every other suffix is append-only - repeated writes of the
//! same name create distinct blob objects. Directory sweeps clean both
//! stores either way.
//!
//! Content collections are named by the index itself, without the
//! record-collection prefix; both conventions must be preserved for
//! interoperability with existing data.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{BlobStore, Document, DocumentBackend, await_cancellable};
use crate::error::{EngramError, Result};

const TEXT_EXTENSION: &str = "txt";
const EMBEDDING_EXTENSION: &str = "text_embedding";

const DOCUMENT_ID_FIELD: &str = "documentId";
const FILE_NAME_FIELD: &str = "fileName";
const CONTENT_FIELD: &str = "content";
const INDEX_METADATA_KEY: &str = "index";

/// Storage target for one file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentTarget {
    /// Extracted text, stored inline.
    Text,
    /// Embedding metadata JSON, merged and stored inline.
    EmbeddingMetadata,
    /// Opaque content, stored in the blob store.
    Blob,
}

impl ContentTarget {
    fn for_file_name(file_name: &str) -> Self {
        match Path::new(file_name).extension().and_then(|e| e.to_str()) {
            Some(TEXT_EXTENSION) => ContentTarget::Text,
            Some(EMBEDDING_EXTENSION) => ContentTarget::EmbeddingMetadata,
            _ => ContentTarget::Blob,
        }
    }
}

/// Routes named content for (index, document) pairs between the document
/// store and the blob store.
#[derive(Debug)]
pub struct ContentRouter {
    backend: Arc<dyn DocumentBackend>,
    blobs: Arc<dyn BlobStore>,
}

impl ContentRouter {
    /// Create a router over shared backends.
    pub fn new(backend: Arc<dyn DocumentBackend>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { backend, blobs }
    }

    /// Prepare storage for an index. Nothing to do: collections and blob
    /// namespaces appear on first write.
    pub async fn create_index_directory(
        &self,
        _index: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(())
    }

    /// Prepare storage for a document within an index. Nothing to do.
    pub async fn create_document_directory(
        &self,
        _index: &str,
        _document_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(())
    }

    /// Store content under (index, document, file name), routed by suffix.
    pub async fn write_file(
        &self,
        index: &str,
        document_id: &str,
        file_name: &str,
        content: Bytes,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match ContentTarget::for_file_name(file_name) {
            ContentTarget::Text => {
                let text = utf8_content(file_name, &content)?;
                let mut document = Document::new();
                document.insert(DOCUMENT_ID_FIELD.to_string(), json!(document_id));
                document.insert(FILE_NAME_FIELD.to_string(), json!(file_name));
                document.insert(CONTENT_FIELD.to_string(), json!(text));
                self.save_inline(index, document_id, file_name, document, cancel)
                    .await
            }
            ContentTarget::EmbeddingMetadata => {
                let text = utf8_content(file_name, &content)?;
                let parsed: Value = serde_json::from_str(&text)?;
                let mut document = match parsed {
                    Value::Object(map) => map,
                    _ => {
                        return Err(EngramError::invalid_argument(format!(
                            "{file_name} is not a JSON object"
                        )));
                    }
                };
                document.insert(DOCUMENT_ID_FIELD.to_string(), json!(document_id));
                document.insert(FILE_NAME_FIELD.to_string(), json!(file_name));
                document.insert(CONTENT_FIELD.to_string(), json!(text));
                self.save_inline(index, document_id, file_name, document, cancel)
                    .await
            }
            ContentTarget::Blob => {
                let mut metadata = Document::new();
                metadata.insert(INDEX_METADATA_KEY.to_string(), json!(index));
                metadata.insert(DOCUMENT_ID_FIELD.to_string(), json!(document_id));
                metadata.insert(FILE_NAME_FIELD.to_string(), json!(file_name));
                let id = await_cancellable(
                    cancel,
                    "write_file",
                    self.blobs.upload(file_name, content, metadata),
                )
                .await?;
                debug!(index, document_id, file_name, blob = %id, "stored blob");
                Ok(())
            }
        }
    }

    /// Read content under (index, document, file name), routed by suffix.
    ///
    /// A missing file fails with [`EngramError::NotFound`].
    /// `log_if_not_found` controls only the diagnostic warning, never the
    /// failure signal itself.
    pub async fn read_file(
        &self,
        index: &str,
        document_id: &str,
        file_name: &str,
        log_if_not_found: bool,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let result = match ContentTarget::for_file_name(file_name) {
            ContentTarget::Text | ContentTarget::EmbeddingMetadata => {
                self.read_inline(index, document_id, file_name, cancel).await
            }
            ContentTarget::Blob => self.read_blob(index, document_id, file_name, cancel).await,
        };
        if log_if_not_found {
            if let Err(error) = &result {
                if error.is_not_found() {
                    warn!(index, document_id, file_name, "content not found");
                }
            }
        }
        result
    }

    /// Remove every piece of content stored for one document: blob
    /// entries tagged with (index, documentId) and inline documents
    /// carrying the documentId. Both stores are swept; skipping either
    /// would orphan data.
    pub async fn empty_document_directory(
        &self,
        index: &str,
        document_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut filter = Document::new();
        filter.insert(INDEX_METADATA_KEY.to_string(), json!(index));
        filter.insert(DOCUMENT_ID_FIELD.to_string(), json!(document_id));
        self.delete_blobs_matching(&filter, cancel).await?;

        let removed = await_cancellable(
            cancel,
            "empty_document_directory",
            self.backend
                .delete_documents_by_field(index, DOCUMENT_ID_FIELD, document_id),
        )
        .await?;
        debug!(index, document_id, removed, "emptied document directory");
        Ok(())
    }

    /// Same sweep as [`ContentRouter::empty_document_directory`].
    pub async fn delete_document_directory(
        &self,
        index: &str,
        document_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.empty_document_directory(index, document_id, cancel)
            .await
    }

    /// Remove every piece of content stored for an index: blob entries
    /// tagged with the index, then the inline content collection.
    pub async fn delete_index_directory(
        &self,
        index: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut filter = Document::new();
        filter.insert(INDEX_METADATA_KEY.to_string(), json!(index));
        self.delete_blobs_matching(&filter, cancel).await?;

        await_cancellable(
            cancel,
            "delete_index_directory",
            self.backend.drop_collection(index),
        )
        .await?;
        debug!(index, "deleted index directory");
        Ok(())
    }

    async fn save_inline(
        &self,
        index: &str,
        document_id: &str,
        file_name: &str,
        document: Document,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = inline_id(document_id, file_name);
        await_cancellable(
            cancel,
            "write_file",
            self.backend.replace_document(index, &id, document),
        )
        .await?;
        debug!(index, id, "stored inline content");
        Ok(())
    }

    async fn read_inline(
        &self,
        index: &str,
        document_id: &str,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let id = inline_id(document_id, file_name);
        let document = await_cancellable(
            cancel,
            "read_file",
            self.backend.find_document(index, &id),
        )
        .await?
        .ok_or_else(|| not_found(index, document_id, file_name))?;
        let content = document
            .get(CONTENT_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngramError::backend(format!("inline content {id} has no {CONTENT_FIELD} field"))
            })?;
        Ok(Bytes::from(content.to_string()))
    }

    async fn read_blob(
        &self,
        index: &str,
        document_id: &str,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let mut filter = Document::new();
        filter.insert(FILE_NAME_FIELD.to_string(), json!(file_name));
        filter.insert(INDEX_METADATA_KEY.to_string(), json!(index));
        filter.insert(DOCUMENT_ID_FIELD.to_string(), json!(document_id));
        let found = await_cancellable(cancel, "read_file", self.blobs.find(&filter)).await?;
        let Some(info) = found.into_iter().next() else {
            return Err(not_found(index, document_id, file_name));
        };
        await_cancellable(cancel, "read_file", self.blobs.download(info.id)).await
    }

    async fn delete_blobs_matching(
        &self,
        filter: &Document,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let found =
            await_cancellable(cancel, "delete_blobs", self.blobs.find(filter)).await?;
        for info in found {
            await_cancellable(cancel, "delete_blobs", self.blobs.delete(info.id)).await?;
        }
        Ok(())
    }
}

fn inline_id(document_id: &str, file_name: &str) -> String {
    format!("{document_id}/{file_name}")
}

fn not_found(index: &str, document_id: &str, file_name: &str) -> EngramError {
    EngramError::not_found(format!(
        "file {file_name} in index {index} and document {document_id}"
    ))
}

fn utf8_content(file_name: &str, content: &Bytes) -> Result<String> {
    String::from_utf8(content.to_vec())
        .map_err(|_| EngramError::invalid_argument(format!("{file_name} is not valid UTF-8")))
}
