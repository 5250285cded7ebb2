use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use engram::backend::DocumentBackend;
use engram::backend::memory::{MemoryBlobStore, MemoryDocumentBackend};
use engram::content::ContentRouter;
use engram::error::Result;

fn build_router() -> (
    Arc<MemoryDocumentBackend>,
    Arc<MemoryBlobStore>,
    ContentRouter,
) {
    let backend = Arc::new(MemoryDocumentBackend::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let router = ContentRouter::new(backend.clone(), blobs.clone());
    (backend, blobs, router)
}

#[tokio::test]
async fn text_files_store_inline_and_replace() -> Result<()> {
    let (backend, blobs, router) = build_router();
    let cancel = CancellationToken::new();

    router
        .write_file("idx", "doc-1", "extract.txt", Bytes::from_static(b"one"), &cancel)
        .await?;
    let read = router
        .read_file("idx", "doc-1", "extract.txt", true, &cancel)
        .await?;
    assert_eq!(read, Bytes::from_static(b"one"));

    router
        .write_file("idx", "doc-1", "extract.txt", Bytes::from_static(b"two"), &cancel)
        .await?;
    let read = router
        .read_file("idx", "doc-1", "extract.txt", true, &cancel)
        .await?;
    assert_eq!(read, Bytes::from_static(b"two"));

    // inline path never touches the blob store
    assert_eq!(blobs.object_count(), 0);

    let document = backend
        .find_document("idx", "doc-1/extract.txt")
        .await?
        .unwrap();
    assert_eq!(document.get("documentId"), Some(&json!("doc-1")));
    assert_eq!(document.get("fileName"), Some(&json!("extract.txt")));
    assert_eq!(document.get("content"), Some(&json!("two")));
    Ok(())
}

#[tokio::test]
async fn embedding_metadata_merges_into_the_stored_document() -> Result<()> {
    let (backend, _, router) = build_router();
    let cancel = CancellationToken::new();

    let payload = r#"{"generator":"ada","dimensions":3}"#;
    router
        .write_file(
            "idx",
            "doc-1",
            "chunk.0.text_embedding",
            Bytes::from(payload.to_string()),
            &cancel,
        )
        .await?;

    let document = backend
        .find_document("idx", "doc-1/chunk.0.text_embedding")
        .await?
        .unwrap();
    assert_eq!(document.get("generator"), Some(&json!("ada")));
    assert_eq!(document.get("dimensions"), Some(&json!(3)));
    assert_eq!(document.get("documentId"), Some(&json!("doc-1")));
    assert_eq!(document.get("content"), Some(&json!(payload)));

    let read = router
        .read_file("idx", "doc-1", "chunk.0.text_embedding", true, &cancel)
        .await?;
    assert_eq!(read, Bytes::from(payload.to_string()));
    Ok(())
}

#[tokio::test]
async fn malformed_embedding_metadata_is_rejected() -> Result<()> {
    let (_, _, router) = build_router();
    let cancel = CancellationToken::new();

    let result = router
        .write_file(
            "idx",
            "doc-1",
            "broken.text_embedding",
            Bytes::from_static(b"not json"),
            &cancel,
        )
        .await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn binary_files_go_to_the_blob_store_append_only() -> Result<()> {
    let (_, blobs, router) = build_router();
    let cancel = CancellationToken::new();

    router
        .write_file("idx", "doc-1", "scan.pdf", Bytes::from_static(b"v1"), &cancel)
        .await?;
    router
        .write_file("idx", "doc-1", "scan.pdf", Bytes::from_static(b"v2"), &cancel)
        .await?;

    // no replace semantics on this path: two distinct objects remain
    assert_eq!(blobs.object_count(), 2);

    let read = router
        .read_file("idx", "doc-1", "scan.pdf", true, &cancel)
        .await?;
    assert!(read == Bytes::from_static(b"v1") || read == Bytes::from_static(b"v2"));
    Ok(())
}

#[tokio::test]
async fn missing_content_fails_with_not_found_regardless_of_logging() -> Result<()> {
    let (_, _, router) = build_router();
    let cancel = CancellationToken::new();

    for file_name in ["missing.txt", "missing.pdf"] {
        let loud = router
            .read_file("idx", "doc-1", file_name, true, &cancel)
            .await;
        assert!(loud.is_err_and(|e| e.is_not_found()));

        let quiet = router
            .read_file("idx", "doc-1", file_name, false, &cancel)
            .await;
        assert!(quiet.is_err_and(|e| e.is_not_found()));
    }
    Ok(())
}

#[tokio::test]
async fn emptying_a_document_directory_sweeps_both_stores() -> Result<()> {
    let (_, blobs, router) = build_router();
    let cancel = CancellationToken::new();

    router
        .write_file("idx", "doc-1", "extract.txt", Bytes::from_static(b"text"), &cancel)
        .await?;
    router
        .write_file("idx", "doc-1", "scan.pdf", Bytes::from_static(b"blob"), &cancel)
        .await?;
    router
        .write_file("idx", "doc-2", "other.pdf", Bytes::from_static(b"keep"), &cancel)
        .await?;

    router.empty_document_directory("idx", "doc-1", &cancel).await?;

    let inline = router
        .read_file("idx", "doc-1", "extract.txt", false, &cancel)
        .await;
    assert!(inline.is_err_and(|e| e.is_not_found()));
    let blob = router
        .read_file("idx", "doc-1", "scan.pdf", false, &cancel)
        .await;
    assert!(blob.is_err_and(|e| e.is_not_found()));

    // the sibling document is untouched
    assert_eq!(blobs.object_count(), 1);
    let kept = router
        .read_file("idx", "doc-2", "other.pdf", false, &cancel)
        .await?;
    assert_eq!(kept, Bytes::from_static(b"keep"));
    Ok(())
}

#[tokio::test]
async fn deleting_an_index_directory_sweeps_both_stores() -> Result<()> {
    let (backend, blobs, router) = build_router();
    let cancel = CancellationToken::new();

    router
        .write_file("idx", "doc-1", "extract.txt", Bytes::from_static(b"text"), &cancel)
        .await?;
    router
        .write_file("idx", "doc-1", "scan.pdf", Bytes::from_static(b"blob"), &cancel)
        .await?;
    router
        .write_file("other", "doc-9", "keep.pdf", Bytes::from_static(b"keep"), &cancel)
        .await?;

    router.delete_index_directory("idx", &cancel).await?;

    assert!(!backend.collection_exists("idx").await?);
    assert_eq!(blobs.object_count(), 1);
    let kept = router
        .read_file("other", "doc-9", "keep.pdf", false, &cancel)
        .await?;
    assert_eq!(kept, Bytes::from_static(b"keep"));
    Ok(())
}

#[tokio::test]
async fn directory_creation_is_a_noop() -> Result<()> {
    let (backend, _, router) = build_router();
    let cancel = CancellationToken::new();

    router.create_index_directory("idx", &cancel).await?;
    router.create_document_directory("idx", "doc-1", &cancel).await?;
    assert!(!backend.collection_exists("idx").await?);
    Ok(())
}
