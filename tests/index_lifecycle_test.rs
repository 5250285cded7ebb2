use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use engram::backend::memory::MemoryDocumentBackend;
use engram::backend::{Document, DocumentBackend};
use engram::config::MemoryDbConfig;
use engram::error::{EngramError, Result};
use engram::index::{IndexManager, IndexStatus, collection_name, search_index_name};

fn fast_config() -> MemoryDbConfig {
    MemoryDbConfig::default().with_poll_interval(Duration::from_millis(10))
}

fn manager_over(backend: Arc<MemoryDocumentBackend>) -> IndexManager {
    IndexManager::new(backend, fast_config())
}

fn tag_fields(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn create_is_idempotent() -> Result<()> {
    let backend = Arc::new(MemoryDocumentBackend::new());
    let manager = manager_over(backend.clone());
    let cancel = CancellationToken::new();

    let first = manager.create_index("default", 725, &cancel).await?;
    assert!(first.exists);
    assert_eq!(first.mappings.vector_dimension(), Some(725));

    let second = manager.create_index("default", 725, &cancel).await?;
    assert!(second.exists);
    assert_eq!(backend.commands_issued("createSearchIndexes"), 1);
    Ok(())
}

#[tokio::test]
async fn status_is_absent_without_a_collection() -> Result<()> {
    let backend = Arc::new(MemoryDocumentBackend::new());
    let manager = manager_over(backend);
    let cancel = CancellationToken::new();

    let info = manager.get_status("ghost", &cancel).await?;
    assert!(!info.exists);
    assert_eq!(info.status, IndexStatus::Absent);
    Ok(())
}

#[tokio::test]
async fn ambiguous_definitions_fail_fatally() -> Result<()> {
    let backend = Arc::new(MemoryDocumentBackend::new());
    let manager = manager_over(backend.clone());
    let cancel = CancellationToken::new();

    let collection = collection_name("default");
    backend.create_collection(&collection).await?;
    let index_name = search_index_name(&collection);
    for _ in 0..2 {
        let mut command = Document::new();
        command.insert("createSearchIndexes".to_string(), json!(collection));
        command.insert(
            "indexes".to_string(),
            json!([{ "name": index_name, "definition": { "mappings": {} } }]),
        );
        backend.run_command(command).await?;
    }

    let result = manager.get_status("default", &cancel).await;
    assert!(matches!(result, Err(EngramError::AmbiguousIndex(_))));
    Ok(())
}

#[tokio::test]
async fn wait_for_ready_observes_the_build_completing() -> Result<()> {
    let backend = Arc::new(MemoryDocumentBackend::with_build_delay(
        Duration::from_millis(500),
    ));
    let manager = manager_over(backend);
    let cancel = CancellationToken::new();

    let info = manager.create_index("default", 4, &cancel).await?;
    assert_eq!(info.status, IndexStatus::Building);
    assert!(matches!(
        manager.assert_ready("default", &cancel).await,
        Err(EngramError::IndexNotReady(_))
    ));

    manager
        .wait_for_ready("default", Duration::from_secs(10), &cancel)
        .await?;
    manager.assert_ready("default", &cancel).await?;
    Ok(())
}

#[tokio::test]
async fn wait_for_ready_times_out_silently() -> Result<()> {
    let backend = Arc::new(MemoryDocumentBackend::with_build_delay(
        Duration::from_secs(60),
    ));
    let manager = manager_over(backend);
    let cancel = CancellationToken::new();

    manager.create_index("default", 4, &cancel).await?;
    manager
        .wait_for_ready("default", Duration::from_millis(100), &cancel)
        .await?;

    let info = manager.get_status("default", &cancel).await?;
    assert_eq!(info.status, IndexStatus::Building);
    Ok(())
}

#[tokio::test]
async fn wait_for_ready_surfaces_cancellation() -> Result<()> {
    let backend = Arc::new(MemoryDocumentBackend::with_build_delay(
        Duration::from_secs(60),
    ));
    let manager = manager_over(backend);
    let cancel = CancellationToken::new();
    manager.create_index("default", 4, &cancel).await?;

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let result = manager
        .wait_for_ready("default", Duration::from_secs(60), &cancelled)
        .await;
    assert!(matches!(result, Err(EngramError::Cancelled(_))));
    Ok(())
}

#[tokio::test]
async fn schema_cache_fast_path_issues_no_commands() -> Result<()> {
    let backend = Arc::new(MemoryDocumentBackend::new());
    let manager = manager_over(backend.clone());
    let cancel = CancellationToken::new();
    manager.create_index("default", 4, &cancel).await?;

    manager
        .ensure_string_fields_indexed("default", &tag_fields(&["tg_color", "tg_size"]), &cancel)
        .await?;
    assert_eq!(backend.commands_issued("updateSearchIndex"), 1);

    // already covered, in full and as a subset
    manager
        .ensure_string_fields_indexed("default", &tag_fields(&["tg_color", "tg_size"]), &cancel)
        .await?;
    manager
        .ensure_string_fields_indexed("default", &tag_fields(&["tg_color"]), &cancel)
        .await?;
    assert_eq!(backend.commands_issued("updateSearchIndex"), 1);

    // a genuinely new field forces one more update
    manager
        .ensure_string_fields_indexed("default", &tag_fields(&["tg_genre"]), &cancel)
        .await?;
    assert_eq!(backend.commands_issued("updateSearchIndex"), 2);
    Ok(())
}

#[tokio::test]
async fn schema_cache_matches_case_insensitively() -> Result<()> {
    let backend = Arc::new(MemoryDocumentBackend::new());
    let manager = manager_over(backend.clone());
    let cancel = CancellationToken::new();
    manager.create_index("default", 4, &cancel).await?;

    manager
        .ensure_string_fields_indexed("default", &tag_fields(&["tg_Color"]), &cancel)
        .await?;
    manager
        .ensure_string_fields_indexed("default", &tag_fields(&["tg_color"]), &cancel)
        .await?;
    assert_eq!(backend.commands_issued("updateSearchIndex"), 1);
    Ok(())
}

#[tokio::test]
async fn schema_cache_hydrates_from_the_live_definition() -> Result<()> {
    let backend = Arc::new(MemoryDocumentBackend::new());
    let cancel = CancellationToken::new();

    let first = manager_over(backend.clone());
    first.create_index("default", 4, &cancel).await?;
    first
        .ensure_string_fields_indexed("default", &tag_fields(&["tg_color"]), &cancel)
        .await?;
    assert_eq!(backend.commands_issued("updateSearchIndex"), 1);

    // a fresh process: empty cache, same backend state
    let second = manager_over(backend.clone());
    second
        .ensure_string_fields_indexed("default", &tag_fields(&["tg_color"]), &cancel)
        .await?;
    assert_eq!(backend.commands_issued("updateSearchIndex"), 1);
    Ok(())
}

#[tokio::test]
async fn ensure_on_an_absent_index_reconciles_nothing() -> Result<()> {
    let backend = Arc::new(MemoryDocumentBackend::new());
    let manager = manager_over(backend.clone());
    let cancel = CancellationToken::new();

    manager
        .ensure_string_fields_indexed("ghost", &tag_fields(&["tg_color"]), &cancel)
        .await?;
    assert_eq!(backend.commands_issued("updateSearchIndex"), 0);
    Ok(())
}

#[tokio::test]
async fn delete_all_definitions_drops_every_definition() -> Result<()> {
    let backend = Arc::new(MemoryDocumentBackend::new());
    let manager = manager_over(backend.clone());
    let cancel = CancellationToken::new();

    let collection = collection_name("default");
    backend.create_collection(&collection).await?;
    for suffix in ["a", "b"] {
        let mut command = Document::new();
        command.insert("createSearchIndexes".to_string(), json!(collection));
        command.insert(
            "indexes".to_string(),
            json!([{ "name": format!("ix_{suffix}"), "definition": { "mappings": {} } }]),
        );
        backend.run_command(command).await?;
    }

    manager
        .delete_all_index_definitions(&collection, &cancel)
        .await?;
    assert_eq!(backend.commands_issued("dropSearchIndex"), 2);

    let info = manager.get_status("default", &cancel).await?;
    assert!(!info.exists);
    Ok(())
}

/// A backend whose index-creation command acknowledges without creating
/// anything, as a flaky control plane can.
#[derive(Debug)]
struct RefusingBackend {
    inner: MemoryDocumentBackend,
}

#[async_trait]
impl DocumentBackend for RefusingBackend {
    async fn create_collection(&self, name: &str) -> Result<()> {
        self.inner.create_collection(name).await
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        self.inner.drop_collection(name).await
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        self.inner.collection_exists(name).await
    }

    async fn list_collection_names(&self) -> Result<Vec<String>> {
        self.inner.list_collection_names().await
    }

    async fn replace_document(
        &self,
        collection: &str,
        id: &str,
        document: Document,
    ) -> Result<()> {
        self.inner.replace_document(collection, id, document).await
    }

    async fn find_document(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.inner.find_document(collection, id).await
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<()> {
        self.inner.delete_document(collection, id).await
    }

    async fn delete_documents_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<u64> {
        self.inner
            .delete_documents_by_field(collection, field, value)
            .await
    }

    async fn aggregate(&self, collection: &str, pipeline: &[Document]) -> Result<Vec<Document>> {
        self.inner.aggregate(collection, pipeline).await
    }

    async fn run_command(&self, command: Document) -> Result<Document> {
        if command.contains_key("createSearchIndexes") {
            let mut response = Document::new();
            response.insert("ok".to_string(), json!(1));
            response.insert("indexesCreated".to_string(), Value::Array(Vec::new()));
            return Ok(response);
        }
        self.inner.run_command(command).await
    }
}

#[tokio::test]
async fn refused_creation_reports_absent_instead_of_failing() -> Result<()> {
    let backend = Arc::new(RefusingBackend {
        inner: MemoryDocumentBackend::new(),
    });
    let manager = IndexManager::new(backend, fast_config());
    let cancel = CancellationToken::new();

    let info = manager.create_index("default", 4, &cancel).await?;
    assert!(!info.exists);
    assert_eq!(info.status, IndexStatus::Absent);
    Ok(())
}
