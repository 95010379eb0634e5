use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use filevault::config::Config;
use filevault::extract::{Extraction, Extractor};
use filevault::indexer::CleanupOutcome;
use filevault::{Components, IndexingDisposition, Vault, VaultError};
use filevault_core::embedding::HashEmbedder;
use filevault_core::index::memory::InMemoryVectorIndex;
use filevault_core::index::VectorIndex;
use filevault_core::models::{IndexOutcome, IndexState};
use filevault_core::search::{Aggregation, SearchRequest};
use tempfile::TempDir;

const RUST_DOC: &str = "Rust ownership rules let the borrow checker prove memory safety at \
compile time. Every value has a single owner, references borrow without taking ownership, \
and lifetimes describe how long a borrow stays valid. The borrow checker rejects dangling \
references and data races before the program ever runs.";

const BREAD_DOC: &str = "Sourdough bread needs an active starter, strong flour, water and salt. \
Mix the dough, let it ferment slowly, shape the loaf, proof it overnight in the fridge, then \
bake it hot in a covered pot so the crust blisters and the crumb stays open and moist.";

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::with_paths(
        tmp.path().join("data/vault.sqlite"),
        tmp.path().join("data/store"),
    );
    config.chunking.window_tokens = 20;
    config.chunking.overlap_tokens = 5;
    config.chunking.min_tokens = 5;
    config.embedding.dims = Some(256);
    config.indexing.backoff_base_ms = 1;
    config.indexing.max_attempts = 3;
    config.indexing.cleanup_max_attempts = 2;
    config
}

async fn open_with_memory_index(config: Config) -> (Vault, Arc<InMemoryVectorIndex>) {
    let index = Arc::new(InMemoryVectorIndex::new());
    let vault = Vault::open_with(
        config,
        Components {
            embedder: Some(Arc::new(HashEmbedder::new(256))),
            index: Some(index.clone()),
            extractor: None,
        },
    )
    .await
    .unwrap();
    (vault, index)
}

/// Long text on the first call, a two-window text on every later call.
struct ShrinkingExtractor {
    calls: AtomicUsize,
}

impl Extractor for ShrinkingExtractor {
    fn extract(&self, _bytes: &[u8], _declared_type: &str, _display_name: &str) -> Extraction {
        let words = if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            200
        } else {
            30
        };
        let text: Vec<String> = (0..words).map(|i| format!("word{}", i)).collect();
        Extraction::Text(text.join(" "))
    }
}

fn search(query: &str) -> SearchRequest {
    SearchRequest::new(query).threshold(0.0)
}

#[tokio::test]
async fn test_identical_uploads_share_content() {
    let tmp = TempDir::new().unwrap();
    let (vault, _) = open_with_memory_index(test_config(&tmp)).await;

    let first = vault.upload(RUST_DOC.as_bytes(), "a.txt", None).await.unwrap();
    let second = vault.upload(RUST_DOC.as_bytes(), "b.txt", None).await.unwrap();

    assert!(first.is_new_content);
    assert!(!second.is_new_content);
    assert_eq!(second.reference_count, 2);
    assert_ne!(first.file.id, second.file.id);
    assert_eq!(first.file.content_fingerprint, second.file.content_fingerprint);
    assert_eq!(first.file.declared_type, "text/plain");

    let stats = vault.stats().await.unwrap();
    assert_eq!(stats.storage.total_files, 2);
    assert_eq!(stats.storage.unique_contents, 1);
    assert_eq!(stats.storage.bytes_saved, RUST_DOC.len() as u64);

    vault.shutdown().await;
}

#[tokio::test]
async fn test_last_delete_removes_bytes() {
    let tmp = TempDir::new().unwrap();
    let (vault, index) = open_with_memory_index(test_config(&tmp)).await;

    let a = vault.upload(RUST_DOC.as_bytes(), "a.txt", None).await.unwrap();
    let b = vault.upload(RUST_DOC.as_bytes(), "b.txt", None).await.unwrap();
    let blob = vault.content_store().blob_path(&a.file.content_fingerprint);
    assert!(blob.exists());

    let first = vault.delete(&a.file.id).await.unwrap();
    assert_eq!(first.remaining_references, 1);
    assert!(!first.content_deleted);
    assert!(blob.exists());

    let (_, bytes) = vault.read(&b.file.id).await.unwrap();
    assert_eq!(bytes, RUST_DOC.as_bytes());

    // the surviving reference keeps its own chunks
    vault.wait_idle().await;
    assert!(index.count_for_owner(&b.file.id).await.unwrap() > 0);
    assert_eq!(index.count_for_owner(&a.file.id).await.unwrap(), 0);
    let results = vault.search(&search("borrow checker")).await.unwrap();
    assert!(results.iter().any(|r| r.file_id == b.file.id));
    assert!(results.iter().all(|r| r.file_id != a.file.id));

    let second = vault.delete(&b.file.id).await.unwrap();
    assert_eq!(second.remaining_references, 0);
    assert!(second.content_deleted);
    assert!(!blob.exists());

    let err = vault.read(&b.file.id).await.unwrap_err();
    assert!(VaultError::is_not_found(&err));
    let err = vault.delete(&b.file.id).await.unwrap_err();
    assert!(VaultError::is_not_found(&err));

    let stats = vault.stats().await.unwrap();
    assert_eq!(stats.storage.unique_contents, 0);
    assert_eq!(stats.storage.physical_bytes, 0);

    vault.shutdown().await;
}

#[tokio::test]
async fn test_upload_indexes_inline_and_search_ranks_files() {
    let tmp = TempDir::new().unwrap();
    let (vault, index) = open_with_memory_index(test_config(&tmp)).await;

    let rust = vault.upload(RUST_DOC.as_bytes(), "rust.md", None).await.unwrap();
    let bread = vault.upload(BREAD_DOC.as_bytes(), "bread.md", None).await.unwrap();

    match &rust.indexing {
        IndexingDisposition::Inline {
            outcome: IndexOutcome::Done { chunks },
        } => assert!(*chunks >= 2),
        other => panic!("expected inline indexing, got {:?}", other),
    }
    assert!(index.count_for_owner(&bread.file.id).await.unwrap() > 0);

    let results = vault
        .search(&search("borrow checker ownership lifetimes"))
        .await
        .unwrap();
    assert_eq!(results[0].file_id, rust.file.id);
    assert!(results[0].matched_chunks >= 1);
    assert!(results.iter().all(|r| r.score <= 1.0));

    let results = vault
        .search(&search("sourdough starter flour").aggregation(Aggregation::Mean))
        .await
        .unwrap();
    assert_eq!(results[0].file_id, bread.file.id);

    let status = vault.index_status(&rust.file.id).await.unwrap().unwrap();
    assert_eq!(status.state, IndexState::Done);
    assert_eq!(status.attempts, 1);

    vault.shutdown().await;
}

#[tokio::test]
async fn test_deleted_file_leaves_search_and_index() {
    let tmp = TempDir::new().unwrap();
    let (vault, index) = open_with_memory_index(test_config(&tmp)).await;

    let rust = vault.upload(RUST_DOC.as_bytes(), "rust.md", None).await.unwrap();
    vault.delete(&rust.file.id).await.unwrap();
    vault.wait_idle().await;

    assert_eq!(index.count_for_owner(&rust.file.id).await.unwrap(), 0);
    assert!(vault.pending_cleanups().await.unwrap().is_empty());
    assert!(vault.index_status(&rust.file.id).await.unwrap().is_none());

    let results = vault.search(&search("borrow checker")).await.unwrap();
    assert!(results.iter().all(|r| r.file_id != rust.file.id));

    vault.shutdown().await;
}

#[tokio::test]
async fn test_failed_cleanup_alarms_and_repair_recovers() {
    let tmp = TempDir::new().unwrap();
    let (vault, index) = open_with_memory_index(test_config(&tmp)).await;

    let rust = vault.upload(RUST_DOC.as_bytes(), "rust.md", None).await.unwrap();
    index.fail_next_deletes(2);
    vault.delete(&rust.file.id).await.unwrap();
    vault.wait_idle().await;

    let pending = vault.pending_cleanups().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].alarmed);
    assert_eq!(pending[0].attempts, 2);
    assert!(index.count_for_owner(&rust.file.id).await.unwrap() > 0);
    assert_eq!(vault.stats().await.unwrap().alarmed_cleanups, 1);

    // stale chunks never surface for a deleted file
    let results = vault.search(&search("borrow checker")).await.unwrap();
    assert!(results.iter().all(|r| r.file_id != rust.file.id));

    let report = vault.repair().await.unwrap();
    assert_eq!(report.cleanups_completed, 1);
    assert_eq!(index.count_for_owner(&rust.file.id).await.unwrap(), 0);
    assert!(vault.pending_cleanups().await.unwrap().is_empty());

    let again = vault.indexer().cleanup(&rust.file.id).await.unwrap();
    assert_eq!(again, CleanupOutcome::NotPending);

    vault.shutdown().await;
}

#[tokio::test]
async fn test_unavailable_index_does_not_fail_upload() {
    let tmp = TempDir::new().unwrap();
    let (vault, index) = open_with_memory_index(test_config(&tmp)).await;

    index.set_available(false);
    let upload = vault.upload(RUST_DOC.as_bytes(), "rust.md", None).await.unwrap();
    assert!(matches!(
        upload.indexing,
        IndexingDisposition::Inline {
            outcome: IndexOutcome::Failed { attempts: 1, .. }
        }
    ));
    vault.wait_idle().await;

    let status = vault.index_status(&upload.file.id).await.unwrap().unwrap();
    assert_eq!(status.state, IndexState::Failed);
    assert_eq!(status.attempts, 3);
    assert!(status.last_error.is_some());

    let err = vault.search(&search("borrow checker")).await.unwrap_err();
    assert!(VaultError::is_transient(&err));

    index.set_available(true);
    let outcome = vault.reindex(&upload.file.id).await.unwrap();
    assert!(matches!(outcome, IndexOutcome::Done { .. }));
    let results = vault.search(&search("borrow checker")).await.unwrap();
    assert_eq!(results[0].file_id, upload.file.id);

    vault.shutdown().await;
}

#[tokio::test]
async fn test_unextractable_and_short_files_are_skipped() {
    let tmp = TempDir::new().unwrap();
    let (vault, index) = open_with_memory_index(test_config(&tmp)).await;

    let binary: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
    let blob = vault.upload(&binary, "image.bin", None).await.unwrap();
    assert!(matches!(
        blob.indexing,
        IndexingDisposition::Inline {
            outcome: IndexOutcome::Skipped { .. }
        }
    ));
    assert_eq!(blob.file.declared_type, "application/octet-stream");

    let short = "supercalifragilisticexpialidocious antidisestablishmentarianism";
    let upload = vault.upload(short.as_bytes(), "short.txt", None).await.unwrap();
    match upload.indexing {
        IndexingDisposition::Inline {
            outcome: IndexOutcome::Skipped { reason },
        } => assert_eq!(reason, "text below minimum chunk size"),
        other => panic!("expected skip, got {:?}", other),
    }
    assert_eq!(index.count().await.unwrap(), 0);

    let status = vault.index_status(&blob.file.id).await.unwrap().unwrap();
    assert_eq!(status.state, IndexState::Skipped);

    vault.shutdown().await;
}

#[tokio::test]
async fn test_large_upload_indexes_in_background() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.indexing.inline_max_bytes = 16;
    let (vault, index) = open_with_memory_index(config).await;

    let upload = vault.upload(RUST_DOC.as_bytes(), "rust.md", None).await.unwrap();
    assert_eq!(upload.indexing, IndexingDisposition::Queued);
    vault.wait_idle().await;

    let status = vault.index_status(&upload.file.id).await.unwrap().unwrap();
    assert_eq!(status.state, IndexState::Done);
    assert!(index.count_for_owner(&upload.file.id).await.unwrap() > 0);

    vault.shutdown().await;
}

#[tokio::test]
async fn test_upload_validation() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.storage.max_upload_bytes = 64;
    let (vault, _) = open_with_memory_index(config).await;

    let err = vault.upload(RUST_DOC.as_bytes(), "rust.md", None).await.unwrap_err();
    assert!(VaultError::is_validation(&err));

    let err = vault.upload(b"hello", "  ", None).await.unwrap_err();
    assert!(VaultError::is_validation(&err));

    let err = vault.search(&SearchRequest::new("ab")).await.unwrap_err();
    assert!(VaultError::is_validation(&err));
    let err = vault
        .search(&SearchRequest::new("borrow checker").top_k(0))
        .await
        .unwrap_err();
    assert!(VaultError::is_validation(&err));

    assert_eq!(vault.stats().await.unwrap().storage.total_files, 0);

    vault.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_identical_uploads_store_once() {
    let tmp = TempDir::new().unwrap();
    let (vault, _) = open_with_memory_index(test_config(&tmp)).await;
    let vault = Arc::new(vault);

    let mut handles = Vec::new();
    for i in 0..8 {
        let vault = vault.clone();
        handles.push(tokio::spawn(async move {
            vault
                .upload(BREAD_DOC.as_bytes(), &format!("copy-{}.txt", i), None)
                .await
                .unwrap()
        }));
    }
    let mut new_content = 0;
    for h in handles {
        if h.await.unwrap().is_new_content {
            new_content += 1;
        }
    }
    assert_eq!(new_content, 1);

    let stats = vault.stats().await.unwrap();
    assert_eq!(stats.storage.total_files, 8);
    assert_eq!(stats.storage.unique_contents, 1);

    let files = vault.list().await.unwrap();
    let content = vault
        .content_store()
        .get(&files[0].content_fingerprint)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(content.reference_count, 8);
}

#[tokio::test]
async fn test_reset_and_reindex_all() {
    let tmp = TempDir::new().unwrap();
    let (vault, index) = open_with_memory_index(test_config(&tmp)).await;

    vault.upload(RUST_DOC.as_bytes(), "rust.md", None).await.unwrap();
    vault.upload(BREAD_DOC.as_bytes(), "bread.md", None).await.unwrap();
    let before = index.count().await.unwrap();
    assert!(before > 0);

    assert_eq!(vault.reset_index().await.unwrap(), before);
    assert_eq!(index.count().await.unwrap(), 0);
    assert!(vault.search(&search("borrow checker")).await.unwrap().is_empty());

    let report = vault.reindex_all().await.unwrap();
    assert_eq!(report.indexed, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(index.count().await.unwrap(), before);

    let err = vault.reindex("no-such-file").await.unwrap_err();
    assert!(VaultError::is_not_found(&err));

    vault.shutdown().await;
}

#[tokio::test]
async fn test_sqlite_index_survives_reopen() {
    let tmp = TempDir::new().unwrap();

    let vault = Vault::open(test_config(&tmp)).await.unwrap();
    let rust = vault.upload(RUST_DOC.as_bytes(), "rust.md", None).await.unwrap();
    vault.upload(BREAD_DOC.as_bytes(), "bread.md", None).await.unwrap();
    vault.shutdown().await;

    let vault = Vault::open(test_config(&tmp)).await.unwrap();
    let file = vault.get(&rust.file.id).await.unwrap();
    assert_eq!(file, rust.file);

    let results = vault.search(&search("borrow checker lifetimes")).await.unwrap();
    assert_eq!(results[0].file_id, rust.file.id);
    assert!(results[0].preview.len() <= 203);

    let stats = vault.stats().await.unwrap();
    assert_eq!(stats.embedding_model, "feature-hash-256");
    assert_eq!(stats.index_states.get("done"), Some(&2));

    vault.shutdown().await;
}

#[tokio::test]
async fn test_disabled_embedding_stores_without_indexing() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.embedding.provider = "disabled".into();
    let vault = Vault::open(config).await.unwrap();

    let upload = vault.upload(RUST_DOC.as_bytes(), "rust.md", None).await.unwrap();
    assert_eq!(upload.indexing, IndexingDisposition::Disabled);
    let status = vault.index_status(&upload.file.id).await.unwrap().unwrap();
    assert_eq!(status.state, IndexState::Skipped);

    let err = vault.search(&search("borrow checker")).await.unwrap_err();
    assert!(VaultError::is_transient(&err));

    vault.shutdown().await;
}

#[tokio::test]
async fn test_reindex_of_unchanged_content_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let (vault, index) = open_with_memory_index(test_config(&tmp)).await;

    let rust = vault.upload(RUST_DOC.as_bytes(), "rust.md", None).await.unwrap();
    let before = index.chunk_ids_for_owner(&rust.file.id).await.unwrap();

    for _ in 0..2 {
        let outcome = vault.reindex(&rust.file.id).await.unwrap();
        assert_eq!(outcome, IndexOutcome::Done { chunks: before.len() });
        assert_eq!(index.chunk_ids_for_owner(&rust.file.id).await.unwrap(), before);
    }
    assert!(before.contains(&format!("{}:0", rust.file.id)));

    vault.shutdown().await;
}

#[tokio::test]
async fn test_reindex_of_shorter_text_drops_tail_chunks() {
    let tmp = TempDir::new().unwrap();
    let index = Arc::new(InMemoryVectorIndex::new());
    let vault = Vault::open_with(
        test_config(&tmp),
        Components {
            embedder: Some(Arc::new(HashEmbedder::new(256))),
            index: Some(index.clone()),
            extractor: Some(Arc::new(ShrinkingExtractor {
                calls: AtomicUsize::new(0),
            })),
        },
    )
    .await
    .unwrap();

    let upload = vault.upload(b"notes", "notes.txt", None).await.unwrap();
    let before = index.chunk_ids_for_owner(&upload.file.id).await.unwrap();
    assert!(before.len() > 2);

    let outcome = vault.reindex(&upload.file.id).await.unwrap();
    assert_eq!(outcome, IndexOutcome::Done { chunks: 2 });
    let after = index.chunk_ids_for_owner(&upload.file.id).await.unwrap();
    assert_eq!(
        after,
        vec![format!("{}:0", upload.file.id), format!("{}:1", upload.file.id)]
    );

    vault.shutdown().await;
}

#[tokio::test]
async fn test_unextractable_upload_is_skipped_while_index_is_down() {
    let tmp = TempDir::new().unwrap();
    let (vault, index) = open_with_memory_index(test_config(&tmp)).await;

    index.set_available(false);
    let binary: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
    let upload = vault.upload(&binary, "image.bin", None).await.unwrap();
    assert!(matches!(
        upload.indexing,
        IndexingDisposition::Inline {
            outcome: IndexOutcome::Skipped { .. }
        }
    ));
    vault.wait_idle().await;

    let status = vault.index_status(&upload.file.id).await.unwrap().unwrap();
    assert_eq!(status.state, IndexState::Skipped);

    vault.shutdown().await;
}

#[tokio::test]
async fn test_open_does_not_wait_on_pending_cleanups() {
    let tmp = TempDir::new().unwrap();
    let (vault, index) = open_with_memory_index(test_config(&tmp)).await;

    let rust = vault.upload(RUST_DOC.as_bytes(), "rust.md", None).await.unwrap();
    index.fail_next_deletes(2);
    vault.delete(&rust.file.id).await.unwrap();
    vault.wait_idle().await;
    assert_eq!(vault.pending_cleanups().await.unwrap().len(), 1);
    vault.shutdown().await;

    // with the index down and a long backoff, a blocking recovery would
    // hold open for a minute
    index.set_available(false);
    let mut slow = test_config(&tmp);
    slow.indexing.backoff_base_ms = 60_000;
    let components = Components {
        embedder: Some(Arc::new(HashEmbedder::new(256))),
        index: Some(index.clone()),
        extractor: None,
    };
    let open = Vault::open_with(slow, components);
    let reopened = tokio::time::timeout(Duration::from_secs(5), open)
        .await
        .expect("open waited on cleanup retries")
        .unwrap();
    assert_eq!(reopened.pending_cleanups().await.unwrap().len(), 1);
    drop(reopened);

    index.set_available(true);
    let components = Components {
        embedder: Some(Arc::new(HashEmbedder::new(256))),
        index: Some(index.clone()),
        extractor: None,
    };
    let vault = Vault::open_with(test_config(&tmp), components).await.unwrap();
    vault.wait_idle().await;
    assert!(vault.pending_cleanups().await.unwrap().is_empty());
    assert_eq!(index.count_for_owner(&rust.file.id).await.unwrap(), 0);

    vault.shutdown().await;
}

#[tokio::test]
async fn test_repair_reports_corrupt_content() {
    let tmp = TempDir::new().unwrap();
    let (vault, _) = open_with_memory_index(test_config(&tmp)).await;

    let rust = vault.upload(RUST_DOC.as_bytes(), "rust.md", None).await.unwrap();
    vault.upload(BREAD_DOC.as_bytes(), "bread.md", None).await.unwrap();
    let report = vault.repair().await.unwrap();
    assert_eq!(report.corrupt_contents, 0);

    let blob = vault.content_store().blob_path(&rust.file.content_fingerprint);
    std::fs::write(&blob, b"bit rot").unwrap();
    let report = vault.repair().await.unwrap();
    assert_eq!(report.corrupt_contents, 1);
    assert_eq!(report.cleanups_completed, 0);

    vault.shutdown().await;
}
