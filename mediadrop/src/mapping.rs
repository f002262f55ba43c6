//! The mapping document: identifier -> [`FileRecord`] for every upload.
//!
//! The whole mapping lives in a single JSON object in the remote store. Updating it is a
//! read-modify-write of that one document, so two uploads racing between the read and the write
//! would each write back a document holding only their own entry and one of them would vanish.
//! [`MappingStore`] closes that window twice over:
//!
//! - Within the process, every update runs under one async mutex, so load -> merge -> save never
//!   interleaves with another update.
//! - Across processes, every save names the version it was based on. When someone else wrote the
//!   document in between, the store reports a conflict and the update is replayed on a fresh copy,
//!   up to `max_attempts` times.
//!
//! The last document read or written is cached behind a lock that is never held across I/O, so
//! lookups do not wait for an update in flight. Lookups are served from the cache when the entry
//! is there and go back to the store when it is not, so entries created by other processes are
//! still found.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::records::FileRecord;
use crate::store::{ObjectDescriptor, ObjectStore, Result, StoreError};

/// Commit message used for every mapping document write.
pub const MAPPING_COMMIT_MESSAGE: &str = "Update file mappings";

/// All known files keyed by identifier.
///
/// Keys are kept sorted so the serialized document is stable between writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MappingDocument(BTreeMap<String, FileRecord>);

impl MappingDocument {
    pub fn get(&self, id: &str) -> Option<&FileRecord> {
        self.0.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    /// Insert or replace the entry for `id`.
    pub fn merge(&mut self, id: impl Into<String>, record: FileRecord) {
        self.0.insert(id.into(), record);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a stored document. Empty content counts as an empty document.
    pub fn from_slice(path: &str, content: &[u8]) -> Result<Self> {
        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(content).map_err(|e| StoreError::Malformed {
            path: path.to_string(),
            reason: format!("mapping document is not valid JSON: {e}"),
        })
    }

    /// Human-readable JSON with two-space indentation.
    pub fn to_bytes(&self, path: &str) -> Result<Bytes> {
        serde_json::to_vec_pretty(&self.0)
            .map(Bytes::from)
            .map_err(|e| StoreError::Malformed {
                path: path.to_string(),
                reason: format!("mapping document could not be serialized: {e}"),
            })
    }
}

/// A document together with the store version it was read as or written to.
#[derive(Debug, Clone, Default)]
struct Snapshot {
    document: MappingDocument,
    /// `None` when the document does not exist in the store yet
    version: Option<String>,
}

pub struct MappingStore {
    store: Arc<dyn ObjectStore>,
    path: String,
    max_attempts: usize,
    /// Serializes load -> merge -> save; held across store calls
    update: Mutex<()>,
    /// Last known document; only ever locked briefly
    cache: RwLock<Option<Snapshot>>,
}

impl MappingStore {
    pub fn new(store: Arc<dyn ObjectStore>, path: impl Into<String>, max_attempts: usize) -> Self {
        Self {
            store,
            path: path.into(),
            max_attempts: max_attempts.max(1),
            update: Mutex::new(()),
            cache: RwLock::new(None),
        }
    }

    /// Fetch the current document from the store and refresh the cache with it.
    ///
    /// A missing document is an empty one; any other failure is returned. Uploads call this before
    /// writing anything, so an unreadable mapping stops them before a file object is committed.
    #[instrument(skip(self), err)]
    pub async fn load(&self) -> Result<MappingDocument> {
        let snapshot = self.fetch_snapshot().await?;
        let document = snapshot.document.clone();
        *self.cache.write() = Some(snapshot);
        Ok(document)
    }

    /// Write `document` as the new mapping, replacing the revision `expected_version`.
    pub async fn save(&self, document: &MappingDocument, expected_version: Option<&str>) -> Result<ObjectDescriptor> {
        self.store
            .write_object(&self.path, document.to_bytes(&self.path)?, MAPPING_COMMIT_MESSAGE, expected_version)
            .await
    }

    /// Look up a single record.
    #[instrument(skip(self), err)]
    pub async fn get(&self, id: &str) -> Result<Option<FileRecord>> {
        let cached = self
            .cache
            .read()
            .as_ref()
            .and_then(|snapshot| snapshot.document.get(id).cloned());
        if let Some(record) = cached {
            return Ok(Some(record));
        }

        // Not cached: it may have been written by another instance since
        let snapshot = self.fetch_snapshot().await?;
        let record = snapshot.document.get(id).cloned();
        *self.cache.write() = Some(snapshot);
        Ok(record)
    }

    /// Add `record` to the mapping under its id.
    ///
    /// Holds the update lock for the whole load -> merge -> save sequence and replays it on a
    /// fresh copy when the save conflicts with a write from elsewhere. Only attempts made on a
    /// freshly fetched copy count towards `max_attempts`; a conflict on the cached copy just means
    /// the cache was stale.
    #[instrument(skip(self, record), fields(id = %record.id), err)]
    pub async fn insert(&self, record: FileRecord) -> Result<()> {
        let _update = self.update.lock().await;
        let mut attempts = 0;
        let mut use_cache = true;

        loop {
            let cached = if use_cache { self.cache.read().clone() } else { None };
            let from_cache = cached.is_some();
            let mut snapshot = match cached {
                Some(snapshot) => snapshot,
                None => {
                    attempts += 1;
                    self.fetch_snapshot().await?
                }
            };
            snapshot.document.merge(record.id.clone(), record.clone());

            match self.save(&snapshot.document, snapshot.version.as_deref()).await {
                Ok(descriptor) => {
                    debug!(sha = %descriptor.sha, entries = snapshot.document.len(), "Mapping document saved");
                    snapshot.version = Some(descriptor.sha);
                    *self.cache.write() = Some(snapshot);
                    return Ok(());
                }
                Err(e) if e.is_conflict() && from_cache => {
                    debug!("Cached mapping document was stale, refetching");
                    use_cache = false;
                }
                Err(e) if e.is_conflict() && attempts < self.max_attempts => {
                    warn!(attempts, max_attempts = self.max_attempts, "Mapping document changed concurrently, retrying");
                }
                Err(e) => {
                    if e.is_conflict() {
                        info!(attempts, "Giving up on mapping update after repeated conflicts");
                    }
                    // The next caller starts from the store again
                    *self.cache.write() = None;
                    return Err(e);
                }
            }
        }
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot> {
        match self.store.fetch_object(&self.path).await {
            Ok(object) => Ok(Snapshot {
                document: MappingDocument::from_slice(&self.path, &object.content)?,
                version: Some(object.sha),
            }),
            Err(e) if e.is_not_found() => {
                debug!(path = %self.path, "No mapping document yet, starting empty");
                Ok(Snapshot::default())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoredObject};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use url::Url;

    const PATH: &str = "mappings.json";

    fn record(id: &str) -> FileRecord {
        FileRecord {
            id: id.to_string(),
            original_name: format!("{id}.txt"),
            extension: "txt".to_string(),
            stored_filename: format!("{id}.txt"),
            upload_time: Utc::now(),
            size: 3,
            mime_type: "text/plain".to_string(),
        }
    }

    fn memory_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(Url::parse("http://localhost/raw").unwrap()))
    }

    async fn stored_document(store: &MemoryStore) -> MappingDocument {
        let content = store.object(PATH).expect("mapping document should exist");
        MappingDocument::from_slice(PATH, &content).unwrap()
    }

    #[tokio::test]
    async fn test_missing_document_loads_empty() {
        let mappings = MappingStore::new(memory_store(), PATH, 3);
        assert!(mappings.load().await.unwrap().is_empty());
        assert_eq!(mappings.get("a1b2c3d4").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_document_is_an_error() {
        let store = memory_store();
        store.write_object(PATH, Bytes::from_static(b"not json"), "seed", None).await.unwrap();

        let mappings = MappingStore::new(store, PATH, 3);
        let err = mappings.load().await.unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_insert_then_get() {
        let store = memory_store();
        let mappings = MappingStore::new(store.clone(), PATH, 3);

        mappings.insert(record("aaaa0001")).await.unwrap();
        mappings.insert(record("aaaa0002")).await.unwrap();

        let found = mappings.get("aaaa0001").await.unwrap().expect("record should be found");
        assert_eq!(found.stored_filename, "aaaa0001.txt");

        let document = stored_document(&store).await;
        assert_eq!(document.len(), 2);
        assert_eq!(document.get("aaaa0002").map(|r| r.id.as_str()), Some("aaaa0002"));
        assert_eq!(store.last_message(PATH).as_deref(), Some(MAPPING_COMMIT_MESSAGE));
    }

    #[tokio::test]
    async fn test_document_is_pretty_printed() {
        let store = memory_store();
        let mappings = MappingStore::new(store.clone(), PATH, 3);
        mappings.insert(record("aaaa0001")).await.unwrap();

        let text = String::from_utf8(store.object(PATH).unwrap().to_vec()).unwrap();
        assert!(text.starts_with("{\n  \"aaaa0001\": {\n    \"id\": \"aaaa0001\""), "got: {text}");
    }

    #[tokio::test]
    async fn test_existing_entries_are_preserved() {
        let store = memory_store();
        let seed = MappingStore::new(store.clone(), PATH, 3);
        seed.insert(record("00000001")).await.unwrap();

        // A second instance knows nothing about the first one's cache
        let mappings = MappingStore::new(store.clone(), PATH, 3);
        mappings.insert(record("00000002")).await.unwrap();

        let document = stored_document(&store).await;
        assert!(document.contains("00000001"));
        assert!(document.contains("00000002"));
    }

    #[tokio::test]
    async fn test_get_finds_entries_written_elsewhere() {
        let store = memory_store();
        let reader = MappingStore::new(store.clone(), PATH, 3);
        let writer = MappingStore::new(store.clone(), PATH, 3);

        writer.insert(record("00000001")).await.unwrap();
        assert!(reader.get("00000001").await.unwrap().is_some());

        // The reader now holds a cached copy; a later write elsewhere is still visible
        writer.insert(record("00000002")).await.unwrap();
        assert!(reader.get("00000002").await.unwrap().is_some());
    }

    #[test]
    fn test_empty_document_serializes_as_object() {
        let bytes = MappingDocument::default().to_bytes(PATH).unwrap();
        assert_eq!(&bytes[..], b"{}");
    }

    #[tokio::test]
    async fn test_cached_lookup_does_not_wait_for_insert() {
        let store = Arc::new(
            MemoryStore::new(Url::parse("http://localhost/raw").unwrap()).with_latency(Duration::from_millis(300)),
        );
        let mappings = Arc::new(MappingStore::new(store, PATH, 3));
        mappings.insert(record("00000001")).await.unwrap();

        let writer = mappings.clone();
        let insert = tokio::spawn(async move { writer.insert(record("00000002")).await });
        // Let the insert take the update lock and start its save
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let found = mappings.get("00000001").await.unwrap();
        assert!(found.is_some());
        assert!(
            started.elapsed() < Duration::from_millis(150),
            "lookup took {:?}",
            started.elapsed()
        );

        insert.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stale_cache_does_not_use_up_attempts() {
        let store = memory_store();
        let first = MappingStore::new(store.clone(), PATH, 1);
        let second = MappingStore::new(store.clone(), PATH, 1);

        first.insert(record("0000000a")).await.unwrap();
        second.insert(record("0000000b")).await.unwrap();
        // The first instance's cache is now behind the store, yet one attempt is enough
        first.insert(record("0000000c")).await.unwrap();

        let document = stored_document(&store).await;
        assert_eq!(document.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_are_all_kept() {
        let store = Arc::new(
            MemoryStore::new(Url::parse("http://localhost/raw").unwrap()).with_latency(Duration::from_millis(5)),
        );
        let mappings = Arc::new(MappingStore::new(store.clone(), PATH, 3));

        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let mappings = mappings.clone();
                tokio::spawn(async move { mappings.insert(record(&format!("{i:08x}"))).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(stored_document(&store).await.len(), 10);
    }

    #[tokio::test]
    async fn test_separate_instances_racing_are_all_kept() {
        let store = Arc::new(
            MemoryStore::new(Url::parse("http://localhost/raw").unwrap()).with_latency(Duration::from_millis(5)),
        );
        let first = MappingStore::new(store.clone(), PATH, 5);
        let second = MappingStore::new(store.clone(), PATH, 5);

        let (a, b) = tokio::join!(first.insert(record("0000000a")), second.insert(record("0000000b")));
        a.unwrap();
        b.unwrap();

        let document = stored_document(&store).await;
        assert!(document.contains("0000000a"));
        assert!(document.contains("0000000b"));
    }

    /// Performs a foreign write to the mapping document right before the first save goes through.
    struct InterferingStore {
        inner: Arc<MemoryStore>,
        interfered: AtomicBool,
        always: bool,
    }

    #[async_trait]
    impl ObjectStore for InterferingStore {
        async fn fetch_object(&self, path: &str) -> Result<StoredObject> {
            self.inner.fetch_object(path).await
        }

        async fn write_object(
            &self,
            path: &str,
            content: Bytes,
            message: &str,
            expected_version: Option<&str>,
        ) -> Result<ObjectDescriptor> {
            if self.always || !self.interfered.swap(true, Ordering::SeqCst) {
                let mut foreign = match self.inner.fetch_object(path).await {
                    Ok(object) => MappingDocument::from_slice(path, &object.content)?,
                    Err(_) => MappingDocument::default(),
                };
                let current = self.inner.fetch_object(path).await.ok().map(|object| object.sha);
                let id = format!("f{:07x}", self.inner.write_count());
                foreign.merge(id.clone(), record(&id));
                self.inner
                    .write_object(path, foreign.to_bytes(path)?, "foreign", current.as_deref())
                    .await?;
            }
            self.inner.write_object(path, content, message, expected_version).await
        }

        fn raw_url(&self, path: &str) -> Url {
            self.inner.raw_url(path)
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_conflict_is_retried_on_fresh_copy() {
        let inner = memory_store();
        let store = Arc::new(InterferingStore {
            inner: inner.clone(),
            interfered: AtomicBool::new(false),
            always: false,
        });
        let mappings = MappingStore::new(store, PATH, 3);

        mappings.insert(record("00000001")).await.unwrap();

        let document = stored_document(&inner).await;
        assert_eq!(document.len(), 2, "both the foreign entry and ours survive");
        assert!(document.contains("00000001"));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let inner = memory_store();
        let store = Arc::new(InterferingStore {
            inner: inner.clone(),
            interfered: AtomicBool::new(false),
            always: true,
        });
        let mappings = MappingStore::new(store, PATH, 2);

        let err = mappings.insert(record("00000001")).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(!stored_document(&inner).await.contains("00000001"));
    }
}
