//! In-memory object store.
//!
//! Holds objects in a map with the same versioning rules as the GitHub store: each write produces
//! a new sha, and updating an existing object requires naming its current sha. Optional latency
//! makes interleavings between concurrent requests reproducible in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use url::Url;

use super::{ObjectDescriptor, ObjectStore, Result, StoreError, StoredObject, join_path};

#[derive(Debug, Clone)]
struct MemoryObject {
    content: Bytes,
    sha: String,
    message: String,
}

#[derive(Debug)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, MemoryObject>>,
    next_version: AtomicU64,
    writes: AtomicUsize,
    raw_url: Url,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new(raw_url: Url) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            writes: AtomicUsize::new(0),
            raw_url,
            latency: None,
        }
    }

    /// Delay every fetch and write by `latency` before touching the map.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Current content of the object at `path`, if any.
    pub fn object(&self, path: &str) -> Option<Bytes> {
        self.objects.lock().get(path).map(|object| object.content.clone())
    }

    /// Commit message of the last write to `path`, if any.
    pub fn last_message(&self, path: &str) -> Option<String> {
        self.objects.lock().get(path).map(|object| object.message.clone())
    }

    /// Number of successful writes since creation.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn fetch_object(&self, path: &str) -> Result<StoredObject> {
        self.simulate_latency().await;
        self.objects
            .lock()
            .get(path)
            .map(|object| StoredObject {
                content: object.content.clone(),
                sha: object.sha.clone(),
            })
            .ok_or_else(|| StoreError::NotFound { path: path.to_string() })
    }

    async fn write_object(
        &self,
        path: &str,
        content: Bytes,
        message: &str,
        expected_version: Option<&str>,
    ) -> Result<ObjectDescriptor> {
        self.simulate_latency().await;
        let mut objects = self.objects.lock();

        let current = objects.get(path).map(|object| object.sha.as_str());
        if current.is_some() && current != expected_version {
            return Err(StoreError::Conflict { path: path.to_string() });
        }

        let sha = format!("v{}", self.next_version.fetch_add(1, Ordering::SeqCst));
        objects.insert(
            path.to_string(),
            MemoryObject {
                content,
                sha: sha.clone(),
                message: message.to_string(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);

        Ok(ObjectDescriptor {
            path: path.to_string(),
            sha,
        })
    }

    fn raw_url(&self, path: &str) -> Url {
        join_path(&self.raw_url, path)
    }
}
