//! Remote object storage.
//!
//! Uploaded bytes and the mapping document both live as objects in a remote store addressed by
//! path. The [`ObjectStore`] trait captures the two operations the service needs, plus the URL the
//! public can fetch an object's raw bytes from:
//!
//! - [`github::GithubStore`]: GitHub's repository contents API. Every write is a commit on the
//!   configured branch.
//! - [`memory::MemoryStore`]: an in-process map with the same versioning rules, for local
//!   development and tests.
//!
//! Every object carries a version token (GitHub calls it the blob `sha`). Writes may name the
//! version they expect to replace; a store refuses the write with [`StoreError::Conflict`] when
//! the object has moved on, which is what lets the mapping store detect concurrent updates.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::config::StoreConfig;

pub mod github;
pub mod memory;

pub use github::GithubStore;
pub use memory::MemoryStore;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors from talking to a remote object store.
///
/// Everything except [`StoreError::NotFound`] and [`StoreError::Conflict`] is a transport failure
/// from the caller's point of view: the operation could not be completed and there is nothing
/// more specific to do about it.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has no object at this path
    #[error("object '{path}' not found")]
    NotFound { path: String },

    /// The object changed since the version the writer based its update on
    #[error("object '{path}' was modified concurrently")]
    Conflict { path: String },

    /// The store answered with a non-success status
    #[error("contents API returned {status}: {body}")]
    Status { status: reqwest::StatusCode, body: String },

    /// The request never got a usable answer (connect, timeout, TLS, body read)
    #[error("request to contents API failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The store answered, but not with something we can interpret
    #[error("unexpected content for '{path}': {reason}")]
    Malformed { path: String, reason: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// An object read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub content: Bytes,
    /// Version token identifying this revision of the object
    pub sha: String,
}

/// What the store reports about an object it just wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub path: String,
    pub sha: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read the object at `path`.
    ///
    /// Fails with [`StoreError::NotFound`] when the object does not exist.
    async fn fetch_object(&self, path: &str) -> Result<StoredObject>;

    /// Create or overwrite the object at `path`.
    ///
    /// `expected_version` is the sha of the revision being replaced, or `None` when creating a new
    /// object. A stale or missing version for an object that already exists fails with
    /// [`StoreError::Conflict`].
    async fn write_object(
        &self,
        path: &str,
        content: Bytes,
        message: &str,
        expected_version: Option<&str>,
    ) -> Result<ObjectDescriptor>;

    /// Public URL serving the raw bytes of the object at `path`.
    fn raw_url(&self, path: &str) -> Url;
}

/// Build the store described by the configuration.
pub fn build_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match config {
        StoreConfig::Github(github) => Ok(Arc::new(GithubStore::new(github)?)),
        StoreConfig::Memory { raw_url } => {
            warn!("Using the in-memory object store: uploads will be lost on restart");
            Ok(Arc::new(MemoryStore::new(raw_url.clone())))
        }
    }
}

/// Append a `/`-separated object path to a base URL, one percent-encoded segment at a time.
///
/// Unlike `Url::join`, this never lets the path replace the base: `//host/x` or `scheme:x` end up
/// as ordinary segments under it.
pub(crate) fn join_path(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().extend(path.split('/'));
    }
    url
}
