//! Object store backed by the GitHub repository contents API.
//!
//! Objects are files in a repository branch. Reads are `GET /repos/{owner}/{repo}/contents/{path}`
//! which returns the file base64-encoded along with its blob sha. Writes are `PUT` on the same
//! URL, which commits the new content to the branch. GitHub refuses to update an existing file
//! unless the request carries its current sha, and that refusal is surfaced as
//! [`StoreError::Conflict`].

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};
use url::Url;

use super::{ObjectDescriptor, ObjectStore, Result, StoreError, StoredObject, join_path};
use crate::config::GithubConfig;

const GITHUB_ACCEPT: &str = "application/vnd.github.v3+json";
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

pub struct GithubStore {
    client: Client,
    contents_url: Url,
    raw_url: Url,
    branch: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Debug, Serialize)]
struct WriteRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    content: WrittenContent,
}

#[derive(Debug, Deserialize)]
struct WrittenContent {
    path: String,
    sha: String,
}

impl GithubStore {
    pub fn new(config: &GithubConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            contents_url: config.contents_url(),
            raw_url: config.raw_base_url(),
            branch: config.branch.clone(),
            token: config.token.clone(),
        })
    }

    fn authorization(&self) -> String {
        format!("token {}", self.token)
    }

    /// Read an error response into a [`StoreError`].
    async fn status_error(path: &str, response: reqwest::Response) -> StoreError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(path = %path, status = %status, "Contents API request failed");
        StoreError::Status { status, body }
    }
}

#[async_trait]
impl ObjectStore for GithubStore {
    #[instrument(skip(self), err)]
    async fn fetch_object(&self, path: &str) -> Result<StoredObject> {
        let mut url = join_path(&self.contents_url, path);
        url.query_pairs_mut().append_pair("ref", &self.branch);
        debug!("Fetching object from {}", url);

        let response = self
            .client
            .get(url)
            .header(header::AUTHORIZATION, self.authorization())
            .header(header::ACCEPT, GITHUB_ACCEPT)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(StoreError::NotFound { path: path.to_string() }),
            status if !status.is_success() => return Err(Self::status_error(path, response).await),
            _ => {}
        }

        let body: ContentsResponse = response.json().await.map_err(|e| StoreError::Malformed {
            path: path.to_string(),
            reason: format!("invalid contents response: {e}"),
        })?;

        // Files over 1 MB come back without inline content and `encoding: none`
        let encoded = match (body.content, body.encoding.as_deref()) {
            (Some(content), Some("base64") | None) => content,
            (_, encoding) => {
                return Err(StoreError::Malformed {
                    path: path.to_string(),
                    reason: format!("content not inlined (encoding {encoding:?})"),
                });
            }
        };

        // GitHub wraps the base64 payload at 60 columns
        let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        let content = general_purpose::STANDARD.decode(compact).map_err(|e| StoreError::Malformed {
            path: path.to_string(),
            reason: format!("invalid base64 content: {e}"),
        })?;

        debug!(sha = %body.sha, bytes = content.len(), "Fetched object");
        Ok(StoredObject {
            content: Bytes::from(content),
            sha: body.sha,
        })
    }

    #[instrument(skip(self, content), fields(bytes = content.len()), err)]
    async fn write_object(
        &self,
        path: &str,
        content: Bytes,
        message: &str,
        expected_version: Option<&str>,
    ) -> Result<ObjectDescriptor> {
        let url = join_path(&self.contents_url, path);
        let request = WriteRequest {
            message,
            content: general_purpose::STANDARD.encode(&content),
            branch: &self.branch,
            sha: expected_version,
        };

        let response = self
            .client
            .put(url)
            .header(header::AUTHORIZATION, self.authorization())
            .header(header::ACCEPT, GITHUB_ACCEPT)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Err(StoreError::Conflict { path: path.to_string() });
        }
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            // Creating a file that already exists is rejected with `"sha" wasn't supplied`
            let body = response.text().await.unwrap_or_default();
            if body.contains("sha") {
                return Err(StoreError::Conflict { path: path.to_string() });
            }
            error!(path = %path, status = %status, "Contents API rejected write");
            return Err(StoreError::Status { status, body });
        }
        if !status.is_success() {
            return Err(Self::status_error(path, response).await);
        }

        let body: WriteResponse = response.json().await.map_err(|e| StoreError::Malformed {
            path: path.to_string(),
            reason: format!("invalid write response: {e}"),
        })?;

        debug!(sha = %body.content.sha, "Wrote object");
        Ok(ObjectDescriptor {
            path: body.content.path,
            sha: body.content.sha,
        })
    }

    fn raw_url(&self, path: &str) -> Url {
        join_path(&self.raw_url, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header as header_eq, method, path as path_eq, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> GithubStore {
        crate::install_crypto_provider();
        let config = GithubConfig {
            owner: "octo".to_string(),
            repo: "media".to_string(),
            branch: "main".to_string(),
            token: "test-token".to_string(),
            api_url: Url::parse(&server.uri()).unwrap(),
            raw_url: None,
            request_timeout: Duration::from_secs(5),
        };
        GithubStore::new(&config).expect("Failed to build store")
    }

    #[tokio::test]
    async fn test_fetch_decodes_wrapped_base64() {
        let server = MockServer::start().await;
        // "hello world" split across lines the way GitHub returns it
        Mock::given(method("GET"))
            .and(path_eq("/repos/octo/media/contents/mappings.json"))
            .and(query_param("ref", "main"))
            .and(header_eq("authorization", "token test-token"))
            .and(header_eq("accept", GITHUB_ACCEPT))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sha": "abc123",
                "encoding": "base64",
                "content": "aGVsbG8g\nd29ybGQ=\n"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let object = store_for(&server).fetch_object("mappings.json").await.unwrap();
        assert_eq!(object.content, Bytes::from_static(b"hello world"));
        assert_eq!(object.sha, "abc123");
    }

    #[tokio::test]
    async fn test_fetch_missing_object_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({"message": "Not Found"})))
            .mount(&server)
            .await;

        let err = store_for(&server).fetch_object("mappings.json").await.unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_fetch_server_error_is_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let err = store_for(&server).fetch_object("mappings.json").await.unwrap_err();
        match err {
            StoreError::Status { status, body } => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(body, "rate limited");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_large_file_without_content_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sha": "abc123",
                "encoding": "none",
                "content": ""
            })))
            .mount(&server)
            .await;

        let err = store_for(&server).fetch_object("big.bin").await.unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_write_sends_commit_with_base64_and_version() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path_eq("/repos/octo/media/contents/mappings.json"))
            .and(header_eq("authorization", "token test-token"))
            .and(body_partial_json(serde_json::json!({
                "message": "Update file mappings",
                "content": "e30=",
                "branch": "main",
                "sha": "old-sha"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": {"path": "mappings.json", "sha": "new-sha"},
                "commit": {"sha": "commit-sha"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let descriptor = store_for(&server)
            .write_object("mappings.json", Bytes::from_static(b"{}"), "Update file mappings", Some("old-sha"))
            .await
            .unwrap();

        assert_eq!(descriptor.path, "mappings.json");
        assert_eq!(descriptor.sha, "new-sha");
    }

    #[tokio::test]
    async fn test_create_omits_sha() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path_eq("/repos/octo/media/contents/a1b2c3d4.png"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "content": {"path": "a1b2c3d4.png", "sha": "blob-sha"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        store_for(&server)
            .write_object("a1b2c3d4.png", Bytes::from_static(b"\x89PNG"), "Upload: cat.png -> a1b2c3d4.png", None)
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert!(body.get("sha").is_none());
        assert_eq!(body["content"], "iVBORw==");
    }

    #[tokio::test]
    async fn test_write_conflicts() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path_eq("/repos/octo/media/contents/stale.json"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "message": "stale.json does not match old-sha"
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path_eq("/repos/octo/media/contents/exists.json"))
            .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
                "message": "Invalid request.\n\n\"sha\" wasn't supplied."
            })))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let err = store
            .write_object("stale.json", Bytes::from_static(b"{}"), "msg", Some("old-sha"))
            .await
            .unwrap_err();
        assert!(err.is_conflict(), "unexpected error: {err}");

        let err = store.write_object("exists.json", Bytes::from_static(b"{}"), "msg", None).await.unwrap_err();
        assert!(err.is_conflict(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_write_other_validation_failure_is_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
                "message": "path contains a malformed path component"
            })))
            .mount(&server)
            .await;

        let err = store_for(&server)
            .write_object("bad..path", Bytes::from_static(b"x"), "msg", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Status { status: StatusCode::UNPROCESSABLE_ENTITY, .. }));
    }

    #[tokio::test]
    async fn test_raw_url_defaults_to_raw_githubusercontent() {
        let server = MockServer::start().await;
        let store = store_for(&server);
        assert_eq!(
            store.raw_url("a1b2c3d4.png").as_str(),
            "https://raw.githubusercontent.com/octo/media/main/a1b2c3d4.png"
        );
    }
}
