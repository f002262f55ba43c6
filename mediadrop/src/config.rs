//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `MEDIADROP_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `MEDIADROP_` override YAML values
//! 3. **GITHUB_TOKEN** - Special case: overrides `store.token` of a github store if set
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `MEDIADROP_UPLOAD__MAX_FILE_SIZE=1048576` sets the `upload.max_file_size` field.
//!
//! ## Example
//!
//! ```yaml
//! port: 3000
//! upload:
//!   max_file_size: 20971520
//!   base_url: https://files.example.com
//! store:
//!   type: github
//!   owner: example
//!   repo: media
//!   branch: main
//! ```
//!
//! ```bash
//! GITHUB_TOKEN=ghp_xxx mediadrop -f config.yaml
//! ```

use std::time::Duration;

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "MEDIADROP_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// All fields have defaults, so an empty file gives a working development server backed by the
/// in-memory store.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Expose Prometheus metrics at `/internal/metrics`
    pub enable_metrics: bool,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
    /// Upload limits and link generation
    pub upload: UploadConfig,
    /// Cross-origin settings for browser clients
    pub cors: CorsConfig,
    /// Where the mapping document lives and how updates retry
    pub mapping: MappingConfig,
    /// Backing object store
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadConfig {
    /// Largest accepted file, in bytes (default: 20 MiB)
    pub max_file_size: u64,
    /// Public base URL of this service; generated links are `{base_url}/{stored filename}`
    pub base_url: Url,
    /// Extension used when the uploaded filename has none
    pub fallback_extension: String,
}

impl UploadConfig {
    /// Public link for a stored filename.
    pub fn public_url(&self, stored_filename: &str) -> String {
        format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), stored_filename)
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: 20 * 1024 * 1024,
            base_url: Url::parse("http://localhost:3000").expect("static URL is valid"),
            fallback_extension: "bin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    /// Origins allowed to call the API. `*` allows any origin.
    pub allowed_origins: Vec<CorsOrigin>,
    /// Whether to allow credentials (cannot be combined with `*`)
    pub allow_credentials: bool,
    /// Preflight cache duration in seconds
    pub max_age: Option<u64>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![CorsOrigin::Wildcard],
            allow_credentials: false,
            max_age: Some(3600),
        }
    }
}

/// CORS origin specification.
///
/// Can be either a wildcard (`*`) to allow all origins, or a specific URL.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CorsOrigin {
    /// Allow all origins (`*`)
    #[serde(deserialize_with = "parse_wildcard")]
    Wildcard,
    /// Specific origin URL (e.g., `https://app.example.com`)
    #[serde(deserialize_with = "parse_url")]
    Url(Url),
}

fn parse_wildcard<'de, D>(deserializer: D) -> Result<(), D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == "*" {
        Ok(())
    } else {
        Err(serde::de::Error::custom("Expected '*'"))
    }
}

fn parse_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Url::parse(&s).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MappingConfig {
    /// Object path of the mapping document in the store
    pub path: String,
    /// How many times an update is attempted when the document changes underneath it
    pub max_attempts: usize,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            path: "mappings.json".to_string(),
            max_attempts: 3,
        }
    }
}

/// Object store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// GitHub repository accessed through the contents API
    Github(GithubConfig),
    /// Process-local store for development; nothing survives a restart
    Memory {
        /// Base URL redirects point at for raw file content
        #[serde(default = "default_memory_raw_url")]
        raw_url: Url,
    },
}

fn default_memory_raw_url() -> Url {
    Url::parse("http://localhost:3000/raw").expect("static URL is valid")
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory {
            raw_url: default_memory_raw_url(),
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct GithubConfig {
    /// Repository owner (user or organization)
    pub owner: String,
    /// Repository name
    pub repo: String,
    /// Branch that uploads are committed to
    #[serde(default = "GithubConfig::default_branch")]
    pub branch: String,
    /// Personal access token with contents write permission
    #[serde(default)]
    pub token: String,
    /// GitHub API root (override for GitHub Enterprise)
    #[serde(default = "GithubConfig::default_api_url")]
    pub api_url: Url,
    /// Base URL serving raw file content. Defaults to
    /// `https://raw.githubusercontent.com/{owner}/{repo}/{branch}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_url: Option<Url>,
    /// Timeout applied to every contents API request
    #[serde(default = "GithubConfig::default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl GithubConfig {
    fn default_branch() -> String {
        "main".to_string()
    }

    fn default_api_url() -> Url {
        Url::parse("https://api.github.com").expect("static URL is valid")
    }

    fn default_request_timeout() -> Duration {
        Duration::from_secs(30)
    }

    /// `{api_url}/repos/{owner}/{repo}/contents`
    pub fn contents_url(&self) -> Url {
        crate::store::join_path(&self.api_url, &format!("repos/{}/{}/contents", self.owner, self.repo))
    }

    pub fn raw_base_url(&self) -> Url {
        match &self.raw_url {
            Some(url) => url.clone(),
            None => {
                let base = Url::parse("https://raw.githubusercontent.com").expect("static URL is valid");
                crate::store::join_path(&base, &format!("{}/{}/{}", self.owner, self.repo, self.branch))
            }
        }
    }
}

// Hand-written so the token never ends up in logs
impl std::fmt::Debug for GithubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubConfig")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("branch", &self.branch)
            .field("token", &if self.token.is_empty() { "<unset>" } else { "<redacted>" })
            .field("api_url", &self.api_url.as_str())
            .field("raw_url", &self.raw_url.as_ref().map(Url::as_str))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            enable_metrics: false,
            enable_otel_export: false,
            upload: UploadConfig::default(),
            cors: CorsConfig::default(),
            mapping: MappingConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// A configuration problem found after the sources were merged.
#[derive(Debug, thiserror::Error)]
#[error("Config validation: {0}")]
pub struct ConfigError(String);

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;
        config.apply_token_env();
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload.max_file_size == 0 {
            return Err(ConfigError("upload.max_file_size must be positive".to_string()));
        }

        let fallback = &self.upload.fallback_extension;
        if fallback.is_empty() || !fallback.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError(format!(
                "upload.fallback_extension must be a non-empty alphanumeric token, got '{fallback}'"
            )));
        }

        if self.mapping.max_attempts == 0 {
            return Err(ConfigError("mapping.max_attempts must be at least 1".to_string()));
        }

        if self.mapping.path.trim_matches('/').is_empty() {
            return Err(ConfigError("mapping.path cannot be empty".to_string()));
        }

        if self.cors.allowed_origins.is_empty() {
            return Err(ConfigError(
                "cors.allowed_origins cannot be empty. Add at least one allowed origin.".to_string(),
            ));
        }

        let has_wildcard = self.cors.allowed_origins.iter().any(|origin| matches!(origin, CorsOrigin::Wildcard));
        if has_wildcard && self.cors.allow_credentials {
            return Err(ConfigError(
                "CORS cannot use wildcard origin '*' with allow_credentials=true. Specify explicit origins.".to_string(),
            ));
        }

        if let StoreConfig::Github(github) = &self.store {
            for (field, value) in [
                ("owner", &github.owner),
                ("repo", &github.repo),
                ("branch", &github.branch),
                ("token", &github.token),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigError(format!(
                        "store.{field} is required for the github store (the token can also come from GITHUB_TOKEN)"
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("MEDIADROP_").ignore(&["CONFIG"]).split("__"))
    }

    /// A non-empty `GITHUB_TOKEN` replaces the token of a github store.
    fn apply_token_env(&mut self) {
        if let StoreConfig::Github(github) = &mut self.store
            && let Ok(token) = std::env::var("GITHUB_TOKEN")
            && !token.trim().is_empty()
        {
            github.token = token;
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
