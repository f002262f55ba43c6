//! # mediadrop: short links for files kept in a GitHub repository
//!
//! `mediadrop` accepts file uploads over HTTP, commits each file into a GitHub repository through
//! the contents API and hands back a short link. Requests for the link are redirected to the raw
//! content of the committed file, so the repository does the serving.
//!
//! ## Request flow
//!
//! An upload (`POST /api/upload`) is streamed into memory up to the configured size limit, given a
//! random 8-character identifier and written to the store as `{id}.{extension}`. Its metadata is
//! then added to the mapping document, a single JSON object in the same repository keyed by
//! identifier. Fetching `/{id}.{extension}` looks the identifier up in that document and answers
//! with `302 Found` pointing at the raw file. `/api/info/{id}` returns the stored metadata.
//!
//! ## Components
//!
//! - [`store`]: the [`store::ObjectStore`] trait with the GitHub and in-memory backends
//! - [`mapping`]: the mapping document and the [`mapping::MappingStore`] that serializes updates to it
//! - [`api`]: axum handlers and response models
//! - [`config`]: YAML + environment configuration
//! - [`telemetry`]: tracing setup with optional OTLP export
//!
//! ## Quick start
//!
//! ```no_run
//! use clap::Parser;
//! use mediadrop::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     mediadrop::install_crypto_provider();
//!
//!     let args = mediadrop::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     mediadrop::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     Application::new(config)?
//!         .serve(async {
//!             tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!         })
//!         .await
//! }
//! ```
pub mod api;
pub mod config;
pub mod errors;
pub mod ids;
pub mod mapping;
mod openapi;
pub mod records;
pub mod store;
pub mod telemetry;

#[cfg(test)]
mod test_utils;

use crate::config::CorsOrigin;
use crate::mapping::MappingStore;
use crate::openapi::ApiDoc;
use crate::store::ObjectStore;
use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    http::{self, HeaderValue},
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
pub use config::Config;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

/// Room for multipart boundaries and part headers on top of the file itself
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Install the process-wide rustls crypto provider used by the HTTP client.
///
/// Safe to call more than once; later calls leave the installed provider in place.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Shared state handed to every handler.
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .store(store.clone())
///     .mappings(Arc::new(MappingStore::new(store, "mappings.json", 3)))
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn ObjectStore>,
    pub mappings: Arc<MappingStore>,
}

/// Create CORS layer from configuration
///
/// A wildcard anywhere in the list allows every origin.
fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let allowed = &config.cors.allowed_origins;
    let origins = if allowed.iter().any(|origin| matches!(origin, CorsOrigin::Wildcard)) {
        AllowOrigin::any()
    } else {
        let mut values = Vec::new();
        for origin in allowed {
            if let CorsOrigin::Url(url) = origin {
                values.push(url.as_str().trim_end_matches('/').parse::<HeaderValue>()?);
            }
        }
        AllowOrigin::list(values)
    };

    let mut cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([http::Method::GET, http::Method::POST])
        .allow_credentials(config.cors.allow_credentials)
        .expose_headers(vec![http::header::LOCATION]);

    if let Some(max_age) = config.cors.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the router with every endpoint and the middleware stack.
///
/// Fails if the CORS configuration cannot be turned into header values.
#[instrument(skip_all)]
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    let body_limit = usize::try_from(state.config.upload.max_file_size)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    let upload_router = Router::new()
        .route("/api/upload", post(api::handlers::files::upload_file))
        .layer(DefaultBodyLimit::max(body_limit));

    let router = Router::new()
        .merge(upload_router)
        .route("/api/info/{id}", get(api::handlers::files::get_file_info))
        .route("/health", get(api::handlers::health::health))
        // Catch-all for short links; the fixed routes above take precedence
        .route("/{filename}", get(api::handlers::files::redirect_to_file))
        .with_state(state.clone())
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()));

    let mut router = router.layer(create_cors_layer(&state.config)?);

    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

pub struct Application {
    router: Router,
    config: Config,
}

impl Application {
    /// Create the store, mapping store and router described by `config`.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting mediadrop with configuration: {:#?}", config);

        let store = store::build_store(&config.store)?;
        let mappings = Arc::new(MappingStore::new(
            store.clone(),
            config.mapping.path.clone(),
            config.mapping.max_attempts,
        ));

        let app_state = AppState::builder()
            .config(config.clone())
            .store(store)
            .mappings(mappings)
            .build();
        let router = build_router(&app_state)?;

        Ok(Self { router, config })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server")
    }

    /// Serve until `shutdown` resolves, then flush telemetry.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "mediadrop listening on http://{}, links point at {}",
            bind_addr, self.config.upload.base_url
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        telemetry::shutdown_telemetry();
        Ok(())
    }
}
