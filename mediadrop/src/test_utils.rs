//! Shared constructors for handler tests.
use std::sync::Arc;

use axum_test::TestServer;

use crate::config::{Config, StoreConfig, UploadConfig};
use crate::mapping::MappingStore;
use crate::store::{MemoryStore, ObjectStore};
use crate::{AppState, build_router};

/// Upload limit used by test configurations
pub const TEST_MAX_FILE_SIZE: u64 = 1024;

pub fn create_test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        enable_metrics: false,
        enable_otel_export: false,
        upload: UploadConfig {
            max_file_size: TEST_MAX_FILE_SIZE,
            ..Default::default()
        },
        store: StoreConfig::Memory {
            raw_url: "http://localhost:3000/raw".parse().unwrap(),
        },
        ..Default::default()
    }
}

/// A server backed by a fresh in-memory store, returned alongside it for inspection.
pub fn create_test_app() -> (TestServer, Arc<MemoryStore>) {
    let StoreConfig::Memory { raw_url } = create_test_config().store else {
        unreachable!("test config uses the memory store");
    };
    let store = Arc::new(MemoryStore::new(raw_url));
    (create_test_app_with_store(store.clone()), store)
}

/// A server over the test configuration using `store` for files and mappings alike.
pub fn create_test_app_with_store(store: Arc<dyn ObjectStore>) -> TestServer {
    let config = create_test_config();
    let mappings = Arc::new(MappingStore::new(
        store.clone(),
        config.mapping.path.clone(),
        config.mapping.max_attempts,
    ));

    let state = AppState::builder().config(config).store(store).mappings(mappings).build();
    let router = build_router(&state).expect("Failed to build router");
    TestServer::new(router.into_make_service()).expect("Failed to create test server")
}
