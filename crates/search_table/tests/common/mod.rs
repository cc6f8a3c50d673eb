//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use search_table::memory::DEFAULT_TEMPLATE;
use search_table::{CollectionManager, ConnectorConfig, Document, MemoryIndexCluster, TableConfig};
use tracing_subscriber::EnvFilter;

/// Endpoint every test table points at unless it says otherwise.
pub const ENDPOINT: &str = "http://search-1:8983/solr";

/// In-memory cluster plus a manager wired to it.
pub struct TestHarness {
    pub cluster: MemoryIndexCluster,
    pub manager: Arc<CollectionManager>,
}

impl TestHarness {
    pub fn start() -> Self {
        Self::with(ConnectorConfig::default(), MemoryIndexCluster::new())
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self::with(
            ConnectorConfig::default().with_page_size(page_size),
            MemoryIndexCluster::new(),
        )
    }

    pub fn with(config: ConnectorConfig, cluster: MemoryIndexCluster) -> Self {
        init_tracing();
        let manager = Arc::new(CollectionManager::new(config, Arc::new(cluster.clone())));
        Self { cluster, manager }
    }
}

/// Installs a test-friendly subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn table_config() -> TableConfig {
    TableConfig::new(ENDPOINT, DEFAULT_TEMPLATE)
}

pub fn doc(value: serde_json::Value) -> Document {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// `count` documents with ids `0..count` and a `qty` field.
pub fn numbered_docs(count: usize) -> Vec<Document> {
    (0..count)
        .map(|i| doc(serde_json::json!({ "id": format!("{i}"), "qty": i })))
        .collect()
}
