//! In-process counters for connection, lifecycle, schema, write and scan
//! activity.
//!
//! Counters are lock-free so they can be bumped on row and scan paths
//! without contention.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Aggregated connector counters.
#[derive(Debug, Default)]
pub struct ConnectorMetrics {
    /// Client handles opened by the connection cache.
    connections_opened: AtomicU64,
    /// Client handles closed after their last table was dropped.
    connections_closed: AtomicU64,
    /// Remote collections created.
    collections_created: AtomicU64,
    /// Remote collections deleted.
    collections_deleted: AtomicU64,
    /// Config sets created from a base template.
    config_sets_created: AtomicU64,
    /// Config sets deleted on drop.
    config_sets_deleted: AtomicU64,
    /// Schema batches accepted by the cluster.
    schema_updates: AtomicU64,
    /// Schema batches rejected by the cluster.
    schema_update_failures: AtomicU64,
    /// Documents sent through add/update requests.
    documents_written: AtomicU64,
    /// Delete requests issued (by id or by filter).
    delete_requests: AtomicU64,
    /// Explicit commits issued.
    commits: AtomicU64,
    /// Scan pages fetched.
    scan_pages: AtomicU64,
    /// Rows decoded by scan cursors.
    scan_rows: AtomicU64,
    /// Page fetches that failed mid-scan.
    scan_failures: AtomicU64,
}

/// Immutable snapshot of [`ConnectorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectorMetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub collections_created: u64,
    pub collections_deleted: u64,
    pub config_sets_created: u64,
    pub config_sets_deleted: u64,
    pub schema_updates: u64,
    pub schema_update_failures: u64,
    pub documents_written: u64,
    pub delete_requests: u64,
    pub commits: u64,
    pub scan_pages: u64,
    pub scan_rows: u64,
    pub scan_failures: u64,
}

impl ConnectorMetrics {
    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_collection_created(&self) {
        self.collections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_collection_deleted(&self) {
        self.collections_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_config_set_created(&self) {
        self.config_sets_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_config_set_deleted(&self) {
        self.config_sets_deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the verdict of one schema batch.
    pub fn record_schema_update(&self, accepted: bool) {
        if accepted {
            self.schema_updates.fetch_add(1, Ordering::Relaxed);
        } else {
            self.schema_update_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_documents_written(&self, documents: u64) {
        self.documents_written
            .fetch_add(documents, Ordering::Relaxed);
    }

    pub fn record_delete_request(&self) {
        self.delete_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one fetched scan page and its row count.
    pub fn record_scan_page(&self, rows: u64) {
        self.scan_pages.fetch_add(1, Ordering::Relaxed);
        self.scan_rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_scan_failure(&self) {
        self.scan_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Captures a point-in-time copy of all counters.
    pub fn snapshot(&self) -> ConnectorMetricsSnapshot {
        ConnectorMetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            collections_created: self.collections_created.load(Ordering::Relaxed),
            collections_deleted: self.collections_deleted.load(Ordering::Relaxed),
            config_sets_created: self.config_sets_created.load(Ordering::Relaxed),
            config_sets_deleted: self.config_sets_deleted.load(Ordering::Relaxed),
            schema_updates: self.schema_updates.load(Ordering::Relaxed),
            schema_update_failures: self.schema_update_failures.load(Ordering::Relaxed),
            documents_written: self.documents_written.load(Ordering::Relaxed),
            delete_requests: self.delete_requests.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            scan_pages: self.scan_pages.load(Ordering::Relaxed),
            scan_rows: self.scan_rows.load(Ordering::Relaxed),
            scan_failures: self.scan_failures.load(Ordering::Relaxed),
        }
    }

    /// Renders counters as `key=value` lines.
    pub fn render_text(&self) -> String {
        let s = self.snapshot();
        format!(
            "connections_opened={}\nconnections_closed={}\ncollections_created={}\ncollections_deleted={}\nconfig_sets_created={}\nconfig_sets_deleted={}\nschema_updates={}\nschema_update_failures={}\ndocuments_written={}\ndelete_requests={}\ncommits={}\nscan_pages={}\nscan_rows={}\nscan_failures={}\n",
            s.connections_opened,
            s.connections_closed,
            s.collections_created,
            s.collections_deleted,
            s.config_sets_created,
            s.config_sets_deleted,
            s.schema_updates,
            s.schema_update_failures,
            s.documents_written,
            s.delete_requests,
            s.commits,
            s.scan_pages,
            s.scan_rows,
            s.scan_failures,
        )
    }
}
