//! Schema reads and mutations with a per-collection cache.
//!
//! Reads go to the cluster once per collection and are cached until the
//! cache entry is invalidated. Mutations on the same collection are
//! serialized so two concurrent `apply` calls never plan against the same
//! stale snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::connection::ClientHandle;
use crate::error::{ConnectorError, Result};
use crate::metrics::ConnectorMetrics;
use crate::schema::{plan_update, Schema};

/// Remote collection a schema call targets.
#[derive(Debug, Clone, Copy)]
pub struct SchemaTarget<'a> {
    pub client: &'a ClientHandle,
    pub collection: &'a str,
    pub config_set: &'a str,
}

/// Cached schema reader and ordered schema mutator.
pub struct SchemaEvolution {
    cache: Mutex<HashMap<String, Arc<Schema>>>,
    update_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    metrics: Arc<ConnectorMetrics>,
}

impl SchemaEvolution {
    pub fn new(metrics: Arc<ConnectorMetrics>) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            update_locks: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Returns the collection schema, from cache when present.
    ///
    /// Fails with [`ConnectorError::SchemaNotFound`] when the config set or
    /// the collection is missing remotely.
    pub async fn current(&self, target: SchemaTarget<'_>) -> Result<Arc<Schema>> {
        if let Some(schema) = self.cached(target.collection) {
            return Ok(schema);
        }

        let gateway = target.client.gateway()?;
        let config_set_exists = gateway
            .config_set_exists(target.config_set)
            .await
            .map_err(|err| transport("config set lookup", target.collection, &err))?;
        if !config_set_exists {
            return Err(ConnectorError::SchemaNotFound(target.collection.to_string()));
        }
        let collection_exists = gateway
            .collection_exists(target.collection)
            .await
            .map_err(|err| transport("collection lookup", target.collection, &err))?;
        if !collection_exists {
            return Err(ConnectorError::SchemaNotFound(target.collection.to_string()));
        }

        let schema = Arc::new(
            gateway
                .fetch_schema(target.collection)
                .await
                .map_err(|err| transport("schema read", target.collection, &err))?,
        );
        debug!(
            collection = target.collection,
            fields = schema.fields().len(),
            "cached remote schema"
        );
        self.cache_lock()
            .insert(target.collection.to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    /// Diffs `desired` against the current schema and submits the plan as one
    /// batch. Returns `false` without a remote call when nothing changes.
    pub async fn apply(&self, target: SchemaTarget<'_>, desired: &Schema, merge: bool) -> Result<bool> {
        let update_lock = self.update_lock(target.collection);
        let _guard = update_lock.lock().await;

        let current = self.current(target).await?;
        let plan = plan_update(&current, desired, merge);
        if plan.is_empty() {
            debug!(collection = target.collection, "schema already up to date");
            return Ok(false);
        }

        let gateway = target.client.gateway()?;
        let response = match gateway.update_schema(target.collection, &plan).await {
            Ok(response) => response,
            Err(err) => {
                self.metrics.record_schema_update(false);
                return Err(ConnectorError::SchemaUpdate {
                    collection: target.collection.to_string(),
                    status: -1,
                    messages: vec![format!("{err:#}")],
                });
            }
        };
        if !response.is_success() {
            self.metrics.record_schema_update(false);
            warn!(
                collection = target.collection,
                status = response.status,
                errors = ?response.messages(),
                "schema update rejected"
            );
            return Err(ConnectorError::schema_update(target.collection, &response));
        }

        self.metrics.record_schema_update(true);
        let updated = Arc::new(current.applied(&plan));
        self.cache_lock()
            .insert(target.collection.to_string(), updated);
        info!(
            collection = target.collection,
            operations = plan.len(),
            merge,
            "applied schema update"
        );
        Ok(true)
    }

    /// Drops the cached schema of `collection`.
    pub fn invalidate(&self, collection: &str) {
        if self.cache_lock().remove(collection).is_some() {
            debug!(collection, "invalidated cached schema");
        }
    }

    pub fn cached(&self, collection: &str) -> Option<Arc<Schema>> {
        self.cache_lock().get(collection).cloned()
    }

    fn update_lock(&self, collection: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .update_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(collection.to_string()).or_default())
    }

    fn cache_lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Schema>>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn transport(what: &str, collection: &str, err: &anyhow::Error) -> ConnectorError {
    ConnectorError::Connection(format!("{what} for '{collection}' failed: {err:#}"))
}
