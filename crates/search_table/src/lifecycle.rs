//! Table registration and remote collection lifecycle.
//!
//! Each table moves through `Unregistered -> Registered -> CollectionReady
//! -> Dropped`. Transitions of one table are serialized by that table's
//! async mutex; different tables never wait on each other except inside the
//! connection cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::config::{is_valid_name_part, ConnectorConfig, TableConfig};
use crate::connection::{ClientHandle, ConnectionCache};
use crate::cursor::ScanCursor;
use crate::endpoint::Endpoint;
use crate::error::{ConnectorError, Result};
use crate::evolution::{SchemaEvolution, SchemaTarget};
use crate::gateway::{CollectionSpec, GatewayConnector};
use crate::metrics::ConnectorMetrics;
use crate::naming::{config_set_name, remote_collection_name};
use crate::row::ColumnSpec;
use crate::schema::Schema;

/// Lifecycle state of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Unregistered,
    Registered,
    CollectionReady,
    Dropped,
}

/// Resolved registration of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRegistration {
    pub table: String,
    pub endpoint: Endpoint,
    /// Remote collection name, `table` or `qualifier.table`.
    pub collection: String,
    /// Config set owned by the collection.
    pub config_set: String,
    pub shards: u32,
    pub replicas: u32,
    pub config: TableConfig,
}

/// Outcome of [`CollectionManager::define_table`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableDefinition {
    /// The remote collection was created by this call.
    pub collection_created: bool,
    /// A schema batch was submitted and accepted.
    pub schema_applied: bool,
}

struct TableSlot {
    state: TableState,
    registration: Option<TableRegistration>,
    client: Option<ClientHandle>,
    /// Set when a `drop` deleted the collection but failed afterwards.
    collection_deleted: bool,
}

impl TableSlot {
    fn unregistered() -> Self {
        Self {
            state: TableState::Unregistered,
            registration: None,
            client: None,
            collection_deleted: false,
        }
    }

    fn clear(&mut self, state: TableState) {
        self.state = state;
        self.registration = None;
        self.client = None;
        self.collection_deleted = false;
    }
}

/// Snapshot of what a data-path call needs from a registered table.
#[derive(Debug, Clone)]
pub(crate) struct TableContext {
    pub(crate) registration: TableRegistration,
    pub(crate) client: ClientHandle,
}

impl TableContext {
    pub(crate) fn collection(&self) -> &str {
        &self.registration.collection
    }

    pub(crate) fn schema_target(&self) -> SchemaTarget<'_> {
        SchemaTarget {
            client: &self.client,
            collection: &self.registration.collection,
            config_set: &self.registration.config_set,
        }
    }
}

/// Manages index-backed tables against one or more clusters.
///
/// Construct once and share by reference (or `Arc`); the connection cache
/// it holds is explicit state, not a process-wide singleton.
pub struct CollectionManager {
    config: ConnectorConfig,
    connections: Arc<ConnectionCache>,
    schemas: SchemaEvolution,
    tables: Mutex<HashMap<String, Arc<tokio::sync::Mutex<TableSlot>>>>,
    metrics: Arc<ConnectorMetrics>,
}

impl CollectionManager {
    /// Builds a manager with its own connection cache and metrics.
    pub fn new(config: ConnectorConfig, connector: Arc<dyn GatewayConnector>) -> Self {
        let metrics = Arc::new(ConnectorMetrics::default());
        let connections = Arc::new(ConnectionCache::new(connector, Arc::clone(&metrics)));
        Self::with_connections(config, connections, metrics)
    }

    /// Builds a manager over an existing connection cache.
    pub fn with_connections(
        config: ConnectorConfig,
        connections: Arc<ConnectionCache>,
        metrics: Arc<ConnectorMetrics>,
    ) -> Self {
        Self {
            config,
            connections,
            schemas: SchemaEvolution::new(Arc::clone(&metrics)),
            tables: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionCache> {
        &self.connections
    }

    pub fn metrics(&self) -> &Arc<ConnectorMetrics> {
        &self.metrics
    }

    pub(crate) fn schemas(&self) -> &SchemaEvolution {
        &self.schemas
    }

    /// Validates `config`, acquires a client for its endpoint and records the
    /// registration. Nothing is stored when any step fails.
    pub async fn register(&self, table: &str, config: TableConfig) -> Result<()> {
        if !is_valid_name_part(table) {
            return Err(ConnectorError::Configuration(format!(
                "invalid table name '{table}'"
            )));
        }
        config.validate()?;
        let endpoint = Endpoint::parse(&config.endpoint)?;
        if self.has_live_registration(table).await {
            return Err(already_registered(table));
        }

        // The slot is created only once a client is in hand, so failed
        // registrations leave no entry behind.
        let acquired = self
            .connections
            .acquire(&endpoint, &self.config.client_settings())
            .await?;
        let slot = self.slot(table);
        let mut slot = slot.lock().await;
        if is_live(slot.state) {
            self.connections.release(&endpoint).await;
            return Err(already_registered(table));
        }

        let collection = remote_collection_name(table, config.qualifier.as_deref());
        let registration = TableRegistration {
            table: table.to_string(),
            endpoint: endpoint.clone(),
            config_set: config_set_name(&collection, &config.base_config),
            collection,
            shards: count(config.shards),
            replicas: count(config.replicas),
            config,
        };

        info!(
            table,
            collection = %registration.collection,
            endpoint = %endpoint,
            new_client = acquired.created,
            "registered table"
        );
        slot.state = TableState::Registered;
        slot.registration = Some(registration);
        slot.client = Some(acquired.handle);
        Ok(())
    }

    /// Makes sure the remote collection exists. Returns `true` only when
    /// this call created it.
    pub async fn ensure_collection(&self, table: &str) -> Result<bool> {
        let slot = self.existing_slot(table).ok_or_else(|| not_registered(table))?;
        let mut slot = slot.lock().await;
        let (registration, client) = match (&slot.registration, &slot.client) {
            (Some(registration), Some(client)) => (registration.clone(), client.clone()),
            _ => return Err(not_registered(table)),
        };
        let collection = registration.collection.as_str();
        let gateway = client.gateway()?;

        let exists = gateway
            .collection_exists(collection)
            .await
            .map_err(|err| ConnectorError::lifecycle_transport(collection, &err))?;
        if exists {
            debug!(table, collection, "remote collection already present");
            slot.state = TableState::CollectionReady;
            return Ok(false);
        }

        let config_set = registration.config_set.as_str();
        let config_set_exists = gateway
            .config_set_exists(config_set)
            .await
            .map_err(|err| ConnectorError::lifecycle_transport(config_set, &err))?;
        if !config_set_exists {
            let response = gateway
                .create_config_set(config_set, &registration.config.base_config)
                .await
                .map_err(|err| ConnectorError::lifecycle_transport(config_set, &err))?;
            if !response.is_success() {
                warn!(table, config_set, status = response.status, "config set create rejected");
                return Err(ConnectorError::lifecycle(config_set, &response));
            }
            self.metrics.record_config_set_created();
            info!(
                table,
                config_set,
                base = %registration.config.base_config,
                "created config set"
            );
        }

        let spec = CollectionSpec {
            name: collection.to_string(),
            config_set: config_set.to_string(),
            shards: registration.shards,
            replicas: registration.replicas,
        };
        let response = gateway
            .create_collection(&spec)
            .await
            .map_err(|err| ConnectorError::lifecycle_transport(collection, &err))?;
        if !response.is_success() {
            warn!(table, collection, status = response.status, "collection create rejected");
            return Err(ConnectorError::lifecycle(collection, &response));
        }
        self.metrics.record_collection_created();
        info!(
            table,
            collection,
            shards = spec.shards,
            replicas = spec.replicas,
            "created remote collection"
        );
        slot.state = TableState::CollectionReady;
        Ok(true)
    }

    /// Drops a table. Returns `true` only when a remote collection was
    /// deleted by this call.
    pub async fn drop(&self, table: &str) -> Result<bool> {
        let Some(slot) = self.existing_slot(table) else {
            return Ok(false);
        };
        let mut slot = slot.lock().await;
        match slot.state {
            TableState::Unregistered | TableState::Dropped => return Ok(false),
            TableState::Registered => {
                if let Some(registration) = slot.registration.take() {
                    self.connections.release(&registration.endpoint).await;
                }
                slot.clear(TableState::Dropped);
                info!(table, "dropped table without remote collection");
                return Ok(false);
            }
            TableState::CollectionReady => {}
        }

        let (registration, client) = match (&slot.registration, &slot.client) {
            (Some(registration), Some(client)) => (registration.clone(), client.clone()),
            _ => return Err(not_registered(table)),
        };
        let collection = registration.collection.as_str();
        let config_set = registration.config_set.as_str();
        let gateway = client.gateway()?;

        let mut deleted = slot.collection_deleted;
        let exists = gateway
            .collection_exists(collection)
            .await
            .map_err(|err| ConnectorError::lifecycle_transport(collection, &err))?;
        if exists {
            let response = gateway
                .delete_collection(collection)
                .await
                .map_err(|err| ConnectorError::lifecycle_transport(collection, &err))?;
            if !response.is_success() {
                warn!(table, collection, status = response.status, "collection delete rejected");
                return Err(ConnectorError::lifecycle(collection, &response));
            }
            self.metrics.record_collection_deleted();
            self.schemas.invalidate(collection);
            slot.collection_deleted = true;
            deleted = true;
            info!(table, collection, "deleted remote collection");
        }

        let config_set_exists = gateway
            .config_set_exists(config_set)
            .await
            .map_err(|err| ConnectorError::lifecycle_transport(config_set, &err))?;
        if config_set_exists {
            let response = gateway
                .delete_config_set(config_set)
                .await
                .map_err(|err| ConnectorError::lifecycle_transport(config_set, &err))?;
            if !response.is_success() {
                warn!(table, config_set, status = response.status, "config set delete rejected");
                return Err(ConnectorError::lifecycle(config_set, &response));
            }
            self.metrics.record_config_set_deleted();
            info!(table, config_set, "deleted config set");
        }

        self.schemas.invalidate(collection);
        let closed = self.connections.release(&registration.endpoint).await;
        slot.clear(TableState::Dropped);
        info!(table, collection, client_closed = closed, "dropped table");
        Ok(deleted)
    }

    /// Whether the table's remote collection exists. Tables that are not
    /// registered report `false`.
    pub async fn collection_exists(&self, table: &str) -> Result<bool> {
        let Some(context) = self.try_context(table).await else {
            return Ok(false);
        };
        context
            .client
            .gateway()?
            .collection_exists(context.collection())
            .await
            .map_err(|err| {
                ConnectorError::Connection(format!(
                    "collection lookup for '{}' failed: {err:#}",
                    context.collection()
                ))
            })
    }

    pub async fn table_state(&self, table: &str) -> TableState {
        let Some(slot) = self.existing_slot(table) else {
            return TableState::Unregistered;
        };
        let state = slot.lock().await.state;
        state
    }

    pub async fn registration(&self, table: &str) -> Option<TableRegistration> {
        let slot = self.existing_slot(table)?;
        let slot = slot.lock().await;
        slot.registration.clone()
    }

    /// Handles a table-defined event: registers (unless already registered
    /// with the same config), ensures the collection, then installs the
    /// configured field schema.
    pub async fn define_table(&self, table: &str, config: TableConfig) -> Result<TableDefinition> {
        match self.registration(table).await {
            Some(existing) if existing.config == config => {
                debug!(table, "table already registered with identical config");
            }
            Some(_) => {
                return Err(ConnectorError::Configuration(format!(
                    "table '{table}' is already registered with a different configuration"
                )))
            }
            None => self.register(table, config.clone()).await?,
        }

        let collection_created = self.ensure_collection(table).await?;
        let schema_applied = match config.initial_schema()? {
            Some(schema) => self.apply_schema(table, &schema, config.merge_schema).await?,
            None => false,
        };
        Ok(TableDefinition {
            collection_created,
            schema_applied,
        })
    }

    /// Current remote schema of the table, served from cache when possible.
    pub async fn current_schema(&self, table: &str) -> Result<Schema> {
        let context = self.context(table).await?;
        let schema = self.schemas.current(context.schema_target()).await?;
        Ok(schema.as_ref().clone())
    }

    /// Brings the remote schema in line with `schema`; see
    /// [`plan_update`](crate::schema::plan_update) for the merge/replace rules.
    pub async fn apply_schema(&self, table: &str, schema: &Schema, merge: bool) -> Result<bool> {
        let context = self.context(table).await?;
        self.schemas
            .apply(context.schema_target(), schema, merge)
            .await
    }

    /// Forgets the cached schema so the next read goes to the cluster.
    pub async fn invalidate_schema(&self, table: &str) {
        if let Some(registration) = self.registration(table).await {
            self.schemas.invalidate(&registration.collection);
        }
    }

    /// Opens a lazy cursor over documents matching `filter`.
    pub async fn scan(
        &self,
        table: &str,
        filter: &str,
        columns: Vec<ColumnSpec>,
    ) -> Result<ScanCursor> {
        let context = self.context(table).await?;
        Ok(ScanCursor::new(
            context.client,
            context.registration.collection,
            filter,
            columns,
            self.config.page_size,
            self.config.max_refills_per_poll,
            Arc::clone(&self.metrics),
        ))
    }

    /// Registration and client of a registered table.
    pub(crate) async fn context(&self, table: &str) -> Result<TableContext> {
        self.try_context(table)
            .await
            .ok_or_else(|| not_registered(table))
    }

    async fn has_live_registration(&self, table: &str) -> bool {
        let Some(slot) = self.existing_slot(table) else {
            return false;
        };
        let state = slot.lock().await.state;
        is_live(state)
    }

    async fn try_context(&self, table: &str) -> Option<TableContext> {
        let slot = self.existing_slot(table)?;
        let slot = slot.lock().await;
        match (&slot.registration, &slot.client) {
            (Some(registration), Some(client)) => Some(TableContext {
                registration: registration.clone(),
                client: client.clone(),
            }),
            _ => None,
        }
    }

    fn slot(&self, table: &str) -> Arc<tokio::sync::Mutex<TableSlot>> {
        let mut tables = self
            .tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            tables
                .entry(table.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(TableSlot::unregistered()))),
        )
    }

    fn existing_slot(&self, table: &str) -> Option<Arc<tokio::sync::Mutex<TableSlot>>> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(table)
            .cloned()
    }
}

fn is_live(state: TableState) -> bool {
    matches!(state, TableState::Registered | TableState::CollectionReady)
}

fn already_registered(table: &str) -> ConnectorError {
    ConnectorError::Configuration(format!("table '{table}' is already registered"))
}

fn not_registered(table: &str) -> ConnectorError {
    ConnectorError::Configuration(format!("table '{table}' is not registered"))
}

// Range checked by `TableConfig::validate`.
fn count(value: i64) -> u32 {
    u32::try_from(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::CollectionManager;
    use crate::config::{ConnectorConfig, TableConfig};
    use crate::memory::{Fault, MemoryIndexCluster, DEFAULT_TEMPLATE};

    fn known_tables(manager: &CollectionManager) -> usize {
        manager
            .tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    #[tokio::test]
    async fn failed_registrations_leave_no_table_entry() {
        let cluster = MemoryIndexCluster::new();
        let manager = CollectionManager::new(ConnectorConfig::default(), Arc::new(cluster.clone()));
        let config = TableConfig::new("search-1", DEFAULT_TEMPLATE);

        assert!(manager.register("bad.name", config.clone()).await.is_err());
        assert!(manager
            .register("orders", TableConfig::new("ftp://search-1", DEFAULT_TEMPLATE))
            .await
            .is_err());
        cluster.inject(Fault::Connect);
        assert!(manager.register("orders", config.clone()).await.is_err());
        assert_eq!(known_tables(&manager), 0);

        manager.register("orders", config.clone()).await.unwrap();
        assert!(manager.register("orders", config).await.is_err());
        assert_eq!(known_tables(&manager), 1);
        assert_eq!(
            manager
                .connections()
                .ref_count(&crate::endpoint::Endpoint::parse("search-1").unwrap())
                .await,
            1
        );
    }
}
