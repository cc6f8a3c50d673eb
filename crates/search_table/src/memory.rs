//! In-process index cluster.
//!
//! `MemoryIndexCluster` implements both [`GatewayConnector`] and, through the
//! gateways it hands out, [`IndexGateway`]. It keeps collections, config sets
//! and managed schemas in memory, buffers writes until commit (unless
//! auto-commit is on), evaluates `*:*` and `field:value [AND ...]` filters,
//! and records every call so tests can assert on remote traffic. One-shot
//! [`Fault`]s let callers simulate cluster rejections and transport failures.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::endpoint::Endpoint;
use crate::gateway::{
    ClientSettings, CollectionSpec, Document, GatewayConnector, IndexGateway, QueryPage,
    QueryRequest, RemoteErrorDetail, RemoteResponse,
};
use crate::schema::{FieldDescriptor, FieldType, Schema, SchemaOperation, VERSION_FIELD};

/// Template config set every fresh cluster carries.
pub const DEFAULT_TEMPLATE: &str = "_default";

/// One-shot failure consumed by the next matching call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Connector refuses the next connection.
    Connect,
    /// Cluster rejects the next collection create with this status.
    CreateCollection(i32),
    /// Cluster rejects the next config-set create with this status.
    CreateConfigSet(i32),
    /// Cluster rejects the next collection delete with this status.
    DeleteCollection(i32),
    /// Cluster rejects the next config-set delete with this status.
    DeleteConfigSet(i32),
    /// Cluster rejects the next schema batch with this status.
    UpdateSchema(i32),
    /// Transport failure on the next query issued at this offset.
    QueryAtOffset(usize),
}

/// Call counters of a [`MemoryIndexCluster`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryClusterStats {
    pub connects: u64,
    pub closes: u64,
    pub collection_creates: u64,
    pub collection_deletes: u64,
    pub config_set_creates: u64,
    pub config_set_deletes: u64,
    pub schema_updates: u64,
    pub add_requests: u64,
    pub delete_requests: u64,
    pub commits: u64,
    /// `(collection, offset, rows)` of every query, in call order.
    pub queries: Vec<(String, usize, usize)>,
}

impl MemoryClusterStats {
    /// Requests that changed documents.
    pub fn write_requests(&self) -> u64 {
        self.add_requests + self.delete_requests
    }

    /// Offsets of every query against `collection`.
    pub fn query_offsets(&self, collection: &str) -> Vec<usize> {
        self.queries
            .iter()
            .filter(|(name, _, _)| name == collection)
            .map(|(_, offset, _)| *offset)
            .collect()
    }
}

#[derive(Debug)]
enum PendingWrite {
    Add(Document),
    DeleteIds(Vec<String>),
    DeleteQuery(String),
}

#[derive(Debug)]
struct MemoryCollection {
    config_set: String,
    shards: u32,
    replicas: u32,
    docs: BTreeMap<String, Document>,
    pending: Vec<PendingWrite>,
    next_version: i64,
}

#[derive(Debug, Default)]
struct ClusterState {
    collections: BTreeMap<String, MemoryCollection>,
    config_sets: BTreeMap<String, Schema>,
    templates: BTreeSet<String>,
    faults: Vec<Fault>,
    stats: MemoryClusterStats,
}

impl ClusterState {
    fn take_fault(&mut self, matches: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let idx = self.faults.iter().position(matches)?;
        Some(self.faults.remove(idx))
    }

    fn collection(&self, name: &str) -> Result<&MemoryCollection> {
        self.collections
            .get(name)
            .ok_or_else(|| anyhow!("Could not find collection : {name}"))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut MemoryCollection> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| anyhow!("Could not find collection : {name}"))
    }

    fn unique_key_of(&self, collection: &MemoryCollection) -> String {
        self.config_sets
            .get(&collection.config_set)
            .map(|schema| schema.unique_key().to_string())
            .unwrap_or_else(|| "id".to_string())
    }
}

/// In-memory cluster shared by every gateway it opens.
#[derive(Clone)]
pub struct MemoryIndexCluster {
    state: Arc<Mutex<ClusterState>>,
    auto_commit: bool,
    connect_delay: Duration,
}

impl Default for MemoryIndexCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIndexCluster {
    /// Cluster with the `_default` template and explicit commits.
    pub fn new() -> Self {
        let mut state = ClusterState::default();
        state.templates.insert(DEFAULT_TEMPLATE.to_string());
        Self {
            state: Arc::new(Mutex::new(state)),
            auto_commit: false,
            connect_delay: Duration::ZERO,
        }
    }

    /// Makes every write visible without an explicit commit.
    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    /// Delays every connect, widening race windows in tests.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn add_template(&self, name: &str) {
        self.lock().templates.insert(name.to_string());
    }

    /// Queues a one-shot fault.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    pub fn stats(&self) -> MemoryClusterStats {
        self.lock().stats.clone()
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.lock().collections.contains_key(name)
    }

    pub fn has_config_set(&self, name: &str) -> bool {
        self.lock().config_sets.contains_key(name)
    }

    /// Shard and replica counts a collection was created with.
    pub fn collection_layout(&self, name: &str) -> Option<(u32, u32)> {
        self.lock()
            .collections
            .get(name)
            .map(|c| (c.shards, c.replicas))
    }

    /// Committed document count of a collection.
    pub fn committed_len(&self, name: &str) -> usize {
        self.lock()
            .collections
            .get(name)
            .map(|c| c.docs.len())
            .unwrap_or(0)
    }

    /// Changes a config-set schema behind the connector's back, as another
    /// process sharing the cluster would.
    pub fn external_schema_update(&self, config_set: &str, operations: &[SchemaOperation]) {
        let mut state = self.lock();
        if let Some(schema) = state.config_sets.get_mut(config_set) {
            *schema = schema.applied(operations);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl GatewayConnector for MemoryIndexCluster {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _settings: &ClientSettings,
    ) -> Result<Arc<dyn IndexGateway>> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        let mut state = self.lock();
        if state.take_fault(|f| *f == Fault::Connect).is_some() {
            return Err(anyhow!("connection refused by {endpoint}"));
        }
        state.stats.connects += 1;
        Ok(Arc::new(MemoryGateway {
            cluster: self.clone(),
        }))
    }
}

/// Gateway view onto a [`MemoryIndexCluster`].
pub struct MemoryGateway {
    cluster: MemoryIndexCluster,
}

impl MemoryGateway {
    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.cluster.lock()
    }

    fn record_write(&self, collection: &str, write: PendingWrite) -> Result<RemoteResponse> {
        let mut state = self.lock();
        let auto_commit = self.cluster.auto_commit;
        let unique_key = {
            let target = state.collection(collection)?;
            state.unique_key_of(target)
        };
        let target = state.collection_mut(collection)?;
        target.pending.push(write);
        if auto_commit {
            apply_pending(target, &unique_key);
        }
        Ok(RemoteResponse::ok())
    }
}

#[async_trait]
impl IndexGateway for MemoryGateway {
    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        Ok(self.lock().collections.contains_key(collection))
    }

    async fn create_collection(&self, spec: &CollectionSpec) -> Result<RemoteResponse> {
        let mut state = self.lock();
        state.stats.collection_creates += 1;
        if let Some(Fault::CreateCollection(status)) =
            state.take_fault(|f| matches!(f, Fault::CreateCollection(_)))
        {
            return Ok(RemoteResponse::failure(status, "collection creation rejected"));
        }
        if state.collections.contains_key(&spec.name) {
            return Ok(RemoteResponse::failure(
                400,
                format!("collection already exists: {}", spec.name),
            ));
        }
        if !state.config_sets.contains_key(&spec.config_set) {
            return Ok(RemoteResponse::failure(
                400,
                format!("Can not find the specified config set: {}", spec.config_set),
            ));
        }
        if spec.shards == 0 {
            return Ok(RemoteResponse::failure(
                400,
                "numShards must be > 0".to_string(),
            ));
        }
        state.collections.insert(
            spec.name.clone(),
            MemoryCollection {
                config_set: spec.config_set.clone(),
                shards: spec.shards,
                replicas: spec.replicas,
                docs: BTreeMap::new(),
                pending: Vec::new(),
                next_version: 1,
            },
        );
        Ok(RemoteResponse::ok())
    }

    async fn delete_collection(&self, collection: &str) -> Result<RemoteResponse> {
        let mut state = self.lock();
        state.stats.collection_deletes += 1;
        if let Some(Fault::DeleteCollection(status)) =
            state.take_fault(|f| matches!(f, Fault::DeleteCollection(_)))
        {
            return Ok(RemoteResponse::failure(status, "collection deletion rejected"));
        }
        match state.collections.remove(collection) {
            Some(_) => Ok(RemoteResponse::ok()),
            None => Ok(RemoteResponse::failure(
                404,
                format!("Could not find collection : {collection}"),
            )),
        }
    }

    async fn config_set_exists(&self, config_set: &str) -> Result<bool> {
        Ok(self.lock().config_sets.contains_key(config_set))
    }

    async fn create_config_set(&self, config_set: &str, base: &str) -> Result<RemoteResponse> {
        let mut state = self.lock();
        state.stats.config_set_creates += 1;
        if let Some(Fault::CreateConfigSet(status)) =
            state.take_fault(|f| matches!(f, Fault::CreateConfigSet(_)))
        {
            return Ok(RemoteResponse::failure(status, "config set creation rejected"));
        }
        if state.config_sets.contains_key(config_set) {
            return Ok(RemoteResponse::failure(
                400,
                format!("ConfigSet already exists: {config_set}"),
            ));
        }
        let schema = if state.templates.contains(base) {
            template_schema()
        } else if let Some(existing) = state.config_sets.get(base) {
            existing.clone()
        } else {
            return Ok(RemoteResponse::failure(
                400,
                format!("Base ConfigSet does not exist: {base}"),
            ));
        };
        state.config_sets.insert(config_set.to_string(), schema);
        Ok(RemoteResponse::ok())
    }

    async fn delete_config_set(&self, config_set: &str) -> Result<RemoteResponse> {
        let mut state = self.lock();
        state.stats.config_set_deletes += 1;
        if let Some(Fault::DeleteConfigSet(status)) =
            state.take_fault(|f| matches!(f, Fault::DeleteConfigSet(_)))
        {
            return Ok(RemoteResponse::failure(status, "config set deletion rejected"));
        }
        if state
            .collections
            .values()
            .any(|c| c.config_set == config_set)
        {
            return Ok(RemoteResponse::failure(
                400,
                format!("Can not delete ConfigSet as it is currently being used by a collection: {config_set}"),
            ));
        }
        match state.config_sets.remove(config_set) {
            Some(_) => Ok(RemoteResponse::ok()),
            None => Ok(RemoteResponse::failure(
                400,
                format!("ConfigSet does not exist to delete: {config_set}"),
            )),
        }
    }

    async fn fetch_schema(&self, collection: &str) -> Result<Schema> {
        let state = self.lock();
        let target = state.collection(collection)?;
        state
            .config_sets
            .get(&target.config_set)
            .cloned()
            .ok_or_else(|| anyhow!("config set {} not found", target.config_set))
    }

    async fn update_schema(
        &self,
        collection: &str,
        operations: &[SchemaOperation],
    ) -> Result<RemoteResponse> {
        let mut state = self.lock();
        state.stats.schema_updates += 1;
        if let Some(Fault::UpdateSchema(status)) =
            state.take_fault(|f| matches!(f, Fault::UpdateSchema(_)))
        {
            return Ok(RemoteResponse::failure(status, "schema update rejected"));
        }
        let config_set = state.collection(collection)?.config_set.clone();
        let current = state
            .config_sets
            .get(&config_set)
            .cloned()
            .ok_or_else(|| anyhow!("config set {config_set} not found"))?;

        let mut next = current.clone();
        let mut errors = Vec::new();
        for operation in operations {
            let name = operation.field_name();
            match operation {
                SchemaOperation::AddField(_) if next.contains(name) => {
                    errors.push(format!("Field '{name}' already exists."));
                }
                SchemaOperation::ReplaceField(_) if !next.contains(name) => errors.push(format!(
                    "The field '{name}' is not present in this schema, and so cannot be replaced"
                )),
                SchemaOperation::DeleteField(_) if !next.contains(name) => {
                    errors.push(format!("The field '{name}' is not present in this schema, and so cannot be deleted"));
                }
                SchemaOperation::DeleteField(_) if next.is_protected(name) => {
                    errors.push(format!("Can't delete '{name}' because it's referred to by the schema"));
                }
                _ => next = next.applied(std::slice::from_ref(operation)),
            }
        }
        if !errors.is_empty() {
            return Ok(RemoteResponse {
                status: 400,
                errors: errors.into_iter().map(RemoteErrorDetail::new).collect(),
            });
        }
        state.config_sets.insert(config_set, next);
        Ok(RemoteResponse::ok())
    }

    async fn add_documents(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<RemoteResponse> {
        self.lock().stats.add_requests += 1;
        let unique_key = {
            let state = self.lock();
            let target = state.collection(collection)?;
            state.unique_key_of(target)
        };
        if let Some(doc) = documents.iter().find(|d| document_id(d, &unique_key).is_none()) {
            return Ok(RemoteResponse::failure(
                400,
                format!("Document is missing mandatory uniqueKey field: {unique_key} ({doc:?})"),
            ));
        }
        for document in documents {
            self.record_write(collection, PendingWrite::Add(document))?;
        }
        Ok(RemoteResponse::ok())
    }

    async fn delete_by_ids(&self, collection: &str, ids: &[String]) -> Result<RemoteResponse> {
        self.lock().stats.delete_requests += 1;
        self.record_write(collection, PendingWrite::DeleteIds(ids.to_vec()))
    }

    async fn delete_by_query(&self, collection: &str, filter: &str) -> Result<RemoteResponse> {
        self.lock().stats.delete_requests += 1;
        parse_filter(filter)?;
        self.record_write(collection, PendingWrite::DeleteQuery(filter.to_string()))
    }

    async fn commit(&self, collection: &str) -> Result<RemoteResponse> {
        let mut state = self.lock();
        state.stats.commits += 1;
        let unique_key = {
            let target = state.collection(collection)?;
            state.unique_key_of(target)
        };
        apply_pending(state.collection_mut(collection)?, &unique_key);
        Ok(RemoteResponse::ok())
    }

    async fn query(&self, collection: &str, request: &QueryRequest) -> Result<QueryPage> {
        let mut state = self.lock();
        state
            .stats
            .queries
            .push((collection.to_string(), request.offset, request.rows));
        if state
            .take_fault(|f| *f == Fault::QueryAtOffset(request.offset))
            .is_some()
        {
            return Err(anyhow!(
                "query to {collection} at offset {} failed: connection reset",
                request.offset
            ));
        }
        let clauses = parse_filter(&request.filter)?;
        let target = state.collection(collection)?;
        let matches = target
            .docs
            .values()
            .filter(|doc| matches_all(doc, &clauses))
            .collect::<Vec<_>>();
        let docs = matches
            .iter()
            .skip(request.offset)
            .take(request.rows)
            .map(|doc| project(doc, &request.fields))
            .collect();
        Ok(QueryPage {
            num_found: matches.len() as u64,
            docs,
        })
    }

    async fn close(&self) {
        self.lock().stats.closes += 1;
    }
}

fn template_schema() -> Schema {
    Schema::with_fields(
        "id",
        [
            FieldDescriptor::new("id", FieldType::String),
            FieldDescriptor::new(VERSION_FIELD, FieldType::Long),
        ],
    )
}

fn apply_pending(collection: &mut MemoryCollection, unique_key: &str) {
    for write in std::mem::take(&mut collection.pending) {
        match write {
            PendingWrite::Add(document) => {
                let Some(id) = document_id(&document, unique_key) else {
                    continue;
                };
                let version = collection.next_version;
                collection.next_version += 1;
                let partial = document.values().any(is_set_instruction);
                let entry = collection.docs.entry(id).or_default();
                if !partial {
                    entry.clear();
                }
                for (field, value) in document {
                    let value = match value {
                        JsonValue::Object(mut op) if op.contains_key("set") => {
                            op.remove("set").unwrap_or(JsonValue::Null)
                        }
                        other => other,
                    };
                    if value.is_null() {
                        entry.remove(&field);
                    } else {
                        entry.insert(field, value);
                    }
                }
                entry.insert(VERSION_FIELD.to_string(), JsonValue::from(version));
            }
            PendingWrite::DeleteIds(ids) => {
                for id in ids {
                    collection.docs.remove(&id);
                }
            }
            PendingWrite::DeleteQuery(filter) => {
                if let Ok(clauses) = parse_filter(&filter) {
                    collection.docs.retain(|_, doc| !matches_all(doc, &clauses));
                }
            }
        }
    }
}

fn is_set_instruction(value: &JsonValue) -> bool {
    value
        .as_object()
        .map(|op| op.len() == 1 && op.contains_key("set"))
        .unwrap_or(false)
}

fn document_id(document: &Document, unique_key: &str) -> Option<String> {
    match document.get(unique_key)? {
        JsonValue::String(id) => Some(id.clone()),
        JsonValue::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// `None` matches every document (`*:*`); otherwise all clauses must hold.
type Clauses = Option<Vec<(String, String)>>;

fn parse_filter(filter: &str) -> Result<Clauses> {
    let filter = filter.trim();
    if filter.is_empty() || filter == "*:*" {
        return Ok(None);
    }
    let mut clauses = Vec::new();
    for term in filter.split(" AND ") {
        let term = term.trim().trim_start_matches('(').trim_end_matches(')');
        let (field, value) = term
            .split_once(':')
            .ok_or_else(|| anyhow!("undefined field in query: {term}"))?;
        clauses.push((
            field.trim().to_string(),
            value.trim().trim_matches('"').to_string(),
        ));
    }
    Ok(Some(clauses))
}

fn matches_all(document: &Document, clauses: &Clauses) -> bool {
    let Some(clauses) = clauses else {
        return true;
    };
    clauses.iter().all(|(field, expected)| {
        let Some(value) = document.get(field) else {
            return false;
        };
        if expected == "*" {
            return true;
        }
        match value {
            JsonValue::Array(items) => items.iter().any(|item| scalar_text(item) == *expected),
            other => scalar_text(other) == *expected,
        }
    })
}

fn scalar_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn project(document: &Document, fields: &[String]) -> Document {
    if fields.is_empty() {
        return document.clone();
    }
    document
        .iter()
        .filter(|(name, _)| fields.iter().any(|f| f == *name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{matches_all, parse_filter};
    use crate::gateway::Document;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn filters_match_scalars_arrays_and_presence() {
        let document = doc(json!({"id": "1", "qty": 5, "tags": ["a", "b"]}));
        assert!(matches_all(&document, &parse_filter("*:*").unwrap()));
        assert!(matches_all(&document, &parse_filter("qty:5").unwrap()));
        assert!(matches_all(&document, &parse_filter("tags:b AND id:\"1\"").unwrap()));
        assert!(matches_all(&document, &parse_filter("qty:*").unwrap()));
        assert!(!matches_all(&document, &parse_filter("price:*").unwrap()));
        assert!(!matches_all(&document, &parse_filter("qty:6").unwrap()));
    }

    #[test]
    fn filter_without_field_is_rejected() {
        assert!(parse_filter("orders").is_err());
    }
}
