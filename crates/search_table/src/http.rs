//! HTTP gateway for Solr-compatible clusters.
//!
//! Requests go to the first host of the endpoint. Every call is bounded by
//! the client request timeout; responses are parsed into [`RemoteResponse`]
//! right here and nowhere else.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::gateway::{
    ClientSettings, CollectionSpec, Document, GatewayConnector, IndexGateway, QueryPage,
    QueryRequest, RemoteResponse,
};
use crate::schema::{encode_operation_batch, FieldDescriptor, Schema, SchemaOperation};

/// Opens [`HttpIndexGateway`]s, optionally probing the cluster first.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    probe: bool,
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self { probe: true }
    }
}

impl HttpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip the system-info probe on connect.
    pub fn without_probe(mut self) -> Self {
        self.probe = false;
        self
    }
}

#[async_trait]
impl GatewayConnector for HttpConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        settings: &ClientSettings,
    ) -> Result<Arc<dyn IndexGateway>> {
        let gateway = HttpIndexGateway::new(endpoint, settings)?;
        if self.probe {
            gateway.probe().await?;
        }
        Ok(Arc::new(gateway))
    }
}

/// Gateway speaking the collections, configs, schema, update and select
/// HTTP APIs.
#[derive(Debug, Clone)]
pub struct HttpIndexGateway {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpIndexGateway {
    pub fn new(endpoint: &Endpoint, settings: &ClientSettings) -> Result<Self> {
        let timeout = settings.request_timeout.max(Duration::from_millis(1));
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            base_url: endpoint.primary_base_url(),
            timeout,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn probe(&self) -> Result<()> {
        let request = self
            .client
            .get(self.url("admin/info/system"))
            .query(&[("wt", "json")]);
        self.read("probe", request).await.map(|_| ())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn collection_url(&self, collection: &str, path: &str) -> String {
        format!("{}/{collection}/{path}", self.base_url)
    }

    /// Sends `request` and returns HTTP status plus JSON body.
    async fn send(&self, op: &str, request: reqwest::RequestBuilder) -> Result<(u16, JsonValue)> {
        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| anyhow!("{op} request timed out for {}", self.base_url))?
            .map_err(|err| anyhow!("{op} request failed for {}: {err}", self.base_url))?;
        let status = response.status().as_u16();
        let text = tokio::time::timeout(self.timeout, response.text())
            .await
            .map_err(|_| anyhow!("{op} response timed out for {}", self.base_url))?
            .map_err(|err| anyhow!("{op} response read failed for {}: {err}", self.base_url))?;
        debug!(op, status, base_url = %self.base_url, "cluster http response");
        Ok((status, parse_body(status, &text)?))
    }

    /// Sends a mutating request and returns the parsed verdict.
    async fn verdict(&self, op: &str, request: reqwest::RequestBuilder) -> Result<RemoteResponse> {
        let (status, body) = self.send(op, request).await?;
        Ok(verdict_from(status, &body))
    }

    /// Sends a read and fails unless the cluster reports success.
    async fn read(&self, op: &str, request: reqwest::RequestBuilder) -> Result<JsonValue> {
        let (status, body) = self.send(op, request).await?;
        let response = verdict_from(status, &body);
        if !response.is_success() {
            return Err(anyhow!(
                "{op} rejected by {} (status={}): {}",
                self.base_url,
                response.status,
                response.messages().join("; ")
            ));
        }
        Ok(body)
    }

    async fn update(&self, op: &str, collection: &str, body: JsonValue) -> Result<RemoteResponse> {
        let request = self
            .client
            .post(self.collection_url(collection, "update"))
            .query(&[("wt", "json")])
            .json(&body);
        self.verdict(op, request).await
    }

    async fn list(&self, op: &str, api: &str, key: &str) -> Result<Vec<String>> {
        let request = self
            .client
            .get(self.url(api))
            .query(&[("action", "LIST"), ("wt", "json")]);
        let body = self.read(op, request).await?;
        Ok(string_list(&body, key))
    }
}

#[async_trait]
impl IndexGateway for HttpIndexGateway {
    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        let names = self
            .list("list_collections", "admin/collections", "collections")
            .await?;
        Ok(names.iter().any(|name| name == collection))
    }

    async fn create_collection(&self, spec: &CollectionSpec) -> Result<RemoteResponse> {
        let request = self.client.get(self.url("admin/collections")).query(&[
            ("action", "CREATE".to_string()),
            ("name", spec.name.clone()),
            ("numShards", spec.shards.to_string()),
            ("replicationFactor", spec.replicas.to_string()),
            ("collection.configName", spec.config_set.clone()),
            ("wt", "json".to_string()),
        ]);
        self.verdict("create_collection", request).await
    }

    async fn delete_collection(&self, collection: &str) -> Result<RemoteResponse> {
        let request = self.client.get(self.url("admin/collections")).query(&[
            ("action", "DELETE"),
            ("name", collection),
            ("wt", "json"),
        ]);
        self.verdict("delete_collection", request).await
    }

    async fn config_set_exists(&self, config_set: &str) -> Result<bool> {
        let names = self
            .list("list_config_sets", "admin/configs", "configSets")
            .await?;
        Ok(names.iter().any(|name| name == config_set))
    }

    async fn create_config_set(&self, config_set: &str, base: &str) -> Result<RemoteResponse> {
        let request = self.client.get(self.url("admin/configs")).query(&[
            ("action", "CREATE"),
            ("name", config_set),
            ("baseConfigSet", base),
            ("configSetProp.immutable", "false"),
            ("wt", "json"),
        ]);
        self.verdict("create_config_set", request).await
    }

    async fn delete_config_set(&self, config_set: &str) -> Result<RemoteResponse> {
        let request = self.client.get(self.url("admin/configs")).query(&[
            ("action", "DELETE"),
            ("name", config_set),
            ("wt", "json"),
        ]);
        self.verdict("delete_config_set", request).await
    }

    async fn fetch_schema(&self, collection: &str) -> Result<Schema> {
        let key_request = self
            .client
            .get(self.collection_url(collection, "schema/uniquekey"))
            .query(&[("wt", "json")]);
        let key_body = self.read("fetch_unique_key", key_request).await?;
        let unique_key = key_body
            .get("uniqueKey")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| anyhow!("schema of {collection} has no unique key"))?
            .to_string();

        let fields_request = self
            .client
            .get(self.collection_url(collection, "schema/fields"))
            .query(&[("showDefaults", "true"), ("wt", "json")]);
        let fields_body = self.read("fetch_fields", fields_request).await?;
        let fields = fields_body
            .get("fields")
            .and_then(JsonValue::as_array)
            .map(|fields| fields.iter().filter_map(FieldDescriptor::from_json).collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(Schema::with_fields(unique_key, fields))
    }

    async fn update_schema(
        &self,
        collection: &str,
        operations: &[SchemaOperation],
    ) -> Result<RemoteResponse> {
        let request = self
            .client
            .post(self.collection_url(collection, "schema"))
            .query(&[("wt", "json")])
            .header(CONTENT_TYPE, "application/json")
            .body(encode_operation_batch(operations));
        self.verdict("update_schema", request).await
    }

    async fn add_documents(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<RemoteResponse> {
        let body = JsonValue::Array(documents.into_iter().map(JsonValue::Object).collect());
        self.update("add_documents", collection, body).await
    }

    async fn delete_by_ids(&self, collection: &str, ids: &[String]) -> Result<RemoteResponse> {
        self.update("delete_by_ids", collection, json!({ "delete": ids }))
            .await
    }

    async fn delete_by_query(&self, collection: &str, filter: &str) -> Result<RemoteResponse> {
        self.update(
            "delete_by_query",
            collection,
            json!({ "delete": { "query": filter } }),
        )
        .await
    }

    async fn commit(&self, collection: &str) -> Result<RemoteResponse> {
        self.update("commit", collection, json!({ "commit": {} }))
            .await
    }

    async fn query(&self, collection: &str, request: &QueryRequest) -> Result<QueryPage> {
        let mut params = vec![
            ("q", request.filter.clone()),
            ("start", request.offset.to_string()),
            ("rows", request.rows.to_string()),
            ("wt", "json".to_string()),
        ];
        if !request.fields.is_empty() {
            params.push(("fl", request.fields.join(",")));
        }
        let http_request = self
            .client
            .get(self.collection_url(collection, "select"))
            .query(&params);
        let body = self.read("query", http_request).await?;
        parse_query_page(&body)
    }
}

fn parse_body(status: u16, text: &str) -> Result<JsonValue> {
    match serde_json::from_str::<JsonValue>(text) {
        Ok(body) => Ok(body),
        Err(_) if (200..300).contains(&status) => {
            Err(anyhow!("cluster returned a non-JSON body (http {status})"))
        }
        Err(_) => Ok(json!({
            "responseHeader": { "status": status },
            "error": { "code": status, "msg": text.trim() },
        })),
    }
}

/// Verdict of a response; a non-2xx HTTP status is never a success.
fn verdict_from(status: u16, body: &JsonValue) -> RemoteResponse {
    let response = RemoteResponse::from_json(body);
    if response.is_success() && !(200..300).contains(&status) {
        return RemoteResponse::failure(i32::from(status), format!("http status {status}"));
    }
    response
}

fn string_list(body: &JsonValue, key: &str) -> Vec<String> {
    body.get(key)
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(JsonValue::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_query_page(body: &JsonValue) -> Result<QueryPage> {
    let response = body
        .get("response")
        .ok_or_else(|| anyhow!("query response has no 'response' section"))?;
    let num_found = response
        .get("numFound")
        .and_then(JsonValue::as_u64)
        .unwrap_or(0);
    let docs = response
        .get("docs")
        .and_then(JsonValue::as_array)
        .map(|docs| {
            docs.iter()
                .filter_map(|doc| doc.as_object().cloned())
                .collect()
        })
        .unwrap_or_default();
    Ok(QueryPage { num_found, docs })
}
