//! Interface to the remote index cluster.
//!
//! [`IndexGateway`] is the only seam through which the connector talks to a
//! cluster. Transport failures surface as `anyhow::Error`; cluster verdicts
//! are parsed once, at the transport boundary, into [`RemoteResponse`] so no
//! caller ever inspects raw response maps.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::endpoint::Endpoint;
use crate::schema::{Schema, SchemaOperation};

/// One indexed document as a JSON object.
pub type Document = serde_json::Map<String, JsonValue>;

/// Structured error entry returned by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteErrorDetail {
    pub message: String,
}

impl RemoteErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Status code plus error list of one cluster response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteResponse {
    pub status: i32,
    pub errors: Vec<RemoteErrorDetail>,
}

impl RemoteResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failure(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            errors: vec![RemoteErrorDetail::new(message)],
        }
    }

    /// Success means status zero and an empty error list.
    pub fn is_success(&self) -> bool {
        self.status == 0 && self.errors.is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.message.clone()).collect()
    }

    /// Parses a cluster JSON response body.
    ///
    /// Status comes from `responseHeader.status`, falling back to
    /// `error.code`. Errors are gathered from `error.msg`,
    /// `error.details[].errorMessages`, `errors[]` and `failure` entries.
    pub fn from_json(body: &JsonValue) -> Self {
        let mut status = body
            .pointer("/responseHeader/status")
            .and_then(JsonValue::as_i64)
            .unwrap_or(0) as i32;
        let mut errors = Vec::new();

        if let Some(error) = body.get("error") {
            if status == 0 {
                status = error
                    .get("code")
                    .and_then(JsonValue::as_i64)
                    .unwrap_or(500) as i32;
            }
            if let Some(msg) = error.get("msg").and_then(JsonValue::as_str) {
                errors.push(RemoteErrorDetail::new(msg));
            }
            if let Some(details) = error.get("details").and_then(JsonValue::as_array) {
                for detail in details {
                    collect_error_messages(detail, &mut errors);
                }
            }
        }
        if let Some(list) = body.get("errors").and_then(JsonValue::as_array) {
            for entry in list {
                match entry.as_str() {
                    Some(message) => errors.push(RemoteErrorDetail::new(message)),
                    None => collect_error_messages(entry, &mut errors),
                }
            }
        }
        if let Some(failure) = body.get("failure").and_then(JsonValue::as_object) {
            for (node, reason) in failure {
                let reason = reason
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| reason.to_string());
                errors.push(RemoteErrorDetail::new(format!("{node}: {reason}")));
            }
        }

        Self { status, errors }
    }
}

fn collect_error_messages(detail: &JsonValue, out: &mut Vec<RemoteErrorDetail>) {
    if let Some(messages) = detail.get("errorMessages").and_then(JsonValue::as_array) {
        for message in messages {
            let message = message
                .as_str()
                .map(|m| m.trim().to_string())
                .unwrap_or_else(|| message.to_string());
            out.push(RemoteErrorDetail::new(message));
        }
    }
}

/// Parameters for creating a remote collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    pub name: String,
    pub config_set: String,
    pub shards: u32,
    pub replicas: u32,
}

/// One paginated query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    /// Filter in the cluster's native query syntax, forwarded verbatim.
    pub filter: String,
    pub offset: usize,
    pub rows: usize,
    /// Stored fields to return; empty means all.
    pub fields: Vec<String>,
}

/// One page of query results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPage {
    /// Total number of matches across all pages.
    pub num_found: u64,
    pub docs: Vec<Document>,
}

/// Operations a remote index cluster exposes to the connector.
#[async_trait]
pub trait IndexGateway: Send + Sync {
    async fn collection_exists(&self, collection: &str) -> Result<bool>;

    async fn create_collection(&self, spec: &CollectionSpec) -> Result<RemoteResponse>;

    async fn delete_collection(&self, collection: &str) -> Result<RemoteResponse>;

    async fn config_set_exists(&self, config_set: &str) -> Result<bool>;

    /// Creates `config_set` as a copy of the `base` template.
    async fn create_config_set(&self, config_set: &str, base: &str) -> Result<RemoteResponse>;

    async fn delete_config_set(&self, config_set: &str) -> Result<RemoteResponse>;

    /// Reads the unique key and field list of a collection.
    async fn fetch_schema(&self, collection: &str) -> Result<Schema>;

    /// Submits the whole batch as one request, applied in order.
    async fn update_schema(
        &self,
        collection: &str,
        operations: &[SchemaOperation],
    ) -> Result<RemoteResponse>;

    /// Adds or atomically updates documents. A field whose value is an
    /// object `{"set": v}` is a partial update of an existing document.
    async fn add_documents(&self, collection: &str, documents: Vec<Document>)
        -> Result<RemoteResponse>;

    async fn delete_by_ids(&self, collection: &str, ids: &[String]) -> Result<RemoteResponse>;

    async fn delete_by_query(&self, collection: &str, filter: &str) -> Result<RemoteResponse>;

    async fn commit(&self, collection: &str) -> Result<RemoteResponse>;

    async fn query(&self, collection: &str, request: &QueryRequest) -> Result<QueryPage>;

    /// Releases transport resources. Called once, by the connection cache.
    async fn close(&self) {}
}

/// Settings applied to every connection a connector opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub request_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Opens gateways for endpoints; injected into the connection cache.
#[async_trait]
pub trait GatewayConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        settings: &ClientSettings,
    ) -> Result<Arc<dyn IndexGateway>>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::RemoteResponse;

    #[test]
    fn success_body_parses_as_success() {
        let response = RemoteResponse::from_json(&json!({
            "responseHeader": {"status": 0, "QTime": 12},
            "success": {"node1": {"responseHeader": {"status": 0}}}
        }));
        assert!(response.is_success());
    }

    #[test]
    fn schema_rejection_collects_every_detail_message() {
        let response = RemoteResponse::from_json(&json!({
            "responseHeader": {"status": 400},
            "error": {
                "msg": "error processing commands",
                "code": 400,
                "details": [
                    {"add-field": {"name": "a"}, "errorMessages": ["Field 'a' already exists.\n"]},
                    {"delete-field": {"name": "b"}, "errorMessages": ["The field 'b' is not present"]}
                ]
            }
        }));
        assert_eq!(response.status, 400);
        assert_eq!(
            response.messages(),
            vec![
                "error processing commands".to_string(),
                "Field 'a' already exists.".to_string(),
                "The field 'b' is not present".to_string(),
            ]
        );
    }

    #[test]
    fn error_payload_with_zero_status_is_not_success() {
        let response = RemoteResponse::from_json(&json!({
            "responseHeader": {"status": 0},
            "errors": [{"errorMessages": ["unknown field type"]}]
        }));
        assert_eq!(response.status, 0);
        assert!(!response.is_success());
    }

    #[test]
    fn error_code_is_used_when_header_is_missing() {
        let response = RemoteResponse::from_json(&json!({
            "error": {"msg": "Could not find collection : orders", "code": 404}
        }));
        assert_eq!(response.status, 404);
        assert_eq!(response.messages().len(), 1);
    }

    #[test]
    fn collection_failure_map_is_flattened_per_node() {
        let response = RemoteResponse::from_json(&json!({
            "responseHeader": {"status": 0},
            "failure": {"10.0.0.2:8983_solr": "core creation failed"}
        }));
        assert_eq!(
            response.messages(),
            vec!["10.0.0.2:8983_solr: core creation failed".to_string()]
        );
    }
}
