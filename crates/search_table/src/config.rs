//! Connector-wide settings and per-table configuration.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{ConnectorError, Result};
use crate::gateway::ClientSettings;
use crate::schema::{Schema, DEFAULT_UNIQUE_KEY};

/// Rows fetched per scan page when nothing overrides it.
pub const DEFAULT_PAGE_SIZE: usize = 1000;
/// Upper bound on page fetches a single `has_next` call may issue.
pub const DEFAULT_MAX_REFILLS_PER_POLL: usize = 4;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Settings shared by every table a manager serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    /// Rows requested per scan page.
    pub page_size: usize,
    /// Transport timeout applied to every remote call.
    pub request_timeout: Duration,
    /// Bound on refill iterations of one cursor poll.
    pub max_refills_per_poll: usize,
    /// Endpoint used by tables whose options omit one.
    pub default_endpoint: Option<String>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            max_refills_per_poll: DEFAULT_MAX_REFILLS_PER_POLL,
            default_endpoint: None,
        }
    }
}

impl ConnectorConfig {
    /// Loads configuration from environment variables with defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let page_size = parse_usize(
            std::env::var("SEARCH_TABLE_PAGE_SIZE").ok(),
            DEFAULT_PAGE_SIZE,
        )?
        .max(1);
        let request_timeout_ms = parse_u64(
            std::env::var("SEARCH_TABLE_REQUEST_TIMEOUT_MS").ok(),
            DEFAULT_REQUEST_TIMEOUT_MS,
        )?
        .max(1);
        let max_refills_per_poll = parse_usize(
            std::env::var("SEARCH_TABLE_MAX_REFILLS_PER_POLL").ok(),
            DEFAULT_MAX_REFILLS_PER_POLL,
        )?
        .max(1);
        let default_endpoint = std::env::var("SEARCH_TABLE_DEFAULT_ENDPOINT")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Ok(Self {
            page_size,
            request_timeout: Duration::from_millis(request_timeout_ms),
            max_refills_per_poll,
            default_endpoint,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            request_timeout: self.request_timeout,
        }
    }
}

/// Configuration carried by a table-defined event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Cluster coordinator address, normalized on registration.
    pub endpoint: String,
    pub shards: i64,
    pub replicas: i64,
    /// Config-set template the table's own config set is copied from.
    pub base_config: String,
    /// Optional tenant/domain qualifier folded into the collection name.
    pub qualifier: Option<String>,
    /// Explicit field list, see [`Schema::parse_field_list`].
    pub field_schema: Option<String>,
    pub unique_key: String,
    /// Merge (`true`) or replace (`false`) the remote schema on definition.
    pub merge_schema: bool,
    /// Leave commits to the cluster's auto-commit policy.
    pub async_commit: bool,
}

impl TableConfig {
    pub fn new(endpoint: impl Into<String>, base_config: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            shards: 1,
            replicas: 1,
            base_config: base_config.into(),
            qualifier: None,
            field_schema: None,
            unique_key: DEFAULT_UNIQUE_KEY.to_string(),
            merge_schema: true,
            async_commit: false,
        }
    }

    pub fn with_shards(mut self, shards: i64, replicas: i64) -> Self {
        self.shards = shards;
        self.replicas = replicas;
        self
    }

    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    pub fn with_field_schema(mut self, field_schema: impl Into<String>) -> Self {
        self.field_schema = Some(field_schema.into());
        self
    }

    pub fn with_merge_schema(mut self, merge_schema: bool) -> Self {
        self.merge_schema = merge_schema;
        self
    }

    pub fn with_async_commit(mut self, async_commit: bool) -> Self {
        self.async_commit = async_commit;
        self
    }

    /// Builds a config from table annotation options.
    ///
    /// Keys: `endpoint`, `shards`, `replicas`, `base.config`, `domain`,
    /// `schema`, `unique.key`, `merge.schema`, `commit.async`.
    pub fn from_options(
        options: &HashMap<String, String>,
        connector: &ConnectorConfig,
    ) -> Result<Self> {
        let get = |key: &str| {
            options
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };
        let endpoint = get("endpoint")
            .map(str::to_string)
            .or_else(|| connector.default_endpoint.clone())
            .ok_or_else(|| {
                ConnectorError::Configuration("table option 'endpoint' is required".to_string())
            })?;
        let base_config = get("base.config").ok_or_else(|| {
            ConnectorError::Configuration("table option 'base.config' is required".to_string())
        })?;

        let mut config = Self::new(endpoint, base_config);
        if let Some(raw) = get("shards") {
            config.shards = parse_option(raw, "shards")?;
        }
        if let Some(raw) = get("replicas") {
            config.replicas = parse_option(raw, "replicas")?;
        }
        if let Some(raw) = get("merge.schema") {
            config.merge_schema = parse_option(raw, "merge.schema")?;
        }
        if let Some(raw) = get("commit.async") {
            config.async_commit = parse_option(raw, "commit.async")?;
        }
        if let Some(raw) = get("unique.key") {
            config.unique_key = raw.to_string();
        }
        config.qualifier = get("domain").map(str::to_string);
        config.field_schema = get("schema").map(str::to_string);
        config.validate()?;
        Ok(config)
    }

    /// Validates required fields before registration.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(ConnectorError::Configuration(
                "table config has empty endpoint".to_string(),
            ));
        }
        if self.shards < 0 || self.replicas < 0 {
            return Err(ConnectorError::Configuration(format!(
                "table config has negative shard/replica count (shards={}, replicas={})",
                self.shards, self.replicas
            )));
        }
        if self.shards > i64::from(u32::MAX) || self.replicas > i64::from(u32::MAX) {
            return Err(ConnectorError::Configuration(format!(
                "table config shard/replica count out of range (shards={}, replicas={})",
                self.shards, self.replicas
            )));
        }
        if self.base_config.trim().is_empty() {
            return Err(ConnectorError::Configuration(
                "table config has empty base config template".to_string(),
            ));
        }
        if let Some(qualifier) = &self.qualifier {
            if !is_valid_name_part(qualifier) {
                return Err(ConnectorError::Configuration(format!(
                    "invalid table qualifier '{qualifier}'"
                )));
            }
        }
        if self.unique_key.trim().is_empty() {
            return Err(ConnectorError::Configuration(
                "table config has empty unique key".to_string(),
            ));
        }
        self.initial_schema()?;
        Ok(())
    }

    /// Field schema declared by the config, if any.
    pub fn initial_schema(&self) -> Result<Option<Schema>> {
        self.field_schema
            .as_deref()
            .map(|raw| Schema::parse_field_list(&self.unique_key, raw))
            .transpose()
    }
}

/// Characters allowed in table names and qualifiers.
pub(crate) fn is_valid_name_part(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn parse_option<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T> {
    raw.parse::<T>().map_err(|_| {
        ConnectorError::Configuration(format!("invalid value '{raw}' for table option '{key}'"))
    })
}

/// Parses an optional `usize` with fallback default.
fn parse_usize(value: Option<String>, default_value: usize) -> anyhow::Result<usize> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

/// Parses an optional `u64` with fallback default.
fn parse_u64(value: Option<String>, default_value: u64) -> anyhow::Result<u64> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}
