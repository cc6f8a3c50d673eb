//! Typed errors surfaced by the connector.
//!
//! Remote verdicts carry the cluster status code and every error message the
//! cluster returned, verbatim, so callers can decide whether to retry.

use thiserror::Error;

use crate::gateway::RemoteResponse;

/// Errors that can occur while managing index-backed tables.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Invalid or missing table configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A cluster connection could not be established or reused.
    #[error("connection error: {0}")]
    Connection(String),

    /// Collection or config-set create/delete was rejected by the cluster.
    #[error("lifecycle error on '{target}' (status={status}): {}", messages.join("; "))]
    Lifecycle {
        target: String,
        status: i32,
        messages: Vec<String>,
    },

    /// Schema requested for a table whose config set does not exist remotely.
    #[error("schema not found for collection '{0}'")]
    SchemaNotFound(String),

    /// A schema mutation batch was rejected.
    #[error("schema update rejected for '{collection}' (status={status}): {}", messages.join("; "))]
    SchemaUpdate {
        collection: String,
        status: i32,
        messages: Vec<String>,
    },

    /// A document write, delete or commit was rejected.
    #[error("mutation rejected for '{collection}' (status={status}): {}", messages.join("; "))]
    Mutation {
        collection: String,
        status: i32,
        messages: Vec<String>,
    },

    /// Transport failure while a scan was fetching a page.
    #[error("scan error: {0}")]
    Scan(String),

    /// The cursor was used after `close()`.
    #[error("scan cursor is closed")]
    CursorClosed,
}

/// Result type for connector operations.
pub type Result<T> = std::result::Result<T, ConnectorError>;

impl ConnectorError {
    pub(crate) fn lifecycle(target: impl Into<String>, response: &RemoteResponse) -> Self {
        Self::Lifecycle {
            target: target.into(),
            status: response.status,
            messages: response.messages(),
        }
    }

    /// Lifecycle failure caused by transport rather than a cluster verdict.
    pub(crate) fn lifecycle_transport(target: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::Lifecycle {
            target: target.into(),
            status: -1,
            messages: vec![format!("{err:#}")],
        }
    }

    pub(crate) fn schema_update(collection: impl Into<String>, response: &RemoteResponse) -> Self {
        Self::SchemaUpdate {
            collection: collection.into(),
            status: response.status,
            messages: response.messages(),
        }
    }

    pub(crate) fn mutation(collection: impl Into<String>, response: &RemoteResponse) -> Self {
        Self::Mutation {
            collection: collection.into(),
            status: response.status,
            messages: response.messages(),
        }
    }

    pub(crate) fn mutation_transport(collection: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::Mutation {
            collection: collection.into(),
            status: -1,
            messages: vec![format!("{err:#}")],
        }
    }

    /// Returns the remote status code when the error carries one.
    pub fn remote_status(&self) -> Option<i32> {
        match self {
            Self::Lifecycle { status, .. }
            | Self::SchemaUpdate { status, .. }
            | Self::Mutation { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectorError;
    use crate::gateway::{RemoteErrorDetail, RemoteResponse};

    #[test]
    fn lifecycle_error_keeps_status_and_every_message() {
        let response = RemoteResponse {
            status: 400,
            errors: vec![
                RemoteErrorDetail::new("collection already exists"),
                RemoteErrorDetail::new("replica placement failed"),
            ],
        };
        let err = ConnectorError::lifecycle("orders", &response);
        assert_eq!(err.remote_status(), Some(400));
        let rendered = err.to_string();
        assert!(rendered.contains("collection already exists"));
        assert!(rendered.contains("replica placement failed"));
    }

    #[test]
    fn cursor_closed_has_no_remote_status() {
        assert_eq!(ConnectorError::CursorClosed.remote_status(), None);
    }
}
