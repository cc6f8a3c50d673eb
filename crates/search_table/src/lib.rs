//! Search-index backed tables: collection lifecycle, schema evolution and
//! paged scans.
//!
//! A query engine hands table-defined events to a [`CollectionManager`],
//! which:
//! - shares one cluster client per endpoint through the [`ConnectionCache`],
//! - creates and deletes the remote collection and its config set,
//! - keeps the remote field schema in line with the table definition,
//! - writes documents and streams query results through a [`ScanCursor`].
//!
//! The cluster itself sits behind [`IndexGateway`]; [`HttpConnector`] talks
//! to a Solr-compatible cluster over HTTP and [`MemoryIndexCluster`] keeps
//! everything in process.

pub mod config;
pub mod connection;
pub mod cursor;
pub mod endpoint;
pub mod error;
pub mod evolution;
pub mod gateway;
pub mod http;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod mutation;
pub mod naming;
pub mod row;
pub mod schema;

pub use config::{ConnectorConfig, TableConfig};
pub use connection::{Acquired, ClientHandle, ConnectionCache};
pub use cursor::{CursorState, ScanCursor};
pub use endpoint::Endpoint;
pub use error::{ConnectorError, Result};
pub use gateway::{
    ClientSettings, CollectionSpec, Document, GatewayConnector, IndexGateway, QueryPage,
    QueryRequest, RemoteErrorDetail, RemoteResponse,
};
pub use http::{HttpConnector, HttpIndexGateway};
pub use lifecycle::{CollectionManager, TableDefinition, TableRegistration, TableState};
pub use memory::{Fault, MemoryClusterStats, MemoryIndexCluster};
pub use metrics::{ConnectorMetrics, ConnectorMetricsSnapshot};
pub use mutation::{UpsertOutcome, UpsertRequest};
pub use row::{ColumnSpec, Row, Value};
pub use schema::{FieldDescriptor, FieldType, Schema, SchemaOperation, VERSION_FIELD};
