//! Reference-counted cache of cluster client handles.
//!
//! Every table whose endpoint normalizes to the same [`Endpoint`] shares one
//! [`ClientHandle`]. The cache is an explicit object handed to whoever needs
//! it; there is no process-wide instance.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{ConnectorError, Result};
use crate::gateway::{ClientSettings, GatewayConnector, IndexGateway};
use crate::metrics::ConnectorMetrics;

/// Shared, cheaply cloneable handle to one cluster connection.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    endpoint: Endpoint,
    gateway: Arc<dyn IndexGateway>,
    closed: AtomicBool,
}

impl ClientHandle {
    fn new(endpoint: Endpoint, gateway: Arc<dyn IndexGateway>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                endpoint,
                gateway,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Gateway of a live connection; fails once the cache closed it.
    pub fn gateway(&self) -> Result<&dyn IndexGateway> {
        if self.is_closed() {
            return Err(ConnectorError::Connection(format!(
                "client for {} is closed",
                self.inner.endpoint
            )));
        }
        Ok(self.inner.gateway.as_ref())
    }

    /// Whether both handles refer to the same underlying connection.
    pub fn same_connection(&self, other: &ClientHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    async fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.gateway.close().await;
        }
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("endpoint", &self.inner.endpoint.to_string())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Result of [`ConnectionCache::acquire`].
#[derive(Debug, Clone)]
pub struct Acquired {
    pub handle: ClientHandle,
    /// `true` when this call opened the connection.
    pub created: bool,
}

struct CacheEntry {
    handle: ClientHandle,
    refs: usize,
}

/// Endpoint-keyed registry of client handles with per-endpoint reference
/// counts. All mutations happen under one mutex.
pub struct ConnectionCache {
    connector: Arc<dyn GatewayConnector>,
    entries: Mutex<HashMap<Endpoint, CacheEntry>>,
    metrics: Arc<ConnectorMetrics>,
}

impl ConnectionCache {
    pub fn new(connector: Arc<dyn GatewayConnector>, metrics: Arc<ConnectorMetrics>) -> Self {
        Self {
            connector,
            entries: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Returns the cached handle for `endpoint`, connecting on first use.
    ///
    /// Each successful call takes one reference that a later
    /// [`release`](Self::release) gives back. The lock is held across the
    /// connect so racing callers observe exactly one connection.
    pub async fn acquire(&self, endpoint: &Endpoint, settings: &ClientSettings) -> Result<Acquired> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(endpoint) {
            entry.refs += 1;
            debug!(endpoint = %endpoint, refs = entry.refs, "reusing cached cluster client");
            return Ok(Acquired {
                handle: entry.handle.clone(),
                created: false,
            });
        }

        let gateway = self
            .connector
            .connect(endpoint, settings)
            .await
            .map_err(|err| {
                ConnectorError::Connection(format!("connect to {endpoint} failed: {err:#}"))
            })?;
        let handle = ClientHandle::new(endpoint.clone(), gateway);
        entries.insert(
            endpoint.clone(),
            CacheEntry {
                handle: handle.clone(),
                refs: 1,
            },
        );
        self.metrics.record_connection_opened();
        info!(endpoint = %endpoint, "opened cluster client");
        Ok(Acquired {
            handle,
            created: true,
        })
    }

    /// Gives back one reference; closes and evicts the handle at zero.
    ///
    /// Returns `true` only when this call closed the connection. Releasing
    /// an endpoint that is not cached is a no-op returning `false`.
    pub async fn release(&self, endpoint: &Endpoint) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(endpoint) else {
            warn!(endpoint = %endpoint, "release of untracked cluster client ignored");
            return false;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            debug!(endpoint = %endpoint, refs = entry.refs, "released cluster client reference");
            return false;
        }

        if let Some(entry) = entries.remove(endpoint) {
            entry.handle.close().await;
        }
        self.metrics.record_connection_closed();
        info!(endpoint = %endpoint, "closed cluster client");
        true
    }

    /// Current reference count, `0` when not cached.
    pub async fn ref_count(&self, endpoint: &Endpoint) -> usize {
        self.entries
            .lock()
            .await
            .get(endpoint)
            .map(|entry| entry.refs)
            .unwrap_or(0)
    }

    pub async fn is_cached(&self, endpoint: &Endpoint) -> bool {
        self.entries.lock().await.contains_key(endpoint)
    }

    /// Number of cached endpoints.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
