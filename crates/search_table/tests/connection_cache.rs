//! Connection cache sharing, reference counting and failure handling.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::future::join_all;
use search_table::{
    ClientSettings, ConnectionCache, ConnectorError, ConnectorMetrics, Endpoint, Fault,
    MemoryIndexCluster,
};

fn cache_over(cluster: &MemoryIndexCluster) -> (Arc<ConnectionCache>, Arc<ConnectorMetrics>) {
    common::init_tracing();
    let metrics = Arc::new(ConnectorMetrics::default());
    let cache = Arc::new(ConnectionCache::new(
        Arc::new(cluster.clone()),
        Arc::clone(&metrics),
    ));
    (cache, metrics)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquire_opens_exactly_one_connection() -> Result<()> {
    let cluster = MemoryIndexCluster::new().with_connect_delay(Duration::from_millis(25));
    let (cache, metrics) = cache_over(&cluster);
    let endpoint = Endpoint::parse(common::ENDPOINT)?;

    let tasks = (0..8).map(|_| {
        let cache = Arc::clone(&cache);
        let endpoint = endpoint.clone();
        tokio::spawn(async move { cache.acquire(&endpoint, &ClientSettings::default()).await })
    });
    let mut handles = Vec::new();
    for joined in join_all(tasks).await {
        handles.push(joined??);
    }

    assert_eq!(handles.iter().filter(|a| a.created).count(), 1);
    assert!(handles
        .iter()
        .all(|a| a.handle.same_connection(&handles[0].handle)));
    assert_eq!(cluster.stats().connects, 1);
    assert_eq!(cache.ref_count(&endpoint).await, 8);
    assert_eq!(metrics.snapshot().connections_opened, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn equivalent_endpoint_strings_share_one_handle() -> Result<()> {
    let cluster = MemoryIndexCluster::new();
    let (cache, _) = cache_over(&cluster);
    let settings = ClientSettings::default();

    let first = cache
        .acquire(&Endpoint::parse("Search-1:8983/solr/")?, &settings)
        .await?;
    let second = cache
        .acquire(&Endpoint::parse("http://search-1")?, &settings)
        .await?;

    assert!(first.created);
    assert!(!second.created);
    assert!(first.handle.same_connection(&second.handle));
    assert_eq!(cache.len().await, 1);
    assert_eq!(cluster.stats().connects, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_release_closes_and_evicts() -> Result<()> {
    let cluster = MemoryIndexCluster::new();
    let (cache, metrics) = cache_over(&cluster);
    let endpoint = Endpoint::parse(common::ENDPOINT)?;
    let settings = ClientSettings::default();

    let acquired = cache.acquire(&endpoint, &settings).await?;
    cache.acquire(&endpoint, &settings).await?;

    assert!(!cache.release(&endpoint).await);
    assert!(cache.is_cached(&endpoint).await);
    assert!(!acquired.handle.is_closed());

    assert!(cache.release(&endpoint).await);
    assert!(!cache.is_cached(&endpoint).await);
    assert!(cache.is_empty().await);
    assert!(acquired.handle.is_closed());
    assert!(matches!(
        acquired.handle.gateway(),
        Err(ConnectorError::Connection(_))
    ));
    assert_eq!(cluster.stats().closes, 1);
    assert_eq!(metrics.snapshot().connections_closed, 1);

    let reopened = cache.acquire(&endpoint, &settings).await?;
    assert!(reopened.created);
    assert!(!reopened.handle.same_connection(&acquired.handle));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn release_of_untracked_endpoint_is_a_noop() -> Result<()> {
    let cluster = MemoryIndexCluster::new();
    let (cache, _) = cache_over(&cluster);

    assert!(!cache.release(&Endpoint::parse("elsewhere:9000")?).await);
    assert_eq!(cluster.stats().closes, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_connect_leaves_cache_empty() -> Result<()> {
    let cluster = MemoryIndexCluster::new();
    let (cache, _) = cache_over(&cluster);
    let endpoint = Endpoint::parse(common::ENDPOINT)?;
    cluster.inject(Fault::Connect);

    let err = cache
        .acquire(&endpoint, &ClientSettings::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::Connection(_)));
    assert!(!cache.is_cached(&endpoint).await);

    let acquired = cache.acquire(&endpoint, &ClientSettings::default()).await?;
    assert!(acquired.created);
    assert_eq!(cache.ref_count(&endpoint).await, 1);
    Ok(())
}
