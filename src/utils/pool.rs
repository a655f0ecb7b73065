//! Bounded HTTP connection pool for external providers.
//!
//! A single long-lived client with connection reuse, fronted by a semaphore
//! so concurrent provider calls stay within a fixed budget. Callers that
//! cannot check out a permit within the acquire timeout get a typed error
//! that the synthesis adapter treats like any other transient provider
//! failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::Client;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Counters for pool observability.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub total_requests: AtomicU64,
    pub failed_acquires: AtomicU64,
    pub active: AtomicUsize,
    pub peak_active: AtomicUsize,
}

impl PoolMetrics {
    pub fn summary(&self) -> String {
        format!(
            "pool - total: {}, failed acquires: {}, active: {}, peak: {}",
            self.total_requests.load(Ordering::Relaxed),
            self.failed_acquires.load(Ordering::Relaxed),
            self.active.load(Ordering::Relaxed),
            self.peak_active.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("pool exhausted: no permit within {0:?}")]
    Exhausted(Duration),
    #[error("failed to build HTTP client: {0}")]
    Build(String),
}

/// Pool sizing and timeout settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Fixed number of concurrent checkouts.
    pub max_concurrent: usize,
    /// How long a caller waits for a permit before failing over.
    pub acquire_timeout: Duration,
    /// TCP connect timeout for the underlying client.
    pub connect_timeout: Duration,
    /// Per-request timeout for the underlying client.
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            acquire_timeout: Duration::from_millis(750),
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Semaphore-bounded checkout over a shared HTTP client.
pub struct ProviderPool {
    client: Arc<Client>,
    semaphore: Arc<Semaphore>,
    metrics: Arc<PoolMetrics>,
    config: PoolConfig,
}

/// Holds one checkout; returned to the pool on drop.
pub struct PoolGuard<'a> {
    client: Arc<Client>,
    metrics: Arc<PoolMetrics>,
    _permit: SemaphorePermit<'a>,
}

impl PoolGuard<'_> {
    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl Drop for PoolGuard<'_> {
    fn drop(&mut self) {
        self.metrics.active.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ProviderPool {
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .tcp_keepalive(Duration::from_secs(5))
            .pool_max_idle_per_host(config.max_concurrent)
            .build()
            .map_err(|e| PoolError::Build(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            metrics: Arc::new(PoolMetrics::default()),
            config,
        })
    }

    /// Checks out a client, queuing behind the semaphore up to the acquire
    /// timeout.
    pub async fn acquire(&self) -> Result<PoolGuard<'_>, PoolError> {
        let permit =
            match tokio::time::timeout(self.config.acquire_timeout, self.semaphore.acquire()).await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) | Err(_) => {
                    self.metrics.failed_acquires.fetch_add(1, Ordering::Relaxed);
                    return Err(PoolError::Exhausted(self.config.acquire_timeout));
                }
            };

        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        let active = self.metrics.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.peak_active.fetch_max(active, Ordering::Relaxed);

        Ok(PoolGuard {
            client: self.client.clone(),
            metrics: self.metrics.clone(),
            _permit: permit,
        })
    }

    pub fn metrics(&self) -> Arc<PoolMetrics> {
        self.metrics.clone()
    }

    pub fn capacity(&self) -> usize {
        self.config.max_concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max: usize, acquire_ms: u64) -> ProviderPool {
        ProviderPool::new(PoolConfig {
            max_concurrent: max,
            acquire_timeout: Duration::from_millis(acquire_ms),
            ..PoolConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn checkout_and_return() {
        let pool = pool(2, 100);
        {
            let _a = pool.acquire().await.unwrap();
            let _b = pool.acquire().await.unwrap();
            assert_eq!(pool.metrics().active.load(Ordering::Relaxed), 2);
        }
        assert_eq!(pool.metrics().active.load(Ordering::Relaxed), 0);
        assert_eq!(pool.metrics().peak_active.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn exhaustion_times_out_with_typed_error() {
        let pool = pool(1, 20);
        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted(_)));
        assert_eq!(pool.metrics().failed_acquires.load(Ordering::Relaxed), 1);
        drop(held);
        assert!(pool.acquire().await.is_ok());
    }
}
