//! 传输层：HTTP 客户端、按（端点, 凭证）键控的有界 TTL 客户端缓存，以及跨客户端共享的流式并发池。
//!
//! # Transport
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`HttpTransport`] | One pooled `reqwest` client with connect/read timeouts |
//! | [`ClientCache`] | LRU + TTL cache with a mandatory evict hook |
//! | [`TransportPool`] | Shared client cache and one stream-concurrency semaphore |
//!
//! Evicted transports are closed in the evict hook, so the number of live
//! connection pools stays bounded by the cache capacity under credential churn.

pub mod cache;
pub mod http;

pub use cache::{ClientCache, ClientKey, EvictReason};
pub use http::{HttpReply, HttpRequest, HttpTransport, StreamReply, TransportError};

use std::env;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::channel::ChannelConfig;
use crate::{Error, ErrorContext, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub max_concurrent_streams: usize,
}

impl PoolConfig {
    /// Defaults overridable through `GATEWAY_CLIENT_CACHE_CAPACITY`,
    /// `GATEWAY_CLIENT_CACHE_TTL_SECS` and `GATEWAY_MAX_CONCURRENT_STREAMS`.
    pub fn from_env() -> Self {
        let read = |name: &str| env::var(name).ok().and_then(|s| s.parse::<u64>().ok());
        Self {
            cache_capacity: read("GATEWAY_CLIENT_CACHE_CAPACITY").unwrap_or(256) as usize,
            cache_ttl: Duration::from_secs(read("GATEWAY_CLIENT_CACHE_TTL_SECS").unwrap_or(1800)),
            max_concurrent_streams: read("GATEWAY_MAX_CONCURRENT_STREAMS").unwrap_or(1024) as usize,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Shared transport resources for every dispatcher in the process.
pub struct TransportPool {
    clients: ClientCache<ClientKey, Arc<HttpTransport>>,
    streams: Arc<Semaphore>,
}

impl TransportPool {
    pub fn new(config: PoolConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        let clients = ClientCache::new(capacity, config.cache_ttl, |key: &ClientKey, transport: &Arc<HttpTransport>, reason| {
            tracing::debug!(endpoint = %key.endpoint, ?reason, "closing evicted vendor client");
            transport.close();
        });
        Self {
            clients,
            streams: Arc::new(Semaphore::new(config.max_concurrent_streams.max(1))),
        }
    }

    pub fn from_env() -> Self {
        Self::new(PoolConfig::from_env())
    }

    /// Cached transport for the channel's endpoint and credential.
    pub fn transport(&self, channel: &ChannelConfig) -> Result<Arc<HttpTransport>> {
        let key = channel.client_key();
        self.clients.get_or_try_insert_with(&key, || {
            tracing::debug!(endpoint = %key.endpoint, vendor = %channel.vendor, "building vendor client");
            HttpTransport::new(channel.timeouts.connect(), channel.timeouts.read()).map(Arc::new)
        })
    }

    /// Permit held for the whole lifetime of one vendor stream.
    pub async fn acquire_stream(&self) -> Result<OwnedSemaphorePermit> {
        self.streams.clone().acquire_owned().await.map_err(|_| {
            Error::configuration_with_context(
                "stream pool closed",
                ErrorContext::new().with_source("transport_pool"),
            )
        })
    }

    pub fn available_streams(&self) -> usize {
        self.streams.available_permits()
    }

    pub fn purge_expired(&self) -> usize {
        self.clients.purge_expired()
    }

    pub fn cached_clients(&self) -> usize {
        self.clients.len()
    }

    /// Close and drop every cached client.
    pub fn shutdown(&self) {
        self.clients.clear();
        self.streams.close();
    }
}

impl Default for TransportPool {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Credential, Vendor};

    fn pool(capacity: usize) -> TransportPool {
        TransportPool::new(PoolConfig {
            cache_capacity: capacity,
            cache_ttl: Duration::from_secs(60),
            max_concurrent_streams: 2,
        })
    }

    #[test]
    fn same_endpoint_and_credential_share_a_client() {
        let pool = pool(4);
        let a = ChannelConfig::new(Vendor::OpenAi, "https://api.example.com/v1", Credential::Bearer { token: "k1".into() });
        let b = a.clone();
        let c = ChannelConfig::new(Vendor::OpenAi, "https://api.example.com/v1", Credential::Bearer { token: "k2".into() });
        let ta = pool.transport(&a).unwrap();
        let tb = pool.transport(&b).unwrap();
        let tc = pool.transport(&c).unwrap();
        assert!(Arc::ptr_eq(&ta, &tb));
        assert!(!Arc::ptr_eq(&ta, &tc));
        assert_eq!(pool.cached_clients(), 2);
    }

    #[test]
    fn evicted_clients_are_closed() {
        let pool = pool(1);
        let a = ChannelConfig::new(Vendor::DeepSeek, "https://a.example", Credential::None);
        let b = ChannelConfig::new(Vendor::DeepSeek, "https://b.example", Credential::None);
        let ta = pool.transport(&a).unwrap();
        let tb = pool.transport(&b).unwrap();
        assert!(ta.is_closed());
        assert!(!tb.is_closed());
        pool.shutdown();
        assert!(tb.is_closed());
    }

    #[tokio::test]
    async fn stream_permits_are_shared() {
        let pool = pool(4);
        let p1 = pool.acquire_stream().await.unwrap();
        let _p2 = pool.acquire_stream().await.unwrap();
        assert_eq!(pool.available_streams(), 0);
        drop(p1);
        assert_eq!(pool.available_streams(), 1);
    }
}
