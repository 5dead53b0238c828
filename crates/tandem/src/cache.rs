//! The routing cache bridging stage-1 plans to their deferred re-entry.
//!
//! Stage-1 writes every sub-fork under its deferred-route name; the switch
//! re-enters those names as it places legs, and the engine answers from the
//! cache. Deployments running a single engine use the in-process map; a
//! Redis store lets several engines share one plan space.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use redis::AsyncCommands;
use std::sync::Arc;

use crate::config::{CacheImplementation, CacheSettings};
use crate::error::CacheError;
use crate::routing::RoutingResult;

#[async_trait::async_trait]
pub trait RoutingCache: Send + Sync {
    async fn retrieve(&self, key: &str) -> Result<Option<RoutingResult>, CacheError>;

    /// Per-entry upsert. Entries expire after the configured object
    /// lifetime where the backend supports expiry.
    async fn update(&self, entries: BTreeMap<String, RoutingResult>) -> Result<(), CacheError>;
}

/// Resolves the configured cache implementation. The choice is static for
/// the life of the process.
pub async fn connect_routing_cache(
    settings: &CacheSettings,
) -> anyhow::Result<Arc<dyn RoutingCache>> {
    match settings.implementation {
        CacheImplementation::Memory => Ok(Arc::new(MemoryRoutingCache::new())),
        CacheImplementation::Redis => {
            let url = settings
                .redis_url
                .as_deref()
                .context("the redis routing cache requires a redis_url")?;
            let cache = RedisRoutingCache::connect(
                url,
                Duration::from_secs(settings.object_lifetime_secs),
            )
            .await
            .context("connecting to the redis routing cache")?;
            Ok(Arc::new(cache))
        }
    }
}

/// In-process cache. Writes are single non-suspending operations, so a
/// plain mutex suffices; entries live until the process does.
pub struct MemoryRoutingCache {
    entries: Mutex<HashMap<String, RoutingResult>>,
}

impl MemoryRoutingCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryRoutingCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RoutingCache for MemoryRoutingCache {
    async fn retrieve(&self, key: &str) -> Result<Option<RoutingResult>, CacheError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn update(&self, entries: BTreeMap<String, RoutingResult>) -> Result<(), CacheError> {
        self.entries.lock().unwrap().extend(entries);
        Ok(())
    }
}

/// Redis-backed cache; results are stored in their JSON form with a TTL.
pub struct RedisRoutingCache {
    connection: redis::aio::ConnectionManager,
    object_lifetime: Duration,
}

impl RedisRoutingCache {
    pub async fn connect(url: &str, object_lifetime: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        Ok(Self {
            connection,
            object_lifetime,
        })
    }
}

#[async_trait::async_trait]
impl RoutingCache for RedisRoutingCache {
    async fn retrieve(&self, key: &str) -> Result<Option<RoutingResult>, CacheError> {
        let mut connection = self.connection.clone();
        let data: Option<String> = connection.get(key).await.map_err(|err| {
            tracing::error!(error = %err, key, "failed to retrieve cached routing result");
            err
        })?;
        match data {
            None => Ok(None),
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        }
    }

    async fn update(&self, entries: BTreeMap<String, RoutingResult>) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        for (key, result) in entries {
            let data = serde_json::to_string(&result)?;
            let _: () = connection
                .set_ex(&key, data, self.object_lifetime.as_secs())
                .await
                .map_err(|err| {
                    tracing::error!(error = %err, %key, "failed to update cached routing result");
                    err
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::routing::CallTarget;

    #[tokio::test]
    async fn memory_cache_stores_and_returns_entries() {
        let cache = MemoryRoutingCache::new();
        let result = RoutingResult::fork(
            CallTarget::new("lateroute/stage1-x-1"),
            vec![CallTarget::new("lateroute/2042")],
        );
        cache
            .update(BTreeMap::from([(
                "lateroute/stage1-x-1".to_string(),
                result.clone(),
            )]))
            .await
            .unwrap();

        assert_eq!(
            cache.retrieve("lateroute/stage1-x-1").await.unwrap(),
            Some(result)
        );
        assert_eq!(cache.retrieve("lateroute/stage1-x-2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn later_updates_win() {
        let cache = MemoryRoutingCache::new();
        let first = RoutingResult::simple(CallTarget::new("lateroute/2042"));
        let second = RoutingResult::simple(CallTarget::new("lateroute/2005"));
        for entry in [&first, &second] {
            cache
                .update(BTreeMap::from([("key".to_string(), entry.clone())]))
                .await
                .unwrap();
        }
        assert_eq!(cache.retrieve("key").await.unwrap(), Some(second));
    }
}
