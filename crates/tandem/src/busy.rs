//! Per-extension concurrent-call accounting from call.cdr events.
//!
//! The engine observes the switch's call-detail records: an `initialize`
//! raises the extension's counter, a `finalize` lowers it, and stage 2
//! treats a positive counter as busy. Events are acknowledged immediately
//! and applied by a single worker task, so updates for one extension land
//! in arrival order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use crate::config::{CacheImplementation, CacheSettings};
use crate::error::CacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdrOperation {
    Initialize,
    Finalize,
}

impl CdrOperation {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "initialize" => Some(CdrOperation::Initialize),
            "finalize" => Some(CdrOperation::Finalize),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CdrEvent {
    pub operation: CdrOperation,
    pub extension: String,
}

#[async_trait::async_trait]
pub trait BusyCache: Send + Sync {
    async fn apply(&self, event: &CdrEvent) -> Result<(), CacheError>;

    /// An extension is busy while it has calls in progress.
    async fn is_busy(&self, extension: &str) -> Result<bool, CacheError>;

    async fn busy_status(&self) -> Result<BTreeMap<String, u64>, CacheError>;

    async fn flush(&self) -> Result<(), CacheError>;
}

pub async fn connect_busy_cache(settings: &CacheSettings) -> anyhow::Result<Arc<dyn BusyCache>> {
    match settings.implementation {
        CacheImplementation::Memory => Ok(Arc::new(MemoryBusyCache::new())),
        CacheImplementation::Redis => {
            let url = settings
                .redis_url
                .as_deref()
                .context("the redis busy cache requires a redis_url")?;
            let cache = RedisBusyCache::connect(url)
                .await
                .context("connecting to the redis busy cache")?;
            Ok(Arc::new(cache))
        }
    }
}

/// Drains call.cdr events into the busy cache, strictly in arrival order.
pub async fn serve_cdr_events(
    cache: Arc<dyn BusyCache>,
    mut events: mpsc::UnboundedReceiver<CdrEvent>,
) {
    while let Some(event) = events.recv().await {
        tracing::debug!(
            extension = %event.extension,
            operation = ?event.operation,
            "applying call.cdr event"
        );
        if let Err(err) = cache.apply(&event).await {
            tracing::error!(
                error = %err,
                extension = %event.extension,
                "failed to apply call.cdr event"
            );
        }
    }
}

pub struct MemoryBusyCache {
    counters: Mutex<HashMap<String, u64>>,
}

impl MemoryBusyCache {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBusyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl BusyCache for MemoryBusyCache {
    async fn apply(&self, event: &CdrEvent) -> Result<(), CacheError> {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(event.extension.clone()).or_insert(0);
        match event.operation {
            CdrOperation::Initialize => *counter += 1,
            // the counter never goes below zero
            CdrOperation::Finalize => *counter = counter.saturating_sub(1),
        }
        Ok(())
    }

    async fn is_busy(&self, extension: &str) -> Result<bool, CacheError> {
        Ok(self
            .counters
            .lock()
            .unwrap()
            .get(extension)
            .map(|counter| *counter > 0)
            .unwrap_or(false))
    }

    async fn busy_status(&self) -> Result<BTreeMap<String, u64>, CacheError> {
        Ok(self
            .counters
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect())
    }

    async fn flush(&self) -> Result<(), CacheError> {
        self.counters.lock().unwrap().clear();
        Ok(())
    }
}

const BUSY_HASH_KEY: &str = "busy_cache";

pub struct RedisBusyCache {
    connection: redis::aio::ConnectionManager,
}

impl RedisBusyCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        Ok(Self { connection })
    }
}

#[async_trait::async_trait]
impl BusyCache for RedisBusyCache {
    async fn apply(&self, event: &CdrEvent) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        match event.operation {
            CdrOperation::Initialize => {
                let _: i64 = connection.hincr(BUSY_HASH_KEY, &event.extension, 1).await?;
            }
            CdrOperation::Finalize => {
                let counter: i64 = connection.hincr(BUSY_HASH_KEY, &event.extension, -1).await?;
                if counter < 0 {
                    // a finalize without a matching initialize; pin at zero
                    let _: () = connection.hset(BUSY_HASH_KEY, &event.extension, 0).await?;
                }
            }
        }
        Ok(())
    }

    async fn is_busy(&self, extension: &str) -> Result<bool, CacheError> {
        let mut connection = self.connection.clone();
        let counter: Option<i64> = connection.hget(BUSY_HASH_KEY, extension).await?;
        Ok(counter.map(|c| c > 0).unwrap_or(false))
    }

    async fn busy_status(&self) -> Result<BTreeMap<String, u64>, CacheError> {
        let mut connection = self.connection.clone();
        let counters: HashMap<String, i64> = connection.hgetall(BUSY_HASH_KEY).await?;
        Ok(counters
            .into_iter()
            .map(|(extension, counter)| (extension, counter.max(0) as u64))
            .collect())
    }

    async fn flush(&self) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        let _: () = connection.del(BUSY_HASH_KEY).await?;
        Ok(())
    }
}
