//! The engine: wires the bus client to the routing stages and the caches.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use yate_link::{Client, HandlerVerdict, Message};

use crate::busy::{self, BusyCache, CdrEvent, CdrOperation};
use crate::cache::RoutingCache;
use crate::routing::encode_routing_result;
use crate::stage1::{self, Stage1Context};
use crate::stage2::{self, Stage2Context};
use crate::storage::{RoutingStorage, Stage2Storage};
use crate::objects::Yate;

/// call.route sits late in the chain so that accounting and early handlers
/// run first; call.cdr sits early because we only observe.
const CALL_ROUTE_PRIORITY: u32 = 90;
const CALL_CDR_PRIORITY: u32 = 5;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("switch transport failed: {0}")]
    Transport(#[from] yate_link::Error),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub local_yate_id: i32,
    pub internal_listener: String,
    pub ringback_top_directory: PathBuf,
    pub routing_time_warning: Duration,
}

/// Owns every shared resource of the routing process.
pub struct Engine {
    pub routing_storage: Arc<dyn RoutingStorage>,
    pub stage2_storage: Arc<dyn Stage2Storage>,
    pub routing_cache: Arc<dyn RoutingCache>,
    pub busy_cache: Arc<dyn BusyCache>,
    pub yates: Arc<HashMap<i32, Yate>>,
    pub config: EngineConfig,
    pub ringback_probe: Arc<dyn Fn(&Path) -> bool + Send + Sync>,
}

impl Engine {
    /// The production ringback probe: a plain filesystem check.
    pub fn default_ringback_probe() -> Arc<dyn Fn(&Path) -> bool + Send + Sync> {
        Arc::new(|path: &Path| path.is_file())
    }

    /// Serves the switch connection until `shutdown` resolves or the
    /// transport drops. In-flight routing tasks finish on their own; their
    /// replies are dropped once the connection is gone.
    pub async fn serve<S>(
        self,
        stream: S,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), EngineError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (client, connection) = yate_link::connect(stream, "global").await?;
        let driver = tokio::spawn(connection.run());

        client.setlocal("bufsize", "8192").await?;

        let (cdr_tx, cdr_rx) = mpsc::unbounded_channel();
        let cdr_worker = tokio::spawn(busy::serve_cdr_events(self.busy_cache.clone(), cdr_rx));

        let stage1 = Arc::new(Stage1Context {
            storage: self.routing_storage.clone(),
            cache: self.routing_cache.clone(),
            yates: self.yates.clone(),
            local_yate_id: self.config.local_yate_id,
            internal_listener: self.config.internal_listener.clone(),
            ringback_top_directory: self.config.ringback_top_directory.clone(),
            ringback_probe: self.ringback_probe.clone(),
            routing_time_warning: self.config.routing_time_warning,
        });
        let stage2 = Arc::new(Stage2Context {
            storage: self.stage2_storage.clone(),
            busy_cache: self.busy_cache.clone(),
        });

        let route_handler = {
            let client = client.clone();
            let routing_cache = self.routing_cache.clone();
            move |message: Message| {
                dispatch_call_route(&client, &stage1, &stage2, &routing_cache, message)
            }
        };
        client
            .install("call.route", CALL_ROUTE_PRIORITY, route_handler)
            .await?;

        let cdr_handler = move |message: Message| {
            let operation = message.param("operation").and_then(CdrOperation::parse);
            let extension = message.param("external").map(str::to_string);
            if let (Some(operation), Some(extension)) = (operation, extension) {
                if cdr_tx
                    .send(CdrEvent {
                        operation,
                        extension,
                    })
                    .is_err()
                {
                    tracing::warn!("busy-cache worker is gone, dropping call.cdr event");
                }
            }
            // we observe call records, we never claim them; the counter
            // update happens out of band on the worker
            HandlerVerdict::Answer {
                message,
                processed: false,
            }
        };
        client
            .install("call.cdr", CALL_CDR_PRIORITY, cdr_handler)
            .await?;

        tracing::info!("ready to route");

        tokio::pin!(shutdown);
        let result = tokio::select! {
            () = &mut shutdown => {
                tracing::info!("caught shutdown signal, refusing new work and exiting");
                Ok(())
            }
            driven = driver => match driven {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(EngineError::Transport(err)),
                Err(join_error) => {
                    tracing::error!(error = %join_error, "connection driver crashed");
                    Err(EngineError::Transport(yate_link::Error::ConnectionLost))
                }
            },
        };
        cdr_worker.abort();
        result
    }
}

/// Classifies an inbound call.route message.
///
/// Deferred stage-1 names are answered from the routing cache; stage-2
/// names, tags and re-entered local legs terminate on registrations;
/// plain digit strings get a fresh stage-1 plan. Anything else is not ours.
fn dispatch_call_route(
    client: &Client,
    stage1: &Arc<Stage1Context>,
    stage2: &Arc<Stage2Context>,
    routing_cache: &Arc<dyn RoutingCache>,
    message: Message,
) -> HandlerVerdict {
    let called = message.param("called").unwrap_or_default().to_string();
    if called.is_empty() {
        return HandlerVerdict::Answer {
            message,
            processed: false,
        };
    }

    if called.starts_with("stage1-") {
        let client = client.clone();
        let routing_cache = routing_cache.clone();
        tokio::spawn(answer_from_cache(routing_cache, client, message));
        return HandlerVerdict::Deferred;
    }

    if called.starts_with("stage2-") || message.param("eventphone_stage2") == Some("1") {
        let client = client.clone();
        let ctx = stage2.clone();
        tokio::spawn(async move {
            let mut message = message;
            let handled = stage2::route(&ctx, &mut message).await;
            client.answer(message, handled);
        });
        return HandlerVerdict::Deferred;
    }

    if called.bytes().all(|b| b.is_ascii_digit()) {
        let client = client.clone();
        let ctx = stage1.clone();
        tokio::spawn(async move {
            let mut message = message;
            let handled = stage1::route(&ctx, &mut message).await;
            client.answer(message, handled);
        });
        return HandlerVerdict::Deferred;
    }

    HandlerVerdict::Answer {
        message,
        processed: false,
    }
}

/// Answers a re-entered deferred leg with its cached sub-plan. Cache misses
/// and cache errors both answer with an empty target so the switch drops
/// the leg instead of waiting for it.
async fn answer_from_cache(
    routing_cache: Arc<dyn RoutingCache>,
    client: Client,
    mut message: Message,
) {
    let key = format!("lateroute/{}", message.param("called").unwrap_or_default());
    match routing_cache.retrieve(&key).await {
        Ok(Some(result)) => {
            encode_routing_result(&mut message, &result);
            client.answer(message, true);
        }
        Ok(None) => {
            tracing::warn!(%key, "no cached routing result, answering with an empty target");
            message.return_value.clear();
            client.answer(message, true);
        }
        Err(err) => {
            tracing::error!(
                error = %err,
                %key,
                "routing-cache retrieval failed, answering with an empty target"
            );
            message.return_value.clear();
            client.answer(message, true);
        }
    }
}
