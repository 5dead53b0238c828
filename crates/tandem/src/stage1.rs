//! Stage-1 routing: plan the fork tree for a dialed extension.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use yate_link::Message;

use crate::cache::RoutingCache;
use crate::error::{ErrorCode, RoutingError, StorageError, TaskError};
use crate::objects::{Extension, ExtensionType, Yate};
use crate::routing::{
    encode_routing_result, RoutingContext, RoutingTree, MAX_ROUTING_TREE_DEPTH,
};
use crate::storage::RoutingStorage;
use crate::{DB_RETRY_COUNT, DB_RETRY_WAIT};

pub struct Stage1Context {
    pub storage: Arc<dyn RoutingStorage>,
    pub cache: Arc<dyn RoutingCache>,
    pub yates: Arc<HashMap<i32, Yate>>,
    pub local_yate_id: i32,
    /// Callers arriving over this listener are trusted without a username.
    pub internal_listener: String,
    pub ringback_top_directory: PathBuf,
    pub ringback_probe: Arc<dyn Fn(&Path) -> bool + Send + Sync>,
    pub routing_time_warning: Duration,
}

/// Runs the stage-1 routing job for one call.route message, mutating it
/// into the reply. Returns whether the message was handled.
///
/// Database transport errors are retried with a fixed backoff; exhausted
/// retries answer `error=failure` rather than leaving the call hanging.
#[tracing::instrument(skip_all, fields(caller = message.param("caller").unwrap_or(""), called = message.param("called").unwrap_or("")))]
pub async fn route(ctx: &Stage1Context, message: &mut Message) -> bool {
    if message.param("caller").is_none() {
        // we do not route messages without a caller
        return false;
    }

    let started = Instant::now();
    let mut attempt = 0;
    let handled = loop {
        attempt += 1;
        match calculate(ctx, message).await {
            Ok(handled) => break handled,
            Err(err) if err.is_transport() && attempt < DB_RETRY_COUNT => {
                tracing::warn!(error = %err, attempt, "database error, waiting to retry");
                tokio::time::sleep(DB_RETRY_WAIT).await;
            }
            Err(err) => {
                tracing::error!(error = %err, "stage-1 routing gave up");
                message.set_param("error", ErrorCode::Failure.as_str());
                break true;
            }
        }
    };

    let elapsed = started.elapsed();
    if elapsed > ctx.routing_time_warning {
        tracing::warn!(
            elapsed_ms = elapsed.as_millis() as u64,
            "stage-1 routing exceeded the warning threshold"
        );
    }
    handled
}

/// One attempt: runs the routing pipeline and maps routing errors onto the
/// message. Only transport-class errors escape to the retry loop.
async fn calculate(ctx: &Stage1Context, message: &mut Message) -> Result<bool, TaskError> {
    let caller = message.param("caller").unwrap_or_default().to_string();
    let called = message.param("called").unwrap_or_default().to_string();

    let mut caller_params = BTreeMap::new();
    match try_route(ctx, message, &caller, &called, &mut caller_params).await {
        Ok(result) => {
            encode_routing_result(message, &result);
            tracing::debug!(target = %message.return_value, "stage-1 routing complete");
            Ok(true)
        }
        Err(TaskError::Routing(err)) if err.code == ErrorCode::NoRoute => {
            // not our call to claim; later handlers still deserve the
            // caller parameters we computed
            tracing::debug!("no stage-1 route, populating caller parameters and passing on");
            message.params.append(&mut caller_params);
            Ok(false)
        }
        Err(TaskError::Routing(err)) => {
            tracing::info!(error = %err, "stage-1 routing failed");
            message.set_param("error", err.code.as_str());
            Ok(true)
        }
        Err(err) if err.is_transport() => Err(err),
        Err(err) => {
            tracing::error!(error = %err, "unexpected error during stage-1 routing");
            message.set_param("error", ErrorCode::Failure.as_str());
            Ok(true)
        }
    }
}

async fn try_route(
    ctx: &Stage1Context,
    message: &Message,
    caller: &str,
    called: &str,
    caller_params: &mut BTreeMap<String, String>,
) -> Result<crate::routing::RoutingResult, TaskError> {
    let source = sanitize_caller(ctx, message, caller).await?;
    if source.kind != ExtensionType::External {
        *caller_params = source_parameters(&source);
    }

    let mut tree =
        RoutingTree::load(&*ctx.storage, source, called, caller_params.clone()).await?;
    let report = tree
        .discover(&*ctx.storage, MAX_ROUTING_TREE_DEPTH)
        .await?;
    if report.failed || report.pruned {
        tracing::debug!(
            failed = report.failed,
            pruned = report.pruned,
            "discovery trimmed the routing tree"
        );
    }

    let routing_ctx = RoutingContext {
        local_yate_id: ctx.local_yate_id,
        yates: &ctx.yates,
        ringback_top_directory: &ctx.ringback_top_directory,
        ringback_probe: &*ctx.ringback_probe,
    };
    let outcome = tree.calculate_routing(&routing_ctx)?;

    ctx.cache.update(outcome.cache_entries).await?;
    Ok(outcome.result)
}

/// Resolves and authenticates the caller identity.
///
/// Calls from the internal listener are trusted as-is; everyone else must
/// present a username matching the caller, or fails with `noauth` or
/// `forbidden`. Callers without a database row become synthesized
/// extensions.
async fn sanitize_caller(
    ctx: &Stage1Context,
    message: &Message,
    caller: &str,
) -> Result<Extension, TaskError> {
    if message.param("connection_id") == Some(ctx.internal_listener.as_str()) {
        return match ctx.storage.load_extension(caller).await {
            Ok(extension) => Ok(extension),
            Err(StorageError::NotFound(_)) => Ok(Extension::create_unknown(caller)),
            Err(err) => Err(err.into()),
        };
    }

    match ctx.storage.load_extension(caller).await {
        Ok(extension) => {
            let Some(username) = message.param("username") else {
                return Err(
                    RoutingError::new(ErrorCode::NoAuth, "caller requires authentication").into(),
                );
            };
            if username != caller {
                tracing::warn!(username, "caller spoofing attempt denied");
                return Err(RoutingError::new(
                    ErrorCode::Forbidden,
                    "invalid authentication for this caller",
                )
                .into());
            }
            Ok(extension)
        }
        // an unknown caller is someone off-net dialing in
        Err(StorageError::NotFound(_)) => Ok(Extension::create_external(caller, None)),
        Err(err) => Err(err.into()),
    }
}

/// Parameters derived from the caller's extension: rewritten caller id on
/// egress, the display name, language and dialout permission.
pub fn source_parameters(source: &Extension) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    match source.outgoing_extension.as_deref() {
        Some(outgoing) if !outgoing.is_empty() => {
            params.insert("caller".to_string(), outgoing.to_string());
            params.insert(
                "callername".to_string(),
                source.outgoing_name.clone().unwrap_or_default(),
            );
        }
        _ => {
            // callers do not get to pick their own display name
            if let Some(name) = &source.name {
                params.insert("callername".to_string(), name.clone());
            }
        }
    }
    if let Some(lang) = &source.lang {
        params.insert("osip_X-Caller-Language".to_string(), lang.clone());
    }
    if source.dialout_allowed {
        params.insert("osip_X-Dialout-Allowed".to_string(), "1".to_string());
    }
    params
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn outgoing_extension_rewrites_the_caller() {
        let mut source = Extension::create_unknown("2001");
        source.name = Some("PoC Sascha".into());
        source.outgoing_extension = Some("4912345".into());
        source.outgoing_name = Some("PoC".into());
        let params = source_parameters(&source);
        assert_eq!(params.get("caller").unwrap(), "4912345");
        assert_eq!(params.get("callername").unwrap(), "PoC");
    }

    #[test]
    fn plain_callers_get_their_stored_name_and_language() {
        let mut source = Extension::create_unknown("2001");
        source.name = Some("PoC Sascha".into());
        source.lang = Some("de_DE".into());
        source.dialout_allowed = true;
        let params = source_parameters(&source);
        assert_eq!(params.get("caller"), None);
        assert_eq!(params.get("callername").unwrap(), "PoC Sascha");
        assert_eq!(params.get("osip_X-Caller-Language").unwrap(), "de_DE");
        assert_eq!(params.get("osip_X-Dialout-Allowed").unwrap(), "1");
    }
}
