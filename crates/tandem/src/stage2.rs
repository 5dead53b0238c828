//! Stage-2 routing: terminate a leg onto a user's live registrations.

use std::sync::Arc;

use yate_link::Message;

use crate::busy::BusyCache;
use crate::error::{ErrorCode, StorageError, TaskError};
use crate::objects::User;
use crate::storage::Stage2Storage;
use crate::{DB_RETRY_COUNT, DB_RETRY_WAIT};

const HEADER_EVENTPHONE_ID: &str = "X-Eventphone-Id";
const HEADER_NO_CALL_WAIT: &str = "X-No-Call-Wait";

pub struct Stage2Context {
    pub storage: Arc<dyn Stage2Storage>,
    pub busy_cache: Arc<dyn BusyCache>,
}

/// Runs the stage-2 termination job for one call.route message, mutating it
/// into the reply. Returns whether the message was handled.
#[tracing::instrument(skip_all, fields(caller = message.param("caller").unwrap_or(""), called = message.param("called").unwrap_or("")))]
pub async fn route(ctx: &Stage2Context, message: &mut Message) -> bool {
    if message.param("caller").is_none() {
        // we do not route messages without a caller
        return false;
    }

    let mut attempt = 0;
    loop {
        attempt += 1;
        match calculate(ctx, message).await {
            Ok(handled) => break handled,
            Err(err) if err.is_transport() && attempt < DB_RETRY_COUNT => {
                tracing::warn!(error = %err, attempt, "database error, waiting to retry");
                tokio::time::sleep(DB_RETRY_WAIT).await;
            }
            Err(err) => {
                tracing::error!(error = %err, "stage-2 routing gave up");
                message.set_param("error", ErrorCode::Failure.as_str());
                break true;
            }
        }
    }
}

async fn calculate(ctx: &Stage2Context, message: &mut Message) -> Result<bool, TaskError> {
    let called_raw = message.param("called").unwrap_or_default().to_string();
    let called = called_raw
        .strip_prefix("stage2-")
        .unwrap_or(&called_raw)
        .to_string();

    let user = match ctx.storage.load_user(&called).await {
        Ok(user) => user,
        Err(StorageError::NotFound(_)) => match ctx.storage.load_trunk_user(&called).await {
            Ok(user) => user,
            Err(StorageError::NotFound(_)) => {
                tracing::debug!("no stage-2 user or trunk, passing on");
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        },
        Err(err) => return Err(err.into()),
    };

    if user.is_static() {
        return Ok(static_target_routing(message, &user));
    }

    let locations = ctx.storage.load_registrations(&user).await?;
    if locations.is_empty() {
        message.set_param("error", ErrorCode::Offline.as_str());
        message.set_param("reason", ErrorCode::Offline.as_str());
        return Ok(true);
    }

    let eventphone_id = sip_header(message, HEADER_EVENTPHONE_ID);
    let no_call_wait = sip_header(message, HEADER_NO_CALL_WAIT);

    // a knocking call is refused when call waiting is off for this call
    if no_call_wait.as_deref() == Some("1") || !user.call_waiting {
        match ctx.busy_cache.is_busy(&user.username).await {
            Ok(true) => {
                message.set_param("error", ErrorCode::Busy.as_str());
                return Ok(true);
            }
            Ok(false) => {}
            Err(err) => tracing::error!(
                error = %err,
                extension = %user.username,
                "busy-cache lookup failed, assuming the extension is free"
            ),
        }
    }

    // the same routing run must not terminate twice on one user
    if let Some(eventphone_id) = eventphone_id.as_deref().filter(|id| !id.is_empty()) {
        if ctx
            .storage
            .is_active_call(&user.username, eventphone_id)
            .await?
        {
            message.set_param("error", ErrorCode::Busy.as_str());
            return Ok(true);
        }
    }

    if locations.len() == 1 {
        message.return_value = locations[0].call_target(&user, &called);
        message.set_param("oconnection_id", locations[0].oconnection_id.clone());
    } else {
        message.return_value = "fork".to_string();
        for (i, location) in locations.iter().enumerate() {
            let index = i + 1;
            message.set_param(format!("callto.{index}"), location.call_target(&user, &called));
            message.set_param(
                format!("callto.{index}.oconnection_id"),
                location.oconnection_id.clone(),
            );
        }
    }

    populate_cdr_parameters(message, eventphone_id.as_deref());
    tracing::debug!(target = %message.return_value, "stage-2 routing complete");
    Ok(true)
}

/// A static user routes to a fixed dial string of the form
/// `<target>;key=value;...`.
fn static_target_routing(message: &mut Message, user: &User) -> bool {
    let Some(static_target) = user.static_target.as_deref() else {
        tracing::error!(username = %user.username, "static user without a static_target");
        message.set_param("error", ErrorCode::Failure.as_str());
        return true;
    };

    let mut parts = static_target.split(';');
    let target = parts.next().unwrap_or_default().to_string();
    let mut extra_params = Vec::new();
    for part in parts {
        match part.split_once('=') {
            Some((key, value)) => extra_params.push((key.to_string(), value.to_string())),
            None => {
                tracing::error!(
                    username = %user.username,
                    static_target,
                    "invalid static call target"
                );
                message.set_param("error", ErrorCode::Failure.as_str());
                return true;
            }
        }
    }

    message.return_value = target;
    let eventphone_id = sip_header(message, HEADER_EVENTPHONE_ID);
    populate_cdr_parameters(message, eventphone_id.as_deref());
    for (key, value) in extra_params {
        message.set_param(key, value);
    }
    true
}

/// SIP headers arrive either `osip_`-prefixed verbatim or `sip_`-prefixed
/// lowercased, depending on the channel that accepted the call.
fn sip_header(message: &Message, header: &str) -> Option<String> {
    message
        .param(&format!("osip_{header}"))
        .or_else(|| message.param(&format!("sip_{}", header.to_lowercase())))
        .map(str::to_string)
}

/// Stamps the routing id and asks cdrbuild to copy it into the call record,
/// so call.cdr events can be correlated back to the routing run.
fn populate_cdr_parameters(message: &mut Message, eventphone_id: Option<&str>) {
    message.set_param(HEADER_EVENTPHONE_ID, eventphone_id.unwrap_or_default());
    let copyparams = match message.param("copyparams") {
        Some(existing) if !existing.is_empty() => format!("{existing},{HEADER_EVENTPHONE_ID}"),
        _ => HEADER_EVENTPHONE_ID.to_string(),
    };
    message.set_param("copyparams", copyparams);
}
