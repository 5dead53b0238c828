//! Two-stage call-routing engine for event telephony networks.
//!
//! The engine cooperates with a Yate switch over its external-module bus:
//! stage 1 plans the fork tree for a dialed extension, stage 2 terminates
//! individual legs onto live registrations, the routing cache bridges the
//! two across deferred legs, and the busy cache counts concurrent calls
//! per extension from the switch's call-detail records.

use std::time::Duration;

pub mod busy;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod objects;
pub mod routing;
pub mod stage1;
pub mod stage2;
pub mod storage;

pub use engine::{Engine, EngineConfig, EngineError};
pub use error::{CacheError, ErrorCode, RoutingError, StorageError, TaskError};

/// Bounded retry policy for database transport errors.
pub(crate) const DB_RETRY_COUNT: u32 = 4;
pub(crate) const DB_RETRY_WAIT: Duration = Duration::from_secs(1);
