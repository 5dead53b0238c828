//! Store seams for the two routing stages.
//!
//! The engine only ever reads. Both traits have a Postgres implementation in
//! [`pg`]; tests drive the routing core through in-memory fixtures instead.

use std::collections::HashMap;

use crate::error::StorageError;
use crate::objects::{Extension, ForkRank, Registration, User, Yate};

mod pg;

pub use pg::{PgRoutingStorage, PgStage2Storage};

/// Stage-1 store: extensions, fork ranks and the switch-host map.
#[async_trait::async_trait]
pub trait RoutingStorage: Send + Sync {
    async fn load_extension(&self, extension: &str) -> Result<Extension, StorageError>;

    /// The unique trunk extension whose number prefixes `dialed_number`.
    /// Multiple matches are a misconfiguration and read as not found.
    async fn load_trunk_extension(&self, dialed_number: &str) -> Result<Extension, StorageError>;

    /// The extension referenced by `of.forwarding_extension_id`.
    async fn load_forwarding_extension(&self, of: &Extension) -> Result<Extension, StorageError>;

    /// Fork ranks of `of`, ordered by rank index, members joined with their
    /// extensions.
    async fn load_fork_ranks(&self, of: &Extension) -> Result<Vec<ForkRank>, StorageError>;

    async fn load_yates(&self) -> Result<HashMap<i32, Yate>, StorageError>;
}

/// Stage-2 store: users, registrations and active calls.
#[async_trait::async_trait]
pub trait Stage2Storage: Send + Sync {
    async fn load_user(&self, username: &str) -> Result<User, StorageError>;

    /// The unique trunk user whose username prefixes `dialed_number`.
    async fn load_trunk_user(&self, dialed_number: &str) -> Result<User, StorageError>;

    async fn load_registrations(&self, user: &User) -> Result<Vec<Registration>, StorageError>;

    async fn is_active_call(
        &self,
        username: &str,
        x_eventphone_id: &str,
    ) -> Result<bool, StorageError>;
}
