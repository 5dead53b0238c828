//! Postgres implementations of the store seams.

use std::collections::HashMap;

use sqlx::PgPool;

use crate::error::StorageError;
use crate::objects::{
    Extension, ExtensionType, ForkRank, ForwardingMode, RankMember, RankMemberType, RankMode,
    Registration, User, Yate,
};
use crate::storage::{RoutingStorage, Stage2Storage};

const EXTENSION_COLUMNS: &str = "id, yate_id, extension, name, short_name, type as kind, \
     outgoing_extension, outgoing_name, dialout_allowed, ringback, \
     forwarding_mode, forwarding_delay, forwarding_extension_id, lang";

#[derive(sqlx::FromRow)]
struct ExtensionRow {
    id: i32,
    yate_id: Option<i32>,
    extension: String,
    name: Option<String>,
    short_name: Option<String>,
    kind: ExtensionType,
    outgoing_extension: Option<String>,
    outgoing_name: Option<String>,
    dialout_allowed: Option<bool>,
    ringback: Option<String>,
    forwarding_mode: ForwardingMode,
    forwarding_delay: Option<i32>,
    forwarding_extension_id: Option<i32>,
    lang: Option<String>,
}

impl From<ExtensionRow> for Extension {
    fn from(row: ExtensionRow) -> Self {
        Extension {
            id: Some(row.id),
            yate_id: row.yate_id,
            extension: row.extension,
            name: row.name,
            short_name: row.short_name,
            kind: row.kind,
            outgoing_extension: row.outgoing_extension,
            outgoing_name: row.outgoing_name,
            dialout_allowed: row.dialout_allowed.unwrap_or(false),
            ringback: row.ringback,
            forwarding_mode: row.forwarding_mode,
            forwarding_delay: row.forwarding_delay,
            forwarding_extension_id: row.forwarding_extension_id,
            lang: row.lang,
            tree_identifier: String::new(),
            forwarding_extension: None,
            fork_ranks: Vec::new(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ForkRankRow {
    rank_id: i32,
    rank_extension_id: i32,
    rank_index: i32,
    rank_mode: RankMode,
    rank_delay: Option<i32>,
    member_type: RankMemberType,
    member_active: bool,
    #[sqlx(flatten)]
    extension: ExtensionRow,
}

pub struct PgRoutingStorage {
    pool: PgPool,
}

impl PgRoutingStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RoutingStorage for PgRoutingStorage {
    async fn load_extension(&self, extension: &str) -> Result<Extension, StorageError> {
        let query = format!(r#"select {EXTENSION_COLUMNS} from "Extension" where extension = $1"#);
        let row: Option<ExtensionRow> = sqlx::query_as(&query)
            .bind(extension)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.into()),
            None => Err(StorageError::NotFound(format!("extension {extension:?}"))),
        }
    }

    async fn load_trunk_extension(&self, dialed_number: &str) -> Result<Extension, StorageError> {
        let query = format!(
            r#"select {EXTENSION_COLUMNS} from "Extension"
               where type = 'TRUNK' and $1 like extension || '%'"#
        );
        let mut rows: Vec<ExtensionRow> = sqlx::query_as(&query)
            .bind(dialed_number)
            .fetch_all(&self.pool)
            .await?;
        match rows.len() {
            1 => Ok(rows.remove(0).into()),
            0 => Err(StorageError::NotFound(format!(
                "trunk for {dialed_number:?}"
            ))),
            matches => {
                tracing::warn!(
                    dialed_number,
                    matches,
                    "trunk misconfiguration, multiple prefixes match"
                );
                Err(StorageError::NotFound(format!(
                    "unique trunk for {dialed_number:?}"
                )))
            }
        }
    }

    async fn load_forwarding_extension(&self, of: &Extension) -> Result<Extension, StorageError> {
        let Some(forwarding_id) = of.forwarding_extension_id else {
            return Err(StorageError::NotFound(format!(
                "forwarding target of extension {:?}",
                of.extension
            )));
        };
        let query = format!(r#"select {EXTENSION_COLUMNS} from "Extension" where id = $1"#);
        let row: Option<ExtensionRow> = sqlx::query_as(&query)
            .bind(forwarding_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.into()),
            None => Err(StorageError::NotFound(format!(
                "forwarding target {forwarding_id} of extension {:?}",
                of.extension
            ))),
        }
    }

    async fn load_fork_ranks(&self, of: &Extension) -> Result<Vec<ForkRank>, StorageError> {
        let Some(extension_id) = of.id else {
            return Ok(Vec::new());
        };
        let query = format!(
            r#"select
                   fr.id as rank_id, fr.extension_id as rank_extension_id,
                   fr."index" as rank_index, fr.mode as rank_mode, fr.delay as rank_delay,
                   frm.rankmember_type as member_type, frm.active as member_active,
                   e.{}
               from "ForkRank" fr
               join "ForkRankMember" frm on frm.forkrank_id = fr.id
               join "Extension" e on e.id = frm.extension_id
               where fr.extension_id = $1
               order by fr."index" asc, fr.id asc"#,
            EXTENSION_COLUMNS.replace(", ", ", e.")
        );
        let rows: Vec<ForkRankRow> = sqlx::query_as(&query)
            .bind(extension_id)
            .fetch_all(&self.pool)
            .await?;

        let mut ranks: Vec<ForkRank> = Vec::new();
        for row in rows {
            if ranks.last().map(|rank| rank.id) != Some(row.rank_id) {
                ranks.push(ForkRank {
                    id: row.rank_id,
                    extension_id: row.rank_extension_id,
                    index: row.rank_index,
                    mode: row.rank_mode,
                    delay: row.rank_delay,
                    tree_identifier: String::new(),
                    members: Vec::new(),
                });
            }
            if let Some(rank) = ranks.last_mut() {
                rank.members.push(RankMember {
                    kind: row.member_type,
                    active: row.member_active,
                    extension: row.extension.into(),
                });
            }
        }
        Ok(ranks)
    }

    async fn load_yates(&self) -> Result<HashMap<i32, Yate>, StorageError> {
        #[derive(sqlx::FromRow)]
        struct YateRow {
            id: i32,
            hostname: String,
            guru3_identifier: String,
            voip_listener: String,
        }

        let rows: Vec<YateRow> =
            sqlx::query_as(r#"select id, hostname, guru3_identifier, voip_listener from "Yate""#)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.id,
                    Yate {
                        id: row.id,
                        hostname: row.hostname,
                        guru3_identifier: row.guru3_identifier,
                        voip_listener: row.voip_listener,
                    },
                )
            })
            .collect())
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    username: String,
    displayname: String,
    password: String,
    kind: Option<String>,
    static_target: Option<String>,
    trunk: bool,
    call_waiting: bool,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            username: row.username,
            displayname: row.displayname,
            password: row.password,
            kind: row.kind.unwrap_or_else(|| "user".to_string()),
            static_target: row.static_target,
            trunk: row.trunk,
            call_waiting: row.call_waiting,
        }
    }
}

const USER_COLUMNS: &str =
    "username, displayname, password, type as kind, static_target, trunk, call_waiting";

pub struct PgStage2Storage {
    pool: PgPool,
}

impl PgStage2Storage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl Stage2Storage for PgStage2Storage {
    async fn load_user(&self, username: &str) -> Result<User, StorageError> {
        let query = format!("select {USER_COLUMNS} from users where username = $1");
        let row: Option<UserRow> = sqlx::query_as(&query)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.into()),
            None => Err(StorageError::NotFound(format!("user {username:?}"))),
        }
    }

    async fn load_trunk_user(&self, dialed_number: &str) -> Result<User, StorageError> {
        let query = format!(
            "select {USER_COLUMNS} from users where trunk = true and $1 like username || '%'"
        );
        let mut rows: Vec<UserRow> = sqlx::query_as(&query)
            .bind(dialed_number)
            .fetch_all(&self.pool)
            .await?;
        match rows.len() {
            1 => Ok(rows.remove(0).into()),
            0 => Err(StorageError::NotFound(format!(
                "trunk user for {dialed_number:?}"
            ))),
            matches => {
                tracing::warn!(
                    dialed_number,
                    matches,
                    "trunk misconfiguration, multiple prefixes match"
                );
                Err(StorageError::NotFound(format!(
                    "unique trunk user for {dialed_number:?}"
                )))
            }
        }
    }

    async fn load_registrations(&self, user: &User) -> Result<Vec<Registration>, StorageError> {
        #[derive(sqlx::FromRow)]
        struct RegistrationRow {
            username: String,
            location: String,
            oconnection_id: String,
            expires: chrono::NaiveDateTime,
        }

        let rows: Vec<RegistrationRow> = sqlx::query_as(
            "select username, location, oconnection_id, expires \
             from registrations where username = $1",
        )
        .bind(&user.username)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| Registration {
                username: row.username,
                location: row.location,
                oconnection_id: row.oconnection_id,
                expires: row.expires,
            })
            .collect())
    }

    async fn is_active_call(
        &self,
        username: &str,
        x_eventphone_id: &str,
    ) -> Result<bool, StorageError> {
        let count: i64 = sqlx::query_scalar(
            "select count(*) from active_calls \
             where username = $1 and x_eventphone_id = $2",
        )
        .bind(username)
        .bind(x_eventphone_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}
