//! In-memory fixtures mirroring a small event network, plus an engine
//! harness wired to the switch simulator.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tandem::busy::MemoryBusyCache;
use tandem::cache::MemoryRoutingCache;
use tandem::engine::{Engine, EngineConfig};
use tandem::error::StorageError;
use tandem::objects::{
    Extension, ExtensionType, ForkRank, ForwardingMode, RankMember, RankMemberType, RankMode,
    Registration, User, Yate,
};
use tandem::storage::{RoutingStorage, Stage2Storage};
use yate_link::sim::{SimReply, SwitchSim};

pub const RINGBACK_ID: &str = "39bb3bad01bf931b34f3983536c0f331e4b4e3e38fb78abfc75e5b09efd6507f";

fn extension(
    id: i32,
    number: &str,
    name: &str,
    kind: ExtensionType,
    yate_id: Option<i32>,
) -> Extension {
    Extension {
        id: Some(id),
        yate_id,
        extension: number.to_string(),
        name: Some(name.to_string()),
        short_name: None,
        kind,
        outgoing_extension: None,
        outgoing_name: None,
        dialout_allowed: false,
        ringback: None,
        forwarding_mode: ForwardingMode::Disabled,
        forwarding_delay: None,
        forwarding_extension_id: None,
        lang: Some("de_DE".to_string()),
        tree_identifier: String::new(),
        forwarding_extension: None,
        fork_ranks: Vec::new(),
    }
}

fn member(extension: Extension) -> RankMember {
    RankMember {
        kind: RankMemberType::Default,
        active: true,
        extension,
    }
}

pub struct FixtureRouting {
    extensions: HashMap<String, Extension>,
    ranks: HashMap<i32, Vec<ForkRank>>,
}

impl FixtureRouting {
    /// The familiar little network: a group, a multiring, plain phones, a
    /// delayed and an immediate forward, a forward cycle and a trunk.
    pub fn testdata() -> Self {
        // dect is host 1, sip is host 2 (the local one in tests), app is 3
        let mut defs = vec![
            extension(1, "2000", "PoC", ExtensionType::Group, None),
            extension(2, "2001", "PoC Sascha", ExtensionType::Multiring, Some(1)),
            extension(3, "2002", "PoC Bernie", ExtensionType::Simple, Some(1)),
            extension(4, "2004", "PoC BeF", ExtensionType::Simple, Some(1)),
            extension(5, "2005", "PoC Sascha (SIP)", ExtensionType::Simple, Some(2)),
            extension(6, "2042", "PoC Garwin", ExtensionType::Simple, Some(2)),
            extension(7, "2099", "PoC Helpdesk", ExtensionType::Simple, Some(2)),
            extension(8, "2098", "PoC Helpdesk II", ExtensionType::Simple, Some(2)),
            extension(9, "4000", "Empty Group", ExtensionType::Group, None),
            extension(10, "4001", "Forward to empty group", ExtensionType::Simple, Some(2)),
            extension(11, "010", "City Trunk", ExtensionType::Trunk, Some(2)),
            extension(12, "5001", "Forward Pong", ExtensionType::Simple, Some(1)),
            extension(13, "5002", "Forward Ping", ExtensionType::Simple, Some(1)),
            extension(14, "3000", "Operations", ExtensionType::Group, None),
        ];
        for def in &mut defs {
            match def.extension.as_str() {
                "2002" => def.ringback = Some(RINGBACK_ID.to_string()),
                "3000" => def.short_name = Some("Ops".to_string()),
                "2099" => {
                    def.forwarding_mode = ForwardingMode::Enabled;
                    def.forwarding_delay = Some(20);
                    def.forwarding_extension_id = Some(6);
                }
                "2098" => {
                    def.forwarding_mode = ForwardingMode::Enabled;
                    def.forwarding_delay = Some(0);
                    def.forwarding_extension_id = Some(5);
                }
                "4001" => {
                    def.forwarding_mode = ForwardingMode::Enabled;
                    def.forwarding_delay = Some(10);
                    def.forwarding_extension_id = Some(9);
                }
                "5001" => {
                    def.forwarding_mode = ForwardingMode::Enabled;
                    def.forwarding_delay = Some(15);
                    def.forwarding_extension_id = Some(13);
                }
                "5002" => {
                    def.forwarding_mode = ForwardingMode::Enabled;
                    def.forwarding_delay = Some(15);
                    def.forwarding_extension_id = Some(12);
                }
                _ => {}
            }
        }

        let extensions: HashMap<String, Extension> = defs
            .into_iter()
            .map(|def| (def.extension.clone(), def))
            .collect();

        let mut ranks = HashMap::new();
        ranks.insert(
            1,
            vec![ForkRank {
                id: 1,
                extension_id: 1,
                index: 0,
                mode: RankMode::Default,
                delay: None,
                tree_identifier: String::new(),
                members: ["2001", "2002", "2004", "2042"]
                    .iter()
                    .map(|number| member(extensions[*number].clone()))
                    .collect(),
            }],
        );
        ranks.insert(
            2,
            vec![ForkRank {
                id: 2,
                extension_id: 2,
                index: 0,
                mode: RankMode::Default,
                delay: None,
                tree_identifier: String::new(),
                members: vec![member(extensions["2005"].clone())],
            }],
        );
        ranks.insert(
            14,
            vec![ForkRank {
                id: 3,
                extension_id: 14,
                index: 0,
                mode: RankMode::Default,
                delay: None,
                tree_identifier: String::new(),
                members: vec![member(extensions["2002"].clone())],
            }],
        );

        Self { extensions, ranks }
    }

    pub fn yates() -> HashMap<i32, Yate> {
        HashMap::from([
            (
                1,
                Yate {
                    id: 1,
                    hostname: "dect".into(),
                    guru3_identifier: "DECT".into(),
                    voip_listener: "local".into(),
                },
            ),
            (
                2,
                Yate {
                    id: 2,
                    hostname: "sip".into(),
                    guru3_identifier: "SIP".into(),
                    voip_listener: "local".into(),
                },
            ),
            (
                3,
                Yate {
                    id: 3,
                    hostname: "app".into(),
                    guru3_identifier: "APP".into(),
                    voip_listener: "local".into(),
                },
            ),
        ])
    }

    fn by_id(&self, id: i32) -> Option<&Extension> {
        self.extensions.values().find(|ext| ext.id == Some(id))
    }
}

#[async_trait::async_trait]
impl RoutingStorage for FixtureRouting {
    async fn load_extension(&self, extension: &str) -> Result<Extension, StorageError> {
        self.extensions
            .get(extension)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("extension {extension:?}")))
    }

    async fn load_trunk_extension(&self, dialed_number: &str) -> Result<Extension, StorageError> {
        let matches: Vec<&Extension> = self
            .extensions
            .values()
            .filter(|ext| {
                ext.kind == ExtensionType::Trunk && dialed_number.starts_with(&ext.extension)
            })
            .collect();
        match matches.as_slice() {
            [unique] => Ok((*unique).clone()),
            _ => Err(StorageError::NotFound(format!(
                "trunk for {dialed_number:?}"
            ))),
        }
    }

    async fn load_forwarding_extension(&self, of: &Extension) -> Result<Extension, StorageError> {
        of.forwarding_extension_id
            .and_then(|id| self.by_id(id))
            .cloned()
            .ok_or_else(|| {
                StorageError::NotFound(format!("forwarding target of {:?}", of.extension))
            })
    }

    async fn load_fork_ranks(&self, of: &Extension) -> Result<Vec<ForkRank>, StorageError> {
        Ok(of
            .id
            .and_then(|id| self.ranks.get(&id))
            .cloned()
            .unwrap_or_default())
    }

    async fn load_yates(&self) -> Result<HashMap<i32, Yate>, StorageError> {
        Ok(Self::yates())
    }
}

fn user(username: &str, displayname: &str, call_waiting: bool) -> User {
    User {
        username: username.to_string(),
        displayname: displayname.to_string(),
        password: "secret".to_string(),
        kind: "user".to_string(),
        static_target: None,
        trunk: false,
        call_waiting,
    }
}

fn registration(username: &str, location: &str, oconnection_id: &str) -> Registration {
    Registration {
        username: username.to_string(),
        location: location.to_string(),
        oconnection_id: oconnection_id.to_string(),
        expires: chrono::NaiveDateTime::default(),
    }
}

pub struct FixtureStage2 {
    users: HashMap<String, User>,
    registrations: Vec<Registration>,
    active_calls: Vec<(String, String)>,
}

impl FixtureStage2 {
    pub fn testdata() -> Self {
        let mut users: HashMap<String, User> = [
            user("2005", "PoC Sascha (SIP)", true),
            user("2042", "PoC Garwin", false),
            user("2066", "PoC Twin", true),
            user("2077", "PoC Nomad", true),
        ]
        .into_iter()
        .map(|user| (user.username.clone(), user))
        .collect();

        let mut trunk_user = user("010", "City Trunk", true);
        trunk_user.trunk = true;
        users.insert("010".to_string(), trunk_user);

        let mut static_user = user("2010", "Announcement", true);
        static_user.kind = "static".to_string();
        static_user.static_target = Some("external/nodata/announce.sh;lang=de".to_string());
        users.insert("2010".to_string(), static_user);

        Self {
            users,
            registrations: vec![
                registration("2005", "sip/sip:2005@1.2.3.4/foo", "internet"),
                registration("2042", "sip/sip:2042@4.3.2.1/bar", "internet"),
                registration("2066", "sip/sip:2066@1.1.1.1/a", "internet"),
                registration("2066", "sip/sip:2066@2.2.2.2/b", "dect"),
                registration("010", "sip/sip:010@10.0.0.1", "internet"),
            ],
            active_calls: vec![(
                "2042".to_string(),
                "83ded8b334034789a2c0e1405a54af76".to_string(),
            )],
        }
    }
}

#[async_trait::async_trait]
impl Stage2Storage for FixtureStage2 {
    async fn load_user(&self, username: &str) -> Result<User, StorageError> {
        self.users
            .get(username)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("user {username:?}")))
    }

    async fn load_trunk_user(&self, dialed_number: &str) -> Result<User, StorageError> {
        let matches: Vec<&User> = self
            .users
            .values()
            .filter(|user| user.trunk && dialed_number.starts_with(&user.username))
            .collect();
        match matches.as_slice() {
            [unique] => Ok((*unique).clone()),
            _ => Err(StorageError::NotFound(format!(
                "trunk user for {dialed_number:?}"
            ))),
        }
    }

    async fn load_registrations(&self, user: &User) -> Result<Vec<Registration>, StorageError> {
        Ok(self
            .registrations
            .iter()
            .filter(|reg| reg.username == user.username)
            .cloned()
            .collect())
    }

    async fn is_active_call(
        &self,
        username: &str,
        x_eventphone_id: &str,
    ) -> Result<bool, StorageError> {
        Ok(self
            .active_calls
            .iter()
            .any(|(user, id)| user == username && id == x_eventphone_id))
    }
}

pub struct Harness {
    pub sim: SwitchSim,
    pub routing_cache: Arc<MemoryRoutingCache>,
    pub busy_cache: Arc<MemoryBusyCache>,
}

/// Boots the engine against the fixtures and the switch simulator. Tests
/// talk to it exactly like the switch would.
pub async fn start_engine(ringback_exists: bool) -> Harness {
    let routing_cache = Arc::new(MemoryRoutingCache::new());
    let busy_cache = Arc::new(MemoryBusyCache::new());

    let engine = Engine {
        routing_storage: Arc::new(FixtureRouting::testdata()),
        stage2_storage: Arc::new(FixtureStage2::testdata()),
        routing_cache: routing_cache.clone(),
        busy_cache: busy_cache.clone(),
        yates: Arc::new(FixtureRouting::yates()),
        config: EngineConfig {
            local_yate_id: 2,
            internal_listener: "internal".to_string(),
            ringback_top_directory: PathBuf::from("/opt/sounds"),
            routing_time_warning: Duration::from_secs(5),
        },
        ringback_probe: if ringback_exists {
            Arc::new(|_| true)
        } else {
            Arc::new(|_| false)
        },
    };

    let (sim, stream) = SwitchSim::start();
    tokio::spawn(engine.serve(stream, std::future::pending()));
    sim.wait_for_handler("call.route").await;
    sim.wait_for_handler("call.cdr").await;

    Harness {
        sim,
        routing_cache,
        busy_cache,
    }
}

/// Builds the parameter set the switch would use to re-enter a fork leg:
/// the reply's global parameters plus the leg's own overrides, with
/// `called` rewritten to the leg's lateroute name.
pub fn reenter_leg(reply: &SimReply, leg_index: usize) -> BTreeMap<String, String> {
    let leg_prefix = format!("callto.{leg_index}.");
    let mut params: BTreeMap<String, String> = reply
        .params
        .iter()
        .filter(|(key, _)| !key.starts_with("callto."))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    for (key, value) in &reply.params {
        if let Some(stripped) = key.strip_prefix(&leg_prefix) {
            params.insert(stripped.to_string(), value.clone());
        }
    }
    let leg_target = reply.params[&format!("callto.{leg_index}")].clone();
    let called = leg_target
        .strip_prefix("lateroute/")
        .unwrap_or(&leg_target)
        .to_string();
    params.insert("called".to_string(), called);
    params
}
