//! Domain objects of the routing engine.
//!
//! [`Extension`] carries both the persisted attributes and the per-request
//! tree state: children adopted during discovery, the tree identifier used
//! for logging and result addressing, and the in-memory mutations the
//! discovery and generation visitors apply (disabled forwards, deactivated
//! members). None of these mutations ever reach the store.

use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "extension_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtensionType {
    Simple,
    Multiring,
    Group,
    External,
    Trunk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "forwarding_mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForwardingMode {
    Disabled,
    Enabled,
    OnBusy,
    OnUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "fork_rank_mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RankMode {
    Default,
    Next,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "fork_rankmember_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RankMemberType {
    Default,
    Auxiliary,
    Persistent,
}

impl RankMemberType {
    /// Auxiliary and persistent members carry an explicit `fork.calltype`.
    pub fn is_special_calltype(&self) -> bool {
        *self != RankMemberType::Default
    }

    pub fn fork_calltype(&self) -> &'static str {
        match self {
            RankMemberType::Default => "default",
            RankMemberType::Auxiliary => "auxiliary",
            RankMemberType::Persistent => "persistent",
        }
    }
}

/// A switch host known to the routing database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Yate {
    pub id: i32,
    pub hostname: String,
    pub guru3_identifier: String,
    pub voip_listener: String,
}

#[derive(Debug, Clone)]
pub struct Extension {
    /// Database id; absent on synthesized extensions.
    pub id: Option<i32>,
    pub yate_id: Option<i32>,
    pub extension: String,
    pub name: Option<String>,
    pub short_name: Option<String>,
    pub kind: ExtensionType,
    pub outgoing_extension: Option<String>,
    pub outgoing_name: Option<String>,
    pub dialout_allowed: bool,
    pub ringback: Option<String>,
    pub forwarding_mode: ForwardingMode,
    pub forwarding_delay: Option<i32>,
    pub forwarding_extension_id: Option<i32>,
    pub lang: Option<String>,

    /// Dash-separated id path assigned while the tree is built.
    pub tree_identifier: String,
    pub forwarding_extension: Option<Box<Extension>>,
    pub fork_ranks: Vec<ForkRank>,
}

impl Extension {
    fn synthesized(extension: &str, name: &str, kind: ExtensionType) -> Self {
        Self {
            id: None,
            yate_id: None,
            extension: extension.to_string(),
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
            lang: None,
            tree_identifier: String::new(),
            forwarding_extension: None,
            fork_ranks: Vec::new(),
        }
    }

    /// An off-net caller that has no row in the store.
    pub fn create_external(extension: &str, name: Option<&str>) -> Self {
        Self::synthesized(extension, name.unwrap_or("External"), ExtensionType::External)
    }

    /// A trusted caller identity we could not resolve.
    pub fn create_unknown(extension: &str) -> Self {
        Self::synthesized(extension, "Unknown", ExtensionType::Simple)
    }

    /// Token identifying this node in tree identifiers and deferred route
    /// names. Synthesized extensions fall back to their number.
    pub fn id_token(&self) -> String {
        match self.id {
            Some(id) => id.to_string(),
            None => self.extension.clone(),
        }
    }

    /// A forward with no delay replaces the extension outright.
    pub fn immediate_forward(&self) -> bool {
        self.forwarding_mode == ForwardingMode::Enabled && self.forwarding_delay == Some(0)
    }

    pub fn has_active_group_members(&self) -> bool {
        self.fork_ranks
            .iter()
            .any(|rank| rank.members.iter().any(|member| member.active))
    }

    /// Attaches the loaded forwarding target, stamping its tree identifier.
    pub fn adopt_forwarding(&mut self, mut target: Extension) {
        target.tree_identifier = format!("{}-{}", self.tree_identifier, target.id_token());
        self.forwarding_extension = Some(Box::new(target));
    }

    /// Attaches loaded fork ranks, stamping rank and member identifiers.
    pub fn adopt_fork_ranks(&mut self, mut ranks: Vec<ForkRank>) {
        for rank in &mut ranks {
            rank.tree_identifier = format!("{}-fr{}", self.tree_identifier, rank.id);
            for member in &mut rank.members {
                member.extension.tree_identifier =
                    format!("{}-{}", rank.tree_identifier, member.extension.id_token());
            }
        }
        self.fork_ranks = ranks;
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.extension, self.kind)
    }
}

/// An ordered group of fork legs below a Multiring or Group extension.
#[derive(Debug, Clone)]
pub struct ForkRank {
    pub id: i32,
    pub extension_id: i32,
    pub index: i32,
    pub mode: RankMode,
    pub delay: Option<i32>,
    pub tree_identifier: String,
    pub members: Vec<RankMember>,
}

#[derive(Debug, Clone)]
pub struct RankMember {
    pub kind: RankMemberType,
    pub active: bool,
    pub extension: Extension,
}

/// A stage-2 subscriber.
#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    pub displayname: String,
    pub password: String,
    /// `"user"` for registrations-backed routing, `"static"` for a fixed
    /// dial string in `static_target`.
    pub kind: String,
    pub static_target: Option<String>,
    pub trunk: bool,
    pub call_waiting: bool,
}

impl User {
    pub fn is_static(&self) -> bool {
        self.kind == "static"
    }
}

/// A current SIP registration of a [`User`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub username: String,
    pub location: String,
    pub oconnection_id: String,
    pub expires: chrono::NaiveDateTime,
}

impl Registration {
    /// The dial string for this location. Trunk users registered a generic
    /// location; the user part is swapped for the number actually dialed.
    pub fn call_target(&self, user: &User, dialed_number: &str) -> String {
        if !user.trunk {
            return self.location.clone();
        }
        self.location
            .replacen(&format!("{}@", user.username), &format!("{dialed_number}@"), 1)
    }
}

/// Loads the host map keyed by switch id, as used during generation.
pub type YatesDict = HashMap<i32, Yate>;

#[cfg(test)]
mod test {
    use super::*;

    fn user(trunk: bool) -> User {
        User {
            username: "010".into(),
            displayname: "Trunk".into(),
            password: "secret".into(),
            kind: "user".into(),
            static_target: None,
            trunk,
            call_waiting: true,
        }
    }

    fn registration(location: &str) -> Registration {
        Registration {
            username: "010".into(),
            location: location.into(),
            oconnection_id: "internet".into(),
            expires: chrono::NaiveDateTime::default(),
        }
    }

    #[test]
    fn trunk_location_is_rewritten_to_the_dialed_number() {
        let reg = registration("sip/sip:010@10.11.12.13;line=trunk");
        assert_eq!(
            reg.call_target(&user(true), "0105551234"),
            "sip/sip:0105551234@10.11.12.13;line=trunk"
        );
        // non-trunk users keep their registered location untouched
        assert_eq!(
            reg.call_target(&user(false), "0105551234"),
            "sip/sip:010@10.11.12.13;line=trunk"
        );
    }

    #[test]
    fn immediate_forward_requires_zero_delay() {
        let mut ext = Extension::create_unknown("2098");
        ext.forwarding_mode = ForwardingMode::Enabled;
        ext.forwarding_delay = Some(0);
        assert!(ext.immediate_forward());
        ext.forwarding_delay = Some(20);
        assert!(!ext.immediate_forward());
        ext.forwarding_mode = ForwardingMode::OnBusy;
        ext.forwarding_delay = Some(0);
        assert!(!ext.immediate_forward());
    }

    #[test]
    fn adopted_children_get_tree_identifiers() {
        let mut root = Extension::create_unknown("2000");
        root.id = Some(7);
        root.tree_identifier = root.id_token();

        let mut forward = Extension::create_unknown("2042");
        forward.id = Some(9);
        root.adopt_forwarding(forward);
        assert_eq!(
            root.forwarding_extension.as_ref().unwrap().tree_identifier,
            "7-9"
        );

        let mut member = Extension::create_unknown("2001");
        member.id = Some(3);
        root.adopt_fork_ranks(vec![ForkRank {
            id: 4,
            extension_id: 7,
            index: 0,
            mode: RankMode::Default,
            delay: None,
            tree_identifier: String::new(),
            members: vec![RankMember {
                kind: RankMemberType::Default,
                active: true,
                extension: member,
            }],
        }]);
        assert_eq!(root.fork_ranks[0].tree_identifier, "7-fr4");
        assert_eq!(
            root.fork_ranks[0].members[0].extension.tree_identifier,
            "7-fr4-3"
        );
    }
}
