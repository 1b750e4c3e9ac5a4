//! User-related types and state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use treelink_proto::{ModeChange, NickIntro};

use crate::sync::ServerId;

/// Stable handle for a user, independent of nick changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// A user somewhere on the network.
#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub nick: String,
    /// Creation timestamp; the user's TS.
    pub age: i64,
    pub host: String,
    /// Displayed (possibly cloaked) host.
    pub dhost: String,
    pub ident: String,
    pub ip: String,
    pub gecos: String,
    /// Server the user is connected to.
    pub server: ServerId,
    /// Set user modes.
    pub modes: BTreeSet<char>,
    /// Operator type, once OPERTYPE has been seen.
    pub oper_type: Option<String>,
    pub away: Option<String>,
    /// Channels this user is in (case-folded names).
    pub channels: BTreeSet<String>,
    /// Extension data attached by other subsystems.
    pub metadata: BTreeMap<String, String>,
}

impl User {
    /// Build from a NICK introduction.
    pub fn from_intro(id: UserId, server: ServerId, intro: &NickIntro) -> Self {
        let mut user = Self {
            id,
            nick: intro.nick.clone(),
            age: intro.age,
            host: intro.host.clone(),
            dhost: intro.dhost.clone(),
            ident: intro.ident.clone(),
            ip: intro.ip.clone(),
            gecos: intro.gecos.clone(),
            server,
            modes: BTreeSet::new(),
            oper_type: None,
            away: None,
            channels: BTreeSet::new(),
            metadata: BTreeMap::new(),
        };
        user.apply_modes(&treelink_proto::mode::parse_user_modes(&intro.modes));
        user
    }

    /// The NICK introduction that recreates this user elsewhere.
    pub fn to_intro(&self) -> NickIntro {
        NickIntro {
            age: self.age,
            nick: self.nick.clone(),
            host: self.host.clone(),
            dhost: self.dhost.clone(),
            ident: self.ident.clone(),
            modes: self.mode_string(),
            ip: self.ip.clone(),
            gecos: self.gecos.clone(),
        }
    }

    /// Convert modes to a string like "+iw".
    pub fn mode_string(&self) -> String {
        let mut s = String::from("+");
        s.extend(self.modes.iter());
        s
    }

    /// Apply user mode changes.
    pub fn apply_modes(&mut self, changes: &[ModeChange]) {
        for change in changes {
            if change.adding {
                self.modes.insert(change.mode);
            } else {
                self.modes.remove(&change.mode);
            }
        }
    }

    /// Whether this user is an IRC operator.
    pub fn is_oper(&self) -> bool {
        self.oper_type.is_some() || self.modes.contains(&'o')
    }

    /// `ident@host` as matched by G/E/K lines.
    pub fn ident_host(&self) -> String {
        format!("{}@{}", self.ident, self.host)
    }

    /// `nick!ident@dhost`.
    pub fn hostmask(&self) -> String {
        format!("{}!{}@{}", self.nick, self.ident, self.dhost)
    }

    /// Whether two records describe the same session: same server,
    /// same TS, same ident and host.
    pub fn same_session(&self, server: ServerId, intro: &NickIntro) -> bool {
        self.server == server
            && self.age == intro.age
            && self.ident == intro.ident
            && self.host == intro.host
    }
}
