//! Network state context.
//!
//! Holds every user, channel, x-line and network-wide metadata entry the
//! engine knows about. One [`NetworkState`] is owned by one engine; tests
//! build a fresh one per case.

mod channel;
mod user;
mod xline;

pub use channel::{Channel, ChannelModes, ListEntry, MemberModes, Topic};
pub use user::{User, UserId};
pub use xline::{XLine, XLineKind, XLineSet};

use std::collections::{BTreeMap, HashMap};

use treelink_proto::{NickIntro, irc_to_lower};

use crate::sync::ServerId;

/// Users, channels and bans.
#[derive(Debug, Default)]
pub struct NetworkState {
    users: BTreeMap<UserId, User>,
    nicks: HashMap<String, UserId>,
    channels: BTreeMap<String, Channel>,
    pub xlines: XLineSet,
    /// Network-wide metadata (`METADATA * key :value`).
    pub metadata: BTreeMap<String, String>,
    next_uid: u64,
}

impl NetworkState {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Register a user. The caller has already resolved nick collisions.
    pub fn add_user(&mut self, server: ServerId, intro: &NickIntro) -> UserId {
        self.next_uid += 1;
        let id = UserId(self.next_uid);
        self.nicks.insert(irc_to_lower(&intro.nick), id);
        self.users.insert(id, User::from_intro(id, server, intro));
        id
    }

    pub fn find_nick(&self, nick: &str) -> Option<UserId> {
        self.nicks.get(&irc_to_lower(nick)).copied()
    }

    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn user_mut(&mut self, id: UserId) -> Option<&mut User> {
        self.users.get_mut(&id)
    }

    pub fn user_by_nick(&self, nick: &str) -> Option<&User> {
        self.find_nick(nick).and_then(|id| self.users.get(&id))
    }

    /// All users in creation order.
    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Users connected to `server`.
    pub fn users_on(&self, server: ServerId) -> Vec<UserId> {
        self.users
            .values()
            .filter(|u| u.server == server)
            .map(|u| u.id)
            .collect()
    }

    /// Change a user's nick. Returns `false` if the user is unknown.
    pub fn rename(&mut self, id: UserId, new_nick: &str) -> bool {
        let Some(user) = self.users.get_mut(&id) else {
            return false;
        };
        self.nicks.remove(&irc_to_lower(&user.nick));
        user.nick = new_nick.to_string();
        self.nicks.insert(irc_to_lower(new_nick), id);
        true
    }

    /// Remove a user from the network and every channel. Channels left
    /// empty are destroyed.
    pub fn remove_user(&mut self, id: UserId) -> Option<User> {
        let user = self.users.remove(&id)?;
        let key = irc_to_lower(&user.nick);
        if self.nicks.get(&key) == Some(&id) {
            self.nicks.remove(&key);
        }
        for chan in &user.channels {
            self.leave(chan, id);
        }
        Some(user)
    }

    /// First active x-line matching the user, counting the hit.
    pub fn match_xline(&mut self, id: UserId) -> Option<XLine> {
        let user = self.users.get(&id)?;
        self.xlines.match_user(user)
    }

    // ========================================================================
    // Channels
    // ========================================================================

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(&irc_to_lower(name))
    }

    pub fn channel_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.get_mut(&irc_to_lower(name))
    }

    /// All channels in name order.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Fetch a channel, creating it with `ts` if it does not exist.
    pub fn channel_or_create(&mut self, name: &str, ts: i64) -> &mut Channel {
        self.channels
            .entry(irc_to_lower(name))
            .or_insert_with(|| Channel::new(name, ts))
    }

    /// Put a user in a channel with the given privileges.
    pub fn join(&mut self, channel: &str, id: UserId, modes: MemberModes) -> bool {
        let key = irc_to_lower(channel);
        let (Some(user), Some(chan)) = (self.users.get_mut(&id), self.channels.get_mut(&key))
        else {
            return false;
        };
        user.channels.insert(key);
        chan.join(id, modes);
        true
    }

    /// Take a user out of a channel, destroying it if empty.
    pub fn part(&mut self, channel: &str, id: UserId) -> bool {
        let key = irc_to_lower(channel);
        let was_member = self
            .users
            .get_mut(&id)
            .map(|u| u.channels.remove(&key))
            .unwrap_or(false);
        self.leave(&key, id) || was_member
    }

    /// Destroy a channel that has no members.
    pub fn prune_channel(&mut self, name: &str) -> bool {
        let key = irc_to_lower(name);
        if self.channels.get(&key).is_some_and(Channel::is_empty) {
            self.channels.remove(&key);
            return true;
        }
        false
    }

    fn leave(&mut self, key: &str, id: UserId) -> bool {
        let Some(chan) = self.channels.get_mut(key) else {
            return false;
        };
        let removed = chan.members.remove(&id).is_some();
        if chan.is_empty() {
            self.channels.remove(key);
        }
        removed
    }
}
