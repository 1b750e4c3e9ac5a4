//! Typed extension hooks.
//!
//! Collaborating subsystems (client handling, services, logging) register
//! observers for the categories they care about. Every method has an empty
//! default so an observer implements only what it needs. The engine calls
//! observers synchronously from inside its handlers; they must not block.

use tracing::{info, warn};
use treelink_proto::ModeChange;

use crate::telemetry::SNOTICE_TARGET;

/// Server linking, netsplits and operator notices.
pub trait LinkObserver: Send + Sync {
    /// A server joined the tree behind `parent`.
    fn server_linked(&self, _name: &str, _parent: &str) {}

    /// A server and everything behind it left the tree.
    fn server_split(&self, _name: &str, _reason: &str, _servers_lost: usize, _users_lost: usize) {
    }

    /// A remote PING we sent came back.
    fn pong_received(&self, _server: &str) {}

    /// Operator notice text.
    fn snotice(&self, _text: &str) {}
}

/// Channel and user mode changes applied from the network.
pub trait ModeObserver: Send + Sync {
    /// One change took effect on `target`.
    fn mode_applied(&self, _target: &str, _source: &str, _change: &ModeChange) {}

    /// A channel's TS was lowered during a merge.
    fn channel_ts_lowered(&self, _channel: &str, _old_ts: i64, _new_ts: i64) {}
}

/// Traffic and user removals that local clients must see.
pub trait MessageObserver: Send + Sync {
    /// PRIVMSG or NOTICE for a local user. `target` is the nick or channel
    /// the message was addressed to.
    fn deliver(&self, _recipient: &str, _source: &str, _target: &str, _text: &str, _notice: bool) {}

    /// A local user was removed by the network (KILL, collision, ban).
    fn user_killed(&self, _nick: &str, _reason: &str) {}

    /// A remote user left the network.
    fn user_quit(&self, _nick: &str, _reason: &str) {}

    /// A local user was kicked from a channel by a remote source.
    fn user_kicked(&self, _channel: &str, _nick: &str, _source: &str, _reason: &str) {}

    /// Reply to a remote TIME request made for a local user.
    fn time_reply(&self, _nick: &str, _server: &str, _ts: i64) {}
}

/// Registered observers, one list per category.
#[derive(Default)]
pub struct Hooks {
    link: Vec<Box<dyn LinkObserver>>,
    mode: Vec<Box<dyn ModeObserver>>,
    message: Vec<Box<dyn MessageObserver>>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("link", &self.link.len())
            .field("mode", &self.mode.len())
            .field("message", &self.message.len())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link_observer(&mut self, observer: Box<dyn LinkObserver>) {
        self.link.push(observer);
    }

    pub fn add_mode_observer(&mut self, observer: Box<dyn ModeObserver>) {
        self.mode.push(observer);
    }

    pub fn add_message_observer(&mut self, observer: Box<dyn MessageObserver>) {
        self.message.push(observer);
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Operator notice at info level.
    pub(crate) fn snotice(&self, text: &str) {
        info!(target: SNOTICE_TARGET, "{}", text);
        self.link.iter().for_each(|o| o.snotice(text));
    }

    /// Operator notice at warn level.
    pub(crate) fn snotice_warn(&self, text: &str) {
        warn!(target: SNOTICE_TARGET, "{}", text);
        self.link.iter().for_each(|o| o.snotice(text));
    }

    pub(crate) fn server_linked(&self, name: &str, parent: &str) {
        self.link.iter().for_each(|o| o.server_linked(name, parent));
    }

    pub(crate) fn server_split(&self, name: &str, reason: &str, servers: usize, users: usize) {
        self.link
            .iter()
            .for_each(|o| o.server_split(name, reason, servers, users));
    }

    pub(crate) fn pong_received(&self, server: &str) {
        self.link.iter().for_each(|o| o.pong_received(server));
    }

    pub(crate) fn mode_applied(&self, target: &str, source: &str, change: &ModeChange) {
        self.mode
            .iter()
            .for_each(|o| o.mode_applied(target, source, change));
    }

    pub(crate) fn channel_ts_lowered(&self, channel: &str, old_ts: i64, new_ts: i64) {
        self.mode
            .iter()
            .for_each(|o| o.channel_ts_lowered(channel, old_ts, new_ts));
    }

    pub(crate) fn deliver(&self, recipient: &str, source: &str, target: &str, text: &str, notice: bool) {
        self.message
            .iter()
            .for_each(|o| o.deliver(recipient, source, target, text, notice));
    }

    pub(crate) fn user_killed(&self, nick: &str, reason: &str) {
        self.message.iter().for_each(|o| o.user_killed(nick, reason));
    }

    pub(crate) fn user_quit(&self, nick: &str, reason: &str) {
        self.message.iter().for_each(|o| o.user_quit(nick, reason));
    }

    pub(crate) fn user_kicked(&self, channel: &str, nick: &str, source: &str, reason: &str) {
        self.message
            .iter()
            .for_each(|o| o.user_kicked(channel, nick, source, reason));
    }

    pub(crate) fn time_reply(&self, nick: &str, server: &str, ts: i64) {
        self.message
            .iter()
            .for_each(|o| o.time_reply(nick, server, ts));
    }
}
