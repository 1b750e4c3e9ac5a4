//! CONNECTED-state dispatch.
//!
//! Every line from an authenticated peer is checked for direction first:
//! its source (prefix, or the peer itself when there is none) must be a
//! server or user reached through the link it arrived on. Lines that fail
//! the check are logged and dropped. Everything else is applied locally and,
//! unless it only concerns us, relayed to every other direct peer.

use tracing::{debug, info, warn};
use treelink_proto::{Command, Message, NickIntro, irc_eq, wildcard_match};

use super::engine::SpanningTree;
use super::link::LinkId;
use super::topology::{ServerId, TopologyError};
use crate::error::{LinkError, LinkResult};
use crate::metrics;
use crate::state::{UserId, XLine, XLineKind};

/// Resolved source of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Origin {
    Server(ServerId),
    User(UserId),
}

/// Where a line came from: the link, its peer, and the resolved source.
#[derive(Debug, Clone)]
pub(super) struct Inbound {
    pub link: LinkId,
    /// Direct peer the link belongs to.
    pub from: ServerId,
    /// Source name as written (prefix or peer name).
    pub source: String,
    pub origin: Origin,
}

impl Inbound {
    pub(super) fn server(&self) -> Option<ServerId> {
        match self.origin {
            Origin::Server(s) => Some(s),
            Origin::User(_) => None,
        }
    }

    pub(super) fn user(&self) -> Option<UserId> {
        match self.origin {
            Origin::User(u) => Some(u),
            Origin::Server(_) => None,
        }
    }
}

pub(super) fn is_channel(name: &str) -> bool {
    name.starts_with('#') || name.starts_with('&')
}

/// Line kinds accepted from the wire. K-lines are local and never travel.
fn network_kind(c: char) -> Option<XLineKind> {
    XLineKind::from_char(c).filter(|k| k.is_network())
}

impl SpanningTree {
    pub(super) fn resolve_origin(&self, source: &str) -> Option<Origin> {
        if let Some(id) = self.directory.find(source) {
            return Some(Origin::Server(id));
        }
        self.state.find_nick(source).map(Origin::User)
    }

    fn origin_route(&self, origin: Origin) -> Option<ServerId> {
        match origin {
            Origin::Server(id) => self.directory.route_of(id),
            Origin::User(uid) => self
                .state
                .user(uid)
                .and_then(|u| self.directory.route_of(u.server)),
        }
    }

    /// Name of the server a line's origin lives on.
    pub(super) fn origin_server_name(&self, origin: Origin) -> String {
        let server = match origin {
            Origin::Server(id) => Some(id),
            Origin::User(uid) => self.state.user(uid).map(|u| u.server),
        };
        server
            .and_then(|s| self.directory.name_of(s))
            .unwrap_or_default()
            .to_string()
    }

    /// Dispatch one line from an authenticated peer.
    pub(super) fn on_connected(&mut self, id: LinkId, msg: Message) -> LinkResult {
        let Some(conn) = self.links.get(&id) else {
            return Ok(());
        };
        let Some(from) = conn.node else {
            return Err(LinkError::ProtocolViolation(
                "connected link has no server".into(),
            ));
        };
        let source = msg
            .prefix
            .clone()
            .unwrap_or_else(|| conn.display_name().to_string());
        let cmd = Command::parse(&msg)?;

        let Some(origin) = self.resolve_origin(&source) else {
            debug!(link_id = %id, source = %source, command = %msg.command, "Dropping line from unknown source");
            return Ok(());
        };
        if self.origin_route(origin) != Some(from) {
            warn!(
                link_id = %id,
                source = %source,
                command = %msg.command,
                "Fake direction, dropping line"
            );
            return Ok(());
        }
        let inb = Inbound {
            link: id,
            from,
            source,
            origin,
        };

        match cmd {
            Command::Server {
                name, description, ..
            } => self.remote_server(&inb, &name, &description),
            Command::Burst(ts) => {
                self.check_skew(id, ts)?;
                if let Some(conn) = self.links.get_mut(&id) {
                    conn.bursting = true;
                }
                metrics::record_burst("received");
                Ok(())
            }
            Command::EndBurst => {
                self.end_burst(id);
                Ok(())
            }
            Command::Nick(intro) => {
                self.remote_nick(&inb, intro, &msg);
                Ok(())
            }
            Command::NickChange(new) => {
                self.remote_rename(&inb, &new, &msg);
                Ok(())
            }
            Command::Fjoin {
                channel,
                ts,
                members,
            } => {
                self.remote_fjoin(&inb, &channel, ts, &members, &msg);
                Ok(())
            }
            Command::Fmode {
                target,
                ts,
                modes,
                args,
            } => {
                self.remote_fmode(&inb, &target, ts, &modes, &args, &msg);
                Ok(())
            }
            Command::Ftopic {
                channel,
                ts,
                setter,
                topic,
            } => {
                self.remote_ftopic(&inb, &channel, ts, &setter, &topic, &msg);
                Ok(())
            }
            Command::Kill { nick, reason } => {
                self.remote_kill(&inb, &nick, &reason, &msg);
                Ok(())
            }
            Command::Squit { server, reason } => {
                self.remote_squit(&inb, &server, &reason);
                Ok(())
            }
            Command::AddLine {
                kind,
                mask,
                source,
                set_time,
                duration,
                reason,
            } => {
                match network_kind(kind) {
                    Some(kind) => {
                        let line = XLine::new(kind, &mask, &source, set_time, duration, &reason);
                        self.remote_addline(&inb, line, &msg);
                    }
                    None => self.unknown_line_type("ADDLINE", kind, &inb.source),
                }
                Ok(())
            }
            Command::DelLine { kind, mask } => {
                match network_kind(kind) {
                    Some(kind) => self.remote_delline(&inb, kind, &mask, &msg),
                    None => self.unknown_line_type("DELLINE", kind, &inb.source),
                }
                Ok(())
            }
            Command::Metadata { target, key, value } => {
                self.remote_metadata(&inb, &target, &key, &value, &msg);
                Ok(())
            }
            Command::Ping { origin, target } => {
                self.on_remote_ping(&inb, &origin, target.as_deref(), &msg);
                Ok(())
            }
            Command::Pong { origin, target } => {
                self.remote_pong(&inb, &origin, target.as_deref(), &msg);
                Ok(())
            }
            Command::Version(version) => {
                if let Some(node) = inb.server().and_then(|s| self.directory.get_mut(s)) {
                    node.version = version;
                }
                self.broadcast_except(&msg, Some(from));
                Ok(())
            }
            Command::OperType(oper_type) => {
                self.remote_opertype(&inb, oper_type, &msg);
                Ok(())
            }
            Command::Error(text) => Err(LinkError::Remote(text)),
            Command::Quit(reason) => {
                if let Some(uid) = inb.user() {
                    self.broadcast_except(&msg, Some(from));
                    self.drop_user(uid, &reason, false);
                }
                Ok(())
            }
            Command::Away(away) => {
                if let Some(user) = inb.user().and_then(|u| self.state.user_mut(u)) {
                    user.away = away;
                    self.broadcast_except(&msg, Some(from));
                }
                Ok(())
            }
            Command::Part { channel, .. } => {
                if let Some(uid) = inb.user() {
                    self.state.part(&channel, uid);
                    self.broadcast_except(&msg, Some(from));
                }
                Ok(())
            }
            Command::Kick {
                channel,
                nick,
                reason,
            } => {
                self.remote_kick(&inb, &channel, &nick, &reason, &msg);
                Ok(())
            }
            Command::Privmsg { target, text } => {
                self.remote_message(&inb, &target, &text, false, &msg);
                Ok(())
            }
            Command::Notice { target, text } => {
                self.remote_message(&inb, &target, &text, true, &msg);
                Ok(())
            }
            Command::Rconnect { mask, target } => {
                self.remote_rconnect(&inb, &mask, &target, &msg);
                Ok(())
            }
            Command::Time { target, nick, ts } => {
                self.remote_time_request(&inb, &target, &nick, ts, &msg);
                Ok(())
            }
            Command::Capab(_) | Command::Pass(_) | Command::Aes(_) => {
                debug!(link_id = %id, command = %msg.command, "Ignoring handshake command after link");
                Ok(())
            }
            Command::Unknown(raw) => {
                debug!(link_id = %id, command = %raw.command, "Relaying unknown command");
                self.broadcast_except(&raw, Some(from));
                Ok(())
            }
        }
    }

    // ========================================================================
    // Servers
    // ========================================================================

    fn remote_server(&mut self, inb: &Inbound, name: &str, description: &str) -> LinkResult {
        let Some(parent) = inb.server() else {
            return Err(LinkError::ProtocolViolation(format!(
                "SERVER {name} introduced by a user"
            )));
        };
        let id = self
            .directory
            .add_server(name, description, parent, None)
            .map_err(|e| match e {
                TopologyError::Duplicate(n) => LinkError::DuplicateServer(n),
                other => LinkError::ProtocolViolation(other.to_string()),
            })?;
        let hops = self.directory.get(id).map(|n| n.hops).unwrap_or(1);
        let relay = Command::Server {
            name: name.to_string(),
            password: "*".to_string(),
            hops,
            description: description.to_string(),
        }
        .to_message(Some(&inb.source));
        self.broadcast_except(&relay, Some(inb.from));

        metrics::set_servers(self.directory.len());
        info!(server = %name, parent = %inb.source, hops, "Server introduced");
        self.hooks.server_linked(name, &inb.source);
        Ok(())
    }

    fn end_burst(&mut self, id: LinkId) {
        let Some(conn) = self.links.get_mut(&id) else {
            return;
        };
        conn.bursting = false;
        let peer = conn.display_name().to_string();
        let activated = self.state.xlines.activate_pending();
        if activated > 0 {
            self.enforce_xlines();
        }
        info!(link_id = %id, peer = %peer, activated, "End of burst");
        self.hooks
            .snotice(&format!("Received end of netburst from {peer}"));
    }

    fn remote_squit(&mut self, inb: &Inbound, server: &str, reason: &str) {
        let Some(target) = self.directory.find(server) else {
            debug!(server = %server, "SQUIT for unknown server");
            return;
        };
        if target == ServerId::ROOT {
            info!(peer = %inb.source, reason = %reason, "Peer squit us");
            self.drop_link(inb.link, reason);
            return;
        }
        if self.directory.route_of(target) != Some(inb.from) {
            warn!(server = %server, source = %inb.source, "SQUIT from the wrong direction");
            return;
        }
        self.squit_node(target, reason);
    }

    // ========================================================================
    // Users
    // ========================================================================

    fn remote_nick(&mut self, inb: &Inbound, intro: NickIntro, msg: &Message) {
        let Some(server) = inb.server() else {
            debug!(source = %inb.source, "NICK introduction from a user");
            return;
        };
        if let Some(existing) = self.state.find_nick(&intro.nick) {
            if self
                .state
                .user(existing)
                .is_some_and(|u| u.same_session(server, &intro))
            {
                debug!(nick = %intro.nick, "Duplicate introduction of the same user");
                return;
            }
            self.nick_collision(&[existing], &[intro.nick.as_str()]);
            return;
        }
        self.state.add_user(server, &intro);
        self.directory.user_added(server);
        self.broadcast_except(msg, Some(inb.from));
    }

    fn remote_rename(&mut self, inb: &Inbound, new: &str, msg: &Message) {
        let Some(uid) = inb.user() else {
            return;
        };
        match self.state.find_nick(new) {
            Some(existing) if existing != uid => {
                let old = inb.source.clone();
                self.nick_collision(&[existing, uid], &[old.as_str(), new]);
            }
            _ => {
                self.state.rename(uid, new);
                self.broadcast_except(msg, Some(inb.from));
            }
        }
    }

    fn remote_kill(&mut self, inb: &Inbound, nick: &str, reason: &str, msg: &Message) {
        let Some(uid) = self.state.find_nick(nick) else {
            debug!(nick = %nick, "KILL for unknown nick");
            return;
        };
        self.broadcast_except(msg, Some(inb.from));
        let reason = format!("Killed ({} ({}))", inb.source, reason);
        self.drop_user(uid, &reason, true);
    }

    fn remote_opertype(&mut self, inb: &Inbound, oper_type: String, msg: &Message) {
        let Some(uid) = inb.user() else {
            return;
        };
        let Some(user) = self.state.user_mut(uid) else {
            return;
        };
        let was_oper = user.is_oper();
        user.oper_type = Some(oper_type);
        let server = user.server;
        if !was_oper {
            self.directory.oper_added(server);
        }
        self.broadcast_except(msg, Some(inb.from));
    }

    /// Remove a user from state and counters. `killed` marks removals
    /// imposed by the network rather than chosen by the user.
    pub(super) fn drop_user(&mut self, uid: UserId, reason: &str, killed: bool) {
        let Some(user) = self.state.remove_user(uid) else {
            return;
        };
        self.directory.user_removed(user.server, user.is_oper());
        if killed && user.server == ServerId::ROOT {
            self.hooks.user_killed(&user.nick, reason);
        } else {
            self.hooks.user_quit(&user.nick, reason);
        }
    }

    // ========================================================================
    // Channels and messages
    // ========================================================================

    fn remote_ftopic(
        &mut self,
        inb: &Inbound,
        channel: &str,
        ts: i64,
        setter: &str,
        topic: &str,
        msg: &Message,
    ) {
        let Some(chan) = self.state.channel_mut(channel) else {
            debug!(channel = %channel, "FTOPIC for unknown channel");
            return;
        };
        let accept = match &chan.topic {
            None => true,
            Some(t) => t.text.is_empty() || ts >= t.set_at,
        };
        if !accept {
            return;
        }
        chan.topic = (!topic.is_empty()).then(|| crate::state::Topic {
            text: topic.to_string(),
            set_by: setter.to_string(),
            set_at: ts,
        });
        self.broadcast_except(msg, Some(inb.from));
    }

    fn remote_kick(&mut self, inb: &Inbound, channel: &str, nick: &str, reason: &str, msg: &Message) {
        let Some(victim) = self.state.find_nick(nick) else {
            return;
        };
        self.channel_fan_out(msg, channel, Some(inb.from));
        if self.state.part(channel, victim)
            && self
                .state
                .user(victim)
                .is_some_and(|u| u.server == ServerId::ROOT)
        {
            self.hooks.user_kicked(channel, nick, &inb.source, reason);
        }
    }

    fn remote_message(&mut self, inb: &Inbound, target: &str, text: &str, notice: bool, msg: &Message) {
        if is_channel(target) {
            let Some(chan) = self.state.channel(target) else {
                return;
            };
            let local: Vec<String> = chan
                .members
                .keys()
                .filter_map(|u| self.state.user(*u))
                .filter(|u| u.server == ServerId::ROOT)
                .map(|u| u.nick.clone())
                .collect();
            for nick in local {
                self.hooks.deliver(&nick, &inb.source, target, text, notice);
            }
            self.channel_fan_out(msg, target, Some(inb.from));
            return;
        }
        let Some(user) = self.state.user_by_nick(target) else {
            debug!(target = %target, "Message for unknown target");
            return;
        };
        if user.server == ServerId::ROOT {
            let nick = user.nick.clone();
            self.hooks.deliver(&nick, &inb.source, target, text, notice);
        } else {
            let nick = user.nick.clone();
            self.one_to_one(msg, &nick);
        }
    }

    fn remote_metadata(&mut self, inb: &Inbound, target: &str, key: &str, value: &str, msg: &Message) {
        let map = if target == "*" {
            Some(&mut self.state.metadata)
        } else if is_channel(target) {
            self.state.channel_mut(target).map(|c| &mut c.metadata)
        } else {
            self.state.user_by_nick(target).map(|u| u.id).and_then(|id| {
                self.state.user_mut(id).map(|u| &mut u.metadata)
            })
        };
        let Some(map) = map else {
            debug!(target = %target, key = %key, "METADATA for unknown target");
            return;
        };
        if value.is_empty() {
            map.remove(key);
        } else {
            map.insert(key.to_string(), value.to_string());
        }
        self.broadcast_except(msg, Some(inb.from));
    }

    // ========================================================================
    // Ping, pong and remote requests
    // ========================================================================

    fn on_remote_ping(&mut self, inb: &Inbound, origin: &str, target: Option<&str>, msg: &Message) {
        let us = self.server_name().to_string();
        match target {
            None => {
                let pong = Command::Pong {
                    origin: origin.to_string(),
                    target: None,
                }
                .to_message(Some(&us));
                self.send_to_peer(inb.from, &pong);
            }
            Some(t) if irc_eq(t, &us) => {
                let pong = Command::Pong {
                    origin: us.clone(),
                    target: Some(origin.to_string()),
                }
                .to_message(Some(&us));
                self.one_to_one(&pong, origin);
            }
            Some(t) => {
                self.one_to_one(msg, t);
            }
        }
    }

    fn remote_pong(&mut self, inb: &Inbound, origin: &str, target: Option<&str>, msg: &Message) {
        match target {
            None => {
                if let Some(node) = inb.server().and_then(|s| self.directory.get_mut(s)) {
                    node.answered_ping = true;
                }
            }
            Some(t) if irc_eq(t, self.server_name()) => {
                if let Some(id) = self.directory.find(origin)
                    && let Some(node) = self.directory.get_mut(id)
                {
                    node.answered_ping = true;
                }
                self.hooks.pong_received(origin);
            }
            Some(t) => {
                self.one_to_one(msg, t);
            }
        }
    }

    fn remote_rconnect(&mut self, inb: &Inbound, mask: &str, target: &str, msg: &Message) {
        if wildcard_match(target, self.server_name()) {
            self.hooks.snotice(&format!(
                "Remote CONNECT {mask} requested by {}",
                inb.source
            ));
            if let Err(e) = self.connect(mask) {
                warn!(mask = %mask, error = %e, "Remote CONNECT failed");
            }
            return;
        }
        let Some(name) = self
            .directory
            .find_by_glob(target)
            .and_then(|id| self.directory.name_of(id))
            .map(str::to_string)
        else {
            return;
        };
        self.one_to_one(msg, &name);
    }

    fn remote_time_request(
        &mut self,
        inb: &Inbound,
        target: &str,
        nick: &str,
        ts: Option<i64>,
        msg: &Message,
    ) {
        let us = self.server_name().to_string();
        if !irc_eq(target, &us) {
            self.one_to_one(msg, target);
            return;
        }
        match ts {
            None => {
                let asker = self.origin_server_name(inb.origin);
                let reply = Command::Time {
                    target: asker.clone(),
                    nick: nick.to_string(),
                    ts: Some(self.now()),
                }
                .to_message(Some(&us));
                self.one_to_one(&reply, &asker);
            }
            Some(ts) => {
                let server = self.origin_server_name(inb.origin);
                self.hooks.time_reply(nick, &server, ts);
            }
        }
    }
}
