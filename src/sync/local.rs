//! Entry points for local subsystems.
//!
//! Client handling calls these when something happens on this server. Each
//! one updates the network state first and then tells every direct peer.

use thiserror::Error;
use tracing::{debug, info};
use treelink_proto::{Command, ModeChange, NickIntro};

use super::engine::SpanningTree;
use super::protocol::is_channel;
use super::topology::ServerId;
use crate::state::{MemberModes, Topic, User, UserId, XLine, XLineKind};

/// Why a local request was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocalError {
    #[error("nickname {0} is already in use")]
    NickInUse(String),
    #[error("no such user")]
    NoSuchUser,
    #[error("{0} is not on this server")]
    NotLocal(String),
    #[error("no such channel {0}")]
    NoSuchChannel(String),
    #[error("no such nick or channel {0}")]
    NoSuchTarget(String),
    #[error("banned: {0}")]
    Banned(String),
}

impl SpanningTree {
    fn local_nick(&self, uid: UserId) -> Result<String, LocalError> {
        let user = self.state.user(uid).ok_or(LocalError::NoSuchUser)?;
        if user.server != ServerId::ROOT {
            return Err(LocalError::NotLocal(user.nick.clone()));
        }
        Ok(user.nick.clone())
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Register a user connected to this server and introduce it.
    pub fn introduce_local_user(&mut self, intro: NickIntro) -> Result<UserId, LocalError> {
        if self.state.find_nick(&intro.nick).is_some() {
            return Err(LocalError::NickInUse(intro.nick));
        }
        let probe = User::from_intro(UserId(0), ServerId::ROOT, &intro);
        if let Some(line) = self.state.xlines.match_user(&probe) {
            debug!(nick = %intro.nick, mask = %line.mask, "Connection refused by x-line");
            return Err(LocalError::Banned(format!(
                "{}-Lined: {}",
                line.kind.as_char(),
                line.reason
            )));
        }
        let uid = self.state.add_user(ServerId::ROOT, &intro);
        self.directory.user_added(ServerId::ROOT);
        let nick = Command::Nick(intro).to_message(Some(self.server_name()));
        self.one_to_many(&nick);
        Ok(uid)
    }

    pub fn quit_local_user(&mut self, uid: UserId, reason: &str) -> Result<(), LocalError> {
        let nick = self.local_nick(uid)?;
        let quit = Command::Quit(reason.to_string()).to_message(Some(&nick));
        self.one_to_many(&quit);
        self.drop_user(uid, reason, false);
        Ok(())
    }

    pub fn rename_local_user(&mut self, uid: UserId, new_nick: &str) -> Result<(), LocalError> {
        let old = self.local_nick(uid)?;
        if self.state.find_nick(new_nick).is_some_and(|other| other != uid) {
            return Err(LocalError::NickInUse(new_nick.to_string()));
        }
        let change = Command::NickChange(new_nick.to_string()).to_message(Some(&old));
        self.one_to_many(&change);
        self.state.rename(uid, new_nick);
        Ok(())
    }

    pub fn set_oper_type(&mut self, uid: UserId, oper_type: &str) -> Result<(), LocalError> {
        let nick = self.local_nick(uid)?;
        let Some(user) = self.state.user_mut(uid) else {
            return Err(LocalError::NoSuchUser);
        };
        let was_oper = user.is_oper();
        user.oper_type = Some(oper_type.to_string());
        if !was_oper {
            self.directory.oper_added(ServerId::ROOT);
        }
        let msg = Command::OperType(oper_type.to_string()).to_message(Some(&nick));
        self.one_to_many(&msg);
        Ok(())
    }

    pub fn set_away(&mut self, uid: UserId, away: Option<&str>) -> Result<(), LocalError> {
        let nick = self.local_nick(uid)?;
        if let Some(user) = self.state.user_mut(uid) {
            user.away = away.map(str::to_string);
        }
        let msg = Command::Away(away.map(str::to_string)).to_message(Some(&nick));
        self.one_to_many(&msg);
        Ok(())
    }

    // ========================================================================
    // Channels
    // ========================================================================

    /// Join a local user to a channel. A new channel is created with the
    /// current time as its TS and the user as operator.
    pub fn join_local(&mut self, uid: UserId, channel: &str) -> Result<(), LocalError> {
        let nick = self.local_nick(uid)?;
        let now = self.now();
        let created = self.state.channel(channel).is_none();
        let ts = self.state.channel_or_create(channel, now).ts;
        let modes = if created {
            MemberModes::from_prefixes("@")
        } else {
            MemberModes::default()
        };
        let prefixes = modes.prefixes();
        self.state.join(channel, uid, modes);
        let fjoin = Command::Fjoin {
            channel: channel.to_string(),
            ts,
            members: vec![(prefixes, nick)],
        }
        .to_message(Some(self.server_name()));
        self.one_to_many(&fjoin);
        Ok(())
    }

    pub fn part_local(&mut self, uid: UserId, channel: &str, reason: Option<&str>) -> Result<(), LocalError> {
        let nick = self.local_nick(uid)?;
        if !self.state.part(channel, uid) {
            return Err(LocalError::NoSuchChannel(channel.to_string()));
        }
        let part = Command::Part {
            channel: channel.to_string(),
            reason: reason.map(str::to_string),
        }
        .to_message(Some(&nick));
        self.one_to_many(&part);
        Ok(())
    }

    /// Kick `victim` from `channel` on behalf of `source` (a nick or our
    /// server name).
    pub fn kick_local(&mut self, source: &str, channel: &str, victim: &str, reason: &str) -> Result<(), LocalError> {
        let uid = self
            .state
            .find_nick(victim)
            .ok_or_else(|| LocalError::NoSuchTarget(victim.to_string()))?;
        if self.state.channel(channel).is_none() {
            return Err(LocalError::NoSuchChannel(channel.to_string()));
        }
        let kick = Command::Kick {
            channel: channel.to_string(),
            nick: victim.to_string(),
            reason: reason.to_string(),
        }
        .to_message(Some(source));
        self.channel_fan_out(&kick, channel, None);
        self.state.part(channel, uid);
        Ok(())
    }

    /// Apply mode changes made here and propagate them with our TS.
    pub fn local_mode(&mut self, source: &str, target: &str, changes: &[ModeChange]) -> Result<(), LocalError> {
        if is_channel(target) {
            let ts = self
                .state
                .channel(target)
                .map(|c| c.ts)
                .ok_or_else(|| LocalError::NoSuchChannel(target.to_string()))?;
            let applied: Vec<ModeChange> = changes
                .iter()
                .filter(|c| self.apply_channel_change(target, c, source))
                .cloned()
                .collect();
            for msg in self.fmode_messages(source, target, ts, &applied) {
                self.one_to_many(&msg);
            }
            return Ok(());
        }

        let uid = self
            .state
            .find_nick(target)
            .ok_or_else(|| LocalError::NoSuchTarget(target.to_string()))?;
        self.local_nick(uid)?;
        let Some(user) = self.state.user_mut(uid) else {
            return Err(LocalError::NoSuchUser);
        };
        user.apply_modes(changes);
        let age = user.age;
        for msg in self.fmode_messages(source, target, age, changes) {
            self.one_to_many(&msg);
        }
        Ok(())
    }

    pub fn set_topic(&mut self, uid: UserId, channel: &str, text: &str) -> Result<(), LocalError> {
        let nick = self.local_nick(uid)?;
        let now = self.now();
        let chan = self
            .state
            .channel_mut(channel)
            .ok_or_else(|| LocalError::NoSuchChannel(channel.to_string()))?;
        chan.topic = (!text.is_empty()).then(|| Topic {
            text: text.to_string(),
            set_by: nick.clone(),
            set_at: now,
        });
        let ftopic = Command::Ftopic {
            channel: channel.to_string(),
            ts: now,
            setter: nick,
            topic: text.to_string(),
        }
        .to_message(Some(self.server_name()));
        self.one_to_many(&ftopic);
        Ok(())
    }

    /// PRIVMSG or NOTICE from a local user.
    pub fn send_message(&mut self, uid: UserId, target: &str, text: &str, notice: bool) -> Result<(), LocalError> {
        let nick = self.local_nick(uid)?;
        let cmd = if notice {
            Command::Notice {
                target: target.to_string(),
                text: text.to_string(),
            }
        } else {
            Command::Privmsg {
                target: target.to_string(),
                text: text.to_string(),
            }
        };
        let msg = cmd.to_message(Some(&nick));

        if is_channel(target) {
            let chan = self
                .state
                .channel(target)
                .ok_or_else(|| LocalError::NoSuchChannel(target.to_string()))?;
            let local: Vec<String> = chan
                .members
                .keys()
                .filter(|m| **m != uid)
                .filter_map(|m| self.state.user(*m))
                .filter(|u| u.server == ServerId::ROOT)
                .map(|u| u.nick.clone())
                .collect();
            for recipient in local {
                self.hooks.deliver(&recipient, &nick, target, text, notice);
            }
            self.channel_fan_out(&msg, target, None);
            return Ok(());
        }

        let recipient = self
            .state
            .user_by_nick(target)
            .ok_or_else(|| LocalError::NoSuchTarget(target.to_string()))?;
        if recipient.server == ServerId::ROOT {
            let recipient = recipient.nick.clone();
            self.hooks.deliver(&recipient, &nick, target, text, notice);
        } else {
            self.one_to_one(&msg, target);
        }
        Ok(())
    }

    /// Attach metadata to `*`, a channel or a nick and propagate it. An
    /// empty value deletes the key.
    pub fn set_metadata(&mut self, target: &str, key: &str, value: &str) -> Result<(), LocalError> {
        let map = if target == "*" {
            Some(&mut self.state.metadata)
        } else if is_channel(target) {
            self.state.channel_mut(target).map(|c| &mut c.metadata)
        } else {
            match self.state.find_nick(target) {
                Some(uid) => self.state.user_mut(uid).map(|u| &mut u.metadata),
                None => None,
            }
        };
        let map = map.ok_or_else(|| LocalError::NoSuchTarget(target.to_string()))?;
        if value.is_empty() {
            map.remove(key);
        } else {
            map.insert(key.to_string(), value.to_string());
        }
        let msg = Command::Metadata {
            target: target.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }
        .to_message(Some(self.server_name()));
        self.one_to_many(&msg);
        Ok(())
    }

    // ========================================================================
    // X-lines
    // ========================================================================

    /// Add a ban set on this server. Network kinds are propagated; K-lines
    /// stay here. Matching local users are removed at once.
    pub fn add_xline(&mut self, line: XLine) -> bool {
        let kind = line.kind;
        let announce = Command::AddLine {
            kind: kind.as_char(),
            mask: line.mask.clone(),
            source: line.source.clone(),
            set_time: line.set_time,
            duration: line.duration,
            reason: line.reason.clone(),
        }
        .to_message(Some(self.server_name()));
        info!(kind = %kind.as_char(), mask = %line.mask, source = %line.source, "Adding x-line");
        let added = self.state.xlines.add(line);
        if kind.is_network() {
            self.one_to_many(&announce);
        }
        self.enforce_xlines();
        added
    }

    pub fn remove_xline(&mut self, kind: XLineKind, mask: &str) -> bool {
        if self.state.xlines.remove(kind, mask).is_none() {
            return false;
        }
        if kind.is_network() {
            let msg = Command::DelLine {
                kind: kind.as_char(),
                mask: mask.to_string(),
            }
            .to_message(Some(self.server_name()));
            self.one_to_many(&msg);
        }
        true
    }
}
