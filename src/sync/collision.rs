//! Conflict resolution between servers.
//!
//! - Nick collisions kill both users unless the two records are the same
//!   session.
//! - FMODE: accepted when our TS is not newer than the sender's, or the
//!   sender is U-lined. Otherwise a bounce carrying our state for every
//!   touched mode goes back to the sending link only.
//! - FJOIN: members always join. Their privileges are granted when our TS is
//!   not older than the sender's (or the sender is U-lined), in which case
//!   our TS drops to theirs. Otherwise the privileges are stripped again by
//!   an FMODE broadcast to the whole network with our TS.
//! - X-lines: recognised network kinds are stored and relayed. Lines that
//!   arrive during a burst wait for ENDBURST before they are enforced.

use tracing::{debug, info, warn};
use treelink_proto::mode::{
    ModeKind, channel_mode_kind, format_mode_changes, parse_channel_modes, parse_user_modes,
    prefix_to_mode,
};
use treelink_proto::{Command, Message, ModeChange};

use super::engine::SpanningTree;
use super::protocol::{Inbound, is_channel};
use super::topology::ServerId;
use crate::metrics;
use crate::state::{MemberModes, UserId, XLine, XLineKind};

const COLLISION_REASON: &str = "Nickname collision";

impl SpanningTree {
    // ========================================================================
    // Nicks
    // ========================================================================

    /// Kill every name in `nicks` network-wide and drop `victims` here.
    pub(super) fn nick_collision(&mut self, victims: &[UserId], nicks: &[&str]) {
        metrics::inc_nick_collisions();
        let us = self.server_name().to_string();
        warn!(nicks = ?nicks, "Nick collision");
        self.hooks
            .snotice_warn(&format!("Nick collision on {}, killing both", nicks.join(" / ")));
        for nick in nicks {
            let kill = Command::Kill {
                nick: nick.to_string(),
                reason: COLLISION_REASON.to_string(),
            }
            .to_message(Some(&us));
            self.one_to_many(&kill);
        }
        for uid in victims {
            self.drop_user(*uid, COLLISION_REASON, true);
        }
    }

    // ========================================================================
    // Channel modes
    // ========================================================================

    /// Apply one channel mode change. Returns whether state changed.
    pub(super) fn apply_channel_change(&mut self, channel: &str, change: &ModeChange, source: &str) -> bool {
        let member = self.mode_member(change);
        let now = self.now();
        let Some(chan) = self.state.channel_mut(channel) else {
            return false;
        };
        let changed = chan.apply_mode(change, member, source, now);
        if changed {
            self.hooks.mode_applied(channel, source, change);
        }
        changed
    }

    fn mode_member(&self, change: &ModeChange) -> Option<UserId> {
        match channel_mode_kind(change.mode) {
            ModeKind::Prefix(_) => change.arg.as_deref().and_then(|n| self.state.find_nick(n)),
            _ => None,
        }
    }

    /// Our state for every mode in `changes`, as changes.
    fn channel_bounce(&self, channel: &str, changes: &[ModeChange]) -> Vec<ModeChange> {
        let Some(chan) = self.state.channel(channel) else {
            return Vec::new();
        };
        changes
            .iter()
            .filter_map(|c| {
                let member = self.mode_member(c);
                let set = chan.is_set(c, member);
                let bounced = match channel_mode_kind(c.mode) {
                    ModeKind::Flag => ModeChange {
                        adding: set,
                        mode: c.mode,
                        arg: None,
                    },
                    ModeKind::ParamAlways if set => ModeChange::plus(c.mode, chan.modes.key.clone()),
                    ModeKind::ParamAlways => {
                        ModeChange::minus(c.mode, Some(c.arg.clone().unwrap_or_else(|| "*".into())))
                    }
                    ModeKind::ParamOnSet => match chan.modes.limit {
                        Some(limit) => ModeChange::plus(c.mode, Some(limit.to_string())),
                        None => ModeChange::minus(c.mode, None),
                    },
                    ModeKind::List => ModeChange {
                        adding: set,
                        mode: c.mode,
                        arg: c.arg.clone(),
                    },
                    ModeKind::Prefix(_) => {
                        member?;
                        ModeChange {
                            adding: set,
                            mode: c.mode,
                            arg: c.arg.clone(),
                        }
                    }
                };
                Some(bounced)
            })
            .collect()
    }

    /// FMODE lines for `changes`, at most `max_modes` changes each.
    pub(super) fn fmode_messages(&self, prefix: &str, target: &str, ts: i64, changes: &[ModeChange]) -> Vec<Message> {
        let per_line = self.config.protocol.max_modes.max(1);
        changes
            .chunks(per_line)
            .map(|batch| {
                let (modes, args) = format_mode_changes(batch);
                Command::Fmode {
                    target: target.to_string(),
                    ts,
                    modes,
                    args,
                }
                .to_message(Some(prefix))
            })
            .collect()
    }

    pub(super) fn remote_fmode(
        &mut self,
        inb: &Inbound,
        target: &str,
        ts: i64,
        modes: &str,
        args: &[String],
        msg: &Message,
    ) {
        let source_server = self.origin_server_name(inb.origin);
        let ulined = self.is_ulined(&source_server);

        if !is_channel(target) {
            self.remote_user_fmode(inb, target, ts, modes, ulined, msg);
            return;
        }
        let Some(local_ts) = self.state.channel(target).map(|c| c.ts) else {
            debug!(channel = %target, "FMODE for unknown channel");
            return;
        };
        let changes = parse_channel_modes(modes, args);

        if local_ts <= ts || ulined {
            if ulined && local_ts > ts {
                self.hooks.snotice_warn(&format!(
                    "U-lined server {source_server} changed modes on {target} with TS {ts}, older than ours ({local_ts}); check its clock"
                ));
            }
            for change in &changes {
                self.apply_channel_change(target, change, &inb.source);
            }
            self.broadcast_except(msg, Some(inb.from));
            return;
        }

        let bounce = self.channel_bounce(target, &changes);
        if bounce.is_empty() {
            return;
        }
        debug!(channel = %target, ours = local_ts, theirs = ts, "Bouncing FMODE");
        let us = self.server_name().to_string();
        for line in self.fmode_messages(&us, target, local_ts, &bounce) {
            self.send_to_peer(inb.from, &line);
        }
        metrics::record_bounce("fmode");
    }

    fn remote_user_fmode(
        &mut self,
        inb: &Inbound,
        target: &str,
        ts: i64,
        modes: &str,
        ulined: bool,
        msg: &Message,
    ) {
        let Some(uid) = self.state.find_nick(target) else {
            return;
        };
        let changes = parse_user_modes(modes);
        let Some(user) = self.state.user_mut(uid) else {
            return;
        };
        if user.age <= ts || ulined {
            user.apply_modes(&changes);
            for change in &changes {
                self.hooks.mode_applied(target, &inb.source, change);
            }
            self.broadcast_except(msg, Some(inb.from));
            return;
        }
        let bounce: Vec<ModeChange> = changes
            .iter()
            .map(|c| ModeChange {
                adding: user.modes.contains(&c.mode),
                mode: c.mode,
                arg: None,
            })
            .collect();
        let age = user.age;
        let us = self.server_name().to_string();
        for line in self.fmode_messages(&us, target, age, &bounce) {
            self.send_to_peer(inb.from, &line);
        }
        metrics::record_bounce("fmode");
    }

    // ========================================================================
    // Channel joins
    // ========================================================================

    pub(super) fn remote_fjoin(
        &mut self,
        inb: &Inbound,
        channel: &str,
        ts: i64,
        members: &[(String, String)],
        msg: &Message,
    ) {
        self.broadcast_except(msg, Some(inb.from));

        let source_server = self.origin_server_name(inb.origin);
        let accept = {
            let chan = self.state.channel_or_create(channel, ts);
            let our_ts = chan.ts;
            let accept = our_ts >= ts || self.ulines.contains(&treelink_proto::irc_to_lower(&source_server));
            if accept && ts < our_ts {
                chan.ts = ts;
                info!(channel = %channel, old = our_ts, new = ts, "Lowering channel TS");
                self.hooks.channel_ts_lowered(channel, our_ts, ts);
            }
            accept
        };

        let per_line = self.config.protocol.max_modes.max(1);
        let mut batch = Vec::new();
        for (prefixes, nick) in members {
            let Some(uid) = self.state.find_nick(nick) else {
                debug!(channel = %channel, nick = %nick, "FJOIN for unknown nick");
                continue;
            };
            let route = self
                .state
                .user(uid)
                .and_then(|u| self.directory.route_of(u.server));
            if route != Some(inb.from) {
                warn!(channel = %channel, nick = %nick, "FJOIN member from the wrong direction");
                continue;
            }
            self.state.join(channel, uid, MemberModes::default());
            for mode in prefixes.chars().filter_map(prefix_to_mode) {
                batch.push(ModeChange::plus(mode, Some(nick.clone())));
                if batch.len() >= per_line {
                    self.flush_fjoin_modes(channel, accept, &inb.source, &mut batch);
                }
            }
        }
        self.flush_fjoin_modes(channel, accept, &inb.source, &mut batch);
        self.state.prune_channel(channel);
    }

    fn flush_fjoin_modes(&mut self, channel: &str, accept: bool, source: &str, batch: &mut Vec<ModeChange>) {
        if batch.is_empty() {
            return;
        }
        if accept {
            for change in batch.drain(..) {
                self.apply_channel_change(channel, &change, source);
            }
            return;
        }
        let Some(ts) = self.state.channel(channel).map(|c| c.ts) else {
            batch.clear();
            return;
        };
        let stripped: Vec<ModeChange> = batch
            .drain(..)
            .map(|c| ModeChange::minus(c.mode, c.arg))
            .collect();
        let (modes, args) = format_mode_changes(&stripped);
        let bounce = Command::Fmode {
            target: channel.to_string(),
            ts,
            modes,
            args,
        }
        .to_message(Some(self.server_name()));
        debug!(channel = %channel, ts, "Stripping FJOIN privileges");
        self.one_to_many(&bounce);
        metrics::record_bounce("fjoin");
    }

    // ========================================================================
    // X-lines
    // ========================================================================

    pub(super) fn remote_addline(&mut self, inb: &Inbound, mut line: XLine, msg: &Message) {
        let bursting = self.links.get(&inb.link).is_some_and(|c| c.bursting);
        line.pending = bursting
            && self
                .state
                .xlines
                .get(line.kind, &line.mask)
                .is_none_or(|l| l.pending);
        let summary = format!(
            "{} added {}-line for {}: {}",
            line.source,
            line.kind.as_char(),
            line.mask,
            line.reason
        );
        let added = self.state.xlines.add(line);
        self.broadcast_except(msg, Some(inb.from));
        if bursting {
            debug!("{}", summary);
            return;
        }
        if added {
            self.hooks.snotice(&summary);
        }
        self.enforce_xlines();
    }

    pub(super) fn remote_delline(&mut self, inb: &Inbound, kind: XLineKind, mask: &str, msg: &Message) {
        if self.state.xlines.remove(kind, mask).is_some() {
            self.hooks.snotice(&format!(
                "{} removed {}-line for {}",
                inb.source,
                kind.as_char(),
                mask
            ));
        }
        self.broadcast_except(msg, Some(inb.from));
    }

    pub(super) fn unknown_line_type(&self, command: &str, kind: char, source: &str) {
        warn!(command = %command, kind = %kind, source = %source, "Unrecognised x-line type");
        self.hooks.snotice_warn(&format!(
            "{command} of unknown type {kind} from {source}; not applied"
        ));
    }

    /// Remove local users matching an active x-line.
    pub(super) fn enforce_xlines(&mut self) {
        for uid in self.state.users_on(ServerId::ROOT) {
            let Some(line) = self.state.match_xline(uid) else {
                continue;
            };
            let Some(nick) = self.state.user(uid).map(|u| u.nick.clone()) else {
                continue;
            };
            let reason = format!("{}-Lined: {}", line.kind.as_char(), line.reason);
            self.hooks.snotice(&format!(
                "{}-line {} matched {}",
                line.kind.as_char(),
                line.mask,
                nick
            ));
            let quit = Command::Quit(reason.clone()).to_message(Some(&nick));
            self.one_to_many(&quit);
            self.drop_user(uid, &reason, true);
        }
    }
}
