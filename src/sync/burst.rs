//! Netburst serialization.
//!
//! The burst sent to a new peer is, in order:
//! 1. `BURST <now>`
//! 2. our VERSION
//! 3. every other server, parents before children, with known versions
//! 4. every user outside the peer's subtree, with OPERTYPE, AWAY and METADATA
//! 5. every channel: FJOIN (chunked), FMODE, FTOPIC, list modes, METADATA
//! 6. network x-lines (active and pending) and network METADATA
//! 7. `ENDBURST`
//!
//! Iteration is over ordered maps, so two bursts of the same state are
//! identical line for line.

use tracing::info;
use treelink_proto::{Command, Message};

use super::engine::SpanningTree;
use super::link::LinkId;
use super::topology::ServerId;
use crate::metrics;
use crate::state::Channel;

impl SpanningTree {
    /// Every line of our burst towards `peer`.
    pub fn burst_lines(&self, peer: ServerId) -> Vec<Message> {
        let us = self.server_name();
        let mut out = vec![
            Command::Burst(Some(self.now())).to_message(None),
            Command::Version(self.directory.root().version.clone()).to_message(Some(us)),
        ];
        self.burst_servers(peer, &mut out);
        self.burst_users(peer, &mut out);
        for chan in self.state.channels() {
            self.burst_channel(peer, chan, &mut out);
        }
        self.burst_network(&mut out);
        out.push(Command::EndBurst.to_message(None));
        out
    }

    fn burst_servers(&self, peer: ServerId, out: &mut Vec<Message>) {
        for id in self.directory.walk() {
            if id == ServerId::ROOT || self.directory.is_within(id, peer) {
                continue;
            }
            let Some(node) = self.directory.get(id) else {
                continue;
            };
            let Some(parent) = node.parent.and_then(|p| self.directory.name_of(p)) else {
                continue;
            };
            out.push(
                Command::Server {
                    name: node.name.clone(),
                    password: "*".to_string(),
                    hops: node.hops,
                    description: node.description.clone(),
                }
                .to_message(Some(parent)),
            );
            if !node.version.is_empty() {
                out.push(Command::Version(node.version.clone()).to_message(Some(&node.name)));
            }
        }
    }

    fn burst_users(&self, peer: ServerId, out: &mut Vec<Message>) {
        let us = self.server_name();
        for user in self.state.users() {
            if self.directory.is_within(user.server, peer) {
                continue;
            }
            let Some(server) = self.directory.name_of(user.server) else {
                continue;
            };
            out.push(Command::Nick(user.to_intro()).to_message(Some(server)));
            if let Some(oper_type) = &user.oper_type {
                out.push(Command::OperType(oper_type.clone()).to_message(Some(&user.nick)));
            }
            if let Some(away) = &user.away {
                out.push(Command::Away(Some(away.clone())).to_message(Some(&user.nick)));
            }
            for (key, value) in &user.metadata {
                out.push(
                    Command::Metadata {
                        target: user.nick.clone(),
                        key: key.clone(),
                        value: value.clone(),
                    }
                    .to_message(Some(us)),
                );
            }
        }
    }

    fn burst_channel(&self, peer: ServerId, chan: &Channel, out: &mut Vec<Message>) {
        let us = self.server_name();
        let members: Vec<String> = chan
            .members
            .iter()
            .filter_map(|(uid, modes)| {
                let user = self.state.user(*uid)?;
                (!self.directory.is_within(user.server, peer))
                    .then(|| format!("{}{}", modes.prefixes(), user.nick))
            })
            .collect();
        if members.is_empty() {
            return;
        }

        let protocol = &self.config.protocol;
        let budget = protocol.line_budget.saturating_sub(protocol.nick_max);
        for chunk in fjoin_chunks(us, &chan.name, chan.ts, &members, budget) {
            out.push(chunk);
        }

        let (modes, args) = chan.mode_string();
        if modes.len() > 1 {
            out.push(fmode(us, &chan.name, chan.ts, modes, args));
        }
        if let Some(topic) = &chan.topic {
            out.push(
                Command::Ftopic {
                    channel: chan.name.clone(),
                    ts: topic.set_at,
                    setter: topic.set_by.clone(),
                    topic: topic.text.clone(),
                }
                .to_message(Some(us)),
            );
        }
        let per_line = protocol.max_modes.max(1);
        for (mode, entries) in &chan.lists {
            for batch in entries.chunks(per_line) {
                let mut modes = String::from("+");
                modes.extend(std::iter::repeat_n(*mode, batch.len()));
                let args = batch.iter().map(|e| e.mask.clone()).collect();
                out.push(fmode(us, &chan.name, chan.ts, modes, args));
            }
        }
        for (key, value) in &chan.metadata {
            out.push(
                Command::Metadata {
                    target: chan.name.clone(),
                    key: key.clone(),
                    value: value.clone(),
                }
                .to_message(Some(us)),
            );
        }
    }

    fn burst_network(&self, out: &mut Vec<Message>) {
        let us = self.server_name();
        for line in self.state.xlines.network_lines() {
            out.push(
                Command::AddLine {
                    kind: line.kind.as_char(),
                    mask: line.mask.clone(),
                    source: line.source.clone(),
                    set_time: line.set_time,
                    duration: line.duration,
                    reason: line.reason.clone(),
                }
                .to_message(Some(us)),
            );
        }
        for (key, value) in &self.state.metadata {
            out.push(
                Command::Metadata {
                    target: "*".to_string(),
                    key: key.clone(),
                    value: value.clone(),
                }
                .to_message(Some(us)),
            );
        }
    }

    /// Write our burst on a freshly connected link.
    pub(super) fn send_burst(&mut self, id: LinkId, peer: ServerId) {
        let lines = self.burst_lines(peer);
        let Some(conn) = self.links.get_mut(&id) else {
            return;
        };
        for line in &lines {
            conn.send(line);
        }
        metrics::record_burst("sent");
        info!(link_id = %id, peer = %conn.display_name(), lines = lines.len(), "Burst sent");
    }
}

fn fmode(prefix: &str, channel: &str, ts: i64, modes: String, args: Vec<String>) -> Message {
    Command::Fmode {
        target: channel.to_string(),
        ts,
        modes,
        args,
    }
    .to_message(Some(prefix))
}

/// Split a member list over FJOIN lines of at most `budget` bytes. A line
/// always carries at least one member.
pub(crate) fn fjoin_chunks(
    prefix: &str,
    channel: &str,
    ts: i64,
    members: &[String],
    budget: usize,
) -> Vec<Message> {
    let header = format!(":{prefix} FJOIN {channel} {ts} :").len();
    let mut lines = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut len = header;
    for member in members {
        let extra = member.len() + usize::from(!current.is_empty());
        if !current.is_empty() && len + extra > budget {
            lines.push(fjoin_message(prefix, channel, ts, &current));
            current.clear();
            len = header;
        }
        len += member.len() + usize::from(!current.is_empty());
        current.push(member.clone());
    }
    if !current.is_empty() {
        lines.push(fjoin_message(prefix, channel, ts, &current));
    }
    lines
}

fn fjoin_message(prefix: &str, channel: &str, ts: i64, members: &[String]) -> Message {
    Message::new("FJOIN")
        .with_prefix(prefix)
        .param(channel)
        .param(ts.to_string())
        .trailing_param(members.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("@user{i:03}")).collect()
    }

    #[test]
    fn fjoin_lines_respect_the_budget() {
        let list = members(100);
        let lines = fjoin_chunks("hub.example.net", "#big", 1000, &list, 448);
        assert!(lines.len() > 1);
        let mut seen = Vec::new();
        for line in &lines {
            let text = line.to_string();
            assert!(text.len() <= 448, "{} bytes", text.len());
            seen.extend(line.params[2].split(' ').map(str::to_string));
        }
        assert_eq!(seen, list);
    }

    #[test]
    fn a_single_oversized_member_still_gets_a_line() {
        let list = vec!["x".repeat(100)];
        let lines = fjoin_chunks("hub", "#c", 1, &list, 10);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].params[2], list[0]);
    }

    #[test]
    fn small_lists_fit_one_line() {
        let lines = fjoin_chunks("hub", "#c", 5, &["@a".into(), "b".into()], 448);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].to_string(), ":hub FJOIN #c 5 :@a b");
    }
}
