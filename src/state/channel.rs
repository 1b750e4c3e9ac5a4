//! Channel-related types and state.

use std::collections::{BTreeMap, BTreeSet};

use treelink_proto::mode::{ModeKind, channel_mode_kind};
use treelink_proto::{ModeChange, irc_eq};

use super::UserId;

/// An entry in a list (bans, excepts, invex).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub mask: String,
    pub set_by: String,
    pub set_at: i64,
}

/// Channel topic with metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub text: String,
    pub set_by: String,
    pub set_at: i64,
}

/// Member modes (owner, op, halfop, voice).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemberModes {
    pub owner: bool, // +q (~)
    pub op: bool,    // +o (@)
    pub halfop: bool, // +h (%)
    pub voice: bool, // +v (+)
}

impl MemberModes {
    /// Build from FJOIN prefix symbols such as `@+`.
    pub fn from_prefixes(symbols: &str) -> Self {
        let mut m = Self::default();
        for c in symbols.chars() {
            if let Some(mode) = treelink_proto::mode::prefix_to_mode(c) {
                m.set(mode, true);
            }
        }
        m
    }

    /// Whether the prefix mode character is set.
    pub fn has(&self, mode: char) -> bool {
        match mode {
            'q' => self.owner,
            'o' => self.op,
            'h' => self.halfop,
            'v' => self.voice,
            _ => false,
        }
    }

    /// Set or clear a prefix mode. Returns whether anything changed.
    pub fn set(&mut self, mode: char, on: bool) -> bool {
        let slot = match mode {
            'q' => &mut self.owner,
            'o' => &mut self.op,
            'h' => &mut self.halfop,
            'v' => &mut self.voice,
            _ => return false,
        };
        let changed = *slot != on;
        *slot = on;
        changed
    }

    /// All prefix symbols, highest first: `~@%+`.
    pub fn prefixes(&self) -> String {
        let mut s = String::with_capacity(4);
        if self.owner {
            s.push('~');
        }
        if self.op {
            s.push('@');
        }
        if self.halfop {
            s.push('%');
        }
        if self.voice {
            s.push('+');
        }
        s
    }

    /// Set prefix mode characters, highest first.
    pub fn modes(&self) -> Vec<char> {
        ['q', 'o', 'h', 'v']
            .into_iter()
            .filter(|m| self.has(*m))
            .collect()
    }
}

/// Simple and parameter channel modes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChannelModes {
    /// Parameterless flags such as `n`, `t`, `m`.
    pub flags: BTreeSet<char>,
    /// `+k` key.
    pub key: Option<String>,
    /// `+l` limit.
    pub limit: Option<u32>,
}

/// A channel.
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    /// Creation timestamp; the channel's TS.
    pub ts: i64,
    pub modes: ChannelModes,
    /// List modes keyed by mode character.
    pub lists: BTreeMap<char, Vec<ListEntry>>,
    pub members: BTreeMap<UserId, MemberModes>,
    pub topic: Option<Topic>,
    /// Extension data attached by other subsystems.
    pub metadata: BTreeMap<String, String>,
}

impl Channel {
    pub fn new(name: &str, ts: i64) -> Self {
        Self {
            name: name.to_string(),
            ts,
            modes: ChannelModes::default(),
            lists: BTreeMap::new(),
            members: BTreeMap::new(),
            topic: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Whether the channel has no members left.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Add a member, merging privileges if already present.
    pub fn join(&mut self, user: UserId, modes: MemberModes) {
        let entry = self.members.entry(user).or_default();
        for m in modes.modes() {
            entry.set(m, true);
        }
    }

    /// Whether `change` describes state that is currently set here.
    ///
    /// For prefix modes `member` must name the user the change targets.
    pub fn is_set(&self, change: &ModeChange, member: Option<UserId>) -> bool {
        match channel_mode_kind(change.mode) {
            ModeKind::Flag => self.modes.flags.contains(&change.mode),
            ModeKind::ParamAlways => self.modes.key.is_some(),
            ModeKind::ParamOnSet => self.modes.limit.is_some(),
            ModeKind::List => change.arg.as_deref().is_some_and(|mask| {
                self.lists
                    .get(&change.mode)
                    .is_some_and(|l| l.iter().any(|e| irc_eq(&e.mask, mask)))
            }),
            ModeKind::Prefix(_) => member
                .and_then(|u| self.members.get(&u))
                .is_some_and(|m| m.has(change.mode)),
        }
    }

    /// Apply one change. Returns whether local state changed.
    pub fn apply_mode(
        &mut self,
        change: &ModeChange,
        member: Option<UserId>,
        set_by: &str,
        now: i64,
    ) -> bool {
        match channel_mode_kind(change.mode) {
            ModeKind::Flag => {
                if change.adding {
                    self.modes.flags.insert(change.mode)
                } else {
                    self.modes.flags.remove(&change.mode)
                }
            }
            ModeKind::ParamAlways => {
                let new = if change.adding { change.arg.clone() } else { None };
                let changed = self.modes.key != new;
                self.modes.key = new;
                changed
            }
            ModeKind::ParamOnSet => {
                let new = if change.adding {
                    match change.arg.as_deref().and_then(|a| a.parse().ok()) {
                        Some(limit) => Some(limit),
                        None => return false,
                    }
                } else {
                    None
                };
                let changed = self.modes.limit != new;
                self.modes.limit = new;
                changed
            }
            ModeKind::List => {
                let Some(mask) = change.arg.as_deref() else {
                    return false;
                };
                let list = self.lists.entry(change.mode).or_default();
                let existing = list.iter().position(|e| irc_eq(&e.mask, mask));
                let changed = match (change.adding, existing) {
                    (true, None) => {
                        list.push(ListEntry {
                            mask: mask.to_string(),
                            set_by: set_by.to_string(),
                            set_at: now,
                        });
                        true
                    }
                    (false, Some(idx)) => {
                        list.remove(idx);
                        true
                    }
                    _ => false,
                };
                if list.is_empty() {
                    self.lists.remove(&change.mode);
                }
                changed
            }
            ModeKind::Prefix(_) => match member.and_then(|u| self.members.get_mut(&u)) {
                Some(m) => m.set(change.mode, change.adding),
                None => false,
            },
        }
    }

    /// Current simple and parameter modes as `(+modes, params)`.
    pub fn mode_string(&self) -> (String, Vec<String>) {
        let mut modes = String::from("+");
        let mut args = Vec::new();
        modes.extend(self.modes.flags.iter());
        if let Some(key) = &self.modes.key {
            modes.push('k');
            args.push(key.clone());
        }
        if let Some(limit) = self.modes.limit {
            modes.push('l');
            args.push(limit.to_string());
        }
        (modes, args)
    }
}
