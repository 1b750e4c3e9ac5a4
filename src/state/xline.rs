//! X-line records: network and local bans.
//!
//! - G: `ident@host`, network-wide
//! - Z: IP address, network-wide
//! - Q: nickname, network-wide
//! - E: `ident@host` exemption from G, Z and K lines, network-wide
//! - K: `ident@host`, local to this server and never propagated

use std::collections::BTreeMap;

use treelink_proto::{irc_to_lower, wildcard_match};

use super::User;

/// X-line type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum XLineKind {
    G,
    Z,
    Q,
    E,
    K,
}

impl XLineKind {
    /// Parse a type character. Unknown characters yield `None`.
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'G' => Some(Self::G),
            'Z' => Some(Self::Z),
            'Q' => Some(Self::Q),
            'E' => Some(Self::E),
            'K' => Some(Self::K),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::G => 'G',
            Self::Z => 'Z',
            Self::Q => 'Q',
            Self::E => 'E',
            Self::K => 'K',
        }
    }

    /// Whether lines of this kind travel between servers.
    pub fn is_network(self) -> bool {
        !matches!(self, Self::K)
    }
}

/// One ban record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLine {
    pub kind: XLineKind,
    pub mask: String,
    /// Who set it.
    pub source: String,
    pub set_time: i64,
    /// Seconds, 0 for permanent.
    pub duration: i64,
    pub reason: String,
    /// How many users this line has matched.
    pub hits: u64,
    /// Received during a burst and not yet enforced.
    pub pending: bool,
}

impl XLine {
    pub fn new(
        kind: XLineKind,
        mask: &str,
        source: &str,
        set_time: i64,
        duration: i64,
        reason: &str,
    ) -> Self {
        Self {
            kind,
            mask: mask.to_string(),
            source: source.to_string(),
            set_time,
            duration,
            reason: reason.to_string(),
            hits: 0,
            pending: false,
        }
    }

    /// Expiry time, `None` when permanent. An expiry past the end of the
    /// clock never comes, so it counts as permanent too.
    pub fn expires_at(&self) -> Option<i64> {
        if self.duration <= 0 {
            return None;
        }
        self.set_time.checked_add(self.duration)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }

    /// Whether the line's mask matches the user.
    pub fn matches(&self, user: &User) -> bool {
        match self.kind {
            XLineKind::G | XLineKind::E | XLineKind::K => {
                wildcard_match(&self.mask, &user.ident_host())
                    || wildcard_match(&self.mask, &format!("{}@{}", user.ident, user.ip))
            }
            XLineKind::Z => wildcard_match(&self.mask, &user.ip),
            XLineKind::Q => wildcard_match(&self.mask, &user.nick),
        }
    }
}

type LineKey = (XLineKind, String);

/// All x-lines known to this server.
#[derive(Debug, Default, Clone)]
pub struct XLineSet {
    lines: BTreeMap<LineKey, XLine>,
}

impl XLineSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(kind: XLineKind, mask: &str) -> LineKey {
        (kind, irc_to_lower(mask))
    }

    /// Insert or replace a line. Returns `true` if it was not known before.
    pub fn add(&mut self, line: XLine) -> bool {
        self.lines
            .insert(Self::key(line.kind, &line.mask), line)
            .is_none()
    }

    pub fn remove(&mut self, kind: XLineKind, mask: &str) -> Option<XLine> {
        self.lines.remove(&Self::key(kind, mask))
    }

    pub fn get(&self, kind: XLineKind, mask: &str) -> Option<&XLine> {
        self.lines.get(&Self::key(kind, mask))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// All lines in deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = &XLine> {
        self.lines.values()
    }

    /// Lines that travel between servers, active and pending.
    pub fn network_lines(&self) -> impl Iterator<Item = &XLine> {
        self.lines.values().filter(|l| l.kind.is_network())
    }

    /// Drop expired lines and return them.
    pub fn expire(&mut self, now: i64) -> Vec<XLine> {
        let expired: Vec<LineKey> = self
            .lines
            .iter()
            .filter(|(_, l)| l.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| self.lines.remove(&k))
            .collect()
    }

    /// Clear the pending flag on every line. Returns how many were pending.
    pub fn activate_pending(&mut self) -> usize {
        let mut n = 0;
        for line in self.lines.values_mut().filter(|l| l.pending) {
            line.pending = false;
            n += 1;
        }
        n
    }

    /// First active ban matching the user, honouring E-line exemptions.
    /// Bumps the hit counter of the matching line.
    pub fn match_user(&mut self, user: &User) -> Option<XLine> {
        let exempt = self
            .lines
            .values()
            .any(|l| l.kind == XLineKind::E && !l.pending && l.matches(user));
        let hit = self.lines.values_mut().find(|l| {
            !l.pending
                && match l.kind {
                    XLineKind::E => false,
                    XLineKind::Q => l.matches(user),
                    XLineKind::G | XLineKind::Z | XLineKind::K => !exempt && l.matches(user),
                }
        })?;
        hit.hits += 1;
        Some(hit.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::UserId;
    use crate::sync::ServerId;
    use treelink_proto::NickIntro;

    fn user(nick: &str, ident: &str, host: &str, ip: &str) -> User {
        User::from_intro(
            UserId(1),
            ServerId::ROOT,
            &NickIntro {
                age: 1,
                nick: nick.into(),
                host: host.into(),
                dhost: host.into(),
                ident: ident.into(),
                modes: "+".into(),
                ip: ip.into(),
                gecos: "x".into(),
            },
        )
    }

    #[test]
    fn kinds_parse_and_classify() {
        assert_eq!(XLineKind::from_char('g'), Some(XLineKind::G));
        assert_eq!(XLineKind::from_char('X'), None);
        assert!(!XLineKind::K.is_network());
        assert!(XLineKind::Z.is_network());
    }

    #[test]
    fn each_kind_matches_its_field() {
        let u = user("Spammer", "bot", "evil.example", "192.0.2.7");
        assert!(XLine::new(XLineKind::G, "*@*.example", "o", 0, 0, "r").matches(&u));
        assert!(XLine::new(XLineKind::Z, "192.0.2.*", "o", 0, 0, "r").matches(&u));
        assert!(XLine::new(XLineKind::Q, "spam*", "o", 0, 0, "r").matches(&u));
        assert!(!XLine::new(XLineKind::Q, "ham*", "o", 0, 0, "r").matches(&u));
    }

    #[test]
    fn elines_exempt_from_glines_but_not_qlines() {
        let u = user("spammer", "bot", "evil.example", "192.0.2.7");
        let mut set = XLineSet::new();
        set.add(XLine::new(XLineKind::G, "*@evil.example", "o", 0, 0, "gone"));
        set.add(XLine::new(XLineKind::E, "bot@*", "o", 0, 0, "friend"));
        assert!(set.match_user(&u).is_none());

        set.add(XLine::new(XLineKind::Q, "spammer", "o", 0, 0, "reserved"));
        let hit = set.match_user(&u).unwrap();
        assert_eq!(hit.kind, XLineKind::Q);
        assert_eq!(set.get(XLineKind::Q, "SPAMMER").unwrap().hits, 1);
    }

    #[test]
    fn pending_lines_are_not_enforced_until_activated() {
        let u = user("a", "b", "c.example", "10.0.0.1");
        let mut set = XLineSet::new();
        let mut line = XLine::new(XLineKind::Z, "10.*", "o", 0, 0, "r");
        line.pending = true;
        set.add(line);
        assert!(set.match_user(&u).is_none());
        assert_eq!(set.activate_pending(), 1);
        assert!(set.match_user(&u).is_some());
    }

    #[test]
    fn expiry_sweeps_only_timed_lines() {
        let mut set = XLineSet::new();
        set.add(XLine::new(XLineKind::G, "*@a", "o", 100, 60, "r"));
        set.add(XLine::new(XLineKind::G, "*@b", "o", 100, 0, "r"));
        assert!(set.expire(159).is_empty());
        let gone = set.expire(160);
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].mask, "*@a");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn expiry_past_the_end_of_time_never_fires() {
        let line = XLine::new(XLineKind::G, "*@a", "o", i64::MAX, 10, "r");
        assert_eq!(line.expires_at(), None);
        assert!(!line.is_expired(i64::MAX));

        let mut set = XLineSet::new();
        set.add(line);
        assert!(set.expire(i64::MAX).is_empty());
    }
}
