//! The spanning-tree engine.
//!
//! [`SpanningTree`] owns the server directory, the network state and every
//! link connection. It is driven by [`LinkEvent`]s from the socket tasks and
//! by [`SpanningTree::tick`]. Nothing in here awaits: each handler runs to
//! completion before the next event is looked at, which is what lets the
//! collision and burst logic assume a consistent view of the network.
//!
//! The handlers are split across sibling modules as further `impl` blocks:
//! - `handshake`: pre-authentication states
//! - `burst`: netburst serialization
//! - `router`: fan-out primitives
//! - `protocol`: CONNECTED dispatch
//! - `collision`: TS arbitration and x-line enforcement
//! - `split`: netsplit teardown
//! - `oper`, `local`: entry points for operators and local subsystems

use std::collections::{BTreeMap, HashSet};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};
use treelink_proto::{Command, Message, ProtocolError, irc_to_lower};

use super::hooks::Hooks;
use super::link::{LinkConnection, LinkId, LinkIdAllocator, LinkRecord, LinkState, Outbound};
use super::topology::Directory;
use crate::config::{Config, ValidationError, validate};
use crate::error::LinkError;
use crate::metrics;
use crate::state::NetworkState;

/// Version string announced in bursts.
pub const VERSION: &str = concat!("treelinkd-", env!("CARGO_PKG_VERSION"));

/// Wall-clock source in unix seconds.
pub type Clock = Box<dyn Fn() -> i64 + Send>;

/// What the socket layer reports to the engine.
#[derive(Debug)]
pub enum LinkEvent {
    /// A listener accepted a connection.
    Accepted {
        link: LinkId,
        addr: String,
        outbox: UnboundedSender<Outbound>,
    },
    /// An outbound TCP connect completed.
    Connected { link: LinkId },
    /// An outbound TCP connect failed or timed out.
    ConnectFailed { link: LinkId, reason: String },
    /// One line arrived, terminator stripped, still transport-encoded.
    Line { link: LinkId, line: String },
    /// The socket closed or errored.
    Closed { link: LinkId, reason: String },
}

/// Request for the socket layer to open an outbound connection.
#[derive(Debug)]
pub struct DialRequest {
    pub link: LinkId,
    /// Link record name.
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Lines the engine queues for this connection.
    pub outbox: UnboundedReceiver<Outbound>,
}

/// The protocol engine: directory, state, links and timers.
pub struct SpanningTree {
    pub(super) config: Config,
    pub(super) directory: Directory,
    pub(super) state: NetworkState,
    pub(super) links: BTreeMap<LinkId, LinkConnection>,
    /// Link records keyed by case-folded name.
    pub(super) records: BTreeMap<String, LinkRecord>,
    /// Case-folded U-lined server names.
    pub(super) ulines: HashSet<String>,
    pub(super) hooks: Hooks,
    pub(super) ids: LinkIdAllocator,
    pub(super) dialer: Option<UnboundedSender<DialRequest>>,
    clock: Clock,
}

impl std::fmt::Debug for SpanningTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanningTree")
            .field("server", &self.server_name())
            .field("servers", &self.directory.len())
            .field("users", &self.state.user_count())
            .field("links", &self.links.len())
            .finish()
    }
}

impl SpanningTree {
    /// Engine using the system clock.
    pub fn new(config: Config) -> Self {
        Self::with_clock(config, Box::new(|| chrono::Utc::now().timestamp()))
    }

    /// Engine using a caller-supplied clock.
    pub fn with_clock(config: Config, clock: Clock) -> Self {
        let now = clock();
        let directory = Directory::new(&config.server.name, &config.server.description, VERSION);
        let records = build_records(&config, now, &BTreeMap::new());
        let ulines = config.ulines.iter().map(|u| irc_to_lower(u)).collect();
        Self {
            config,
            directory,
            state: NetworkState::new(),
            links: BTreeMap::new(),
            records,
            ulines,
            hooks: Hooks::new(),
            ids: LinkIdAllocator::default(),
            dialer: None,
            clock,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn now(&self) -> i64 {
        (self.clock)()
    }

    pub fn server_name(&self) -> &str {
        self.directory.root_name()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn state(&self) -> &NetworkState {
        &self.state
    }

    pub fn hooks_mut(&mut self) -> &mut Hooks {
        &mut self.hooks
    }

    /// Allocator shared with accept loops.
    pub fn link_ids(&self) -> LinkIdAllocator {
        self.ids.clone()
    }

    pub fn connection(&self, id: LinkId) -> Option<&LinkConnection> {
        self.links.get(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &LinkConnection> {
        self.links.values()
    }

    pub fn link_record(&self, name: &str) -> Option<&LinkRecord> {
        self.records.get(&irc_to_lower(name))
    }

    /// Where outbound connection requests go.
    pub fn set_dialer(&mut self, dialer: UnboundedSender<DialRequest>) {
        self.dialer = Some(dialer);
    }

    /// Whether `server` is trusted to win every TS comparison.
    pub fn is_ulined(&self, server: &str) -> bool {
        self.ulines.contains(&irc_to_lower(server))
    }

    /// Register a listening socket.
    pub fn add_listener(&mut self, addr: &str) -> LinkId {
        let id = self.ids.next();
        let conn = LinkConnection::listener(id, addr, self.now());
        self.links.insert(id, conn);
        id
    }

    /// Our CAPAB module list: sorted, comma-joined.
    pub fn capab_list(&self) -> String {
        sorted_capab(&self.config.protocol.common_modules)
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Accepted { link, addr, outbox } => {
                info!(link_id = %link, addr = %addr, "Inbound server connection");
                let conn = LinkConnection::inbound(link, &addr, outbox, self.now());
                self.links.insert(link, conn);
                self.greet_inbound(link);
            }
            LinkEvent::Connected { link } => {
                if self
                    .links
                    .get(&link)
                    .is_some_and(|c| c.state == LinkState::Connecting)
                {
                    self.start_outbound(link);
                }
            }
            LinkEvent::ConnectFailed { link, reason } => {
                if let Some(conn) = self.links.remove(&link) {
                    self.hooks.snotice_warn(&format!(
                        "Could not connect to {}: {}",
                        conn.display_name(),
                        reason
                    ));
                }
            }
            LinkEvent::Line { link, line } => self.on_line(link, &line),
            LinkEvent::Closed { link, reason } => {
                if let Some(conn) = self.links.get(&link) {
                    info!(link_id = %link, peer = %conn.display_name(), reason = %reason, "Connection closed");
                    self.drop_link(link, &reason);
                }
            }
        }
    }

    fn on_line(&mut self, id: LinkId, wire: &str) {
        metrics::inc_lines_received();
        let Some(conn) = self.links.get_mut(&id) else {
            return;
        };
        let state = conn.state;
        let line = match conn.decode(wire) {
            Ok(line) => line,
            Err(ProtocolError::Cleartext(cmd)) => {
                return self.fail_link(
                    id,
                    LinkError::ProtocolViolation(format!("plaintext {cmd} on an encrypted link")),
                );
            }
            Err(e) => return self.fail_link(id, e.into()),
        };
        let msg: Message = match line.parse() {
            Ok(msg) => msg,
            Err(ProtocolError::EmptyLine) => return,
            Err(e) => return self.fail_link(id, e.into()),
        };
        debug!(link_id = %id, state = %state, line = %line, "<<");

        let result = match state {
            LinkState::Listener => Ok(()),
            LinkState::Connecting => self.on_connecting(id, &msg),
            LinkState::WaitAuth1 => self.on_wait_auth_1(id, &msg),
            LinkState::WaitAuth2 => self.on_wait_auth_2(id, &msg),
            LinkState::Connected => self.on_connected(id, msg),
        };
        if let Err(e) = result {
            self.fail_link(id, e);
        }
    }

    /// Abort a link with `err`: ERROR to the peer, close, tear down.
    pub(super) fn fail_link(&mut self, id: LinkId, err: LinkError) {
        let Some(conn) = self.links.get_mut(&id) else {
            return;
        };
        metrics::record_link_error(err.error_code());
        warn!(link_id = %id, peer = %conn.display_name(), addr = %conn.addr, error = %err, "Link error");
        if err.notify_peer() {
            conn.send(&Command::Error(err.to_string()).to_message(None));
        }
        let text = format!(
            "Link with {} ({}) failed: {}",
            conn.display_name(),
            conn.addr,
            err
        );
        self.hooks.snotice_warn(&text);
        self.drop_link(id, &err.to_string());
    }

    /// Forget a connection. A CONNECTED link takes its subtree with it.
    pub(super) fn drop_link(&mut self, id: LinkId, reason: &str) {
        let Some(mut conn) = self.links.remove(&id) else {
            return;
        };
        conn.close();
        if let Some(node) = conn.node
            && self.directory.get(node).is_some()
        {
            self.squit_node(node, reason);
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Periodic work: pings, handshake timeouts, autoconnect, x-line expiry.
    pub fn tick(&mut self) {
        let now = self.now();
        self.check_pings(now);
        self.check_handshake_timeouts(now);
        self.autoconnect(now);
        self.expire_xlines(now);
    }

    fn check_pings(&mut self, now: i64) {
        let interval = self.config.protocol.ping_interval as i64;
        let us = self.server_name().to_string();
        let mut timed_out = Vec::new();
        for peer in self.directory.direct_peers() {
            let Some(node) = self.directory.get_mut(peer) else {
                continue;
            };
            if now < node.next_ping {
                continue;
            }
            if !node.answered_ping {
                timed_out.push(peer);
                continue;
            }
            node.answered_ping = false;
            node.next_ping = now + interval;
            let ping = Command::Ping {
                origin: node.name.clone(),
                target: None,
            }
            .to_message(Some(&us));
            self.send_to_peer(peer, &ping);
        }
        for peer in timed_out {
            if let Some(name) = self.directory.name_of(peer) {
                warn!(peer = %name, "Ping timeout");
            }
            self.squit_node(peer, "Ping timeout");
        }
    }

    fn check_handshake_timeouts(&mut self, now: i64) {
        let limit = self.config.protocol.connect_timeout as i64;
        let stale: Vec<LinkId> = self
            .links
            .values()
            .filter(|c| {
                matches!(
                    c.state,
                    LinkState::Connecting | LinkState::WaitAuth1 | LinkState::WaitAuth2
                ) && now - c.opened_at >= limit
            })
            .map(|c| c.id)
            .collect();
        for id in stale {
            if let Some(conn) = self.links.get(&id) {
                self.hooks.snotice_warn(&format!(
                    "Connection to {} timed out during handshake",
                    conn.display_name()
                ));
            }
            self.drop_link(id, "Handshake timed out");
        }
    }

    fn autoconnect(&mut self, now: i64) {
        let due: Vec<String> = self
            .records
            .values_mut()
            .filter(|r| r.autoconnect_due(now))
            .map(|r| {
                r.next_connect = now + r.block.autoconnect as i64;
                r.block.name.clone()
            })
            .collect();
        for name in due {
            if self.directory.find(&name).is_some() || self.connection_pending(&name) {
                continue;
            }
            debug!(link = %name, "Autoconnect due");
            if let Err(e) = self.connect(&name) {
                warn!(link = %name, error = %e, "Autoconnect failed");
            }
        }
    }

    fn expire_xlines(&mut self, now: i64) {
        for line in self.state.xlines.expire(now) {
            self.hooks.snotice(&format!(
                "Expiring {}-line on {} (set by {})",
                line.kind.as_char(),
                line.mask,
                line.source
            ));
        }
    }

    /// Whether a pre-CONNECTED connection exists for the named record.
    pub(super) fn connection_pending(&self, name: &str) -> bool {
        let key = irc_to_lower(name);
        self.links.values().any(|c| {
            !c.is_connected()
                && c.state != LinkState::Listener
                && c.record.as_deref().is_some_and(|r| irc_to_lower(r) == key)
        })
    }

    // ========================================================================
    // Rehash and shutdown
    // ========================================================================

    /// Replace link records, U-lines and protocol settings.
    ///
    /// The server name cannot change; a differing name is ignored with a
    /// warning. Autoconnect schedules survive for links kept by name.
    pub fn rehash(&mut self, config: Config) -> Result<(), Vec<ValidationError>> {
        validate(&config)?;
        if !treelink_proto::irc_eq(&config.server.name, self.server_name()) {
            warn!(
                old = %self.server_name(),
                new = %config.server.name,
                "Server name cannot change on rehash"
            );
        }
        let now = self.now();
        self.records = build_records(&config, now, &self.records);
        self.ulines = config.ulines.iter().map(|u| irc_to_lower(u)).collect();
        self.directory.root_mut().description = config.server.description.clone();
        let mut config = config;
        config.server.name = self.server_name().to_string();
        self.config = config;
        self.hooks.snotice(&format!(
            "Rehashed: {} link blocks, {} U-lines",
            self.records.len(),
            self.ulines.len()
        ));
        Ok(())
    }

    /// Squit every direct peer and close every connection.
    pub fn shutdown(&mut self, reason: &str) {
        for peer in self.directory.direct_peers() {
            self.squit_node(peer, reason);
        }
        let ids: Vec<LinkId> = self.links.keys().copied().collect();
        for id in ids {
            if let Some(mut conn) = self.links.remove(&id) {
                conn.send(&Command::Error(reason.to_string()).to_message(None));
                conn.close();
            }
        }
    }
}

fn sorted_capab(modules: &[String]) -> String {
    let mut mods: Vec<&str> = modules
        .iter()
        .map(String::as_str)
        .filter(|m| !m.is_empty())
        .collect();
    mods.sort_unstable();
    mods.dedup();
    mods.join(",")
}

/// Peer capability list in the same normal form as [`SpanningTree::capab_list`].
pub(super) fn normalize_capab(modules: &[String]) -> String {
    sorted_capab(modules)
}

fn build_records(
    config: &Config,
    now: i64,
    previous: &BTreeMap<String, LinkRecord>,
) -> BTreeMap<String, LinkRecord> {
    config
        .link
        .iter()
        .map(|block| {
            let key = irc_to_lower(&block.name);
            let mut record = LinkRecord::new(block.clone(), now);
            if let Some(old) = previous.get(&key) {
                record.next_connect = old.next_connect;
            }
            (key, record)
        })
        .collect()
}
