//! Link records and link connections.
//!
//! A [`LinkRecord`] is the configured side of a peer (name, address,
//! passwords, autoconnect, key). A [`LinkConnection`] is one socket's
//! protocol state. The socket itself lives in a network task; the engine
//! only sees lines coming in and pushes [`Outbound`] items to the task.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::UnboundedSender;
use treelink_proto::{LineTransport, Message, ProtocolError};

use super::ServerId;
use crate::config::LinkBlock;
use crate::metrics;

/// Identifier for one socket, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared allocator so accept loops can name connections before the engine
/// hears about them.
#[derive(Debug, Clone, Default)]
pub struct LinkIdAllocator(Arc<AtomicU64>);

impl LinkIdAllocator {
    pub fn next(&self) -> LinkId {
        LinkId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Per-connection protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Listening socket; never carries lines.
    Listener,
    /// Outbound, waiting for the peer's SERVER.
    Connecting,
    /// Inbound, waiting for the peer's SERVER.
    WaitAuth1,
    /// Inbound, our SERVER sent, waiting for BURST.
    WaitAuth2,
    /// Authenticated and in the tree.
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Listener => "LISTENER",
            Self::Connecting => "CONNECTING",
            Self::WaitAuth1 => "WAIT_AUTH_1",
            Self::WaitAuth2 => "WAIT_AUTH_2",
            Self::Connected => "CONNECTED",
        };
        f.write_str(s)
    }
}

/// Item for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Wire text, already transport-encoded, without terminator.
    Line(String),
    /// Flush and close the socket.
    Close,
}

/// Configured peer plus its autoconnect schedule.
#[derive(Debug, Clone)]
pub struct LinkRecord {
    pub block: LinkBlock,
    /// Next autoconnect attempt.
    pub next_connect: i64,
}

impl LinkRecord {
    pub fn new(block: LinkBlock, now: i64) -> Self {
        let next_connect = now + block.autoconnect as i64;
        Self {
            block,
            next_connect,
        }
    }

    pub fn name(&self) -> &str {
        &self.block.name
    }

    /// Whether an autoconnect attempt is due.
    pub fn autoconnect_due(&self, now: i64) -> bool {
        self.block.autoconnect > 0 && now >= self.next_connect
    }
}

/// One socket's protocol state.
pub struct LinkConnection {
    pub id: LinkId,
    pub state: LinkState,
    /// Tree node, set when the link reaches CONNECTED.
    pub node: Option<ServerId>,
    /// Remote (or, for listeners, local) address.
    pub addr: String,
    pub outbound: bool,
    /// Between the peer's BURST and ENDBURST.
    pub bursting: bool,
    /// Link record this connection dials or authenticated against.
    pub record: Option<String>,
    /// Name from the peer's SERVER line.
    pub peer_name: Option<String>,
    pub peer_desc: String,
    /// AES transport negotiated on this link.
    pub encrypted: bool,
    /// Link record whose key the transport was built from.
    pub key_owner: Option<String>,
    /// When the connection was created.
    pub opened_at: i64,
    outbox: Option<UnboundedSender<Outbound>>,
    transport: Option<Box<dyn LineTransport>>,
}

impl fmt::Debug for LinkConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkConnection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("node", &self.node)
            .field("addr", &self.addr)
            .field("peer_name", &self.peer_name)
            .field("bursting", &self.bursting)
            .field("encrypted", &self.encrypted)
            .finish()
    }
}

impl LinkConnection {
    fn base(id: LinkId, state: LinkState, addr: &str, now: i64) -> Self {
        Self {
            id,
            state,
            node: None,
            addr: addr.to_string(),
            outbound: false,
            bursting: false,
            record: None,
            peer_name: None,
            peer_desc: String::new(),
            encrypted: false,
            key_owner: None,
            opened_at: now,
            outbox: None,
            transport: None,
        }
    }

    /// Listening socket entry.
    pub fn listener(id: LinkId, addr: &str, now: i64) -> Self {
        Self::base(id, LinkState::Listener, addr, now)
    }

    /// Freshly accepted inbound connection.
    pub fn inbound(id: LinkId, addr: &str, outbox: UnboundedSender<Outbound>, now: i64) -> Self {
        let mut conn = Self::base(id, LinkState::WaitAuth1, addr, now);
        conn.outbox = Some(outbox);
        conn
    }

    /// Outbound connection to the named link record.
    pub fn outbound(
        id: LinkId,
        record: &str,
        addr: &str,
        outbox: UnboundedSender<Outbound>,
        now: i64,
    ) -> Self {
        let mut conn = Self::base(id, LinkState::Connecting, addr, now);
        conn.outbound = true;
        conn.record = Some(record.to_string());
        conn.outbox = Some(outbox);
        conn
    }

    /// Peer name if known, otherwise the address.
    pub fn display_name(&self) -> &str {
        self.peer_name
            .as_deref()
            .or(self.record.as_deref())
            .unwrap_or(&self.addr)
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Switch on a line transport for both directions.
    pub fn set_transport(&mut self, transport: Box<dyn LineTransport>) {
        self.transport = Some(transport);
        self.encrypted = true;
    }

    /// Wire text to plaintext line.
    pub fn decode(&mut self, wire: &str) -> Result<String, ProtocolError> {
        match self.transport.as_mut() {
            Some(t) => t.decode(wire),
            None => Ok(wire.to_string()),
        }
    }

    /// Queue a line. Returns `false` if the writer task is gone.
    pub fn send_line(&mut self, line: &str) -> bool {
        let Some(outbox) = &self.outbox else {
            return false;
        };
        let wire = match self.transport.as_mut() {
            Some(t) => t.encode(line),
            None => line.to_string(),
        };
        metrics::inc_lines_sent();
        outbox.send(Outbound::Line(wire)).is_ok()
    }

    pub fn send(&mut self, msg: &Message) -> bool {
        self.send_line(&msg.to_string())
    }

    /// Ask the writer task to close the socket.
    pub fn close(&mut self) {
        if let Some(outbox) = self.outbox.take() {
            let _ = outbox.send(Outbound::Close);
        }
    }
}
