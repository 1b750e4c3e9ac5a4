//! Operator entry points: CONNECT, SQUIT, MAP, LINKS and remote queries.
//!
//! Masks are matched with `*`/`?` wildcards against link record names
//! (CONNECT) or directory names (everything else). Results come back as
//! values; formatting them into numerics is the caller's business.

use thiserror::Error;
use tokio::sync::mpsc::unbounded_channel;
use tracing::info;
use treelink_proto::{Command, irc_eq, wildcard_match};

use super::engine::{DialRequest, SpanningTree};
use super::link::LinkConnection;
use super::topology::ServerId;

/// Why an operator command was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OperError {
    #[error("no link block matches {0}")]
    NoSuchLink(String),
    #[error("{0} is already linked")]
    AlreadyLinked(String),
    #[error("a connection to {0} is already in progress")]
    InProgress(String),
    #[error("outbound connections are not available")]
    NoDialer,
    #[error("no server matches {0}")]
    NoSuchServer(String),
    #[error("cannot squit the local server")]
    SquitSelf,
    #[error("{0} is not directly connected")]
    NotDirectlyConnected(String),
    #[error("no such nick {0}")]
    NoSuchNick(String),
}

/// One LINKS entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub name: String,
    /// Uplink; our own name for the local server.
    pub parent: String,
    pub hops: u32,
    pub description: String,
}

impl SpanningTree {
    /// Start an outbound connection to the first link record matching
    /// `mask`. Returns the record name.
    pub fn connect(&mut self, mask: &str) -> Result<String, OperError> {
        let block = self
            .records
            .values()
            .find(|r| wildcard_match(mask, &r.block.name))
            .map(|r| r.block.clone())
            .ok_or_else(|| OperError::NoSuchLink(mask.to_string()))?;
        if self.directory.find(&block.name).is_some() {
            return Err(OperError::AlreadyLinked(block.name));
        }
        if self.connection_pending(&block.name) {
            return Err(OperError::InProgress(block.name));
        }
        let Some(dialer) = self.dialer.clone() else {
            return Err(OperError::NoDialer);
        };

        let id = self.ids.next();
        let (tx, rx) = unbounded_channel();
        let addr = format!("{}:{}", block.ipaddr, block.port);
        let conn = LinkConnection::outbound(id, &block.name, &addr, tx, self.now());
        let request = DialRequest {
            link: id,
            name: block.name.clone(),
            address: block.ipaddr.clone(),
            port: block.port,
            outbox: rx,
        };
        if dialer.send(request).is_err() {
            return Err(OperError::NoDialer);
        }
        self.links.insert(id, conn);
        info!(link_id = %id, peer = %block.name, addr = %addr, "Connecting");
        self.hooks
            .snotice(&format!("Connecting to {} ({addr})", block.name));
        Ok(block.name)
    }

    /// Split off the directly connected server matching `mask`.
    pub fn squit(&mut self, mask: &str, reason: &str) -> Result<(), OperError> {
        let id = self
            .directory
            .find_by_glob(mask)
            .ok_or_else(|| OperError::NoSuchServer(mask.to_string()))?;
        if id == ServerId::ROOT {
            return Err(OperError::SquitSelf);
        }
        let name = self.directory.name_of(id).unwrap_or_default().to_string();
        if self.directory.route_of(id) != Some(id) {
            return Err(OperError::NotDirectlyConnected(name));
        }
        info!(server = %name, reason = %reason, "Operator SQUIT");
        self.squit_node(id, reason);
        Ok(())
    }

    /// The tree as indented lines with user counts.
    pub fn map(&self) -> Vec<String> {
        self.directory
            .walk()
            .into_iter()
            .filter_map(|id| self.directory.get(id))
            .map(|node| {
                format!(
                    "{}{} ({} users)",
                    "  ".repeat(node.hops as usize),
                    node.name,
                    node.user_count
                )
            })
            .collect()
    }

    /// Every server in the tree, minus those whose link block is hidden.
    pub fn links(&self) -> Vec<LinkInfo> {
        self.directory
            .walk()
            .into_iter()
            .filter_map(|id| self.directory.get(id))
            .filter(|node| !self.link_record(&node.name).is_some_and(|r| r.block.hidden))
            .map(|node| LinkInfo {
                name: node.name.clone(),
                parent: node
                    .parent
                    .and_then(|p| self.directory.name_of(p))
                    .unwrap_or(&node.name)
                    .to_string(),
                hops: node.hops,
                description: node.description.clone(),
            })
            .collect()
    }

    /// Ask the server matching `target` to connect to `mask`.
    pub fn rconnect(&mut self, nick: &str, mask: &str, target: &str) -> Result<(), OperError> {
        if wildcard_match(target, self.server_name()) {
            return self.connect(mask).map(|_| ());
        }
        let name = self.server_matching(target)?;
        let msg = Command::Rconnect {
            mask: mask.to_string(),
            target: target.to_string(),
        }
        .to_message(Some(nick));
        self.one_to_one(&msg, &name);
        Ok(())
    }

    /// Ask `target` for its clock on behalf of `nick`. Answers at once for
    /// the local server; remote answers arrive through
    /// `MessageObserver::time_reply`.
    pub fn remote_time(&mut self, nick: &str, target: &str) -> Result<Option<i64>, OperError> {
        if wildcard_match(target, self.server_name()) {
            return Ok(Some(self.now()));
        }
        if self.state.find_nick(nick).is_none() {
            return Err(OperError::NoSuchNick(nick.to_string()));
        }
        let name = self.server_matching(target)?;
        let msg = Command::Time {
            target: name.clone(),
            nick: nick.to_string(),
            ts: None,
        }
        .to_message(Some(nick));
        self.one_to_one(&msg, &name);
        Ok(None)
    }

    /// Ping a remote server. The answer arrives through
    /// `LinkObserver::pong_received`.
    pub fn remote_ping(&mut self, target: &str) -> Result<(), OperError> {
        let name = self.server_matching(target)?;
        if irc_eq(&name, self.server_name()) {
            return Err(OperError::NoSuchServer(target.to_string()));
        }
        let us = self.server_name().to_string();
        let msg = Command::Ping {
            origin: us.clone(),
            target: Some(name.clone()),
        }
        .to_message(Some(&us));
        self.one_to_one(&msg, &name);
        Ok(())
    }

    /// Version string of the server matching `target`, as learned in its
    /// burst.
    pub fn remote_version(&self, target: &str) -> Result<String, OperError> {
        self.directory
            .find_by_glob(target)
            .and_then(|id| self.directory.get(id))
            .map(|node| node.version.clone())
            .ok_or_else(|| OperError::NoSuchServer(target.to_string()))
    }

    fn server_matching(&self, mask: &str) -> Result<String, OperError> {
        self.directory
            .find_by_glob(mask)
            .and_then(|id| self.directory.name_of(id))
            .map(str::to_string)
            .ok_or_else(|| OperError::NoSuchServer(mask.to_string()))
    }
}
