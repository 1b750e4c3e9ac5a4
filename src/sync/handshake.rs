//! Link authentication.
//!
//! Outbound: on TCP connect we send CAPAB, optionally `AES <us>` (after which
//! our side encrypts), then `SERVER <us> <sendpass> 0 :<desc>`. We stay in
//! CONNECTING until the peer's SERVER arrives and checks out, then the link
//! goes straight to CONNECTED.
//!
//! Inbound: CAPAB goes out on accept. WAIT_AUTH_1 waits for SERVER, checks
//! it, answers with our SERVER and moves to WAIT_AUTH_2, which waits for the
//! peer's BURST.
//!
//! Whichever side reaches CONNECTED inserts the peer under the root,
//! announces it to everyone else and sends its own burst.

use tracing::{info, warn};
use treelink_proto::{AesTransport, Command, Message, irc_eq};

use super::engine::{SpanningTree, normalize_capab};
use super::link::{LinkId, LinkState};
use super::topology::{ServerId, TopologyError};
use crate::config::LinkBlock;
use crate::error::{LinkError, LinkResult};
use crate::metrics;

impl SpanningTree {
    fn capab_message(&self) -> Message {
        Message::new("CAPAB").trailing_param(self.capab_list())
    }

    fn our_server_message(&self, password: &str) -> Message {
        Command::Server {
            name: self.server_name().to_string(),
            password: password.to_string(),
            hops: 0,
            description: self.directory.root().description.clone(),
        }
        .to_message(None)
    }

    /// First words on an accepted connection.
    pub(super) fn greet_inbound(&mut self, id: LinkId) {
        let capab = self.capab_message();
        if let Some(conn) = self.links.get_mut(&id) {
            conn.send(&capab);
        }
    }

    /// TCP connect finished on an outbound link: present our credentials.
    pub(super) fn start_outbound(&mut self, id: LinkId) {
        let Some(name) = self.links.get(&id).and_then(|c| c.record.clone()) else {
            return;
        };
        let Some(block) = self.link_record(&name).map(|r| r.block.clone()) else {
            warn!(link = %name, "Link block vanished before connect completed");
            self.drop_link(id, "Link block removed");
            return;
        };
        let capab = self.capab_message();
        let aes = Command::Aes(self.server_name().to_string()).to_message(None);
        let server = self.our_server_message(&block.sendpass);

        let transport = match block.key().map(AesTransport::new) {
            Some(Ok(t)) => Some(t),
            Some(Err(e)) => return self.fail_link(id, e.into()),
            None => None,
        };
        let Some(conn) = self.links.get_mut(&id) else {
            return;
        };
        info!(link_id = %id, peer = %name, encrypted = transport.is_some(), "Connected, sending credentials");
        conn.send(&capab);
        if let Some(t) = transport {
            conn.send(&aes);
            conn.set_transport(Box::new(t));
            conn.key_owner = Some(name);
        }
        conn.send(&server);
    }

    // ========================================================================
    // State handlers
    // ========================================================================

    /// Outbound link waiting for the peer's SERVER.
    pub(super) fn on_connecting(&mut self, id: LinkId, msg: &Message) -> LinkResult {
        match Command::parse(msg)? {
            Command::Capab(mods) => self.check_capab(&mods),
            Command::Pass(_) => Ok(()),
            Command::Aes(name) => self.activate_aes(id, &name),
            Command::Server {
                name,
                password,
                description,
                ..
            } => {
                let expected = self
                    .links
                    .get(&id)
                    .and_then(|c| c.record.clone())
                    .unwrap_or_default();
                if !irc_eq(&name, &expected) {
                    return Err(LinkError::BadCredentials { name });
                }
                let block = self.check_credentials(&name, &password)?;
                self.check_encryption(id, &block)?;
                self.check_unique(&name)?;
                self.complete_link(id, &name, &description)
            }
            Command::Error(text) => Err(LinkError::Remote(text)),
            other => Err(unexpected(&other, LinkState::Connecting)),
        }
    }

    /// Inbound link waiting for the peer's SERVER.
    pub(super) fn on_wait_auth_1(&mut self, id: LinkId, msg: &Message) -> LinkResult {
        match Command::parse(msg)? {
            Command::Capab(mods) => self.check_capab(&mods),
            Command::Pass(_) => Ok(()),
            Command::Aes(name) => self.activate_aes(id, &name),
            Command::Server {
                name,
                password,
                description,
                ..
            } => {
                let block = self.check_credentials(&name, &password)?;
                self.check_encryption(id, &block)?;
                self.check_unique(&name)?;
                let reply = self.our_server_message(&block.sendpass);
                if let Some(conn) = self.links.get_mut(&id) {
                    info!(link_id = %id, peer = %name, "Credentials accepted");
                    conn.record = Some(block.name.clone());
                    conn.peer_name = Some(name);
                    conn.peer_desc = description;
                    conn.state = LinkState::WaitAuth2;
                    conn.send(&reply);
                }
                Ok(())
            }
            Command::Error(text) => Err(LinkError::Remote(text)),
            other => Err(unexpected(&other, LinkState::WaitAuth1)),
        }
    }

    /// Inbound link, our SERVER sent, waiting for the peer's BURST.
    pub(super) fn on_wait_auth_2(&mut self, id: LinkId, msg: &Message) -> LinkResult {
        match Command::parse(msg)? {
            Command::Capab(mods) => self.check_capab(&mods),
            Command::Server { .. } => Ok(()),
            Command::Burst(ts) => {
                self.check_skew(id, ts)?;
                let (name, desc) = match self.links.get(&id) {
                    Some(c) => (c.peer_name.clone().unwrap_or_default(), c.peer_desc.clone()),
                    None => return Ok(()),
                };
                self.check_unique(&name)?;
                self.complete_link(id, &name, &desc)?;
                metrics::record_burst("received");
                Ok(())
            }
            Command::Error(text) => Err(LinkError::Remote(text)),
            other => Err(unexpected(&other, LinkState::WaitAuth2)),
        }
    }

    // ========================================================================
    // Checks
    // ========================================================================

    fn check_capab(&self, theirs: &[String]) -> LinkResult {
        let ours = self.capab_list();
        let theirs = normalize_capab(theirs);
        if ours != theirs {
            return Err(LinkError::CapabMismatch { ours, theirs });
        }
        Ok(())
    }

    fn check_credentials(&self, name: &str, password: &str) -> LinkResult<LinkBlock> {
        match self.link_record(name) {
            Some(r) if r.block.recvpass == password => Ok(r.block.clone()),
            _ => Err(LinkError::BadCredentials {
                name: name.to_string(),
            }),
        }
    }

    fn check_encryption(&self, id: LinkId, block: &LinkBlock) -> LinkResult {
        let Some(conn) = self.links.get(&id) else {
            return Ok(());
        };
        if block.key().is_some() && !conn.encrypted {
            return Err(LinkError::EncryptionRequired(block.name.clone()));
        }
        if let Some(owner) = &conn.key_owner
            && !irc_eq(owner, &block.name)
        {
            return Err(LinkError::ProtocolViolation(format!(
                "AES keyed for {owner} but SERVER names {}",
                block.name
            )));
        }
        Ok(())
    }

    fn check_unique(&self, name: &str) -> LinkResult {
        if self.directory.find(name).is_some() {
            return Err(LinkError::DuplicateServer(name.to_string()));
        }
        Ok(())
    }

    /// Compare a BURST timestamp with our clock.
    pub(super) fn check_skew(&self, id: LinkId, ts: Option<i64>) -> LinkResult {
        let Some(ts) = ts else {
            return Ok(());
        };
        let delta = self.now().abs_diff(ts);
        let protocol = &self.config.protocol;
        if delta > protocol.skew_fatal.unsigned_abs() {
            return Err(LinkError::ClockSkew(delta));
        }
        if delta > protocol.skew_warn.unsigned_abs() {
            let peer = self
                .links
                .get(&id)
                .map(|c| c.display_name().to_string())
                .unwrap_or_default();
            self.hooks.snotice_warn(&format!(
                "Clock skew of {delta} seconds with {peer}; please fix the clocks"
            ));
        }
        Ok(())
    }

    /// `AES <name>` from the peer: switch the link to the keyed transport.
    fn activate_aes(&mut self, id: LinkId, name: &str) -> LinkResult {
        let key = self
            .link_record(name)
            .and_then(|r| r.block.key())
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                LinkError::ProtocolViolation(format!("AES requested by {name} but no key is configured"))
            })?;
        let transport = AesTransport::new(&key)?;
        if let Some(conn) = self.links.get_mut(&id)
            && !conn.encrypted
        {
            info!(link_id = %id, peer = %name, "AES transport enabled");
            conn.set_transport(Box::new(transport));
            conn.key_owner = Some(name.to_string());
        }
        Ok(())
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Insert the authenticated peer, announce it and send our burst.
    fn complete_link(&mut self, id: LinkId, name: &str, description: &str) -> LinkResult {
        let node = self
            .directory
            .add_server(name, description, ServerId::ROOT, Some(id))
            .map_err(|e| match e {
                TopologyError::Duplicate(n) => LinkError::DuplicateServer(n),
                other => LinkError::ProtocolViolation(other.to_string()),
            })?;
        let now = self.now();
        let interval = self.config.protocol.ping_interval as i64;
        if let Some(n) = self.directory.get_mut(node) {
            n.next_ping = now + interval;
            n.answered_ping = true;
        }
        if let Some(conn) = self.links.get_mut(&id) {
            conn.state = LinkState::Connected;
            conn.node = Some(node);
            conn.peer_name = Some(name.to_string());
            conn.peer_desc = description.to_string();
            conn.bursting = true;
        }

        let us = self.server_name().to_string();
        let intro = Command::Server {
            name: name.to_string(),
            password: "*".to_string(),
            hops: 1,
            description: description.to_string(),
        }
        .to_message(Some(&us));
        self.broadcast_except(&intro, Some(node));
        self.send_burst(id, node);

        metrics::set_servers(self.directory.len());
        info!(link_id = %id, peer = %name, "Link established");
        self.hooks.server_linked(name, &us);
        self.hooks
            .snotice(&format!("Server {name} linked [{description}]"));
        Ok(())
    }
}

fn unexpected(cmd: &Command, state: LinkState) -> LinkError {
    LinkError::ProtocolViolation(format!("{} not allowed in {}", cmd.name(), state))
}
