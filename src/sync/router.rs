//! Propagation router.
//!
//! Every fan-out works over the root's direct children. A message reaches
//! a remote server by being written on the link of that server's route.
//! Targets that cannot be resolved are dropped silently: they may have left
//! the network between the decision to send and the send itself.

use std::collections::BTreeSet;

use treelink_proto::Message;

use super::engine::SpanningTree;
use super::topology::ServerId;

impl SpanningTree {
    /// Write on the link of a direct peer. Returns whether it was queued.
    pub(super) fn send_to_peer(&mut self, peer: ServerId, msg: &Message) -> bool {
        let Some(link) = self.directory.get(peer).and_then(|n| n.link) else {
            return false;
        };
        match self.links.get_mut(&link) {
            Some(conn) if conn.is_connected() => conn.send(msg),
            _ => false,
        }
    }

    /// Route for a server name or a nick. `None` for local targets and
    /// unknown names.
    pub fn route_for(&self, target: &str) -> Option<ServerId> {
        if self.directory.find(target).is_some() {
            return self.directory.best_route_to(target);
        }
        self.state
            .user_by_nick(target)
            .and_then(|u| self.directory.route_of(u.server))
    }

    /// Send towards a single server or user.
    pub fn one_to_one(&mut self, msg: &Message, target: &str) -> bool {
        match self.route_for(target) {
            Some(route) => self.send_to_peer(route, msg),
            None => false,
        }
    }

    /// Send to every direct peer.
    pub fn one_to_many(&mut self, msg: &Message) {
        self.broadcast_except(msg, None);
    }

    /// Send to every direct peer except the route towards `omit`.
    pub fn one_to_all_but_sender(&mut self, msg: &Message, omit: &str) {
        let skip = self.route_for(omit);
        self.broadcast_except(msg, skip);
    }

    /// Send to every direct peer except `skip`.
    pub(super) fn broadcast_except(&mut self, msg: &Message, skip: Option<ServerId>) {
        for peer in self.directory.direct_peers() {
            if Some(peer) != skip {
                self.send_to_peer(peer, msg);
            }
        }
    }

    /// Direct peers behind which `channel` has at least one member.
    pub fn channel_routes(&self, channel: &str) -> BTreeSet<ServerId> {
        let Some(chan) = self.state.channel(channel) else {
            return BTreeSet::new();
        };
        chan.members
            .keys()
            .filter_map(|uid| self.state.user(*uid))
            .filter_map(|u| self.directory.route_of(u.server))
            .collect()
    }

    /// Send to the peers that have members of `channel`, except `skip`.
    pub fn channel_fan_out(&mut self, msg: &Message, channel: &str, skip: Option<ServerId>) {
        for route in self.channel_routes(channel) {
            if Some(route) != skip {
                self.send_to_peer(route, msg);
            }
        }
    }
}
