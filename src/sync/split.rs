//! Netsplit handling.
//!
//! When a server leaves the tree, everything behind it leaves too:
//! - the SQUIT goes out to every other direction
//! - the subtree is removed from the directory
//! - users on the removed servers quit with `<parent> <server>`
//! - links to removed direct peers are closed

use std::collections::HashSet;

use tracing::{info, warn};
use treelink_proto::Command;

use super::engine::SpanningTree;
use super::topology::ServerId;
use crate::metrics;
use crate::state::UserId;

impl SpanningTree {
    /// Remove `node` and its subtree from the network.
    pub(super) fn squit_node(&mut self, node: ServerId, reason: &str) {
        if node == ServerId::ROOT {
            return;
        }
        let Some((name, parent_name, route)) = self.directory.get(node).map(|n| {
            let parent = n
                .parent
                .and_then(|p| self.directory.name_of(p))
                .unwrap_or_else(|| self.directory.root_name())
                .to_string();
            (n.name.clone(), parent, n.route)
        }) else {
            return;
        };

        let squit = Command::Squit {
            server: name.clone(),
            reason: reason.to_string(),
        }
        .to_message(Some(&parent_name));
        self.broadcast_except(&squit, route);

        let removed = match self.directory.remove_subtree(node) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(server = %name, error = %e, "Failed to remove split server");
                return;
            }
        };
        let lost: HashSet<ServerId> = removed.ids().collect();

        let quit_reason = format!("{parent_name} {name}");
        let victims: Vec<UserId> = self
            .state
            .users()
            .filter(|u| lost.contains(&u.server))
            .map(|u| u.id)
            .collect();
        for uid in &victims {
            self.drop_user(*uid, &quit_reason, false);
        }

        let dead_links: Vec<_> = removed.servers.iter().filter_map(|s| s.link).collect();
        for id in dead_links {
            if let Some(mut conn) = self.links.remove(&id) {
                conn.send(&Command::Error(reason.to_string()).to_message(None));
                conn.close();
            }
        }

        metrics::inc_netsplits();
        metrics::set_servers(self.directory.len());
        info!(
            server = %name,
            reason = %reason,
            servers = removed.servers.len(),
            users = victims.len(),
            "Netsplit"
        );
        self.hooks
            .server_split(&name, reason, removed.servers.len(), victims.len());
        self.hooks.snotice_warn(&format!(
            "Netsplit: {name} split from {parent_name} ({reason}); lost {} servers and {} users",
            removed.servers.len(),
            victims.len()
        ));
    }
}
