//! Server tree and directory.
//!
//! The directory owns every [`ServerNode`] by value, keyed by a
//! never-reused [`ServerId`]. Parent and child links are ids into the same
//! map, so tearing down a branch is a walk over ids rather than a chain of
//! owned pointers. A name index gives case-insensitive lookup.
//!
//! Invariants:
//! - the root has no parent and every other node has exactly one
//! - a node's route is itself when its parent is the root, otherwise its
//!   parent's route; it is fixed when the node is added
//! - every node in the name index is reachable from the root

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use thiserror::Error;
use treelink_proto::{irc_to_lower, wildcard_match};

use super::LinkId;

/// Handle for a server in the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub u64);

impl ServerId {
    /// The local server.
    pub const ROOT: ServerId = ServerId(0);
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Directory errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("server {0} already exists")]
    Duplicate(String),
    #[error("unknown parent server {0}")]
    UnknownParent(ServerId),
    #[error("unknown server {0}")]
    UnknownServer(ServerId),
    #[error("the local server cannot be removed")]
    RemoveRoot,
}

/// One member server, local or remote.
#[derive(Debug, Clone)]
pub struct ServerNode {
    pub id: ServerId,
    pub name: String,
    pub description: String,
    /// Version string, learned from VERSION during burst.
    pub version: String,
    pub parent: Option<ServerId>,
    /// Children in introduction order.
    pub children: Vec<ServerId>,
    /// Direct peer through which this node is reached. `None` for the root.
    pub route: Option<ServerId>,
    /// Distance from the root, recomputed locally.
    pub hops: u32,
    /// Connection, for direct peers only.
    pub link: Option<LinkId>,
    /// Next time this peer is due a ping.
    pub next_ping: i64,
    /// Whether the last ping was answered.
    pub answered_ping: bool,
    /// Users on this server.
    pub user_count: usize,
    /// Operators on this server.
    pub oper_count: usize,
}

impl ServerNode {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// What [`Directory::remove_subtree`] took out.
#[derive(Debug, Clone, Default)]
pub struct RemovedSubtree {
    /// Removed nodes, parents before children.
    pub servers: Vec<ServerNode>,
    /// Sum of the removed nodes' user counts.
    pub users_lost: usize,
}

impl RemovedSubtree {
    pub fn ids(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.servers.iter().map(|s| s.id)
    }
}

/// Name-indexed arena of server nodes.
#[derive(Debug)]
pub struct Directory {
    nodes: BTreeMap<ServerId, ServerNode>,
    names: HashMap<String, ServerId>,
    next_id: u64,
    global_users: usize,
}

impl Directory {
    /// Create a directory holding only the local root.
    pub fn new(name: &str, description: &str, version: &str) -> Self {
        let root = ServerNode {
            id: ServerId::ROOT,
            name: name.to_string(),
            description: description.to_string(),
            version: version.to_string(),
            parent: None,
            children: Vec::new(),
            route: None,
            hops: 0,
            link: None,
            next_ping: 0,
            answered_ping: true,
            user_count: 0,
            oper_count: 0,
        };
        let mut nodes = BTreeMap::new();
        nodes.insert(ServerId::ROOT, root);
        let mut names = HashMap::new();
        names.insert(irc_to_lower(name), ServerId::ROOT);
        Self {
            nodes,
            names,
            next_id: 1,
            global_users: 0,
        }
    }

    pub fn root(&self) -> &ServerNode {
        &self.nodes[&ServerId::ROOT]
    }

    pub fn root_mut(&mut self) -> &mut ServerNode {
        self.nodes
            .get_mut(&ServerId::ROOT)
            .unwrap_or_else(|| unreachable!("root is never removed"))
    }

    pub fn root_name(&self) -> &str {
        &self.root().name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a server under `parent`.
    ///
    /// Fails without touching the directory if the name is taken.
    pub fn add_server(
        &mut self,
        name: &str,
        description: &str,
        parent: ServerId,
        link: Option<LinkId>,
    ) -> Result<ServerId, TopologyError> {
        let key = irc_to_lower(name);
        if self.names.contains_key(&key) {
            return Err(TopologyError::Duplicate(name.to_string()));
        }
        let parent_node = self
            .nodes
            .get(&parent)
            .ok_or(TopologyError::UnknownParent(parent))?;
        let hops = parent_node.hops + 1;
        let parent_route = parent_node.route;

        let id = ServerId(self.next_id);
        self.next_id += 1;
        let route = if parent == ServerId::ROOT {
            id
        } else {
            parent_route.unwrap_or(id)
        };

        self.nodes.insert(
            id,
            ServerNode {
                id,
                name: name.to_string(),
                description: description.to_string(),
                version: String::new(),
                parent: Some(parent),
                children: Vec::new(),
                route: Some(route),
                hops,
                link,
                next_ping: 0,
                answered_ping: true,
                user_count: 0,
                oper_count: 0,
            },
        );
        self.names.insert(key, id);
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(id);
        }
        Ok(id)
    }

    /// Exact case-insensitive lookup.
    pub fn find(&self, name: &str) -> Option<ServerId> {
        self.names.get(&irc_to_lower(name)).copied()
    }

    pub fn get(&self, id: ServerId) -> Option<&ServerNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: ServerId) -> Option<&mut ServerNode> {
        self.nodes.get_mut(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&ServerNode> {
        self.find(name).and_then(|id| self.nodes.get(&id))
    }

    pub fn name_of(&self, id: ServerId) -> Option<&str> {
        self.nodes.get(&id).map(|n| n.name.as_str())
    }

    /// First server, in tree walk order, whose name matches `mask`.
    pub fn find_by_glob(&self, mask: &str) -> Option<ServerId> {
        self.walk()
            .into_iter()
            .find(|id| wildcard_match(mask, &self.nodes[id].name))
    }

    /// Direct peer through which `name` is reached. `None` for the local
    /// server and for unknown names.
    pub fn best_route_to(&self, name: &str) -> Option<ServerId> {
        let id = self.find(name)?;
        self.nodes.get(&id).and_then(|n| n.route)
    }

    /// Route of a node by id.
    pub fn route_of(&self, id: ServerId) -> Option<ServerId> {
        self.nodes.get(&id).and_then(|n| n.route)
    }

    /// Direct children of the root.
    pub fn direct_peers(&self) -> Vec<ServerId> {
        self.root().children.clone()
    }

    /// Pre-order walk from the root, children in introduction order.
    pub fn walk(&self) -> Vec<ServerId> {
        self.walk_from(ServerId::ROOT)
    }

    /// Pre-order walk of the subtree rooted at `start`.
    pub fn walk_from(&self, start: ServerId) -> Vec<ServerId> {
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            out.push(id);
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// Whether `id` is `ancestor` or below it.
    pub fn is_within(&self, id: ServerId, ancestor: ServerId) -> bool {
        let mut cur = Some(id);
        while let Some(c) = cur {
            if c == ancestor {
                return true;
            }
            cur = self.nodes.get(&c).and_then(|n| n.parent);
        }
        false
    }

    /// Detach `id` and everything below it.
    pub fn remove_subtree(&mut self, id: ServerId) -> Result<RemovedSubtree, TopologyError> {
        if id == ServerId::ROOT {
            return Err(TopologyError::RemoveRoot);
        }
        let parent = self
            .nodes
            .get(&id)
            .ok_or(TopologyError::UnknownServer(id))?
            .parent;
        if let Some(p) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            p.children.retain(|c| *c != id);
        }

        let mut removed = RemovedSubtree::default();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            let Some(node) = self.nodes.remove(&cur) else {
                continue;
            };
            self.names.remove(&irc_to_lower(&node.name));
            stack.extend(node.children.iter().rev().copied());
            removed.users_lost += node.user_count;
            removed.servers.push(node);
        }
        self.global_users = self.global_users.saturating_sub(removed.users_lost);
        Ok(removed)
    }

    // ========================================================================
    // Counters
    // ========================================================================

    /// Users network-wide, as tallied per server.
    pub fn global_users(&self) -> usize {
        self.global_users
    }

    /// Count a user arriving on `server`.
    pub fn user_added(&mut self, server: ServerId) {
        if let Some(n) = self.nodes.get_mut(&server) {
            n.user_count += 1;
            self.global_users += 1;
        }
    }

    /// Count a user leaving `server`.
    pub fn user_removed(&mut self, server: ServerId, was_oper: bool) {
        if let Some(n) = self.nodes.get_mut(&server)
            && n.user_count > 0
        {
            n.user_count -= 1;
            if was_oper {
                n.oper_count = n.oper_count.saturating_sub(1);
            }
            self.global_users = self.global_users.saturating_sub(1);
        }
    }

    /// Count an operator on `server`.
    pub fn oper_added(&mut self, server: ServerId) {
        if let Some(n) = self.nodes.get_mut(&server) {
            n.oper_count += 1;
        }
    }
}
