//! In-process test network.
//!
//! Every server is a [`SpanningTree`] sharing one fake clock. Links are
//! pairs of outbox channels: [`Net::pump`] moves queued lines from one
//! engine into the other until nothing is left in flight, so a test can
//! link servers, make changes and then inspect every engine's view.

#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use treelink_proto::NickIntro;
use treelinkd::config::{Config, LinkBlock};
use treelinkd::state::UserId;
use treelinkd::sync::{
    DialRequest, LinkEvent, LinkId, LinkObserver, MessageObserver, Outbound, SpanningTree,
};

/// Clock value every test network starts at.
pub const START: i64 = 1_000_000;

/// One line seen on a simulated socket.
#[derive(Debug, Clone)]
pub struct WireLine {
    pub from: String,
    pub to: String,
    pub line: String,
}

pub struct Node {
    pub tree: SpanningTree,
    dials: UnboundedReceiver<DialRequest>,
}

struct End {
    node: usize,
    link: LinkId,
    rx: UnboundedReceiver<Outbound>,
}

struct Pipe {
    ends: [End; 2],
    open: bool,
}

pub struct Net {
    clock: Arc<AtomicI64>,
    nodes: Vec<Node>,
    pipes: Vec<Pipe>,
    /// Every line delivered so far, in order.
    pub wire: Vec<WireLine>,
}

/// Link block from `local` towards `remote`. Passwords are derived from the
/// pair so both sides agree without further setup.
pub fn link_block(local: &str, remote: &str) -> LinkBlock {
    LinkBlock {
        name: remote.to_string(),
        ipaddr: "127.0.0.1".to_string(),
        port: 7000,
        sendpass: format!("{local}->{remote}"),
        recvpass: format!("{remote}->{local}"),
        autoconnect: 0,
        encryptionkey: None,
        hidden: false,
    }
}

/// Config for `name` with a link block for every other server in `names`.
pub fn config_for(name: &str, names: &[&str]) -> Config {
    let mut config = Config::for_server(name, &format!("{name} test server"));
    config.server.network = "TestNet".to_string();
    config.protocol.common_modules = vec!["m_services.so".to_string()];
    for other in names.iter().filter(|n| **n != name) {
        config.link.push(link_block(name, other));
    }
    config
}

/// A plausible user introduction.
pub fn intro(nick: &str, age: i64) -> NickIntro {
    NickIntro {
        age,
        nick: nick.to_string(),
        host: format!("{}.users.test", nick.to_lowercase()),
        dhost: "cloaked.test".to_string(),
        ident: "user".to_string(),
        modes: "+i".to_string(),
        ip: "192.0.2.10".to_string(),
        gecos: format!("{nick} Test"),
    }
}

impl Net {
    pub fn new(names: &[&str]) -> Self {
        Self::with_config(names, |_| {})
    }

    /// Build a network, letting the caller adjust each server's config.
    pub fn with_config(names: &[&str], tweak: impl Fn(&mut Config)) -> Self {
        let clock = Arc::new(AtomicI64::new(START));
        let nodes = names
            .iter()
            .map(|name| {
                let mut config = config_for(name, names);
                tweak(&mut config);
                let c = clock.clone();
                let mut tree =
                    SpanningTree::with_clock(config, Box::new(move || c.load(Ordering::SeqCst)));
                let (tx, dials) = unbounded_channel();
                tree.set_dialer(tx);
                Node { tree, dials }
            })
            .collect();
        Self {
            clock,
            nodes,
            pipes: Vec::new(),
            wire: Vec::new(),
        }
    }

    fn idx(&self, name: &str) -> usize {
        self.nodes
            .iter()
            .position(|n| n.tree.server_name() == name)
            .unwrap_or_else(|| panic!("no server {name} in the test network"))
    }

    pub fn node(&self, name: &str) -> &SpanningTree {
        &self.nodes[self.idx(name)].tree
    }

    pub fn node_mut(&mut self, name: &str) -> &mut SpanningTree {
        let i = self.idx(name);
        &mut self.nodes[i].tree
    }

    pub fn now(&self) -> i64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn advance(&self, secs: i64) {
        self.clock.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn tick(&mut self, name: &str) {
        self.node_mut(name).tick();
    }

    /// Open a socket from `from` to `to` and run the handshake and both
    /// bursts to completion.
    pub fn link(&mut self, from: &str, to: &str) {
        self.open(from, to);
        self.pump();
    }

    /// Open a socket from `from` to `to` without delivering anything.
    pub fn open(&mut self, from: &str, to: &str) {
        let a = self.idx(from);
        let b = self.idx(to);
        self.nodes[a]
            .tree
            .connect(to)
            .unwrap_or_else(|e| panic!("{from} cannot connect to {to}: {e}"));
        let req = self.nodes[a]
            .dials
            .try_recv()
            .expect("connect queues a dial request");

        let (tx, rx) = unbounded_channel();
        let b_link = self.nodes[b].tree.link_ids().next();
        self.nodes[b].tree.handle_event(LinkEvent::Accepted {
            link: b_link,
            addr: format!("10.0.0.{}:40000", a + 1),
            outbox: tx,
        });
        self.nodes[a]
            .tree
            .handle_event(LinkEvent::Connected { link: req.link });

        self.pipes.push(Pipe {
            ends: [
                End {
                    node: a,
                    link: req.link,
                    rx: req.outbox,
                },
                End {
                    node: b,
                    link: b_link,
                    rx,
                },
            ],
            open: true,
        });
    }

    /// Deliver queued lines until every engine is quiet.
    pub fn pump(&mut self) {
        loop {
            let mut moved = false;
            for p in 0..self.pipes.len() {
                for side in 0..2 {
                    while self.step(p, side) {
                        moved = true;
                    }
                }
            }
            if !moved {
                break;
            }
        }
    }

    /// Move one item off one end of a pipe. Returns `false` when empty.
    fn step(&mut self, p: usize, side: usize) -> bool {
        let item = match self.pipes[p].ends[side].rx.try_recv() {
            Ok(item) => item,
            Err(_) => return false,
        };
        if !self.pipes[p].open {
            return true;
        }
        let from = self.pipes[p].ends[side].node;
        let to = self.pipes[p].ends[1 - side].node;
        let link = self.pipes[p].ends[1 - side].link;
        match item {
            Outbound::Line(line) => {
                self.wire.push(WireLine {
                    from: self.nodes[from].tree.server_name().to_string(),
                    to: self.nodes[to].tree.server_name().to_string(),
                    line: line.clone(),
                });
                self.nodes[to]
                    .tree
                    .handle_event(LinkEvent::Line { link, line });
            }
            Outbound::Close => {
                self.pipes[p].open = false;
                self.nodes[to].tree.handle_event(LinkEvent::Closed {
                    link,
                    reason: "Connection reset by peer".to_string(),
                });
            }
        }
        true
    }

    /// Hand `to` a line as if `from` had written it on their link.
    pub fn inject(&mut self, from: &str, to: &str, line: &str) {
        let a = self.idx(from);
        let b = self.idx(to);
        let link = self
            .pipes
            .iter()
            .filter(|p| p.open)
            .flat_map(|p| {
                let [x, y] = &p.ends;
                [(x.node, y.node, y.link), (y.node, x.node, x.link)]
            })
            .find(|(src, dst, _)| *src == a && *dst == b)
            .map(|(_, _, link)| link)
            .unwrap_or_else(|| panic!("{from} and {to} are not linked"));
        self.nodes[b].tree.handle_event(LinkEvent::Line {
            link,
            line: line.to_string(),
        });
    }

    /// Drop the socket between two servers from `from`'s end.
    pub fn cut(&mut self, from: &str, to: &str) {
        let a = self.idx(from);
        let b = self.idx(to);
        for pipe in self.pipes.iter_mut().filter(|p| p.open) {
            let [x, y] = &pipe.ends;
            let (near, far) = if x.node == a && y.node == b {
                (x.link, y.link)
            } else if y.node == a && x.node == b {
                (y.link, x.link)
            } else {
                continue;
            };
            pipe.open = false;
            self.nodes[a].tree.handle_event(LinkEvent::Closed {
                link: near,
                reason: "Connection reset by peer".to_string(),
            });
            self.nodes[b].tree.handle_event(LinkEvent::Closed {
                link: far,
                reason: "Connection reset by peer".to_string(),
            });
            return;
        }
    }

    /// Lines `from` wrote towards `to`.
    pub fn sent(&self, from: &str, to: &str) -> Vec<String> {
        self.wire
            .iter()
            .filter(|w| w.from == from && w.to == to)
            .map(|w| w.line.clone())
            .collect()
    }

    pub fn clear_wire(&mut self) {
        self.wire.clear();
    }

    /// Connect a local user on `server`.
    pub fn add_user(&mut self, server: &str, nick: &str, age: i64) -> UserId {
        self.node_mut(server)
            .introduce_local_user(intro(nick, age))
            .unwrap_or_else(|e| panic!("cannot introduce {nick} on {server}: {e}"))
    }

    /// Names of every server `name` knows about, sorted.
    pub fn servers_seen_by(&self, name: &str) -> Vec<String> {
        let dir = self.node(name).directory();
        let mut names: Vec<String> = dir
            .walk()
            .into_iter()
            .filter_map(|id| dir.name_of(id).map(str::to_string))
            .collect();
        names.sort();
        names
    }
}

/// Observer that writes everything it hears into a shared log.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.0.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.events().iter().any(|e| e.contains(needle))
    }

    fn push(&self, event: String) {
        if let Ok(mut v) = self.0.lock() {
            v.push(event);
        }
    }

    /// Register on every hook category of `tree`.
    pub fn attach(&self, tree: &mut SpanningTree) {
        tree.hooks_mut().add_link_observer(Box::new(self.clone()));
        tree.hooks_mut().add_message_observer(Box::new(self.clone()));
    }
}

impl LinkObserver for Recorder {
    fn server_linked(&self, name: &str, parent: &str) {
        self.push(format!("linked {name} via {parent}"));
    }

    fn server_split(&self, name: &str, reason: &str, servers_lost: usize, users_lost: usize) {
        self.push(format!(
            "split {name} ({reason}) servers={servers_lost} users={users_lost}"
        ));
    }

    fn pong_received(&self, server: &str) {
        self.push(format!("pong {server}"));
    }

    fn snotice(&self, text: &str) {
        self.push(format!("snotice {text}"));
    }
}

impl MessageObserver for Recorder {
    fn deliver(&self, recipient: &str, source: &str, target: &str, text: &str, notice: bool) {
        let kind = if notice { "notice" } else { "privmsg" };
        self.push(format!("{kind} {source} -> {recipient} ({target}): {text}"));
    }

    fn user_killed(&self, nick: &str, reason: &str) {
        self.push(format!("killed {nick}: {reason}"));
    }

    fn user_quit(&self, nick: &str, reason: &str) {
        self.push(format!("quit {nick}: {reason}"));
    }

    fn user_kicked(&self, channel: &str, nick: &str, source: &str, reason: &str) {
        self.push(format!("kicked {nick} from {channel} by {source}: {reason}"));
    }

    fn time_reply(&self, nick: &str, server: &str, ts: i64) {
        self.push(format!("time {server} for {nick}: {ts}"));
    }
}
