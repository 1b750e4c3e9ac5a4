//! Sync Module - Server-to-Server Linking.
//!
//! This module keeps the spanning tree of linked servers and the network
//! state replicated across it. [`SpanningTree`] is the engine; `network`
//! connects it to real sockets.

mod burst;
mod collision;
mod engine;
mod handshake;
mod hooks;
mod link;
mod local;
pub mod network;
mod oper;
mod protocol;
mod router;
mod split;
mod topology;

pub use engine::{Clock, DialRequest, LinkEvent, SpanningTree, VERSION};
pub use hooks::{Hooks, LinkObserver, MessageObserver, ModeObserver};
pub use link::{LinkConnection, LinkId, LinkIdAllocator, LinkRecord, LinkState, Outbound};
pub use local::LocalError;
pub use oper::{LinkInfo, OperError};
pub use topology::{Directory, RemovedSubtree, ServerId, ServerNode, TopologyError};
