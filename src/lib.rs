//! treelinkd - spanning-tree server linking for IRC networks.
//!
//! The library holds the protocol engine so integration tests can drive
//! several servers in one process; `main.rs` is a thin binary around
//! [`sync::network::run`].

pub mod config;
pub mod error;
pub mod metrics;
pub mod state;
pub mod sync;
pub mod telemetry;
