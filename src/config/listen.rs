//! Listener configuration.

use serde::Deserialize;
use std::net::SocketAddr;

/// A `[[bind]]` block.
#[derive(Debug, Clone, Deserialize)]
pub struct BindConfig {
    /// Address to bind to (e.g., "0.0.0.0:7000").
    pub address: SocketAddr,
    /// Listener type. Only `servers` is served here.
    #[serde(rename = "type", default = "default_bind_type")]
    pub kind: String,
}

impl BindConfig {
    /// Whether this listener accepts server links.
    pub fn is_servers(&self) -> bool {
        self.kind.eq_ignore_ascii_case("servers")
    }
}

fn default_bind_type() -> String {
    "servers".to_string()
}
