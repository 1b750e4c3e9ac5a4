//! Server-to-server link configuration.

use serde::Deserialize;

/// Link block: one potential peer.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LinkBlock {
    /// Remote server name (e.g., "leaf.example.net").
    pub name: String,
    /// Remote address to connect to.
    pub ipaddr: String,
    /// Remote port.
    pub port: u16,
    /// Password we send in our SERVER line.
    pub sendpass: String,
    /// Password the peer must send in theirs.
    pub recvpass: String,
    /// Seconds between automatic connection attempts, 0 to disable.
    #[serde(default)]
    pub autoconnect: u64,
    /// Shared AES key. When set, the peer must negotiate encryption.
    #[serde(default)]
    pub encryptionkey: Option<String>,
    /// Omit this link from LINKS output.
    #[serde(default)]
    pub hidden: bool,
}

impl LinkBlock {
    /// Key bytes, if a key is configured.
    pub fn key(&self) -> Option<&[u8]> {
        self.encryptionkey.as_deref().map(str::as_bytes)
    }
}
