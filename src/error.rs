//! Link error taxonomy.
//!
//! Every error a link-state handler can raise is fatal to that link: the
//! engine writes `ERROR :<text>`, closes the connection and, when the link
//! had reached CONNECTED, tears down the subtree behind it. Collision losses
//! are not errors and never appear here.

use thiserror::Error;
use treelink_proto::ProtocolError;

/// Fatal per-link failures.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Unexpected command for the current state, bad parameters, or a
    /// server introduced through the wrong link.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// SERVER with an unknown name or wrong password.
    #[error("invalid credentials for {name}")]
    BadCredentials { name: String },

    /// CAPAB lists differ.
    #[error("CAPAB mismatch: we have [{ours}], peer has [{theirs}]")]
    CapabMismatch { ours: String, theirs: String },

    /// Link record requires AES but the peer never negotiated it.
    #[error("encryption required for link {0}")]
    EncryptionRequired(String),

    /// BURST timestamp too far from our clock.
    #[error("clock skew of {0} seconds exceeds the fatal threshold")]
    ClockSkew(u64),

    /// SERVER introduced a name already in the directory.
    #[error("server {0} already exists")]
    DuplicateServer(String),

    /// The peer sent ERROR.
    #[error("remote error: {0}")]
    Remote(String),

    /// Wire-level decode failure.
    #[error("transport error: {0}")]
    Transport(#[from] ProtocolError),
}

impl LinkError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::BadCredentials { .. } => "bad_credentials",
            Self::CapabMismatch { .. } => "capab_mismatch",
            Self::EncryptionRequired(_) => "encryption_required",
            Self::ClockSkew(_) => "clock_skew",
            Self::DuplicateServer(_) => "duplicate_server",
            Self::Remote(_) => "remote_error",
            Self::Transport(_) => "transport",
        }
    }

    /// Whether an `ERROR` line should be sent before closing. A peer that
    /// already sent ERROR gets none back.
    pub fn notify_peer(&self) -> bool {
        !matches!(self, Self::Remote(_))
    }
}

/// Result alias for link-state handlers.
pub type LinkResult<T = ()> = Result<T, LinkError>;
