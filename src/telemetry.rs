//! Telemetry utilities: span constructors and the operator-notice target.

/// Tracing target for operator notices (SNOTICE-style messages).
pub const SNOTICE_TARGET: &str = "snotice";

/// Standardized span constructors for link observability.
pub mod spans {
    use tracing::{Span, info_span};

    /// Span for one server connection, before its name is known.
    pub fn link(link_id: u64, addr: &str) -> Span {
        info_span!("link", link_id = link_id, addr = %addr)
    }

    /// Span for an authenticated peer.
    pub fn peer(name: &str, link_id: u64) -> Span {
        info_span!("peer", name = %name, link_id = link_id)
    }

    /// Span covering the engine's event loop.
    pub fn engine(server: &str) -> Span {
        info_span!("engine", server = %server)
    }
}
