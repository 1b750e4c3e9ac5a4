//! Prometheus metrics for the linking engine.
//!
//! - `s2s_lines_received_total` / `s2s_lines_sent_total` - wire lines per direction
//! - `s2s_link_errors_total{code}` - fatal link errors by [`LinkError::error_code`]
//! - `s2s_nick_collisions_total` - nick collisions resolved by kill
//! - `s2s_mode_bounces_total{kind}` - FMODE and FJOIN bounces
//! - `s2s_netsplits_total` - subtree teardowns
//! - `s2s_bursts_total{direction}` - bursts sent and received
//! - `s2s_servers` - servers currently in the directory
//!
//! [`LinkError::error_code`]: crate::error::LinkError::error_code

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

// ========================================================================
// Counters
// ========================================================================

/// Lines read from peer links.
pub static LINES_RECEIVED: OnceLock<IntCounter> = OnceLock::new();

/// Lines queued to peer links.
pub static LINES_SENT: OnceLock<IntCounter> = OnceLock::new();

/// Fatal link errors by code.
pub static LINK_ERRORS: OnceLock<IntCounterVec> = OnceLock::new();

/// Nick collisions resolved.
pub static NICK_COLLISIONS: OnceLock<IntCounter> = OnceLock::new();

/// TS bounces generated, by kind (`fmode`, `fjoin`).
pub static MODE_BOUNCES: OnceLock<IntCounterVec> = OnceLock::new();

/// Netsplits processed.
pub static NETSPLITS: OnceLock<IntCounter> = OnceLock::new();

/// Bursts by direction (`sent`, `received`).
pub static BURSTS: OnceLock<IntCounterVec> = OnceLock::new();

// ========================================================================
// Gauges
// ========================================================================

/// Servers in the directory, root included.
pub static SERVERS: OnceLock<IntGauge> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Safe to call more than once; only the first call registers.
pub fn init() {
    let r = registry();

    macro_rules! register {
        ($metric:ident, $init:expr) => {
            match $init {
                Ok(m) => {
                    if let Err(e) = r.register(Box::new(m.clone())) {
                        tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
                    }
                    let _ = $metric.set(m);
                }
                Err(e) => {
                    tracing::warn!(error = %e, concat!("Failed to create metric ", stringify!($metric)));
                }
            }
        };
    }

    if SERVERS.get().is_some() {
        return;
    }

    register!(LINES_RECEIVED, IntCounter::new("s2s_lines_received_total", "Lines received from peer servers"));
    register!(LINES_SENT, IntCounter::new("s2s_lines_sent_total", "Lines sent to peer servers"));
    register!(LINK_ERRORS, IntCounterVec::new(Opts::new("s2s_link_errors_total", "Fatal link errors by code"), &["code"]));
    register!(NICK_COLLISIONS, IntCounter::new("s2s_nick_collisions_total", "Nick collisions resolved"));
    register!(MODE_BOUNCES, IntCounterVec::new(Opts::new("s2s_mode_bounces_total", "Timestamp bounces generated"), &["kind"]));
    register!(NETSPLITS, IntCounter::new("s2s_netsplits_total", "Netsplits processed"));
    register!(BURSTS, IntCounterVec::new(Opts::new("s2s_bursts_total", "Netbursts by direction"), &["direction"]));
    register!(SERVERS, IntGauge::new("s2s_servers", "Servers in the network directory"));
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

#[inline]
pub fn inc_lines_received() {
    if let Some(c) = LINES_RECEIVED.get() {
        c.inc();
    }
}

#[inline]
pub fn inc_lines_sent() {
    if let Some(c) = LINES_SENT.get() {
        c.inc();
    }
}

/// Record a fatal link error.
#[inline]
pub fn record_link_error(code: &str) {
    if let Some(c) = LINK_ERRORS.get() {
        c.with_label_values(&[code]).inc();
    }
}

#[inline]
pub fn inc_nick_collisions() {
    if let Some(c) = NICK_COLLISIONS.get() {
        c.inc();
    }
}

/// Record a bounce of the given kind.
#[inline]
pub fn record_bounce(kind: &str) {
    if let Some(c) = MODE_BOUNCES.get() {
        c.with_label_values(&[kind]).inc();
    }
}

#[inline]
pub fn inc_netsplits() {
    if let Some(c) = NETSPLITS.get() {
        c.inc();
    }
}

/// Record a burst in the given direction.
#[inline]
pub fn record_burst(direction: &str) {
    if let Some(c) = BURSTS.get() {
        c.with_label_values(&[direction]).inc();
    }
}

#[inline]
pub fn set_servers(count: usize) {
    if let Some(g) = SERVERS.get() {
        g.set(count as i64);
    }
}
