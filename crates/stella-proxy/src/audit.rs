//! Audit logging for client requests.
//!
//! One structured event per tunnel outcome, emitted under the
//! `stella_proxy::audit` target. Credentials and request contents are never
//! included.

use tracing::info;

/// How the client asked for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// CONNECT tunnel
    Connect,
    /// Absolute-form HTTP request forwarded over a fresh tunnel
    Forward,
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyMode::Connect => write!(f, "connect"),
            ProxyMode::Forward => write!(f, "forward"),
        }
    }
}

/// Log a tunnel the chain established.
pub fn log_established(mode: ProxyMode, host: &str, port: u16, method: &str) {
    info!(
        target: "stella_proxy::audit",
        mode = %mode,
        host = host,
        port = port,
        method = method,
        decision = "established",
        "tunnel established"
    );
}

/// Log a request the chain could not serve.
pub fn log_failed(mode: ProxyMode, host: &str, port: u16, status: u16, reason: &str) {
    info!(
        target: "stella_proxy::audit",
        mode = %mode,
        host = host,
        port = port,
        status = status,
        decision = "failed",
        reason = reason,
        "tunnel failed"
    );
}

/// Log the end of a relayed tunnel.
pub fn log_closed(mode: ProxyMode, host: &str, port: u16, sent: u64, received: u64) {
    info!(
        target: "stella_proxy::audit",
        mode = %mode,
        host = host,
        port = port,
        bytes_sent = sent,
        bytes_received = received,
        "tunnel closed"
    );
}
