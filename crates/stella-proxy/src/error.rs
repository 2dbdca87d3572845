//! Error types for the stella-proxy crate.

use thiserror::Error;

/// Errors that can occur while dialing through a proxy chain or serving clients.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Dial to {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake with {addr} failed: {reason}")]
    Tls { addr: String, reason: String },

    #[error("Invalid TLS server name: {addr}")]
    InvalidServerName { addr: String },

    /// The hop answered the tunnel request with a non-success status.
    /// Displays as the status text alone (e.g. `Proxy Authentication Required`).
    #[error("{reason}")]
    Rejected { status: u16, reason: String },

    #[error("no NTLM challenge received")]
    NoNtlmChallenge,

    #[error("NTLM error: {0}")]
    Ntlm(String),

    #[error("HTTP parse error: {0}")]
    HttpParse(String),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
