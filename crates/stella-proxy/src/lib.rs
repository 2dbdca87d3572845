//! Chained-dialer forward proxy.
//!
//! `stella-proxy` turns a single dial capability into a pipeline of upstream
//! proxy hops:
//!
//! 1. **Dialers** (`dial`, `hop`, `chain`) - every hop is a [`Dialer`]
//!    wrapping the dialer that reaches the previous hop. [`compose`] folds a
//!    hop list over a base [`TcpDialer`], first hop innermost.
//!
//! 2. **Negotiators** (`basic`, `ntlm`) - each hop asks for a tunnel with
//!    `CONNECT` (or `GET`) addressed at the next hop, authenticating with
//!    Basic, NTLM, or nothing. Hops may be reached over TLS (`tls`) and
//!    retry their dial (`retry`).
//!
//! 3. **Front-end server** (`server`) - a forward HTTP(S) proxy that sends
//!    every client connection through the composed chain.

pub mod audit;
pub mod basic;
pub mod chain;
pub mod config;
pub mod connect;
pub mod dial;
pub mod error;
pub mod forward;
pub mod handshake;
pub mod hop;
pub mod ntlm;
pub mod retry;
pub mod server;
pub mod tls;

#[cfg(test)]
mod testutil;

pub use chain::compose;
pub use config::{ChainConfig, HopRecord, ProxyConfig};
pub use dial::{BoxedConn, Dialer, Network, TcpDialer};
pub use error::{ProxyError, Result};
pub use hop::{AuthMode, HopConfig, HopDialer};
pub use retry::RetryPolicy;
pub use server::{start, ProxyHandle};
