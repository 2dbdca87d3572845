//! The dial primitive.
//!
//! A [`Dialer`] turns a network kind and a `host:port` address into a
//! connected byte stream. Every proxy hop is itself a `Dialer` wrapping the
//! one that reaches the previous hop, so the whole chain is built from this
//! single capability. [`TcpDialer`] is the base capability that talks to the
//! network directly.

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Network kind requested by the caller of a dial.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Network {
    /// Any address family
    #[default]
    Tcp,
    /// IPv4 only
    Tcp4,
    /// IPv6 only
    Tcp6,
}

impl Network {
    /// The conventional lowercase name (`tcp`, `tcp4`, `tcp6`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        }
    }

    fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(ProxyError::Config(format!("unsupported network: {}", other))),
        }
    }
}

/// A bidirectional byte stream produced by a dial.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Connection for T {}

/// Owned, type-erased connection handed between chain layers.
pub type BoxedConn = Box<dyn Connection>;

/// The capability "given a network kind and an address, produce a connection".
///
/// Implementations hold only immutable configuration, so one instance can
/// serve any number of concurrent dials. Dropping the returned future
/// cancels the dial.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr` and return a ready-to-use stream.
    async fn dial(&self, network: Network, addr: &str) -> Result<BoxedConn>;
}

/// Split `host:port` (or `[v6]:port`) into its host and numeric port.
pub fn split_host_port(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::Config(format!("missing port in address: {}", addr)))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| ProxyError::Config(format!("invalid port in address: {}", addr)))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(ProxyError::Config(format!("missing host in address: {}", addr)));
    }
    Ok((host, port))
}

/// Inverse of [`split_host_port`]: brackets IPv6 literals.
#[must_use]
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Base dialer that connects straight over the network.
///
/// Tries every resolved address of the requested family in order, each under
/// the connect timeout, and enables TCP keep-alive on the winning socket.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Option<Duration>,
    keep_alive: Option<Duration>,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(30)),
            keep_alive: Some(Duration::from_secs(30)),
        }
    }
}

impl TcpDialer {
    /// Create a dialer with the default 30s connect timeout and keep-alive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-address connect timeout (`None` waits indefinitely).
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the TCP keep-alive idle time (`None` leaves keep-alive off).
    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Option<Duration>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Connect and return the concrete TCP stream.
    pub async fn connect(&self, network: Network, addr: &str) -> Result<TcpStream> {
        let resolved: Vec<SocketAddr> = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| ProxyError::Dial {
                addr: addr.to_string(),
                source: e,
            })?
            .filter(|a| network.accepts(a))
            .collect();

        let mut last_err = None;
        for candidate in &resolved {
            let attempt = TcpStream::connect(candidate);
            let result = match self.connect_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connection timed out",
                    )),
                },
                None => attempt.await,
            };
            match result {
                Ok(stream) => {
                    self.apply_keep_alive(&stream);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", candidate, e);
                    last_err = Some(e);
                }
            }
        }

        Err(ProxyError::Dial {
            addr: addr.to_string(),
            source: last_err.unwrap_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("no {} addresses resolved", network),
                )
            }),
        })
    }

    fn apply_keep_alive(&self, stream: &TcpStream) {
        let Some(idle) = self.keep_alive else {
            return;
        };
        let keepalive = socket2::TcpKeepalive::new().with_time(idle);
        if let Err(e) = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            debug!("Failed to enable TCP keep-alive: {}", e);
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, network: Network, addr: &str) -> Result<BoxedConn> {
        let stream = self.connect(network, addr).await?;
        Ok(Box::new(stream))
    }
}
