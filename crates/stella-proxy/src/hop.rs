//! One proxy hop as a [`Dialer`] decorator.
//!
//! A [`HopDialer`] reaches its hop through the dialer it wraps, optionally
//! upgrades that connection to TLS, and then asks the hop for a tunnel to the
//! address its own caller wants. The address passed to `dial` is never dialed
//! directly; only the hop's own address is.

use crate::basic;
use crate::dial::{BoxedConn, Dialer, Network};
use crate::error::Result;
use crate::handshake::TunnelMethod;
use crate::ntlm::{self, NtlmCredentials};
use crate::retry::{dial_with_retry, RetryPolicy};
use crate::tls;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

/// How a hop expects clients to authenticate.
#[derive(Clone, Default)]
pub enum AuthMode {
    /// Tunnel request without a `Proxy-Authorization` header.
    #[default]
    None,
    Basic {
        username: String,
        password: Zeroizing<String>,
    },
    Ntlm {
        username: String,
        password: Zeroizing<String>,
        /// Empty when the hop's domain is not configured.
        domain: String,
    },
}

impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::None => f.write_str("None"),
            AuthMode::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            AuthMode::Ntlm {
                username, domain, ..
            } => f
                .debug_struct("Ntlm")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .field("domain", domain)
                .finish(),
        }
    }
}

/// Configuration of one hop in a chain. Immutable once the chain is built.
#[derive(Debug, Clone)]
pub struct HopConfig {
    /// `host:port` of the proxy.
    pub address: String,
    pub auth: AuthMode,
    /// Wrap the connection to this hop in TLS before the handshake.
    pub use_tls: bool,
    /// Accept any certificate from this hop. Only meaningful with `use_tls`.
    pub insecure_skip_verify: bool,
    /// Ask for the tunnel with `GET` instead of `CONNECT`.
    pub use_get_method: bool,
    pub retry: RetryPolicy,
}

impl HopConfig {
    /// A plain-TCP, unauthenticated `CONNECT` hop with the default retry policy.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            auth: AuthMode::None,
            use_tls: false,
            insecure_skip_verify: false,
            use_get_method: false,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, insecure_skip_verify: bool) -> Self {
        self.use_tls = true;
        self.insecure_skip_verify = insecure_skip_verify;
        self
    }

    #[must_use]
    pub fn with_get_method(mut self) -> Self {
        self.use_get_method = true;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Verb used for the tunnel request.
    #[must_use]
    pub fn method(&self) -> TunnelMethod {
        if self.use_get_method {
            TunnelMethod::Get
        } else {
            TunnelMethod::Connect
        }
    }
}

/// Dialer that tunnels through one hop, reached via `inner`.
pub struct HopDialer {
    inner: Arc<dyn Dialer>,
    hop: HopConfig,
    /// Precomputed `Proxy-Authorization` value for Basic hops.
    basic_authorization: Option<Zeroizing<String>>,
}

impl HopDialer {
    #[must_use]
    pub fn new(inner: Arc<dyn Dialer>, hop: HopConfig) -> Self {
        let basic_authorization = match &hop.auth {
            AuthMode::Basic { username, password } => {
                Some(basic::basic_authorization(username, password))
            }
            _ => None,
        };
        Self {
            inner,
            hop,
            basic_authorization,
        }
    }
}

#[async_trait]
impl Dialer for HopDialer {
    async fn dial(&self, network: Network, addr: &str) -> Result<BoxedConn> {
        let hop = &self.hop;
        let conn = dial_with_retry(self.inner.as_ref(), network, &hop.address, hop.retry).await?;

        let conn = if hop.use_tls {
            tls::wrap(conn, &hop.address, hop.insecure_skip_verify).await?
        } else {
            conn
        };

        debug!(hop = %hop.address, target = addr, "negotiating tunnel through hop");
        let method = hop.method();
        match &hop.auth {
            AuthMode::None => basic::negotiate(conn, addr, None, method).await,
            AuthMode::Basic { .. } => {
                let authorization = self.basic_authorization.as_ref().map(|v| v.as_str());
                basic::negotiate(conn, addr, authorization, method).await
            }
            AuthMode::Ntlm {
                username,
                password,
                domain,
            } => {
                let credentials = NtlmCredentials {
                    username,
                    password,
                    domain,
                };
                ntlm::negotiate(
                    conn,
                    addr,
                    &credentials,
                    method,
                    self.inner.as_ref(),
                    network,
                )
                .await
            }
        }
    }
}
