//! Configuration types.
//!
//! [`ChainConfig`] is the persisted JSON document (hop list, retry budget,
//! dialer timeouts). [`ProxyConfig`] holds the runtime settings of the
//! front-end listener.

use crate::dial::{split_host_port, TcpDialer};
use crate::error::{ProxyError, Result};
use crate::hop::{AuthMode, HopConfig};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use zeroize::Zeroizing;

/// Configuration for the front-end proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Bind address (default: 127.0.0.1)
    pub bind_addr: IpAddr,

    /// Bind port (0 = OS-assigned ephemeral port)
    pub bind_port: u16,

    /// Maximum concurrent connections (0 = unlimited).
    pub max_connections: usize,

    /// Upper bound on dialing the chain for one client request.
    /// `None` leaves it to the dialers' own timeouts.
    pub dial_deadline: Option<Duration>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            bind_port: 0,
            max_connections: 256,
            dial_deadline: None,
        }
    }
}

/// Persisted configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainConfig {
    /// Listening port; zero or negative means "not set".
    #[serde(default = "default_port")]
    pub port: i64,

    /// Connect timeout of the base dialer, in seconds (0 = none).
    #[serde(default = "default_timeout")]
    pub timeout: f64,

    /// TCP keep-alive interval of the base dialer, in seconds (0 = off).
    #[serde(default = "default_keep_alive")]
    pub keep_alive: f64,

    /// Retry budget for dialing each hop; negative = unbounded.
    #[serde(default = "default_max_retry")]
    pub max_retry: i64,

    /// Overall deadline for one client's chain dial, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dial_deadline: Option<f64>,

    /// Hops in tunnel order: the first is reached directly.
    #[serde(default)]
    pub chain: Vec<HopRecord>,
}

fn default_port() -> i64 {
    -1
}

fn default_timeout() -> f64 {
    30.0
}

fn default_keep_alive() -> f64 {
    30.0
}

fn default_max_retry() -> i64 {
    3
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            timeout: default_timeout(),
            keep_alive: default_keep_alive(),
            max_retry: default_max_retry(),
            dial_deadline: None,
            chain: Vec::new(),
        }
    }
}

/// One hop as written in the configuration file.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HopRecord {
    pub addr: String,
    #[serde(default)]
    pub is_https: bool,
    #[serde(default)]
    pub is_ntlm: bool,
    #[serde(default)]
    pub is_get: bool,
    #[serde(default)]
    pub insecure_skip: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub domain: String,
    /// Overrides the file-wide `max-retry` for this hop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry: Option<i64>,
}

impl fmt::Debug for HopRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HopRecord")
            .field("addr", &self.addr)
            .field("is_https", &self.is_https)
            .field("is_ntlm", &self.is_ntlm)
            .field("is_get", &self.is_get)
            .field("insecure_skip", &self.insecure_skip)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("domain", &self.domain)
            .field("max_retry", &self.max_retry)
            .finish()
    }
}

impl HopRecord {
    /// Authentication selected by the record's flags.
    ///
    /// `is-ntlm` wins; otherwise a non-empty `user` means Basic.
    #[must_use]
    pub fn auth_mode(&self) -> AuthMode {
        if self.is_ntlm {
            AuthMode::Ntlm {
                username: self.user.clone(),
                password: Zeroizing::new(self.password.clone()),
                domain: self.domain.clone(),
            }
        } else if !self.user.is_empty() {
            AuthMode::Basic {
                username: self.user.clone(),
                password: Zeroizing::new(self.password.clone()),
            }
        } else {
            AuthMode::None
        }
    }

    fn to_hop(&self, default_retry: i64) -> HopConfig {
        HopConfig {
            address: self.addr.clone(),
            auth: self.auth_mode(),
            use_tls: self.is_https,
            insecure_skip_verify: self.insecure_skip,
            use_get_method: self.is_get,
            retry: RetryPolicy::from_max_retry(self.max_retry.unwrap_or(default_retry)),
        }
    }
}

impl ChainConfig {
    /// Check addresses and durations.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("timeout", self.timeout), ("keep-alive", self.keep_alive)] {
            check_seconds(name, value)?;
        }
        if let Some(deadline) = self.dial_deadline {
            check_seconds("dial-deadline", deadline)?;
        }
        if self.port > i64::from(u16::MAX) {
            return Err(ProxyError::Config(format!("port out of range: {}", self.port)));
        }
        for (index, hop) in self.chain.iter().enumerate() {
            split_host_port(&hop.addr).map_err(|e| {
                ProxyError::Config(format!("chain[{}]: {}", index, config_reason(e)))
            })?;
        }
        Ok(())
    }

    /// The hop list in tunnel order. Fails if the configuration is invalid.
    pub fn hops(&self) -> Result<Vec<HopConfig>> {
        self.validate()?;
        Ok(self
            .chain
            .iter()
            .map(|record| record.to_hop(self.max_retry))
            .collect())
    }

    /// Base network dialer configured with `timeout` and `keep-alive`.
    pub fn tcp_dialer(&self) -> Result<TcpDialer> {
        self.validate()?;
        Ok(TcpDialer::new()
            .with_connect_timeout(seconds(self.timeout))
            .with_keep_alive(seconds(self.keep_alive)))
    }

    /// Per-client dial deadline, if configured and non-zero.
    #[must_use]
    pub fn dial_deadline(&self) -> Option<Duration> {
        self.dial_deadline.and_then(seconds)
    }

    /// Configured listening port, if set.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        u16::try_from(self.port).ok().filter(|p| *p > 0)
    }

    /// A filled-in configuration showing every option.
    #[must_use]
    pub fn example() -> Self {
        Self {
            port: 9090,
            dial_deadline: Some(120.0),
            chain: vec![
                HopRecord {
                    addr: "127.0.0.1:8080".to_string(),
                    ..Default::default()
                },
                HopRecord {
                    addr: "proxy.example.com:3128".to_string(),
                    is_https: true,
                    user: "user".to_string(),
                    password: "password".to_string(),
                    ..Default::default()
                },
                HopRecord {
                    addr: "ntlm.example.com:8080".to_string(),
                    is_ntlm: true,
                    user: "user".to_string(),
                    password: "password".to_string(),
                    domain: "DOMAIN".to_string(),
                    max_retry: Some(-1),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }
}

fn check_seconds(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(ProxyError::Config(format!(
            "{} must be a non-negative number of seconds, got {}",
            name, value
        )));
    }
    Ok(())
}

/// Zero disables the setting.
fn seconds(value: f64) -> Option<Duration> {
    (value > 0.0).then(|| Duration::from_secs_f64(value))
}

fn config_reason(err: ProxyError) -> String {
    match err {
        ProxyError::Config(reason) => reason,
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_proxy_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.bind_addr, IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        assert_eq!(config.bind_port, 0);
        assert!(config.dial_deadline.is_none());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: ChainConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.port, -1);
        assert_eq!(config.port(), None);
        assert_eq!(config.timeout, 30.0);
        assert_eq!(config.keep_alive, 30.0);
        assert_eq!(config.max_retry, 3);
        assert!(config.dial_deadline().is_none());
        assert!(config.hops().unwrap().is_empty());
    }

    #[test]
    fn test_kebab_case_document() {
        let json = r#"{
            "port": 9090,
            "keep-alive": 0,
            "max-retry": -1,
            "dial-deadline": 2.5,
            "chain": [
                {"addr": "10.0.0.1:3128"},
                {"addr": "secure.corp:443", "is-https": true, "insecure-skip": true,
                 "is-get": true, "user": "u", "password": "p", "max-retry": 1},
                {"addr": "ntlm.corp:8080", "is-ntlm": true, "user": "u",
                 "password": "p", "domain": "CORP"}
            ]
        }"#;
        let config: ChainConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port(), Some(9090));
        assert_eq!(config.dial_deadline(), Some(Duration::from_millis(2500)));

        let hops = config.hops().unwrap();
        assert_eq!(hops.len(), 3);

        assert_eq!(hops[0].address, "10.0.0.1:3128");
        assert!(matches!(hops[0].auth, AuthMode::None));
        assert_eq!(hops[0].retry, RetryPolicy::Unbounded);

        assert!(hops[1].use_tls);
        assert!(hops[1].insecure_skip_verify);
        assert!(hops[1].use_get_method);
        assert!(matches!(hops[1].auth, AuthMode::Basic { .. }));
        assert_eq!(hops[1].retry, RetryPolicy::Bounded(1));

        match &hops[2].auth {
            AuthMode::Ntlm { username, domain, .. } => {
                assert_eq!(username, "u");
                assert_eq!(domain, "CORP");
            }
            other => panic!("expected NTLM, got {:?}", other),
        }
    }

    #[test]
    fn test_ntlm_flag_wins_over_basic() {
        let record = HopRecord {
            addr: "p:1".to_string(),
            is_ntlm: true,
            ..Default::default()
        };
        assert!(matches!(record.auth_mode(), AuthMode::Ntlm { .. }));
    }

    #[test]
    fn test_invalid_hop_address_rejected() {
        let config = ChainConfig {
            chain: vec![HopRecord {
                addr: "no-port-here".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let err = config.hops().err().unwrap();
        assert!(matches!(err, ProxyError::Config(_)));
        assert!(err.to_string().contains("chain[0]"));
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let config = ChainConfig {
            timeout: -1.0,
            ..Default::default()
        };
        assert!(config.tcp_dialer().is_err());

        let config = ChainConfig {
            keep_alive: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hop_record_debug_redacts_password() {
        let record = HopRecord {
            addr: "p:1".to_string(),
            user: "alice".to_string(),
            password: "s3cret".to_string(),
            ..Default::default()
        };
        let rendered = format!("{:?}", record);
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn test_example_round_trip() {
        let example = ChainConfig::example();
        let json = serde_json::to_string_pretty(&example).unwrap();
        assert!(json.contains("\"is-ntlm\": true"));
        assert!(json.contains("\"keep-alive\""));

        let parsed: ChainConfig = serde_json::from_str(&json).unwrap();
        let hops = parsed.hops().unwrap();
        assert_eq!(hops.len(), 3);
        assert_eq!(hops[2].retry, RetryPolicy::Unbounded);
        assert_eq!(parsed.port(), Some(9090));
    }
}
