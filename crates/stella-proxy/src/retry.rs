//! Retry policy for reaching a proxy hop.
//!
//! Only a failed network dial ([`ProxyError::Dial`]) is retried. When the
//! inner dialer is itself a hop, any other error it reports (a 407 from that
//! hop, say) is returned at once. Retries are immediate (no backoff); an
//! unbounded policy keeps going until the dial succeeds or the caller drops
//! the future, so callers using [`RetryPolicy::Unbounded`] must bound the
//! dial with a deadline of their own.

use crate::dial::{BoxedConn, Dialer, Network};
use crate::error::{ProxyError, Result};
use tracing::{debug, warn};

/// How many additional dial attempts a hop may make after the first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Stop after this many retries beyond the initial attempt.
    Bounded(u32),
    /// Retry until success or cancellation.
    Unbounded,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Bounded(3)
    }
}

impl RetryPolicy {
    /// Map a signed retry budget (negative = unbounded) onto a policy.
    #[must_use]
    pub fn from_max_retry(max_retry: i64) -> Self {
        if max_retry < 0 {
            RetryPolicy::Unbounded
        } else {
            RetryPolicy::Bounded(u32::try_from(max_retry).unwrap_or(u32::MAX))
        }
    }

    /// Whether another attempt is allowed after `attempts` failed ones.
    #[must_use]
    pub fn allows_another(&self, attempts: u64) -> bool {
        match self {
            RetryPolicy::Bounded(retries) => attempts <= u64::from(*retries),
            RetryPolicy::Unbounded => true,
        }
    }
}

/// Dial `addr` through `dialer`, retrying failures as `policy` allows.
///
/// Returns the first successful connection, the first error that is not a
/// dial failure, or the error of the last attempt.
pub async fn dial_with_retry(
    dialer: &dyn Dialer,
    network: Network,
    addr: &str,
    policy: RetryPolicy,
) -> Result<BoxedConn> {
    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        debug!(addr = addr, attempt = attempts, "dialing proxy hop");
        match dialer.dial(network, addr).await {
            Ok(conn) => return Ok(conn),
            Err(e @ ProxyError::Dial { .. }) if policy.allows_another(attempts) => {
                warn!(addr = addr, attempt = attempts, "dial to proxy hop failed, retrying: {}", e);
                // A dialer that fails without suspending would otherwise never
                // give the runtime a chance to cancel this loop.
                tokio::task::yield_now().await;
            }
            Err(e) => {
                warn!(addr = addr, attempts = attempts, "dial to proxy hop failed: {}", e);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testutil::{FailingDialer, ScriptedDialer};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Dialer whose every attempt is refused by the far proxy.
    struct RejectingDialer {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for RejectingDialer {
        async fn dial(&self, _network: Network, _addr: &str) -> Result<BoxedConn> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ProxyError::Rejected {
                status: 407,
                reason: "Proxy Authentication Required".to_string(),
            })
        }
    }

    #[test]
    fn test_from_max_retry() {
        assert_eq!(RetryPolicy::from_max_retry(-1), RetryPolicy::Unbounded);
        assert_eq!(RetryPolicy::from_max_retry(0), RetryPolicy::Bounded(0));
        assert_eq!(RetryPolicy::from_max_retry(3), RetryPolicy::Bounded(3));
        assert_eq!(
            RetryPolicy::from_max_retry(i64::MAX),
            RetryPolicy::Bounded(u32::MAX)
        );
    }

    #[test]
    fn test_allows_another() {
        let policy = RetryPolicy::Bounded(2);
        assert!(policy.allows_another(1));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
        assert!(!RetryPolicy::Bounded(0).allows_another(1));
        assert!(RetryPolicy::Unbounded.allows_another(u64::MAX));
    }

    #[tokio::test]
    async fn test_bounded_retry_attempt_count() {
        let dialer = FailingDialer::new();
        let err = dial_with_retry(&dialer, Network::Tcp, "proxy:3128", RetryPolicy::Bounded(2))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::Dial { .. }));
        assert_eq!(dialer.attempts(), 3);
    }

    #[tokio::test]
    async fn test_no_retry() {
        let dialer = FailingDialer::new();
        let result =
            dial_with_retry(&dialer, Network::Tcp, "proxy:3128", RetryPolicy::Bounded(0)).await;
        assert!(result.is_err());
        assert_eq!(dialer.attempts(), 1);
    }

    #[tokio::test]
    async fn test_unbounded_retry_until_cancelled() {
        let dialer = FailingDialer::new();
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            dial_with_retry(&dialer, Network::Tcp, "proxy:3128", RetryPolicy::Unbounded),
        )
        .await;
        assert!(result.is_err(), "unbounded retry must run until cancelled");
        assert!(dialer.attempts() > 3);
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let dialer = FailingDialer::succeeding_after(2);
        let result =
            dial_with_retry(&dialer, Network::Tcp, "proxy:3128", RetryPolicy::Bounded(5)).await;
        assert!(result.is_ok());
        assert_eq!(dialer.attempts(), 3);
    }

    #[tokio::test]
    async fn test_success_dials_hop_address_once() {
        let (dialer, _peers) = ScriptedDialer::new();
        dial_with_retry(dialer.as_ref(), Network::Tcp, "proxy:3128", RetryPolicy::Unbounded)
            .await
            .unwrap();
        assert_eq!(dialer.dialed(), vec!["proxy:3128".to_string()]);
    }

    #[tokio::test]
    async fn test_non_dial_errors_are_not_retried() {
        let dialer = RejectingDialer {
            attempts: AtomicUsize::new(0),
        };
        let err = dial_with_retry(&dialer, Network::Tcp, "proxy:3128", RetryPolicy::Unbounded)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::Rejected { status: 407, .. }));
        assert_eq!(dialer.attempts.load(Ordering::SeqCst), 1);
    }
}
