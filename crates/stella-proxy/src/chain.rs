//! Chain composition.
//!
//! Hops are folded over the base dialer in configuration order, so the first
//! hop is the innermost layer (reached straight over the network) and the
//! last hop is the one callers invoke with the final destination.

use crate::dial::Dialer;
use crate::hop::{HopConfig, HopDialer};
use std::sync::Arc;

/// Build one dialer that tunnels through every hop in `hops`.
///
/// An empty chain returns `base` itself. Composition never fails; every
/// error surfaces when the returned dialer is used.
#[must_use]
pub fn compose(base: Arc<dyn Dialer>, hops: &[HopConfig]) -> Arc<dyn Dialer> {
    hops.iter().fold(base, |inner, hop| {
        Arc::new(HopDialer::new(inner, hop.clone())) as Arc<dyn Dialer>
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dial::Network;
    use crate::error::ProxyError;
    use crate::hop::AuthMode;
    use crate::retry::RetryPolicy;
    use crate::testutil::{header_value, read_head, ScriptedDialer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use zeroize::Zeroizing;

    #[test]
    fn test_empty_chain_is_base() {
        let (base, _peers) = ScriptedDialer::new();
        let base: Arc<dyn Dialer> = base;
        let composed = compose(Arc::clone(&base), &[]);
        assert!(Arc::ptr_eq(&base, &composed));
    }

    #[tokio::test]
    async fn test_empty_chain_dials_target_directly() {
        let (base, _peers) = ScriptedDialer::new();
        let composed = compose(base.clone(), &[]);
        composed.dial(Network::Tcp, "example.com:80").await.unwrap();
        assert_eq!(base.dialed(), vec!["example.com:80".to_string()]);
    }

    #[tokio::test]
    async fn test_two_hop_ordering() {
        let (base, mut peers) = ScriptedDialer::new();
        let hops = vec![
            HopConfig::new("a.proxy:3128"),
            HopConfig::new("b.proxy:8080").with_auth(AuthMode::Basic {
                username: "user".to_string(),
                password: Zeroizing::new("pass".to_string()),
            }),
        ];
        let chain = compose(base.clone(), &hops);

        // The only raw connection is to A. Over it come A's CONNECT (toward
        // B) and then, through the tunnel, B's CONNECT (toward the target).
        let proxy_task = tokio::spawn(async move {
            let mut wire = peers.recv().await.unwrap();
            let to_a = read_head(&mut wire).await;
            wire.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            let to_b = read_head(&mut wire).await;
            wire.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            let mut payload = [0u8; 5];
            wire.read_exact(&mut payload).await.unwrap();
            (to_a, to_b, payload)
        });

        let mut conn = chain.dial(Network::Tcp, "dest.example:443").await.unwrap();
        conn.write_all(b"hello").await.unwrap();

        let (to_a, to_b, payload) = proxy_task.await.unwrap();
        assert_eq!(base.dialed(), vec!["a.proxy:3128".to_string()]);

        assert!(to_a.starts_with("CONNECT b.proxy:8080 HTTP/1.1\r\n"));
        assert!(header_value(&to_a, "Proxy-Authorization").is_none());

        assert!(to_b.starts_with("CONNECT dest.example:443 HTTP/1.1\r\n"));
        assert_eq!(
            header_value(&to_b, "Proxy-Authorization"),
            Some("Basic dXNlcjpwYXNz")
        );
        assert_eq!(&payload, b"hello");
    }

    #[tokio::test]
    async fn test_inner_rejection_stops_chain() {
        let (base, mut peers) = ScriptedDialer::new();
        let hops = vec![HopConfig::new("a.proxy:3128"), HopConfig::new("b.proxy:8080")];
        let chain = compose(base, &hops);

        let proxy_task = tokio::spawn(async move {
            let mut wire = peers.recv().await.unwrap();
            read_head(&mut wire).await;
            wire.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await.unwrap();
            let mut rest = Vec::new();
            wire.read_to_end(&mut rest).await.unwrap();
            rest
        });

        let err = chain
            .dial(Network::Tcp, "dest.example:443")
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "Forbidden");
        // Nothing is sent toward B once A refuses.
        assert!(proxy_task.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outer_retry_does_not_repeat_inner_rejection() {
        let (base, mut peers) = ScriptedDialer::new();
        let hops = vec![
            HopConfig::new("a.proxy:3128"),
            HopConfig::new("b.proxy:8080").with_retry(RetryPolicy::Bounded(2)),
        ];
        let chain = compose(base.clone(), &hops);

        let proxy_task = tokio::spawn(async move {
            let mut wire = peers.recv().await.unwrap();
            read_head(&mut wire).await;
            wire.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let err = chain
            .dial(Network::Tcp, "dest.example:443")
            .await
            .err()
            .unwrap();
        proxy_task.await.unwrap();
        assert!(matches!(err, ProxyError::Rejected { status: 407, .. }));
        assert_eq!(err.to_string(), "Proxy Authentication Required");
        assert_eq!(base.dialed(), vec!["a.proxy:3128".to_string()]);
    }
}
