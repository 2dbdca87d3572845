//! Single round-trip tunnel negotiation (Basic or no authentication).
//!
//! Sends one CONNECT (or GET) for the target and expects `200`. On any other
//! outcome the connection is dropped here and only the error is returned.

use crate::dial::BoxedConn;
use crate::error::Result;
use crate::handshake::{self, TunnelMethod, TunnelRequest};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::BufReader;
use tracing::debug;
use zeroize::Zeroizing;

/// `Proxy-Authorization` value for Basic credentials.
#[must_use]
pub fn basic_authorization(username: &str, password: &str) -> Zeroizing<String> {
    let pair = Zeroizing::new(format!("{}:{}", username, password));
    Zeroizing::new(format!("Basic {}", STANDARD.encode(pair.as_bytes())))
}

/// Ask the hop on `conn` for a tunnel to `target`.
///
/// `authorization` is the full header value, or `None` to omit the header.
/// The returned connection keeps the handshake reader so bytes the hop sent
/// right after its response are not lost.
pub async fn negotiate(
    conn: BoxedConn,
    target: &str,
    authorization: Option<&str>,
    method: TunnelMethod,
) -> Result<BoxedConn> {
    let mut reader = BufReader::new(conn);
    let request = TunnelRequest::new(method, target).with_authorization(authorization);

    debug!(target = target, method = %method, "sending tunnel request to proxy");
    handshake::write_request(reader.get_mut(), &request).await?;

    let response = handshake::read_response(&mut reader).await?;
    if response.status != 200 {
        debug!(
            target = target,
            status = response.status,
            "proxy refused tunnel request"
        );
        return Err(response.into_rejection());
    }

    debug!(target = target, "tunnel established");
    Ok(Box::new(reader))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use crate::testutil::{header_value, read_head};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_basic_authorization_value() {
        assert_eq!(basic_authorization("user", "pass").as_str(), "Basic dXNlcjpwYXNz");
        assert_eq!(basic_authorization("", "").as_str(), "Basic Og==");
    }

    #[tokio::test]
    async fn test_negotiate_success_returns_tunnel() {
        let (client, mut proxy) = tokio::io::duplex(4096);
        let proxy_task = tokio::spawn(async move {
            let head = read_head(&mut proxy).await;
            proxy
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            let mut buf = [0u8; 4];
            proxy.read_exact(&mut buf).await.unwrap();
            proxy.write_all(b"pong").await.unwrap();
            (head, buf)
        });

        let auth = basic_authorization("user", "pass");
        let mut tunnel = negotiate(
            Box::new(client),
            "example.com:443",
            Some(auth.as_str()),
            TunnelMethod::Connect,
        )
        .await
        .unwrap();

        tunnel.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        tunnel.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        let (head, received) = proxy_task.await.unwrap();
        assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert_eq!(header_value(&head, "Host"), Some("example.com:443"));
        assert_eq!(
            header_value(&head, "Proxy-Authorization"),
            Some("Basic dXNlcjpwYXNz")
        );
        assert_eq!(header_value(&head, "Proxy-Connection"), Some("Keep-Alive"));
        assert_eq!(&received, b"ping");
    }

    #[tokio::test]
    async fn test_negotiate_407_fails_with_status_text() {
        let (client, mut proxy) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            read_head(&mut proxy).await;
            proxy
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let auth = basic_authorization("user", "wrong");
        let err = negotiate(
            Box::new(client),
            "example.com:443",
            Some(auth.as_str()),
            TunnelMethod::Connect,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ProxyError::Rejected { status: 407, .. }));
        assert_eq!(err.to_string(), "Proxy Authentication Required");
    }

    #[tokio::test]
    async fn test_negotiate_without_credentials_omits_header() {
        let (client, mut proxy) = tokio::io::duplex(4096);
        let proxy_task = tokio::spawn(async move {
            let head = read_head(&mut proxy).await;
            proxy.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            head
        });

        negotiate(Box::new(client), "10.1.2.3:8080", None, TunnelMethod::Get)
            .await
            .unwrap();
        let head = proxy_task.await.unwrap();
        assert!(head.starts_with("GET 10.1.2.3:8080 HTTP/1.1\r\n"));
        assert!(header_value(&head, "Proxy-Authorization").is_none());
    }

    #[tokio::test]
    async fn test_negotiate_hop_closes_early() {
        let (client, mut proxy) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            read_head(&mut proxy).await;
            drop(proxy);
        });

        let result = negotiate(Box::new(client), "example.com:443", None, TunnelMethod::Connect).await;
        assert!(matches!(result, Err(ProxyError::Io(_))));
    }
}
