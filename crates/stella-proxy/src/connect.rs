//! HTTP CONNECT tunnel handler.
//!
//! Handles `CONNECT host:port HTTP/1.1` requests by:
//! 1. Dialing `host:port` through the configured chain
//! 2. Returning `200 Connection Established`
//! 3. Relaying bytes bidirectionally
//!
//! The proxy never terminates the client's TLS; it only passes bytes through.

use crate::audit;
use crate::dial::{join_host_port, BoxedConn, Dialer, Network};
use crate::error::{ProxyError, Result};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Handle an HTTP CONNECT request.
///
/// `first_line` is the already-read request line. `buffered` holds any bytes
/// the client sent after its headers, which are forwarded once the tunnel is up.
pub async fn handle_connect(
    first_line: &str,
    stream: &mut TcpStream,
    buffered: &[u8],
    dialer: &dyn Dialer,
    deadline: Option<Duration>,
) -> Result<()> {
    let (host, port) = match parse_connect_target(first_line) {
        Ok(target) => target,
        Err(e) => {
            debug!("Rejecting CONNECT request: {}", first_line);
            send_response(stream, 400, "Bad Request").await?;
            return Err(e);
        }
    };
    debug!("CONNECT request to {}:{}", host, port);

    let target = join_host_port(&host, port);
    let mut upstream = match dial_upstream(dialer, &target, deadline).await {
        Ok(conn) => conn,
        Err(e) => {
            let (status, reason) = gateway_status(&e);
            audit::log_failed(audit::ProxyMode::Connect, &host, port, status, &e.to_string());
            send_response(stream, status, reason).await?;
            return Err(e);
        }
    };

    send_response(stream, 200, "Connection Established").await?;
    audit::log_established(audit::ProxyMode::Connect, &host, port, "CONNECT");

    if !buffered.is_empty() {
        upstream.write_all(buffered).await?;
    }
    let result = tokio::io::copy_bidirectional(stream, &mut upstream).await;
    debug!("CONNECT tunnel closed for {}:{}: {:?}", host, port, result);
    if let Ok((sent, received)) = result {
        audit::log_closed(audit::ProxyMode::Connect, &host, port, sent, received);
    }

    Ok(())
}

/// Dial `target` through the chain, bounded by `deadline` when set.
pub(crate) async fn dial_upstream(
    dialer: &dyn Dialer,
    target: &str,
    deadline: Option<Duration>,
) -> Result<BoxedConn> {
    let dial = dialer.dial(Network::Tcp, target);
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, dial)
            .await
            .unwrap_or_else(|_| {
                Err(ProxyError::Dial {
                    addr: target.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "dial deadline exceeded",
                    ),
                })
            }),
        None => dial.await,
    }
}

/// Status reported to the client when the chain cannot be dialed.
pub(crate) fn gateway_status(err: &ProxyError) -> (u16, &'static str) {
    match err {
        ProxyError::Dial { source, .. } if source.kind() == std::io::ErrorKind::TimedOut => {
            (504, "Gateway Timeout")
        }
        _ => (502, "Bad Gateway"),
    }
}

/// Parse the target host and port from a CONNECT request line.
///
/// Expected format: "CONNECT host:port HTTP/1.1". The port defaults to 443.
fn parse_connect_target(line: &str) -> Result<(String, u16)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 2 || parts[0] != "CONNECT" {
        return Err(ProxyError::HttpParse(format!(
            "malformed CONNECT line: {}",
            line
        )));
    }

    let authority = parts[1];
    let (host, port) = match authority.rsplit_once(':') {
        // A bare IPv6 literal has colons but no port.
        Some((host, port_str)) if !host.ends_with(':') && !authority.ends_with(']') => {
            let port = port_str.parse::<u16>().map_err(|_| {
                ProxyError::HttpParse(format!("invalid port in CONNECT: {}", authority))
            })?;
            (host, port)
        }
        _ => (authority, 443),
    };
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(ProxyError::HttpParse(format!(
            "missing host in CONNECT: {}",
            authority
        )));
    }
    Ok((host.to_string(), port))
}

/// Send an HTTP response line to the client.
pub(crate) async fn send_response(stream: &mut TcpStream, status: u16, reason: &str) -> Result<()> {
    let response = format!("HTTP/1.1 {} {}\r\n\r\n", status, reason);
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
