//! Absolute-form HTTP forwarding.
//!
//! Plain-HTTP proxy requests (`GET http://host/path HTTP/1.1`) are sent over
//! a fresh tunnel through the chain. The request line is rewritten to origin
//! form and proxy-only headers are dropped; the connection is closed after
//! one exchange.

use crate::audit;
use crate::connect::{dial_upstream, gateway_status, send_response};
use crate::dial::{join_host_port, Dialer};
use crate::error::{ProxyError, Result};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Headers that only concern the hop between client and this proxy.
const HOP_BY_HOP: &[&str] = &[
    "proxy-connection",
    "proxy-authorization",
    "connection",
    "keep-alive",
];

/// Parsed absolute-form request line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ForwardTarget {
    pub method: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub version: String,
}

impl ForwardTarget {
    fn authority(&self) -> String {
        let host = join_host_port(&self.host, self.port);
        if self.port == 80 {
            host.trim_end_matches(":80").to_string()
        } else {
            host
        }
    }
}

/// Whether `first_line` is an absolute-form `http://` request.
pub(crate) fn is_absolute_form(first_line: &str) -> bool {
    first_line
        .split_whitespace()
        .nth(1)
        .and_then(|uri| uri.get(..7))
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http://"))
}

/// Parse `METHOD http://host[:port]/path HTTP/1.x`.
pub(crate) fn parse_forward_target(line: &str) -> Result<ForwardTarget> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 || !parts[2].starts_with("HTTP/1.") {
        return Err(ProxyError::HttpParse(format!(
            "malformed request line: {}",
            line
        )));
    }

    let uri: http::Uri = parts[1]
        .parse()
        .map_err(|e| ProxyError::HttpParse(format!("invalid request URI {}: {}", parts[1], e)))?;
    if uri.scheme() != Some(&http::uri::Scheme::HTTP) {
        return Err(ProxyError::HttpParse(format!(
            "unsupported scheme in request URI: {}",
            parts[1]
        )));
    }
    let authority = uri
        .authority()
        .ok_or_else(|| ProxyError::HttpParse(format!("missing host in {}", parts[1])))?;
    let host = authority.host();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    Ok(ForwardTarget {
        method: parts[0].to_string(),
        host: host.to_string(),
        port: authority.port_u16().unwrap_or(80),
        path: uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        version: parts[2].to_string(),
    })
}

/// Build the origin-form request head sent to the destination.
fn rewrite_head(target: &ForwardTarget, header_bytes: &[u8]) -> String {
    let mut head = format!("{} {} {}\r\n", target.method, target.path, target.version);
    let mut has_host = false;
    for line in String::from_utf8_lossy(header_bytes).split("\r\n") {
        let Some((name, _)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        has_host |= name == "host";
        head.push_str(line);
        head.push_str("\r\n");
    }
    if !has_host {
        head.push_str(&format!("Host: {}\r\n", target.authority()));
    }
    head.push_str("Connection: close\r\n\r\n");
    head
}

/// Forward one absolute-form request through the chain.
pub async fn handle_forward(
    first_line: &str,
    stream: &mut TcpStream,
    header_bytes: &[u8],
    buffered: &[u8],
    dialer: &dyn Dialer,
    deadline: Option<Duration>,
) -> Result<()> {
    let target = parse_forward_target(first_line)?;
    debug!("Forwarding {} to {}:{}", target.method, target.host, target.port);

    let addr = join_host_port(&target.host, target.port);
    let mut upstream = match dial_upstream(dialer, &addr, deadline).await {
        Ok(conn) => conn,
        Err(e) => {
            let (status, reason) = gateway_status(&e);
            audit::log_failed(
                audit::ProxyMode::Forward,
                &target.host,
                target.port,
                status,
                &e.to_string(),
            );
            send_response(stream, status, reason).await?;
            return Err(e);
        }
    };
    audit::log_established(
        audit::ProxyMode::Forward,
        &target.host,
        target.port,
        &target.method,
    );

    upstream
        .write_all(rewrite_head(&target, header_bytes).as_bytes())
        .await?;
    if !buffered.is_empty() {
        upstream.write_all(buffered).await?;
    }
    upstream.flush().await?;

    let result = tokio::io::copy_bidirectional(stream, &mut upstream).await;
    debug!("Forward connection closed for {}: {:?}", addr, result);
    if let Ok((sent, received)) = result {
        audit::log_closed(audit::ProxyMode::Forward, &target.host, target.port, sent, received);
    }
    Ok(())
}
