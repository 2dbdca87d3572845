//! HTTP/1.1 framing for the tunnel handshake with a proxy hop.
//!
//! Only what a CONNECT/GET handshake needs: writing the request head,
//! reading the status line and headers, and draining a response body so the
//! next request on the same socket starts on a clean boundary.

use crate::error::{ProxyError, Result};
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

/// Maximum total size of a response head (64 KiB).
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Verb used to ask a hop for a tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TunnelMethod {
    #[default]
    Connect,
    /// For proxies that only permit `GET` toward the next address.
    Get,
}

impl TunnelMethod {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelMethod::Connect => "CONNECT",
            TunnelMethod::Get => "GET",
        }
    }
}

impl fmt::Display for TunnelMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tunnel request toward `target` (`host:port`), used as both the opaque
/// request target and the `Host` header.
pub struct TunnelRequest<'a> {
    method: TunnelMethod,
    target: &'a str,
    authorization: Option<&'a str>,
}

impl<'a> TunnelRequest<'a> {
    #[must_use]
    pub fn new(method: TunnelMethod, target: &'a str) -> Self {
        Self {
            method,
            target,
            authorization: None,
        }
    }

    /// Attach a full `Proxy-Authorization` value (e.g. `Basic dXNlcjpwYXNz`).
    #[must_use]
    pub fn with_authorization(mut self, authorization: Option<&'a str>) -> Self {
        self.authorization = authorization;
        self
    }

    /// Serialize the request head. Wiped on drop since it may carry credentials.
    #[must_use]
    pub fn to_head(&self) -> Zeroizing<String> {
        let mut head = Zeroizing::new(format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\n",
            self.method, self.target, self.target
        ));
        if let Some(authorization) = self.authorization {
            head.push_str("Proxy-Authorization: ");
            head.push_str(authorization);
            head.push_str("\r\n");
        }
        head.push_str("Proxy-Connection: Keep-Alive\r\n\r\n");
        head
    }
}

/// Write a tunnel request to the hop.
pub async fn write_request<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    request: &TunnelRequest<'_>,
) -> Result<()> {
    let head = request.to_head();
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Status line and headers of a hop's response.
#[derive(Debug, Clone)]
pub struct TunnelResponse {
    pub status: u16,
    /// Reason phrase as sent by the hop.
    pub reason: String,
    headers: Vec<(String, String)>,
}

impl TunnelResponse {
    /// First value of header `name` (case-insensitive).
    #[must_use]
    pub fn header<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.header_values(name).next()
    }

    /// Every value of header `name`, in order received.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Canonical text for the status code, falling back to the hop's reason.
    #[must_use]
    pub fn status_text(&self) -> String {
        http::StatusCode::from_u16(self.status)
            .ok()
            .and_then(|code| code.canonical_reason())
            .map(str::to_string)
            .or_else(|| (!self.reason.is_empty()).then(|| self.reason.clone()))
            .unwrap_or_else(|| format!("status {}", self.status))
    }

    /// Convert an unexpected response into the error reported to callers.
    #[must_use]
    pub fn into_rejection(self) -> ProxyError {
        ProxyError::Rejected {
            status: self.status,
            reason: self.status_text(),
        }
    }

    fn is_chunked(&self) -> bool {
        self.header_values("Transfer-Encoding")
            .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")))
    }

    fn content_length(&self) -> Result<Option<u64>> {
        match self.header("Content-Length") {
            None => Ok(None),
            Some(v) => v
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| ProxyError::HttpParse(format!("invalid Content-Length: {}", v))),
        }
    }
}

/// Read one line, consuming at most `budget` bytes of the head allowance.
async fn read_head_line<R: AsyncBufRead + Unpin + ?Sized>(
    reader: &mut R,
    budget: &mut usize,
) -> Result<String> {
    if *budget == 0 {
        return Err(ProxyError::HttpParse("response head too large".to_string()));
    }
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(*budget as u64)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Err(ProxyError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "proxy closed the connection during handshake",
        )));
    }
    if !buf.ends_with(b"\n") {
        return Err(ProxyError::HttpParse(if n >= *budget {
            "response head too large".to_string()
        } else {
            "truncated response head".to_string()
        }));
    }
    *budget -= n;
    let line = String::from_utf8(buf)
        .map_err(|_| ProxyError::HttpParse("response head is not valid UTF-8".to_string()))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Read a response status line and headers. The body, if any, is left unread.
pub async fn read_response<R: AsyncBufRead + Unpin + ?Sized>(
    reader: &mut R,
) -> Result<TunnelResponse> {
    let mut budget = MAX_HEADER_SIZE;
    let status_line = read_head_line(reader, &mut budget).await?;
    let (status, reason) = parse_status_line(&status_line)?;

    let mut headers = Vec::new();
    loop {
        let line = read_head_line(reader, &mut budget).await?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::HttpParse(format!("malformed header line: {}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(TunnelResponse {
        status,
        reason,
        headers,
    })
}

/// Parse `HTTP/1.x <code> <reason>`.
fn parse_status_line(line: &str) -> Result<(u16, String)> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(ProxyError::HttpParse(format!(
            "malformed HTTP response: {}",
            line
        )));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..1000).contains(code))
        .ok_or_else(|| {
            ProxyError::HttpParse(format!("invalid status code in response: {}", line))
        })?;
    let reason = parts.next().unwrap_or_default().trim().to_string();
    Ok((status, reason))
}

/// Consume the body of `response` so the socket can carry the next request.
///
/// A response without `Content-Length` or chunked framing is treated as
/// bodiless; a successful reply to `CONNECT` never has a body.
pub async fn drain_body<R: AsyncBufRead + Unpin + ?Sized>(
    reader: &mut R,
    response: &TunnelResponse,
    method: TunnelMethod,
) -> Result<()> {
    let bodiless = (method == TunnelMethod::Connect && (200..300).contains(&response.status))
        || (100..200).contains(&response.status)
        || response.status == 204
        || response.status == 304;
    if bodiless {
        return Ok(());
    }

    if response.is_chunked() {
        return drain_chunked(reader).await;
    }
    if let Some(len) = response.content_length()? {
        discard_exact(reader, len).await?;
    }
    Ok(())
}

/// Read one framing line of a chunked body. Each line gets its own allowance.
async fn read_body_line<R: AsyncBufRead + Unpin + ?Sized>(reader: &mut R) -> Result<String> {
    let mut budget = MAX_HEADER_SIZE;
    read_head_line(reader, &mut budget).await
}

async fn drain_chunked<R: AsyncBufRead + Unpin + ?Sized>(reader: &mut R) -> Result<()> {
    loop {
        let line = read_body_line(reader).await?;
        let size_field = line.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(size_field, 16)
            .map_err(|_| ProxyError::HttpParse(format!("invalid chunk size: {}", line)))?;
        if size == 0 {
            // Trailer section ends with an empty line.
            while !read_body_line(reader).await?.is_empty() {}
            return Ok(());
        }
        discard_exact(reader, size).await?;
        if !read_body_line(reader).await?.is_empty() {
            return Err(ProxyError::HttpParse(
                "missing CRLF after chunk data".to_string(),
            ));
        }
    }
}

async fn discard_exact<R: AsyncBufRead + Unpin + ?Sized>(reader: &mut R, len: u64) -> Result<()> {
    let copied = tokio::io::copy(&mut (&mut *reader).take(len), &mut tokio::io::sink()).await?;
    if copied != len {
        return Err(ProxyError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "proxy closed the connection inside a response body",
        )));
    }
    Ok(())
}
