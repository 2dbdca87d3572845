//! NTLM tunnel negotiation.
//!
//! Three request/response round trips on the same connection:
//!
//! 1. **Negotiate** - send the Type 1 message. `407` continues the
//!    handshake; `403` means the hop does not want NTLM for this target, so
//!    the target is re-dialed through the unauthenticated inner dialer.
//! 2. **Challenge** - take the Type 2 message from `Proxy-Authenticate`.
//! 3. **Authenticate** - send the Type 3 message and expect `200`.
//!
//! Any failure drops the connection and returns only the error.

pub mod message;

use crate::dial::{BoxedConn, Dialer, Network};
use crate::error::{ProxyError, Result};
use crate::handshake::{self, TunnelMethod, TunnelRequest, TunnelResponse};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::BufReader;
use tracing::debug;
use zeroize::Zeroizing;

/// Credentials presented to an NTLM hop.
pub struct NtlmCredentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
    /// Empty when no domain is configured.
    pub domain: &'a str,
}

/// One handshake over one connection. Lives for a single dial.
struct Session<'a> {
    reader: BufReader<BoxedConn>,
    method: TunnelMethod,
    target: &'a str,
}

impl Session<'_> {
    async fn round_trip(&mut self, token: &[u8]) -> Result<TunnelResponse> {
        let authorization = Zeroizing::new(format!("NTLM {}", STANDARD.encode(token)));
        let request = TunnelRequest::new(self.method, self.target)
            .with_authorization(Some(authorization.as_str()));
        handshake::write_request(self.reader.get_mut(), &request).await?;
        handshake::read_response(&mut self.reader).await
    }
}

/// Ask the hop on `conn` for a tunnel to `target`, authenticating with NTLM.
///
/// `bypass` is the dialer this hop wraps; it is used to reach `target`
/// directly when the hop answers the negotiate step with `403`.
pub async fn negotiate(
    conn: BoxedConn,
    target: &str,
    credentials: &NtlmCredentials<'_>,
    method: TunnelMethod,
    bypass: &dyn Dialer,
    network: Network,
) -> Result<BoxedConn> {
    let negotiate = message::negotiate_message(credentials.domain)?;
    let mut session = Session {
        reader: BufReader::new(conn),
        method,
        target,
    };

    debug!(phase = "negotiate", target = target, "sending NTLM negotiate message");
    let response = session.round_trip(&negotiate).await?;
    handshake::drain_body(&mut session.reader, &response, method).await?;

    match response.status {
        407 => {}
        403 => {
            debug!(
                phase = "negotiate",
                target = target,
                "proxy does not require NTLM for target, dialing without authentication"
            );
            drop(session);
            return bypass.dial(network, target).await;
        }
        status => {
            debug!(phase = "negotiate", status = status, "unexpected status from proxy");
            return Err(response.into_rejection());
        }
    }

    let challenge = extract_challenge(&response).ok_or(ProxyError::NoNtlmChallenge)?;
    debug!(phase = "challenge", target = target, "received NTLM challenge");
    let challenge = STANDARD.decode(challenge)?;

    debug!(
        phase = "authenticate",
        username = credentials.username,
        password_len = credentials.password.len(),
        "processing NTLM challenge"
    );
    let authenticate = message::process_challenge(
        &challenge,
        credentials.username,
        credentials.password,
        !credentials.domain.is_empty(),
    )?;

    let response = session.round_trip(&authenticate).await?;
    if response.status != 200 {
        debug!(phase = "authenticate", status = response.status, "NTLM authentication rejected");
        return Err(response.into_rejection());
    }

    debug!(target = target, "NTLM tunnel established");
    Ok(Box::new(session.reader))
}

/// Base64 payload of the first `Proxy-Authenticate: NTLM <payload>` header.
fn extract_challenge(response: &TunnelResponse) -> Option<&str> {
    response
        .header_values("Proxy-Authenticate")
        .find_map(|value| {
            let mut tokens = value.split_whitespace();
            let scheme = tokens.next()?;
            let payload = tokens.next()?;
            scheme.eq_ignore_ascii_case("NTLM").then_some(payload)
        })
}
