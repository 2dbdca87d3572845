//! In-memory dialers and scripted proxy peers shared by the unit tests.

#![allow(clippy::unwrap_used)]

use crate::dial::{BoxedConn, Dialer, Network};
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

/// Dialer that hands out in-memory pipes and records every address dialed.
///
/// The far end of each pipe is delivered on the receiver returned by
/// [`ScriptedDialer::new`], so a test can play the part of a proxy.
pub struct ScriptedDialer {
    dialed: Mutex<Vec<String>>,
    peers: mpsc::UnboundedSender<DuplexStream>,
}

impl ScriptedDialer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            dialed: Mutex::new(Vec::new()),
            peers: tx,
        });
        (dialer, rx)
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(&self, _network: Network, addr: &str) -> Result<BoxedConn> {
        self.dialed.lock().unwrap().push(addr.to_string());
        let (client, server) = tokio::io::duplex(64 * 1024);
        // Tests that ignore the peer side simply drop the receiver.
        let _ = self.peers.send(server);
        Ok(Box::new(client))
    }
}

/// Dialer that refuses connections, optionally succeeding after N failures.
pub struct FailingDialer {
    attempts: AtomicUsize,
    failures: usize,
}

impl FailingDialer {
    pub fn new() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            failures: usize::MAX,
        }
    }

    pub fn succeeding_after(failures: usize) -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            failures,
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for FailingDialer {
    async fn dial(&self, _network: Network, addr: &str) -> Result<BoxedConn> {
        let previous = self.attempts.fetch_add(1, Ordering::SeqCst);
        if previous < self.failures {
            return Err(ProxyError::Dial {
                addr: addr.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ),
            });
        }
        let (client, _server) = tokio::io::duplex(1024);
        Ok(Box::new(client))
    }
}

/// Read an HTTP head (request or response) up to and including the blank line.
pub async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = reader.read(&mut byte).await.unwrap();
        assert_eq!(n, 1, "peer closed before end of head: {:?}", String::from_utf8_lossy(&head));
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// Value of the first header called `name` in an HTTP head, if any.
pub fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

/// A well-formed NTLM challenge (type 2) message.
///
/// Target name `DOMAIN`, Unicode + NTLM flags, server challenge
/// `0123456789abcdef`, and (optionally) a target-info block carrying a
/// NetBIOS domain name and a timestamp.
pub fn challenge_message(with_target_info: bool) -> Vec<u8> {
    let target_name: Vec<u8> = "DOMAIN"
        .encode_utf16()
        .flat_map(|u| u.to_le_bytes())
        .collect();

    let mut target_info = Vec::new();
    if with_target_info {
        target_info.extend_from_slice(&2u16.to_le_bytes());
        target_info.extend_from_slice(&(target_name.len() as u16).to_le_bytes());
        target_info.extend_from_slice(&target_name);
        target_info.extend_from_slice(&7u16.to_le_bytes());
        target_info.extend_from_slice(&8u16.to_le_bytes());
        target_info.extend_from_slice(&[0x11; 8]);
        target_info.extend_from_slice(&[0, 0, 0, 0]);
    }

    let flags: u32 = 0x0000_0001 | 0x0000_0200 | 0x0008_0000 | 0x0080_0000 | 0x2000_0000;
    let header_len = 56u32;
    let mut msg = Vec::new();
    msg.extend_from_slice(b"NTLMSSP\0");
    msg.extend_from_slice(&2u32.to_le_bytes());
    msg.extend_from_slice(&(target_name.len() as u16).to_le_bytes());
    msg.extend_from_slice(&(target_name.len() as u16).to_le_bytes());
    msg.extend_from_slice(&header_len.to_le_bytes());
    msg.extend_from_slice(&flags.to_le_bytes());
    msg.extend_from_slice(&[0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef]);
    msg.extend_from_slice(&[0u8; 8]);
    msg.extend_from_slice(&(target_info.len() as u16).to_le_bytes());
    msg.extend_from_slice(&(target_info.len() as u16).to_le_bytes());
    msg.extend_from_slice(&(header_len + target_name.len() as u32).to_le_bytes());
    msg.extend_from_slice(&[6, 1, 0xb1, 0x1d, 0, 0, 0, 15]);
    msg.extend_from_slice(&target_name);
    msg.extend_from_slice(&target_info);
    msg
}

/// TLS acceptor serving a freshly generated self-signed certificate for
/// `localhost`. No public root vouches for it.
pub fn self_signed_acceptor() -> TlsAcceptor {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}
