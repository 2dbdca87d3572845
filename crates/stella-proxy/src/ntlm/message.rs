//! NTLMSSP message codec (negotiate, challenge, authenticate).
//!
//! Produces the Type 1 negotiate message and answers a server's Type 2
//! challenge with an NTLMv2 Type 3 authenticate message. LM/NTLMv1 and
//! session key exchange are not supported.

use crate::error::{ProxyError, Result};
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacMd5 = Hmac<Md5>;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_MESSAGE: u32 = 1;
const CHALLENGE_MESSAGE: u32 = 2;
const AUTHENTICATE_MESSAGE: u32 = 3;

pub const NEGOTIATE_UNICODE: u32 = 1 << 0;
pub const REQUEST_TARGET: u32 = 1 << 2;
pub const NEGOTIATE_LM_KEY: u32 = 1 << 7;
pub const NEGOTIATE_NTLM: u32 = 1 << 9;
pub const NEGOTIATE_OEM_DOMAIN_SUPPLIED: u32 = 1 << 12;
pub const NEGOTIATE_EXTENDED_SESSION_SECURITY: u32 = 1 << 19;
pub const NEGOTIATE_TARGET_INFO: u32 = 1 << 23;
pub const NEGOTIATE_VERSION: u32 = 1 << 25;
pub const NEGOTIATE_128: u32 = 1 << 29;
pub const NEGOTIATE_KEY_EXCH: u32 = 1 << 30;
pub const NEGOTIATE_56: u32 = 1 << 31;

const DEFAULT_FLAGS: u32 = NEGOTIATE_UNICODE
    | REQUEST_TARGET
    | NEGOTIATE_NTLM
    | NEGOTIATE_EXTENDED_SESSION_SECURITY
    | NEGOTIATE_TARGET_INFO
    | NEGOTIATE_VERSION
    | NEGOTIATE_128
    | NEGOTIATE_56;

/// Windows 7 SP1 (6.1.7601), NTLM revision 15.
const VERSION: [u8; 8] = [6, 1, 0xb1, 0x1d, 0, 0, 0, 15];

const NEGOTIATE_HEADER_LEN: usize = 40;
const CHALLENGE_MIN_LEN: usize = 48;
const AUTHENTICATE_HEADER_LEN: usize = 64;

const MSV_AV_EOL: u16 = 0;
const MSV_AV_TIMESTAMP: u16 = 7;

/// 100ns intervals between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_OFFSET: u64 = 116_444_736_000_000_000;

/// Build the Type 1 negotiate message, announcing `domain` when non-empty.
pub fn negotiate_message(domain: &str) -> Result<Vec<u8>> {
    let mut flags = DEFAULT_FLAGS;
    if !domain.is_empty() {
        flags |= NEGOTIATE_OEM_DOMAIN_SUPPLIED;
    }

    let mut msg = Vec::with_capacity(NEGOTIATE_HEADER_LEN + domain.len());
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&NEGOTIATE_MESSAGE.to_le_bytes());
    msg.extend_from_slice(&flags.to_le_bytes());
    let mut offset = NEGOTIATE_HEADER_LEN;
    put_field(&mut msg, domain.len(), &mut offset)?;
    put_field(&mut msg, 0, &mut offset)?;
    msg.extend_from_slice(&VERSION);
    msg.extend_from_slice(domain.as_bytes());
    Ok(msg)
}

/// Answer a Type 2 challenge with a Type 3 authenticate message.
///
/// When `has_domain` is false the server's target name is not used as the
/// authentication domain.
pub fn process_challenge(
    challenge: &[u8],
    username: &str,
    password: &str,
    has_domain: bool,
) -> Result<Vec<u8>> {
    let challenge = ChallengeMessage::parse(challenge)?;
    let mut client_challenge = [0u8; 8];
    getrandom::fill(&mut client_challenge)
        .map_err(|e| ProxyError::Ntlm(format!("RNG failure: {}", e)))?;
    let timestamp = challenge.timestamp.unwrap_or_else(current_filetime);
    authenticate_message(
        &challenge,
        username,
        password,
        has_domain,
        &client_challenge,
        &timestamp,
    )
}

/// A parsed Type 2 challenge.
#[derive(Debug, Clone)]
pub struct ChallengeMessage {
    pub flags: u32,
    pub server_challenge: [u8; 8],
    pub target_name: String,
    /// Raw target-info AV pairs, echoed back inside the NTLMv2 response.
    pub target_info: Option<Vec<u8>>,
    pub timestamp: Option<[u8; 8]>,
}

impl ChallengeMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < CHALLENGE_MIN_LEN {
            return Err(ProxyError::Ntlm(format!(
                "challenge message too short ({} bytes)",
                data.len()
            )));
        }
        if &data[..8] != SIGNATURE {
            return Err(ProxyError::Ntlm("invalid NTLMSSP signature".to_string()));
        }
        let message_type = read_u32(data, 8);
        if message_type != CHALLENGE_MESSAGE {
            return Err(ProxyError::Ntlm(format!(
                "expected challenge message, got type {}",
                message_type
            )));
        }

        let flags = read_u32(data, 20);
        let mut server_challenge = [0u8; 8];
        server_challenge.copy_from_slice(&data[24..32]);

        let raw_name = read_field(data, 12)?;
        let target_name = if flags & NEGOTIATE_UNICODE != 0 {
            from_unicode(raw_name)?
        } else {
            String::from_utf8_lossy(raw_name).into_owned()
        };

        let raw_info = read_field(data, 40)?;
        let (target_info, timestamp) = if raw_info.is_empty() {
            (None, None)
        } else {
            (Some(raw_info.to_vec()), find_timestamp(raw_info)?)
        };

        Ok(Self {
            flags,
            server_challenge,
            target_name,
            target_info,
            timestamp,
        })
    }
}

/// Build the Type 3 message from explicit nonce and timestamp.
pub fn authenticate_message(
    challenge: &ChallengeMessage,
    username: &str,
    password: &str,
    has_domain: bool,
    client_challenge: &[u8; 8],
    timestamp: &[u8; 8],
) -> Result<Vec<u8>> {
    if username.is_empty() && password.is_empty() {
        return Err(ProxyError::Ntlm(
            "anonymous authentication not supported".to_string(),
        ));
    }
    if challenge.flags & NEGOTIATE_LM_KEY != 0 {
        return Err(ProxyError::Ntlm(
            "only NTLMv2 is supported, but server requested v1 (NTLMSSP_NEGOTIATE_LM_KEY)"
                .to_string(),
        ));
    }
    if challenge.flags & NEGOTIATE_KEY_EXCH != 0 {
        return Err(ProxyError::Ntlm(
            "key exchange requested but not supported (NTLMSSP_NEGOTIATE_KEY_EXCH)".to_string(),
        ));
    }
    if challenge.flags & NEGOTIATE_UNICODE == 0 {
        return Err(ProxyError::Ntlm(
            "server does not support unicode NTLM messages".to_string(),
        ));
    }

    let domain = if has_domain {
        challenge.target_name.as_str()
    } else {
        ""
    };
    let hash = ntlm_v2_hash(password, username, domain)?;
    let nt_response = nt_v2_response(
        &hash,
        &challenge.server_challenge,
        client_challenge,
        timestamp,
        challenge.target_info.as_deref().unwrap_or_default(),
    )?;
    let lm_response = if challenge.target_info.is_none() {
        lm_v2_response(&hash, &challenge.server_challenge, client_challenge)?
    } else {
        Vec::new()
    };

    let target_name = to_unicode(domain);
    let user_name = to_unicode(username);
    let workstation: Vec<u8> = Vec::new();
    let flags = challenge.flags & !NEGOTIATE_VERSION;

    let mut msg = Vec::with_capacity(
        AUTHENTICATE_HEADER_LEN
            + lm_response.len()
            + nt_response.len()
            + target_name.len()
            + user_name.len(),
    );
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&AUTHENTICATE_MESSAGE.to_le_bytes());
    let mut offset = AUTHENTICATE_HEADER_LEN;
    put_field(&mut msg, lm_response.len(), &mut offset)?;
    put_field(&mut msg, nt_response.len(), &mut offset)?;
    put_field(&mut msg, target_name.len(), &mut offset)?;
    put_field(&mut msg, user_name.len(), &mut offset)?;
    put_field(&mut msg, workstation.len(), &mut offset)?;
    // Encrypted random session key: absent.
    msg.extend_from_slice(&[0u8; 8]);
    msg.extend_from_slice(&flags.to_le_bytes());
    msg.extend_from_slice(&lm_response);
    msg.extend_from_slice(&nt_response);
    msg.extend_from_slice(&target_name);
    msg.extend_from_slice(&user_name);
    msg.extend_from_slice(&workstation);
    Ok(msg)
}

/// NTOWFv1: MD4 of the UTF-16LE password.
fn nt_hash(password: &str) -> [u8; 16] {
    Md4::digest(to_unicode(password)).into()
}

/// NTOWFv2: HMAC-MD5 keyed by NTOWFv1 over UPPER(user) || domain.
fn ntlm_v2_hash(password: &str, username: &str, domain: &str) -> Result<[u8; 16]> {
    let identity = to_unicode(&format!("{}{}", username.to_uppercase(), domain));
    hmac_md5(&nt_hash(password), &[&identity])
}

fn nt_v2_response(
    hash: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
    timestamp: &[u8; 8],
    target_info: &[u8],
) -> Result<Vec<u8>> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[1, 1, 0, 0, 0, 0, 0, 0]);
    blob.extend_from_slice(timestamp);
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0, 0, 0, 0]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0, 0, 0, 0]);

    let proof = hmac_md5(hash, &[server_challenge, &blob])?;
    let mut response = proof.to_vec();
    response.extend_from_slice(&blob);
    Ok(response)
}

fn lm_v2_response(
    hash: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
) -> Result<Vec<u8>> {
    let proof = hmac_md5(hash, &[server_challenge, client_challenge])?;
    let mut response = proof.to_vec();
    response.extend_from_slice(client_challenge);
    Ok(response)
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16]> {
    let mut mac = HmacMd5::new_from_slice(key)
        .map_err(|e| ProxyError::Ntlm(format!("HMAC key error: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

fn current_filetime() -> [u8; 8] {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let intervals = u64::try_from(since_unix.as_nanos() / 100).unwrap_or(u64::MAX);
    intervals.saturating_add(FILETIME_UNIX_OFFSET).to_le_bytes()
}

fn find_timestamp(target_info: &[u8]) -> Result<Option<[u8; 8]>> {
    let mut pos = 0;
    while pos + 4 <= target_info.len() {
        let id = read_u16(target_info, pos);
        let len = usize::from(read_u16(target_info, pos + 2));
        pos += 4;
        if id == MSV_AV_EOL {
            break;
        }
        let value = target_info
            .get(pos..pos + len)
            .ok_or_else(|| ProxyError::Ntlm("truncated target info".to_string()))?;
        if id == MSV_AV_TIMESTAMP && len == 8 {
            let mut timestamp = [0u8; 8];
            timestamp.copy_from_slice(value);
            return Ok(Some(timestamp));
        }
        pos += len;
    }
    Ok(None)
}

fn to_unicode(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn from_unicode(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(ProxyError::Ntlm(
            "odd-length unicode string in challenge".to_string(),
        ));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units)
        .map_err(|_| ProxyError::Ntlm("invalid unicode string in challenge".to_string()))
}

/// Append a security buffer descriptor (len, max len, offset).
fn put_field(msg: &mut Vec<u8>, len: usize, offset: &mut usize) -> Result<()> {
    let len16 = u16::try_from(len)
        .map_err(|_| ProxyError::Ntlm(format!("NTLM field too long ({} bytes)", len)))?;
    let offset32 = u32::try_from(*offset)
        .map_err(|_| ProxyError::Ntlm("NTLM message too long".to_string()))?;
    msg.extend_from_slice(&len16.to_le_bytes());
    msg.extend_from_slice(&len16.to_le_bytes());
    msg.extend_from_slice(&offset32.to_le_bytes());
    *offset += len;
    Ok(())
}

/// Resolve a security buffer descriptor at `at` into its payload slice.
fn read_field(data: &[u8], at: usize) -> Result<&[u8]> {
    let len = usize::from(read_u16(data, at));
    let offset = read_u32(data, at + 4) as usize;
    if len == 0 {
        return Ok(&[]);
    }
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| ProxyError::Ntlm("challenge field out of range".to_string()))
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}
