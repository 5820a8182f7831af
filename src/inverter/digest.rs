//! HTTP digest authentication against GEN24 firmware.
//!
//! The firmware deviates from RFC 7616 in two ways that rule out stock
//! clients: the challenge may arrive in an `X-WWW-Authenticate` header with
//! arbitrary capitalization, and newer firmware advertises the non-standard
//! algorithm token `SHA256`. In that case the hash is SHA-256 but the
//! `algorithm=` field of the authorization header must echo `SHA256` back
//! verbatim or the inverter rejects the response.

use md5::Md5;
use rand::Rng;
use reqwest::header::HeaderMap;
use sha2::{Digest, Sha256};

/// Parsed `WWW-Authenticate: Digest ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: String,
    /// Advertised algorithm token, echoed back verbatim.
    pub algorithm: String,
}

/// Finds the challenge value regardless of the header name the firmware
/// chose. `HeaderMap` lookups are already case-insensitive, so the two
/// spellings cover every observed variant.
pub fn challenge_from_headers(headers: &HeaderMap) -> Option<&str> {
    for name in ["x-www-authenticate", "www-authenticate"] {
        if let Some(value) = headers.get(name) {
            return value.to_str().ok();
        }
    }
    None
}

/// Parses the challenge parameters, preserving spaces inside quoted values
/// (the GEN24 realm is `Webinterface area`).
pub fn parse_challenge(header: &str) -> Option<DigestChallenge> {
    let content = header.trim().strip_prefix("Digest").unwrap_or(header).trim();
    let mut realm = None;
    let mut nonce = None;
    let mut qop = None;
    let mut algorithm = None;

    for (key, value) in parse_params(content) {
        match key.as_str() {
            "realm" => realm = Some(value),
            "nonce" => nonce = Some(value),
            "qop" => qop = Some(value),
            "algorithm" => algorithm = Some(value),
            _ => {}
        }
    }

    Some(DigestChallenge {
        realm: realm?,
        nonce: nonce?,
        qop: qop.unwrap_or_else(|| "auth".to_string()),
        algorithm: algorithm.unwrap_or_else(|| "MD5".to_string()),
    })
}

/// Splits `key=value` pairs separated by commas. Values may be quoted, and
/// quoted values may contain commas and spaces.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input;
    loop {
        rest = rest.trim_start_matches([',', ' ']);
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let Some(end) = stripped.find('"') else { break };
            value = stripped[..end].to_string();
            rest = &stripped[end + 1..];
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = &rest[end..];
        }
        if !key.is_empty() {
            params.push((key, value));
        }
        if rest.is_empty() {
            break;
        }
    }
    params
}

fn hash_hex(algorithm: &str, data: &str) -> String {
    match algorithm {
        "SHA-256" | "SHA256" => {
            let mut hasher = Sha256::new();
            hasher.update(data.as_bytes());
            hex::encode(hasher.finalize())
        }
        _ => {
            let mut hasher = Md5::new();
            hasher.update(data.as_bytes());
            hex::encode(hasher.finalize())
        }
    }
}

pub fn random_cnonce() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Computes the `Authorization: Digest ...` header for the given challenge:
/// `H(H(user:realm:pass):nonce:nc:cnonce:qop:H(method:uri))`.
pub fn authorization_header(
    user: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &DigestChallenge,
    cnonce: &str,
) -> String {
    let nc = "00000001";
    let ha1 = hash_hex(
        &challenge.algorithm,
        &format!("{user}:{}:{password}", challenge.realm),
    );
    let ha2 = hash_hex(&challenge.algorithm, &format!("{method}:{uri}"));
    let response = hash_hex(
        &challenge.algorithm,
        &format!(
            "{ha1}:{}:{nc}:{cnonce}:{}:{ha2}",
            challenge.nonce, challenge.qop
        ),
    );
    format!(
        "Digest username=\"{user}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", \
         algorithm=\"{}\", qop={}, nc={nc}, cnonce=\"{cnonce}\", response=\"{response}\"",
        challenge.realm, challenge.nonce, challenge.algorithm, challenge.qop
    )
}
