// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SSH public key fingerprinting.
//!
//! Accepts the three shapes a public key shows up in on a scanned host: a
//! tagged `authorized_keys`/`*.pub` line (`ssh-rsa AAAA... comment`), a
//! PEM-framed `-----BEGIN ... PUBLIC KEY-----` block, and a bare base64
//! blob with no framing at all. Every function here is pure and infallible
//! in the sense that matters: malformed input returns `None` rather than an
//! error, since a scan that meets one bad key must not abort.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use md5::{Digest as Md5Digest, Md5};
use sha2::{Digest as Sha256Digest, Sha256};

use crate::models::KeyType;

const KNOWN_KEY_TYPES: &[&str] = &[
    "ssh-rsa",
    "ssh-dss",
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
];

/// A parsed public key: its wire-format type tag, the raw decoded key bytes
/// (length-prefixed OpenSSH wire format), and an optional trailing comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub key_type_tag: String,
    pub key_bytes: Vec<u8>,
    pub comment: Option<String>,
}

/// Parse a single public key line or block in any of the three shapes.
/// Returns `None` for anything that doesn't decode to valid base64 with a
/// recognized leading key-type tag embedded in the wire bytes.
pub fn parse_public_key(input: &str) -> Option<ParsedKey> {
    let input = input.trim();
    if input.is_empty() || input.starts_with('#') {
        return None;
    }

    if input.starts_with("-----BEGIN") {
        return parse_pem_framed(input);
    }

    parse_tagged_or_bare(input)
}

fn parse_pem_framed(input: &str) -> Option<ParsedKey> {
    let body: String = input
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let key_bytes = STANDARD.decode(body.trim()).ok()?;
    let key_type_tag = extract_wire_type(&key_bytes)?;
    Some(ParsedKey {
        key_type_tag,
        key_bytes,
        comment: None,
    })
}

fn parse_tagged_or_bare(input: &str) -> Option<ParsedKey> {
    let mut fields = input.split_whitespace();
    let first = fields.next()?;

    if KNOWN_KEY_TYPES.contains(&first) {
        let b64 = fields.next()?;
        let key_bytes = decode_b64_any(b64)?;
        let comment = fields.collect::<Vec<_>>().join(" ");
        let comment = if comment.is_empty() { None } else { Some(comment) };
        return Some(ParsedKey {
            key_type_tag: first.to_string(),
            key_bytes,
            comment,
        });
    }

    // Bare base64 blob: the wire type lives inside the decoded bytes.
    let key_bytes = decode_b64_any(input.split_whitespace().next()?)?;
    let key_type_tag = extract_wire_type(&key_bytes)?;
    Some(ParsedKey {
        key_type_tag,
        key_bytes,
        comment: None,
    })
}

fn decode_b64_any(s: &str) -> Option<Vec<u8>> {
    STANDARD
        .decode(s)
        .or_else(|_| STANDARD_NO_PAD.decode(s))
        .ok()
}

/// The OpenSSH wire format begins with a 4-byte big-endian length followed
/// by the ASCII key-type string (e.g. `ssh-ed25519`).
fn extract_wire_type(bytes: &[u8]) -> Option<String> {
    if bytes.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let type_bytes = bytes.get(4..4 + len)?;
    let s = std::str::from_utf8(type_bytes).ok()?.to_string();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

pub fn detect_key_type(tag: &str) -> KeyType {
    match tag {
        "ssh-rsa" => KeyType::Rsa,
        "ssh-ed25519" => KeyType::Ed25519,
        "ssh-dss" => KeyType::Dsa,
        t if t.starts_with("ecdsa-sha2-") => KeyType::Ecdsa,
        _ => KeyType::Unknown,
    }
}

/// Estimate key bit length from wire-encoded key material. Only RSA keys
/// carry a variable bit length worth reporting; the others are fixed by
/// curve/type and `None` is returned rather than a constant table, since
/// the caller derives `key_bits` purely for RSA strength reporting.
pub fn estimate_key_bits(tag: &str, key_bytes: &[u8]) -> Option<u32> {
    if tag != "ssh-rsa" {
        return None;
    }
    // wire format: len(type) type len(e) e len(n) n — bit length is the
    // modulus `n`'s length in bits, skipping a possible leading zero byte.
    let mut offset = 4 + tag.len();
    let e_len = u32::from_be_bytes(bytes4(key_bytes, offset)?) as usize;
    offset += 4 + e_len;
    let n_len = u32::from_be_bytes(bytes4(key_bytes, offset)?) as usize;
    offset += 4;
    let n = key_bytes.get(offset..offset + n_len)?;
    let mut n = n;
    while n.first() == Some(&0) {
        n = &n[1..];
    }
    Some((n.len() * 8) as u32)
}

fn bytes4(buf: &[u8], offset: usize) -> Option<[u8; 4]> {
    let slice = buf.get(offset..offset + 4)?;
    slice.try_into().ok()
}

/// `SHA256:<base64-no-pad>` over the raw wire-format key bytes.
pub fn sha256_fingerprint(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    let sum = hasher.finalize();
    format!("SHA256:{}", STANDARD_NO_PAD.encode(sum))
}

/// `MD5:<colon-hex>`, kept alongside the SHA256 digest for correlating
/// against historical access logs that predate OpenSSH 6.8's switch to
/// SHA256 fingerprints by default.
pub fn md5_fingerprint(key_bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(key_bytes);
    let sum = hasher.finalize();
    let hex = sum
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":");
    format!("MD5:{}", hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ed25519_line() -> &'static str {
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIJ5lUIu0pGPM5ITaGDUUTMmCP89YZrLNyGzWxZ1n3Wnd alice@workstation"
    }

    #[test]
    fn parses_tagged_line_with_comment() {
        let parsed = parse_public_key(sample_ed25519_line()).unwrap();
        assert_eq!(parsed.key_type_tag, "ssh-ed25519");
        assert_eq!(parsed.comment.as_deref(), Some("alice@workstation"));
    }

    #[test]
    fn parses_bare_base64_without_tag() {
        let parsed = parse_public_key(sample_ed25519_line()).unwrap();
        let bare = STANDARD.encode(&parsed.key_bytes);
        let reparsed = parse_public_key(&bare).unwrap();
        assert_eq!(reparsed.key_type_tag, "ssh-ed25519");
        assert_eq!(reparsed.key_bytes, parsed.key_bytes);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_public_key("not a key at all").is_none());
        assert!(parse_public_key("").is_none());
        assert!(parse_public_key("# a comment line").is_none());
    }

    #[test]
    fn detects_key_types() {
        assert_eq!(detect_key_type("ssh-rsa"), KeyType::Rsa);
        assert_eq!(detect_key_type("ssh-ed25519"), KeyType::Ed25519);
        assert_eq!(detect_key_type("ssh-dss"), KeyType::Dsa);
        assert_eq!(detect_key_type("ecdsa-sha2-nistp256"), KeyType::Ecdsa);
        assert_eq!(detect_key_type("ssh-weird"), KeyType::Unknown);
    }

    #[test]
    fn sha256_fingerprint_has_expected_prefix() {
        let parsed = parse_public_key(sample_ed25519_line()).unwrap();
        let fp = sha256_fingerprint(&parsed.key_bytes);
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.contains('='));
    }

    #[test]
    fn md5_fingerprint_has_expected_shape() {
        let parsed = parse_public_key(sample_ed25519_line()).unwrap();
        let fp = md5_fingerprint(&parsed.key_bytes);
        assert!(fp.starts_with("MD5:"));
        let hex = fp.strip_prefix("MD5:").unwrap();
        assert_eq!(hex.chars().filter(|c| *c == ':').count(), 15);
        for segment in hex.split(':') {
            assert_eq!(segment.len(), 2);
            assert!(segment.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn pem_framed_block_parses() {
        let parsed = parse_public_key(sample_ed25519_line()).unwrap();
        let b64 = STANDARD.encode(&parsed.key_bytes);
        let pem = format!("-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----", b64);
        let reparsed = parse_public_key(&pem).unwrap();
        assert_eq!(reparsed.key_type_tag, "ssh-ed25519");
    }
}
