// Merkle Tree Leaf parsing (RFC 6962)
//
// A leaf carries a v1 TimestampedEntry:
//
//   byte 0      version (0)
//   byte 1      leaf type (0 = timestamped_entry)
//   bytes 2-9   timestamp, milliseconds since epoch, big-endian
//   bytes 10-11 entry type (0 = x509_entry, 1 = precert_entry)
//   ...         entry body
//
// For x509 entries the body is the full certificate (24-bit length
// prefixed) and extra_data holds the issuing chain. For precert entries the
// body is issuer_key_hash + TBS, and the actual precertificate travels in
// extra_data's PrecertChainEntry instead.

use crate::error::IngestError;
use crate::follower::client::RawEntry;
use crate::Result;
use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine;
use chrono::{DateTime, Utc};

const LEAF_HEADER_LEN: usize = 12;
const ISSUER_KEY_HASH_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    X509,
    Precert,
}

#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub entry_type: EntryType,
    pub timestamp: DateTime<Utc>,
    /// DER of the logged certificate (the precertificate for precert
    /// entries).
    pub cert_der: Vec<u8>,
    /// DER of the first chain element, when the log supplied one.
    pub issuer_der: Option<Vec<u8>>,
}

/// Parse one get-entries element into the certificate and its issuer.
pub fn parse_entry(raw: &RawEntry) -> Result<ParsedEntry> {
    let leaf = BASE64_STD
        .decode(&raw.leaf_input)
        .map_err(|e| IngestError::parse(format!("Failed to decode leaf_input: {}", e)))?;
    let extra = BASE64_STD
        .decode(&raw.extra_data)
        .map_err(|e| IngestError::parse(format!("Failed to decode extra_data: {}", e)))?;

    if leaf.len() < LEAF_HEADER_LEN {
        return Err(IngestError::parse(format!("Leaf input too short: {} bytes", leaf.len())));
    }

    let version = leaf[0];
    if version != 0 {
        return Err(IngestError::parse(format!("Unsupported CT version: {}", version)));
    }
    let leaf_type = leaf[1];
    if leaf_type != 0 {
        return Err(IngestError::parse(format!("Unsupported leaf type: {}", leaf_type)));
    }

    let timestamp_ms = u64::from_be_bytes([
        leaf[2], leaf[3], leaf[4], leaf[5], leaf[6], leaf[7], leaf[8], leaf[9],
    ]);
    let timestamp = DateTime::<Utc>::from_timestamp_millis(timestamp_ms as i64)
        .ok_or_else(|| IngestError::parse(format!("Leaf timestamp out of range: {}", timestamp_ms)))?;

    let entry_type = u16::from_be_bytes([leaf[10], leaf[11]]);
    match entry_type {
        0 => {
            let (cert_der, _) = read_length_prefixed(&leaf[LEAF_HEADER_LEN..])
                .ok_or_else(|| IngestError::parse("Truncated x509 leaf certificate"))?;
            let chain = parse_chain(&extra)?;
            Ok(ParsedEntry {
                entry_type: EntryType::X509,
                timestamp,
                cert_der,
                issuer_der: chain.into_iter().next(),
            })
        }
        1 => {
            // issuer_key_hash + TBS live in the leaf; skip both and take the
            // full precertificate from the PrecertChainEntry.
            if leaf.len() < LEAF_HEADER_LEN + ISSUER_KEY_HASH_LEN + 3 {
                return Err(IngestError::parse("Truncated precert leaf"));
            }
            let (cert_der, rest) = read_length_prefixed(&extra)
                .ok_or_else(|| IngestError::parse("Truncated precert extra_data"))?;
            let chain = parse_chain(rest)?;
            Ok(ParsedEntry {
                entry_type: EntryType::Precert,
                timestamp,
                cert_der,
                issuer_der: chain.into_iter().next(),
            })
        }
        other => Err(IngestError::parse(format!("Unknown entry type: {}", other))),
    }
}

/// A chain is a 24-bit total length followed by 24-bit length prefixed
/// certificates.
fn parse_chain(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    if bytes.len() < 3 {
        return Err(IngestError::parse("Truncated certificate chain"));
    }
    let total = read_u24(bytes) as usize;
    let mut rest = bytes
        .get(3..3 + total)
        .ok_or_else(|| IngestError::parse("Certificate chain length exceeds data"))?;

    let mut chain = Vec::new();
    while !rest.is_empty() {
        let (cert, remaining) = read_length_prefixed(rest)
            .ok_or_else(|| IngestError::parse("Truncated chain certificate"))?;
        chain.push(cert);
        rest = remaining;
    }
    Ok(chain)
}

fn read_u24(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
}

fn read_length_prefixed(bytes: &[u8]) -> Option<(Vec<u8>, &[u8])> {
    if bytes.len() < 3 {
        return None;
    }
    let len = read_u24(bytes) as usize;
    let body = bytes.get(3..3 + len)?;
    Some((body.to_vec(), &bytes[3 + len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u24(len: usize) -> [u8; 3] {
        let b = (len as u32).to_be_bytes();
        [b[1], b[2], b[3]]
    }

    pub fn build_x509_leaf(timestamp_ms: u64, cert: &[u8]) -> Vec<u8> {
        let mut leaf = vec![0u8, 0u8];
        leaf.extend_from_slice(&timestamp_ms.to_be_bytes());
        leaf.extend_from_slice(&0u16.to_be_bytes());
        leaf.extend_from_slice(&u24(cert.len()));
        leaf.extend_from_slice(cert);
        leaf.extend_from_slice(&[0, 0]); // empty extensions
        leaf
    }

    pub fn build_chain(certs: &[&[u8]]) -> Vec<u8> {
        let mut body = Vec::new();
        for c in certs {
            body.extend_from_slice(&u24(c.len()));
            body.extend_from_slice(c);
        }
        let mut out = u24(body.len()).to_vec();
        out.extend_from_slice(&body);
        out
    }

    fn build_precert_leaf(timestamp_ms: u64, tbs: &[u8]) -> Vec<u8> {
        let mut leaf = vec![0u8, 0u8];
        leaf.extend_from_slice(&timestamp_ms.to_be_bytes());
        leaf.extend_from_slice(&1u16.to_be_bytes());
        leaf.extend_from_slice(&[0xaa; 32]); // issuer_key_hash
        leaf.extend_from_slice(&u24(tbs.len()));
        leaf.extend_from_slice(tbs);
        leaf.extend_from_slice(&[0, 0]);
        leaf
    }

    fn entry(leaf: Vec<u8>, extra: Vec<u8>) -> RawEntry {
        RawEntry {
            leaf_input: BASE64_STD.encode(leaf),
            extra_data: BASE64_STD.encode(extra),
        }
    }

    #[test]
    fn test_parse_x509_entry_with_chain() {
        let cert = b"fake-cert-der".as_ref();
        let issuer = b"fake-issuer-der".as_ref();
        let root = b"fake-root-der".as_ref();
        let raw = entry(
            build_x509_leaf(1_700_000_000_000, cert),
            build_chain(&[issuer, root]),
        );

        let parsed = parse_entry(&raw).unwrap();
        assert_eq!(parsed.entry_type, EntryType::X509);
        assert_eq!(parsed.cert_der, cert);
        assert_eq!(parsed.issuer_der.as_deref(), Some(issuer));
        assert_eq!(parsed.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_parse_x509_entry_without_chain() {
        let cert = b"self-issued".as_ref();
        let raw = entry(build_x509_leaf(1_000, cert), Vec::new());
        let parsed = parse_entry(&raw).unwrap();
        assert_eq!(parsed.cert_der, cert);
        assert_eq!(parsed.issuer_der, None);
    }

    #[test]
    fn test_parse_precert_entry_takes_precert_from_extra_data() {
        let tbs = b"tbs-without-poison".as_ref();
        let precert = b"full-precert-der".as_ref();
        let issuer = b"precert-signer".as_ref();

        let mut extra = u24(precert.len()).to_vec();
        extra.extend_from_slice(precert);
        extra.extend_from_slice(&build_chain(&[issuer]));

        let raw = entry(build_precert_leaf(5_000, tbs), extra);
        let parsed = parse_entry(&raw).unwrap();
        assert_eq!(parsed.entry_type, EntryType::Precert);
        assert_eq!(parsed.cert_der, precert);
        assert_eq!(parsed.issuer_der.as_deref(), Some(issuer));
    }

    #[test]
    fn test_rejects_unknown_version_and_type() {
        let mut leaf = build_x509_leaf(0, b"x");
        leaf[0] = 9;
        assert!(parse_entry(&entry(leaf, Vec::new())).is_err());

        let mut leaf = build_x509_leaf(0, b"x");
        leaf[10] = 0xff;
        leaf[11] = 0xff;
        assert!(parse_entry(&entry(leaf, Vec::new())).is_err());
    }

    #[test]
    fn test_rejects_truncated_leaf() {
        let raw = RawEntry {
            leaf_input: BASE64_STD.encode([0u8; 5]),
            extra_data: BASE64_STD.encode([]),
        };
        assert!(parse_entry(&raw).is_err());

        let mut leaf = build_x509_leaf(0, b"certbytes");
        leaf.truncate(LEAF_HEADER_LEN + 3 + 2); // length says 9, only 2 present
        assert!(parse_entry(&entry(leaf, Vec::new())).is_err());
    }

    #[test]
    fn test_rejects_bad_base64() {
        let raw = RawEntry {
            leaf_input: "!!not-base64!!".to_string(),
            extra_data: String::new(),
        };
        assert!(parse_entry(&raw).is_err());
    }
}
