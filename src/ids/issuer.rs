// Issuer identities derived from SubjectPublicKeyInfo
//
// An issuer's stable ID is the URL-safe base64 of SHA-256 over its raw
// DER-encoded SPKI. Certificates missing a usable key identifier fall back
// to SHA-1 of the raw SPKI (legacy path).

use crate::ids::b64url_encode;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::ParsedExtension;

/// Key identifier extensions shorter than this are unusable; SHA-1 of the
/// raw SPKI stands in.
const MIN_KEY_ID_LEN: usize = 8;

/// The DER-encoded SubjectPublicKeyInfo of a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spki {
    spki: Vec<u8>,
}

impl Spki {
    /// The raw SPKI of the certificate itself. The common path for issuer
    /// certificates.
    pub fn from_cert(cert: &X509Certificate<'_>) -> Spki {
        Spki { spki: cert.tbs_certificate.subject_pki.raw.to_vec() }
    }

    /// The certificate's SubjectKeyIdentifier bytes, or SHA-1 of the raw
    /// SPKI when the extension is missing or too short to identify a key.
    pub fn from_cert_key_id(cert: &X509Certificate<'_>) -> Spki {
        let ski = cert
            .extensions()
            .iter()
            .find_map(|ext| match ext.parsed_extension() {
                ParsedExtension::SubjectKeyIdentifier(ski) => Some(ski.0.to_vec()),
                _ => None,
            })
            .unwrap_or_default();

        if ski.len() < MIN_KEY_ID_LEN {
            let digest = Sha1::digest(cert.tbs_certificate.subject_pki.raw);
            debug!(
                issuer = %cert.issuer(),
                "SPKI key id is short ({} bytes), using SHA-1 digest instead",
                ski.len()
            );
            return Spki { spki: digest.to_vec() };
        }

        Spki { spki: ski }
    }

    pub fn from_bytes(b: impl Into<Vec<u8>>) -> Spki {
        Spki { spki: b.into() }
    }

    pub fn sha256_digest_b64(&self) -> String {
        b64url_encode(&Sha256::digest(&self.spki))
    }
}

impl fmt::Display for Spki {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.spki))
    }
}

/// A certificate issuer, identified by the digest of its SPKI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Issuer {
    id: String,
}

impl Issuer {
    /// Derive the issuer identity from a parsed issuer certificate.
    pub fn from_cert(cert: &X509Certificate<'_>) -> Issuer {
        Issuer::from_spki(&Spki::from_cert(cert))
    }

    pub fn from_spki(spki: &Spki) -> Issuer {
        Issuer { id: spki.sha256_digest_b64() }
    }

    /// Rehydrate an issuer from a previously serialized ID string. The ID is
    /// opaque from this point on.
    pub fn from_id(id: impl Into<String>) -> Issuer {
        Issuer { id: id.into() }
    }

    /// Identity for a leaf whose issuing certificate is unavailable: the
    /// leaf's own key-identifier resolution stands in for the issuer chain.
    pub fn from_leaf_fallback(leaf: &X509Certificate<'_>) -> Issuer {
        let aki = leaf
            .extensions()
            .iter()
            .find_map(|ext| match ext.parsed_extension() {
                ParsedExtension::AuthorityKeyIdentifier(aki) => {
                    aki.key_identifier.as_ref().map(|k| k.0.to_vec())
                }
                _ => None,
            })
            .unwrap_or_default();

        if aki.len() >= MIN_KEY_ID_LEN {
            return Issuer::from_spki(&Spki::from_bytes(aki));
        }
        Issuer::from_spki(&Spki::from_cert_key_id(leaf))
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for Issuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spki_digest_is_stable() {
        let spki = Spki::from_bytes(vec![0x30, 0x0d, 0x06, 0x09]);
        let a = Issuer::from_spki(&spki);
        let b = Issuer::from_spki(&spki);
        assert_eq!(a, b);
        // URL-safe base64 of a SHA-256 digest with padding
        assert_eq!(a.id().len(), 44);
        assert!(!a.id().contains('+'));
        assert!(!a.id().contains('/'));
    }

    #[test]
    fn test_distinct_spkis_distinct_ids() {
        let a = Issuer::from_spki(&Spki::from_bytes(vec![1, 2, 3]));
        let b = Issuer::from_spki(&Spki::from_bytes(vec![1, 2, 4]));
        assert_ne!(a, b);
    }

    #[test]
    fn test_from_id_round_trip() {
        let orig = Issuer::from_spki(&Spki::from_bytes(vec![9, 9, 9]));
        let rehydrated = Issuer::from_id(orig.id().to_string());
        assert_eq!(orig, rehydrated);
    }

    #[test]
    fn test_serde_transparent() {
        let issuer = Issuer::from_id("abc123");
        let json = serde_json::to_string(&issuer).unwrap();
        assert_eq!(json, "\"abc123\"");
        let back: Issuer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, issuer);
    }
}
