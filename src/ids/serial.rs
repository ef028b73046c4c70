// Certificate serial numbers, kept as raw TBS bytes
//
// The TBS serialNumber is read as raw content bytes rather than through a
// big-integer view, preserving leading-zero and sign-bit distinctions that
// differ between CA implementations.

use crate::error::IngestError;
use crate::ids::{b64url_decode, b64url_encode};
use crate::Result;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use x509_parser::certificate::X509Certificate;

/// An opaque certificate serial number. Ordering and equality are bytewise.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Serial {
    serial: Vec<u8>,
}

impl Serial {
    /// Recover the raw serial bytes from a parsed certificate.
    pub fn from_cert(cert: &X509Certificate<'_>) -> Serial {
        Serial { serial: cert.raw_serial().to_vec() }
    }

    pub fn from_bytes(b: impl Into<Vec<u8>>) -> Serial {
        Serial { serial: b.into() }
    }

    pub fn from_hex(s: &str) -> Result<Serial> {
        let b = hex::decode(s)
            .map_err(|e| IngestError::parse(format!("Invalid hex serial [{}]: {}", s, e)))?;
        Ok(Serial { serial: b })
    }

    /// Inverse of [`Serial::id`].
    pub fn from_id_string(s: &str) -> Result<Serial> {
        let bytes = b64url_decode(s)
            .map_err(|e| IngestError::parse(format!("Invalid serial ID [{}]: {}", s, e)))?;
        Ok(Serial { serial: bytes })
    }

    pub fn from_ascii85(s: &str) -> Result<Serial> {
        Ok(Serial { serial: ascii85_decode(s)? })
    }

    /// Canonical string form: URL-safe base64 of the raw bytes.
    pub fn id(&self) -> String {
        b64url_encode(&self.serial)
    }

    pub fn hex_string(&self) -> String {
        hex::encode(&self.serial)
    }

    pub fn ascii85(&self) -> String {
        ascii85_encode(&self.serial)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.serial
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex_string())
    }
}

impl Serialize for Serial {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex_string())
    }
}

impl<'de> Deserialize<'de> for Serial {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Serial::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// Ascii85 codec compatible with Go's encoding/ascii85: 4-byte big-endian
// groups map to 5 digits in '!'..='u', a full zero group encodes as 'z', and
// a trailing group of n bytes encodes as n+1 digits.

fn ascii85_encode(src: &[u8]) -> String {
    let mut out = String::with_capacity(src.len() / 4 * 5 + 5);
    for chunk in src.chunks(4) {
        let mut group = [0u8; 4];
        group[..chunk.len()].copy_from_slice(chunk);
        let value = u32::from_be_bytes(group);

        if chunk.len() == 4 && value == 0 {
            out.push('z');
            continue;
        }

        let mut digits = [0u8; 5];
        let mut v = value;
        for d in digits.iter_mut().rev() {
            *d = (v % 85) as u8 + b'!';
            v /= 85;
        }
        for &d in digits.iter().take(chunk.len() + 1) {
            out.push(d as char);
        }
    }
    out
}

fn ascii85_decode(src: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(src.len() / 5 * 4 + 4);
    let mut digits: [u8; 5] = [0; 5];
    let mut ndigit = 0usize;

    let flush = |digits: &mut [u8; 5], ndigit: &mut usize, out: &mut Vec<u8>| -> Result<()> {
        if *ndigit == 0 {
            return Ok(());
        }
        if *ndigit == 1 {
            return Err(IngestError::parse(format!(
                "Truncated Ascii85 group in [{}]",
                src
            )));
        }
        let nbytes = *ndigit - 1;
        // Pad short groups with the max digit 'u'
        for d in digits[*ndigit..].iter_mut() {
            *d = 84;
        }
        let mut value: u64 = 0;
        for &d in digits.iter() {
            value = value * 85 + u64::from(d);
        }
        if value > u64::from(u32::MAX) {
            return Err(IngestError::parse(format!("Ascii85 group overflow in [{}]", src)));
        }
        let bytes = (value as u32).to_be_bytes();
        out.extend_from_slice(&bytes[..nbytes]);
        *ndigit = 0;
        Ok(())
    };

    for c in src.chars() {
        match c {
            'z' if ndigit == 0 => out.extend_from_slice(&[0, 0, 0, 0]),
            '!'..='u' => {
                digits[ndigit] = (c as u8) - b'!';
                ndigit += 1;
                if ndigit == 5 {
                    flush(&mut digits, &mut ndigit, &mut out)?;
                }
            }
            _ => {
                return Err(IngestError::parse(format!(
                    "Invalid Ascii85 character {:?} in [{}]",
                    c, src
                )))
            }
        }
    }
    flush(&mut digits, &mut ndigit, &mut out)?;
    Ok(out)
}
