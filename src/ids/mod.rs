// Identifier value types
//
// Stable string encodings for the keys used across the cache, the storage
// backend, and the follower checkpoints.

pub mod expdate;
pub mod issuer;
pub mod log;
pub mod serial;

pub use expdate::ExpDate;
pub use issuer::{Issuer, Spki};
pub use log::CertificateLog;
pub use serial::Serial;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;

/// URL-safe base64 with `=` padding, the one alphabet every identifier
/// encodes through.
pub(crate) fn b64url_encode(bytes: &[u8]) -> String {
    URL_SAFE.encode(bytes)
}

pub(crate) fn b64url_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE.decode(s)
}
