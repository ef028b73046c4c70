// Per-log checkpoint state
//
// A log is identified by its short URL (host + path, no scheme). MaxEntry is
// the largest entry index whose certificate has been durably stored,
// inclusive; None means nothing has been persisted yet, so an empty log
// never fabricates entry 0.

use crate::ids::b64url_encode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateLog {
    pub short_url: String,
    #[serde(with = "max_entry_sentinel")]
    pub max_entry: Option<u64>,
    pub last_entry_time: Option<DateTime<Utc>>,
}

impl CertificateLog {
    pub fn new(short_url: impl Into<String>) -> CertificateLog {
        CertificateLog {
            short_url: short_url.into(),
            max_entry: None,
            last_entry_time: None,
        }
    }

    /// host + path of the log URL, with no scheme and no trailing slash.
    pub fn short_url_of(url: &Url) -> String {
        let host = url.host_str().unwrap_or_default();
        let path = url.path().trim_end_matches('/');
        format!("{}{}", host, path)
    }

    pub fn id_from_short_url(short_url: &str) -> String {
        b64url_encode(short_url.as_bytes())
    }

    pub fn id(&self) -> String {
        Self::id_from_short_url(&self.short_url)
    }

    /// The first entry index the follower still needs.
    pub fn next_entry(&self) -> u64 {
        self.max_entry.map_or(0, |m| m + 1)
    }
}

impl fmt::Display for CertificateLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max_entry {
            Some(m) => write!(f, "[{}] MaxEntry={}", self.short_url, m),
            None => write!(f, "[{}] MaxEntry=unset", self.short_url),
        }
    }
}

// MaxEntry persists as a signed integer with -1 for "unset".
mod max_entry_sentinel {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        v: &Option<u64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(v.map_or(-1, |m| m as i64))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u64>, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        if raw < 0 {
            Ok(None)
        } else {
            Ok(Some(raw as u64))
        }
    }
}
