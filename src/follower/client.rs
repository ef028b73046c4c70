// CT log API client
//
// HTTP communication with a single log. Rate limits (429) and server errors
// back off exponentially with jitter, bounded by the retry cap; any other
// client error is fatal for the log.

use crate::error::IngestError;
use crate::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Initial backoff duration, doubled with each retry
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Maximum backoff duration
const MAX_BACKOFF: Duration = Duration::from_secs(5);

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct LogClient {
    client: reqwest::Client,
    base_url: String,
    max_retries: u32,
}

impl LogClient {
    pub fn new(log_url: &str, max_retries: u32) -> LogClient {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        LogClient {
            client,
            base_url: log_url.trim_end_matches('/').to_string(),
            max_retries: max_retries.max(1),
        }
    }

    /// Current signed tree head.
    pub async fn get_sth(&self) -> Result<SignedTreeHead> {
        let url = format!("{}/ct/v1/get-sth", self.base_url);
        let response = self.retry_request(&url).await?;
        response.json().await.map_err(|e| {
            IngestError::parse(format!("Failed to parse STH response: {}", e))
        })
    }

    /// Entries in `[start, end]`, both inclusive per the CT API. The log may
    /// return fewer than requested; that answer is authoritative.
    pub async fn get_entries(&self, start: u64, end: u64) -> Result<Vec<RawEntry>> {
        let url = format!("{}/ct/v1/get-entries?start={}&end={}", self.base_url, start, end);
        debug!("Fetching entries {} through {}", start, end);

        let response = self.retry_request(&url).await?;
        let entries: EntriesResponse = response.json().await.map_err(|e| {
            IngestError::parse(format!("Failed to parse entries response: {}", e))
        })?;
        Ok(entries.entries)
    }

    async fn retry_request(&self, url: &str) -> Result<reqwest::Response> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_error = String::new();

        for attempt in 0..self.max_retries {
            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(
                            "{} from {}, retrying after {:?} (attempt {}/{})",
                            status,
                            url,
                            backoff,
                            attempt + 1,
                            self.max_retries
                        );
                        last_error = format!("status {}", status);
                    } else {
                        // Client error other than rate limiting: the request
                        // itself is wrong, retrying cannot help.
                        return Err(IngestError::HttpError {
                            status: status.as_u16(),
                            details: format!("Request to {} failed", url),
                        });
                    }
                }
                Err(e) => {
                    warn!(
                        "Network error on {}: {}, retrying after {:?} (attempt {}/{})",
                        url,
                        e,
                        backoff,
                        attempt + 1,
                        self.max_retries
                    );
                    last_error = e.to_string();
                }
            }

            tokio::time::sleep(jittered(backoff)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        Err(IngestError::Other(format!(
            "Request to {} failed after {} retries: {}",
            url, self.max_retries, last_error
        )))
    }
}

/// 0.5x to 1.5x of the nominal delay, so a fleet of workers does not
/// synchronize its retries against one log.
fn jittered(d: Duration) -> Duration {
    d.mul_f64(0.5 + rand::thread_rng().gen::<f64>())
}

/// Signed Tree Head response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignedTreeHead {
    pub tree_size: u64,
    pub timestamp: u64,
    #[serde(default)]
    pub sha256_root_hash: String,
    #[serde(default)]
    pub tree_head_signature: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct EntriesResponse {
    entries: Vec<RawEntry>,
}

/// Individual log entry as returned by get-entries
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawEntry {
    pub leaf_input: String,
    pub extra_data: String,
}
