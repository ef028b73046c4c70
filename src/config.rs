// Configuration
//
// A TOML file (selected with --config) merged with CLI overrides. Keys
// mirror the deployed fleet's configuration surface; unknown keys are a
// startup error so typos cannot silently disable filters.

use crate::cli::Args;
use crate::error::IngestError;
use crate::Result;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

const DEFAULT_REDIS_TIMEOUT: &str = "2s";
const DEFAULT_OUTPUT_REFRESH: &str = "125ms";
const DEFAULT_STATS_REFRESH: &str = "10m";

/// Raw file keys. `deny_unknown_fields` makes unrecognized keys fatal.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(rename = "certPath")]
    cert_path: Option<String>,
    #[serde(rename = "googleProjectId")]
    google_project_id: Option<String>,
    #[serde(rename = "firestoreProjectId")]
    firestore_project_id: Option<String>,
    #[serde(rename = "redisHost")]
    redis_host: Option<String>,
    #[serde(rename = "redisTimeout")]
    redis_timeout: Option<String>,
    #[serde(rename = "logList")]
    log_list: Option<String>,
    #[serde(rename = "issuerCNFilter")]
    issuer_cn_filter: Option<String>,
    #[serde(rename = "logExpiredEntries")]
    log_expired_entries: Option<bool>,
    #[serde(rename = "runForever")]
    run_forever: Option<bool>,
    #[serde(rename = "pollingDelayMean")]
    polling_delay_mean: Option<f64>,
    #[serde(rename = "pollingDelayStdDev")]
    polling_delay_std_dev: Option<f64>,
    #[serde(rename = "numThreads")]
    num_threads: Option<usize>,
    #[serde(rename = "cacheSize")]
    cache_size: Option<usize>,
    #[serde(rename = "outputRefreshPeriod")]
    output_refresh_period: Option<String>,
    #[serde(rename = "statsRefreshPeriod")]
    stats_refresh_period: Option<String>,
    #[serde(rename = "maxRetries")]
    max_retries: Option<u32>,
    #[serde(rename = "batchSize")]
    batch_size: Option<u64>,
}

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct CTConfig {
    pub cert_path: Option<String>,
    pub google_project_id: Option<String>,
    pub redis_host: String,
    pub redis_timeout: Duration,
    pub log_list: Vec<Url>,
    pub issuer_cn_filter: Vec<String>,
    pub log_expired_entries: bool,
    pub run_forever: bool,
    pub polling_delay_mean: f64,
    pub polling_delay_std_dev: f64,
    pub num_threads: usize,
    pub cache_size: usize,
    pub output_refresh_period: Duration,
    pub stats_refresh_period: Duration,
    pub max_retries: u32,
    pub batch_size: u64,
}

impl CTConfig {
    /// Load the file (when given), apply CLI overrides, validate.
    pub fn load(args: &Args) -> Result<CTConfig> {
        let file = match &args.config {
            Some(path) => Self::read_file(path)?,
            None => FileConfig::default(),
        };

        let google_project_id = file.google_project_id.or(file.firestore_project_id);

        let log_list_raw = args
            .follower
            .log_list
            .clone()
            .or(file.log_list)
            .unwrap_or_default();
        let log_list = split_list(&log_list_raw)
            .iter()
            .map(|s| Url::parse(s).map_err(IngestError::from))
            .collect::<Result<Vec<Url>>>()?;

        let issuer_cn_filter = split_list(
            &args
                .follower
                .issuer_cn_filter
                .clone()
                .or(file.issuer_cn_filter)
                .unwrap_or_default(),
        );

        let config = CTConfig {
            cert_path: args.storage.cert_path.clone().or(file.cert_path),
            google_project_id: args.storage.google_project_id.clone().or(google_project_id),
            redis_host: args
                .storage
                .redis_host
                .clone()
                .or(file.redis_host)
                .unwrap_or_default(),
            redis_timeout: parse_duration(
                args.storage
                    .redis_timeout
                    .as_deref()
                    .or(file.redis_timeout.as_deref())
                    .unwrap_or(DEFAULT_REDIS_TIMEOUT),
            )?,
            log_list,
            issuer_cn_filter,
            log_expired_entries: args.follower.log_expired_entries
                || file.log_expired_entries.unwrap_or(false),
            run_forever: args.follower.run_forever || file.run_forever.unwrap_or(false),
            polling_delay_mean: file.polling_delay_mean.unwrap_or(600.0),
            polling_delay_std_dev: file.polling_delay_std_dev.unwrap_or(60.0),
            num_threads: args
                .follower
                .num_threads
                .or(file.num_threads)
                .unwrap_or(1)
                .max(1),
            cache_size: file.cache_size.unwrap_or(64).max(1),
            output_refresh_period: parse_duration(
                file.output_refresh_period.as_deref().unwrap_or(DEFAULT_OUTPUT_REFRESH),
            )?,
            stats_refresh_period: parse_duration(
                file.stats_refresh_period.as_deref().unwrap_or(DEFAULT_STATS_REFRESH),
            )?,
            max_retries: file.max_retries.unwrap_or(10).max(1),
            batch_size: args
                .follower
                .batch_size
                .or(file.batch_size)
                .unwrap_or(1000)
                .clamp(1, 10_000),
        };

        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<FileConfig> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            IngestError::config(format!("Could not read {}: {}", path.display(), e))
        })?;
        toml::from_str(&text)
            .map_err(|e| IngestError::config(format!("Invalid config {}: {}", path.display(), e)))
    }

    fn validate(&self) -> Result<()> {
        if self.redis_host.is_empty() {
            return Err(IngestError::config("redisHost is required"));
        }
        let has_local = self.cert_path.as_deref().is_some_and(|p| !p.is_empty());
        let has_google = self.google_project_id.as_deref().is_some_and(|p| !p.is_empty());
        if has_local && has_google {
            return Err(IngestError::config(
                "Local disk and Google configurations both found",
            ));
        }
        if !has_local && !has_google {
            return Err(IngestError::config(
                "No storage backend configured (set certPath or googleProjectId)",
            ));
        }
        Ok(())
    }
}

/// Split a comma-separated list, dropping empty segments.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Go-style duration strings: `250ms`, `2s`, `10m`, `1h`, and bare-number
/// seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split_at = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (value, unit) = s.split_at(split_at);
    let value: f64 = value
        .parse()
        .map_err(|_| IngestError::config(format!("Invalid duration: {}", s)))?;

    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" | "" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(IngestError::config(format!("Invalid duration unit: {}", s))),
    };
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(IngestError::config(format!("Invalid duration: {}", s)));
    }
    Ok(Duration::from_secs_f64(seconds))
}
