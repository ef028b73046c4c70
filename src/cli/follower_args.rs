// Log-following configuration arguments

use clap::Args;

/// CT log selection and pacing options
#[derive(Args, Debug, Clone, Default)]
pub struct FollowerArgs {
    /// Comma-separated CT log URLs to follow
    #[arg(long = "log-list", value_name = "URLS")]
    pub log_list: Option<String>,

    /// Comma-separated issuer CN prefixes; empty accepts all
    #[arg(long = "issuer-cn-filter", value_name = "PREFIXES")]
    pub issuer_cn_filter: Option<String>,

    /// Also ingest certificates that have already expired
    #[arg(long = "log-expired-entries")]
    pub log_expired_entries: bool,

    /// Keep polling the logs instead of exiting when caught up
    #[arg(long = "run-forever")]
    pub run_forever: bool,

    /// Fetch worker multiplier per CPU
    #[arg(long = "num-threads", value_name = "N")]
    pub num_threads: Option<usize>,

    /// get-entries window size
    #[arg(long = "batch-size", value_name = "N")]
    pub batch_size: Option<u64>,
}
