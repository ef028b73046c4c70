// Storage and cache selection arguments

use clap::Args;

/// Backend and cache options. Exactly one of the durable backends must end
/// up configured, here or in the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct StorageArgs {
    /// Root directory for the local-disk document backend
    #[arg(long = "cert-path", value_name = "DIR")]
    pub cert_path: Option<String>,

    /// Firestore project id for the document backend
    #[arg(long = "google-project-id", value_name = "PROJECT", alias = "firestore-project-id")]
    pub google_project_id: Option<String>,

    /// host:port of the Redis membership cache
    #[arg(long = "redis-host", value_name = "HOST:PORT")]
    pub redis_host: Option<String>,

    /// Read/write timeout for every cache call (e.g. 2s)
    #[arg(long = "redis-timeout", value_name = "DURATION")]
    pub redis_timeout: Option<String>,
}
