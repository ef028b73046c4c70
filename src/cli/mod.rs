// Command line interface
//
// Argument groups are split per concern and flattened into the top-level
// parser.

pub mod follower_args;
pub mod storage_args;

pub use follower_args::FollowerArgs;
pub use storage_args::StorageArgs;

use clap::Parser;
use std::path::PathBuf;

/// Follow Certificate Transparency logs into sharded certificate storage.
#[derive(Parser, Debug, Clone)]
#[command(name = "certshard", version, about)]
pub struct Args {
    /// Path to a TOML configuration file
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Skip the first N entries of every log
    #[arg(long = "offset", value_name = "N")]
    pub offset: Option<u64>,

    /// Stop each log after roughly N entries
    #[arg(long = "limit", value_name = "N")]
    pub limit: Option<u64>,

    /// Rebuild shard metadata from stored PEMs instead of ingesting
    #[arg(long = "reprocess")]
    pub reprocess: bool,

    /// Regexes selecting shards to reprocess (expDate, issuer, or
    /// expDate/issuer); empty selects everything
    #[arg(value_name = "PATTERN", requires = "reprocess")]
    pub patterns: Vec<String>,

    #[command(flatten)]
    pub follower: FollowerArgs,

    #[command(flatten)]
    pub storage: StorageArgs,
}
