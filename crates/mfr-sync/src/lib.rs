//! Job orchestration: configuration, credentials, the feed registry and the
//! per-feed ingest-and-reconcile pipeline.

use std::path::PathBuf;

use mfr_storage::StorageError;
use mfr_tabular::SchemaConfigError;
use mfr_warehouse::WarehouseError;
use thiserror::Error;

mod config;
mod feeds;
mod pipeline;
mod secrets;

pub use config::JobConfig;
pub use feeds::{FeedConfig, FeedRegistry, StorageKind, StorageRef, TargetConfig};
pub use pipeline::{
    build_pipeline, connect_warehouse, secret_needs, FeedReport, JobSummary, StorageRegistry,
    SyncPipeline,
};
pub use secrets::{KeyVaultConfig, SecretNeeds, SecretSource, Secrets};

pub const CRATE_NAME: &str = "mfr-sync";

#[derive(Debug, Error)]
pub enum JobError {
    #[error("credential {name} unavailable: {reason}")]
    Credential { name: String, reason: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("feed {feed} has an invalid schema: {source}")]
    Schema {
        feed: String,
        #[source]
        source: SchemaConfigError,
    },
    #[error("feed {feed}: {source}")]
    Storage {
        feed: String,
        #[source]
        source: StorageError,
    },
    #[error("{context}: {source}")]
    Database {
        context: String,
        #[source]
        source: WarehouseError,
    },
    #[error("scratch directory {}: {source}", path.display())]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("scheduler: {0}")]
    Scheduler(String),
    #[error("no new data found")]
    NoNewData,
}
