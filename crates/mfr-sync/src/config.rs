use std::path::PathBuf;
use std::time::Duration;

use mfr_storage::{CopyPollPolicy, HttpClientConfig};

use crate::secrets::SecretSource;
use crate::JobError;

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub feeds_file: PathBuf,
    pub work_dir: PathBuf,
    pub blob_endpoint: Option<String>,
    pub fileshare_endpoint: Option<String>,
    pub http_timeout_secs: u64,
    pub copy_timeout_secs: u64,
    pub refresh_feed: String,
    pub schedule_cron: String,
    pub db_max_connections: u32,
    /// Where credentials come from; resolved once per pipeline build.
    pub secrets: SecretSource,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Explicit endpoint, else the public endpoint derived from the account name.
fn endpoint(endpoint_key: &str, account_key: &str, service: &str) -> Option<String> {
    env_var(endpoint_key)
        .or_else(|| env_var(account_key).map(|a| format!("https://{a}.{service}.core.windows.net")))
}

impl JobConfig {
    /// Read every setting and the credential source from the process
    /// environment. Called once at startup.
    pub fn from_env() -> Result<Self, JobError> {
        Ok(Self {
            feeds_file: env_var("MFR_FEEDS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./feeds.yaml")),
            work_dir: env_var("MFR_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./work")),
            blob_endpoint: endpoint("BLOB_ENDPOINT", "BLOB_ACCOUNT", "blob"),
            fileshare_endpoint: endpoint("FILESHARE_ENDPOINT", "FILESHARE_ACCOUNT", "file"),
            http_timeout_secs: env_parse("MFR_HTTP_TIMEOUT_SECS", 30),
            copy_timeout_secs: env_parse("MFR_COPY_TIMEOUT_SECS", 300),
            refresh_feed: env_var("MFR_REFRESH_FEED").unwrap_or_else(|| "Data".to_string()),
            schedule_cron: env_var("MFR_SCHEDULE_CRON")
                .unwrap_or_else(|| "0 0 6 * * *".to_string()),
            db_max_connections: env_parse("MFR_DB_MAX_CONNECTIONS", 2),
            secrets: SecretSource::from_env()?,
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            ..Default::default()
        }
    }

    pub fn copy_poll_policy(&self) -> CopyPollPolicy {
        CopyPollPolicy {
            timeout: Duration::from_secs(self.copy_timeout_secs),
            ..Default::default()
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            feeds_file: PathBuf::from("./feeds.yaml"),
            work_dir: PathBuf::from("./work"),
            blob_endpoint: None,
            fileshare_endpoint: None,
            http_timeout_secs: 30,
            copy_timeout_secs: 300,
            refresh_feed: "Data".to_string(),
            schedule_cron: "0 0 6 * * *".to_string(),
            db_max_connections: 2,
            secrets: SecretSource::Env {
                database_url: None,
                blob_sas_token: None,
                fileshare_sas_token: None,
            },
        }
    }
}
