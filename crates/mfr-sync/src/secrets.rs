//! Credential resolution: process environment or an Azure Key Vault reached
//! with a service principal.

use mfr_storage::{RestClient, StorageError};
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, info};

use crate::JobError;

pub const DATABASE_SECRET: &str = "public-dataflow-connectionstring";
pub const BLOB_SAS_SECRET: &str = "blob-sas-token";
pub const FILESHARE_SAS_SECRET: &str = "fileshare-sas-token";

const KEYVAULT_API_VERSION: &str = "7.4";
const KEYVAULT_SCOPE: &str = "https://vault.azure.net/.default";

#[derive(Clone, PartialEq, Eq)]
pub struct KeyVaultConfig {
    pub vault_url: String,
    pub authority_host: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// Values captured from the environment at startup.
    Env {
        database_url: Option<String>,
        blob_sas_token: Option<String>,
        fileshare_sas_token: Option<String>,
    },
    KeyVault(KeyVaultConfig),
}

/// Which credentials the configured feeds need.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecretNeeds {
    pub blob: bool,
    pub fileshare: bool,
}

#[derive(Clone, Default)]
pub struct Secrets {
    pub database_url: String,
    pub blob_sas_token: Option<String>,
    pub fileshare_sas_token: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("database_url", &"<redacted>")
            .field("blob_sas_token", &self.blob_sas_token.as_ref().map(|_| "<redacted>"))
            .field(
                "fileshare_sas_token",
                &self.fileshare_sas_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl std::fmt::Debug for KeyVaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVaultConfig")
            .field("vault_url", &self.vault_url)
            .field("authority_host", &self.authority_host)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl std::fmt::Debug for SecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        match self {
            SecretSource::Env {
                database_url,
                blob_sas_token,
                fileshare_sas_token,
            } => f
                .debug_struct("Env")
                .field("database_url", &shown(database_url))
                .field("blob_sas_token", &shown(blob_sas_token))
                .field("fileshare_sas_token", &shown(fileshare_sas_token))
                .finish(),
            SecretSource::KeyVault(config) => f.debug_tuple("KeyVault").field(config).finish(),
        }
    }
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn missing(name: &str, reason: impl Into<String>) -> JobError {
    JobError::Credential {
        name: name.to_string(),
        reason: reason.into(),
    }
}

impl SecretSource {
    /// Key Vault when `KEYVAULT_URL` is set, otherwise plain environment variables.
    pub(crate) fn from_env() -> Result<Self, JobError> {
        let var = |key: &str| present(std::env::var(key).ok());
        match var("KEYVAULT_URL") {
            Some(vault_url) => {
                let required = |key: &str| var(key).ok_or_else(|| missing(key, "not set"));
                Ok(Self::KeyVault(KeyVaultConfig {
                    vault_url,
                    authority_host: var("AZURE_AUTHORITY_HOST")
                        .unwrap_or_else(|| "https://login.microsoftonline.com".to_string()),
                    tenant_id: required("AZURE_TENANT_ID")?,
                    client_id: required("AZURE_CLIENT_ID")?,
                    client_secret: required("AZURE_CLIENT_SECRET")?,
                }))
            }
            None => Ok(Self::Env {
                database_url: var("DATABASE_URL"),
                blob_sas_token: var("BLOB_SAS_TOKEN"),
                fileshare_sas_token: var("FILESHARE_SAS_TOKEN"),
            }),
        }
    }

    pub async fn resolve(&self, http: &RestClient, needs: SecretNeeds) -> Result<Secrets, JobError> {
        match self {
            SecretSource::Env {
                database_url,
                blob_sas_token,
                fileshare_sas_token,
            } => {
                let take = |value: &Option<String>, env: &str, needed: bool| -> Result<Option<String>, JobError> {
                    match (present(value.clone()), needed) {
                        (Some(v), _) => Ok(Some(v)),
                        (None, true) => Err(missing(env, "not set")),
                        (None, false) => Ok(None),
                    }
                };
                let database_url = take(database_url, "DATABASE_URL", true)?.unwrap_or_default();
                Ok(Secrets {
                    database_url,
                    blob_sas_token: take(blob_sas_token, "BLOB_SAS_TOKEN", needs.blob)?,
                    fileshare_sas_token: take(
                        fileshare_sas_token,
                        "FILESHARE_SAS_TOKEN",
                        needs.fileshare,
                    )?,
                })
            }
            SecretSource::KeyVault(config) => {
                let vault = KeyVault::authenticate(http, config).await?;
                let database_url = vault.secret(DATABASE_SECRET).await?;
                let blob_sas_token = if needs.blob {
                    Some(vault.secret(BLOB_SAS_SECRET).await?)
                } else {
                    None
                };
                let fileshare_sas_token = if needs.fileshare {
                    Some(vault.secret(FILESHARE_SAS_SECRET).await?)
                } else {
                    None
                };
                info!(vault = %config.vault_url, "resolved credentials from key vault");
                Ok(Secrets {
                    database_url,
                    blob_sas_token,
                    fileshare_sas_token,
                })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SecretBundle {
    #[serde(default)]
    value: Option<String>,
}

struct KeyVault<'a> {
    http: &'a RestClient,
    vault_url: Url,
    access_token: String,
}

fn parse_url(name: &str, raw: &str) -> Result<Url, JobError> {
    Url::parse(raw).map_err(|e| missing(name, format!("invalid url {raw:?}: {e}")))
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    name: &str,
    resp: reqwest::Response,
) -> Result<T, JobError> {
    resp.json::<T>()
        .await
        .map_err(|e| missing(name, format!("unreadable response: {}", e.without_url())))
}

impl<'a> KeyVault<'a> {
    async fn authenticate(http: &'a RestClient, config: &KeyVaultConfig) -> Result<Self, JobError> {
        let token_url = parse_url(
            "AZURE_AUTHORITY_HOST",
            &format!(
                "{}/{}/oauth2/v2.0/token",
                config.authority_host.trim_end_matches('/'),
                config.tenant_id
            ),
        )?;
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
            ("scope", KEYVAULT_SCOPE),
        ];
        let resp = http
            .send("key vault token", &token_url, |c| {
                c.post(token_url.clone()).form(&form)
            })
            .await
            .map_err(|e| missing("AZURE_CLIENT_SECRET", e.to_string()))?;
        let token: TokenResponse = read_json("AZURE_CLIENT_SECRET", resp).await?;
        debug!("obtained key vault access token");

        Ok(Self {
            http,
            vault_url: parse_url("KEYVAULT_URL", &config.vault_url)?,
            access_token: token.access_token,
        })
    }

    async fn secret(&self, name: &str) -> Result<String, JobError> {
        let mut url = self.vault_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("secrets").push(name);
        }
        url.query_pairs_mut().append_pair("api-version", KEYVAULT_API_VERSION);

        let resp = self
            .http
            .send("key vault secret", &url, |c| {
                c.get(url.clone()).bearer_auth(&self.access_token)
            })
            .await
            .map_err(|e| match e {
                StorageError::NotFound { .. } => missing(name, "secret does not exist"),
                other => missing(name, other.to_string()),
            })?;
        let bundle: SecretBundle = read_json(name, resp).await?;
        present(bundle.value).ok_or_else(|| missing(name, "secret is empty"))
    }
}
