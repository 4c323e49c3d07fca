use std::collections::HashSet;
use std::path::Path;

use mfr_tabular::FeedSchema;
use mfr_warehouse::{MergeRule, TableName};
use serde::{Deserialize, Serialize};

use crate::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Blob,
    Fileshare,
}

/// A container (blob) or share (file storage) within the configured account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageRef {
    pub kind: StorageKind,
    pub container: String,
}

impl std::fmt::Display for StorageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            StorageKind::Blob => "blob",
            StorageKind::Fileshare => "fileshare",
        };
        write!(f, "{kind}:{}", self.container)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub table: TableName,
    #[serde(default)]
    pub rule: MergeRule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub storage: StorageRef,
    /// Blob prefix or share directory to list.
    pub source_path: String,
    #[serde(default)]
    pub exclude: Vec<String>,
    pub schema: FeedSchema,
    pub staging_table: TableName,
    #[serde(default)]
    pub target: Option<TargetConfig>,
    #[serde(default)]
    pub archive_path: Option<String>,
    /// Source label written to the processed-file log; no log entry when unset.
    #[serde(default)]
    pub audit_source: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedRegistry {
    pub feeds: Vec<FeedConfig>,
}

impl FeedRegistry {
    pub fn from_yaml(text: &str) -> Result<Self, JobError> {
        let registry: Self = serde_yaml::from_str(text)
            .map_err(|e| JobError::Config(format!("parsing feed registry: {e}")))?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self, JobError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| JobError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    fn validate(&self) -> Result<(), JobError> {
        let mut names = HashSet::new();
        for feed in &self.feeds {
            if !names.insert(feed.name.as_str()) {
                return Err(JobError::Config(format!("duplicate feed name {:?}", feed.name)));
            }
            feed.schema.validate().map_err(|source| JobError::Schema {
                feed: feed.name.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &FeedConfig> {
        self.feeds.iter().filter(|f| f.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
feeds:
  - name: blob-generic
    storage: { kind: blob, container: qvh }
    source_path: home/IQPR
    exclude: [Processed]
    schema:
      required: [Metric Name, Period]
      columns: [Metric Name, Period, SourceFile]
    staging_table: staging.metrics_generic
    target:
      table: scd.metric
    archive_path: home/IQPR/Processed
    audit_source: SFTP
  - name: elective-recovery
    enabled: false
    storage: { kind: fileshare, container: qvh }
    source_path: Uploads/IQPR/ElectiveRecovery
    schema: { passthrough: true }
    staging_table: staging.metrics_elective_recovery
"#;

    #[test]
    fn registry_parses_optional_sections() {
        let registry = FeedRegistry::from_yaml(REGISTRY).unwrap();
        assert_eq!(registry.feeds.len(), 2);

        let generic = &registry.feeds[0];
        assert!(generic.enabled);
        assert_eq!(generic.storage.to_string(), "blob:qvh");
        assert_eq!(generic.target.as_ref().unwrap().rule, MergeRule::default());
        assert_eq!(generic.audit_source.as_deref(), Some("SFTP"));

        let elective = &registry.feeds[1];
        assert!(elective.target.is_none() && elective.archive_path.is_none());
        assert_eq!(registry.enabled().count(), 1);
    }

    #[test]
    fn duplicate_feed_names_are_rejected() {
        let doubled = format!(
            "{REGISTRY}  - name: blob-generic\n    storage: {{ kind: blob, container: x }}\n    source_path: x\n    schema: {{ passthrough: true }}\n    staging_table: staging.x\n"
        );
        assert!(matches!(
            FeedRegistry::from_yaml(&doubled),
            Err(JobError::Config(_))
        ));
    }

    #[test]
    fn invalid_schema_fails_registry_load() {
        let bad = REGISTRY.replace(
            "columns: [Metric Name, Period, SourceFile]",
            "select: [Metric Name]\n      columns: [Metric Name, Period]",
        );
        assert!(matches!(
            FeedRegistry::from_yaml(&bad),
            Err(JobError::Schema { .. })
        ));
    }

    #[test]
    fn bad_table_names_fail_registry_load() {
        let bad = REGISTRY.replace("staging.metrics_generic", "metrics_generic");
        assert!(matches!(FeedRegistry::from_yaml(&bad), Err(JobError::Config(_))));
    }
}
