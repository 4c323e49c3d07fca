use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mfr_core::{AuditRecord, LocalFile, NormalizedTable, RemoteEntry};
use mfr_storage::{
    select_candidates, AzureEndpoint, BlobStorage, FileShareStorage, RestClient, StorageAdapter,
    StorageError,
};
use mfr_tabular::{is_duplicate, load_table, Normalized};
use mfr_warehouse::{MergeSummary, PgPool, PgWarehouse, Warehouse, WarehouseError};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::feeds::{FeedConfig, FeedRegistry, StorageKind, StorageRef};
use crate::secrets::{SecretNeeds, Secrets};
use crate::{JobConfig, JobError};

/// Per-feed counters for one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedReport {
    pub feed: String,
    pub storage: String,
    pub listed: usize,
    pub candidates: usize,
    pub processed: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub unreadable: usize,
    pub rows_staged: u64,
    pub merge: MergeSummary,
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feeds: Vec<FeedReport>,
    pub data_changed: bool,
}

/// Adapters keyed by the container or share they are bound to.
#[derive(Clone, Default)]
pub struct StorageRegistry {
    adapters: HashMap<StorageRef, Arc<dyn StorageAdapter>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, storage: StorageRef, adapter: Arc<dyn StorageAdapter>) {
        self.adapters.insert(storage, adapter);
    }

    pub fn get(&self, storage: &StorageRef) -> Option<Arc<dyn StorageAdapter>> {
        self.adapters.get(storage).cloned()
    }

    /// Build one Azure adapter per distinct storage reference among `feeds`.
    pub fn for_feeds<'a>(
        config: &JobConfig,
        secrets: &Secrets,
        http: Arc<RestClient>,
        feeds: impl IntoIterator<Item = &'a FeedConfig>,
    ) -> Result<Self, JobError> {
        let mut registry = Self::new();
        for feed in feeds {
            if registry.adapters.contains_key(&feed.storage) {
                continue;
            }
            let (endpoint, sas, endpoint_var) = match feed.storage.kind {
                StorageKind::Blob => (
                    config.blob_endpoint.as_deref(),
                    secrets.blob_sas_token.as_deref(),
                    "BLOB_ENDPOINT or BLOB_ACCOUNT",
                ),
                StorageKind::Fileshare => (
                    config.fileshare_endpoint.as_deref(),
                    secrets.fileshare_sas_token.as_deref(),
                    "FILESHARE_ENDPOINT or FILESHARE_ACCOUNT",
                ),
            };
            let endpoint = endpoint.ok_or_else(|| {
                JobError::Config(format!("feed {} needs {endpoint_var}", feed.name))
            })?;
            let endpoint = AzureEndpoint::new(endpoint, sas.unwrap_or_default()).map_err(|source| {
                JobError::Storage {
                    feed: feed.name.clone(),
                    source,
                }
            })?;
            let adapter: Arc<dyn StorageAdapter> = match feed.storage.kind {
                StorageKind::Blob => Arc::new(BlobStorage::new(
                    http.clone(),
                    endpoint,
                    feed.storage.container.clone(),
                    config.copy_poll_policy(),
                )),
                StorageKind::Fileshare => Arc::new(FileShareStorage::new(
                    http.clone(),
                    endpoint,
                    feed.storage.container.clone(),
                    config.copy_poll_policy(),
                )),
            };
            registry.insert(feed.storage.clone(), adapter);
        }
        Ok(registry)
    }
}

pub fn secret_needs<'a>(feeds: impl IntoIterator<Item = &'a FeedConfig>) -> SecretNeeds {
    feeds.into_iter().fold(SecretNeeds::default(), |mut needs, feed| {
        match feed.storage.kind {
            StorageKind::Blob => needs.blob = true,
            StorageKind::Fileshare => needs.fileshare = true,
        }
        needs
    })
}

fn storage_err(feed: &FeedConfig) -> impl FnOnce(StorageError) -> JobError + '_ {
    move |source| JobError::Storage {
        feed: feed.name.clone(),
        source,
    }
}

fn db_err(context: impl Into<String>) -> impl FnOnce(WarehouseError) -> JobError {
    let context = context.into();
    move |source| JobError::Database { context, source }
}

pub struct SyncPipeline {
    config: JobConfig,
    registry: FeedRegistry,
    storage: StorageRegistry,
    warehouse: Arc<dyn Warehouse>,
}

impl SyncPipeline {
    pub fn new(
        config: JobConfig,
        registry: FeedRegistry,
        storage: StorageRegistry,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            config,
            registry,
            storage,
            warehouse,
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Process every enabled feed in order, then signal the refresh if anything
    /// changed. Fails with [`JobError::NoNewData`] otherwise.
    pub async fn run_once(&self) -> Result<JobSummary, JobError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let run_dir = self.config.work_dir.join(run_id.to_string());
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(|source| JobError::Scratch {
                path: run_dir.clone(),
                source,
            })?;

        let span = info_span!("run", %run_id);
        let outcome = self.run_feeds(&run_dir).instrument(span).await;

        if let Err(err) = tokio::fs::remove_dir_all(&run_dir).await {
            warn!(path = %run_dir.display(), error = %err, "failed to remove run scratch directory");
        }

        let feeds = outcome?;
        let data_changed = feeds.iter().any(|f| f.changed);
        if !data_changed {
            warn!(%run_id, "no feed produced new data; refresh not signalled");
            return Err(JobError::NoNewData);
        }

        self.warehouse
            .signal_refresh(&self.config.refresh_feed)
            .await
            .map_err(db_err("refresh signal"))?;
        info!(%run_id, label = %self.config.refresh_feed, "refresh signalled");

        Ok(JobSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            feeds,
            data_changed,
        })
    }

    async fn run_feeds(&self, run_dir: &Path) -> Result<Vec<FeedReport>, JobError> {
        let mut reports = Vec::new();
        for feed in self.registry.enabled() {
            let adapter = self.storage.get(&feed.storage).ok_or_else(|| {
                JobError::Config(format!(
                    "feed {} references unregistered storage {}",
                    feed.name, feed.storage
                ))
            })?;
            let span = info_span!("feed", feed = %feed.name, storage = %adapter.label());
            let report = self
                .run_feed(feed, adapter.as_ref(), run_dir)
                .instrument(span)
                .await?;
            info!(
                feed = %report.feed,
                listed = report.listed,
                candidates = report.candidates,
                processed = report.processed,
                rejected = report.rejected,
                duplicates = report.duplicates,
                unreadable = report.unreadable,
                changed = report.changed,
                "feed finished"
            );
            reports.push(report);
        }
        Ok(reports)
    }

    async fn run_feed(
        &self,
        feed: &FeedConfig,
        adapter: &dyn StorageAdapter,
        run_dir: &Path,
    ) -> Result<FeedReport, JobError> {
        let mut report = FeedReport {
            feed: feed.name.clone(),
            storage: adapter.label(),
            ..FeedReport::default()
        };

        let listed = adapter
            .list(&feed.source_path)
            .await
            .map_err(storage_err(feed))?;
        report.listed = listed.len();
        let candidates = select_candidates(listed, &feed.exclude);
        report.candidates = candidates.len();
        if candidates.is_empty() {
            info!("no new files");
            return Ok(report);
        }

        let mut previous: Option<NormalizedTable> = None;
        for entry in &candidates {
            let span = info_span!("file", name = %entry.name);
            async {
                let local = adapter
                    .download(entry, run_dir)
                    .await
                    .map_err(storage_err(feed))?;
                let outcome = self
                    .process_file(feed, adapter, entry, &local, &mut previous, &mut report)
                    .await;
                if let Err(err) = tokio::fs::remove_file(&local.path).await {
                    warn!(path = %local.path.display(), error = %err, "failed to remove local copy");
                }
                outcome
            }
            .instrument(span)
            .await?;
        }
        Ok(report)
    }

    async fn process_file(
        &self,
        feed: &FeedConfig,
        adapter: &dyn StorageAdapter,
        entry: &RemoteEntry,
        local: &LocalFile,
        previous: &mut Option<NormalizedTable>,
        report: &mut FeedReport,
    ) -> Result<(), JobError> {
        let table = match load_table(&local.path) {
            Ok(table) => table,
            Err(err) => {
                warn!(error = %err, "file could not be read; skipping");
                report.unreadable += 1;
                return Ok(());
            }
        };

        let normalized = match feed.schema.normalize(table).map_err(|source| JobError::Schema {
            feed: feed.name.clone(),
            source,
        })? {
            Normalized::Accepted(table) => table,
            Normalized::Rejected(rejection) => {
                warn!(%rejection, "file does not match the feed schema; skipping");
                report.rejected += 1;
                return Ok(());
            }
        };

        if is_duplicate(previous.as_ref(), &normalized) {
            info!("identical to the previous file; skipping database write");
            report.duplicates += 1;
            return Ok(());
        }

        let db_context = || format!("feed {} file {}", feed.name, entry.name);
        report.rows_staged += self
            .warehouse
            .replace_staging(&feed.staging_table, &normalized)
            .await
            .map_err(db_err(db_context()))?;

        if let Some(target) = &feed.target {
            let summary = self
                .warehouse
                .merge(&feed.staging_table, &target.table, &target.rule)
                .await
                .map_err(db_err(db_context()))?;
            report.merge.absorb(summary);
        }
        report.changed = true;
        *previous = Some(normalized);

        if let Some(archive_path) = &feed.archive_path {
            adapter
                .archive(entry, archive_path)
                .await
                .map_err(storage_err(feed))?;
        }

        if let Some(source) = &feed.audit_source {
            self.warehouse
                .record_audit(&AuditRecord {
                    file_name: entry.name.clone(),
                    source: source.clone(),
                })
                .await
                .map_err(db_err(db_context()))?;
        }

        report.processed += 1;
        info!(sha256 = %local.sha256, bytes = local.byte_size, "file processed");
        Ok(())
    }

    /// Cron job that runs the pipeline, skipping a tick while a run is in flight.
    pub async fn build_scheduler(self: Arc<Self>) -> Result<JobScheduler, JobError> {
        let sched = JobScheduler::new()
            .await
            .map_err(|e| JobError::Scheduler(format!("creating scheduler: {e}")))?;
        let guard = Arc::new(tokio::sync::Mutex::new(()));
        let cron = self.config.schedule_cron.clone();
        let pipeline = self.clone();

        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = pipeline.clone();
            let guard = guard.clone();
            Box::pin(async move {
                let Ok(_running) = guard.try_lock() else {
                    warn!("previous run still in progress; skipping scheduled tick");
                    return;
                };
                match pipeline.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled run complete"),
                    Err(JobError::NoNewData) => info!("scheduled run found no new data"),
                    Err(err) => error!(error = %err, "scheduled run failed"),
                }
            })
        })
        .map_err(|e| JobError::Scheduler(format!("creating job for cron {cron}: {e}")))?;

        sched
            .add(job)
            .await
            .map_err(|e| JobError::Scheduler(format!("adding job: {e}")))?;
        Ok(sched)
    }
}

/// Resolve only the database credential and open a pool.
pub async fn connect_warehouse(config: &JobConfig) -> Result<PgPool, JobError> {
    let http = RestClient::new(config.http_client_config()).map_err(|source| JobError::Storage {
        feed: "credentials".to_string(),
        source,
    })?;
    let secrets = config.secrets.resolve(&http, SecretNeeds::default()).await?;
    mfr_warehouse::connect(&secrets.database_url, config.db_max_connections)
        .await
        .map_err(db_err("connecting to warehouse"))
}

pub async fn build_pipeline(config: JobConfig) -> Result<SyncPipeline, JobError> {
    let registry = FeedRegistry::load(&config.feeds_file).await?;
    let http = Arc::new(
        RestClient::new(config.http_client_config()).map_err(|source| JobError::Storage {
            feed: "http client".to_string(),
            source,
        })?,
    );
    let secrets = config
        .secrets
        .resolve(&http, secret_needs(registry.enabled()))
        .await?;
    let storage = StorageRegistry::for_feeds(&config, &secrets, http, registry.enabled())?;
    let pool = mfr_warehouse::connect(&secrets.database_url, config.db_max_connections)
        .await
        .map_err(db_err("connecting to warehouse"))?;
    let warehouse: Arc<dyn Warehouse> = Arc::new(PgWarehouse::new(pool));
    Ok(SyncPipeline::new(config, registry, storage, warehouse))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use mfr_storage::{archive_destination, write_local_file};
    use mfr_tabular::FeedSchema;
    use mfr_warehouse::{MergeRule, TableName};
    use std::sync::Mutex;

    use crate::feeds::TargetConfig;

    type CallLog = Arc<Mutex<Vec<String>>>;

    const GOOD_A: &str = "Metric Name,Period,Specialty/Trust,Numerator,Denominator\nA&E 4hr,01/04/2024,Trust A,812,1000\n";
    const GOOD_B: &str = "Metric Name,Period,Specialty/Trust,Numerator,Denominator\nA&E 4hr,01/05/2024,Trust A,790,1000\n";
    const MISSING_COLUMNS: &str = "Metric Name,Period\nA&E 4hr,01/04/2024\n";

    fn entry(path: &str, minute: u32) -> RemoteEntry {
        let ts = Utc
            .with_ymd_and_hms(2024, 4, 1, 9, minute, 0)
            .single()
            .unwrap();
        RemoteEntry::new(path, ts, None)
    }

    struct FakeStorage {
        files: Vec<(RemoteEntry, &'static str)>,
        fail_archive: bool,
        calls: CallLog,
    }

    #[async_trait]
    impl StorageAdapter for FakeStorage {
        fn label(&self) -> String {
            "fake:qvh".to_string()
        }

        async fn list(&self, source: &str) -> Result<Vec<RemoteEntry>, StorageError> {
            self.calls.lock().unwrap().push(format!("list {source}"));
            Ok(self.files.iter().map(|(e, _)| e.clone()).collect())
        }

        async fn download(
            &self,
            entry: &RemoteEntry,
            destination_dir: &Path,
        ) -> Result<LocalFile, StorageError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("download {}", entry.path));
            let body = self
                .files
                .iter()
                .find(|(e, _)| e.path == entry.path)
                .map(|(_, body)| *body)
                .ok_or_else(|| StorageError::NotFound {
                    url: entry.path.clone(),
                })?;
            write_local_file(destination_dir, &entry.name, body.as_bytes()).await
        }

        async fn archive(&self, entry: &RemoteEntry, archive_dir: &str) -> Result<(), StorageError> {
            let destination = archive_destination(archive_dir, &entry.name);
            self.calls
                .lock()
                .unwrap()
                .push(format!("archive {} -> {destination}", entry.path));
            if self.fail_archive {
                return Err(StorageError::Archive {
                    source_path: entry.path.clone(),
                    destination,
                    status: "failed".to_string(),
                });
            }
            Ok(())
        }
    }

    struct FakeWarehouse {
        calls: CallLog,
        fail_merge: bool,
        fail_audit: bool,
    }

    #[async_trait]
    impl Warehouse for FakeWarehouse {
        async fn replace_staging(
            &self,
            table: &TableName,
            data: &NormalizedTable,
        ) -> Result<u64, WarehouseError> {
            let source = data
                .cell(0, mfr_core::PROVENANCE_COLUMN)
                .map(|c| c.to_string())
                .unwrap_or_default();
            self.calls
                .lock()
                .unwrap()
                .push(format!("stage {table} {source}"));
            Ok(data.row_count() as u64)
        }

        async fn merge(
            &self,
            staging: &TableName,
            target: &TableName,
            _rule: &MergeRule,
        ) -> Result<MergeSummary, WarehouseError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("merge {staging} -> {target}"));
            if self.fail_merge {
                return Err(WarehouseError::InvalidMeasure {
                    column: "Numerator".to_string(),
                    value: "n/a".to_string(),
                });
            }
            Ok(MergeSummary {
                inserted: 1,
                ..MergeSummary::default()
            })
        }

        async fn record_audit(&self, record: &AuditRecord) -> Result<(), WarehouseError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("audit {} {}", record.file_name, record.source));
            if self.fail_audit {
                return Err(WarehouseError::InvalidTableName(
                    "metric_file_log".to_string(),
                ));
            }
            Ok(())
        }

        async fn signal_refresh(&self, label: &str) -> Result<(), WarehouseError> {
            self.calls.lock().unwrap().push(format!("refresh {label}"));
            Ok(())
        }
    }

    fn generic_feed() -> FeedConfig {
        FeedConfig {
            name: "blob-generic".to_string(),
            enabled: true,
            storage: StorageRef {
                kind: StorageKind::Blob,
                container: "qvh".to_string(),
            },
            source_path: "home/IQPR".to_string(),
            exclude: vec!["Processed".to_string()],
            schema: FeedSchema::generic_metrics(),
            staging_table: TableName::parse("staging.metrics_generic").unwrap(),
            target: Some(TargetConfig {
                table: TableName::parse("scd.metric").unwrap(),
                rule: MergeRule::default(),
            }),
            archive_path: Some("home/IQPR/Processed".to_string()),
            audit_source: Some("SFTP".to_string()),
        }
    }

    struct Harness {
        pipeline: SyncPipeline,
        calls: CallLog,
        _work: tempfile::TempDir,
    }

    #[derive(Default)]
    struct Faults {
        archive: bool,
        merge: bool,
        audit: bool,
    }

    fn harness(
        feeds: Vec<FeedConfig>,
        files: Vec<(RemoteEntry, &'static str)>,
        faults: Faults,
    ) -> Harness {
        let calls: CallLog = Arc::default();
        let work = tempfile::tempdir().unwrap();
        let config = JobConfig {
            work_dir: work.path().to_path_buf(),
            ..JobConfig::default()
        };
        let mut storage = StorageRegistry::new();
        for feed in &feeds {
            storage.insert(
                feed.storage.clone(),
                Arc::new(FakeStorage {
                    files: files.clone(),
                    fail_archive: faults.archive,
                    calls: calls.clone(),
                }),
            );
        }
        let warehouse = Arc::new(FakeWarehouse {
            calls: calls.clone(),
            fail_merge: faults.merge,
            fail_audit: faults.audit,
        });
        Harness {
            pipeline: SyncPipeline::new(config, FeedRegistry { feeds }, storage, warehouse),
            calls,
            _work: work,
        }
    }

    fn recorded(calls: &CallLog) -> Vec<String> {
        calls.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn happy_path_runs_every_step_in_order_oldest_first() {
        let h = harness(
            vec![generic_feed()],
            vec![
                (entry("home/IQPR/b.csv", 5), GOOD_B),
                (entry("home/IQPR/Processed/old.csv", 0), GOOD_A),
                (entry("home/IQPR/notes.txt", 1), GOOD_A),
                (entry("home/IQPR/a.csv", 2), GOOD_A),
            ],
            Faults::default(),
        );

        let summary = h.pipeline.run_once().await.unwrap();
        assert!(summary.data_changed);
        assert_eq!(
            recorded(&h.calls),
            vec![
                "list home/IQPR",
                "download home/IQPR/a.csv",
                "stage staging.metrics_generic a.csv",
                "merge staging.metrics_generic -> scd.metric",
                "archive home/IQPR/a.csv -> home/IQPR/Processed/a.csv",
                "audit a.csv SFTP",
                "download home/IQPR/b.csv",
                "stage staging.metrics_generic b.csv",
                "merge staging.metrics_generic -> scd.metric",
                "archive home/IQPR/b.csv -> home/IQPR/Processed/b.csv",
                "audit b.csv SFTP",
                "refresh Data",
            ]
        );

        let report = &summary.feeds[0];
        assert_eq!((report.listed, report.candidates, report.processed), (4, 2, 2));
        assert_eq!(report.merge.inserted, 2);
    }

    #[tokio::test]
    async fn rejected_file_has_no_side_effects() {
        let h = harness(
            vec![generic_feed()],
            vec![
                (entry("home/IQPR/bad.csv", 1), MISSING_COLUMNS),
                (entry("home/IQPR/good.csv", 2), GOOD_A),
            ],
            Faults::default(),
        );

        let summary = h.pipeline.run_once().await.unwrap();
        let calls = recorded(&h.calls);
        assert!(calls.iter().all(|c| !c.contains("bad.csv") || c.starts_with("download")));
        assert!(calls.contains(&"audit good.csv SFTP".to_string()));
        assert_eq!(summary.feeds[0].rejected, 1);
    }

    #[tokio::test]
    async fn identical_consecutive_file_skips_staging() {
        let h = harness(
            vec![generic_feed()],
            vec![
                (entry("home/IQPR/jan/metrics.csv", 1), GOOD_A),
                (entry("home/IQPR/feb/metrics.csv", 2), GOOD_A),
            ],
            Faults::default(),
        );

        let summary = h.pipeline.run_once().await.unwrap();
        let calls = recorded(&h.calls);
        assert_eq!(calls.iter().filter(|c| c.starts_with("stage")).count(), 1);
        assert_eq!(calls.iter().filter(|c| c.starts_with("archive")).count(), 1);
        assert!(!calls.iter().any(|c| c.contains("feb") && c.starts_with("archive")));
        assert_eq!(summary.feeds[0].duplicates, 1);
    }

    #[tokio::test]
    async fn database_error_aborts_before_archive() {
        let h = harness(
            vec![generic_feed()],
            vec![
                (entry("home/IQPR/a.csv", 1), GOOD_A),
                (entry("home/IQPR/b.csv", 2), GOOD_B),
            ],
            Faults {
                merge: true,
                ..Faults::default()
            },
        );

        let err = h.pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, JobError::Database { .. }), "{err}");
        let calls = recorded(&h.calls);
        assert!(!calls.iter().any(|c| c.starts_with("archive") || c.starts_with("audit")));
        assert!(!calls.iter().any(|c| c.contains("b.csv")));
        assert!(!calls.iter().any(|c| c.starts_with("refresh")));
    }

    #[tokio::test]
    async fn archive_failure_is_fatal_and_skips_the_audit_entry() {
        let h = harness(
            vec![generic_feed()],
            vec![(entry("home/IQPR/a.csv", 1), GOOD_A)],
            Faults {
                archive: true,
                ..Faults::default()
            },
        );

        let err = h.pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, JobError::Storage { ref source, .. } if source.is_archive_failure()));
        assert!(!recorded(&h.calls).iter().any(|c| c.starts_with("audit")));
    }

    #[tokio::test]
    async fn audit_failure_after_merge_is_fatal_and_sends_no_refresh() {
        let h = harness(
            vec![generic_feed()],
            vec![
                (entry("home/IQPR/a.csv", 1), GOOD_A),
                (entry("home/IQPR/b.csv", 2), GOOD_B),
            ],
            Faults {
                audit: true,
                ..Faults::default()
            },
        );

        let err = h.pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, JobError::Database { .. }), "{err}");
        assert_eq!(
            recorded(&h.calls),
            vec![
                "list home/IQPR",
                "download home/IQPR/a.csv",
                "stage staging.metrics_generic a.csv",
                "merge staging.metrics_generic -> scd.metric",
                "archive home/IQPR/a.csv -> home/IQPR/Processed/a.csv",
                "audit a.csv SFTP",
            ]
        );
    }

    #[tokio::test]
    async fn no_candidates_fails_with_no_new_data_and_no_refresh() {
        let h = harness(
            vec![generic_feed()],
            vec![(entry("home/IQPR/Processed/a.csv", 1), GOOD_A)],
            Faults::default(),
        );

        let err = h.pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, JobError::NoNewData));
        assert_eq!(recorded(&h.calls), vec!["list home/IQPR"]);
    }

    #[tokio::test]
    async fn staging_only_feed_skips_merge_archive_and_audit() {
        let feed = FeedConfig {
            name: "elective-recovery".to_string(),
            storage: StorageRef {
                kind: StorageKind::Fileshare,
                container: "qvh".to_string(),
            },
            source_path: "Uploads/IQPR/ElectiveRecovery".to_string(),
            exclude: Vec::new(),
            schema: FeedSchema {
                passthrough: true,
                ..FeedSchema::default()
            },
            staging_table: TableName::parse("staging.metrics_elective_recovery").unwrap(),
            target: None,
            archive_path: None,
            audit_source: None,
            ..generic_feed()
        };
        let h = harness(
            vec![feed],
            vec![(entry("Uploads/IQPR/ElectiveRecovery/er_2024_04.csv", 1), MISSING_COLUMNS)],
            Faults::default(),
        );

        let summary = h.pipeline.run_once().await.unwrap();
        assert_eq!(
            recorded(&h.calls),
            vec![
                "list Uploads/IQPR/ElectiveRecovery",
                "download Uploads/IQPR/ElectiveRecovery/er_2024_04.csv",
                "stage staging.metrics_elective_recovery er_2024_04.csv",
                "refresh Data",
            ]
        );
        assert_eq!(summary.feeds[0].processed, 1);
    }

    #[tokio::test]
    async fn scratch_directory_is_removed_after_the_run() {
        let h = harness(
            vec![generic_feed()],
            vec![(entry("home/IQPR/a.csv", 1), GOOD_A)],
            Faults::default(),
        );
        let summary = h.pipeline.run_once().await.unwrap();
        let run_dir = h.pipeline.config().work_dir.join(summary.run_id.to_string());
        assert!(!run_dir.exists());
    }

    #[tokio::test]
    async fn warehouse_credentials_come_from_the_job_config() {
        let err = connect_warehouse(&JobConfig::default()).await.unwrap_err();
        assert!(
            matches!(err, JobError::Credential { ref name, .. } if name == "DATABASE_URL"),
            "{err}"
        );
    }

    #[test]
    fn secret_needs_follow_enabled_feed_kinds() {
        let feeds = [generic_feed()];
        let needs = secret_needs(feeds.iter());
        assert!(needs.blob && !needs.fileshare);
    }

    #[test]
    fn storage_registry_requires_an_endpoint() {
        let http = Arc::new(RestClient::new(Default::default()).unwrap());
        let err = StorageRegistry::for_feeds(
            &JobConfig::default(),
            &Secrets::default(),
            http.clone(),
            [generic_feed()].iter(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, JobError::Config(_)));

        let config = JobConfig {
            blob_endpoint: Some("https://acct.blob.core.windows.net".to_string()),
            ..JobConfig::default()
        };
        let registry =
            StorageRegistry::for_feeds(&config, &Secrets::default(), http, [generic_feed()].iter())
                .unwrap();
        assert_eq!(registry.get(&generic_feed().storage).unwrap().label(), "blob:qvh");
    }
}
