//! Postgres side of the job: staging replacement, the metric merge, the
//! processed-file log and the downstream refresh marker.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use mfr_core::{AuditRecord, ChangeType, NormalizedTable, PROVENANCE_COLUMN};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::{debug, info, warn};

mod plan;

pub use sqlx::PgPool;

pub use plan::{plan_merge, MergeAction, MergePlan, MergeSummary, MetricKey, SourceRow, TargetRow};

pub const CRATE_NAME: &str = "mfr-warehouse";

/// Postgres caps bind parameters per statement at 65535.
const MAX_BIND_PARAMS: usize = 60_000;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("database {operation} failed: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid table name {0:?}; expected schema.table with [A-Za-z0-9_] parts")]
    InvalidTableName(String),
    #[error("staged {column} value {value:?} is not numeric")]
    InvalidMeasure { column: String, value: String },
    #[error("staged period {0:?} is not a date")]
    InvalidPeriod(String),
}

fn db(operation: &'static str) -> impl FnOnce(sqlx::Error) -> WarehouseError {
    move |source| WarehouseError::Database { operation, source }
}

/// Double-quote a single identifier for interpolation into SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A validated `schema.table` reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    pub fn parse(raw: &str) -> Result<Self, WarehouseError> {
        let invalid = || WarehouseError::InvalidTableName(raw.to_string());
        let (schema, table) = raw.split_once('.').ok_or_else(invalid)?;
        let valid = |part: &str| {
            !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        };
        if !valid(schema) || !valid(table) {
            return Err(invalid());
        }
        Ok(Self {
            schema: schema.to_string(),
            table: table.to_string(),
        })
    }

    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

impl TryFrom<String> for TableName {
    type Error = WarehouseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.to_string()
    }
}

fn default_measure_table() -> TableName {
    TableName {
        schema: "scd".to_string(),
        table: "measure".to_string(),
    }
}

/// Staging column names the merge reads, plus the measure dimension to join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeRule {
    pub measure_table: TableName,
    pub metric_column: String,
    pub period_column: String,
    pub dim_column: String,
    pub numerator_column: String,
    pub denominator_column: String,
    pub provenance_column: String,
}

impl Default for MergeRule {
    fn default() -> Self {
        Self {
            measure_table: default_measure_table(),
            metric_column: "Metric Name".to_string(),
            period_column: "Period".to_string(),
            dim_column: "Specialty/Trust".to_string(),
            numerator_column: "Numerator".to_string(),
            denominator_column: "Denominator".to_string(),
            provenance_column: PROVENANCE_COLUMN.to_string(),
        }
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Replace `table` with exactly the rows of `data`. Returns rows written.
    async fn replace_staging(
        &self,
        table: &TableName,
        data: &NormalizedTable,
    ) -> Result<u64, WarehouseError>;

    async fn merge(
        &self,
        staging: &TableName,
        target: &TableName,
        rule: &MergeRule,
    ) -> Result<MergeSummary, WarehouseError>;

    async fn record_audit(&self, record: &AuditRecord) -> Result<(), WarehouseError>;

    async fn signal_refresh(&self, label: &str) -> Result<(), WarehouseError>;
}

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, WarehouseError> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
        .map_err(db("connect"))
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), WarehouseError> {
    info!("applying warehouse migrations");
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Rows per INSERT so one statement stays under the bind limit.
fn staging_chunk_rows(columns: usize) -> usize {
    (MAX_BIND_PARAMS / columns.max(1)).max(1)
}

fn parse_measure(column: &str, raw: Option<String>) -> Result<Option<f64>, WarehouseError> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => text
            .parse::<f64>()
            .map(Some)
            .map_err(|_| WarehouseError::InvalidMeasure {
                column: column.to_string(),
                value: text.to_string(),
            }),
    }
}

fn parse_period(raw: &str) -> Result<NaiveDate, WarehouseError> {
    let text = raw.trim();
    ["%d-%m-%Y", "%Y-%m-%d", "%d/%m/%Y"]
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(text, f).ok())
        .ok_or_else(|| WarehouseError::InvalidPeriod(raw.to_string()))
}

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
    audit_table: TableName,
    refresh_table: TableName,
}

impl PgWarehouse {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            audit_table: TableName {
                schema: "scd".to_string(),
                table: "metric_file_log".to_string(),
            },
            refresh_table: TableName {
                schema: "scd".to_string(),
                table: "refresh_times".to_string(),
            },
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn replace_staging(
        &self,
        table: &TableName,
        data: &NormalizedTable,
    ) -> Result<u64, WarehouseError> {
        let qualified = table.quoted();
        let column_list = data
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let column_defs = data
            .columns
            .iter()
            .map(|c| format!("{} TEXT", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");

        let mut tx = self.pool.begin().await.map_err(db("begin staging"))?;

        sqlx::query(&format!("DROP TABLE IF EXISTS {qualified}"))
            .execute(&mut *tx)
            .await
            .map_err(db("drop staging"))?;
        sqlx::query(&format!("CREATE TABLE {qualified} ({column_defs})"))
            .execute(&mut *tx)
            .await
            .map_err(db("create staging"))?;

        let mut written = 0u64;
        for chunk in data.rows.chunks(staging_chunk_rows(data.columns.len())) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {qualified} ({column_list}) "));
            builder.push_values(chunk, |mut b, row| {
                for idx in 0..data.columns.len() {
                    b.push_bind(row.get(idx).and_then(|c| c.as_text()));
                }
            });
            written += builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(db("insert staging"))?
                .rows_affected();
        }

        tx.commit().await.map_err(db("commit staging"))?;
        debug!(table = %table, rows = written, "replaced staging table");
        Ok(written)
    }

    async fn merge(
        &self,
        staging: &TableName,
        target: &TableName,
        rule: &MergeRule,
    ) -> Result<MergeSummary, WarehouseError> {
        let metric = quote_ident(&rule.metric_column);
        let period = quote_ident(&rule.period_column);
        let dim = quote_ident(&rule.dim_column);
        let numerator = quote_ident(&rule.numerator_column);
        let denominator = quote_ident(&rule.denominator_column);
        let provenance = quote_ident(&rule.provenance_column);
        let staging_q = staging.quoted();
        let target_q = target.quoted();

        let mut tx = self.pool.begin().await.map_err(db("begin merge"))?;

        let staged_total: i64 = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {staging_q}"))
            .fetch_one(&mut *tx)
            .await
            .map_err(db("count staging"))?
            .try_get("n")
            .map_err(db("count staging"))?;

        let staged = sqlx::query(&format!(
            r#"
            SELECT m.measure_id,
                   s.{period} AS period,
                   COALESCE(s.{dim}, '') AS dim1,
                   s.{numerator} AS numerator,
                   s.{denominator} AS denominator,
                   COALESCE(s.{provenance}, '') AS source_file
              FROM {staging_q} s
              JOIN {measure} m ON m.measure_description = s.{metric}
             WHERE COALESCE(btrim(s.{numerator}), '') <> ''
               AND COALESCE(btrim(s.{period}), '') <> ''
            "#,
            measure = rule.measure_table.quoted(),
        ))
        .fetch_all(&mut *tx)
        .await
        .map_err(db("read staging"))?;

        let mut source = Vec::with_capacity(staged.len());
        for row in &staged {
            let period_raw: String = row.try_get("period").map_err(db("read staging"))?;
            let key = MetricKey {
                measure_id: row.try_get("measure_id").map_err(db("read staging"))?,
                period: parse_period(&period_raw)?,
                dim1: row.try_get("dim1").map_err(db("read staging"))?,
            };
            source.push(SourceRow {
                key,
                numerator: parse_measure(
                    &rule.numerator_column,
                    row.try_get("numerator").map_err(db("read staging"))?,
                )?,
                denominator: parse_measure(
                    &rule.denominator_column,
                    row.try_get("denominator").map_err(db("read staging"))?,
                )?,
                source_file: row.try_get("source_file").map_err(db("read staging"))?,
            });
        }

        let mut measure_ids = source.iter().map(|r| r.key.measure_id).collect::<Vec<_>>();
        measure_ids.sort_unstable();
        measure_ids.dedup();

        let existing = sqlx::query(&format!(
            r#"
            SELECT measure_id, period, dim1, numerator, denominator
              FROM {target_q}
             WHERE measure_id = ANY($1)
               FOR UPDATE
            "#
        ))
        .bind(&measure_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(db("read target"))?
        .iter()
        .map(|row| -> Result<TargetRow, sqlx::Error> {
            Ok(TargetRow {
                key: MetricKey {
                    measure_id: row.try_get("measure_id")?,
                    period: row.try_get("period")?,
                    dim1: row.try_get("dim1")?,
                },
                numerator: row.try_get("numerator")?,
                denominator: row.try_get("denominator")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(db("read target"))?;

        let plan = plan_merge(source, &existing);

        let update_sql = format!(
            r#"
            UPDATE {target_q}
               SET numerator = $4,
                   denominator = $5,
                   updated_by = $6,
                   update_dttm = now(),
                   update_type = $7
             WHERE measure_id = $1 AND period = $2 AND dim1 = $3
            "#
        );
        let insert_sql = format!(
            r#"
            INSERT INTO {target_q}
                (measure_id, period, dim1, numerator, denominator, updated_by, update_dttm, update_type)
            VALUES ($1, $2, $3, $4, $5, $6, now(), $7)
            "#
        );

        for action in plan.writes() {
            let sql = match action.change {
                ChangeType::Updated => &update_sql,
                _ => &insert_sql,
            };
            let row = &action.row;
            sqlx::query(sql)
                .bind(row.key.measure_id)
                .bind(row.key.period)
                .bind(&row.key.dim1)
                .bind(row.numerator)
                .bind(row.denominator)
                .bind(&row.source_file)
                .bind(action.change.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db("write target"))?;
        }

        tx.commit().await.map_err(db("commit merge"))?;

        let mut summary = plan.summary();
        summary.skipped = usize::try_from(staged_total)
            .unwrap_or_default()
            .saturating_sub(staged.len());
        info!(
            staging = %staging,
            target = %target,
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            skipped = summary.skipped,
            "merged staging into target"
        );
        Ok(summary)
    }

    async fn record_audit(&self, record: &AuditRecord) -> Result<(), WarehouseError> {
        sqlx::query(&format!(
            "INSERT INTO {} (file_name, source, date_uploaded) VALUES ($1, $2, now())",
            self.audit_table.quoted()
        ))
        .bind(&record.file_name)
        .bind(&record.source)
        .execute(&self.pool)
        .await
        .map_err(db("record audit"))?;
        Ok(())
    }

    async fn signal_refresh(&self, label: &str) -> Result<(), WarehouseError> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET update_dttm = now() WHERE feed = $1",
            self.refresh_table.quoted()
        ))
        .bind(label)
        .execute(&self.pool)
        .await
        .map_err(db("signal refresh"))?;
        if result.rows_affected() == 0 {
            warn!(feed = label, "refresh marker row not found; nothing updated");
        }
        Ok(())
    }
}
