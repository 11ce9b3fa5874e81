//! External collaborators for the pipeline: the Postgres warehouse and the
//! CSV source dataset.
//!
//! Both expose narrow interfaces. The warehouse offers relation-level
//! operations (truncate, bulk append, execute, typed fetches) and classifies
//! its failures into a retry disposition; connection pooling is entirely its
//! concern. The source dataset offers only a `locate` probe.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::postgres::{PgPoolCopyExt, PgPoolOptions};
use sqlx::{Executor, PgPool};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "mvw-storage";

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Infrastructure-level faults (lost connections, pool exhaustion) are
/// retryable; anything the database rejected on its merits is not.
pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("sql failure: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("reading bulk-load source: {0}")]
    Io(#[from] std::io::Error),
}

impl WarehouseError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Sql(err) => classify_sqlx_error(err),
            // An unreadable source file is bad input, not a hiccup.
            Self::Io(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// Relation-level warehouse operations used by pipeline steps.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Run one or more semicolon-separated statements; returns rows affected
    /// by the last one.
    async fn execute(&self, sql: &str) -> Result<u64, WarehouseError>;

    async fn truncate(&self, relation: &str) -> Result<(), WarehouseError>;

    /// Stream a CSV file into a relation via `COPY ... FROM STDIN`.
    async fn bulk_append_csv(
        &self,
        copy_statement: &str,
        source: &Path,
    ) -> Result<u64, WarehouseError>;

    /// Fetch a single bigint scalar (quality predicates, counts).
    async fn fetch_i64(&self, sql: &str) -> Result<i64, WarehouseError>;

    /// Fetch at most one (ticker, value) row (the reporter's query).
    async fn fetch_ticker_stat(&self, sql: &str)
        -> Result<Option<(String, f64)>, WarehouseError>;
}

/// sqlx-backed Postgres warehouse. Owns the connection pool.
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(database_url: &str) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn execute(&self, sql: &str) -> Result<u64, WarehouseError> {
        debug!(sql, "warehouse execute");
        // Raw &str goes over the simple query protocol, so multi-statement
        // DDL blocks work as a unit.
        let done = self.pool.execute(sql).await?;
        Ok(done.rows_affected())
    }

    async fn truncate(&self, relation: &str) -> Result<(), WarehouseError> {
        debug!(relation, "warehouse truncate");
        self.pool
            .execute(format!("TRUNCATE TABLE {relation};").as_str())
            .await?;
        Ok(())
    }

    async fn bulk_append_csv(
        &self,
        copy_statement: &str,
        source: &Path,
    ) -> Result<u64, WarehouseError> {
        debug!(sql = copy_statement, source = %source.display(), "warehouse bulk append");
        let file = tokio::fs::File::open(source).await?;
        let mut copy = self.pool.copy_in_raw(copy_statement).await?;
        if let Err(err) = copy.read_from(file).await {
            // Abort the COPY so the connection returns to the pool clean.
            let _ = copy.abort("bulk append failed").await;
            return Err(err.into());
        }
        let rows = copy.finish().await?;
        Ok(rows)
    }

    async fn fetch_i64(&self, sql: &str) -> Result<i64, WarehouseError> {
        let (value,): (i64,) = sqlx::query_as(sql).fetch_one(&self.pool).await?;
        Ok(value)
    }

    async fn fetch_ticker_stat(
        &self,
        sql: &str,
    ) -> Result<Option<(String, f64)>, WarehouseError> {
        let row: Option<(String, f64)> = sqlx::query_as(sql).fetch_optional(&self.pool).await?;
        Ok(row)
    }
}

/// Idempotent DDL for the persisted state layout. Every statement is
/// create-if-absent so steps and the `migrate` command can run repeatedly.
pub mod schema {
    pub const CREATE_STAGING: &str = "\
        CREATE TABLE IF NOT EXISTS staging (
            date DATE,
            symbol VARCHAR(10),
            open NUMERIC,
            high NUMERIC,
            low NUMERIC,
            close NUMERIC,
            volume BIGINT
        );";

    pub const CREATE_DIMENSIONS: &str = "\
        CREATE TABLE IF NOT EXISTS dim_instrumento (
            ticker VARCHAR(10) PRIMARY KEY,
            nome_ativo VARCHAR(50),
            tipo_ativo VARCHAR(20)
        );
        CREATE TABLE IF NOT EXISTS dim_tempo (
            data_id DATE PRIMARY KEY,
            ano INT,
            mes INT,
            dia_da_semana INT
        );";

    pub const CREATE_FACT: &str = "\
        CREATE TABLE IF NOT EXISTS fact_movimentacao_diaria (
            id SERIAL PRIMARY KEY,
            ticker VARCHAR(10) REFERENCES dim_instrumento(ticker),
            data_id DATE REFERENCES dim_tempo(data_id),
            open NUMERIC,
            high NUMERIC,
            low NUMERIC,
            close NUMERIC,
            volume BIGINT,
            variacao_diaria NUMERIC
        );";

    pub const CREATE_VOLATILITY_VIEW: &str = "\
        CREATE MATERIALIZED VIEW IF NOT EXISTS volatility_weekly AS
        SELECT ticker,
               DATE_TRUNC('week', data_id) AS week,
               STDDEV_SAMP(variacao_diaria) AS vol
        FROM fact_movimentacao_diaria
        WHERE variacao_diaria IS NOT NULL
        GROUP BY ticker, DATE_TRUNC('week', data_id);";

    pub const ALL: &[&str] = &[
        CREATE_STAGING,
        CREATE_DIMENSIONS,
        CREATE_FACT,
        CREATE_VOLATILITY_VIEW,
    ];
}

/// Apply the full schema, create-if-absent.
pub async fn migrate(warehouse: &dyn Warehouse) -> Result<(), WarehouseError> {
    for statement in schema::ALL {
        warehouse.execute(statement).await?;
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source dataset not found at {0}")]
    NotFound(PathBuf),
    #[error("reading source dataset {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Handle to a located source file, carrying the counted number of data rows
/// so the quality gate can be parameterized per dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceHandle {
    pub path: PathBuf,
    pub data_rows: i64,
}

/// CSV source-dataset collaborator. Absence of the file is fatal to a run;
/// there is no retry that produces a file.
#[derive(Debug, Clone)]
pub struct CsvSource {
    path: PathBuf,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn locate(&self) -> Result<SourceHandle, SourceError> {
        if !self.path.exists() {
            return Err(SourceError::NotFound(self.path.clone()));
        }
        let data_rows = count_data_rows(&self.path).map_err(|source| SourceError::Unreadable {
            path: self.path.clone(),
            source,
        })?;
        Ok(SourceHandle {
            path: self.path.clone(),
            data_rows,
        })
    }
}

/// Count data lines in a headered CSV (header excluded, blank lines ignored).
fn count_data_rows(path: &Path) -> std::io::Result<i64> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = 0i64;
    for line in reader.lines() {
        if !line?.trim().is_empty() {
            lines += 1;
        }
    }
    Ok((lines - 1).max(0))
}
