use std::path::Path;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use duckdb::Connection;

use crate::error::{QueryError, QueryResult};
use crate::model::{Batch, Column, ASSET_COLUMN, SENSOR_COLUMN, TIME_COLUMN};

/// Older column name for `asset_id`, normalized away on read (spec §3).
const DAQID_COLUMN: &str = "daqid";

pub mod local;
pub mod reader;
pub mod remote;

pub use local::LocalBackend;
pub use remote::RemoteBackend;

/// Stats surfaced by a storage backend for the health/stats subsystem.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BackendStats {
    pub files_listed: u64,
    pub files_read: u64,
    pub read_errors: u64,
    pub listing_cache_hits: u64,
    pub listing_cache_misses: u64,
}

/// A source of partition files: either the local filesystem lake or an
/// object-store-backed remote lake. Both read bytes through the same
/// DuckDB-based Parquet scan once the files are on local disk.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Lists partition files that exist under `prefix`, relative to the
    /// backend's root. Listing results are cached per backend with their
    /// own TTL (local: short-lived; remote: longer, network calls are
    /// costlier).
    async fn list_files(&self, prefix: &str) -> QueryResult<Vec<String>>;

    /// Reads and concatenates the given relative partition paths into a
    /// single `Batch`. A path with no matching file is skipped rather than
    /// treated as a query failure.
    async fn read_parquet(&self, paths: &[String]) -> QueryResult<Batch>;

    async fn file_exists(&self, path: &str) -> QueryResult<bool>;

    async fn health_check(&self) -> bool;

    fn stats(&self) -> BackendStats;
}

/// Runs a `read_parquet([...])` scan over local filesystem paths and
/// collects the result into an open-schema `Batch`. Shared by the local
/// backend (paths already on disk) and the remote backend (paths are
/// temp-file downloads of blobs). Must run off the async runtime; callers
/// wrap this in `spawn_blocking`.
pub(crate) fn scan_parquet_files(paths: &[std::path::PathBuf]) -> QueryResult<Batch> {
    if paths.is_empty() {
        return Ok(Batch::new());
    }
    let conn = Connection::open_in_memory()
        .map_err(|err| QueryError::backend_fault(format!("failed to open duckdb connection: {err}")))?;

    let file_list = paths
        .iter()
        .map(|p| format!("'{}'", p.display().to_string().replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT * FROM read_parquet([{file_list}], hive_partitioning=1, union_by_name=1)"
    );

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|err| QueryError::backend_fault(format!("failed to prepare parquet scan: {err}")))?;
    let column_names: Vec<String> = stmt.column_names();

    let mut rows = stmt
        .query([])
        .map_err(|err| QueryError::backend_fault(format!("failed to execute parquet scan: {err}")))?;

    let mut batch = Batch::new();
    let mut time_col: Vec<chrono::DateTime<Utc>> = Vec::new();
    let mut text_cols: Vec<Vec<String>> = vec![Vec::new(); column_names.len()];
    let mut numeric_cols: Vec<Vec<f64>> = vec![Vec::new(); column_names.len()];
    let mut column_is_text: Vec<Option<bool>> = vec![None; column_names.len()];

    while let Some(row) = rows
        .next()
        .map_err(|err| QueryError::backend_fault(format!("failed to read parquet row: {err}")))?
    {
        for (idx, name) in column_names.iter().enumerate() {
            match name.as_str() {
                TIME_COLUMN => {
                    let micros: i64 = row.get(idx).unwrap_or(0);
                    let ts = Utc.timestamp_micros(micros).single().unwrap_or_default();
                    time_col.push(ts);
                }
                SENSOR_COLUMN | ASSET_COLUMN | DAQID_COLUMN => {
                    let value: String = row.get(idx).unwrap_or_default();
                    text_cols[idx].push(value);
                }
                _ => {
                    if column_is_text[idx] == Some(true) {
                        let value: String = row.get(idx).unwrap_or_default();
                        text_cols[idx].push(value);
                        continue;
                    }
                    match row.get::<_, f64>(idx) {
                        Ok(value) => {
                            column_is_text[idx].get_or_insert(false);
                            numeric_cols[idx].push(value);
                        }
                        Err(_) => {
                            column_is_text[idx] = Some(true);
                            let value: String = row.get(idx).unwrap_or_default();
                            text_cols[idx].push(value);
                        }
                    }
                }
            }
        }
    }

    if !time_col.is_empty() {
        batch.insert_column(TIME_COLUMN, Column::Time(time_col));
    }
    // `daqid` is an older alias for `asset_id`; normalize it on read (spec
    // §3) rather than carrying two asset-identifying columns downstream.
    let has_asset_column = column_names.iter().any(|name| name == ASSET_COLUMN);
    for (idx, name) in column_names.iter().enumerate() {
        if name == TIME_COLUMN {
            continue;
        }
        let effective_name = if name == DAQID_COLUMN {
            if has_asset_column {
                continue;
            }
            ASSET_COLUMN.to_string()
        } else {
            name.clone()
        };
        if !text_cols[idx].is_empty() {
            batch.insert_column(effective_name, Column::Text(std::mem::take(&mut text_cols[idx])));
        } else if !numeric_cols[idx].is_empty() {
            batch.insert_column(effective_name, Column::Numeric(std::mem::take(&mut numeric_cols[idx])));
        }
    }

    Ok(batch)
}

/// Scans `paths` the same way `scan_parquet_files` does, but isolates a
/// corrupt or unreadable individual file instead of failing the whole
/// request (spec §4.B: "transient backend errors on an individual path are
/// logged and treated as an empty batch; overall read succeeds if any path
/// succeeded"). The common case is one batched DuckDB scan over every path;
/// only on failure does this fall back to scanning paths one at a time so
/// the bad file(s) can be skipped and logged while the rest still come
/// back. Returns the merged batch plus how many files could not be read at
/// all, for the caller's read-error stats.
pub(crate) fn scan_parquet_files_isolated(paths: &[std::path::PathBuf]) -> (Batch, u64) {
    match scan_parquet_files(paths) {
        Ok(batch) => return (batch, 0),
        Err(err) => {
            tracing::warn!(error = %err, file_count = paths.len(), "batched parquet scan failed, retrying per-file");
        }
    }

    let mut merged = Batch::new();
    let mut failed = 0u64;
    for path in paths {
        match scan_parquet_files(std::slice::from_ref(path)) {
            Ok(batch) => merged.extend(batch),
            Err(err) => {
                tracing::warn!(error = %err, path = %path.display(), "skipping unreadable parquet file");
                failed += 1;
            }
        }
    }
    (merged, failed)
}

pub(crate) fn exists_on_disk(root: &Path, relative: &str) -> bool {
    root.join(relative).is_file()
}

fn sql_literal(column: &Column, i: usize) -> String {
    match column {
        Column::Time(v) => format!("TIMESTAMP '{}'", v[i].format("%Y-%m-%d %H:%M:%S%.6f")),
        Column::Numeric(v) => {
            if v[i].is_nan() {
                "NULL".to_string()
            } else {
                format!("{}", v[i])
            }
        }
        Column::Text(v) => format!("'{}'", v[i].replace('\'', "''")),
    }
}

/// Writes `batch` out as a single Parquet file at `path`, creating parent
/// directories as needed. Used by the rebuilder to materialize
/// aggregated/daily partitions; values are staged through an in-memory
/// DuckDB table and flushed with `COPY ... TO ... (FORMAT PARQUET)`.
pub(crate) fn write_batch_to_parquet(batch: &Batch, path: &Path) -> QueryResult<()> {
    if batch.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| QueryError::backend_fault(format!("failed to create partition dir: {err}")))?;
    }

    let conn = Connection::open_in_memory()
        .map_err(|err| QueryError::backend_fault(format!("failed to open duckdb connection: {err}")))?;

    let column_names: Vec<&String> = batch.columns().keys().collect();
    let column_defs: Vec<String> = column_names
        .iter()
        .map(|name| {
            let sql_type = match batch.column(name).unwrap() {
                Column::Time(_) => "TIMESTAMP",
                Column::Numeric(_) => "DOUBLE",
                Column::Text(_) => "VARCHAR",
            };
            format!("\"{name}\" {sql_type}")
        })
        .collect();
    conn.execute(
        &format!("CREATE TABLE partition_data ({})", column_defs.join(", ")),
        [],
    )
    .map_err(|err| QueryError::backend_fault(format!("failed to create staging table: {err}")))?;

    const BATCH_ROWS: usize = 500;
    let mut row = 0;
    while row < batch.row_count() {
        let end = (row + BATCH_ROWS).min(batch.row_count());
        let mut value_rows = Vec::with_capacity(end - row);
        for i in row..end {
            let values: Vec<String> = column_names
                .iter()
                .map(|name| sql_literal(batch.column(name).unwrap(), i))
                .collect();
            value_rows.push(format!("({})", values.join(", ")));
        }
        let sql = format!("INSERT INTO partition_data VALUES {}", value_rows.join(", "));
        conn.execute(&sql, [])
            .map_err(|err| QueryError::backend_fault(format!("failed to insert staged rows: {err}")))?;
        row = end;
    }

    let path_literal = path.display().to_string().replace('\'', "''");
    conn.execute(
        &format!("COPY partition_data TO '{path_literal}' (FORMAT PARQUET)"),
        [],
    )
    .map_err(|err| QueryError::backend_fault(format!("failed to write parquet file: {err}")))?;

    Ok(())
}
