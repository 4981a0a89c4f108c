use duckdb::{params_from_iter, Connection, Row};
use polars::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::timed_operation;

/// Schema holding the dashboard table
pub const SCHEMA: &str = "prod";
/// Table holding the normalized dataset
pub const TABLE: &str = "sales";

/// Fully qualified table name used in generated queries
pub fn qualified_table() -> String {
    format!("{}.{}", SCHEMA, TABLE)
}

/// The embedded analytical engine: a DuckDB database holding `prod.sales`
#[derive(Clone)]
pub struct Warehouse {
    conn: Arc<Mutex<Connection>>,
    location: Option<PathBuf>,
}

impl Warehouse {
    /// Open (or create) a database file and initialize the schema
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path.as_ref())?;
        let warehouse = Warehouse {
            conn: Arc::new(Mutex::new(conn)),
            location: Some(db_path.as_ref().to_path_buf()),
        };
        warehouse.initialize_schema()?;
        info!("🦆 Opened warehouse at {}", db_path.as_ref().display());
        Ok(warehouse)
    }

    /// Create an in-memory database for testing
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let warehouse = Warehouse {
            conn: Arc::new(Mutex::new(conn)),
            location: None,
        };
        warehouse.initialize_schema()?;
        Ok(warehouse)
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    fn initialize_schema(&self) -> Result<()> {
        self.lock()?
            .execute_batch(&format!("CREATE SCHEMA IF NOT EXISTS {};", SCHEMA))?;
        debug!("Warehouse schema '{}' ready", SCHEMA);
        Ok(())
    }

    /// Exclusive access to the connection.
    ///
    /// Every query goes through this lock, so holding it across a table swap
    /// keeps SQL readers from observing a half-finished replace.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        Ok(self.conn.lock()?)
    }

    /// Whether `prod.sales` exists
    pub fn table_exists(&self) -> Result<bool> {
        let conn = self.lock()?;
        table_exists(&conn)
    }

    /// Column names of `prod.sales` in table order; empty if absent
    pub fn columns(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT column_name FROM information_schema.columns
             WHERE table_schema = ? AND table_name = ?
             ORDER BY ordinal_position",
        )?;
        let rows = stmt.query_map([SCHEMA, TABLE], |row| row.get::<_, String>(0))?;
        let mut columns = Vec::new();
        for row in rows {
            columns.push(row?);
        }
        Ok(columns)
    }

    /// Export `prod.sales` into a frame; `None` when the table does not exist
    pub fn load_table(&self) -> Result<Option<DataFrame>> {
        timed_operation!("warehouse_load_table", {
            let conn = self.lock()?;
            if !table_exists(&conn)? {
                return Ok(None);
            }
            let scratch = ScratchFile::new("export");
            conn.execute_batch(&format!(
                "COPY {} TO {} (FORMAT PARQUET);",
                qualified_table(),
                quote_literal(&scratch.path().to_string_lossy())
            ))?;
            drop(conn);

            let file = File::open(scratch.path())?;
            let df = ParquetReader::new(file).finish()?;
            info!("📥 Loaded {} rows x {} columns from warehouse", df.height(), df.width());
            Ok(Some(df))
        })
    }

    /// Replace `prod.sales` with `df`, then run `on_commit` while the
    /// connection is still held
    pub fn replace_table_with<F>(&self, df: &DataFrame, on_commit: F) -> Result<()>
    where
        F: FnOnce(),
    {
        timed_operation!("warehouse_replace_table", {
            let scratch = ScratchFile::new("import");
            if df.width() > 0 {
                let mut owned = df.clone();
                let mut file = File::create(scratch.path())?;
                ParquetWriter::new(&mut file).finish(&mut owned)?;
            }

            let conn = self.lock()?;
            if df.width() == 0 {
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", qualified_table()))?;
            } else {
                conn.execute_batch(&format!(
                    "CREATE OR REPLACE TABLE {} AS SELECT * FROM read_parquet({});",
                    qualified_table(),
                    quote_literal(&scratch.path().to_string_lossy())
                ))?;
            }
            on_commit();
            info!("💾 Warehouse table {} now holds {} rows", qualified_table(), df.height());
            Ok(())
        })
    }

    pub fn replace_table(&self, df: &DataFrame) -> Result<()> {
        self.replace_table_with(df, || {})
    }

    pub fn drop_table(&self) -> Result<()> {
        self.lock()?
            .execute_batch(&format!("DROP TABLE IF EXISTS {};", qualified_table()))?;
        Ok(())
    }

    /// Run a parameterized query and map each row
    pub fn query_rows<T, F>(&self, sql: &str, params: &[String], map: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> duckdb::Result<T>,
    {
        let conn = self.lock()?;
        query_rows_on(&conn, sql, params, map)
    }

    /// Run a parameterized query expected to produce exactly one row
    pub fn query_one<T, F>(&self, sql: &str, params: &[String], map: F) -> Result<T>
    where
        F: FnMut(&Row<'_>) -> duckdb::Result<T>,
    {
        self.query_rows(sql, params, map)?
            .into_iter()
            .next()
            .ok_or(EngineError::Query(duckdb::Error::QueryReturnedNoRows))
    }
}

/// Run a parameterized query on a connection the caller already holds
pub fn query_rows_on<T, F>(conn: &Connection, sql: &str, params: &[String], mut map: F) -> Result<Vec<T>>
where
    F: FnMut(&Row<'_>) -> duckdb::Result<T>,
{
    debug!("SQL: {} | params={:?}", sql.trim(), params);
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| map(row))?;
    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

fn table_exists(conn: &Connection) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = ? AND table_name = ?",
        [SCHEMA, TABLE],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Single-quote a SQL string literal. Only used for engine-owned file paths,
/// which table functions and COPY cannot take as parameters.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Temporary Parquet file used to move frames in and out of DuckDB; removed on drop
struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    fn new(purpose: &str) -> Self {
        let path = std::env::temp_dir().join(format!("volta-{}-{}.parquet", purpose, Uuid::new_v4()));
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Could not remove scratch file {}: {}", self.path.display(), e);
            }
        }
    }
}
