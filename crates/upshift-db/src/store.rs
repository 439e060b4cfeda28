use std::path::{Path, PathBuf};

use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, params_from_iter};
use tracing::info;
use upshift_common::{Error, Result};

/// A single column value passed to or read from a [`Store`].
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

pub type Row = Vec<SqlValue>;

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        SqlValue::Text(s)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<&SqlValue> for Value {
    fn from(v: &SqlValue) -> Self {
        match v {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(i) => Value::Integer(*i),
            SqlValue::Real(f) => Value::Real(*f),
            SqlValue::Text(s) => Value::Text(s.clone()),
            SqlValue::Blob(b) => Value::Blob(b.clone()),
        }
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

/// The relational store being upgraded.
///
/// Statements run one at a time, in order. The schema version is a single
/// integer owned by the store itself.
pub trait Store: Send {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    fn execute_batch(&mut self, sql: &str) -> Result<()>;

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    fn schema_version(&mut self) -> Result<u32>;

    fn set_schema_version(&mut self, version: u32) -> Result<()>;

    /// Whether DDL participates in transactions, so a whole step can be
    /// rolled back.
    fn transactional_ddl(&self) -> bool {
        false
    }

    fn begin(&mut self) -> Result<()> {
        self.execute_batch("BEGIN")
    }

    fn commit(&mut self) -> Result<()> {
        self.execute_batch("COMMIT")
    }

    fn rollback(&mut self) -> Result<()> {
        self.execute_batch("ROLLBACK")
    }
}

/// Opens a fresh [`Store`] handle for each upgrade attempt.
pub trait StoreOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn Store>>;

    /// Human-readable location, used in log lines.
    fn describe(&self) -> String;
}

/// SQLite-backed [`Store`]. The schema version lives in `PRAGMA user_version`.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Ok(Self { conn })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Ok(Self { conn })
    }
}

impl Store for SqliteStore {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        self.conn
            .execute(sql, params_from_iter(params.iter().map(Value::from)))
            .map_err(|e| Error::Database(format!("statement failed: {e}")))
    }

    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.conn
            .execute_batch(sql)
            .map_err(|e| Error::Database(format!("batch failed: {e}")))
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;
        let columns = stmt.column_count();

        let rows = stmt
            .query_map(params_from_iter(params.iter().map(Value::from)), |row| {
                (0..columns)
                    .map(|i| row.get_ref(i).map(SqlValue::from))
                    .collect::<rusqlite::Result<Row>>()
            })
            .map_err(|e| Error::Database(format!("query failed: {e}")))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to read row: {e}")))
    }

    fn schema_version(&mut self) -> Result<u32> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(|e| Error::Database(format!("failed to read schema version: {e}")))?;
        u32::try_from(version)
            .map_err(|_| Error::Database(format!("schema version out of range: {version}")))
    }

    fn set_schema_version(&mut self, version: u32) -> Result<()> {
        self.conn
            .execute_batch(&format!("PRAGMA user_version = {version}"))
            .map_err(|e| Error::Database(format!("failed to write schema version: {e}")))
    }

    fn transactional_ddl(&self) -> bool {
        true
    }

    fn begin(&mut self) -> Result<()> {
        self.execute_batch("BEGIN IMMEDIATE")
    }
}

/// Opens a [`SqliteStore`] at a fixed path.
pub struct SqliteOpener {
    path: PathBuf,
}

impl SqliteOpener {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StoreOpener for SqliteOpener {
    fn open(&self) -> Result<Box<dyn Store>> {
        Ok(Box::new(SqliteStore::open(&self.path)?))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_store_reports_version_zero() {
        let mut store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), 0);

        store.set_schema_version(14).unwrap();
        assert_eq!(store.schema_version().unwrap(), 14);
    }

    #[test]
    fn execute_and_query_round_trip_values() {
        let mut store = SqliteStore::in_memory().unwrap();
        store
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, score REAL, raw BLOB)")
            .unwrap();

        let inserted = store
            .execute(
                "INSERT INTO t (name, score, raw) VALUES (?1, ?2, ?3)",
                &["alice".into(), SqlValue::Real(1.5), SqlValue::Blob(vec![1, 2])],
            )
            .unwrap();
        assert_eq!(inserted, 1);
        store
            .execute("INSERT INTO t (name) VALUES (?1)", &[SqlValue::Null])
            .unwrap();

        let rows = store
            .query("SELECT id, name, score, raw FROM t ORDER BY id", &[])
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0].as_i64(), Some(1));
        assert_eq!(rows[0][1].as_str(), Some("alice"));
        assert_eq!(rows[0][2], SqlValue::Real(1.5));
        assert_eq!(rows[0][3], SqlValue::Blob(vec![1, 2]));
        assert!(rows[1][1].is_null());
    }

    #[test]
    fn rollback_discards_ddl_and_version() {
        let mut store = SqliteStore::in_memory().unwrap();
        store.begin().unwrap();
        store.execute_batch("CREATE TABLE doomed (id INTEGER)").unwrap();
        store.set_schema_version(3).unwrap();
        store.rollback().unwrap();

        assert_eq!(store.schema_version().unwrap(), 0);
        let tables = store
            .query("SELECT name FROM sqlite_master WHERE name = 'doomed'", &[])
            .unwrap();
        assert!(tables.is_empty());
    }

    #[test]
    fn bad_sql_is_a_database_error() {
        let mut store = SqliteStore::in_memory().unwrap();
        let err = store.execute("INSERT INTO missing VALUES (1)", &[]).unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        assert!(err.to_string().contains("no such table"));
    }

    #[test]
    fn opener_reopens_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let opener = SqliteOpener::new(dir.path().join("app.db"));

        opener.open().unwrap().set_schema_version(7).unwrap();
        assert_eq!(opener.open().unwrap().schema_version().unwrap(), 7);
        assert!(opener.describe().ends_with("app.db"));
    }
}
