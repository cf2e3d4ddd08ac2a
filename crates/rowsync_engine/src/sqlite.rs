//! SQLite implementation of [`LocalDriver`].

use crate::error::{SyncError, SyncResult};
use crate::local::{LocalDriver, Statement};
use async_trait::async_trait;
use parking_lot::Mutex;
use rowsync_protocol::RowMap;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::Value;
use std::path::Path;

/// A single SQLite connection shared by the whole engine.
pub struct SqliteDriver {
    conn: Mutex<Connection>,
}

impl SqliteDriver {
    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;",
        )?;
        Ok(Self::from_connection(conn))
    }

    /// Opens an in-memory database.
    pub fn open_in_memory() -> SyncResult<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    /// Wraps an existing connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Runs a batch of SQL without parameters, e.g. schema setup.
    pub fn execute_batch(&self, sql: &str) -> SyncResult<()> {
        self.conn.lock().execute_batch(sql).map_err(SyncError::from)
    }
}

#[async_trait]
impl LocalDriver for SqliteDriver {
    async fn execute(&self, sql: &str, params: &[Value]) -> SyncResult<usize> {
        let conn = self.conn.lock();
        run(&conn, sql, params)?;
        Ok(usize::try_from(conn.changes()).unwrap_or(usize::MAX))
    }

    async fn query(&self, sql: &str, params: &[Value]) -> SyncResult<Vec<RowMap>> {
        let conn = self.conn.lock();
        Ok(run(&conn, sql, params)?)
    }

    async fn execute_atomic(&self, statements: Vec<Statement>) -> SyncResult<Vec<RowMap>> {
        let mut conn = self.conn.lock();
        // Savepoints nest inside an open BEGIN, unlike transactions.
        let savepoint = conn.savepoint()?;
        let mut rows = Vec::new();
        for statement in &statements {
            rows.extend(run(&savepoint, &statement.sql, &statement.params)?);
        }
        savepoint.commit()?;
        Ok(rows)
    }

    async fn begin(&self) -> SyncResult<()> {
        self.execute_batch("BEGIN")
    }

    async fn commit(&self) -> SyncResult<()> {
        self.execute_batch("COMMIT")
    }

    async fn rollback(&self) -> SyncResult<()> {
        self.execute_batch("ROLLBACK")
    }
}

/// Runs one statement, collecting any rows it returns.
///
/// Always goes through `query` so `RETURNING` clauses work for writes.
fn run(conn: &Connection, sql: &str, params: &[Value]) -> rusqlite::Result<Vec<RowMap>> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter().map(json_to_sql)))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = RowMap::new();
        for (index, name) in names.iter().enumerate() {
            let value: SqlValue = row.get(index)?;
            map.insert(name.clone(), sql_to_json(value));
        }
        out.push(map);
    }
    Ok(out)
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        // Arrays and objects are stored as JSON text.
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(bytes) => Value::from(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn driver() -> SqliteDriver {
        let driver = SqliteDriver::open_in_memory().unwrap();
        driver
            .execute_batch("CREATE TABLE t (id TEXT PRIMARY KEY, n INTEGER, r REAL, j TEXT)")
            .unwrap();
        driver
    }

    #[tokio::test]
    async fn values_round_trip() {
        let driver = driver();
        driver
            .execute(
                "INSERT INTO t (id, n, r, j) VALUES (?, ?, ?, ?)",
                &[json!("a"), json!(true), json!(1.5), json!({ "k": 1 })],
            )
            .await
            .unwrap();
        let row = driver.query_first("SELECT * FROM t", &[]).await.unwrap().unwrap();
        assert_eq!(row["n"], json!(1));
        assert_eq!(row["r"], json!(1.5));
        assert_eq!(row["j"], json!("{\"k\":1}"));
    }

    #[tokio::test]
    async fn execute_reports_changes_and_returning_works() {
        let driver = driver();
        let changed = driver
            .execute("INSERT INTO t (id) VALUES (?), (?)", &[json!("a"), json!("b")])
            .await
            .unwrap();
        assert_eq!(changed, 2);
        let rows = driver
            .query("UPDATE t SET n = 7 RETURNING id", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn atomic_batch_rolls_back_on_error() {
        let driver = driver();
        let result = driver
            .execute_atomic(vec![
                Statement::new("INSERT INTO t (id) VALUES (?)", vec![json!("a")]),
                Statement::new("INSERT INTO t (id) VALUES (?)", vec![json!("a")]),
            ])
            .await;
        assert!(result.is_err());
        let rows = driver.query("SELECT id FROM t", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn atomic_batch_nests_inside_transaction() {
        let driver = driver();
        driver.begin().await.unwrap();
        driver
            .execute_atomic(vec![Statement::new("INSERT INTO t (id) VALUES ('a')", vec![])])
            .await
            .unwrap();
        driver.rollback().await.unwrap();
        let rows = driver.query("SELECT id FROM t", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.db");
        {
            let driver = SqliteDriver::open(&path).unwrap();
            driver
                .execute_batch("CREATE TABLE t (id TEXT PRIMARY KEY); INSERT INTO t VALUES ('a');")
                .unwrap();
        }
        let driver = SqliteDriver::open(&path).unwrap();
        let count: i64 = driver
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
