//! SQLite Driver
//!
//! Implements the driver contracts for SQLite using SQLx. Each connection
//! owns one `SqliteConnection`; statements and transactions share it
//! through a mutex so they can outlive the `prepare`/`begin` call.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, ConnectOptions, Executor, Row, Sqlite, TypeInfo};
use tokio::sync::Mutex;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::{Connection, Driver, Statement, Transaction};
use crate::engine::types::{
    ColumnInfo, Context, IsolationLevel, QueryResult, Row as QRow, TxOptions, Value,
};

type SharedConn = Arc<Mutex<SqliteConnection>>;

/// SQLite driver implementation
pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }

    fn connect_options(dsn: &str) -> EngineResult<SqliteConnectOptions> {
        SqliteConnectOptions::from_str(dsn)
            .map(|options| options.create_if_missing(true))
            .map_err(|e| EngineError::invalid_dsn(e.to_string()))
    }

    /// Statement that opens a transaction for the requested options
    fn begin_statement(opts: &TxOptions) -> EngineResult<&'static str> {
        if opts.read_only {
            return Err(EngineError::not_supported(
                "SQLite does not support read-only transactions",
            ));
        }
        match opts.isolation {
            IsolationLevel::Default | IsolationLevel::Serializable => Ok("BEGIN"),
            other => Err(EngineError::not_supported(format!(
                "SQLite does not support isolation level {:?}",
                other
            ))),
        }
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn driver_id(&self) -> &str {
        "sqlite"
    }

    fn parse_dsn(&self, dsn: &str) -> EngineResult<()> {
        Self::connect_options(dsn).map(|_| ())
    }

    async fn open(&self, dsn: &str) -> EngineResult<Box<dyn Connection>> {
        let conn = Self::connect_options(dsn)?
            .connect()
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;

        Ok(Box::new(SqliteConn {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }
}

struct SqliteConn {
    conn: SharedConn,
}

impl SqliteConn {
    async fn start(&self, sql: &'static str) -> EngineResult<Box<dyn Transaction>> {
        run_raw(&self.conn, sql).await?;
        Ok(Box::new(SqliteTx {
            conn: Arc::clone(&self.conn),
        }))
    }
}

#[async_trait]
impl Connection for SqliteConn {
    async fn prepare(&mut self, query: &str) -> EngineResult<Box<dyn Statement>> {
        {
            let mut conn = self.conn.lock().await;
            Executor::prepare(&mut *conn, query)
                .await
                .map_err(|e| EngineError::execution_error(e.to_string()))?;
        }

        Ok(Box::new(SqliteStmt {
            conn: Arc::clone(&self.conn),
            sql: query.to_string(),
        }))
    }

    async fn close(self: Box<Self>) -> EngineResult<()> {
        let conn = match Arc::try_unwrap(self.conn) {
            Ok(mutex) => mutex.into_inner(),
            // A statement or transaction still holds it; it closes when they drop.
            Err(_) => return Ok(()),
        };
        sqlx::Connection::close(conn)
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))
    }

    async fn begin(&mut self) -> EngineResult<Box<dyn Transaction>> {
        self.start("BEGIN").await
    }

    fn supports_context_begin(&self) -> bool {
        true
    }

    async fn begin_with_context(
        &mut self,
        ctx: &Context,
        opts: TxOptions,
    ) -> EngineResult<Box<dyn Transaction>> {
        let sql = SqliteDriver::begin_statement(&opts)?;
        ctx.run(self.start(sql)).await
    }
}

struct SqliteStmt {
    conn: SharedConn,
    sql: String,
}

#[async_trait]
impl Statement for SqliteStmt {
    async fn execute(&mut self, args: &[Value]) -> EngineResult<QueryResult> {
        let start = Instant::now();
        let mut conn = self.conn.lock().await;
        let query = args
            .iter()
            .fold(sqlx::query::<Sqlite>(&self.sql), bind_param);

        let result = query
            .execute(&mut *conn)
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        Ok(QueryResult::with_affected_rows(
            result.rows_affected(),
            start.elapsed().as_micros() as f64 / 1000.0,
        ))
    }

    async fn query(&mut self, args: &[Value]) -> EngineResult<QueryResult> {
        let start = Instant::now();
        let mut conn = self.conn.lock().await;
        let query = args
            .iter()
            .fold(sqlx::query::<Sqlite>(&self.sql), bind_param);

        let rows = query
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        Ok(QueryResult {
            columns: rows.first().map(column_info).unwrap_or_default(),
            rows: rows.iter().map(convert_row).collect(),
            affected_rows: None,
            execution_time_ms: start.elapsed().as_micros() as f64 / 1000.0,
        })
    }
}

struct SqliteTx {
    conn: SharedConn,
}

#[async_trait]
impl Transaction for SqliteTx {
    async fn commit(self: Box<Self>) -> EngineResult<()> {
        run_raw(&self.conn, "COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> EngineResult<()> {
        run_raw(&self.conn, "ROLLBACK").await
    }
}

async fn run_raw(conn: &SharedConn, sql: &'static str) -> EngineResult<()> {
    let mut conn = conn.lock().await;
    Executor::execute(&mut *conn, sql)
        .await
        .map(|_| ())
        .map_err(|e| EngineError::execution_error(e.to_string()))
}

fn bind_param<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.clone()),
        Value::Bytes(b) => query.bind(b.clone()),
        Value::Json(j) => query.bind(j.to_string()),
    }
}

fn column_info(row: &SqliteRow) -> Vec<ColumnInfo> {
    row.columns()
        .iter()
        .map(|col| ColumnInfo {
            name: col.name().to_string(),
            data_type: col.type_info().name().to_string(),
        })
        .collect()
}

fn convert_row(row: &SqliteRow) -> QRow {
    let values = (0..row.columns().len())
        .map(|idx| extract_value(row, idx))
        .collect();
    QRow { values }
}

/// SQLite values carry their storage class, so decoding follows it
fn extract_value(row: &SqliteRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::Int).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(Value::Float).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::Text).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map(Value::Bytes).unwrap_or(Value::Null);
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dsn(dir: &tempfile::TempDir) -> String {
        format!("sqlite://{}", dir.path().join("test.db").display())
    }

    #[test]
    fn begin_statement_rejects_unsupported_options() {
        assert_eq!(
            SqliteDriver::begin_statement(&TxOptions::default()).expect("default"),
            "BEGIN"
        );

        let read_only = TxOptions {
            read_only: true,
            ..TxOptions::default()
        };
        assert!(matches!(
            SqliteDriver::begin_statement(&read_only),
            Err(EngineError::NotSupported { .. })
        ));

        let committed = TxOptions {
            isolation: IsolationLevel::ReadCommitted,
            read_only: false,
        };
        assert!(SqliteDriver::begin_statement(&committed).is_err());
    }

    #[tokio::test]
    async fn executes_prepared_statements_with_arguments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = SqliteDriver::new();
        let mut conn = driver.open(&temp_dsn(&dir)).await.expect("open");

        let mut create = conn
            .prepare("create table users (id integer primary key, name text)")
            .await
            .expect("prepare create");
        create.execute(&[]).await.expect("create table");

        let mut insert = conn
            .prepare("insert into users (name) values (?)")
            .await
            .expect("prepare insert");
        let result = insert
            .execute(&[Value::from("joey")])
            .await
            .expect("insert");
        assert_eq!(result.affected_rows, Some(1));
        insert.close().await.expect("close stmt");

        let mut select = conn
            .prepare("select id, name from users")
            .await
            .expect("prepare select");
        let rows = select.query(&[]).await.expect("select");

        assert_eq!(rows.columns.len(), 2);
        assert_eq!(rows.columns[1].name, "name");
        assert_eq!(
            rows.rows,
            vec![QRow {
                values: vec![Value::Int(1), Value::from("joey")],
            }]
        );
    }

    #[tokio::test]
    async fn syntax_errors_surface_at_prepare() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut conn = SqliteDriver::new()
            .open(&temp_dsn(&dir))
            .await
            .expect("open");

        let err = conn
            .prepare("selec nothing")
            .await
            .err()
            .expect("should not prepare");
        assert!(matches!(err, EngineError::ExecutionError { .. }));
    }

    #[tokio::test]
    async fn rollback_discards_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut conn = SqliteDriver::new()
            .open(&temp_dsn(&dir))
            .await
            .expect("open");
        conn.prepare("create table t (v integer)")
            .await
            .expect("prepare")
            .execute(&[])
            .await
            .expect("create");

        let tx = conn
            .begin_with_context(&Context::background(), TxOptions::default())
            .await
            .expect("begin");
        conn.prepare("insert into t (v) values (1)")
            .await
            .expect("prepare")
            .execute(&[])
            .await
            .expect("insert");
        tx.rollback().await.expect("rollback");

        let rows = conn
            .prepare("select v from t")
            .await
            .expect("prepare")
            .query(&[])
            .await
            .expect("select");
        assert!(rows.rows.is_empty());
    }

    #[tokio::test]
    async fn cancelled_context_does_not_begin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut conn = SqliteDriver::new()
            .open(&temp_dsn(&dir))
            .await
            .expect("open");

        let (ctx, cancel) = Context::with_cancel();
        cancel.cancel();
        let err = conn
            .begin_with_context(&ctx, TxOptions::default())
            .await
            .err()
            .expect("cancelled");
        assert!(matches!(err, EngineError::Cancelled));

        let tx = conn.begin().await.expect("no transaction left open");
        tx.commit().await.expect("commit");
    }

    #[test]
    fn parse_dsn_accepts_paths_and_urls() {
        let driver = SqliteDriver::new();
        driver.parse_dsn("sqlite::memory:").expect("memory url");
        driver.parse_dsn("test.db").expect("bare path");
        driver.parse_dsn("sqlite://data/app.db?mode=rwc").expect("url");
    }
}
