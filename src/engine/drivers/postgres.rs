//! PostgreSQL Driver
//!
//! Implements the driver contracts for PostgreSQL using SQLx.
//!
//! ## Statements and transactions
//!
//! `prepare` parses the statement on the server, so syntax errors surface
//! there rather than on first execution. Statements and transactions share
//! the connection through a mutex; a transaction is plain `BEGIN`/`COMMIT`
//! on that connection, so statements prepared on it while a transaction is
//! open run inside it.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow, Postgres};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, Executor, Row, TypeInfo};
use tokio::sync::Mutex;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::{Connection, Driver, Statement, Transaction};
use crate::engine::types::{ColumnInfo, Context, QueryResult, Row as QRow, TxOptions, Value};

type SharedConn = Arc<Mutex<PgConnection>>;

/// PostgreSQL driver implementation
pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self {
        Self
    }

    fn connect_options(dsn: &str) -> EngineResult<PgConnectOptions> {
        PgConnectOptions::from_str(dsn).map_err(|e| EngineError::invalid_dsn(e.to_string()))
    }

    /// Builds the BEGIN statement for the requested options
    fn begin_statement(opts: &TxOptions) -> String {
        let mut sql = String::from("BEGIN");
        if let Some(level) = opts.isolation.as_sql() {
            sql.push_str(" ISOLATION LEVEL ");
            sql.push_str(level);
        }
        if opts.read_only {
            sql.push_str(" READ ONLY");
        }
        sql
    }

    fn map_error(e: sqlx::Error) -> EngineError {
        let msg = e.to_string();
        if msg.contains("syntax error") {
            EngineError::syntax_error(msg)
        } else {
            EngineError::execution_error(msg)
        }
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn driver_id(&self) -> &str {
        "postgres"
    }

    fn parse_dsn(&self, dsn: &str) -> EngineResult<()> {
        Self::connect_options(dsn).map(|_| ())
    }

    async fn open(&self, dsn: &str) -> EngineResult<Box<dyn Connection>> {
        let conn = Self::connect_options(dsn)?
            .connect()
            .await
            .map_err(|e| {
                if e.to_string().contains("password authentication failed") {
                    EngineError::auth_failed(e.to_string())
                } else {
                    EngineError::connection_failed(e.to_string())
                }
            })?;

        Ok(Box::new(PostgresConn {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }
}

struct PostgresConn {
    conn: SharedConn,
}

impl PostgresConn {
    async fn start(&self, sql: &str) -> EngineResult<Box<dyn Transaction>> {
        run_raw(&self.conn, sql).await?;
        Ok(Box::new(PostgresTx {
            conn: Arc::clone(&self.conn),
        }))
    }
}

#[async_trait]
impl Connection for PostgresConn {
    async fn prepare(&mut self, query: &str) -> EngineResult<Box<dyn Statement>> {
        {
            let mut conn = self.conn.lock().await;
            Executor::prepare(&mut *conn, query)
                .await
                .map_err(PostgresDriver::map_error)?;
        }

        Ok(Box::new(PostgresStmt {
            conn: Arc::clone(&self.conn),
            sql: query.to_string(),
        }))
    }

    async fn close(self: Box<Self>) -> EngineResult<()> {
        let conn = match Arc::try_unwrap(self.conn) {
            Ok(mutex) => mutex.into_inner(),
            // Still shared with a statement or transaction; dropped with them.
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
        let sql = PostgresDriver::begin_statement(&opts);
        ctx.run(self.start(&sql)).await
    }
}

struct PostgresStmt {
    conn: SharedConn,
    sql: String,
}

#[async_trait]
impl Statement for PostgresStmt {
    async fn execute(&mut self, args: &[Value]) -> EngineResult<QueryResult> {
        let start = Instant::now();
        let mut conn = self.conn.lock().await;
        let query = args
            .iter()
            .fold(sqlx::query::<Postgres>(&self.sql), bind_param);

        let result = query
            .execute(&mut *conn)
            .await
            .map_err(PostgresDriver::map_error)?;

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
            .fold(sqlx::query::<Postgres>(&self.sql), bind_param);

        let pg_rows: Vec<PgRow> = query
            .fetch_all(&mut *conn)
            .await
            .map_err(PostgresDriver::map_error)?;

        Ok(QueryResult {
            columns: pg_rows.first().map(get_column_info).unwrap_or_default(),
            rows: pg_rows.iter().map(convert_row).collect(),
            affected_rows: None,
            execution_time_ms: start.elapsed().as_micros() as f64 / 1000.0,
        })
    }
}

struct PostgresTx {
    conn: SharedConn,
}

#[async_trait]
impl Transaction for PostgresTx {
    async fn commit(self: Box<Self>) -> EngineResult<()> {
        run_raw(&self.conn, "COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> EngineResult<()> {
        run_raw(&self.conn, "ROLLBACK").await
    }
}

async fn run_raw(conn: &SharedConn, sql: &str) -> EngineResult<()> {
    let mut conn = conn.lock().await;
    Executor::execute(&mut *conn, sql)
        .await
        .map(|_| ())
        .map_err(PostgresDriver::map_error)
}

/// Helper to bind a Value to a Postgres query
fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.clone()),
        Value::Bytes(b) => query.bind(b.clone()),
        Value::Json(j) => query.bind(j.clone()),
    }
}

/// Gets column info from a PgRow
fn get_column_info(row: &PgRow) -> Vec<ColumnInfo> {
    row.columns()
        .iter()
        .map(|col| ColumnInfo {
            name: col.name().to_string(),
            data_type: col.type_info().name().to_string(),
        })
        .collect()
}

fn convert_row(pg_row: &PgRow) -> QRow {
    let values = pg_row
        .columns()
        .iter()
        .map(|col| extract_value(pg_row, col.ordinal()))
        .collect();

    QRow { values }
}

/// Extracts a value from a PgRow at the given index
fn extract_value(row: &PgRow, idx: usize) -> Value {
    // Integers before bool so int2/int4/int8 keep their numeric value
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::Int).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
        return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(Value::Float).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
        return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::Text).unwrap_or(Value::Null);
    }
    // Date/time types as ISO 8601 text
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
        return v.map(|dt| Value::Text(dt.to_rfc3339())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return v
            .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
        return v
            .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map(Value::Bytes).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
        return v.map(Value::Json).unwrap_or(Value::Null);
    }

    Value::Null
}
