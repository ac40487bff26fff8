//! Connection Pool
//!
//! Application-side pool over one driver and one data source name. It keeps
//! a small list of idle connections and hands them back out, so connections
//! outlive individual calls. A breaker also keeps one of these per data
//! source name as its native pool handle.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{debug, instrument};

use crate::config::PoolOptions;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::{Connection, Driver, Transaction};
use crate::engine::types::{ConnectionId, Context, QueryResult, TxOptions, Value};

/// A connection checked out of a `ConnectionPool`
pub struct PooledConnection {
    id: ConnectionId,
    conn: Box<dyn Connection>,
}

impl PooledConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Closes the connection instead of returning it to the pool
    pub async fn close(self) -> EngineResult<()> {
        self.conn.close().await
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        &*self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.conn
    }
}

struct PoolInner {
    driver_name: String,
    driver: Arc<dyn Driver>,
    dsn: String,
    options: PoolOptions,
    idle: Mutex<Vec<PooledConnection>>,
    closed: AtomicBool,
}

/// Cheaply cloneable handle to a pool
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        driver_name: impl Into<String>,
        driver: Arc<dyn Driver>,
        dsn: impl Into<String>,
        options: PoolOptions,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                driver_name: driver_name.into(),
                driver,
                dsn: dsn.into(),
                options,
                idle: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn driver_name(&self) -> &str {
        &self.inner.driver_name
    }

    pub fn dsn(&self) -> &str {
        &self.inner.dsn
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// True if both handles refer to the same pool
    pub fn same_pool(&self, other: &ConnectionPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Opens a fresh connection through the pool's driver, bypassing the idle list
    pub async fn connect(&self) -> EngineResult<Box<dyn Connection>> {
        if self.is_closed() {
            return Err(EngineError::PoolClosed);
        }

        let timeout_ms = self.inner.options.acquire_timeout_ms;
        match timeout(
            Duration::from_millis(timeout_ms),
            self.inner.driver.open(&self.inner.dsn),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout { timeout_ms }),
        }
    }

    /// Reuses an idle connection or opens a new one
    pub async fn acquire(&self) -> EngineResult<PooledConnection> {
        if self.is_closed() {
            return Err(EngineError::PoolClosed);
        }
        let idle = self.inner.idle.lock().pop();
        if let Some(conn) = idle {
            return Ok(conn);
        }

        let conn = self.connect().await?;
        let id = ConnectionId::new();
        debug!(driver = %self.inner.driver_name, connection = %id.0, "opened connection");
        Ok(PooledConnection { id, conn })
    }

    /// Returns a connection to the idle list, closing it if the list is full
    pub async fn release(&self, conn: PooledConnection) -> EngineResult<()> {
        let overflow = {
            let mut idle = self.inner.idle.lock();
            if !self.is_closed() && idle.len() < self.inner.options.max_idle {
                idle.push(conn);
                None
            } else {
                Some(conn)
            }
        };

        match overflow {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }

    /// Prepares and executes a statement on a pooled connection
    pub async fn exec(&self, sql: &str, args: &[Value]) -> EngineResult<QueryResult> {
        let mut conn = self.acquire().await?;
        let result = run_statement(&mut *conn, sql, args, false).await;
        let released = self.release(conn).await;
        let result = result?;
        released?;
        Ok(result)
    }

    /// Prepares a statement on a pooled connection and collects its rows
    pub async fn query(&self, sql: &str, args: &[Value]) -> EngineResult<QueryResult> {
        let mut conn = self.acquire().await?;
        let result = run_statement(&mut *conn, sql, args, true).await;
        let released = self.release(conn).await;
        let result = result?;
        released?;
        Ok(result)
    }

    /// Starts a transaction on a dedicated pooled connection
    ///
    /// Connections that advertise a context-aware begin get the caller's
    /// context and options. Others can only start default transactions.
    #[instrument(skip(self, ctx), fields(driver = %self.inner.driver_name))]
    pub async fn begin(&self, ctx: &Context, opts: TxOptions) -> EngineResult<PoolTransaction> {
        let mut conn = self.acquire().await?;

        let tx = if conn.supports_context_begin() {
            conn.begin_with_context(ctx, opts).await
        } else if opts.is_default() {
            ctx.run(conn.begin()).await
        } else {
            Err(EngineError::not_supported(
                "transaction options require a context-aware connection",
            ))
        };

        match tx {
            Ok(tx) => Ok(PoolTransaction {
                pool: self.clone(),
                conn,
                tx,
            }),
            Err(err) => {
                let _ = self.release(conn).await;
                Err(err)
            }
        }
    }

    /// Closes every idle connection and rejects further use
    pub async fn close(&self) -> EngineResult<()> {
        self.inner.closed.store(true, Ordering::Release);
        let idle: Vec<PooledConnection> = std::mem::take(&mut *self.inner.idle.lock());

        let mut first_err = None;
        for conn in idle {
            if let Err(err) = conn.close().await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A transaction holding its pooled connection until commit or rollback
///
/// Dropping it without either drops the connection instead of returning it.
pub struct PoolTransaction {
    pool: ConnectionPool,
    conn: PooledConnection,
    tx: Box<dyn Transaction>,
}

impl PoolTransaction {
    pub async fn exec(&mut self, sql: &str, args: &[Value]) -> EngineResult<QueryResult> {
        run_statement(&mut *self.conn, sql, args, false).await
    }

    pub async fn query(&mut self, sql: &str, args: &[Value]) -> EngineResult<QueryResult> {
        run_statement(&mut *self.conn, sql, args, true).await
    }

    pub async fn commit(self) -> EngineResult<()> {
        let Self { pool, conn, tx } = self;
        let result = tx.commit().await;
        let released = pool.release(conn).await;
        result?;
        released
    }

    pub async fn rollback(self) -> EngineResult<()> {
        let Self { pool, conn, tx } = self;
        let result = tx.rollback().await;
        let released = pool.release(conn).await;
        result?;
        released
    }
}

async fn run_statement(
    conn: &mut dyn Connection,
    sql: &str,
    args: &[Value],
    fetch_rows: bool,
) -> EngineResult<QueryResult> {
    let mut stmt = conn.prepare(sql).await?;
    let result = if fetch_rows {
        stmt.query(args).await
    } else {
        stmt.execute(args).await
    };
    let closed = stmt.close().await;
    let result = result?;
    closed?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MockDriver;

    fn mock_pool(max_idle: usize) -> (ConnectionPool, Arc<MockDriver>) {
        let driver = Arc::new(MockDriver::new("mock"));
        let pool = ConnectionPool::new(
            "mock",
            driver.clone(),
            "db1",
            PoolOptions {
                max_idle,
                acquire_timeout_ms: 1_000,
            },
        );
        (pool, driver)
    }

    #[tokio::test]
    async fn reuses_idle_connections() {
        let (pool, driver) = mock_pool(2);

        pool.exec("insert", &[]).await.expect("exec");
        pool.query("select", &[]).await.expect("query");

        assert_eq!(driver.opens(), 1);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(driver.stats().prepares(), 2);
    }

    #[tokio::test]
    async fn closes_connections_beyond_max_idle() {
        let (pool, driver) = mock_pool(1);

        let a = pool.acquire().await.expect("acquire a");
        let b = pool.acquire().await.expect("acquire b");
        assert_ne!(a.id(), b.id());

        pool.release(a).await.expect("release a");
        pool.release(b).await.expect("release b");

        assert_eq!(driver.opens(), 2);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(driver.stats().closes(), 1);
    }

    #[tokio::test]
    async fn failed_statement_still_returns_connection() {
        let (pool, driver) = mock_pool(2);

        let err = pool
            .exec("fail: syntax", &[])
            .await
            .expect_err("prepare should fail");
        assert!(matches!(err, EngineError::ExecutionError { .. }));

        assert_eq!(pool.idle_count(), 1);
        assert_eq!(driver.stats().closes(), 0);
    }

    #[tokio::test]
    async fn statement_errors_win_over_close_errors() {
        let driver = Arc::new(MockDriver::new("mock"));
        let options = PoolOptions {
            max_idle: 0,
            acquire_timeout_ms: 1_000,
        };
        let pool = ConnectionPool::new("mock", driver.clone(), "sticky", options);

        let err = pool
            .exec("fail: syntax", &[])
            .await
            .expect_err("prepare should fail");
        assert!(matches!(err, EngineError::ExecutionError { ref message } if message == "syntax"));
        assert_eq!(driver.stats().closes(), 1);

        let err = pool
            .exec("insert", &[])
            .await
            .expect_err("close failure is still reported");
        assert!(matches!(err, EngineError::ConnectionFailed { .. }));

        let tx = pool
            .begin(&Context::background(), TxOptions::default())
            .await
            .expect("begin");
        let err = tx.commit().await.expect_err("close after commit fails");
        assert!(matches!(err, EngineError::ConnectionFailed { .. }));
        assert_eq!(driver.stats().commits(), 1);
        assert_eq!(driver.stats().closes(), 3);
    }

    #[tokio::test]
    async fn begin_uses_context_begin_when_advertised() {
        let (pool, driver) = mock_pool(2);

        let mut tx = pool
            .begin(&Context::background(), TxOptions::default())
            .await
            .expect("begin");
        tx.exec("insert", &[]).await.expect("exec in tx");
        tx.commit().await.expect("commit");

        assert_eq!(driver.stats().context_begins(), 1);
        assert_eq!(driver.stats().begins(), 0);
        assert_eq!(driver.stats().commits(), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn begin_falls_back_for_plain_connections() {
        let driver = Arc::new(MockDriver::without_context_begin("plain"));
        let pool = ConnectionPool::new("plain", driver.clone(), "db1", PoolOptions::default());

        let tx = pool
            .begin(&Context::background(), TxOptions::default())
            .await
            .expect("default begin should fall back");
        tx.rollback().await.expect("rollback");
        assert_eq!(driver.stats().begins(), 1);
        assert_eq!(driver.stats().rollbacks(), 1);

        let opts = TxOptions {
            read_only: true,
            ..TxOptions::default()
        };
        let err = pool
            .begin(&Context::background(), opts)
            .await
            .err()
            .expect("options need a context-aware connection");
        assert!(matches!(err, EngineError::NotSupported { .. }));
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquire() {
        let (pool, driver) = mock_pool(2);
        pool.exec("insert", &[]).await.expect("exec");

        pool.close().await.expect("close");
        assert_eq!(driver.stats().closes(), 1);

        let err = pool.acquire().await.err().expect("closed pool");
        assert!(matches!(err, EngineError::PoolClosed));
    }
}
