//! Driver contracts
//!
//! These traits are the uniform interface every database driver exposes to
//! the host registry and to application pools. A breaker driver implements
//! the very same contracts, which is what lets it sit transparently between
//! an application and a native driver.

use async_trait::async_trait;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{Context, QueryResult, TxOptions, Value};

/// A named driver that can be installed into a `DriverRegistry`
#[async_trait]
pub trait Driver: Send + Sync {
    /// Returns the identifier the driver was registered under
    /// (e.g. "sqlite", "postgres", or a breaker's own name)
    fn driver_id(&self) -> &str;

    /// Validates a data source name before a pool handle is built on it
    ///
    /// Called once per pool handle, without touching the network.
    fn parse_dsn(&self, dsn: &str) -> EngineResult<()> {
        let _ = dsn;
        Ok(())
    }

    /// Opens one new connection to the given data source
    async fn open(&self, dsn: &str) -> EngineResult<Box<dyn Connection>>;
}

/// A single connection obtained from a `Driver`
#[async_trait]
pub trait Connection: Send {
    /// Prepares a statement bound to this connection
    async fn prepare(&mut self, query: &str) -> EngineResult<Box<dyn Statement>>;

    /// Closes the connection and releases its resources
    async fn close(self: Box<Self>) -> EngineResult<()>;

    /// Starts a transaction with the database defaults
    async fn begin(&mut self) -> EngineResult<Box<dyn Transaction>>;

    // ==================== Context-aware begin ====================
    // Optional capability. Connections that support it override both
    // methods below.

    /// Check if the connection supports `begin_with_context`.
    fn supports_context_begin(&self) -> bool {
        false
    }

    /// Starts a transaction honouring the caller's context and options.
    ///
    /// The context is the caller's; drivers race their work against it and
    /// never extend it.
    async fn begin_with_context(
        &mut self,
        ctx: &Context,
        opts: TxOptions,
    ) -> EngineResult<Box<dyn Transaction>> {
        let _ = (ctx, opts);
        Err(EngineError::CapabilityUnsupported)
    }
}

/// A prepared statement
#[async_trait]
pub trait Statement: Send {
    /// Runs the statement for its side effects
    async fn execute(&mut self, args: &[Value]) -> EngineResult<QueryResult>;

    /// Runs the statement and collects the rows it returns
    async fn query(&mut self, args: &[Value]) -> EngineResult<QueryResult>;

    async fn close(self: Box<Self>) -> EngineResult<()> {
        Ok(())
    }
}

/// An open transaction on one connection
#[async_trait]
pub trait Transaction: Send {
    async fn commit(self: Box<Self>) -> EngineResult<()>;

    async fn rollback(self: Box<Self>) -> EngineResult<()>;
}
