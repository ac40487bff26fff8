//! Scripted in-memory driver for unit tests.
//!
//! Every connection reports into shared counters so tests can assert exactly
//! which native calls a wrapper let through.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::{Connection, Driver, Statement, Transaction};
use crate::engine::types::{Context, QueryResult, TxOptions, Value};

#[derive(Debug, Default)]
pub(crate) struct MockStats {
    prepares: AtomicUsize,
    closes: AtomicUsize,
    begins: AtomicUsize,
    context_begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl MockStats {
    pub(crate) fn prepares(&self) -> usize {
        self.prepares.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub(crate) fn context_begins(&self) -> usize {
        self.context_begins.load(Ordering::SeqCst)
    }

    pub(crate) fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub(crate) fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

/// DSNs starting with `bad:` fail validation, `refuse` fails to connect,
/// connections opened on `sticky` fail to close, queries starting with
/// `fail:` fail to prepare.
pub(crate) struct MockDriver {
    id: String,
    context_begin: bool,
    dsn_checks: AtomicUsize,
    opens: AtomicUsize,
    stats: Arc<MockStats>,
}

impl MockDriver {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            context_begin: true,
            dsn_checks: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            stats: Arc::new(MockStats::default()),
        }
    }

    pub(crate) fn without_context_begin(id: &str) -> Self {
        Self {
            context_begin: false,
            ..Self::new(id)
        }
    }

    pub(crate) fn dsn_checks(&self) -> usize {
        self.dsn_checks.load(Ordering::SeqCst)
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn stats(&self) -> &MockStats {
        &self.stats
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn driver_id(&self) -> &str {
        &self.id
    }

    fn parse_dsn(&self, dsn: &str) -> EngineResult<()> {
        self.dsn_checks.fetch_add(1, Ordering::SeqCst);
        if dsn.starts_with("bad:") {
            return Err(EngineError::invalid_dsn(format!("unparsable dsn {dsn:?}")));
        }
        Ok(())
    }

    async fn open(&self, dsn: &str) -> EngineResult<Box<dyn Connection>> {
        if dsn == "refuse" {
            return Err(EngineError::connection_failed("connection refused"));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            context_begin: self.context_begin,
            sticky: dsn == "sticky",
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct MockConnection {
    context_begin: bool,
    sticky: bool,
    stats: Arc<MockStats>,
}

impl MockConnection {
    fn transaction(&self) -> Box<dyn Transaction> {
        Box::new(MockTransaction {
            stats: Arc::clone(&self.stats),
        })
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn prepare(&mut self, query: &str) -> EngineResult<Box<dyn Statement>> {
        self.stats.prepares.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = query.strip_prefix("fail:") {
            return Err(EngineError::execution_error(reason.trim()));
        }
        Ok(Box::new(MockStatement))
    }

    async fn close(self: Box<Self>) -> EngineResult<()> {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        if self.sticky {
            return Err(EngineError::connection_failed("close failed"));
        }
        Ok(())
    }

    async fn begin(&mut self) -> EngineResult<Box<dyn Transaction>> {
        self.stats.begins.fetch_add(1, Ordering::SeqCst);
        Ok(self.transaction())
    }

    fn supports_context_begin(&self) -> bool {
        self.context_begin
    }

    async fn begin_with_context(
        &mut self,
        ctx: &Context,
        _opts: TxOptions,
    ) -> EngineResult<Box<dyn Transaction>> {
        if !self.context_begin {
            return Err(EngineError::CapabilityUnsupported);
        }
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        self.stats.context_begins.fetch_add(1, Ordering::SeqCst);
        Ok(self.transaction())
    }
}

struct MockStatement;

#[async_trait]
impl Statement for MockStatement {
    async fn execute(&mut self, _args: &[Value]) -> EngineResult<QueryResult> {
        Ok(QueryResult::with_affected_rows(1, 0.0))
    }

    async fn query(&mut self, _args: &[Value]) -> EngineResult<QueryResult> {
        Ok(QueryResult::empty())
    }
}

struct MockTransaction {
    stats: Arc<MockStats>,
}

#[async_trait]
impl Transaction for MockTransaction {
    async fn commit(self: Box<Self>) -> EngineResult<()> {
        self.stats.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> EngineResult<()> {
        self.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
