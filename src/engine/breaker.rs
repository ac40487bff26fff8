//! Breaker
//!
//! A driver that wraps a native driver and can switch all access to it off
//! and back on at runtime. The breaker is installed into a `DriverRegistry`
//! under its own name; applications open pools on that name and never learn
//! they are talking to a wrapper.
//!
//! Connections handed out while the breaker is enabled stay in the
//! application's pool across a disable/enable cycle. Each of them checks the
//! shared gate on every prepare and begin, so toggling takes effect without
//! closing or reopening anything.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use crate::config::{BreakerConfig, PoolOptions};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::gate::Gate;
use crate::engine::pool::ConnectionPool;
use crate::engine::registry::DriverRegistry;
use crate::engine::traits::{Connection, Driver, Statement, Transaction};
use crate::engine::types::{Context, TxOptions};

type PoolCell = Arc<OnceCell<ConnectionPool>>;

/// Operator handle to a registered breaker
#[derive(Clone)]
pub struct Breaker {
    driver: Arc<BreakerDriver>,
}

impl Breaker {
    /// Registers a breaker named `name` over the native driver `native`
    pub fn create(
        registry: &Arc<DriverRegistry>,
        name: impl Into<String>,
        native: impl Into<String>,
    ) -> EngineResult<Self> {
        Self::create_with_config(registry, name, native, &BreakerConfig::default())
    }

    /// Like `create`, with the start state and native pool options from `config`
    pub fn create_with_config(
        registry: &Arc<DriverRegistry>,
        name: impl Into<String>,
        native: impl Into<String>,
        config: &BreakerConfig,
    ) -> EngineResult<Self> {
        let name = name.into();
        if registry.contains(&name) {
            return Err(EngineError::already_registered(name));
        }

        let native = native.into();
        let driver = Arc::new(BreakerDriver {
            name: name.clone(),
            native,
            registry: Arc::downgrade(registry),
            gate: Arc::new(Gate::new(config.start_disabled)),
            pools: Mutex::new(HashMap::new()),
            pool_options: config.pool.clone(),
        });
        registry.register(name, driver.clone())?;

        info!(
            breaker = %driver.name,
            native = %driver.native,
            disabled = config.start_disabled,
            "registered breaker driver"
        );
        Ok(Self { driver })
    }

    pub fn name(&self) -> &str {
        &self.driver.name
    }

    pub fn native_driver(&self) -> &str {
        &self.driver.native
    }

    /// Switches access off (`true`) or back on (`false`) for every connection
    pub fn set_disabled(&self, disabled: bool) {
        let was = self.driver.gate.set_disabled(disabled);
        if was != disabled {
            info!(breaker = %self.driver.name, disabled, "breaker state changed");
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.driver.gate.is_disabled()
    }

    /// Shared gate read by every connection of this breaker
    pub fn gate(&self) -> Arc<Gate> {
        Arc::clone(&self.driver.gate)
    }

    /// Opens a gated connection directly, as the registry would
    pub async fn open(&self, dsn: &str) -> EngineResult<Box<dyn Connection>> {
        self.driver.open(dsn).await
    }

    /// Native pool handle cached for `dsn`, if one was opened
    pub fn pool_handle(&self, dsn: &str) -> Option<ConnectionPool> {
        let pools = self.driver.pools.lock();
        pools.get(dsn).and_then(|cell| cell.get().cloned())
    }

    /// Data source names with a cached native pool handle, sorted
    pub fn cached_dsns(&self) -> Vec<String> {
        let pools = self.driver.pools.lock();
        let mut dsns: Vec<String> = pools
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(dsn, _)| dsn.clone())
            .collect();
        dsns.sort();
        dsns
    }
}

/// The driver a breaker installs into the registry
struct BreakerDriver {
    name: String,
    native: String,
    registry: Weak<DriverRegistry>,
    gate: Arc<Gate>,
    pools: Mutex<HashMap<String, PoolCell>>,
    pool_options: PoolOptions,
}

impl BreakerDriver {
    /// Resolves the native pool handle for `dsn`, opening it on first use
    ///
    /// The map lock only covers finding or inserting the per-name cell. The
    /// native open runs inside the cell, so concurrent first opens of one
    /// name share a single attempt and a failed attempt leaves the cell empty.
    async fn pool_handle(&self, dsn: &str) -> EngineResult<ConnectionPool> {
        let cell = {
            let mut pools = self.pools.lock();
            match pools.get(dsn) {
                Some(cell) => Arc::clone(cell),
                None => {
                    let cell = PoolCell::default();
                    pools.insert(dsn.to_string(), Arc::clone(&cell));
                    cell
                }
            }
        };

        let opened = cell
            .get_or_try_init(|| async {
                let registry = self
                    .registry
                    .upgrade()
                    .ok_or_else(|| EngineError::internal("driver registry was dropped"))?;
                let pool = registry.open_pool(&self.native, dsn, self.pool_options.clone())?;
                debug!(breaker = %self.name, native = %self.native, "opened native pool handle");
                Ok::<_, EngineError>(pool)
            })
            .await;

        match opened {
            Ok(pool) => Ok(pool.clone()),
            Err(err) => {
                self.forget_empty_cell(dsn, &cell);
                Err(err)
            }
        }
    }

    /// Drops the map entry for `dsn` if it is still the empty `cell`
    fn forget_empty_cell(&self, dsn: &str, cell: &PoolCell) {
        let mut pools = self.pools.lock();
        let stale = pools
            .get(dsn)
            .is_some_and(|entry| Arc::ptr_eq(entry, cell) && !entry.initialized());
        if stale {
            pools.remove(dsn);
        }
    }

    #[cfg(test)]
    fn pool_entries(&self) -> usize {
        self.pools.lock().len()
    }
}

#[async_trait]
impl Driver for BreakerDriver {
    fn driver_id(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, dsn), fields(breaker = %self.name))]
    async fn open(&self, dsn: &str) -> EngineResult<Box<dyn Connection>> {
        self.gate.check()?;

        let pool = self.pool_handle(dsn).await?;
        let native = pool.connect().await?;
        let context_begin = native.supports_context_begin();

        Ok(Box::new(GatedConnection {
            native,
            gate: Arc::clone(&self.gate),
            context_begin,
        }))
    }
}

/// A native connection behind a breaker's gate
///
/// Prepare and both begins check the gate on every call. Close is never
/// gated so connections can always be released.
pub struct GatedConnection {
    native: Box<dyn Connection>,
    gate: Arc<Gate>,
    context_begin: bool,
}

#[async_trait]
impl Connection for GatedConnection {
    async fn prepare(&mut self, query: &str) -> EngineResult<Box<dyn Statement>> {
        self.gate.check()?;
        self.native.prepare(query).await
    }

    async fn close(self: Box<Self>) -> EngineResult<()> {
        self.native.close().await
    }

    async fn begin(&mut self) -> EngineResult<Box<dyn Transaction>> {
        self.gate.check()?;
        self.native.begin().await
    }

    fn supports_context_begin(&self) -> bool {
        true
    }

    async fn begin_with_context(
        &mut self,
        ctx: &Context,
        opts: TxOptions,
    ) -> EngineResult<Box<dyn Transaction>> {
        self.gate.check()?;
        if !self.context_begin {
            return Err(EngineError::CapabilityUnsupported);
        }
        self.native.begin_with_context(ctx, opts).await
    }
}
