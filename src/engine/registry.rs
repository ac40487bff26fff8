//! Driver Registry
//!
//! Named-driver registry the breaker plugs into. Names are unique for the
//! lifetime of the registry and entries are never removed.
//!
//! Callers normally pass an `Arc<DriverRegistry>` around explicitly; the
//! process-wide instance returned by `DriverRegistry::global()` is only a
//! convenience for applications that want one shared namespace.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::config::PoolOptions;
use crate::engine::drivers;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::pool::ConnectionPool;
use crate::engine::traits::Driver;

static GLOBAL: OnceLock<Arc<DriverRegistry>> = OnceLock::new();

/// Registry that holds all installed drivers by name
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn Driver>>>,
}

impl DriverRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry with the built-in native drivers installed
    pub fn with_builtin_drivers() -> EngineResult<Self> {
        let registry = Self::new();
        drivers::register_builtin(&registry)?;
        Ok(registry)
    }

    /// Process-wide registry, seeded with the built-in native drivers
    pub fn global() -> Arc<DriverRegistry> {
        let registry = GLOBAL.get_or_init(|| {
            let registry = DriverRegistry::new();
            // A fresh registry has no names to collide with.
            let _ = drivers::register_builtin(&registry);
            Arc::new(registry)
        });
        Arc::clone(registry)
    }

    /// Installs a driver under `name`
    ///
    /// Fails with `AlreadyRegistered` if the name is taken; the existing
    /// entry is left untouched.
    pub fn register(&self, name: impl Into<String>, driver: Arc<dyn Driver>) -> EngineResult<()> {
        let name = name.into();
        let mut drivers = self.drivers.write();
        if drivers.contains_key(&name) {
            return Err(EngineError::already_registered(name));
        }
        drivers.insert(name, driver);
        Ok(())
    }

    /// Gets a driver by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.drivers.read().contains_key(name)
    }

    /// Lists all registered names, sorted
    pub fn drivers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the number of registered drivers
    pub fn len(&self) -> usize {
        self.drivers.read().len()
    }

    /// Returns true if no drivers are registered
    pub fn is_empty(&self) -> bool {
        self.drivers.read().is_empty()
    }

    /// Builds a connection pool over the driver registered as `name`
    ///
    /// No connection is opened here; the driver only validates the data
    /// source name.
    pub fn open_pool(
        &self,
        name: &str,
        dsn: &str,
        options: PoolOptions,
    ) -> EngineResult<ConnectionPool> {
        let driver = self
            .get(name)
            .ok_or_else(|| EngineError::driver_not_found(name))?;
        driver.parse_dsn(dsn)?;
        Ok(ConnectionPool::new(name, driver, dsn, options))
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
