//! Native drivers shipped with the crate

pub mod postgres;
pub mod sqlite;

use std::sync::Arc;

use crate::engine::error::EngineResult;
use crate::engine::registry::DriverRegistry;

/// Installs the built-in native drivers under their default names
pub fn register_builtin(registry: &DriverRegistry) -> EngineResult<()> {
    registry.register("sqlite", Arc::new(sqlite::SqliteDriver::new()))?;
    registry.register("postgres", Arc::new(postgres::PostgresDriver::new()))?;
    Ok(())
}
