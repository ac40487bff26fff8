// Data Engine Module
// Driver contracts, the host registry and pool, and the breaker that gates them

pub mod breaker;
pub mod drivers;
pub mod error;
pub mod gate;
pub mod pool;
pub mod registry;
pub mod traits;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use breaker::{Breaker, GatedConnection};
pub use error::{EngineError, EngineResult};
pub use gate::Gate;
pub use pool::{ConnectionPool, PoolTransaction, PooledConnection};
pub use registry::DriverRegistry;
pub use traits::{Connection, Driver, Statement, Transaction};
pub use types::*;
