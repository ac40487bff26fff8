// dbreaker - driver-level circuit breaker
// Core library

pub mod config;
pub mod engine;
pub mod observability;

pub use config::{BreakerConfig, PoolOptions};
pub use engine::{Breaker, DriverRegistry, EngineError, EngineResult, Gate};
