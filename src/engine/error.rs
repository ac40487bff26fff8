//! Engine errors
//!
//! A single error type is shared by the breaker, the host registry, the
//! application pool and the native drivers. Native failures are carried in
//! their own variants with the driver's message untouched.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Returned by every gated operation while the breaker is disabled.
    #[error("access is disabled")]
    AccessDisabled,

    #[error("context-based transaction begin not supported by the underlying connection")]
    CapabilityUnsupported,

    #[error("driver {name:?} is already registered")]
    AlreadyRegistered { name: String },

    #[error("driver not found: {driver}")]
    DriverNotFound { driver: String },

    #[error("connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("authentication failed: {message}")]
    AuthFailed { message: String },

    #[error("invalid data source name: {message}")]
    InvalidDsn { message: String },

    #[error("execution error: {message}")]
    ExecutionError { message: String },

    #[error("syntax error: {message}")]
    SyntaxError { message: String },

    #[error("not supported: {message}")]
    NotSupported { message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("config error: {message}")]
    Config { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn already_registered(name: impl Into<String>) -> Self {
        Self::AlreadyRegistered { name: name.into() }
    }

    pub fn driver_not_found(driver: impl Into<String>) -> Self {
        Self::DriverNotFound {
            driver: driver.into(),
        }
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed {
            message: message.into(),
        }
    }

    pub fn invalid_dsn(message: impl Into<String>) -> Self {
        Self::InvalidDsn {
            message: message.into(),
        }
    }

    pub fn execution_error(message: impl Into<String>) -> Self {
        Self::ExecutionError {
            message: message.into(),
        }
    }

    pub fn syntax_error(message: impl Into<String>) -> Self {
        Self::SyntaxError {
            message: message.into(),
        }
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for the error the breaker reports while access is switched off.
    pub fn is_access_disabled(&self) -> bool {
        matches!(self, Self::AccessDisabled)
    }
}
