//! Gate
//!
//! The on/off switch behind a breaker. Every gated call on every connection
//! reads it; only the operator writes it.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::engine::error::{EngineError, EngineResult};

#[derive(Debug, Default)]
pub struct Gate {
    disabled: AtomicBool,
}

impl Gate {
    pub fn new(disabled: bool) -> Self {
        Self {
            disabled: AtomicBool::new(disabled),
        }
    }

    /// Lock-free read of the current state
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Overwrites the state and returns the previous one
    pub fn set_disabled(&self, disabled: bool) -> bool {
        self.disabled.swap(disabled, Ordering::AcqRel)
    }

    /// Fails with `AccessDisabled` while the gate is off
    #[inline]
    pub fn check(&self) -> EngineResult<()> {
        if self.is_disabled() {
            return Err(EngineError::AccessDisabled);
        }
        Ok(())
    }
}
