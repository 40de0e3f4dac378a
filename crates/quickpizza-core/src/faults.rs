//! Fault injection check points.
//!
//! The catalog polls a [`FaultInjector`] at named points before guarded
//! operations. An armed point yields an [`InjectedFault`] that the catalog
//! returns unchanged, without touching storage.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::context::Context;

pub mod checkpoints {
    pub const GET_INGREDIENTS: &str = "get-ingredients";
    pub const RECORD_RECOMMENDATION: &str = "record-recommendation";
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{message}")]
pub struct InjectedFault {
    pub point: String,
    pub message: String,
}

impl InjectedFault {
    #[must_use]
    pub fn new(point: impl Into<String>, message: impl Into<String>) -> Self {
        Self { point: point.into(), message: message.into() }
    }
}

pub trait FaultInjector: Send + Sync {
    /// # Errors
    /// Returns the synthetic fault when `point` is armed.
    fn check(&self, ctx: &Context, point: &str) -> Result<(), InjectedFault>;
}

/// Never fails. The default hook for production wiring.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn check(&self, _ctx: &Context, _point: &str) -> Result<(), InjectedFault> {
        Ok(())
    }
}

/// A set of armed check points, each with the message its fault carries.
#[derive(Debug, Default)]
pub struct ArmedCheckpoints {
    armed: Mutex<BTreeMap<String, String>>,
}

impl ArmedCheckpoints {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, point: impl Into<String>, message: impl Into<String>) {
        self.armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(point.into(), message.into());
    }

    pub fn disarm(&self, point: &str) {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner).remove(point);
    }

    #[must_use]
    pub fn is_armed(&self, point: &str) -> bool {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner).contains_key(point)
    }
}

impl FaultInjector for ArmedCheckpoints {
    fn check(&self, _ctx: &Context, point: &str) -> Result<(), InjectedFault> {
        let armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        match armed.get(point) {
            Some(message) => Err(InjectedFault::new(point, message.clone())),
            None => Ok(()),
        }
    }
}
