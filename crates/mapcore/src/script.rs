use std::rc::Rc;

use thiserror::Error;

use crate::engine::MapEngine;

/// Failure signal produced by the external script runtime. The core
/// propagates it without attempting recovery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("script failed: {message}")]
pub struct ScriptError {
    pub message: String,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// An opaque callable owned by maps, persons, triggers, zones and the
/// deferred queue. Whether it wraps source text, a compiled function or
/// a closure is the host's business; the core only decides when to
/// invoke it and with which engine state.
pub trait Script {
    fn invoke(&self, engine: &mut MapEngine) -> Result<(), ScriptError>;
}

/// Shared handle: one script may be referenced by several owners.
pub type ScriptHandle = Rc<dyn Script>;

/// Closure adapter for hosts and tests.
pub struct FnScript<F> {
    callback: F,
}

impl<F> FnScript<F>
where
    F: Fn(&mut MapEngine) -> Result<(), ScriptError> + 'static,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }

    pub fn handle(callback: F) -> ScriptHandle {
        Rc::new(Self::new(callback))
    }
}

impl<F> Script for FnScript<F>
where
    F: Fn(&mut MapEngine) -> Result<(), ScriptError>,
{
    fn invoke(&self, engine: &mut MapEngine) -> Result<(), ScriptError> {
        (self.callback)(engine)
    }
}
