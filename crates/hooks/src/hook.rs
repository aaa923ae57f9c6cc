//! The hook capability
//!
//! A hook is a named, zero-argument action that may fail. Subsystems own their
//! hooks; the registry only stores and invokes them.

use std::fmt;
use std::sync::Arc;

/// Error returned by a failing hook
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// A callback run before a checkpoint or after a restore
pub trait Hook: Send + Sync {
    /// Human-readable name for logging and failure reports
    fn name(&self) -> &str;

    /// Execute the hook
    ///
    /// # Errors
    ///
    /// Any error is reported as a `HookFailure` for the phase being run.
    fn run(&self) -> Result<(), HookError>;
}

/// Hook backed by a closure
pub struct FnHook<F> {
    name: String,
    action: F,
}

impl<F> FnHook<F>
where
    F: Fn() -> Result<(), HookError> + Send + Sync,
{
    /// Wrap a closure
    pub fn new(name: impl Into<String>, action: F) -> Self {
        Self {
            name: name.into(),
            action,
        }
    }
}

impl<F> Hook for FnHook<F>
where
    F: Fn() -> Result<(), HookError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<(), HookError> {
        (self.action)()
    }
}

impl<F> fmt::Debug for FnHook<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHook").field("name", &self.name).finish()
    }
}

/// Shorthand for registering a closure as a hook
///
/// ```
/// use stasis_hooks::{hook_fn, HookRegistry};
///
/// let registry = HookRegistry::new();
/// registry.register_pre_checkpoint(hook_fn("flush", || Ok(())));
/// ```
pub fn hook_fn<F>(name: impl Into<String>, action: F) -> Arc<dyn Hook>
where
    F: Fn() -> Result<(), HookError> + Send + Sync + 'static,
{
    Arc::new(FnHook::new(name, action))
}
