//! Checkpoint hooks for Stasis
//!
//! - Hook: the "execute, may fail" capability (`FnHook` / `hook_fn` for closures)
//! - HookRegistry: ordered pre-checkpoint and post-restore sequences
//! - PostRestoreReport: best-effort outcome of the post-restore sequence

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod hook;
pub mod registry;

pub use hook::{hook_fn, FnHook, Hook, HookError};
pub use registry::{HookFailureRecord, HookHandle, HookRegistry, PostRestoreReport};
