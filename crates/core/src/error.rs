//! Error types for checkpoint/restore coordination
//!
//! One error enum covers the whole workspace. We use `thiserror` for the
//! `Display` and `Error` implementations.
//!
//! Propagation policy:
//! - A pre-checkpoint [`StasisError::HookFailure`] aborts the attempt and is
//!   returned to the caller that requested the checkpoint.
//! - A post-restore hook failure is reported, never returned as an error.
//! - [`StasisError::ClockRegressionDetected`] is logged and clamped by the
//!   compensator; it exists so the condition can be reported uniformly.
//! - [`StasisError::OffsetOverflow`] is the only fatal error.

use crate::time::WallTime;
use crate::types::HookPhase;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for stasis operations
pub type StasisResult<T> = std::result::Result<T, StasisError>;

/// Error types for checkpoint/restore coordination
#[derive(Debug, Error)]
pub enum StasisError {
    /// A registered hook returned an error or panicked
    #[error("{phase} hook '{hook}' failed: {message}")]
    HookFailure {
        /// Phase the hook was registered for
        phase: HookPhase,
        /// Hook name
        hook: String,
        /// Failure description
        message: String,
    },

    /// The external suspend/snapshot call failed or never resumed
    #[error("freeze mechanism failed: {reason}")]
    FreezeMechanismFailure {
        /// Failure description
        reason: String,
    },

    /// A second checkpoint request arrived while one is in progress
    #[error("checkpoint already in progress")]
    ConcurrentCheckpointRejected,

    /// Wall clock at restore is earlier than at checkpoint
    #[error("wall clock regressed across restore: checkpoint at {checkpoint_wall}, restore at {restore_wall}")]
    ClockRegressionDetected {
        /// Wall clock recorded in the epoch pair
        checkpoint_wall: WallTime,
        /// Wall clock observed on resume
        restore_wall: WallTime,
    },

    /// Compensation arithmetic cannot be represented
    #[error("clock compensation overflow: {context}")]
    OffsetOverflow {
        /// Which computation overflowed
        context: &'static str,
    },

    /// The checkpoint request was cancelled before quiescence began
    #[error("checkpoint cancelled before quiescence")]
    Cancelled,

    /// A participant did not park within the quiesce timeout
    #[error("participant '{participant}' did not quiesce within {waited:?}")]
    QuiesceTimeout {
        /// Participant name
        participant: String,
        /// How long the orchestrator waited
        waited: Duration,
    },

    /// `record_restore` was called without a pending epoch
    #[error("no pending checkpoint epoch to restore from")]
    NoPendingEpoch,

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A scheduled task specification cannot be honoured
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// A process-wide orchestrator is already installed
    #[error("process orchestrator already installed")]
    AlreadyInstalled,

    /// The timer was cancelled and accepts no further tasks
    #[error("timer '{0}' has been cancelled")]
    TimerShutdown(String),

    /// I/O error (config files, image directories, thread spawning)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StasisError {
    /// Create an invalid-config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        StasisError::InvalidConfig(msg.into())
    }

    /// Create a freeze failure error
    pub fn freeze_failure(reason: impl Into<String>) -> Self {
        StasisError::FreezeMechanismFailure {
            reason: reason.into(),
        }
    }

    /// Whether continuing would corrupt timing state
    ///
    /// Callers must abort the process on a fatal error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StasisError::OffsetOverflow { .. })
    }

    /// Whether the caller may simply retry the checkpoint
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StasisError::FreezeMechanismFailure { .. }
                | StasisError::ConcurrentCheckpointRejected
                | StasisError::QuiesceTimeout { .. }
                | StasisError::Cancelled
        )
    }
}
