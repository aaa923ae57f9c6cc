//! The external freeze/resume mechanism
//!
//! The orchestrator hands control to a [`FreezeMechanism`] at the
//! `Quiescing -> Frozen` transition. The call blocks for the whole freeze and
//! returns only after the process has been resumed, or fails outright.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use stasis_core::{StasisError, WallTime};

/// File written into the image directory by [`SignalStopFreeze`]
pub const MARKER_FILE_NAME: &str = "checkpoint.json";

/// Proof that the process was resumed after a freeze
///
/// Carries no payload: a restored process cannot trust anything the freeze
/// mechanism measured before it was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResumeSignal;

/// Errors reported by a freeze mechanism
#[derive(Debug, Error)]
pub enum FreezeError {
    /// I/O while preparing the image location
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The mechanism ran and failed
    #[error("{0}")]
    Failed(String),

    /// The mechanism cannot run on this platform
    #[error("freeze mechanism not supported on this platform")]
    Unsupported,
}

impl From<FreezeError> for StasisError {
    fn from(e: FreezeError) -> Self {
        StasisError::freeze_failure(e.to_string())
    }
}

/// Black-box suspend-and-snapshot operation
pub trait FreezeMechanism: Send + Sync {
    /// Name for logging
    fn name(&self) -> &str;

    /// Suspend the process and persist its image under `image_dir`
    ///
    /// Blocks until the process is resumed. The image format belongs entirely
    /// to the mechanism.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot could not be taken. The process was
    /// never frozen in that case.
    fn suspend_and_snapshot(&self, image_dir: &Path) -> Result<ResumeSignal, FreezeError>;
}

/// Marker describing a checkpoint request, read by external tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMarker {
    /// Process to dump
    pub pid: u32,
    /// Wall-clock instant the freeze was requested (RFC 3339)
    pub requested_at: String,
    /// Directory the image should be written to
    pub image_dir: PathBuf,
}

/// Stop the whole process with `SIGSTOP` after writing a checkpoint marker
///
/// External tooling (a CRIU wrapper, an operator) picks up the marker, dumps
/// the stopped process and later continues it with `SIGCONT`, at which point
/// `suspend_and_snapshot` returns.
#[derive(Debug, Clone, Default)]
pub struct SignalStopFreeze;

impl SignalStopFreeze {
    /// Create the mechanism
    pub fn new() -> Self {
        Self
    }

    /// Create `image_dir` and write the checkpoint marker into it
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory or marker cannot be written.
    pub fn write_marker(&self, image_dir: &Path) -> Result<PathBuf, FreezeError> {
        std::fs::create_dir_all(image_dir)?;
        let marker = CheckpointMarker {
            pid: std::process::id(),
            requested_at: WallTime::now().to_rfc3339(),
            image_dir: image_dir.to_path_buf(),
        };
        let json = serde_json::to_vec_pretty(&marker)
            .map_err(|e| FreezeError::Failed(format!("failed to encode marker: {}", e)))?;
        let path = image_dir.join(MARKER_FILE_NAME);
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

impl FreezeMechanism for SignalStopFreeze {
    fn name(&self) -> &str {
        "sigstop"
    }

    #[cfg(unix)]
    fn suspend_and_snapshot(&self, image_dir: &Path) -> Result<ResumeSignal, FreezeError> {
        let marker = self.write_marker(image_dir)?;
        info!(
            target: "stasis::checkpoint",
            marker = %marker.display(),
            "Stopping process for snapshot"
        );

        // SAFETY: raise() has no memory-safety preconditions. SIGSTOP cannot be
        // caught, so execution continues here only after SIGCONT.
        let rc = unsafe { libc::raise(libc::SIGSTOP) };
        if rc != 0 {
            return Err(FreezeError::Io(io::Error::last_os_error()));
        }
        Ok(ResumeSignal)
    }

    #[cfg(not(unix))]
    fn suspend_and_snapshot(&self, _image_dir: &Path) -> Result<ResumeSignal, FreezeError> {
        Err(FreezeError::Unsupported)
    }
}
