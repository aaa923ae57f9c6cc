//! Optional process-wide orchestrator slot
//!
//! Most code should receive the orchestrator explicitly. The slot exists for
//! call sites that cannot be threaded through, such as signal-triggered
//! checkpoints. It is set at most once and lives until process exit.

use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::info;

use stasis_core::{StasisError, StasisResult};

use crate::orchestrator::CheckpointOrchestrator;

static PROCESS_ORCHESTRATOR: OnceCell<Arc<CheckpointOrchestrator>> = OnceCell::new();

/// Install the process-wide orchestrator
///
/// # Errors
///
/// Returns `AlreadyInstalled` if one was installed before.
pub fn install_process_orchestrator(orchestrator: Arc<CheckpointOrchestrator>) -> StasisResult<()> {
    PROCESS_ORCHESTRATOR
        .set(orchestrator)
        .map_err(|_| StasisError::AlreadyInstalled)?;
    info!(target: "stasis::checkpoint", "Process orchestrator installed");
    Ok(())
}

/// The process-wide orchestrator, if one was installed
pub fn process_orchestrator() -> Option<Arc<CheckpointOrchestrator>> {
    PROCESS_ORCHESTRATOR.get().cloned()
}
