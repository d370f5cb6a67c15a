//! Typed errors for the worker-side phase pipeline.
//!
//! The gateway maps failures onto its own closed `ApiError` set at the HTTP
//! boundary; inside the worker, provider failures are matched on these
//! variants to decide how an attempt is reported.

use thiserror::Error;

/// Errors from a single phase execution in the worker pipeline.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to spawn provider process '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Phase {phase} timed out after {timeout_ms} ms")]
    PhaseTimeout { phase: String, timeout_ms: u64 },

    #[error("Provider exited with non-zero code {exit_code} in phase {phase}")]
    NonZeroExit { phase: String, exit_code: i32 },

    #[error("Failed to parse {phase} output: {reason}")]
    OutputParse { phase: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunnerError {
    /// The phase name this error is attributed to, when one is known.
    pub fn phase(&self) -> Option<&str> {
        match self {
            RunnerError::PhaseTimeout { phase, .. }
            | RunnerError::NonZeroExit { phase, .. }
            | RunnerError::OutputParse { phase, .. } => Some(phase),
            _ => None,
        }
    }
}
