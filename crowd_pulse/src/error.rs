//! Error types for the density pipeline.

use thiserror::Error;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Conditions the pipeline can report. None of them abort the render loop.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The upstream message could not be turned into a `DensityFrame`.
    /// The frame is dropped and the live state is left untouched.
    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// The injected snapshot capability could not produce an image.
    #[error("Snapshot capture failed: {0}")]
    SnapshotCaptureFailed(String),

    #[error("Unknown alert: {0}")]
    UnknownAlert(String),

    /// The live session has been shut down and no longer accepts input.
    #[error("Live session closed")]
    SessionClosed,
}

impl PipelineError {
    /// Create a malformed frame error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            reason: reason.into(),
        }
    }

    /// Create a snapshot failure error.
    pub fn snapshot_failed(message: impl Into<String>) -> Self {
        Self::SnapshotCaptureFailed(message.into())
    }
}
