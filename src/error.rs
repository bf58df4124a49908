//! Error types for the frame-state engine.

use std::path::PathBuf;

use acdc_labels::{CellId, LabelError};
use thiserror::Error;

use crate::io::IoError;

/// Errors raised by engine operations.
///
/// `WrongMode`, `OutOfBounds` and `PermissionDenied` are recovered locally:
/// the operation is refused and no state is mutated.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A stored annotation table disagrees with its labels.
    #[error("Corrupted state at frame {frame}: {message}")]
    CorruptedState {
        /// Frame index of the inconsistent slot
        frame: usize,
        /// What was inconsistent
        message: String,
    },

    /// The active mode does not allow this operation.
    #[error("'{operation}' is not allowed in {mode} mode")]
    WrongMode {
        /// Operation that was refused
        operation: String,
        /// Name of the active mode
        mode: &'static str,
    },

    /// A click or coordinate fell outside the image.
    #[error("Point ({y}, {x}) is outside the {height}x{width} image")]
    OutOfBounds {
        /// Row of the rejected point
        y: i64,
        /// Column of the rejected point
        x: i64,
        /// Image height
        height: usize,
        /// Image width
        width: usize,
    },

    /// A background save currently owns the frame.
    #[error("Frame {frame} is being saved, try again when the save has finished")]
    PermissionDenied {
        /// Frame that is locked by the save worker
        frame: usize,
    },

    /// A cell-cycle assignment violates the annotation invariants.
    #[error("Cell-cycle annotation refused: {message}")]
    CcaEligibility {
        /// Why the assignment was refused
        message: String,
        /// First future frame whose annotations would have to be discarded
        /// for the assignment to go through (`None` when no override exists)
        override_from: Option<usize>,
    },

    /// A background worker failed unrecoverably.
    #[error("Worker '{worker}' failed: {message}")]
    WorkerCritical {
        /// Worker name
        worker: &'static str,
        /// Error description
        message: String,
    },

    /// The engine is in error state and refuses edits until acknowledged.
    #[error("Engine is in error state ({0}); acknowledge the error to continue")]
    ErrorState(String),

    /// No position with this index is loaded.
    #[error("Unknown position index {0}")]
    UnknownPosition(usize),

    /// Frame index outside `0..SizeT`.
    #[error("Frame {frame} is out of range (SizeT = {size_t})")]
    FrameOutOfRange {
        /// Requested frame
        frame: usize,
        /// Number of frames in the position
        size_t: usize,
    },

    /// Object ID not present in the current frame.
    #[error("Object ID {0} not found in the current frame")]
    UnknownId(CellId),

    /// Malformed operator input (ID expressions, formulas, shapes).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The operator declined a required confirmation.
    #[error("Cancelled by the operator: {0}")]
    Cancelled(String),

    /// Persistence failure.
    #[error(transparent)]
    Io(#[from] IoError),

    /// Label primitive failure.
    #[error(transparent)]
    Label(#[from] LabelError),
}

impl EngineError {
    /// Create a wrong mode error.
    pub fn wrong_mode(operation: impl Into<String>, mode: &'static str) -> Self {
        Self::WrongMode {
            operation: operation.into(),
            mode,
        }
    }

    /// Create a corrupted state error.
    pub fn corrupted(frame: usize, message: impl Into<String>) -> Self {
        Self::CorruptedState {
            frame,
            message: message.into(),
        }
    }

    /// Create a cell-cycle eligibility error without an override.
    pub fn cca_refused(message: impl Into<String>) -> Self {
        Self::CcaEligibility {
            message: message.into(),
            override_from: None,
        }
    }

    /// Create a cell-cycle eligibility error that the operator may override.
    pub fn cca_overridable(message: impl Into<String>, from_frame: usize) -> Self {
        Self::CcaEligibility {
            message: message.into(),
            override_from: Some(from_frame),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a worker critical error.
    pub fn worker_critical(worker: &'static str, message: impl Into<String>) -> Self {
        Self::WorkerCritical {
            worker,
            message: message.into(),
        }
    }

    /// Whether this error leaves the engine in error state.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::WorkerCritical { .. })
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(IoError::Io(err))
    }
}

/// Where the operator finds the session log after a critical failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    /// Error description
    pub message: String,
    /// Session log file, when logging to a file
    pub session_log: Option<PathBuf>,
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_constructors() {
        let err = EngineError::wrong_mode("brush", "Viewer");
        assert_eq!(err.to_string(), "'brush' is not allowed in Viewer mode");

        let err = EngineError::cca_overridable("mother is in S", 7);
        assert!(matches!(
            err,
            EngineError::CcaEligibility {
                override_from: Some(7),
                ..
            }
        ));
        assert!(!err.is_critical());
        assert!(EngineError::worker_critical("save", "disk full").is_critical());
    }
}
