//! Error types for reading and writing position files.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while persisting or loading position data.
#[derive(Error, Debug)]
pub enum IoError {
    /// I/O error during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure decoding an `.npz` archive
    #[error("NPZ read error: {0}")]
    NpzRead(#[from] ndarray_npy::ReadNpzError),

    /// Failure encoding an `.npz` archive
    #[error("NPZ write error: {0}")]
    NpzWrite(#[from] ndarray_npy::WriteNpzError),

    /// CSV parsing or serialization error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// ZIP archive error (annotation history)
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON parsing or serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Raster decoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Array with an unexpected shape
    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// Invalid format structure or content
    #[error("Invalid format in {path:?}: {message}")]
    InvalidFormat {
        /// File being read
        path: PathBuf,
        /// Description of the format error
        message: String,
    },

    /// Required file is missing
    #[error("File not found: {0:?}")]
    MissingFile(PathBuf),

    /// The file is held open by another program
    #[error("File is locked by another program: {0:?}")]
    FileLocked(PathBuf),
}

impl IoError {
    /// Create an invalid format error for a file.
    pub fn invalid_format(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether the error means the file is held open elsewhere.
    pub fn is_locked(&self) -> bool {
        match self {
            Self::FileLocked(_) => true,
            Self::Io(err) => err.kind() == std::io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}

/// Result alias for persistence operations.
pub type IoResult<T> = std::result::Result<T, IoError>;
