use thiserror::Error;

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("Object {0} not present in label image")]
    ObjectNotFound(u32),

    #[error("Shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),
}

pub type Result<T> = std::result::Result<T, LabelError>;
