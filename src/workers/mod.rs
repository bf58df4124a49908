//! Background threads.
//!
//! Workers never touch the position store. They receive owned snapshots,
//! report through channels and are joined when their handle is dropped.

pub mod autosave;
pub mod chunk_loader;
pub mod save;
pub mod segmentation;

pub use autosave::{AutosaveReport, AutosaveRequest, AutosaveWorker};
pub use save::{MeasurementJob, SaveJob, SaveMessage, SaveOutcome, SaveWorker};
pub use segmentation::{
    Region, SegmentationMessage, SegmentationModel, SegmentationResult, SegmentationTask, SegmentationWorker,
    ThresholdModel,
};
