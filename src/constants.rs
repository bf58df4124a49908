//! Global constants for the frame-state engine

/// Maximum number of undo snapshots kept per frame
pub const UNDO_DEPTH: usize = 5;

/// Editing frame `i` drops the undo history of frame `i - UNDO_FRAME_LAG`
pub const UNDO_FRAME_LAG: usize = 4;

/// Default brush and eraser radius in pixels
pub const DEFAULT_BRUSH_RADIUS: f64 = 4.0;

/// Minimum intersection-over-area for the overlap tracker to link two objects
pub const DEFAULT_OVERLAP_THRESHOLD: f64 = 0.4;

/// Convexity defects shallower than this (pixels) are ignored by auto-split
pub const MIN_DEFECT_DEPTH: f64 = 1.0;

/// Number of frames handed over per chunk by the lazy segmentation loader
pub const DEFAULT_CHUNK_SIZE: usize = 16;

/// Default flood-fill tolerance for the magic wand (image intensity units)
pub const DEFAULT_WAND_TOLERANCE: f32 = 0.1;

/// Samples per segment when rasterising closed splines
pub const SPLINE_SAMPLES_PER_SEGMENT: usize = 16;

/// Sub-directory of a position holding autosave artifacts
pub const RECOVERY_DIR: &str = ".recovery";

/// Sub-directory of a position holding the channel rasters
pub const IMAGES_DIR: &str = "Images";

/// Annotation columns dropped when writing the table
pub const DEPRECATED_COLUMNS: &[&str] = &[
    "editIDclicked_x",
    "editIDclicked_y",
    "editIDnewID",
    "editIDnewIDs",
];
