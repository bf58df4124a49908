//! Operating modes of the engine.

use serde::{Deserialize, Serialize};

/// What the operator is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Browse only
    #[default]
    Viewer,
    /// Edit labels of a time-lapse; edits are tracked against the previous frame
    SegmentationTracking,
    /// Annotate the cell cycle
    CellCycle,
    /// Toggle custom annotations on objects
    CustomAnnotations,
    /// Edit labels of a single time point
    Snapshot,
}

impl Mode {
    /// Every mode.
    pub fn all() -> &'static [Mode] {
        &[
            Mode::Viewer,
            Mode::SegmentationTracking,
            Mode::CellCycle,
            Mode::CustomAnnotations,
            Mode::Snapshot,
        ]
    }

    /// Display name.
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Viewer => "Viewer",
            Mode::SegmentationTracking => "Segmentation and Tracking",
            Mode::CellCycle => "Cell cycle analysis",
            Mode::CustomAnnotations => "Custom annotations",
            Mode::Snapshot => "Snapshot",
        }
    }

    /// Whether label edits are allowed.
    pub fn allows_label_edits(&self) -> bool {
        matches!(self, Mode::SegmentationTracking | Mode::Snapshot)
    }

    /// Whether the mode is available for a position with `size_t` frames.
    pub fn available_for(&self, size_t: usize) -> bool {
        if size_t <= 1 {
            !matches!(self, Mode::SegmentationTracking)
        } else {
            !matches!(self, Mode::Snapshot)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_only_for_single_frame() {
        assert!(Mode::Snapshot.available_for(1));
        assert!(!Mode::Snapshot.available_for(10));
        assert!(!Mode::SegmentationTracking.available_for(1));
        assert!(Mode::CellCycle.available_for(1));
        assert!(Mode::Viewer.available_for(10));
    }

    #[test]
    fn test_edit_modes() {
        let editing: Vec<Mode> = Mode::all().iter().copied().filter(Mode::allows_label_edits).collect();
        assert_eq!(editing, vec![Mode::SegmentationTracking, Mode::Snapshot]);
    }
}
