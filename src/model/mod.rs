//! Data models for positions and frames.

mod annotation;
mod cca;
mod edit_log;
mod roi;

pub use annotation::{AcdcTable, IdChanges, ObjectRow, ReconcileReport};
pub use cca::{CcaRow, CcaTable, CellCycleStage, Relationship, check_symmetry, enforce_symmetry};
pub use edit_log::{ManualEdit, ManualEditLog};
pub use roi::{DeleteRoi, RoiShape, deleted_by, export_labels};
