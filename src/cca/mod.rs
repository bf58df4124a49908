//! Cell-cycle engine.
//!
//! Keeps the cell-cycle columns of every visited frame consistent across
//! time: division annotation and its undo, bud-to-mother assignment with
//! eligibility checks, initialisation of newly visited frames with automatic
//! bud assignment, and the check for S-phase pairs that lose a partner.
//!
//! Every edit records the previous columns of each frame it touches in a
//! [`CcaRecorder`]; the recorder becomes one [`CcaUndoGroup`] so that undo
//! restores all frames of the edit together.

mod assign;
mod division;
mod frame;

pub use assign::assign_bud;
pub use division::{annotate_division, undo_division};
pub use frame::{check_disappearing, first_frame_without_cca, init_frame};

use std::collections::{BTreeMap, BTreeSet};

use acdc_labels::{CellId, unique_ids};

use crate::error::Result;
use crate::model::{CcaRow, CcaTable};
use crate::position::{LabelSource, Position};
use crate::undo::CcaUndoGroup;

/// Previous cell-cycle columns of every frame touched by one edit.
#[derive(Debug)]
pub struct CcaRecorder {
    frame: usize,
    description: String,
    tables: BTreeMap<usize, Option<CcaTable>>,
}

impl CcaRecorder {
    /// Start recording an edit made at `frame`.
    pub fn new(frame: usize, description: impl Into<String>) -> Self {
        Self {
            frame,
            description: description.into(),
            tables: BTreeMap::new(),
        }
    }

    /// Remember the columns of frame `j` before the first change to it.
    pub fn touch(&mut self, pos: &Position, j: usize) {
        self.tables
            .entry(j)
            .or_insert_with(|| pos.slot(j).and_then(|s| s.acdc.cca().cloned()));
    }

    /// Whether no frame was touched.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Frames touched so far.
    pub fn frames(&self) -> impl Iterator<Item = usize> + '_ {
        self.tables.keys().copied()
    }

    /// Push the recorded columns on the cell-cycle undo stack.
    pub fn commit(self, pos: &mut Position) {
        if self.tables.is_empty() {
            return;
        }
        for &j in self.tables.keys() {
            pos.mark_modified(j);
        }
        let group = CcaUndoGroup {
            id: pos.undo.next_group_id(),
            frame: self.frame,
            tables: self.tables,
            description: self.description,
        };
        pos.undo.push_cca(group);
    }

    /// Put the recorded columns back without touching the undo stack.
    pub fn rollback(self, pos: &mut Position) {
        for (j, table) in self.tables {
            if let Some(slot) = pos.slot_mut(j) {
                slot.acdc.set_cca(table);
            }
        }
    }
}

/// Cell-cycle row of `id` at frame `j`.
pub(crate) fn row(pos: &Position, j: usize, id: CellId) -> Option<CcaRow> {
    pos.slot(j)?.acdc.cca_row(id).copied()
}

/// Whether frame `j` carries cell-cycle columns.
pub(crate) fn has_cca(pos: &Position, j: usize) -> bool {
    pos.slot(j).is_some_and(|s| s.acdc.has_cca())
}

/// Overwrite the row of `id` at frame `j`, recording the frame first.
pub(crate) fn set_row(pos: &mut Position, rec: &mut CcaRecorder, j: usize, id: CellId, new: CcaRow) {
    rec.touch(pos, j);
    if let Some(row) = pos.slot_mut(j).and_then(|s| s.acdc.cca_row_mut(id)) {
        *row = new;
    }
}

/// First frame carrying cell-cycle columns.
pub(crate) fn first_cca_frame(pos: &Position) -> Option<usize> {
    (0..pos.size_t()).find(|&j| has_cca(pos, j))
}

/// Object IDs of frame `j`, from its slot or from disk.
pub(crate) fn frame_ids(pos: &mut Position, j: usize) -> Result<BTreeSet<CellId>> {
    if let Some(slot) = pos.slot(j) {
        return Ok(slot.state.ids().iter().copied().collect());
    }
    Ok(unique_ids(&*pos.get_labels(j, LabelSource::Disk)?))
}

/// Restore the cell-cycle columns of the last cell-cycle edit.
///
/// Returns the frame the edit was made at.
pub fn undo(pos: &mut Position) -> Option<usize> {
    let group = pos.undo.cca_mut().pop_undo()?;
    let current = current_group(pos, &group);
    pos.undo.cca_mut().push_redo(current);
    log::debug!("Undo cell-cycle edit '{}'", group.description);
    Some(apply_group(pos, group))
}

/// Re-apply the last undone cell-cycle edit.
pub fn redo(pos: &mut Position) -> Option<usize> {
    let group = pos.undo.cca_mut().pop_redo()?;
    let current = current_group(pos, &group);
    pos.undo.cca_mut().push_undone(current);
    log::debug!("Redo cell-cycle edit '{}'", group.description);
    Some(apply_group(pos, group))
}

fn current_group(pos: &Position, group: &CcaUndoGroup) -> CcaUndoGroup {
    CcaUndoGroup {
        id: group.id,
        frame: group.frame,
        tables: group
            .tables
            .keys()
            .map(|&j| (j, pos.slot(j).and_then(|s| s.acdc.cca().cloned())))
            .collect(),
        description: group.description.clone(),
    }
}

fn apply_group(pos: &mut Position, group: CcaUndoGroup) -> usize {
    for (j, table) in group.tables {
        if let Some(slot) = pos.slot_mut(j) {
            slot.acdc.set_cca(table);
            pos.mark_modified(j);
        }
    }
    group.frame
}
