//! Undo/Redo history of a position.
//!
//! Every frame owns a bounded stack of [`FrameSnapshot`]s holding the
//! complete pre-edit state of the frame. Cell-cycle edits touch several
//! frames at once, so they are recorded on a separate stack of
//! [`CcaUndoGroup`]s that restore every touched frame together.

use std::collections::{BTreeMap, BTreeSet};

use acdc_labels::{CellId, Labels};

use crate::constants::{UNDO_DEPTH, UNDO_FRAME_LAG};
use crate::model::{AcdcTable, CcaTable, DeleteRoi, ManualEditLog};

// ============================================================================
// Snapshots
// ============================================================================

/// Complete state of one frame before an edit.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSnapshot {
    /// Label image
    pub labels: Labels,
    /// Annotation table (including cell-cycle columns)
    pub acdc: AcdcTable,
    /// Manual edit log of the position
    pub manual_edit_log: ManualEditLog,
    /// IDs of a pending keep-selection
    pub kept_ids: BTreeSet<CellId>,
    /// Delete-ROIs of the frame
    pub delete_rois: Vec<DeleteRoi>,
    /// What the edit was
    pub description: String,
}

/// Cell-cycle columns of every frame touched by one cell-cycle edit.
#[derive(Debug, Clone, PartialEq)]
pub struct CcaUndoGroup {
    /// Group identifier shared by every frame of the edit
    pub id: u64,
    /// Frame where the edit was made
    pub frame: usize,
    /// Cell-cycle columns per frame (`None` when the frame had none)
    pub tables: BTreeMap<usize, Option<CcaTable>>,
    /// What the edit was
    pub description: String,
}

// ============================================================================
// Undo Stack
// ============================================================================

/// The undo/redo history stack.
///
/// Maintains two stacks:
/// - `undo_stack`: entries that can be undone (most recent at the end)
/// - `redo_stack`: entries that can be redone (most recent at the end)
///
/// A new entry clears the redo stack. Undo and redo exchange the stored
/// entry with the current state, so the caller passes the state it replaces.
#[derive(Debug, Clone)]
pub struct UndoStack<T> {
    undo_stack: Vec<T>,
    redo_stack: Vec<T>,
    max_history: usize,
}

impl<T> Default for UndoStack<T> {
    fn default() -> Self {
        Self::new(UNDO_DEPTH)
    }
}

impl<T> UndoStack<T> {
    /// Create an empty stack keeping at most `max_history` entries.
    pub fn new(max_history: usize) -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            max_history: max_history.max(1),
        }
    }

    /// Push the pre-edit state. This clears the redo stack.
    pub fn push(&mut self, entry: T) {
        self.undo_stack.push(entry);
        self.redo_stack.clear();
        while self.undo_stack.len() > self.max_history {
            self.undo_stack.remove(0);
        }
    }

    /// Check if undo is available
    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    /// Check if redo is available
    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Take the most recent entry to undo.
    pub fn pop_undo(&mut self) -> Option<T> {
        self.undo_stack.pop()
    }

    /// Take the most recent entry to redo.
    pub fn pop_redo(&mut self) -> Option<T> {
        self.redo_stack.pop()
    }

    /// Store the state replaced by an undo.
    pub fn push_redo(&mut self, entry: T) {
        self.redo_stack.push(entry);
    }

    /// Store the state replaced by a redo, keeping the redo branch.
    pub fn push_undone(&mut self, entry: T) {
        self.undo_stack.push(entry);
    }

    /// Undo: returns the stored state and keeps `current` for redo.
    pub fn undo(&mut self, current: T) -> Option<T> {
        let entry = self.undo_stack.pop()?;
        self.redo_stack.push(current);
        Some(entry)
    }

    /// Redo: returns the stored state and keeps `current` for undo.
    pub fn redo(&mut self, current: T) -> Option<T> {
        let entry = self.redo_stack.pop()?;
        self.undo_stack.push(current);
        Some(entry)
    }

    /// Clear all history
    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    /// Get the number of entries in undo history
    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    /// Get the number of entries in redo history
    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    /// Most recent undoable entry.
    pub fn last(&self) -> Option<&T> {
        self.undo_stack.last()
    }
}

// ============================================================================
// Undo Log
// ============================================================================

/// Undo history of a position.
#[derive(Debug, Clone)]
pub struct UndoLog {
    frames: BTreeMap<usize, UndoStack<FrameSnapshot>>,
    cca: UndoStack<CcaUndoGroup>,
    depth: usize,
    next_group: u64,
}

impl Default for UndoLog {
    fn default() -> Self {
        Self::new(UNDO_DEPTH)
    }
}

impl UndoLog {
    /// Create an empty log keeping `depth` snapshots per frame.
    pub fn new(depth: usize) -> Self {
        Self {
            frames: BTreeMap::new(),
            cca: UndoStack::new(depth),
            depth,
            next_group: 1,
        }
    }

    /// Record the pre-edit state of frame `i`.
    ///
    /// The history of frame `i - 4` is discarded to bound memory.
    pub fn push(&mut self, i: usize, snapshot: FrameSnapshot) {
        log::debug!("Undo: pushed '{}' at frame {}", snapshot.description, i);
        self.frames
            .entry(i)
            .or_insert_with(|| UndoStack::new(self.depth))
            .push(snapshot);
        if let Some(old) = i.checked_sub(UNDO_FRAME_LAG) {
            if self.frames.remove(&old).is_some() {
                log::trace!("Undo: dropped history of frame {}", old);
            }
        }
    }

    /// Exchange the current state of frame `i` with its last snapshot.
    pub fn undo(&mut self, i: usize, current: FrameSnapshot) -> Option<FrameSnapshot> {
        let snapshot = self.frames.get_mut(&i)?.undo(current)?;
        log::debug!("Undo: '{}' at frame {}", snapshot.description, i);
        Some(snapshot)
    }

    /// Exchange the current state of frame `i` with its last undone state.
    pub fn redo(&mut self, i: usize, current: FrameSnapshot) -> Option<FrameSnapshot> {
        let snapshot = self.frames.get_mut(&i)?.redo(current)?;
        log::debug!("Redo: '{}' at frame {}", snapshot.description, i);
        Some(snapshot)
    }

    /// Whether frame `i` has something to undo.
    pub fn can_undo(&self, i: usize) -> bool {
        self.frames.get(&i).is_some_and(UndoStack::can_undo)
    }

    /// Whether frame `i` has something to redo.
    pub fn can_redo(&self, i: usize) -> bool {
        self.frames.get(&i).is_some_and(UndoStack::can_redo)
    }

    /// Number of snapshots stored for frame `i`.
    pub fn depth_of(&self, i: usize) -> usize {
        self.frames.get(&i).map_or(0, UndoStack::undo_count)
    }

    /// Frames that currently hold history.
    pub fn frames_with_history(&self) -> Vec<usize> {
        self.frames.keys().copied().collect()
    }

    /// Drop the history of frame `i`.
    pub fn forget_frame(&mut self, i: usize) {
        self.frames.remove(&i);
    }

    /// New identifier for a cell-cycle undo group.
    pub fn next_group_id(&mut self) -> u64 {
        let id = self.next_group;
        self.next_group += 1;
        id
    }

    /// Record the cell-cycle columns touched by an edit.
    pub fn push_cca(&mut self, group: CcaUndoGroup) {
        log::debug!(
            "Undo: pushed cell-cycle edit '{}' ({} frames)",
            group.description,
            group.tables.len()
        );
        self.cca.push(group);
    }

    /// Cell-cycle undo stack.
    pub fn cca(&self) -> &UndoStack<CcaUndoGroup> {
        &self.cca
    }

    /// Mutable cell-cycle undo stack.
    pub fn cca_mut(&mut self) -> &mut UndoStack<CcaUndoGroup> {
        &mut self.cca
    }

    /// Forget all history (after a relabel).
    pub fn clear(&mut self) {
        self.frames.clear();
        self.cca.clear();
        log::debug!("Undo history cleared");
    }
}

// ============================================================================
// Tests
// ============================================================================
