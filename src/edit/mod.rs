//! Edit operations on the labels of a visited frame.
//!
//! Every operation goes through [`commit`]: the frame is snapshotted, the
//! operation mutates a working copy of the labels, table and delete-ROIs, the
//! tracker optionally renumbers the result, and the slot is then replaced in
//! one step together with its region properties and reconciled annotation
//! table. Operations that change nothing leave no undo entry.
//!
//! Mode, error-state and save-lock checks belong to the caller
//! (see [`crate::engine::Engine`]).

mod brush;
mod ids;
mod morph;
mod relabel;
mod roi;
mod shapes;
mod split;

pub use brush::{BrushMode, BrushStroke, EraserMode, EraserStroke, apply_brush, apply_eraser};
pub use ids::{
    delete_id, delete_ids, edit_id, keep_ids, merge_ids, parse_id_expression, set_custom_annotation, set_dead,
    set_excluded,
};
pub use morph::{expand_label, fill_holes, move_label, shrink_label};
pub use relabel::relabel_sequential;
pub use roi::{add_delete_roi, move_delete_roi, remove_delete_roi};
pub use shapes::{magic_wand, paint_mask, paste_segmentation, spline_mask};
pub use split::{relabel_components, split_auto, split_manual};

use std::collections::BTreeMap;

use acdc_labels::raster::Point;
use acdc_labels::{CellId, Labels};

use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventQueue};
use crate::model::{AcdcTable, DeleteRoi, IdChanges};
use crate::position::{LabelSource, Position};
use crate::tracking::{Tracker, replay_manual_edits, track};

// ============================================================================
// Context
// ============================================================================

/// What an edit needs besides the position.
pub struct EditContext<'a> {
    /// Index of the position, for events
    pub position: usize,
    /// Where `FrameDirty` and tracking events go
    pub events: &'a mut EventQueue,
    /// Tracker to run after the edit, when tracking is on for the frame
    pub tracker: Option<&'a dyn Tracker>,
    /// Fill holes of painted objects when a brush stroke ends
    pub auto_fill_holes: bool,
}

impl<'a> EditContext<'a> {
    /// Context without tracking.
    pub fn new(position: usize, events: &'a mut EventQueue) -> Self {
        Self {
            position,
            events,
            tracker: None,
            auto_fill_holes: false,
        }
    }

    /// Run `tracker` after each edit.
    pub fn with_tracker(mut self, tracker: Option<&'a dyn Tracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Fill holes when a brush stroke ends.
    pub fn with_auto_fill_holes(mut self, enabled: bool) -> Self {
        self.auto_fill_holes = enabled;
        self
    }
}

/// Working copy handed to an operation.
#[derive(Debug, Clone)]
pub struct FrameEdit {
    /// Labels `(Z, Y, X)`
    pub labels: Labels,
    /// Annotation table, reconciled against the labels on commit
    pub acdc: AcdcTable,
    /// Delete-ROIs of the frame
    pub delete_rois: Vec<DeleteRoi>,
}

impl FrameEdit {
    /// `(height, width)` of the frame.
    pub fn size(&self) -> (usize, usize) {
        let (_, h, w) = self.labels.dim();
        (h, w)
    }

    /// ID under `(x, y)` on slice `z` (the first slice when `None`).
    pub fn id_at(&self, point: Point, z: Option<usize>) -> CellId {
        let (depth, h, w) = self.labels.dim();
        let (y, x) = (point.y.round() as usize, point.x.round() as usize);
        if y >= h || x >= w || depth == 0 {
            return 0;
        }
        self.labels[[z.unwrap_or(0).min(depth - 1), y, x]]
    }
}

// ============================================================================
// Commit
// ============================================================================

/// Reject points outside the `height × width` image.
pub(crate) fn check_bounds(point: Point, height: usize, width: usize) -> Result<()> {
    let (y, x) = (point.y.round() as i64, point.x.round() as i64);
    if y < 0 || x < 0 || y >= height as i64 || x >= width as i64 {
        return Err(EngineError::OutOfBounds { y, x, height, width });
    }
    Ok(())
}

/// Apply an operation to frame `i` and commit it.
///
/// `op` mutates the working copy and returns how IDs changed, or `None`
/// when there was nothing to do. Returns whether the frame changed.
pub(crate) fn commit<F>(pos: &mut Position, ctx: &mut EditContext<'_>, i: usize, description: &str, op: F) -> Result<bool>
where
    F: FnOnce(&mut Position, &mut FrameEdit) -> Result<Option<IdChanges>>,
{
    let slot = pos.ensure_slot(i)?;
    let mut work = FrameEdit {
        labels: slot.labels.clone(),
        acdc: slot.acdc.clone(),
        delete_rois: slot.delete_rois.clone(),
    };
    let snapshot = pos.snapshot(i, description)?;

    let Some(mut changes) = op(pos, &mut work)? else {
        log::trace!("{} at frame {} changed nothing", description, i);
        return Ok(false);
    };
    let labels_changed = work.labels != snapshot.labels;
    if !labels_changed
        && work.acdc == snapshot.acdc
        && work.delete_rois == snapshot.delete_rois
        && pos.manual_edit_log == snapshot.manual_edit_log
    {
        log::trace!("{} at frame {} changed nothing", description, i);
        return Ok(false);
    }

    if labels_changed && i > 0 {
        if let Some(tracker) = ctx.tracker {
            let source = if pos.is_visited(i - 1) {
                LabelSource::Stored
            } else {
                LabelSource::Disk
            };
            let prev = pos.get_labels(i - 1, source)?.into_owned();
            let (mut tracked, mapping) = track(tracker, &prev, &work.labels, None, pos.brush_id())?;
            let replayed = replay_manual_edits(&mut tracked, &pos.manual_edit_log);
            changes = changes.then(&mapping).then(&replayed);
            let composed = IdChanges {
                mapping: mapping.clone(),
                ..IdChanges::none()
            }
            .then(&replayed)
            .mapping;
            if !composed.is_empty() {
                ctx.events.push(EngineEvent::TrackingApplied {
                    frame: i,
                    mapping: composed,
                });
            }
            work.labels = tracked;
        }
    }

    let spacing = pos.spacing();
    let is_3d = pos.is_3d();
    let slot = pos.ensure_slot(i)?;
    slot.labels = work.labels;
    slot.acdc = work.acdc;
    slot.delete_rois = work.delete_rois;
    slot.refresh(spacing, is_3d);
    let report = slot.acdc.reconcile(&slot.state, &changes, is_3d);
    let max_id = slot.state.max_id();
    pos.bump_brush_id(max_id);
    pos.mark_modified(i);
    pos.undo.push(i, snapshot);
    ctx.events.push(EngineEvent::FrameDirty {
        position: ctx.position,
        frame: i,
    });
    log::debug!(
        "{} at frame {}: mapping {:?}, edited {:?}, added {:?}, dropped {:?}",
        description,
        i,
        changes.mapping,
        changes.edited,
        report.added,
        report.dropped
    );
    Ok(true)
}

/// Re-run the tracker on frame `i` against frame `i - 1` and re-apply the
/// manual edit log.
///
/// Without a tracker only the manual edit log is replayed. A frame already
/// tracked with no manual edits since is left untouched.
pub fn repeat_tracking(pos: &mut Position, ctx: &mut EditContext<'_>, i: usize) -> Result<bool> {
    if i == 0 {
        return Ok(false);
    }
    let tracker = ctx.tracker;
    let source = if pos.is_visited(i - 1) {
        LabelSource::Stored
    } else {
        LabelSource::Disk
    };
    let prev = pos.get_labels(i - 1, source)?.into_owned();
    let mut inner = EditContext::new(ctx.position, &mut *ctx.events);
    let mut mapping = BTreeMap::new();
    let changed = commit(pos, &mut inner, i, "repeat tracking", |pos, work| {
        let mut changes = IdChanges::none();
        if let Some(tracker) = tracker {
            let (tracked, tracked_map) = track(tracker, &prev, &work.labels, None, pos.brush_id())?;
            work.labels = tracked;
            changes = changes.then(&tracked_map);
        }
        let replayed = replay_manual_edits(&mut work.labels, &pos.manual_edit_log);
        changes = changes.then(&replayed);
        mapping = changes.mapping.clone();
        Ok((!changes.mapping.is_empty()).then_some(changes))
    })?;
    if changed {
        ctx.events.push(EngineEvent::TrackingApplied { frame: i, mapping });
    }
    Ok(changed)
}

/// Undo the last edit of frame `i`. Returns whether there was one.
pub fn undo_frame(pos: &mut Position, i: usize) -> Result<bool> {
    if !pos.undo.can_undo(i) {
        return Ok(false);
    }
    let current = pos.snapshot(i, "current")?;
    match pos.undo.undo(i, current) {
        Some(snapshot) => {
            pos.restore(i, snapshot)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Redo the last undone edit of frame `i`. Returns whether there was one.
pub fn redo_frame(pos: &mut Position, i: usize) -> Result<bool> {
    if !pos.undo.can_redo(i) {
        return Ok(false);
    }
    let current = pos.snapshot(i, "current")?;
    match pos.undo.redo(i, current) {
        Some(snapshot) => {
            pos.restore(i, snapshot)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::io::metadata::PositionMetadata;
    use crate::position::PositionLayout;

    /// Single-frame position holding `labels` (rows of the first slice).
    pub(crate) fn position_from(rows: &[&[CellId]]) -> Position {
        let h = rows.len();
        let w = rows[0].len();
        let mut labels = Labels::zeros((1, h, w));
        for (y, row) in rows.iter().enumerate() {
            for (x, &v) in row.iter().enumerate() {
                labels[[0, y, x]] = v;
            }
        }
        positions_from(vec![labels])
    }

    /// Position holding the given frames, every frame visited.
    pub(crate) fn positions_from(frames: Vec<Labels>) -> Position {
        let (_, h, w) = frames[0].dim();
        let meta = PositionMetadata::new_2d(frames.len(), h, w, "phase");
        let n = frames.len();
        let mut pos = Position::from_frames(meta, PositionLayout::new("/tmp/none", "pos", ""), frames);
        for i in 0..n {
            pos.ensure_slot(i).unwrap();
        }
        pos
    }

    pub(crate) fn ids(pos: &Position, i: usize) -> Vec<CellId> {
        pos.slot(i).unwrap().state.ids().to_vec()
    }

    #[test]
    fn test_noop_leaves_no_undo_entry() {
        let mut pos = position_from(&[&[1, 0], &[0, 0]]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);
        let changed = commit(&mut pos, &mut ctx, 0, "nothing", |_, _| Ok(None)).unwrap();
        assert!(!changed);
        let changed = commit(&mut pos, &mut ctx, 0, "same", |_, _| Ok(Some(IdChanges::none()))).unwrap();
        assert!(!changed);
        assert!(!pos.undo.can_undo(0));
        assert!(events.is_empty());
    }

    #[test]
    fn test_commit_then_undo_redo() {
        let mut pos = position_from(&[&[1, 0], &[0, 0]]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);
        commit(&mut pos, &mut ctx, 0, "paint", |_, work| {
            work.labels[[0, 1, 1]] = 4;
            Ok(Some(IdChanges::edited([4])))
        })
        .unwrap();
        assert_eq!(ids(&pos, 0), vec![1, 4]);
        assert!(pos.slot(0).unwrap().acdc.row(4).unwrap().was_manually_edited);
        assert_eq!(pos.brush_id(), 5);
        assert_eq!(events.len(), 1);

        assert!(undo_frame(&mut pos, 0).unwrap());
        assert_eq!(ids(&pos, 0), vec![1]);
        assert!(!pos.slot(0).unwrap().acdc.contains(4));
        assert!(redo_frame(&mut pos, 0).unwrap());
        assert_eq!(ids(&pos, 0), vec![1, 4]);
        assert!(!redo_frame(&mut pos, 0).unwrap());
    }

    #[test]
    fn test_repeat_tracking_follows_previous_frame() {
        let mut a = Labels::zeros((1, 3, 3));
        a[[0, 0, 0]] = 1;
        a[[0, 2, 2]] = 2;
        let mut b = Labels::zeros((1, 3, 3));
        b[[0, 0, 0]] = 2;
        b[[0, 2, 2]] = 1;
        let mut pos = positions_from(vec![a, b]);
        let tracker = crate::tracking::OverlapTracker::new(0.4);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events).with_tracker(Some(&tracker));

        assert!(repeat_tracking(&mut pos, &mut ctx, 1).unwrap());
        let slot = pos.slot(1).unwrap();
        assert_eq!(slot.labels[[0, 0, 0]], 1);
        assert_eq!(slot.labels[[0, 2, 2]], 2);
        assert!(!repeat_tracking(&mut pos, &mut ctx, 1).unwrap());
        assert!(pos.undo.can_undo(1));
    }

    #[test]
    fn test_out_of_bounds() {
        assert!(check_bounds(Point::new(4.0, 0.0), 5, 5).is_ok());
        assert!(matches!(
            check_bounds(Point::new(5.0, 0.0), 5, 5),
            Err(EngineError::OutOfBounds { .. })
        ));
        assert!(check_bounds(Point::new(0.0, -1.0), 5, 5).is_err());
    }
}
