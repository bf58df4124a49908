//! Propagation of an edit to the frames after the one it was made on.
//!
//! The edit itself is applied to frame `i` through the regular edit path
//! (with undo). Propagation then repeats it on later frames according to a
//! [`PropagationPolicy`]. Later visited frames are changed in place without
//! undo entries; unvisited frames are changed in the on-disk segmentation
//! without creating slots.

use std::collections::BTreeSet;

use acdc_labels::components::apply_mapping;
use acdc_labels::{CellId, Labels, unique_ids};
use serde::{Deserialize, Serialize};

use crate::edit::{self, EditContext};
use crate::error::Result;
use crate::events::EngineEvent;
use crate::model::{AcdcTable, IdChanges};
use crate::position::Position;

/// How an edit made at frame `i` extends to later frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationPolicy {
    /// Only frame `i`
    #[default]
    ThisFrameOnly,
    /// Forget visited frames after `i`; they are rebuilt on the next visit
    ReinitFuture,
    /// Repeat the edit on the visited frames after `i`, up to the first
    /// unvisited one
    ApplyVisitedFuture,
    /// Repeat the edit on every later frame, including unvisited ones
    ApplyAllFuture,
    /// Re-track the visited frames after `i` so the manual edit log applies
    TrackingOnly,
}

impl PropagationPolicy {
    /// Every policy, in menu order.
    pub fn all() -> &'static [PropagationPolicy] {
        &[
            PropagationPolicy::ThisFrameOnly,
            PropagationPolicy::ReinitFuture,
            PropagationPolicy::ApplyVisitedFuture,
            PropagationPolicy::ApplyAllFuture,
            PropagationPolicy::TrackingOnly,
        ]
    }
}

/// Operation kinds with a remembered propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagatedKind {
    /// Delete ID
    DeleteId,
    /// Edit ID
    EditId,
    /// Exclude from analysis
    Bin,
    /// Mark as dead
    Rip,
    /// Keep only selected IDs
    Keep,
}

/// An edit that can be repeated on other frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropagatedOp {
    /// Delete these IDs
    DeleteIds(BTreeSet<CellId>),
    /// Give `old` the ID `new`, swapping or merging when `new` exists
    EditId {
        /// Current ID
        old: CellId,
        /// Requested ID
        new: CellId,
        /// Merge instead of swap when `new` exists
        merge: bool,
    },
    /// Set or clear the excluded flag
    Bin {
        /// Affected IDs
        ids: BTreeSet<CellId>,
        /// New flag value
        value: bool,
    },
    /// Set or clear the dead flag
    Rip {
        /// Affected IDs
        ids: BTreeSet<CellId>,
        /// New flag value
        value: bool,
    },
    /// Delete every ID except these
    Keep(BTreeSet<CellId>),
}

impl PropagatedOp {
    /// Kind used to look up the remembered policy.
    pub fn kind(&self) -> PropagatedKind {
        match self {
            PropagatedOp::DeleteIds(_) => PropagatedKind::DeleteId,
            PropagatedOp::EditId { .. } => PropagatedKind::EditId,
            PropagatedOp::Bin { .. } => PropagatedKind::Bin,
            PropagatedOp::Rip { .. } => PropagatedKind::Rip,
            PropagatedOp::Keep(_) => PropagatedKind::Keep,
        }
    }

    /// Apply the edit to frame `i` through the undoable edit path.
    pub fn apply_current(&self, pos: &mut Position, ctx: &mut EditContext<'_>, i: usize) -> Result<bool> {
        match self {
            PropagatedOp::DeleteIds(ids) => edit::delete_ids(pos, ctx, i, ids),
            PropagatedOp::EditId { old, new, merge } => edit::edit_id(pos, ctx, i, *old, *new, *merge),
            PropagatedOp::Bin { ids, value } => edit::set_excluded(pos, ctx, i, ids, *value),
            PropagatedOp::Rip { ids, value } => edit::set_dead(pos, ctx, i, ids, *value),
            PropagatedOp::Keep(ids) => edit::keep_ids(pos, ctx, i, ids),
        }
    }

    /// Apply the edit to raw labels and annotation flags.
    ///
    /// Row re-keying is left to the caller. Returns `None` when nothing
    /// changed.
    fn apply(&self, labels: &mut Labels, acdc: Option<&mut AcdcTable>) -> Option<IdChanges> {
        match self {
            PropagatedOp::DeleteIds(ids) => zero_where(labels, |v| ids.contains(&v)).then(IdChanges::none),
            PropagatedOp::Keep(ids) => zero_where(labels, |v| !ids.contains(&v)).then(IdChanges::none),
            PropagatedOp::EditId { old, new, merge } => {
                let present = unique_ids(labels);
                if old == new || *new == 0 || !present.contains(old) {
                    return None;
                }
                let changes = if !present.contains(new) {
                    IdChanges::rename(*old, *new)
                } else if *merge {
                    IdChanges::merge(*old, *new)
                } else {
                    IdChanges::swap(*old, *new)
                };
                apply_mapping(labels, &changes.mapping);
                Some(changes)
            }
            PropagatedOp::Bin { ids, value } => {
                let acdc = acdc?;
                set_flags(acdc, ids, |row| &mut row.is_cell_excluded, *value).then(IdChanges::none)
            }
            PropagatedOp::Rip { ids, value } => {
                let acdc = acdc?;
                set_flags(acdc, ids, |row| &mut row.is_cell_dead, *value).then(IdChanges::none)
            }
        }
    }
}

fn zero_where<F: Fn(CellId) -> bool>(labels: &mut Labels, pred: F) -> bool {
    let mut any = false;
    labels.mapv_inplace(|v| {
        if v > 0 && pred(v) {
            any = true;
            0
        } else {
            v
        }
    });
    any
}

fn set_flags<F>(acdc: &mut AcdcTable, ids: &BTreeSet<CellId>, flag: F, value: bool) -> bool
where
    F: Fn(&mut crate::model::ObjectRow) -> &mut bool,
{
    let mut any = false;
    for &id in ids {
        if let Some(row) = acdc.row_mut(id) {
            let f = flag(row);
            any |= *f != value;
            *f = value;
        }
    }
    any
}

/// Frames touched by a propagation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationReport {
    /// Visited frames changed in place
    pub visited: Vec<usize>,
    /// Unvisited frames changed on disk
    pub unvisited: Vec<usize>,
    /// Frames forgotten for re-initialisation
    pub reinitialized: Vec<usize>,
    /// Frames re-tracked
    pub retracked: Vec<usize>,
}

impl PropagationReport {
    /// Whether no frame was touched.
    pub fn is_empty(&self) -> bool {
        self.visited.is_empty() && self.unvisited.is_empty() && self.reinitialized.is_empty() && self.retracked.is_empty()
    }
}

/// Repeat `op`, already applied at frame `i`, on the frames after `i`.
pub fn propagate(
    pos: &mut Position,
    ctx: &mut EditContext<'_>,
    i: usize,
    op: &PropagatedOp,
    policy: PropagationPolicy,
) -> Result<PropagationReport> {
    let mut report = PropagationReport::default();
    let future = i + 1..pos.size_t();
    match policy {
        PropagationPolicy::ThisFrameOnly => {}
        PropagationPolicy::ReinitFuture => {
            if let Some(last) = pos.last_visited() {
                for j in i + 1..=last {
                    if pos.clear_slot(j).is_some() {
                        report.reinitialized.push(j);
                    }
                }
            }
        }
        PropagationPolicy::ApplyVisitedFuture | PropagationPolicy::ApplyAllFuture => {
            let include_unvisited = policy == PropagationPolicy::ApplyAllFuture;
            for j in future {
                if pos.is_visited(j) {
                    if apply_to_slot(pos, ctx, j, op) {
                        report.visited.push(j);
                    }
                } else if include_unvisited {
                    if apply_to_disk(pos, j, op)? {
                        report.unvisited.push(j);
                    }
                } else {
                    break;
                }
            }
        }
        PropagationPolicy::TrackingOnly => {
            for j in future {
                if !pos.is_visited(j) {
                    break;
                }
                if edit::repeat_tracking(pos, ctx, j)? {
                    report.retracked.push(j);
                }
            }
        }
    }
    if !report.is_empty() {
        log::info!("Propagated {:?} from frame {} ({:?}): {:?}", op.kind(), i, policy, report);
    }
    Ok(report)
}

fn apply_to_slot(pos: &mut Position, ctx: &mut EditContext<'_>, j: usize, op: &PropagatedOp) -> bool {
    let spacing = pos.spacing();
    let is_3d = pos.is_3d();
    let Some(slot) = pos.slot_mut(j) else {
        return false;
    };
    let Some(changes) = op.apply(&mut slot.labels, Some(&mut slot.acdc)) else {
        return false;
    };
    slot.refresh(spacing, is_3d);
    slot.acdc.reconcile(&slot.state, &changes, is_3d);
    pos.mark_modified(j);
    ctx.events.push(EngineEvent::FrameDirty {
        position: ctx.position,
        frame: j,
    });
    true
}

fn apply_to_disk(pos: &mut Position, j: usize, op: &PropagatedOp) -> Result<bool> {
    let Some(labels) = pos.disk.get_mut(j)? else {
        return Ok(false);
    };
    let Some(changes) = op.apply(labels, pos.disk_acdc.get_mut(&j)) else {
        return Ok(false);
    };
    let present = unique_ids(labels);
    if let Some(table) = pos.disk_acdc.get_mut(&j) {
        table.apply_mapping(&changes.mapping);
        let stale: Vec<CellId> = table.ids().filter(|id| !present.contains(id)).collect();
        for id in stale {
            table.remove(id);
        }
    }
    pos.mark_modified(j);
    Ok(true)
}
