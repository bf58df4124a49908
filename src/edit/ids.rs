//! ID-level edits: edit ID, delete, keep, merge.

use std::collections::BTreeSet;

use acdc_labels::CellId;
use acdc_labels::components::apply_mapping;

use super::{EditContext, FrameEdit, commit};
use crate::error::{EngineError, Result};
use crate::model::{IdChanges, ManualEdit};
use crate::position::Position;

fn present(work: &FrameEdit) -> BTreeSet<CellId> {
    work.labels.iter().copied().filter(|&v| v > 0).collect()
}

/// Manual-edit-log entry pinning the object `id` of frame `i` to `new_id`.
fn log_entry(pos: &Position, i: usize, id: CellId, new_id: CellId) -> Option<ManualEdit> {
    let rp = pos.slot(i)?.state.get(id)?;
    let [z, y, x] = rp.representative_point();
    Some(ManualEdit {
        z: pos.is_3d().then_some(z),
        y,
        x,
        new_id,
    })
}

/// Give object `old` of frame `i` the ID `new`.
///
/// When `new` is already used the two objects swap IDs, or `old` is merged
/// into `new` when `merge_if_exists` is set. The assignment is added to the
/// manual edit log so that re-tracking keeps it.
pub fn edit_id(
    pos: &mut Position,
    ctx: &mut EditContext<'_>,
    i: usize,
    old: CellId,
    new: CellId,
    merge_if_exists: bool,
) -> Result<bool> {
    if new == 0 {
        return Err(EngineError::invalid_input("the new ID must be positive"));
    }
    if old == new {
        return Ok(false);
    }
    commit(pos, ctx, i, "edit ID", |pos, work| {
        let ids = present(work);
        if !ids.contains(&old) {
            return Err(EngineError::UnknownId(old));
        }
        let mut entries: Vec<ManualEdit> = log_entry(pos, i, old, new).into_iter().collect();
        let changes = if !ids.contains(&new) {
            IdChanges::rename(old, new)
        } else if merge_if_exists {
            IdChanges::merge(old, new)
        } else {
            entries.extend(log_entry(pos, i, new, old));
            IdChanges::swap(old, new)
        };
        apply_mapping(&mut work.labels, &changes.mapping);
        for entry in entries {
            pos.push_manual_edit(entry);
        }
        Ok(Some(changes))
    })
}

/// Delete a set of objects from frame `i`. Absent IDs are ignored.
pub fn delete_ids(pos: &mut Position, ctx: &mut EditContext<'_>, i: usize, ids: &BTreeSet<CellId>) -> Result<bool> {
    commit(pos, ctx, i, "delete IDs", |_, work| {
        let mut deleted = false;
        work.labels.mapv_inplace(|v| {
            if v > 0 && ids.contains(&v) {
                deleted = true;
                0
            } else {
                v
            }
        });
        Ok(deleted.then(IdChanges::none))
    })
}

/// Delete object `id` from frame `i`. An absent ID is not an error.
pub fn delete_id(pos: &mut Position, ctx: &mut EditContext<'_>, i: usize, id: CellId) -> Result<bool> {
    delete_ids(pos, ctx, i, &BTreeSet::from([id]))
}

/// Delete every object of frame `i` except `keep`, and clear the pending
/// keep-selection.
pub fn keep_ids(pos: &mut Position, ctx: &mut EditContext<'_>, i: usize, keep: &BTreeSet<CellId>) -> Result<bool> {
    commit(pos, ctx, i, "keep IDs", |pos, work| {
        let mut deleted = false;
        work.labels.mapv_inplace(|v| {
            if v > 0 && !keep.contains(&v) {
                deleted = true;
                0
            } else {
                v
            }
        });
        pos.kept_ids.clear();
        Ok(deleted.then(IdChanges::none))
    })
}

/// Merge the objects `from` into `into`.
pub fn merge_ids(pos: &mut Position, ctx: &mut EditContext<'_>, i: usize, into: CellId, from: &[CellId]) -> Result<bool> {
    let merged = commit(pos, ctx, i, "merge IDs", |_, work| {
        let ids = present(work);
        if !ids.contains(&into) {
            return Err(EngineError::UnknownId(into));
        }
        let mut changes = IdChanges::edited([into]);
        for &id in from.iter().filter(|&&id| id != into && ids.contains(&id)) {
            changes.mapping.insert(id, into);
        }
        if changes.mapping.is_empty() {
            return Ok(None);
        }
        apply_mapping(&mut work.labels, &changes.mapping);
        Ok(Some(changes))
    })?;
    if merged && pos.slot(i).is_some_and(|s| s.acdc.has_cca()) {
        log::warn!("Merged IDs at frame {} carried cell-cycle annotations", i);
        ctx.events
            .status(format!("Merged into ID {}: check the cell-cycle annotations of frame {}", into, i));
    }
    Ok(merged)
}

/// Flag objects of frame `i` as excluded from analysis (binned).
pub fn set_excluded(
    pos: &mut Position,
    ctx: &mut EditContext<'_>,
    i: usize,
    ids: &BTreeSet<CellId>,
    value: bool,
) -> Result<bool> {
    commit(pos, ctx, i, "exclude from analysis", |_, work| {
        let mut any = false;
        for id in ids {
            if let Some(row) = work.acdc.row_mut(*id) {
                any |= row.is_cell_excluded != value;
                row.is_cell_excluded = value;
            }
        }
        Ok(any.then(IdChanges::none))
    })
}

/// Flag objects of frame `i` as dead.
pub fn set_dead(
    pos: &mut Position,
    ctx: &mut EditContext<'_>,
    i: usize,
    ids: &BTreeSet<CellId>,
    value: bool,
) -> Result<bool> {
    commit(pos, ctx, i, "mark dead", |_, work| {
        let mut any = false;
        for id in ids {
            if let Some(row) = work.acdc.row_mut(*id) {
                any |= row.is_cell_dead != value;
                row.is_cell_dead = value;
            }
        }
        Ok(any.then(IdChanges::none))
    })
}

/// Add object `id` of frame `i` to (or remove it from) the custom
/// annotation `name`.
pub fn set_custom_annotation(
    pos: &mut Position,
    ctx: &mut EditContext<'_>,
    i: usize,
    name: &str,
    id: CellId,
    value: bool,
) -> Result<bool> {
    if !pos.custom_annotations.iter().any(|a| a.name == name) {
        return Err(EngineError::invalid_input(format!("unknown custom annotation '{}'", name)));
    }
    commit(pos, ctx, i, "custom annotation", |_, work| {
        let row = work.acdc.row_mut(id).ok_or(EngineError::UnknownId(id))?;
        let changed = if value {
            row.custom.insert(name.to_string())
        } else {
            row.custom.remove(name)
        };
        Ok(changed.then(IdChanges::none))
    })
}

/// Parse an ID expression such as `3,5-9,12`.
///
/// Items are separated by commas or whitespace; `a-b` is an inclusive range.
/// Ranges are clipped to `max_id`, the largest ID that can be present.
pub fn parse_id_expression(expr: &str, max_id: CellId) -> Result<BTreeSet<CellId>> {
    let mut ids = BTreeSet::new();
    for item in expr.split(|c: char| c == ',' || c.is_whitespace()).filter(|s| !s.is_empty()) {
        let parse = |s: &str| {
            s.trim()
                .parse::<CellId>()
                .map_err(|_| EngineError::invalid_input(format!("'{}' is not an ID", s)))
        };
        match item.split_once('-') {
            Some((a, b)) => {
                let (a, b) = (parse(a)?, parse(b)?);
                if a > b {
                    return Err(EngineError::invalid_input(format!("empty range '{}'", item)));
                }
                ids.extend(a..=b.min(max_id));
            }
            None => {
                ids.insert(parse(item)?);
            }
        }
    }
    ids.remove(&0);
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::tests::{ids, position_from};
    use crate::events::EventQueue;

    #[test]
    fn test_edit_id_rename_logs_assignment() {
        let mut pos = position_from(&[&[3, 3, 0], &[0, 0, 0]]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);
        assert!(edit_id(&mut pos, &mut ctx, 0, 3, 8, false).unwrap());
        assert_eq!(ids(&pos, 0), vec![8]);
        assert_eq!(pos.manual_edit_log.len(), 1);
        assert_eq!(pos.manual_edit_log.entries()[0].new_id, 8);
        assert_eq!(pos.brush_id(), 9);
        assert!(pos.slot(0).unwrap().acdc.row(8).unwrap().was_manually_edited);
    }

    #[test]
    fn test_edit_id_swap_exchanges_masks() {
        let mut pos = position_from(&[&[3, 3, 0], &[0, 5, 0]]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);
        edit_id(&mut pos, &mut ctx, 0, 3, 5, false).unwrap();
        let labels = &pos.slot(0).unwrap().labels;
        assert_eq!(labels[[0, 0, 0]], 5);
        assert_eq!(labels[[0, 0, 1]], 5);
        assert_eq!(labels[[0, 1, 1]], 3);
        assert_eq!(pos.manual_edit_log.len(), 2);
    }

    #[test]
    fn test_edit_id_same_or_merge() {
        let mut pos = position_from(&[&[3, 0, 5]]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);
        assert!(!edit_id(&mut pos, &mut ctx, 0, 3, 3, false).unwrap());
        assert!(!pos.undo.can_undo(0));
        edit_id(&mut pos, &mut ctx, 0, 3, 5, true).unwrap();
        assert_eq!(ids(&pos, 0), vec![5]);
        assert_eq!(pos.slot(0).unwrap().state.get(5).unwrap().area, 2);
    }

    #[test]
    fn test_delete_absent_id_is_noop() {
        let mut pos = position_from(&[&[1, 2]]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);
        assert!(!delete_id(&mut pos, &mut ctx, 0, 9).unwrap());
        assert!(delete_id(&mut pos, &mut ctx, 0, 2).unwrap());
        assert_eq!(ids(&pos, 0), vec![1]);
        assert_eq!(pos.brush_id(), 3);
    }

    #[test]
    fn test_keep_and_merge() {
        let mut pos = position_from(&[&[1, 2, 3, 4]]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);
        keep_ids(&mut pos, &mut ctx, 0, &parse_id_expression("1-3", 4).unwrap()).unwrap();
        assert_eq!(ids(&pos, 0), vec![1, 2, 3]);
        merge_ids(&mut pos, &mut ctx, 0, 1, &[2, 3]).unwrap();
        assert_eq!(ids(&pos, 0), vec![1]);
        assert!(!pos.slot(0).unwrap().acdc.contains(2));
    }

    #[test]
    fn test_bin_and_rip_flags() {
        let mut pos = position_from(&[&[1, 2]]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);
        let both = BTreeSet::from([1, 2]);
        assert!(set_excluded(&mut pos, &mut ctx, 0, &both, true).unwrap());
        assert!(!set_excluded(&mut pos, &mut ctx, 0, &both, true).unwrap());
        assert!(set_dead(&mut pos, &mut ctx, 0, &BTreeSet::from([2]), true).unwrap());
        let acdc = &pos.slot(0).unwrap().acdc;
        assert_eq!(acdc.binned_ids(), both);
        assert_eq!(acdc.rip_ids(), BTreeSet::from([2]));
        assert!(crate::edit::undo_frame(&mut pos, 0).unwrap());
        assert!(pos.slot(0).unwrap().acdc.rip_ids().is_empty());
    }

    #[test]
    fn test_custom_annotation_requires_registration() {
        let mut pos = position_from(&[&[1, 0]]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);
        assert!(set_custom_annotation(&mut pos, &mut ctx, 0, "mitotic", 1, true).is_err());
        pos.custom_annotations.push(crate::io::custom_annot::CustomAnnotation {
            name: "mitotic".to_string(),
            description: String::new(),
        });
        assert!(set_custom_annotation(&mut pos, &mut ctx, 0, "mitotic", 1, true).unwrap());
        assert!(pos.slot(0).unwrap().acdc.row(1).unwrap().custom.contains("mitotic"));
    }

    #[test]
    fn test_parse_id_expression() {
        let ids = parse_id_expression("3,5-9, 12", 20).unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![3, 5, 6, 7, 8, 9, 12]);
        assert!(parse_id_expression("4-2", 20).is_err());
        assert!(parse_id_expression("a", 20).is_err());
        assert!(parse_id_expression("", 20).unwrap().is_empty());
    }

    #[test]
    fn test_parse_id_expression_clips_ranges() {
        let start = web_time::Instant::now();
        let ids = parse_id_expression("2-4294967295", 6).unwrap();
        assert!(start.elapsed().as_secs() < 1);
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![2, 3, 4, 5, 6]);
        assert!(parse_id_expression("10-4000000000", 6).unwrap().is_empty());
        // Single IDs are kept as typed.
        assert!(parse_id_expression("1,99", 6).unwrap().contains(&99));
    }
}
