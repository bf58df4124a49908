//! Separating objects.

use acdc_labels::components::{object_components, relabel_multi_component, relabel_object_components};
use acdc_labels::contour::{projected_mask, trace_contour};
use acdc_labels::convexity::convexity_defects;
use acdc_labels::raster::{self, Point};
use acdc_labels::{CellId, Labels, max_id};

use super::{EditContext, commit};
use crate::constants::MIN_DEFECT_DEPTH;
use crate::error::{EngineError, Result};
use crate::model::IdChanges;
use crate::position::Position;

/// Clear the pixels of `id` on `cut` (every slice).
fn cut_object(labels: &mut Labels, id: CellId, cut: &[(i64, i64)]) {
    let (depth, h, w) = labels.dim();
    for &(y, x) in cut {
        if y < 0 || x < 0 || y as usize >= h || x as usize >= w {
            continue;
        }
        for z in 0..depth {
            let v = &mut labels[[z, y as usize, x as usize]];
            if *v == id {
                *v = 0;
            }
        }
    }
}

/// Changes of a split where `created` were carved out of `id`.
fn split_changes(id: CellId, created: &[CellId]) -> IdChanges {
    let mut changes = IdChanges::edited(created.iter().copied().chain([id]));
    changes.derived = created.iter().map(|&new| (new, id)).collect();
    changes
}

fn highest_id(pos: &Position, labels: &Labels) -> CellId {
    max_id(labels).max(pos.brush_id().saturating_sub(1))
}

/// Split `id` automatically.
///
/// When the object has exactly two deep convexity defects it is cut along
/// the line joining them. Otherwise (or when the cut does not separate it)
/// its disconnected parts are given new IDs. Returns the new IDs.
pub fn split_auto(pos: &mut Position, ctx: &mut EditContext<'_>, i: usize, id: CellId) -> Result<Vec<CellId>> {
    let mut created = Vec::new();
    commit(pos, ctx, i, "separate", |pos, work| {
        if !work.labels.iter().any(|&v| v == id) {
            return Err(EngineError::UnknownId(id));
        }
        let mask = projected_mask(&work.labels, id);
        let contour = trace_contour(mask.view());
        let defects: Vec<_> = convexity_defects(&contour)
            .into_iter()
            .filter(|d| d.depth >= MIN_DEFECT_DEPTH)
            .collect();

        if let [a, b] = defects.as_slice() {
            let (ay, ax) = a.farthest;
            let (by, bx) = b.farthest;
            let cut = raster::line_pixels(Point::new(ax as f64, ay as f64), Point::new(bx as f64, by as f64));
            let mut trial = work.labels.clone();
            cut_object(&mut trial, id, &cut);
            if object_components(&trial, id).len() > 1 {
                log::debug!("Cutting {} between {:?} and {:?}", id, a.farthest, b.farthest);
                work.labels = trial;
            }
        }

        let mut max = highest_id(pos, &work.labels);
        created = relabel_object_components(&mut work.labels, id, &mut max);
        if created.is_empty() {
            return Ok(None);
        }
        Ok(Some(split_changes(id, &created)))
    })?;
    Ok(created)
}

/// Split `id` along an operator-drawn polyline.
///
/// The largest part keeps `id`; the others get the next free IDs. A cut
/// that does not separate the object changes nothing.
pub fn split_manual(
    pos: &mut Position,
    ctx: &mut EditContext<'_>,
    i: usize,
    id: CellId,
    cut: &[Point],
) -> Result<Vec<CellId>> {
    let (_, h, w) = pos.frame_shape();
    let pixels: Vec<(i64, i64)> = raster::polyline(cut, 1.0, h, w)
        .into_iter()
        .map(|(y, x)| (y as i64, x as i64))
        .collect();
    let mut created = Vec::new();
    commit(pos, ctx, i, "separate (manual)", |pos, work| {
        if !work.labels.iter().any(|&v| v == id) {
            return Err(EngineError::UnknownId(id));
        }
        let mut trial = work.labels.clone();
        cut_object(&mut trial, id, &pixels);
        if object_components(&trial, id).len() < 2 {
            return Ok(None);
        }
        let mut max = highest_id(pos, &trial);
        created = relabel_object_components(&mut trial, id, &mut max);
        work.labels = trial;
        Ok(Some(split_changes(id, &created)))
    })?;
    Ok(created)
}

/// Give every disconnected part of every object its own ID.
///
/// Returns `(original, new IDs)` for every object that was split.
pub fn relabel_components(pos: &mut Position, ctx: &mut EditContext<'_>, i: usize) -> Result<Vec<(CellId, Vec<CellId>)>> {
    let mut split = Vec::new();
    commit(pos, ctx, i, "relabel components", |pos, work| {
        let mut max = highest_id(pos, &work.labels);
        split = relabel_multi_component(&mut work.labels, &mut max);
        if split.is_empty() {
            return Ok(None);
        }
        let mut changes = IdChanges::none();
        for (id, created) in &split {
            let part = split_changes(*id, created);
            changes.derived.extend(part.derived);
            changes.edited.extend(part.edited);
        }
        Ok(Some(changes))
    })?;
    Ok(split)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::tests::{ids, positions_from};
    use crate::events::EventQueue;
    use crate::model::CellCycleStage;

    /// Two 3×3 lobes joined by the single pixel `(10, 10)`.
    fn dumbbell() -> Labels {
        let mut labels = Labels::zeros((1, 20, 20));
        for y in 9..=11 {
            for x in (7..=9).chain(11..=13) {
                labels[[0, y, x]] = 1;
            }
        }
        labels[[0, 10, 10]] = 1;
        labels
    }

    #[test]
    fn test_split_dumbbell_at_bridge() {
        let mut pos = positions_from(vec![dumbbell()]);
        {
            let acdc = &mut pos.slot_mut(0).unwrap().acdc;
            acdc.init_cca();
            acdc.cca_row_mut(1).unwrap().stage = CellCycleStage::S;
        }
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);

        let created = split_auto(&mut pos, &mut ctx, 0, 1).unwrap();
        assert_eq!(created, vec![2]);
        let slot = pos.slot(0).unwrap();
        assert_eq!(ids(&pos, 0), vec![1, 2]);
        assert_eq!(slot.state.get(1).unwrap().area, 9);
        assert_eq!(slot.state.get(2).unwrap().area, 9);
        assert_eq!(slot.labels[[0, 10, 10]], 0);
        let copied = slot.acdc.cca_row(2).unwrap();
        assert_eq!(copied.stage, CellCycleStage::S);
        assert_eq!(copied.relative_id, None);
    }

    #[test]
    fn test_split_convex_object_is_noop() {
        let mut labels = Labels::zeros((1, 6, 6));
        for y in 1..4 {
            for x in 1..4 {
                labels[[0, y, x]] = 5;
            }
        }
        let mut pos = positions_from(vec![labels]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);
        assert!(split_auto(&mut pos, &mut ctx, 0, 5).unwrap().is_empty());
        assert!(!pos.undo.can_undo(0));
        assert!(matches!(
            split_auto(&mut pos, &mut ctx, 0, 9),
            Err(EngineError::UnknownId(9))
        ));
    }

    #[test]
    fn test_manual_cut_keeps_larger_part() {
        let mut labels = Labels::zeros((1, 3, 7));
        labels.fill(1);
        let mut pos = positions_from(vec![labels]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);
        let cut = [Point::new(2.0, 0.0), Point::new(2.0, 2.0)];
        let created = split_manual(&mut pos, &mut ctx, 0, 1, &cut).unwrap();
        assert_eq!(created, vec![2]);
        let slot = pos.slot(0).unwrap();
        assert_eq!(slot.state.get(1).unwrap().area, 12);
        assert_eq!(slot.state.get(2).unwrap().area, 6);
    }

    #[test]
    fn test_relabel_components() {
        let mut labels = Labels::zeros((1, 3, 5));
        labels[[0, 0, 0]] = 4;
        labels[[0, 2, 4]] = 4;
        labels[[0, 1, 2]] = 6;
        let mut pos = positions_from(vec![labels]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);
        let split = relabel_components(&mut pos, &mut ctx, 0).unwrap();
        assert_eq!(split, vec![(4, vec![7])]);
        assert_eq!(ids(&pos, 0), vec![4, 6, 7]);
        assert_eq!(pos.brush_id(), 8);
    }
}
