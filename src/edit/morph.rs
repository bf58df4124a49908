//! Single-object morphology: expand, shrink, move, fill holes.

use acdc_labels::CellId;
use acdc_labels::morphology::{dilate_object, erode_object, fill_holes_object, translate_object};

use super::{EditContext, FrameEdit, commit};
use crate::error::{EngineError, Result};
use crate::model::IdChanges;
use crate::position::Position;

fn require(work: &FrameEdit, id: CellId) -> Result<()> {
    if id > 0 && work.labels.iter().any(|&v| v == id) {
        Ok(())
    } else {
        Err(EngineError::UnknownId(id))
    }
}

/// Grow `id` by `iterations` pixels into the background.
pub fn expand_label(pos: &mut Position, ctx: &mut EditContext<'_>, i: usize, id: CellId, iterations: usize) -> Result<bool> {
    commit(pos, ctx, i, "expand label", |_, work| {
        require(work, id)?;
        let added = dilate_object(&mut work.labels, id, iterations);
        Ok((added > 0).then(|| IdChanges::edited([id])))
    })
}

/// Shrink `id` by `iterations` pixels.
pub fn shrink_label(pos: &mut Position, ctx: &mut EditContext<'_>, i: usize, id: CellId, iterations: usize) -> Result<bool> {
    commit(pos, ctx, i, "shrink label", |_, work| {
        require(work, id)?;
        let removed = erode_object(&mut work.labels, id, iterations);
        Ok((removed > 0).then(|| IdChanges::edited([id])))
    })
}

/// Shift `id` by `(dy, dx)`, clipped to the image.
pub fn move_label(pos: &mut Position, ctx: &mut EditContext<'_>, i: usize, id: CellId, dy: i64, dx: i64) -> Result<bool> {
    if dy == 0 && dx == 0 {
        return Ok(false);
    }
    commit(pos, ctx, i, "move label", |_, work| {
        require(work, id)?;
        translate_object(&mut work.labels, id, dy, dx);
        Ok(Some(IdChanges::edited([id])))
    })
}

/// Fill the holes of `id`.
pub fn fill_holes(pos: &mut Position, ctx: &mut EditContext<'_>, i: usize, id: CellId) -> Result<bool> {
    commit(pos, ctx, i, "fill holes", |_, work| {
        require(work, id)?;
        let filled = fill_holes_object(&mut work.labels, id);
        Ok((filled > 0).then(|| IdChanges::edited([id])))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::tests::position_from;
    use crate::events::EventQueue;

    #[test]
    fn test_expand_does_not_overwrite_neighbours() {
        let mut pos = position_from(&[&[0, 0, 0, 0], &[0, 1, 2, 0], &[0, 0, 0, 0]]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);
        expand_label(&mut pos, &mut ctx, 0, 1, 1).unwrap();
        let slot = pos.slot(0).unwrap();
        assert_eq!(slot.state.get(1).unwrap().area, 4);
        assert_eq!(slot.labels[[0, 1, 2]], 2);
    }

    #[test]
    fn test_shrink_peels_one_layer() {
        let mut labels = acdc_labels::Labels::zeros((1, 7, 7));
        for y in 1..6 {
            for x in 1..6 {
                labels[[0, y, x]] = 1;
            }
        }
        let mut pos = crate::edit::tests::positions_from(vec![labels]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);
        shrink_label(&mut pos, &mut ctx, 0, 1, 1).unwrap();
        assert_eq!(pos.slot(0).unwrap().state.get(1).unwrap().area, 9);
    }

    #[test]
    fn test_move_clips_and_fill_holes() {
        let mut pos = position_from(&[&[1, 1, 1], &[1, 0, 1], &[1, 1, 1]]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);
        assert!(fill_holes(&mut pos, &mut ctx, 0, 1).unwrap());
        assert_eq!(pos.slot(0).unwrap().state.get(1).unwrap().area, 9);
        move_label(&mut pos, &mut ctx, 0, 1, 0, 2).unwrap();
        assert_eq!(pos.slot(0).unwrap().state.get(1).unwrap().area, 3);
        assert!(matches!(
            move_label(&mut pos, &mut ctx, 0, 4, 1, 1),
            Err(EngineError::UnknownId(4))
        ));
    }
}
