//! Brush and eraser strokes.

use std::collections::BTreeSet;
use std::ops::Range;

use acdc_labels::morphology::fill_holes_object;
use acdc_labels::raster::{self, Pixel, Point};
use acdc_labels::{CellId, Labels};

use super::{EditContext, FrameEdit, check_bounds, commit};
use crate::error::Result;
use crate::model::IdChanges;
use crate::position::Position;

/// How the brush treats pixels of other objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrushMode {
    /// Paint background pixels only
    #[default]
    Normal,
    /// Overwrite every pixel under the brush
    Power,
    /// Paint background pixels with a new ID even over an existing object
    Shift,
}

/// Which objects the eraser removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EraserMode {
    /// Every object under the eraser
    #[default]
    AnyId,
    /// Only the object under the cursor when the stroke started
    OneId,
}

/// Pixels covered by disks at `points` joined by their tangent envelopes.
fn footprint(points: &[Point], radius: f64, height: usize, width: usize) -> Vec<Pixel> {
    let mut pixels: Vec<Pixel> = Vec::new();
    for p in points {
        pixels.extend(raster::disk(*p, radius, height, width));
    }
    for pair in points.windows(2) {
        pixels.extend(raster::stroke_envelope(pair[0], pair[1], radius, height, width));
    }
    pixels.sort_unstable();
    pixels.dedup();
    pixels
}

/// Z-slices a stroke applies to: one slice, or every slice when projecting.
fn slices(labels: &Labels, z: Option<usize>) -> Range<usize> {
    let depth = labels.dim().0;
    match z {
        Some(z) if depth > 0 => {
            let z = z.min(depth - 1);
            z..z + 1
        }
        _ => 0..depth,
    }
}

// ============================================================================
// Brush
// ============================================================================

/// One brush stroke from press to release.
#[derive(Debug, Clone, PartialEq)]
pub struct BrushStroke {
    /// Cursor positions in drawing order
    pub points: Vec<Point>,
    /// Radius in pixels
    pub radius: f64,
    /// Painting mode
    pub mode: BrushMode,
    /// Paint the ID under the cursor when there is one
    pub auto_id: bool,
    /// ID chosen by the operator, used when `auto_id` finds nothing
    pub chosen_id: Option<CellId>,
    /// Z-slice, or `None` to paint the whole column
    pub z: Option<usize>,
}

impl BrushStroke {
    /// Start a stroke at `start`.
    pub fn new(start: Point, radius: f64) -> Self {
        Self {
            points: vec![start],
            radius,
            mode: BrushMode::Normal,
            auto_id: true,
            chosen_id: None,
            z: None,
        }
    }

    /// Set the painting mode.
    pub fn with_mode(mut self, mode: BrushMode) -> Self {
        self.mode = mode;
        self
    }

    /// Paint a specific ID.
    pub fn with_id(mut self, id: CellId) -> Self {
        self.chosen_id = Some(id);
        self.auto_id = false;
        self
    }

    /// Restrict the stroke to one z-slice.
    pub fn on_slice(mut self, z: usize) -> Self {
        self.z = Some(z);
        self
    }

    /// Continue the stroke to `point`.
    pub fn drag_to(&mut self, point: Point) {
        self.points.push(point);
    }

    fn target_id(&self, work: &FrameEdit, brush_id: CellId) -> CellId {
        if self.mode == BrushMode::Shift {
            return brush_id;
        }
        let hovered = self.points.first().map_or(0, |p| work.id_at(*p, self.z));
        if self.auto_id && hovered > 0 {
            return hovered;
        }
        self.chosen_id.filter(|&id| id > 0).unwrap_or(brush_id)
    }
}

/// Paint a brush stroke on frame `i`.
///
/// Returns the painted ID, or `None` when the stroke changed nothing.
pub fn apply_brush(pos: &mut Position, ctx: &mut EditContext<'_>, i: usize, stroke: &BrushStroke) -> Result<Option<CellId>> {
    let (_, h, w) = pos.frame_shape();
    let Some(&start) = stroke.points.first() else {
        return Ok(None);
    };
    check_bounds(start, h, w)?;
    let fill = ctx.auto_fill_holes;
    let mut painted = None;

    let changed = commit(pos, ctx, i, "brush", |pos, work| {
        let id = stroke.target_id(work, pos.brush_id());
        let pixels = footprint(&stroke.points, stroke.radius, h, w);
        let power = stroke.mode == BrushMode::Power;
        let mut count = 0;
        for z in slices(&work.labels, stroke.z) {
            for &(y, x) in &pixels {
                let v = &mut work.labels[[z, y, x]];
                if *v != id && (power || *v == 0) {
                    *v = id;
                    count += 1;
                }
            }
        }
        if count == 0 {
            return Ok(None);
        }
        if fill {
            fill_holes_object(&mut work.labels, id);
        }
        painted = Some(id);
        Ok(Some(IdChanges::edited([id])))
    })?;
    Ok(if changed { painted } else { None })
}

// ============================================================================
// Eraser
// ============================================================================

/// One eraser stroke from press to release.
#[derive(Debug, Clone, PartialEq)]
pub struct EraserStroke {
    /// Cursor positions in drawing order
    pub points: Vec<Point>,
    /// Radius in pixels
    pub radius: f64,
    /// Which objects are erased
    pub mode: EraserMode,
    /// Z-slice, or `None` to erase the whole column
    pub z: Option<usize>,
}

impl EraserStroke {
    /// Start a stroke at `start`.
    pub fn new(start: Point, radius: f64) -> Self {
        Self {
            points: vec![start],
            radius,
            mode: EraserMode::AnyId,
            z: None,
        }
    }

    /// Set the eraser mode.
    pub fn with_mode(mut self, mode: EraserMode) -> Self {
        self.mode = mode;
        self
    }

    /// Restrict the stroke to one z-slice.
    pub fn on_slice(mut self, z: usize) -> Self {
        self.z = Some(z);
        self
    }

    /// Continue the stroke to `point`.
    pub fn drag_to(&mut self, point: Point) {
        self.points.push(point);
    }
}

/// Erase along a stroke on frame `i`. Returns whether anything was erased.
pub fn apply_eraser(pos: &mut Position, ctx: &mut EditContext<'_>, i: usize, stroke: &EraserStroke) -> Result<bool> {
    let (_, h, w) = pos.frame_shape();
    let Some(&start) = stroke.points.first() else {
        return Ok(false);
    };
    check_bounds(start, h, w)?;

    commit(pos, ctx, i, "eraser", |_, work| {
        let only = match stroke.mode {
            EraserMode::AnyId => None,
            EraserMode::OneId => match work.id_at(start, stroke.z) {
                0 => return Ok(None),
                id => Some(id),
            },
        };
        let pixels = footprint(&stroke.points, stroke.radius, h, w);
        let mut erased = BTreeSet::new();
        for z in slices(&work.labels, stroke.z) {
            for &(y, x) in &pixels {
                let v = &mut work.labels[[z, y, x]];
                if *v > 0 && only.is_none_or(|id| id == *v) {
                    erased.insert(*v);
                    *v = 0;
                }
            }
        }
        if erased.is_empty() {
            return Ok(None);
        }
        Ok(Some(IdChanges::edited(erased)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::tests::{ids, position_from, positions_from};
    use crate::events::EventQueue;

    #[test]
    fn test_brush_then_eraser_on_empty_frame() {
        let mut pos = positions_from(vec![Labels::zeros((1, 5, 5))]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);

        let id = apply_brush(&mut pos, &mut ctx, 0, &BrushStroke::new(Point::new(2.0, 2.0), 1.0)).unwrap();
        assert_eq!(id, Some(1));
        let slot = pos.slot(0).unwrap();
        assert_eq!(slot.state.get(1).unwrap().area, 5);
        assert!(slot.acdc.contains(1));
        assert_eq!(pos.brush_id(), 2);

        let erased = apply_eraser(&mut pos, &mut ctx, 0, &EraserStroke::new(Point::new(2.0, 2.0), 1.0)).unwrap();
        assert!(erased);
        let slot = pos.slot(0).unwrap();
        assert!(slot.labels.iter().all(|&v| v == 0));
        assert!(slot.acdc.is_empty());
        assert_eq!(pos.brush_id(), 2);
    }

    #[test]
    fn test_normal_mode_respects_other_objects() {
        let mut pos = position_from(&[&[0, 0, 0], &[0, 7, 0], &[0, 0, 0]]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);
        let stroke = BrushStroke::new(Point::new(0.0, 0.0), 2.0).with_mode(BrushMode::Shift);
        let id = apply_brush(&mut pos, &mut ctx, 0, &stroke).unwrap().unwrap();
        assert_eq!(id, 8);
        assert_eq!(pos.slot(0).unwrap().labels[[0, 1, 1]], 7);

        let stroke = BrushStroke::new(Point::new(1.0, 1.0), 0.0).with_mode(BrushMode::Power).with_id(8);
        apply_brush(&mut pos, &mut ctx, 0, &stroke).unwrap();
        assert_eq!(ids(&pos, 0), vec![8]);
    }

    #[test]
    fn test_auto_id_paints_hovered_object() {
        let mut pos = position_from(&[&[3, 0, 0, 0], &[0, 0, 0, 0]]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);
        let mut stroke = BrushStroke::new(Point::new(0.0, 0.0), 0.0);
        stroke.drag_to(Point::new(3.0, 0.0));
        assert_eq!(apply_brush(&mut pos, &mut ctx, 0, &stroke).unwrap(), Some(3));
        assert_eq!(pos.slot(0).unwrap().state.get(3).unwrap().area, 4);
    }

    #[test]
    fn test_one_id_eraser_and_clipping() {
        let mut pos = position_from(&[&[1, 2], &[1, 2]]);
        let mut events = EventQueue::new();
        let mut ctx = EditContext::new(0, &mut events);
        let stroke = EraserStroke::new(Point::new(0.0, 0.0), 5.0).with_mode(EraserMode::OneId);
        assert!(apply_eraser(&mut pos, &mut ctx, 0, &stroke).unwrap());
        assert_eq!(ids(&pos, 0), vec![2]);

        let outside = EraserStroke::new(Point::new(9.0, 0.0), 1.0);
        assert!(apply_eraser(&mut pos, &mut ctx, 0, &outside).is_err());
        let nothing = EraserStroke::new(Point::new(0.0, 0.0), 0.0).with_mode(EraserMode::OneId);
        assert!(!apply_eraser(&mut pos, &mut ctx, 0, &nothing).unwrap());
        assert_eq!(pos.undo.depth_of(0), 1);
    }
}
