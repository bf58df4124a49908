//! Masks drawn from splines or grown from a seed, painted as new objects.

use std::collections::BTreeMap;

use acdc_labels::morphology::flood_fill;
use acdc_labels::{CellId, Labels};
use acdc_labels::raster::{self, Point};
use ndarray::{Array2, ArrayView2};

use super::{EditContext, check_bounds, commit};
use crate::constants::SPLINE_SAMPLES_PER_SEGMENT;
use crate::error::{EngineError, Result};
use crate::model::IdChanges;
use crate::position::Position;

/// Paint the background pixels of `mask` with a new ID.
///
/// `z` limits painting to one slice; `None` paints every slice. Returns the
/// new ID, or `None` when the mask covers no background pixel.
pub fn paint_mask(
    pos: &mut Position,
    ctx: &mut EditContext<'_>,
    i: usize,
    mask: &Array2<bool>,
    z: Option<usize>,
) -> Result<Option<CellId>> {
    let (depth, h, w) = pos.frame_shape();
    if mask.dim() != (h, w) {
        return Err(EngineError::invalid_input(format!(
            "mask shape {:?} does not match the {}x{} frame",
            mask.dim(),
            h,
            w
        )));
    }
    let range = match z {
        Some(z) => z.min(depth.saturating_sub(1))..z.min(depth.saturating_sub(1)) + 1,
        None => 0..depth,
    };
    let mut painted = None;
    commit(pos, ctx, i, "paint mask", |pos, work| {
        let id = pos.brush_id();
        let mut count = 0;
        for z in range {
            for ((y, x), &m) in mask.indexed_iter() {
                let v = &mut work.labels[[z, y, x]];
                if m && *v == 0 {
                    *v = id;
                    count += 1;
                }
            }
        }
        if count == 0 {
            return Ok(None);
        }
        painted = Some(id);
        Ok(Some(IdChanges::edited([id])))
    })?;
    Ok(painted)
}

/// Paint the interior of a closed spline through `points` as a new object.
pub fn spline_mask(
    pos: &mut Position,
    ctx: &mut EditContext<'_>,
    i: usize,
    points: &[Point],
    z: Option<usize>,
) -> Result<Option<CellId>> {
    if points.len() < 3 {
        return Err(EngineError::invalid_input("a spline needs at least 3 points"));
    }
    let (_, h, w) = pos.frame_shape();
    let curve = raster::catmull_rom_closed(points, SPLINE_SAMPLES_PER_SEGMENT);
    let mask = raster::mask_from_pixels(&raster::fill_polygon(&curve, h, w), h, w);
    paint_mask(pos, ctx, i, &mask, z)
}

/// Paint the region connected to `seed` with intensity within `tolerance`
/// of the seed pixel as a new object.
pub fn magic_wand(
    pos: &mut Position,
    ctx: &mut EditContext<'_>,
    i: usize,
    image: ArrayView2<'_, f32>,
    seed: Point,
    tolerance: f32,
    z: Option<usize>,
) -> Result<Option<CellId>> {
    let (h, w) = image.dim();
    check_bounds(seed, h, w)?;
    let mask = flood_fill(image, (seed.y.round() as usize, seed.x.round() as usize), tolerance);
    paint_mask(pos, ctx, i, &mask, z)
}

/// Integrate segmentation output into frame `i`.
///
/// With `replace` the output becomes the frame (it must cover the whole
/// frame). Otherwise every object of the output gets a fresh ID and is
/// painted on the background pixels of the frame, starting at
/// `(y0, x0)`. Returns the IDs now carrying the output's objects.
pub fn paste_segmentation(
    pos: &mut Position,
    ctx: &mut EditContext<'_>,
    i: usize,
    output: &Labels,
    origin: (usize, usize),
    replace: bool,
) -> Result<Vec<CellId>> {
    let (depth, h, w) = pos.frame_shape();
    let (out_depth, out_h, out_w) = output.dim();
    let (y0, x0) = origin;
    if out_depth != depth || y0 + out_h > h || x0 + out_w > w {
        return Err(EngineError::invalid_input(format!(
            "segmentation of {:?} at {:?} does not fit the {}x{}x{} frame",
            output.dim(),
            origin,
            depth,
            h,
            w
        )));
    }
    if replace && (origin != (0, 0) || (out_h, out_w) != (h, w)) {
        return Err(EngineError::invalid_input("replacing a frame needs a full-frame segmentation"));
    }
    let mut placed = Vec::new();
    commit(pos, ctx, i, "segment", |pos, work| {
        if replace {
            work.labels = output.clone();
            placed = acdc_labels::unique_ids(output).into_iter().collect();
            return Ok(Some(IdChanges::edited(placed.iter().copied())));
        }
        let mut fresh: BTreeMap<CellId, CellId> = BTreeMap::new();
        for ((z, y, x), &v) in output.indexed_iter() {
            if v == 0 {
                continue;
            }
            let target = &mut work.labels[[z, y0 + y, x0 + x]];
            if *target != 0 {
                continue;
            }
            *target = *fresh.entry(v).or_insert_with(|| pos.next_brush_id());
        }
        if fresh.is_empty() {
            return Ok(None);
        }
        placed = fresh.values().copied().collect();
        Ok(Some(IdChanges::edited(placed.iter().copied())))
    })?;
    Ok(placed)
}
