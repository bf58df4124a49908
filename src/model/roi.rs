//! Persistent deletion regions.

use std::collections::BTreeSet;

use acdc_labels::raster::{self, Point};
use acdc_labels::{CellId, Labels};
use ndarray::Array2;

use crate::constants::SPLINE_SAMPLES_PER_SEGMENT;

/// Geometry of a delete-ROI in pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub enum RoiShape {
    /// Axis-aligned rectangle between two corners (inclusive)
    Rect {
        /// First corner
        a: Point,
        /// Opposite corner
        b: Point,
    },
    /// Straight thick line, any orientation
    Line {
        /// Start point
        a: Point,
        /// End point
        b: Point,
        /// Line width in pixels
        width: f64,
    },
    /// Free-hand open polyline
    Polyline {
        /// Vertices in drawing order
        points: Vec<Point>,
        /// Line width in pixels
        width: f64,
    },
    /// Free-hand closed curve (interior included)
    ClosedCurve {
        /// Control points in drawing order
        points: Vec<Point>,
    },
}

impl RoiShape {
    /// Display name of the shape kind.
    pub fn name(&self) -> &'static str {
        match self {
            RoiShape::Rect { .. } => "rectangle",
            RoiShape::Line { .. } => "line",
            RoiShape::Polyline { .. } => "polyline",
            RoiShape::ClosedCurve { .. } => "closed curve",
        }
    }

    /// Rasterise the shape, clipped to the image.
    pub fn rasterize(&self, height: usize, width: usize) -> Array2<bool> {
        let pixels = match self {
            RoiShape::Rect { a, b } => raster::rectangle(*a, *b, height, width),
            RoiShape::Line { a, b, width: w } => raster::thick_line(*a, *b, *w, height, width),
            RoiShape::Polyline { points, width: w } => raster::polyline(points, *w, height, width),
            RoiShape::ClosedCurve { points } => {
                let smooth = raster::catmull_rom_closed(points, SPLINE_SAMPLES_PER_SEGMENT);
                raster::fill_polygon(&smooth, height, width)
            }
        };
        raster::mask_from_pixels(&pixels, height, width)
    }

    /// The same shape shifted by `(dx, dy)`.
    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        let shift = |p: &Point| p.translated(dx, dy);
        match self {
            RoiShape::Rect { a, b } => RoiShape::Rect {
                a: shift(a),
                b: shift(b),
            },
            RoiShape::Line { a, b, width } => RoiShape::Line {
                a: shift(a),
                b: shift(b),
                width: *width,
            },
            RoiShape::Polyline { points, width } => RoiShape::Polyline {
                points: points.iter().map(shift).collect(),
                width: *width,
            },
            RoiShape::ClosedCurve { points } => RoiShape::ClosedCurve {
                points: points.iter().map(shift).collect(),
            },
        }
    }
}

/// A region that virtually deletes every object it touches.
///
/// Labels are never modified by the ROI itself; the covered IDs are removed
/// from exported and saved data only.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRoi {
    /// Identifier unique within the frame
    pub id: u64,
    shape: RoiShape,
    mask: Array2<bool>,
    deleted_ids: BTreeSet<CellId>,
}

impl DeleteRoi {
    /// Create an ROI and intersect it with `labels`.
    pub fn new(id: u64, shape: RoiShape, labels: &Labels) -> Self {
        let (_, h, w) = labels.dim();
        let mut roi = Self {
            id,
            mask: shape.rasterize(h, w),
            shape,
            deleted_ids: BTreeSet::new(),
        };
        roi.intersect(labels);
        roi
    }

    /// Geometry.
    pub fn shape(&self) -> &RoiShape {
        &self.shape
    }

    /// Cached rasterised mask `(Y, X)`.
    pub fn mask(&self) -> &Array2<bool> {
        &self.mask
    }

    /// IDs currently deleted by this ROI.
    pub fn deleted_ids(&self) -> &BTreeSet<CellId> {
        &self.deleted_ids
    }

    /// Replace the geometry (move/resize) and re-intersect.
    pub fn set_shape(&mut self, shape: RoiShape, labels: &Labels) {
        let (_, h, w) = labels.dim();
        self.mask = shape.rasterize(h, w);
        self.shape = shape;
        self.intersect(labels);
    }

    /// Recompute the deleted IDs against the current labels.
    pub fn intersect(&mut self, labels: &Labels) {
        let mut ids = BTreeSet::new();
        for ((_, y, x), &v) in labels.indexed_iter() {
            if v > 0 && self.mask[[y, x]] {
                ids.insert(v);
            }
        }
        if ids != self.deleted_ids {
            log::debug!("Delete-ROI {} now covers {:?}", self.id, ids);
        }
        self.deleted_ids = ids;
    }
}

/// Union of the IDs deleted by a set of ROIs.
pub fn deleted_by(rois: &[DeleteRoi]) -> BTreeSet<CellId> {
    rois.iter().flat_map(|roi| roi.deleted_ids().iter().copied()).collect()
}

/// Labels with every ROI-deleted object removed.
pub fn export_labels(labels: &Labels, rois: &[DeleteRoi]) -> Labels {
    let deleted = deleted_by(rois);
    if deleted.is_empty() {
        return labels.clone();
    }
    labels.mapv(|v| if deleted.contains(&v) { 0 } else { v })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_objects() -> Labels {
        let mut labels = Labels::zeros((1, 10, 10));
        labels[[0, 2, 2]] = 2;
        labels[[0, 2, 7]] = 3;
        labels[[0, 8, 8]] = 4;
        labels
    }

    #[test]
    fn test_rect_roi_deletes_covered_ids() {
        let labels = two_objects();
        let roi = DeleteRoi::new(
            1,
            RoiShape::Rect {
                a: Point::new(0.0, 0.0),
                b: Point::new(8.0, 3.0),
            },
            &labels,
        );
        assert_eq!(roi.deleted_ids(), &BTreeSet::from([2, 3]));
        let exported = export_labels(&labels, std::slice::from_ref(&roi));
        assert_eq!(exported[[0, 2, 2]], 0);
        assert_eq!(exported[[0, 8, 8]], 4);
    }

    #[test]
    fn test_moving_roi_restores_ids() {
        let labels = two_objects();
        let shape = RoiShape::Rect {
            a: Point::new(0.0, 0.0),
            b: Point::new(8.0, 3.0),
        };
        let mut roi = DeleteRoi::new(1, shape.clone(), &labels);
        roi.set_shape(shape.translated(-4.0, 0.0), &labels);
        assert_eq!(roi.deleted_ids(), &BTreeSet::from([2]));
    }
}
