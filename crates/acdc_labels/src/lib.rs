//! Label-image primitives for segmentation masks.
//!
//! A label image is an integer array where `0` is background and every
//! positive value identifies one object. Arrays are always stored as
//! `(Z, Y, X)`; 2D masks simply have `Z = 1`.
//!
//! This crate knows nothing about positions, frames or annotation tables.
//! It provides the geometric building blocks the editing engine composes:
//!
//! - [`regionprops`]: per-object area, bounding box, centroid, inertia and volume
//! - [`components`]: connected components and ID renumbering
//! - [`morphology`]: single-object dilation/erosion, hole filling, flood fill
//! - [`raster`]: disks, stroke envelopes, polygons, lines and splines
//! - [`contour`]: boundary tracing and contour distances
//! - [`convexity`]: convex hull and convexity defects
//! - [`assignment`]: rectangular linear-sum assignment (Hungarian method)

pub mod assignment;
pub mod components;
pub mod contour;
pub mod convexity;
pub mod error;
pub mod morphology;
pub mod raster;
pub mod regionprops;

pub use error::{LabelError, Result};
pub use regionprops::{BoundingBox3, PhysicalSize, RegionProps, regionprops};

use ndarray::Array3;

/// Integer object identifier. `0` is background.
pub type CellId = u32;

/// A `(Z, Y, X)` label image.
pub type Labels = Array3<CellId>;

/// Collect the set of positive IDs present in a label image.
pub fn unique_ids(labels: &Labels) -> std::collections::BTreeSet<CellId> {
    labels.iter().copied().filter(|&v| v > 0).collect()
}

/// Largest ID present in a label image (`0` when empty).
pub fn max_id(labels: &Labels) -> CellId {
    labels.iter().copied().max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_and_max() {
        let mut lab = Labels::zeros((1, 4, 4));
        lab[[0, 1, 1]] = 3;
        lab[[0, 2, 2]] = 7;
        assert_eq!(unique_ids(&lab).into_iter().collect::<Vec<_>>(), vec![3, 7]);
        assert_eq!(max_id(&lab), 7);
        assert_eq!(max_id(&Labels::zeros((1, 2, 2))), 0);
    }
}
