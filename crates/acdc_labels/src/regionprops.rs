//! Region properties of labelled objects.
//!
//! Mirrors the subset of `regionprops` the editor needs: pixel coordinates,
//! bounding box, centroid, inertia-derived orientation and axis lengths, and
//! the rotational volume approximation used for budding-yeast style cells.

use std::collections::{BTreeMap, HashSet};
use std::f64::consts::PI;

use ndarray::Array3;

use crate::{CellId, Labels};

/// Physical pixel/voxel size in micrometres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicalSize {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Default for PhysicalSize {
    fn default() -> Self {
        Self {
            x: 1.0,
            y: 1.0,
            z: 1.0,
        }
    }
}

impl PhysicalSize {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Area of one pixel in µm².
    pub fn pixel_area(&self) -> f64 {
        self.x * self.y
    }

    /// Volume of one voxel in µm³ (= fL).
    pub fn voxel_volume(&self) -> f64 {
        self.x * self.y * self.z
    }

    /// Conversion factor from rotational voxel volume to femtolitres.
    pub fn rotational_vox_to_fl(&self) -> f64 {
        self.y * self.x * self.x
    }
}

/// Half-open bounding box `[z0, z1) × [y0, y1) × [x0, x1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox3 {
    pub z0: usize,
    pub y0: usize,
    pub x0: usize,
    pub z1: usize,
    pub y1: usize,
    pub x1: usize,
}

impl BoundingBox3 {
    pub fn depth(&self) -> usize {
        self.z1 - self.z0
    }

    pub fn height(&self) -> usize {
        self.y1 - self.y0
    }

    pub fn width(&self) -> usize {
        self.x1 - self.x0
    }

    pub fn contains(&self, z: usize, y: usize, x: usize) -> bool {
        (self.z0..self.z1).contains(&z)
            && (self.y0..self.y1).contains(&y)
            && (self.x0..self.x1).contains(&x)
    }
}

/// Properties of one labelled object.
#[derive(Debug, Clone)]
pub struct RegionProps {
    /// Object ID.
    pub label: CellId,
    /// Number of pixels (2D) or voxels (3D).
    pub area: usize,
    pub bbox: BoundingBox3,
    /// Centroid as `(z, y, x)`.
    pub centroid: (f64, f64, f64),
    /// Pixel coordinates as `[z, y, x]`, in raster order.
    pub coords: Vec<[usize; 3]>,
    /// Angle of the major axis of the YX projection, radians from the X axis.
    pub orientation: f64,
    pub major_axis_length: f64,
    pub minor_axis_length: f64,
    /// Rotational volume in voxels (solid of revolution about the major axis).
    pub vol_vox: f64,
    /// Rotational volume in femtolitres.
    pub vol_fl: f64,
    /// Voxel count, only for 3D segmentations.
    pub vol_vox_3d: Option<f64>,
    /// Voxel volume in femtolitres, only for 3D segmentations.
    pub vol_fl_3d: Option<f64>,
}

impl RegionProps {
    /// Boolean mask of the object cropped to its bounding box.
    pub fn mask(&self) -> Array3<bool> {
        let b = &self.bbox;
        let mut mask = Array3::from_elem((b.depth(), b.height(), b.width()), false);
        for &[z, y, x] in &self.coords {
            mask[[z - b.z0, y - b.y0, x - b.x0]] = true;
        }
        mask
    }

    /// The object pixel closest to the centroid.
    ///
    /// Non-convex objects can have their centroid outside the mask, so this
    /// is what gets stored whenever a point must hit the object again later.
    pub fn representative_point(&self) -> [usize; 3] {
        let (cz, cy, cx) = self.centroid;
        let mut best = self.coords[0];
        let mut best_d = f64::INFINITY;
        for &c in &self.coords {
            let d = (c[0] as f64 - cz).powi(2)
                + (c[1] as f64 - cy).powi(2)
                + (c[2] as f64 - cx).powi(2);
            if d < best_d {
                best_d = d;
                best = c;
            }
        }
        best
    }

    /// Unique `(y, x)` positions of the object projected along Z.
    pub fn projected_coords(&self) -> Vec<(usize, usize)> {
        let mut seen = HashSet::with_capacity(self.coords.len());
        let mut out = Vec::with_capacity(self.coords.len());
        for &[_, y, x] in &self.coords {
            if seen.insert((y, x)) {
                out.push((y, x));
            }
        }
        out
    }
}

/// Compute region properties for every positive label, sorted by ID.
pub fn regionprops(labels: &Labels, spacing: PhysicalSize, is_3d: bool) -> Vec<RegionProps> {
    let mut coords: BTreeMap<CellId, Vec<[usize; 3]>> = BTreeMap::new();
    for ((z, y, x), &v) in labels.indexed_iter() {
        if v > 0 {
            coords.entry(v).or_default().push([z, y, x]);
        }
    }

    coords
        .into_iter()
        .map(|(label, coords)| build_props(label, coords, spacing, is_3d))
        .collect()
}

fn build_props(
    label: CellId,
    coords: Vec<[usize; 3]>,
    spacing: PhysicalSize,
    is_3d: bool,
) -> RegionProps {
    let n = coords.len() as f64;
    let mut bbox = BoundingBox3 {
        z0: usize::MAX,
        y0: usize::MAX,
        x0: usize::MAX,
        z1: 0,
        y1: 0,
        x1: 0,
    };
    let (mut sz, mut sy, mut sx) = (0.0, 0.0, 0.0);
    for &[z, y, x] in &coords {
        bbox.z0 = bbox.z0.min(z);
        bbox.y0 = bbox.y0.min(y);
        bbox.x0 = bbox.x0.min(x);
        bbox.z1 = bbox.z1.max(z + 1);
        bbox.y1 = bbox.y1.max(y + 1);
        bbox.x1 = bbox.x1.max(x + 1);
        sz += z as f64;
        sy += y as f64;
        sx += x as f64;
    }
    let centroid = (sz / n, sy / n, sx / n);

    let mut props = RegionProps {
        label,
        area: coords.len(),
        bbox,
        centroid,
        coords,
        orientation: 0.0,
        major_axis_length: 0.0,
        minor_axis_length: 0.0,
        vol_vox: 0.0,
        vol_fl: 0.0,
        vol_vox_3d: None,
        vol_fl_3d: None,
    };

    let projected = props.projected_coords();
    let inertia = Inertia::from_points(&projected);
    props.orientation = inertia.orientation;
    props.major_axis_length = inertia.major_axis_length();
    props.minor_axis_length = inertia.minor_axis_length();
    props.vol_vox = rotational_volume(&projected, &inertia);
    props.vol_fl = props.vol_vox * spacing.rotational_vox_to_fl();

    if is_3d {
        props.vol_vox_3d = Some(props.area as f64);
        props.vol_fl_3d = Some(props.area as f64 * spacing.voxel_volume());
    }
    props
}

/// Second-order central moments of a 2D point set.
#[derive(Debug, Clone, Copy)]
struct Inertia {
    cy: f64,
    cx: f64,
    l1: f64,
    l2: f64,
    orientation: f64,
}

impl Inertia {
    fn from_points(points: &[(usize, usize)]) -> Self {
        let n = points.len().max(1) as f64;
        let cy = points.iter().map(|p| p.0 as f64).sum::<f64>() / n;
        let cx = points.iter().map(|p| p.1 as f64).sum::<f64>() / n;
        let (mut mu20, mut mu02, mut mu11) = (0.0, 0.0, 0.0);
        for &(y, x) in points {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            mu20 += dx * dx;
            mu02 += dy * dy;
            mu11 += dx * dy;
        }
        mu20 /= n;
        mu02 /= n;
        mu11 /= n;

        let mean = (mu20 + mu02) / 2.0;
        let diff = (((mu20 - mu02) / 2.0).powi(2) + mu11 * mu11).sqrt();
        Self {
            cy,
            cx,
            l1: mean + diff,
            l2: (mean - diff).max(0.0),
            orientation: 0.5 * (2.0 * mu11).atan2(mu20 - mu02),
        }
    }

    fn major_axis_length(&self) -> f64 {
        4.0 * self.l1.sqrt()
    }

    fn minor_axis_length(&self) -> f64 {
        4.0 * self.l2.sqrt()
    }
}

/// Volume of the solid obtained by rotating the 2D mask about its major axis.
///
/// The mask is sliced into unit-thick strips perpendicular to the major
/// axis; each strip's pixel count is its chord length, i.e. the diameter of
/// one disc of the solid.
fn rotational_volume(points: &[(usize, usize)], inertia: &Inertia) -> f64 {
    let (sin, cos) = inertia.orientation.sin_cos();
    let mut strips: BTreeMap<i64, usize> = BTreeMap::new();
    for &(y, x) in points {
        let u = (x as f64 - inertia.cx) * cos + (y as f64 - inertia.cy) * sin;
        *strips.entry(u.round() as i64).or_default() += 1;
    }
    strips
        .values()
        .map(|&count| {
            let r = count as f64 / 2.0;
            PI * r * r
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(lab: &mut Labels, id: CellId, y0: usize, x0: usize, side: usize) {
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                lab[[0, y, x]] = id;
            }
        }
    }

    #[test]
    fn test_basic_props() {
        let mut lab = Labels::zeros((1, 10, 10));
        square(&mut lab, 4, 2, 3, 3);
        let rp = regionprops(&lab, PhysicalSize::default(), false);
        assert_eq!(rp.len(), 1);
        let obj = &rp[0];
        assert_eq!(obj.label, 4);
        assert_eq!(obj.area, 9);
        assert_eq!(obj.bbox.y0, 2);
        assert_eq!(obj.bbox.x1, 6);
        assert!((obj.centroid.1 - 3.0).abs() < 1e-9);
        assert!((obj.centroid.2 - 4.0).abs() < 1e-9);
        assert!(obj.vol_vox_3d.is_none());
        assert_eq!(obj.representative_point(), [0, 3, 4]);
    }

    #[test]
    fn test_sorted_by_label() {
        let mut lab = Labels::zeros((1, 10, 10));
        square(&mut lab, 9, 0, 0, 2);
        square(&mut lab, 2, 5, 5, 2);
        let labels: Vec<_> = regionprops(&lab, PhysicalSize::default(), false)
            .iter()
            .map(|r| r.label)
            .collect();
        assert_eq!(labels, vec![2, 9]);
    }

    #[test]
    fn test_rotational_volume_of_bar() {
        // A 1-pixel wide bar: every strip has a chord of one pixel.
        let mut lab = Labels::zeros((1, 3, 10));
        for x in 0..10 {
            lab[[0, 1, x]] = 1;
        }
        let rp = regionprops(&lab, PhysicalSize::new(2.0, 3.0, 1.0), false);
        let expected = 10.0 * PI * 0.25;
        assert!((rp[0].vol_vox - expected).abs() < 1e-9);
        assert!((rp[0].vol_fl - expected * 3.0 * 4.0).abs() < 1e-9);
        assert!(rp[0].major_axis_length > rp[0].minor_axis_length);
    }

    #[test]
    fn test_3d_volume() {
        let mut lab = Labels::zeros((2, 4, 4));
        lab[[0, 1, 1]] = 1;
        lab[[1, 1, 1]] = 1;
        let rp = regionprops(&lab, PhysicalSize::new(0.5, 0.5, 2.0), true);
        assert_eq!(rp[0].vol_vox_3d, Some(2.0));
        assert_eq!(rp[0].vol_fl_3d, Some(2.0 * 0.5));
        assert_eq!(rp[0].projected_coords(), vec![(1, 1)]);
    }

    #[test]
    fn test_mask_cropped() {
        let mut lab = Labels::zeros((1, 6, 6));
        lab[[0, 2, 2]] = 5;
        lab[[0, 3, 3]] = 5;
        let rp = regionprops(&lab, PhysicalSize::default(), false);
        let mask = rp[0].mask();
        assert_eq!(mask.shape(), &[1, 2, 2]);
        assert!(mask[[0, 0, 0]] && mask[[0, 1, 1]]);
        assert!(!mask[[0, 0, 1]]);
    }
}
