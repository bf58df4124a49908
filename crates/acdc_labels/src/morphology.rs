//! Single-object morphology that never overwrites neighbouring objects.

use std::collections::VecDeque;

use ndarray::{Array2, ArrayView2};

use crate::components::{Connectivity, for_each_neighbor};
use crate::{CellId, Labels};

fn object_coords(labels: &Labels, id: CellId) -> Vec<[usize; 3]> {
    labels
        .indexed_iter()
        .filter(|&(_, &v)| v == id)
        .map(|((z, y, x), _)| [z, y, x])
        .collect()
}

/// Grow `id` into adjacent background pixels, one pixel per iteration.
///
/// Returns the number of pixels added.
pub fn dilate_object(labels: &mut Labels, id: CellId, iterations: usize) -> usize {
    let dims = labels.dim();
    let mut added = 0;
    for _ in 0..iterations {
        let mut frontier = Vec::new();
        for p in object_coords(labels, id) {
            for_each_neighbor(dims, p, Connectivity::Face, |n| {
                if labels[n] == 0 {
                    frontier.push(n);
                }
            });
        }
        if frontier.is_empty() {
            break;
        }
        for n in frontier {
            if labels[n] == 0 {
                labels[n] = id;
                added += 1;
            }
        }
    }
    added
}

/// Peel the outer layer of `id`, one pixel per iteration.
///
/// Pixels touching the image border are not considered boundary pixels.
/// Returns the number of pixels removed.
pub fn erode_object(labels: &mut Labels, id: CellId, iterations: usize) -> usize {
    let dims = labels.dim();
    let mut removed = 0;
    for _ in 0..iterations {
        let boundary: Vec<[usize; 3]> = object_coords(labels, id)
            .into_iter()
            .filter(|&p| {
                let mut on_edge = false;
                for_each_neighbor(dims, p, Connectivity::Face, |n| {
                    on_edge |= labels[n] != id;
                });
                on_edge
            })
            .collect();
        if boundary.is_empty() {
            break;
        }
        for p in boundary {
            labels[p] = 0;
            removed += 1;
        }
    }
    removed
}

/// Fill background holes fully enclosed by `id`, slice by slice.
///
/// Returns the number of pixels filled.
pub fn fill_holes_object(labels: &mut Labels, id: CellId) -> usize {
    let (depth, _, _) = labels.dim();
    let mut filled = 0;
    for z in 0..depth {
        let slice_coords: Vec<(usize, usize)> = labels
            .index_axis(ndarray::Axis(0), z)
            .indexed_iter()
            .filter(|&(_, &v)| v == id)
            .map(|(p, _)| p)
            .collect();
        if slice_coords.is_empty() {
            continue;
        }
        let y0 = slice_coords.iter().map(|p| p.0).min().unwrap_or(0);
        let y1 = slice_coords.iter().map(|p| p.0).max().unwrap_or(0) + 1;
        let x0 = slice_coords.iter().map(|p| p.1).min().unwrap_or(0);
        let x1 = slice_coords.iter().map(|p| p.1).max().unwrap_or(0) + 1;

        // Grid padded by one cell on every side; padding is always outside.
        let gh = y1 - y0 + 2;
        let gw = x1 - x0 + 2;
        let is_object = |gy: usize, gx: usize| -> bool {
            if gy == 0 || gx == 0 || gy == gh - 1 || gx == gw - 1 {
                return false;
            }
            labels[[z, y0 + gy - 1, x0 + gx - 1]] == id
        };

        let mut outside = Array2::from_elem((gh, gw), false);
        let mut queue = VecDeque::new();
        for gy in 0..gh {
            for gx in 0..gw {
                if gy == 0 || gx == 0 || gy == gh - 1 || gx == gw - 1 {
                    outside[[gy, gx]] = true;
                    queue.push_back((gy, gx));
                }
            }
        }
        while let Some((gy, gx)) = queue.pop_front() {
            let candidates = [
                (gy.wrapping_sub(1), gx),
                (gy + 1, gx),
                (gy, gx.wrapping_sub(1)),
                (gy, gx + 1),
            ];
            for (ny, nx) in candidates {
                if ny >= gh || nx >= gw || outside[[ny, nx]] || is_object(ny, nx) {
                    continue;
                }
                outside[[ny, nx]] = true;
                queue.push_back((ny, nx));
            }
        }

        let mut to_fill = Vec::new();
        for gy in 1..gh - 1 {
            for gx in 1..gw - 1 {
                let (y, x) = (y0 + gy - 1, x0 + gx - 1);
                if !outside[[gy, gx]] && labels[[z, y, x]] == 0 {
                    to_fill.push((y, x));
                }
            }
        }
        for (y, x) in to_fill {
            labels[[z, y, x]] = id;
            filled += 1;
        }
    }
    filled
}

/// 4-connected region of pixels whose intensity is within `tolerance` of the seed.
pub fn flood_fill(image: ArrayView2<'_, f32>, seed: (usize, usize), tolerance: f32) -> Array2<bool> {
    let (h, w) = image.dim();
    let mut mask = Array2::from_elem((h, w), false);
    if seed.0 >= h || seed.1 >= w {
        return mask;
    }
    let reference = image[seed];
    let mut queue = VecDeque::from([seed]);
    mask[seed] = true;
    while let Some((y, x)) = queue.pop_front() {
        let candidates = [
            (y.wrapping_sub(1), x),
            (y + 1, x),
            (y, x.wrapping_sub(1)),
            (y, x + 1),
        ];
        for (ny, nx) in candidates {
            if ny >= h || nx >= w || mask[[ny, nx]] {
                continue;
            }
            if (image[[ny, nx]] - reference).abs() <= tolerance {
                mask[[ny, nx]] = true;
                queue.push_back((ny, nx));
            }
        }
    }
    mask
}

/// Rigidly shift `id` by `(dy, dx)`.
///
/// Pixels leaving the image are dropped and pixels landing on another
/// object are not written. Returns the number of pixels written.
pub fn translate_object(labels: &mut Labels, id: CellId, dy: i64, dx: i64) -> usize {
    let (_, h, w) = labels.dim();
    let coords = object_coords(labels, id);
    for &p in &coords {
        labels[p] = 0;
    }
    let mut written = 0;
    for [z, y, x] in coords {
        let ny = y as i64 + dy;
        let nx = x as i64 + dx;
        if ny < 0 || nx < 0 || ny >= h as i64 || nx >= w as i64 {
            continue;
        }
        let target = [z, ny as usize, nx as usize];
        if labels[target] == 0 {
            labels[target] = id;
            written += 1;
        }
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> Labels {
        let mut lab = Labels::zeros((1, 7, 7));
        for y in 1..6 {
            for x in 1..6 {
                if y == 1 || y == 5 || x == 1 || x == 5 {
                    lab[[0, y, x]] = 1;
                }
            }
        }
        lab
    }

    #[test]
    fn test_fill_holes() {
        let mut lab = ring();
        let filled = fill_holes_object(&mut lab, 1);
        assert_eq!(filled, 9);
        assert_eq!(lab[[0, 3, 3]], 1);
        assert_eq!(lab[[0, 0, 0]], 0);
    }

    #[test]
    fn test_fill_holes_keeps_other_objects() {
        let mut lab = ring();
        lab[[0, 3, 3]] = 2;
        let filled = fill_holes_object(&mut lab, 1);
        assert_eq!(filled, 8);
        assert_eq!(lab[[0, 3, 3]], 2);
    }

    #[test]
    fn test_dilate_does_not_overwrite() {
        let mut lab = Labels::zeros((1, 5, 5));
        lab[[0, 2, 2]] = 1;
        lab[[0, 2, 3]] = 2;
        let added = dilate_object(&mut lab, 1, 1);
        assert_eq!(added, 3);
        assert_eq!(lab[[0, 2, 3]], 2);
        assert_eq!(lab[[0, 1, 2]], 1);
    }

    #[test]
    fn test_erode_square() {
        let mut lab = Labels::zeros((1, 7, 7));
        for y in 1..6 {
            for x in 1..6 {
                lab[[0, y, x]] = 4;
            }
        }
        let removed = erode_object(&mut lab, 4, 1);
        assert_eq!(removed, 16);
        assert_eq!(lab.iter().filter(|&&v| v == 4).count(), 9);
    }

    #[test]
    fn test_translate_clips() {
        let mut lab = Labels::zeros((1, 4, 4));
        lab[[0, 0, 0]] = 3;
        lab[[0, 0, 3]] = 3;
        let written = translate_object(&mut lab, 3, 1, 1);
        assert_eq!(written, 1);
        assert_eq!(lab[[0, 1, 1]], 3);
        assert_eq!(lab.iter().filter(|&&v| v == 3).count(), 1);
    }

    #[test]
    fn test_flood_fill_tolerance() {
        let mut img = Array2::<f32>::zeros((3, 3));
        img[[0, 2]] = 5.0;
        let mask = flood_fill(img.view(), (1, 1), 0.5);
        assert_eq!(mask.iter().filter(|&&m| m).count(), 8);
        assert!(!mask[[0, 2]]);
    }
}
