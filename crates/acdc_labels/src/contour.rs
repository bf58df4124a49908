//! Object boundaries: ordered Moore tracing and unordered edge pixels.

use ndarray::{Array2, ArrayView2, Axis};

use crate::{CellId, Labels};

/// Moore neighbourhood in clockwise order (image Y axis points down), as `(dy, dx)`.
const DIRS: [(i64, i64); 8] = [
    (0, -1),
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
    (1, 0),
    (1, -1),
];

fn dir_index(dy: i64, dx: i64) -> usize {
    DIRS.iter().position(|&d| d == (dy, dx)).unwrap_or(0)
}

/// Project the pixels of `id` along Z into a 2D mask.
pub fn projected_mask(labels: &Labels, id: CellId) -> Array2<bool> {
    labels.map_axis(Axis(0), |column| column.iter().any(|&v| v == id))
}

/// Trace the outer boundary of the first object (in raster order) of `mask`.
///
/// Returns boundary pixels as `(y, x)` in clockwise order. Pixels on thin
/// bridges appear once per pass over them.
pub fn trace_contour(mask: ArrayView2<'_, bool>) -> Vec<(i64, i64)> {
    let (h, w) = mask.dim();
    let Some(((sy, sx), _)) = mask.indexed_iter().find(|&(_, &m)| m) else {
        return Vec::new();
    };
    let start = (sy as i64, sx as i64);
    let fg = |(y, x): (i64, i64)| -> bool {
        y >= 0 && x >= 0 && (y as usize) < h && (x as usize) < w && mask[[y as usize, x as usize]]
    };

    let area = mask.iter().filter(|&&m| m).count();
    let max_steps = 4 * area + 16;
    let mut contour = vec![start];
    let mut cur = start;
    let mut back = 0usize;

    for _ in 0..max_steps {
        let mut found = None;
        for k in 1..=8 {
            let d = (back + k) % 8;
            let n = (cur.0 + DIRS[d].0, cur.1 + DIRS[d].1);
            if fg(n) {
                found = Some((d, n));
                break;
            }
        }
        let Some((d, next)) = found else {
            break;
        };
        if cur == start && contour.len() > 1 && next == contour[1] {
            break;
        }
        let prev = DIRS[(d + 7) % 8];
        let b = (cur.0 + prev.0, cur.1 + prev.1);
        back = dir_index(b.0 - next.0, b.1 - next.1);
        contour.push(next);
        cur = next;
    }

    if contour.len() > 1 && contour.last() == Some(&start) {
        contour.pop();
    }
    contour
}

/// Unordered boundary pixels of a 2D mask (4-connected edge test).
pub fn boundary_pixels(mask: ArrayView2<'_, bool>) -> Vec<(usize, usize)> {
    let (h, w) = mask.dim();
    mask.indexed_iter()
        .filter(|&(_, &m)| m)
        .filter(|&((y, x), _)| {
            y == 0
                || x == 0
                || y + 1 == h
                || x + 1 == w
                || !mask[[y - 1, x]]
                || !mask[[y + 1, x]]
                || !mask[[y, x - 1]]
                || !mask[[y, x + 1]]
        })
        .map(|(p, _)| p)
        .collect()
}

/// Smallest Euclidean distance between two pixel sets (`INFINITY` if either is empty).
pub fn min_distance(a: &[(usize, usize)], b: &[(usize, usize)]) -> f64 {
    let mut best = f64::INFINITY;
    for &(ay, ax) in a {
        for &(by, bx) in b {
            let dy = ay as f64 - by as f64;
            let dx = ax as f64 - bx as f64;
            best = best.min(dy * dy + dx * dx);
        }
    }
    best.sqrt()
}
