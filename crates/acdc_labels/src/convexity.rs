//! Convex hull and convexity defects of traced contours.

use std::collections::HashSet;

/// A concavity between two consecutive hull vertices along the contour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvexityDefect {
    /// Hull vertex where the concavity starts, `(y, x)`.
    pub start: (i64, i64),
    /// Hull vertex where the concavity ends, `(y, x)`.
    pub end: (i64, i64),
    /// Contour point farthest from the hull edge, `(y, x)`.
    pub farthest: (i64, i64),
    /// Distance of `farthest` from the hull edge, in pixels.
    pub depth: f64,
}

fn cross(o: (i64, i64), a: (i64, i64), b: (i64, i64)) -> i64 {
    // Points are (y, x); compute the z of (a - o) × (b - o) in (x, y) space.
    (a.1 - o.1) * (b.0 - o.0) - (a.0 - o.0) * (b.1 - o.1)
}

/// Convex hull (Andrew's monotone chain) without collinear points.
pub fn convex_hull(points: &[(i64, i64)]) -> Vec<(i64, i64)> {
    let mut pts: Vec<(i64, i64)> = points.to_vec();
    pts.sort_unstable_by_key(|&(y, x)| (x, y));
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }

    let mut lower: Vec<(i64, i64)> = Vec::new();
    for &p in &pts {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0 {
            lower.pop();
        }
        lower.push(p);
    }
    let mut upper: Vec<(i64, i64)> = Vec::new();
    for &p in pts.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0 {
            upper.pop();
        }
        upper.push(p);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

fn distance_to_line(p: (i64, i64), a: (i64, i64), b: (i64, i64)) -> f64 {
    let len = (((b.0 - a.0).pow(2) + (b.1 - a.1).pow(2)) as f64).sqrt();
    if len == 0.0 {
        return 0.0;
    }
    (cross(a, b, p) as f64).abs() / len
}

/// Convexity defects of an ordered contour, deepest first.
pub fn convexity_defects(contour: &[(i64, i64)]) -> Vec<ConvexityDefect> {
    let hull: HashSet<(i64, i64)> = convex_hull(contour).into_iter().collect();
    if hull.len() < 3 {
        return Vec::new();
    }
    let hits: Vec<usize> = contour
        .iter()
        .enumerate()
        .filter(|(_, p)| hull.contains(p))
        .map(|(i, _)| i)
        .collect();
    if hits.len() < 2 {
        return Vec::new();
    }

    let n = contour.len();
    let mut defects = Vec::new();
    for k in 0..hits.len() {
        let ia = hits[k];
        let ib = if k + 1 < hits.len() {
            hits[k + 1]
        } else {
            hits[0] + n
        };
        let a = contour[ia];
        let b = contour[ib % n];
        if a == b || ib - ia < 2 {
            continue;
        }
        let mut best: Option<((i64, i64), f64)> = None;
        for idx in ia + 1..ib {
            let p = contour[idx % n];
            let d = distance_to_line(p, a, b);
            if best.is_none_or(|(_, bd)| d > bd) {
                best = Some((p, d));
            }
        }
        if let Some((farthest, depth)) = best {
            if depth > 0.0 {
                defects.push(ConvexityDefect {
                    start: a,
                    end: b,
                    farthest,
                    depth,
                });
            }
        }
    }
    defects.sort_by(|a, b| b.depth.total_cmp(&a.depth));
    defects
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contour::trace_contour;
    use ndarray::Array2;

    #[test]
    fn test_hull_of_square_has_four_corners() {
        let pts = vec![(0, 0), (0, 1), (0, 2), (1, 2), (2, 2), (2, 1), (2, 0), (1, 0), (1, 1)];
        let hull = convex_hull(&pts);
        assert_eq!(hull.len(), 4);
        for corner in [(0, 0), (0, 2), (2, 2), (2, 0)] {
            assert!(hull.contains(&corner));
        }
    }

    #[test]
    fn test_convex_shape_has_no_defects() {
        let mut mask = Array2::from_elem((6, 6), false);
        for y in 1..5 {
            for x in 1..5 {
                mask[[y, x]] = true;
            }
        }
        assert!(convexity_defects(&trace_contour(mask.view())).is_empty());
    }

    #[test]
    fn test_dumbbell_has_two_defects_at_bridge() {
        let mut mask = Array2::from_elem((20, 20), false);
        for y in 9..12 {
            for x in 7..10 {
                mask[[y, x]] = true;
            }
            for x in 11..14 {
                mask[[y, x]] = true;
            }
        }
        mask[[10, 10]] = true;
        let defects = convexity_defects(&trace_contour(mask.view()));
        let deep: Vec<_> = defects.iter().filter(|d| d.depth >= 1.0).collect();
        assert_eq!(deep.len(), 2);
        assert!(deep.iter().all(|d| d.farthest == (10, 10)));
    }
}
