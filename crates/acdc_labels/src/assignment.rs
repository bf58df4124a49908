//! Minimum-cost bipartite assignment (Hungarian algorithm).

use ndarray::Array2;

/// Solve the rectangular linear sum assignment problem.
///
/// Returns `(row, col)` pairs sorted by row, one per row when there are
/// fewer rows than columns (one per column otherwise).
pub fn linear_sum_assignment(cost: &Array2<f64>) -> Vec<(usize, usize)> {
    let (rows, cols) = cost.dim();
    if rows == 0 || cols == 0 {
        return Vec::new();
    }
    if rows > cols {
        let transposed = cost.t().to_owned();
        let mut pairs: Vec<(usize, usize)> = solve(&transposed)
            .into_iter()
            .map(|(r, c)| (c, r))
            .collect();
        pairs.sort_unstable();
        return pairs;
    }
    solve(cost)
}

// Potentials-based O(n^2 m) method; requires rows <= cols.
fn solve(cost: &Array2<f64>) -> Vec<(usize, usize)> {
    let (n, m) = cost.dim();
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; m + 1];
    // p[j]: row (1-based) assigned to column j; 0 means free
    let mut p = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let cur = cost[[i0 - 1, j - 1]] - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            if j1 == 0 {
                // Only reachable with non-finite costs.
                break;
            }
            for j in 0..=m {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        while j0 != 0 {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
        }
    }

    let mut pairs: Vec<(usize, usize)> = (1..=m)
        .filter(|&j| p[j] != 0)
        .map(|j| (p[j] - 1, j - 1))
        .collect();
    pairs.sort_unstable();
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn total(cost: &Array2<f64>, pairs: &[(usize, usize)]) -> f64 {
        pairs.iter().map(|&(r, c)| cost[[r, c]]).sum()
    }

    #[test]
    fn test_square_assignment() {
        let cost = array![[4.0, 1.0, 3.0], [2.0, 0.0, 5.0], [3.0, 2.0, 2.0]];
        let pairs = linear_sum_assignment(&cost);
        assert_eq!(pairs.len(), 3);
        assert_eq!(total(&cost, &pairs), 5.0);
    }

    #[test]
    fn test_more_columns_than_rows() {
        let cost = array![[10.0, 1.0, 7.0], [1.0, 10.0, 7.0]];
        let pairs = linear_sum_assignment(&cost);
        assert_eq!(pairs, vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn test_more_rows_than_columns() {
        let cost = array![[5.0], [1.0], [3.0]];
        let pairs = linear_sum_assignment(&cost);
        assert_eq!(pairs, vec![(1, 0)]);
    }

    #[test]
    fn test_empty_matrix() {
        let cost = Array2::<f64>::zeros((0, 3));
        assert!(linear_sum_assignment(&cost).is_empty());
    }
}
