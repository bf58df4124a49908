//! Connected components and ID renumbering on label images.

use std::collections::{BTreeMap, VecDeque};

use ndarray::Array3;

use crate::{CellId, Labels};

/// Pixel neighbourhood used when growing regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// Face neighbours only: 4 in 2D, 6 in 3D.
    Face,
    /// All touching neighbours: 8 in 2D, 26 in 3D.
    Full,
}

/// Call `f` for every in-bounds neighbour of `idx`.
pub fn for_each_neighbor(
    dims: (usize, usize, usize),
    idx: [usize; 3],
    connectivity: Connectivity,
    mut f: impl FnMut([usize; 3]),
) {
    let (dz, dy, dx) = dims;
    for oz in -1i64..=1 {
        for oy in -1i64..=1 {
            for ox in -1i64..=1 {
                let manhattan = oz.abs() + oy.abs() + ox.abs();
                if manhattan == 0 {
                    continue;
                }
                if connectivity == Connectivity::Face && manhattan > 1 {
                    continue;
                }
                let z = idx[0] as i64 + oz;
                let y = idx[1] as i64 + oy;
                let x = idx[2] as i64 + ox;
                if z < 0 || y < 0 || x < 0 {
                    continue;
                }
                let (z, y, x) = (z as usize, y as usize, x as usize);
                if z < dz && y < dy && x < dx {
                    f([z, y, x]);
                }
            }
        }
    }
}

/// Split the pixels of `id` into connected components.
///
/// Components are sorted largest first; ties keep raster order, so the
/// component containing the first pixel in scan order wins.
pub fn object_components(labels: &Labels, id: CellId) -> Vec<Vec<[usize; 3]>> {
    let dims = labels.dim();
    let mut visited = Array3::from_elem(dims, false);
    let mut components = Vec::new();

    for ((z, y, x), &v) in labels.indexed_iter() {
        if v != id || visited[[z, y, x]] {
            continue;
        }
        let mut component = Vec::new();
        let mut queue = VecDeque::from([[z, y, x]]);
        visited[[z, y, x]] = true;
        while let Some(p) = queue.pop_front() {
            component.push(p);
            for_each_neighbor(dims, p, Connectivity::Full, |n| {
                if !visited[n] && labels[n] == id {
                    visited[n] = true;
                    queue.push_back(n);
                }
            });
        }
        components.push(component);
    }

    components.sort_by(|a, b| b.len().cmp(&a.len()));
    components
}

/// Label the connected components of a boolean mask, starting at 1.
///
/// Returns the label image and the number of components.
pub fn label_components(mask: &Array3<bool>) -> (Labels, CellId) {
    let dims = mask.dim();
    let mut out = Labels::zeros(dims);
    let mut next: CellId = 0;
    for ((z, y, x), &m) in mask.indexed_iter() {
        if !m || out[[z, y, x]] != 0 {
            continue;
        }
        next += 1;
        let mut queue = VecDeque::from([[z, y, x]]);
        out[[z, y, x]] = next;
        while let Some(p) = queue.pop_front() {
            for_each_neighbor(dims, p, Connectivity::Full, |n| {
                if mask[n] && out[n] == 0 {
                    out[n] = next;
                    queue.push_back(n);
                }
            });
        }
    }
    (out, next)
}

/// Give every extra component of `id` a fresh ID.
///
/// The largest component keeps `id`; the others receive `max_id + 1, + 2, …`
/// and `max_id` is advanced in place. Returns the newly created IDs.
pub fn relabel_object_components(labels: &mut Labels, id: CellId, max_id: &mut CellId) -> Vec<CellId> {
    let components = object_components(labels, id);
    let mut created = Vec::new();
    for component in components.iter().skip(1) {
        *max_id += 1;
        for &p in component {
            labels[p] = *max_id;
        }
        created.push(*max_id);
    }
    created
}

/// Run [`relabel_object_components`] for every ID in the image.
///
/// Returns `(original_id, new_ids)` for each object that was split.
pub fn relabel_multi_component(labels: &mut Labels, max_id: &mut CellId) -> Vec<(CellId, Vec<CellId>)> {
    let ids = crate::unique_ids(labels);
    *max_id = (*max_id).max(ids.iter().next_back().copied().unwrap_or(0));
    let mut split = Vec::new();
    for id in ids {
        let created = relabel_object_components(labels, id, max_id);
        if !created.is_empty() {
            log::debug!("Object {} had {} disconnected parts -> {:?}", id, created.len() + 1, created);
            split.push((id, created));
        }
    }
    split
}

/// Renumber IDs to `1..=N` in ascending order of the original IDs.
pub fn sequential_mapping(ids: impl IntoIterator<Item = CellId>) -> BTreeMap<CellId, CellId> {
    let mut sorted: Vec<CellId> = ids.into_iter().filter(|&id| id > 0).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.into_iter().zip(1..).collect()
}

/// Apply an ID mapping in place. IDs missing from the map are left alone.
pub fn apply_mapping(labels: &mut Labels, mapping: &BTreeMap<CellId, CellId>) {
    if mapping.iter().all(|(old, new)| old == new) {
        return;
    }
    labels.mapv_inplace(|v| mapping.get(&v).copied().unwrap_or(v));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_components_sorted_by_size() {
        let mut lab = Labels::zeros((1, 5, 7));
        lab[[0, 0, 0]] = 1;
        for x in 3..7 {
            lab[[0, 2, x]] = 1;
        }
        let comps = object_components(&lab, 1);
        assert_eq!(comps.len(), 2);
        assert_eq!(comps[0].len(), 4);
        assert_eq!(comps[1], vec![[0, 0, 0]]);
    }

    #[test]
    fn test_diagonal_is_connected() {
        let mut lab = Labels::zeros((1, 3, 3));
        lab[[0, 0, 0]] = 2;
        lab[[0, 1, 1]] = 2;
        assert_eq!(object_components(&lab, 2).len(), 1);
    }

    #[test]
    fn test_relabel_multi_component() {
        let mut lab = Labels::zeros((1, 4, 8));
        lab[[0, 0, 0]] = 3;
        lab[[0, 0, 1]] = 3;
        lab[[0, 3, 7]] = 3;
        lab[[0, 2, 4]] = 5;
        let mut max_id = 0;
        let split = relabel_multi_component(&mut lab, &mut max_id);
        assert_eq!(split, vec![(3, vec![6])]);
        assert_eq!(max_id, 6);
        assert_eq!(lab[[0, 0, 0]], 3);
        assert_eq!(lab[[0, 3, 7]], 6);
    }

    #[test]
    fn test_label_components() {
        let mut mask = Array3::from_elem((1, 3, 5), false);
        mask[[0, 0, 0]] = true;
        mask[[0, 2, 4]] = true;
        mask[[0, 2, 3]] = true;
        let (lab, n) = label_components(&mask);
        assert_eq!(n, 2);
        assert_eq!(lab[[0, 2, 3]], lab[[0, 2, 4]]);
        assert_ne!(lab[[0, 0, 0]], lab[[0, 2, 4]]);
    }

    #[test]
    fn test_sequential_mapping() {
        let mapping = sequential_mapping([9, 2, 5, 0, 5]);
        assert_eq!(mapping.get(&2), Some(&1));
        assert_eq!(mapping.get(&5), Some(&2));
        assert_eq!(mapping.get(&9), Some(&3));
        assert_eq!(mapping.len(), 3);
    }

    proptest::proptest! {
        #[test]
        fn test_sequential_mapping_is_dense(ids in proptest::collection::vec(0u32..500, 0..40)) {
            let mapping = sequential_mapping(ids.iter().copied());
            let values: Vec<CellId> = mapping.values().copied().collect();
            let expected: Vec<CellId> = (1..=mapping.len() as CellId).collect();
            proptest::prop_assert_eq!(values, expected);
        }

        #[test]
        fn test_relabel_leaves_single_components(cells in proptest::collection::vec((0usize..6, 0usize..6, 1u32..4), 0..20)) {
            let mut lab = Labels::zeros((1, 6, 6));
            for (y, x, id) in cells {
                lab[[0, y, x]] = id;
            }
            let mut max_id = 0;
            relabel_multi_component(&mut lab, &mut max_id);
            for id in crate::unique_ids(&lab) {
                proptest::prop_assert_eq!(object_components(&lab, id).len(), 1);
            }
        }
    }
}
