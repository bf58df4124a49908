//! Per-frame object list and region properties.

use std::collections::HashMap;

use acdc_labels::{CellId, Labels, PhysicalSize, RegionProps, regionprops};

/// Region properties of one frame with O(1) lookup by ID.
#[derive(Debug, Clone, Default)]
pub struct FrameState {
    props: Vec<RegionProps>,
    ids: Vec<CellId>,
    index: HashMap<CellId, usize>,
}

impl FrameState {
    /// Compute region properties for a label image (`updateRP`).
    pub fn update(labels: &Labels, spacing: PhysicalSize, is_3d: bool) -> Self {
        let props = regionprops(labels, spacing, is_3d);
        let ids: Vec<CellId> = props.iter().map(|rp| rp.label).collect();
        let index = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        log::trace!("updateRP: {} objects", ids.len());
        Self { props, ids, index }
    }

    /// Region properties sorted by ID.
    pub fn props(&self) -> &[RegionProps] {
        &self.props
    }

    /// IDs present in the frame, ascending.
    pub fn ids(&self) -> &[CellId] {
        &self.ids
    }

    /// Position of `id` in [`FrameState::props`].
    pub fn index_of(&self, id: CellId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    /// Region properties of one object.
    pub fn get(&self, id: CellId) -> Option<&RegionProps> {
        self.index_of(id).map(|i| &self.props[i])
    }

    /// Whether `id` is present.
    pub fn contains(&self, id: CellId) -> bool {
        self.index.contains_key(&id)
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the frame has no objects.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Largest ID present (0 when empty).
    pub fn max_id(&self) -> CellId {
        self.ids.last().copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_id() {
        let mut labels = Labels::zeros((1, 6, 6));
        labels[[0, 1, 1]] = 4;
        labels[[0, 4, 4]] = 9;
        labels[[0, 4, 5]] = 9;
        let fs = FrameState::update(&labels, PhysicalSize::default(), false);
        assert_eq!(fs.ids(), &[4, 9]);
        assert_eq!(fs.index_of(9), Some(1));
        assert_eq!(fs.get(9).map(|rp| rp.area), Some(2));
        assert!(!fs.contains(5));
        assert_eq!(fs.max_id(), 9);
    }
}
