//! Manual ID reassignments kept across re-tracking.

use std::collections::BTreeMap;

use acdc_labels::CellId;

/// One manual reassignment: the object under `(z, y, x)` must carry `new_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManualEdit {
    /// Z-slice, only for 3D segmentations
    pub z: Option<usize>,
    /// Row of a pixel inside the object
    pub y: usize,
    /// Column of a pixel inside the object
    pub x: usize,
    /// ID the object must keep
    pub new_id: CellId,
}

/// Ordered list of manual reassignments of a position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManualEditLog {
    entries: Vec<ManualEdit>,
}

impl ManualEditLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn push(&mut self, entry: ManualEdit) {
        log::trace!("Manual edit log += {:?}", entry);
        self.entries.push(entry);
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[ManualEdit] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Largest ID referenced by the log.
    pub fn max_id(&self) -> CellId {
        self.entries.iter().map(|e| e.new_id).max().unwrap_or(0)
    }

    /// Rewrite IDs through a relabel mapping.
    pub fn remap(&mut self, mapping: &BTreeMap<CellId, CellId>) {
        for entry in &mut self.entries {
            if let Some(&new) = mapping.get(&entry.new_id) {
                entry.new_id = new;
            }
        }
    }

    /// Forget every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remap_and_max() {
        let mut log = ManualEditLog::new();
        log.push(ManualEdit { z: None, y: 1, x: 2, new_id: 9 });
        log.push(ManualEdit { z: None, y: 3, x: 4, new_id: 4 });
        assert_eq!(log.max_id(), 9);
        log.remap(&BTreeMap::from([(9, 1), (4, 2)]));
        assert_eq!(log.entries()[0].new_id, 1);
        assert_eq!(log.max_id(), 2);
    }
}
