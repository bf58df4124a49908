//! Per-frame object annotation table (`acdc_df`).

use std::collections::{BTreeMap, BTreeSet};

use acdc_labels::{CellId, RegionProps};

use super::cca::{CcaRow, CcaTable, enforce_symmetry};
use crate::frame_state::FrameState;

/// Annotation columns of one object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectRow {
    /// `is_cell_dead`
    pub is_cell_dead: bool,
    /// `is_cell_excluded`
    pub is_cell_excluded: bool,
    /// `x_centroid`
    pub x_centroid: f64,
    /// `y_centroid`
    pub y_centroid: f64,
    /// `z_centroid`, only for 3D segmentations
    pub z_centroid: Option<f64>,
    /// `was_manually_edited`
    pub was_manually_edited: bool,
    /// Custom annotations this object carries
    pub custom: BTreeSet<String>,
}

impl ObjectRow {
    /// Fresh row for an object.
    pub fn from_props(rp: &RegionProps, is_3d: bool) -> Self {
        let mut row = Self::default();
        row.set_centroid(rp, is_3d);
        row
    }

    /// Refresh the centroid columns.
    pub fn set_centroid(&mut self, rp: &RegionProps, is_3d: bool) {
        let (z, y, x) = rp.centroid;
        self.x_centroid = x;
        self.y_centroid = y;
        self.z_centroid = is_3d.then_some(z);
    }
}

/// How object IDs changed during an edit.
///
/// `mapping` is applied simultaneously, so a swap is `{a: b, b: a}` and a
/// merge of `b` into `a` is `{b: a}`. `derived` lists `(new, source)` pairs
/// of objects split off an existing one, both as final IDs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdChanges {
    /// Old ID to new ID
    pub mapping: BTreeMap<CellId, CellId>,
    /// `(new, source)` for objects split off `source`
    pub derived: Vec<(CellId, CellId)>,
    /// Final IDs whose pixels were edited by hand
    pub edited: BTreeSet<CellId>,
}

impl IdChanges {
    /// No ID changes.
    pub fn none() -> Self {
        Self::default()
    }

    /// Only mark objects as manually edited.
    pub fn edited(ids: impl IntoIterator<Item = CellId>) -> Self {
        Self {
            edited: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    /// `old` now carries `new`.
    pub fn rename(old: CellId, new: CellId) -> Self {
        let mut changes = Self::edited([new]);
        changes.mapping.insert(old, new);
        changes
    }

    /// `a` and `b` exchanged IDs.
    pub fn swap(a: CellId, b: CellId) -> Self {
        let mut changes = Self::edited([a, b]);
        changes.mapping.insert(a, b);
        changes.mapping.insert(b, a);
        changes
    }

    /// `from` was merged into `into`.
    pub fn merge(from: CellId, into: CellId) -> Self {
        Self::rename(from, into)
    }

    /// Whether no ID changed.
    pub fn is_identity(&self) -> bool {
        self.mapping.iter().all(|(a, b)| a == b) && self.derived.is_empty()
    }

    /// Follow these changes with a renumbering (e.g. from the tracker).
    pub fn then(mut self, next: &BTreeMap<CellId, CellId>) -> Self {
        if next.is_empty() {
            return self;
        }
        let apply = |id: CellId| next.get(&id).copied().unwrap_or(id);
        let mut composed: BTreeMap<CellId, CellId> = BTreeMap::new();
        for (&old, &mid) in &self.mapping {
            composed.insert(old, apply(mid));
        }
        for (&old, &new) in next {
            composed.entry(old).or_insert(new);
        }
        composed.retain(|a, b| a != b);
        self.mapping = composed;
        self.derived = self
            .derived
            .iter()
            .map(|&(new, source)| (apply(new), apply(source)))
            .collect();
        self.edited = self.edited.iter().map(|&id| apply(id)).collect();
        self
    }
}

/// What [`AcdcTable::reconcile`] changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Rows dropped because their ID disappeared
    pub dropped: Vec<CellId>,
    /// Rows added for new IDs
    pub added: Vec<CellId>,
    /// Cell-cycle rows reset because their relative disappeared
    pub redefaulted: Vec<CellId>,
}

impl ReconcileReport {
    /// Whether nothing had to change.
    pub fn is_clean(&self) -> bool {
        self.dropped.is_empty() && self.added.is_empty() && self.redefaulted.is_empty()
    }
}

/// Annotation table of one frame, keyed by object ID.
///
/// The cell-cycle columns are either present for every row or absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcdcTable {
    rows: BTreeMap<CellId, ObjectRow>,
    cca: Option<CcaTable>,
}

impl AcdcTable {
    /// Empty table without cell-cycle columns.
    pub fn new() -> Self {
        Self::default()
    }

    /// One default row per object of the frame.
    pub fn from_frame_state(fs: &FrameState, is_3d: bool) -> Self {
        Self {
            rows: fs
                .props()
                .iter()
                .map(|rp| (rp.label, ObjectRow::from_props(rp, is_3d)))
                .collect(),
            cca: None,
        }
    }

    /// Build from loaded rows.
    pub fn from_parts(rows: BTreeMap<CellId, ObjectRow>, cca: Option<CcaTable>) -> Self {
        Self { rows, cca }
    }

    /// IDs with a row, ascending.
    pub fn ids(&self) -> impl Iterator<Item = CellId> + '_ {
        self.rows.keys().copied()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Whether `id` has a row.
    pub fn contains(&self, id: CellId) -> bool {
        self.rows.contains_key(&id)
    }

    /// Row of `id`.
    pub fn row(&self, id: CellId) -> Option<&ObjectRow> {
        self.rows.get(&id)
    }

    /// Mutable row of `id`.
    pub fn row_mut(&mut self, id: CellId) -> Option<&mut ObjectRow> {
        self.rows.get_mut(&id)
    }

    /// Iterate rows in ID order.
    pub fn rows(&self) -> impl Iterator<Item = (CellId, &ObjectRow)> + '_ {
        self.rows.iter().map(|(&id, row)| (id, row))
    }

    /// Mutable iteration over rows.
    pub fn rows_mut(&mut self) -> impl Iterator<Item = (CellId, &mut ObjectRow)> + '_ {
        self.rows.iter_mut().map(|(&id, row)| (id, row))
    }

    /// Whether cell-cycle columns are present.
    pub fn has_cca(&self) -> bool {
        self.cca.is_some()
    }

    /// Cell-cycle columns, if present.
    pub fn cca(&self) -> Option<&CcaTable> {
        self.cca.as_ref()
    }

    /// Mutable cell-cycle columns, if present.
    pub fn cca_mut(&mut self) -> Option<&mut CcaTable> {
        self.cca.as_mut()
    }

    /// Cell-cycle row of `id`.
    pub fn cca_row(&self, id: CellId) -> Option<&CcaRow> {
        self.cca.as_ref()?.get(&id)
    }

    /// Mutable cell-cycle row of `id`.
    pub fn cca_row_mut(&mut self, id: CellId) -> Option<&mut CcaRow> {
        self.cca.as_mut()?.get_mut(&id)
    }

    /// Replace the cell-cycle columns.
    ///
    /// Rows are completed with defaults and entries without an object row
    /// are discarded, so a partial table is never stored.
    pub fn set_cca(&mut self, cca: Option<CcaTable>) {
        self.cca = cca.map(|mut table| {
            table.retain(|id, _| self.rows.contains_key(id));
            for &id in self.rows.keys() {
                table.entry(id).or_default();
            }
            table
        });
    }

    /// Initialise cell-cycle columns with default rows for every object.
    pub fn init_cca(&mut self) {
        self.cca = Some(self.rows.keys().map(|&id| (id, CcaRow::default())).collect());
    }

    /// Drop the cell-cycle columns.
    pub fn clear_cca(&mut self) -> Option<CcaTable> {
        self.cca.take()
    }

    /// IDs excluded from analysis.
    pub fn binned_ids(&self) -> BTreeSet<CellId> {
        self.rows
            .iter()
            .filter(|(_, row)| row.is_cell_excluded)
            .map(|(&id, _)| id)
            .collect()
    }

    /// IDs marked as dead.
    pub fn rip_ids(&self) -> BTreeSet<CellId> {
        self.rows
            .iter()
            .filter(|(_, row)| row.is_cell_dead)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Remove a row, resetting the cell-cycle row of its relative.
    pub fn remove(&mut self, id: CellId) -> Option<ObjectRow> {
        let row = self.rows.remove(&id)?;
        if let Some(cca) = self.cca.as_mut() {
            if let Some(removed) = cca.remove(&id) {
                if let Some(rel) = removed.relative_id {
                    if cca.get(&rel).is_some_and(|r| r.relative_id == Some(id)) {
                        cca.insert(rel, CcaRow::default());
                    }
                }
            }
        }
        Some(row)
    }

    /// Re-key rows through an ID mapping applied simultaneously.
    ///
    /// Rows that would land on an ID that is kept (a merge) are dropped and
    /// their relatives reset. `relative_ID` values follow the mapping.
    /// Returns the dropped original IDs.
    pub fn apply_mapping(&mut self, mapping: &BTreeMap<CellId, CellId>) -> Vec<CellId> {
        if mapping.iter().all(|(a, b)| a == b) {
            return Vec::new();
        }
        let target = |id: CellId| mapping.get(&id).copied().unwrap_or(id);

        let old_rows = std::mem::take(&mut self.rows);
        let mut dropped = Vec::new();
        let (staying, moving): (Vec<_>, Vec<_>) =
            old_rows.into_iter().partition(|(id, _)| target(*id) == *id);
        let mut rows: BTreeMap<CellId, ObjectRow> = staying.into_iter().collect();
        for (id, row) in moving {
            let to = target(id);
            if rows.contains_key(&to) {
                dropped.push(id);
            } else {
                rows.insert(to, row);
            }
        }
        self.rows = rows;

        if let Some(old_cca) = self.cca.take() {
            let mut cca: CcaTable = CcaTable::new();
            let (staying, moving): (Vec<_>, Vec<_>) =
                old_cca.into_iter().partition(|(id, _)| target(*id) == *id);
            cca.extend(staying);
            for (id, row) in moving {
                if !dropped.contains(&id) {
                    cca.insert(target(id), row);
                }
            }
            for row in cca.values_mut() {
                match row.relative_id {
                    Some(rel) if dropped.contains(&rel) => *row = CcaRow::default(),
                    Some(rel) => row.relative_id = Some(target(rel)),
                    None => {}
                }
            }
            self.cca = Some(cca);
        }
        dropped
    }

    /// Bring the table in line with the frame's objects after an edit.
    ///
    /// Applies the ID mapping, drops rows of vanished objects (resetting
    /// their relatives), adds rows for new objects (copied from the split
    /// source when there is one) and refreshes centroids.
    pub fn reconcile(&mut self, fs: &FrameState, changes: &IdChanges, is_3d: bool) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let dropped = self.apply_mapping(&changes.mapping);
        report.dropped.extend(dropped);

        let stale: Vec<CellId> = self.rows.keys().copied().filter(|&id| !fs.contains(id)).collect();
        for id in stale {
            let rel = self.cca_row(id).and_then(|r| r.relative_id);
            self.remove(id);
            if let Some(rel) = rel {
                if self.cca_row(rel) == Some(&CcaRow::default()) {
                    report.redefaulted.push(rel);
                }
            }
            report.dropped.push(id);
        }

        let sources: BTreeMap<CellId, CellId> = changes.derived.iter().copied().collect();
        for rp in fs.props() {
            let id = rp.label;
            if self.rows.contains_key(&id) {
                continue;
            }
            let source = sources.get(&id).copied();
            let mut row = match source.and_then(|s| self.rows.get(&s)) {
                Some(src) => src.clone(),
                None => ObjectRow::from_props(rp, is_3d),
            };
            row.set_centroid(rp, is_3d);
            self.rows.insert(id, row);
            if let Some(cca) = self.cca.as_mut() {
                let cca_row = match source.and_then(|s| cca.get(&s)) {
                    Some(src) => CcaRow {
                        relative_id: None,
                        ..*src
                    },
                    None => CcaRow::default(),
                };
                cca.insert(id, cca_row);
            }
            report.added.push(id);
        }

        for rp in fs.props() {
            if let Some(row) = self.rows.get_mut(&rp.label) {
                row.set_centroid(rp, is_3d);
                if changes.edited.contains(&rp.label) {
                    row.was_manually_edited = true;
                }
            }
        }

        if let Some(cca) = self.cca.as_mut() {
            let unlinked = enforce_symmetry(cca);
            if !unlinked.is_empty() {
                log::warn!("Unlinked one-sided relative_ID references of {:?}", unlinked);
            }
        }
        report
    }

    /// Self-repair against the frame's objects: drop orphan rows and add
    /// missing ones with defaults.
    pub fn repair(&mut self, fs: &FrameState, is_3d: bool) -> ReconcileReport {
        self.reconcile(fs, &IdChanges::none(), is_3d)
    }

    /// Check that rows and objects agree one-to-one.
    pub fn check(&self, fs: &FrameState) -> Result<(), String> {
        let orphans: Vec<CellId> = self.rows.keys().copied().filter(|&id| !fs.contains(id)).collect();
        let missing: Vec<CellId> = fs.ids().iter().copied().filter(|id| !self.rows.contains_key(id)).collect();
        if orphans.is_empty() && missing.is_empty() {
            Ok(())
        } else {
            Err(format!("orphan rows {:?}, objects without row {:?}", orphans, missing))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::cca::{CellCycleStage, Relationship};
    use acdc_labels::{Labels, PhysicalSize};

    fn frame(ids: &[(CellId, usize, usize)]) -> FrameState {
        let mut labels = Labels::zeros((1, 10, 10));
        for &(id, y, x) in ids {
            labels[[0, y, x]] = id;
        }
        FrameState::update(&labels, PhysicalSize::default(), false)
    }

    fn pair_table(fs: &FrameState) -> AcdcTable {
        let mut table = AcdcTable::from_frame_state(fs, false);
        table.init_cca();
        let cca = table.cca_mut().unwrap();
        cca.insert(
            1,
            CcaRow {
                stage: CellCycleStage::S,
                relative_id: Some(2),
                ..CcaRow::default()
            },
        );
        cca.insert(2, CcaRow::new_bud(1, 0, false));
        table
    }

    #[test]
    fn test_swap_moves_rows_and_links() {
        let fs = frame(&[(1, 1, 1), (2, 5, 5), (3, 8, 8)]);
        let mut table = pair_table(&fs);
        table.apply_mapping(&IdChanges::swap(1, 3).mapping);
        assert_eq!(table.cca_row(3).unwrap().relative_id, Some(2));
        assert_eq!(table.cca_row(2).unwrap().relative_id, Some(3));
        assert_eq!(table.cca_row(1).unwrap().relative_id, None);
    }

    #[test]
    fn test_merge_drops_row_and_resets_partner() {
        let fs = frame(&[(1, 1, 1), (2, 5, 5), (3, 8, 8)]);
        let mut table = pair_table(&fs);
        let dropped = table.apply_mapping(&IdChanges::merge(2, 3).mapping);
        assert_eq!(dropped, vec![2]);
        assert!(!table.contains(2));
        assert_eq!(table.cca_row(1), Some(&CcaRow::default()));
    }

    #[test]
    fn test_reconcile_deleted_and_added() {
        let fs = frame(&[(1, 1, 1), (2, 5, 5)]);
        let mut table = pair_table(&fs);
        let after = frame(&[(2, 5, 5), (7, 9, 9)]);
        let report = table.reconcile(&after, &IdChanges::none(), false);
        assert_eq!(report.dropped, vec![1]);
        assert_eq!(report.added, vec![7]);
        assert_eq!(table.cca_row(2), Some(&CcaRow::default()));
        assert_eq!(table.cca_row(7), Some(&CcaRow::default()));
        assert!(table.check(&after).is_ok());
    }

    #[test]
    fn test_reconcile_derived_copies_source_row() {
        let fs = frame(&[(1, 1, 1), (2, 5, 5)]);
        let mut table = pair_table(&fs);
        table.row_mut(1).unwrap().is_cell_dead = true;
        let after = frame(&[(1, 1, 1), (2, 5, 5), (4, 2, 2)]);
        let changes = IdChanges {
            derived: vec![(4, 1)],
            ..IdChanges::none()
        };
        table.reconcile(&after, &changes, false);
        assert!(table.row(4).unwrap().is_cell_dead);
        let copied = table.cca_row(4).unwrap();
        assert_eq!(copied.stage, CellCycleStage::S);
        assert_eq!(copied.relative_id, None);
        assert_eq!(table.cca_row(1).unwrap().relationship, Relationship::Mother);
    }

    #[test]
    fn test_then_composes_mappings() {
        let changes = IdChanges::rename(3, 8);
        let mut tracked = BTreeMap::new();
        tracked.insert(8, 2);
        tracked.insert(5, 6);
        let composed = changes.then(&tracked);
        assert_eq!(composed.mapping.get(&3), Some(&2));
        assert_eq!(composed.mapping.get(&5), Some(&6));
        assert!(composed.edited.contains(&2));
    }

    #[test]
    fn test_set_cca_completes_rows() {
        let fs = frame(&[(1, 1, 1), (2, 5, 5)]);
        let mut table = AcdcTable::from_frame_state(&fs, false);
        let mut partial = CcaTable::new();
        partial.insert(9, CcaRow::default());
        table.set_cca(Some(partial));
        let cca = table.cca().unwrap();
        assert_eq!(cca.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }
}
