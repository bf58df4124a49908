//! Cell-cycle annotation rows.

use std::collections::BTreeMap;
use std::fmt;

use acdc_labels::CellId;

/// Cell-cycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CellCycleStage {
    /// Unbudded
    #[default]
    G1,
    /// Budded (S/G2/M)
    S,
}

impl CellCycleStage {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            CellCycleStage::G1 => "G1",
            CellCycleStage::S => "S",
        }
    }

    /// Parse a column value.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "G1" => Some(CellCycleStage::G1),
            "S" => Some(CellCycleStage::S),
            _ => None,
        }
    }
}

impl fmt::Display for CellCycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a cell in its current mother/bud pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Relationship {
    /// Mother cell (also any unbudded cell)
    #[default]
    Mother,
    /// Bud that has not divided yet
    Bud,
}

impl Relationship {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Relationship::Mother => "mother",
            Relationship::Bud => "bud",
        }
    }

    /// Parse a column value.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "mother" => Some(Relationship::Mother),
            "bud" => Some(Relationship::Bud),
            _ => None,
        }
    }
}

/// Cell-cycle columns of one object at one frame.
///
/// `None` fields are written as `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcaRow {
    /// `cell_cycle_stage`
    pub stage: CellCycleStage,
    /// `generation_num`
    pub generation_num: u32,
    /// `relative_ID`
    pub relative_id: Option<CellId>,
    /// `relationship`
    pub relationship: Relationship,
    /// `emerg_frame_i`
    pub emerg_frame_i: Option<usize>,
    /// `division_frame_i`
    pub division_frame_i: Option<usize>,
    /// `is_history_known`
    pub is_history_known: bool,
    /// `corrected_assignment`
    pub corrected_assignment: bool,
    /// `will_divide`
    pub will_divide: bool,
}

impl Default for CcaRow {
    /// Row of a cell with unknown history: G1 mother of generation 2.
    fn default() -> Self {
        Self {
            stage: CellCycleStage::G1,
            generation_num: 2,
            relative_id: None,
            relationship: Relationship::Mother,
            emerg_frame_i: None,
            division_frame_i: None,
            is_history_known: false,
            corrected_assignment: false,
            will_divide: false,
        }
    }
}

impl CcaRow {
    /// Row of a freshly assigned bud.
    pub fn new_bud(mother: CellId, emerg_frame_i: usize, corrected: bool) -> Self {
        Self {
            stage: CellCycleStage::S,
            generation_num: 0,
            relative_id: Some(mother),
            relationship: Relationship::Bud,
            emerg_frame_i: Some(emerg_frame_i),
            division_frame_i: None,
            is_history_known: true,
            corrected_assignment: corrected,
            will_divide: false,
        }
    }

    /// Whether the cell is currently a bud.
    pub fn is_bud(&self) -> bool {
        self.relationship == Relationship::Bud
    }

    /// Whether the cell is in G1.
    pub fn is_g1(&self) -> bool {
        self.stage == CellCycleStage::G1
    }
}

/// Cell-cycle columns of every object of a frame.
pub type CcaTable = BTreeMap<CellId, CcaRow>;

/// Make `relative_ID` links symmetric by unlinking one-sided references.
///
/// Returns the IDs whose link was cleared.
pub fn enforce_symmetry(table: &mut CcaTable) -> Vec<CellId> {
    let broken: Vec<CellId> = table
        .iter()
        .filter_map(|(&id, row)| {
            let rel = row.relative_id?;
            let back = table.get(&rel).and_then(|r| r.relative_id);
            (table.contains_key(&rel) && back != Some(id)).then_some(id)
        })
        .collect();
    for id in &broken {
        if let Some(row) = table.get_mut(id) {
            row.relative_id = None;
        }
    }
    broken
}

/// Check `relative_ID` symmetry, reporting the first violation.
pub fn check_symmetry(table: &CcaTable) -> Result<(), (CellId, CellId)> {
    for (&id, row) in table {
        if let Some(rel) = row.relative_id {
            if let Some(other) = table.get(&rel) {
                if other.relative_id != Some(id) {
                    return Err((id, rel));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_row_is_unknown_history_g1() {
        let row = CcaRow::default();
        assert_eq!(row.stage, CellCycleStage::G1);
        assert_eq!(row.generation_num, 2);
        assert_eq!(row.relative_id, None);
        assert!(!row.is_history_known);
    }

    #[test]
    fn test_parse_roundtrip() {
        for stage in [CellCycleStage::G1, CellCycleStage::S] {
            assert_eq!(CellCycleStage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Relationship::parse("bud"), Some(Relationship::Bud));
        assert_eq!(Relationship::parse("sister"), None);
    }

    #[test]
    fn test_enforce_symmetry() {
        let mut table = CcaTable::new();
        table.insert(1, CcaRow { relative_id: Some(2), ..CcaRow::default() });
        table.insert(2, CcaRow { relative_id: Some(3), ..CcaRow::default() });
        table.insert(3, CcaRow { relative_id: Some(2), ..CcaRow::default() });
        assert_eq!(check_symmetry(&table), Err((1, 2)));
        assert_eq!(enforce_symmetry(&mut table), vec![1]);
        assert!(check_symmetry(&table).is_ok());
    }
}
