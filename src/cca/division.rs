//! Division annotation and its undo.

use acdc_labels::CellId;

use super::{CcaRecorder, has_cca, row, set_row};
use crate::error::{EngineError, Result};
use crate::model::{CcaRow, CellCycleStage, Relationship};
use crate::position::Position;

/// Annotate that the S-phase pair of `id` divides at frame `i`.
///
/// Both cells become G1 with their generation incremented and
/// `division_frame_i = i`. The annotation is repeated on following frames
/// while the pair is still in the same S phase, and earlier frames of that
/// phase get `will_divide`.
pub fn annotate_division(pos: &mut Position, i: usize, id: CellId) -> Result<()> {
    let mut rec = CcaRecorder::new(i, format!("division of {}", id));
    annotate_division_recorded(pos, &mut rec, i, id)?;
    rec.commit(pos);
    Ok(())
}

pub(crate) fn annotate_division_recorded(
    pos: &mut Position,
    rec: &mut CcaRecorder,
    i: usize,
    id: CellId,
) -> Result<CellId> {
    let current = row(pos, i, id).ok_or(EngineError::UnknownId(id))?;
    if current.stage != CellCycleStage::S {
        return Err(EngineError::cca_refused(format!("cell {} is not in S phase at frame {}", id, i)));
    }
    let Some(rel) = current.relative_id.filter(|&r| row(pos, i, r).is_some()) else {
        return Err(EngineError::cca_refused(format!("cell {} has no bud at frame {}", id, i)));
    };

    let same_phase = |pos: &Position, j: usize| {
        row(pos, j, id).is_some_and(|r| r.stage == CellCycleStage::S && r.relative_id == Some(rel))
            && row(pos, j, rel).is_some()
    };

    let mut j = i;
    while j < pos.size_t() && has_cca(pos, j) && same_phase(pos, j) {
        for cell in [id, rel] {
            if let Some(old) = row(pos, j, cell) {
                let divided = CcaRow {
                    stage: CellCycleStage::G1,
                    generation_num: old.generation_num + 1,
                    relationship: Relationship::Mother,
                    division_frame_i: Some(i),
                    will_divide: false,
                    ..old
                };
                set_row(pos, rec, j, cell, divided);
            }
        }
        j += 1;
    }

    let mut j = i;
    while j > 0 && has_cca(pos, j - 1) && same_phase(pos, j - 1) {
        j -= 1;
        for cell in [id, rel] {
            if let Some(old) = row(pos, j, cell) {
                set_row(pos, rec, j, cell, CcaRow { will_divide: true, ..old });
            }
        }
    }
    log::debug!("Annotated division of {} and {} at frame {}", id, rel, i);
    Ok(rel)
}

/// Revert the division of `id` annotated at frame `i`.
///
/// Both cells go back to S with their generation decremented. The younger
/// one (lower generation, then later emergence, then higher ID) becomes the
/// bud again.
pub fn undo_division(pos: &mut Position, i: usize, id: CellId) -> Result<()> {
    let current = row(pos, i, id).ok_or(EngineError::UnknownId(id))?;
    let rel = current
        .relative_id
        .filter(|_| current.is_g1() && current.division_frame_i == Some(i))
        .ok_or_else(|| EngineError::cca_refused(format!("cell {} did not divide at frame {}", id, i)))?;
    let partner = row(pos, i, rel)
        .ok_or_else(|| EngineError::cca_refused(format!("relative {} of {} is missing at frame {}", rel, id, i)))?;
    if partner.division_frame_i != Some(i) || partner.relative_id != Some(id) {
        return Err(EngineError::cca_refused(format!(
            "cells {} and {} did not divide from each other at frame {}",
            id, rel, i
        )));
    }

    let gen_a = current.generation_num.saturating_sub(1);
    let gen_b = partner.generation_num.saturating_sub(1);
    let id_is_bud = (gen_a, std::cmp::Reverse(current.emerg_frame_i), std::cmp::Reverse(id))
        < (gen_b, std::cmp::Reverse(partner.emerg_frame_i), std::cmp::Reverse(rel));
    let (bud, mother) = if id_is_bud { (id, rel) } else { (rel, id) };

    let mut rec = CcaRecorder::new(i, format!("undo division of {}", id));
    let divided_here = |pos: &Position, j: usize, cell: CellId, other: CellId| {
        row(pos, j, cell).is_some_and(|r| r.is_g1() && r.division_frame_i == Some(i) && r.relative_id == Some(other))
    };

    let mut j = i;
    while j < pos.size_t() && has_cca(pos, j) && divided_here(pos, j, id, rel) && divided_here(pos, j, rel, id) {
        for cell in [id, rel] {
            let Some(old) = row(pos, j, cell) else { continue };
            let previous_division = i
                .checked_sub(1)
                .and_then(|p| row(pos, p, cell))
                .and_then(|r| r.division_frame_i);
            let restored = CcaRow {
                stage: CellCycleStage::S,
                generation_num: old.generation_num.saturating_sub(1),
                relationship: if cell == bud { Relationship::Bud } else { Relationship::Mother },
                division_frame_i: previous_division,
                will_divide: false,
                ..old
            };
            set_row(pos, &mut rec, j, cell, restored);
        }
        j += 1;
    }

    let mut j = i;
    while j > 0
        && has_cca(pos, j - 1)
        && row(pos, j - 1, id).is_some_and(|r| r.stage == CellCycleStage::S && r.relative_id == Some(rel))
    {
        j -= 1;
        for cell in [id, rel] {
            if let Some(old) = row(pos, j, cell) {
                set_row(pos, &mut rec, j, cell, CcaRow { will_divide: false, ..old });
            }
        }
    }

    log::debug!("Undid division of {} (bud {}) at frame {}", mother, bud, i);
    rec.commit(pos);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cca::tests::{pair, position};

    fn divided_pair() -> Position {
        let objects: &[(CellId, usize, usize)] = &[(10, 1, 1), (11, 4, 4)];
        let mut pos = position(&[objects; 6]);
        pair(&mut pos, 0..=5, 10, 11);
        pos
    }

    #[test]
    fn test_division_and_exact_undo() {
        let mut pos = divided_pair();
        let before = pos.slot(5).unwrap().acdc.clone();

        annotate_division(&mut pos, 5, 10).unwrap();
        let mother = row(&pos, 5, 10).unwrap();
        let bud = row(&pos, 5, 11).unwrap();
        assert!(mother.is_g1() && bud.is_g1());
        assert_eq!(mother.generation_num, 3);
        assert_eq!(bud.generation_num, 1);
        assert_eq!((mother.division_frame_i, bud.division_frame_i), (Some(5), Some(5)));
        assert_eq!(bud.relationship, Relationship::Mother);
        assert!(row(&pos, 3, 10).unwrap().will_divide);

        undo_division(&mut pos, 5, 10).unwrap();
        assert_eq!(pos.slot(5).unwrap().acdc, before);
        assert!(!row(&pos, 3, 10).unwrap().will_divide);
    }

    #[test]
    fn test_division_walks_forward() {
        let mut pos = divided_pair();
        annotate_division(&mut pos, 2, 11).unwrap();
        for j in 2..=5 {
            assert_eq!(row(&pos, j, 10).unwrap().division_frame_i, Some(2));
        }
        assert_eq!(row(&pos, 1, 11).unwrap().stage, CellCycleStage::S);
    }

    #[test]
    fn test_division_refused_in_g1() {
        let mut pos = divided_pair();
        annotate_division(&mut pos, 5, 10).unwrap();
        assert!(matches!(
            annotate_division(&mut pos, 5, 10),
            Err(EngineError::CcaEligibility { override_from: None, .. })
        ));
        assert!(undo_division(&mut pos, 4, 10).is_err());
    }
}
