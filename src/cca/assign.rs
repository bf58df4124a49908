//! Bud-to-mother assignment.

use acdc_labels::CellId;

use super::{CcaRecorder, first_cca_frame, has_cca, row, set_row};
use crate::error::{EngineError, Result};
use crate::model::{CcaRow, CellCycleStage, Relationship};
use crate::position::Position;
use crate::prompt::{OperatorPrompt, PromptRequest};

/// Why a candidate mother cannot take the bud at frame `frame`.
struct Violation {
    frame: usize,
    reason: String,
}

/// Assign `bud` to `mother` at frame `i`.
///
/// The mother must be in G1 (or already paired with this bud) on every frame
/// from the bud's emergence until the last frame where it is still a bud.
/// Violations up to frame `i` refuse the assignment. A violation on a later
/// frame can be overridden by the operator, which discards the cell-cycle
/// annotations from that frame on.
pub fn assign_bud(
    pos: &mut Position,
    i: usize,
    bud: CellId,
    mother: CellId,
    prompt: &mut dyn OperatorPrompt,
) -> Result<()> {
    if bud == mother {
        return Err(EngineError::cca_refused("a cell cannot be its own mother"));
    }
    let bud_row = row(pos, i, bud).ok_or(EngineError::UnknownId(bud))?;
    row(pos, i, mother).ok_or(EngineError::UnknownId(mother))?;

    let emergence = emergence_frame(pos, i, bud);
    let seed_frame = first_cca_frame(pos);
    let is_seed = |pos: &Position, j: usize| {
        Some(j) == seed_frame
            && row(pos, j, bud).is_some_and(|r| !r.is_history_known)
            && row(pos, j, mother).is_some_and(|r| !r.is_history_known)
    };
    if !bud_row.is_bud() && emergence != i && !is_seed(pos, i) {
        return Err(EngineError::cca_refused(format!(
            "cell {} is not a bud and did not appear at frame {}",
            bud, i
        )));
    }

    let mut last = i;
    while last + 1 < pos.size_t() && has_cca(pos, last + 1) && row(pos, last + 1, bud).is_some_and(|r| r.is_bud()) {
        last += 1;
    }

    let violation = (emergence..=last).find_map(|j| {
        if is_seed(pos, j) {
            return None;
        }
        match row(pos, j, mother) {
            None => Some(Violation {
                frame: j,
                reason: format!("cell {} does not exist at frame {}", mother, j),
            }),
            Some(r) if r.is_g1() || r.relative_id == Some(bud) => None,
            Some(r) => Some(Violation {
                frame: j,
                reason: format!(
                    "cell {} is in {} with bud {:?} at frame {}",
                    mother, r.stage, r.relative_id, j
                ),
            }),
        }
    });

    let mut rec = CcaRecorder::new(i, format!("assign bud {} to {}", bud, mother));
    if let Some(v) = violation {
        if v.frame <= i {
            return Err(EngineError::cca_refused(v.reason));
        }
        let request = PromptRequest::CcaOverride {
            bud,
            mother,
            from_frame: v.frame,
        };
        if !prompt.ask(&request).is_yes() {
            return Err(EngineError::cca_overridable(v.reason, v.frame));
        }
        for j in v.frame..pos.size_t() {
            if has_cca(pos, j) {
                rec.touch(pos, j);
                if let Some(slot) = pos.slot_mut(j) {
                    slot.acdc.clear_cca();
                }
            }
        }
        log::info!(
            "Discarded cell-cycle annotations from frame {} to assign {} to {}",
            v.frame,
            bud,
            mother
        );
        last = v.frame - 1;
    }

    for j in emergence..=last {
        pair_at(pos, &mut rec, j, bud, mother, emergence);
    }
    log::debug!("Assigned bud {} to mother {} on frames {}..={}", bud, mother, emergence, last);
    rec.commit(pos);
    Ok(())
}

/// First frame of the uninterrupted run of cell-cycle frames containing `id`
/// that ends at `i`.
fn emergence_frame(pos: &Position, i: usize, id: CellId) -> usize {
    let mut e = i;
    while e > 0 && has_cca(pos, e - 1) && row(pos, e - 1, id).is_some() {
        e -= 1;
    }
    e
}

fn pair_at(pos: &mut Position, rec: &mut CcaRecorder, j: usize, bud: CellId, mother: CellId, emergence: usize) {
    let (Some(bud_row), Some(mother_row)) = (row(pos, j, bud), row(pos, j, mother)) else {
        return;
    };

    if bud_row.is_bud() {
        if let Some(old_mother) = bud_row.relative_id.filter(|&m| m != mother) {
            if let Some(old) = row(pos, j, old_mother) {
                let released = CcaRow {
                    stage: CellCycleStage::G1,
                    relative_id: None,
                    ..old
                };
                set_row(pos, rec, j, old_mother, released);
            }
        }
    }
    if let Some(partner) = mother_row.relative_id.filter(|&p| p != bud) {
        if let Some(old) = row(pos, j, partner).filter(|r| r.relative_id == Some(mother)) {
            set_row(pos, rec, j, partner, CcaRow { relative_id: None, ..old });
        }
    }
    if let Some(bud_partner) = bud_row.relative_id.filter(|&p| p != mother && !bud_row.is_bud()) {
        if let Some(old) = row(pos, j, bud_partner).filter(|r| r.relative_id == Some(bud)) {
            set_row(pos, rec, j, bud_partner, CcaRow { relative_id: None, ..old });
        }
    }

    set_row(pos, rec, j, bud, CcaRow::new_bud(mother, emergence, true));
    let paired = CcaRow {
        stage: CellCycleStage::S,
        relative_id: Some(bud),
        relationship: Relationship::Mother,
        will_divide: false,
        ..mother_row
    };
    set_row(pos, rec, j, mother, paired);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cca::tests::{pair, position};
    use crate::model::check_symmetry;
    use crate::prompt::{AutoAccept, AutoReject};

    fn three_cells(n: usize) -> Position {
        let objects: &[(CellId, usize, usize)] = &[(1, 1, 1), (2, 4, 4), (3, 8, 8)];
        let frames = vec![objects; n];
        let mut pos = position(&frames);
        for j in 0..n {
            pos.slot_mut(j).unwrap().acdc.init_cca();
        }
        pos
    }

    #[test]
    fn test_reassign_bud_releases_old_mother() {
        let mut pos = three_cells(3);
        pair(&mut pos, 0..=2, 1, 2);
        assign_bud(&mut pos, 1, 2, 3, &mut AutoReject).unwrap();
        for j in 0..=2 {
            let cca = pos.slot(j).unwrap().acdc.cca().unwrap();
            assert!(check_symmetry(cca).is_ok());
            assert_eq!(cca[&2].relative_id, Some(3));
            assert!(cca[&2].corrected_assignment);
            assert_eq!(cca[&3].stage, CellCycleStage::S);
            assert_eq!(cca[&1].stage, CellCycleStage::G1);
            assert_eq!(cca[&1].relative_id, None);
        }
    }

    #[test]
    fn test_past_violation_is_refused() {
        let mut pos = three_cells(3);
        pair(&mut pos, 0..=2, 1, 2);
        // 3 is already in S at frame 0
        let cca = pos.slot_mut(0).unwrap().acdc.cca_mut().unwrap();
        cca.get_mut(&3).unwrap().stage = CellCycleStage::S;
        let err = assign_bud(&mut pos, 1, 2, 3, &mut AutoAccept).unwrap_err();
        assert!(matches!(err, EngineError::CcaEligibility { override_from: None, .. }));
        assert_eq!(pos.undo.cca().undo_count(), 0);
    }

    #[test]
    fn test_future_violation_override() {
        let mut pos = three_cells(4);
        pair(&mut pos, 1..=3, 1, 2);
        for j in 0..4 {
            let cca = pos.slot_mut(j).unwrap().acdc.cca_mut().unwrap();
            cca.get_mut(&3).unwrap().is_history_known = true;
            cca.get_mut(&1).unwrap().is_history_known = true;
        }
        pos.slot_mut(3).unwrap().acdc.cca_mut().unwrap().get_mut(&3).unwrap().stage = CellCycleStage::S;

        let err = assign_bud(&mut pos, 1, 2, 3, &mut AutoReject).unwrap_err();
        assert!(matches!(err, EngineError::CcaEligibility { override_from: Some(3), .. }));

        assign_bud(&mut pos, 1, 2, 3, &mut AutoAccept).unwrap();
        assert!(!pos.slot(3).unwrap().acdc.has_cca());
        assert_eq!(row(&pos, 2, 2).unwrap().relative_id, Some(3));
        assert_eq!(row(&pos, 1, 2).unwrap().emerg_frame_i, Some(0));
    }
}
