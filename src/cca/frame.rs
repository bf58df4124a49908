//! Cell-cycle columns of newly visited frames.

use std::collections::BTreeSet;

use acdc_labels::CellId;
use acdc_labels::assignment::linear_sum_assignment;
use acdc_labels::contour::{boundary_pixels, min_distance, projected_mask};
use ndarray::Array2;

use super::division::annotate_division_recorded;
use super::{CcaRecorder, frame_ids, has_cca, row};
use crate::error::{EngineError, Result};
use crate::model::{CcaRow, CcaTable, CellCycleStage, Relationship};
use crate::position::Position;
use crate::prompt::{OperatorPrompt, PromptRequest};

/// First frame up to `upto` without cell-cycle columns.
///
/// Entering cell-cycle mode starts there so that annotated frames never
/// follow an unannotated one.
pub fn first_frame_without_cca(pos: &Position, upto: usize) -> Option<usize> {
    (0..=upto.min(pos.size_t().saturating_sub(1))).find(|&j| !has_cca(pos, j))
}

/// Give frame `i` cell-cycle columns if it has none.
///
/// Frame 0 (or a frame after an unannotated one) starts with default rows.
/// Otherwise rows are copied from frame `i - 1` and objects that are new at
/// `i` are assigned as buds to the nearest G1 cells. When there are more new
/// objects than G1 cells the operator is asked first; declining leaves the
/// frame without cell-cycle columns and returns `Cancelled`.
pub fn init_frame(pos: &mut Position, i: usize, prompt: &mut dyn OperatorPrompt) -> Result<()> {
    pos.ensure_slot(i)?;
    if has_cca(pos, i) {
        return Ok(());
    }
    if i == 0 || !has_cca(pos, i - 1) {
        if let Some(slot) = pos.slot_mut(i) {
            slot.acdc.init_cca();
        }
        pos.mark_modified(i);
        log::debug!("Initialised cell-cycle columns of frame {} with defaults", i);
        return Ok(());
    }

    let prev: CcaTable = pos
        .slot(i - 1)
        .and_then(|s| s.acdc.cca().cloned())
        .unwrap_or_default();
    let ids: Vec<CellId> = pos.slot(i).map(|s| s.state.ids().to_vec()).unwrap_or_default();
    let new_ids: Vec<CellId> = ids.iter().copied().filter(|id| !prev.contains_key(id)).collect();
    let g1: Vec<CellId> = ids
        .iter()
        .copied()
        .filter(|id| prev.get(id).is_some_and(|r| r.is_g1()))
        .collect();

    if new_ids.len() > g1.len() {
        let request = PromptRequest::UnassignedBuds {
            frame: i,
            new_ids: new_ids.clone(),
            g1_available: g1.len(),
        };
        if !prompt.ask(&request).is_yes() {
            return Err(EngineError::Cancelled(format!(
                "{} new cells but only {} cells in G1 at frame {}",
                new_ids.len(),
                g1.len(),
                i
            )));
        }
    }

    let mut table: CcaTable = ids
        .iter()
        .map(|&id| (id, prev.get(&id).copied().unwrap_or_default()))
        .collect();
    for (mother, bud) in nearest_mothers(pos, i, &g1, &new_ids) {
        table.insert(bud, CcaRow::new_bud(mother, i, false));
        if let Some(m) = table.get_mut(&mother) {
            m.stage = CellCycleStage::S;
            m.relative_id = Some(bud);
            m.relationship = Relationship::Mother;
        }
        log::debug!("Frame {}: new cell {} assigned as bud of {}", i, bud, mother);
    }

    if let Some(slot) = pos.slot_mut(i) {
        slot.acdc.set_cca(Some(table));
    }
    pos.mark_modified(i);
    Ok(())
}

/// Pair new cells with G1 cells minimising the contour distance.
fn nearest_mothers(pos: &Position, i: usize, g1: &[CellId], new_ids: &[CellId]) -> Vec<(CellId, CellId)> {
    let Some(slot) = pos.slot(i) else {
        return Vec::new();
    };
    if g1.is_empty() || new_ids.is_empty() {
        return Vec::new();
    }
    let contour = |id: CellId| {
        let mask = projected_mask(&slot.labels, id);
        boundary_pixels(mask.view())
    };
    let g1_contours: Vec<_> = g1.iter().map(|&id| contour(id)).collect();
    let new_contours: Vec<_> = new_ids.iter().map(|&id| contour(id)).collect();
    let cost = Array2::from_shape_fn((g1.len(), new_ids.len()), |(r, c)| {
        min_distance(&g1_contours[r], &new_contours[c])
    });
    linear_sum_assignment(&cost)
        .into_iter()
        .map(|(r, c)| (g1[r], new_ids[c]))
        .collect()
}

/// Check the S-phase pairs of frame `i` against frame `i + 1`.
///
/// When one cell of a pair is missing at `i + 1`, the pair is annotated as
/// dividing at `i` and the operator is asked to confirm. Declining reverts
/// the annotation and returns `Cancelled`, so navigation should stop.
pub fn check_disappearing(pos: &mut Position, i: usize, prompt: &mut dyn OperatorPrompt) -> Result<()> {
    if i + 1 >= pos.size_t() || !has_cca(pos, i) {
        return Ok(());
    }
    let next_ids = frame_ids(pos, i + 1)?;
    let Some(cca) = pos.slot(i).and_then(|s| s.acdc.cca().cloned()) else {
        return Ok(());
    };

    let mut seen: BTreeSet<CellId> = BTreeSet::new();
    let mut rec = CcaRecorder::new(i, format!("divisions before frame {}", i + 1));
    for (&id, r) in &cca {
        if r.stage != CellCycleStage::S || r.relationship != Relationship::Mother || seen.contains(&id) {
            continue;
        }
        let Some(rel) = r.relative_id.filter(|rel| cca.contains_key(rel)) else {
            continue;
        };
        seen.insert(id);
        seen.insert(rel);
        if next_ids.contains(&id) == next_ids.contains(&rel) {
            continue;
        }
        if row(pos, i, id).is_some_and(|r| r.stage != CellCycleStage::S) {
            continue;
        }
        annotate_division_recorded(pos, &mut rec, i, id)?;
        let request = PromptRequest::ConfirmDivision {
            frame: i,
            pair: (id, rel),
        };
        if !prompt.ask(&request).is_yes() {
            rec.rollback(pos);
            return Err(EngineError::Cancelled(format!(
                "division of {} and {} at frame {} not confirmed",
                id, rel, i
            )));
        }
        log::info!("Division of {} and {} at frame {} confirmed", id, rel, i);
    }
    rec.commit(pos);
    Ok(())
}
