//! Persistent delete-ROIs.

use super::{EditContext, commit};
use crate::error::{EngineError, Result};
use crate::model::{DeleteRoi, IdChanges, RoiShape};
use crate::position::Position;

/// Add a delete-ROI to frame `i`. Returns its identifier.
pub fn add_delete_roi(pos: &mut Position, ctx: &mut EditContext<'_>, i: usize, shape: RoiShape) -> Result<u64> {
    let mut roi_id = 0;
    commit(pos, ctx, i, "add delete-ROI", |pos, work| {
        roi_id = pos.next_roi_id();
        let roi = DeleteRoi::new(roi_id, shape, &work.labels);
        log::debug!("Delete-ROI {} ({}) covers {:?}", roi_id, roi.shape().name(), roi.deleted_ids());
        work.delete_rois.push(roi);
        Ok(Some(IdChanges::none()))
    })?;
    Ok(roi_id)
}

/// Move or resize delete-ROI `roi_id` of frame `i`.
///
/// Objects it no longer covers come back unless another ROI covers them.
pub fn move_delete_roi(
    pos: &mut Position,
    ctx: &mut EditContext<'_>,
    i: usize,
    roi_id: u64,
    shape: RoiShape,
) -> Result<bool> {
    commit(pos, ctx, i, "move delete-ROI", |_, work| {
        let roi = work
            .delete_rois
            .iter_mut()
            .find(|r| r.id == roi_id)
            .ok_or_else(|| EngineError::invalid_input(format!("no delete-ROI {} at frame {}", roi_id, i)))?;
        roi.set_shape(shape, &work.labels);
        Ok(Some(IdChanges::none()))
    })
}

/// Remove delete-ROI `roi_id` from frame `i`.
pub fn remove_delete_roi(pos: &mut Position, ctx: &mut EditContext<'_>, i: usize, roi_id: u64) -> Result<bool> {
    commit(pos, ctx, i, "remove delete-ROI", |_, work| {
        let before = work.delete_rois.len();
        work.delete_rois.retain(|r| r.id != roi_id);
        Ok((work.delete_rois.len() != before).then(IdChanges::none))
    })
}
