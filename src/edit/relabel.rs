//! Sequential relabelling of a whole position.

use std::collections::{BTreeMap, BTreeSet};

use acdc_labels::CellId;
use acdc_labels::components::{apply_mapping, sequential_mapping};

use super::EditContext;
use crate::error::Result;
use crate::events::EngineEvent;
use crate::position::Position;

/// Renumber the objects of every frame to `1..=N` in ID order.
///
/// The mapping is shared by all frames so that tracked identities survive.
/// It is applied to visited slots, to the on-disk segmentation, to every
/// annotation table (including `relative_ID`), to the manual edit log and
/// to the pending keep-selection. Undo history is cleared. Returns the
/// old-to-new mapping of IDs that changed.
pub fn relabel_sequential(pos: &mut Position, ctx: &mut EditContext<'_>) -> Result<BTreeMap<CellId, CellId>> {
    pos.disk.load_all()?;
    let mut ids: BTreeSet<CellId> = BTreeSet::new();
    for i in pos.visited_frames() {
        if let Some(slot) = pos.slot(i) {
            ids.extend(slot.state.ids().iter().copied());
        }
    }
    for (_, labels) in pos.disk.loaded_mut() {
        ids.extend(labels.iter().copied().filter(|&v| v > 0));
    }

    let mut mapping = sequential_mapping(ids);
    mapping.retain(|old, new| old != new);
    if mapping.is_empty() {
        log::debug!("Relabel: IDs of '{}' are already sequential", pos.name());
        return Ok(mapping);
    }

    let spacing = pos.spacing();
    let is_3d = pos.is_3d();
    let mut touched: BTreeSet<usize> = BTreeSet::new();
    pos.for_all_visited(|i, slot| {
        apply_mapping(&mut slot.labels, &mapping);
        slot.acdc.apply_mapping(&mapping);
        slot.refresh(spacing, is_3d);
        touched.insert(i);
    });
    for (i, labels) in pos.disk.loaded_mut() {
        if labels.iter().any(|v| mapping.contains_key(v)) {
            apply_mapping(labels, &mapping);
            touched.insert(i);
        }
    }
    for (&i, table) in pos.disk_acdc.iter_mut() {
        if !table.apply_mapping(&mapping).is_empty() {
            log::warn!("Relabel dropped colliding rows of stored frame {}", i);
        }
    }
    pos.manual_edit_log.remap(&mapping);
    pos.kept_ids = pos
        .kept_ids
        .iter()
        .map(|id| mapping.get(id).copied().unwrap_or(*id))
        .collect();
    pos.undo.clear();

    for &i in &touched {
        pos.mark_modified(i);
        ctx.events.push(EngineEvent::FrameDirty {
            position: ctx.position,
            frame: i,
        });
    }
    log::info!("Relabelled '{}' sequentially: {:?}", pos.name(), mapping);
    ctx.events.push(EngineEvent::RelabelMapping {
        position: ctx.position,
        mapping: mapping.clone(),
    });
    Ok(mapping)
}
