//! Position store.
//!
//! A [`Position`] owns everything loaded for one field of view: metadata,
//! channel stacks, the on-disk segmentation, and one [`FrameSlot`] per frame
//! the operator has visited. Slots are created lazily on first visit from
//! the on-disk segmentation (or zeros) and are the only place edits happen.

mod disk;
mod layout;

pub use disk::DiskSegmentation;
pub use layout::PositionLayout;

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use acdc_labels::{CellId, Labels, PhysicalSize};

use crate::error::{EngineError, Result};
use crate::frame_state::FrameState;
use crate::io::custom_annot::{self, CustomAnnotation};
use crate::io::images::{ChannelLoaderRegistry, ChannelStack, StackDims};
use crate::io::metadata::PositionMetadata;
use crate::io::npz::read_frame_archive;
use crate::io::segm_info::SegmInfo;
use crate::io::table::read_table;
use crate::io::{IoError, IoResult};
use crate::model::{AcdcTable, DeleteRoi, ManualEdit, ManualEditLog, ReconcileReport, export_labels};
use crate::undo::{FrameSnapshot, UndoLog};

// ============================================================================
// Frame Slot
// ============================================================================

/// State of one visited frame.
#[derive(Debug, Clone)]
pub struct FrameSlot {
    /// Label image `(Z, Y, X)`
    pub labels: Labels,
    /// Region properties of `labels`
    pub state: FrameState,
    /// Annotation table
    pub acdc: AcdcTable,
    /// Persistent delete-ROIs
    pub delete_rois: Vec<DeleteRoi>,
}

impl FrameSlot {
    /// Build a slot, repairing the table against the labels.
    pub fn new(labels: Labels, acdc: AcdcTable, spacing: PhysicalSize, is_3d: bool) -> (Self, ReconcileReport) {
        let state = FrameState::update(&labels, spacing, is_3d);
        let mut slot = Self {
            labels,
            state,
            acdc,
            delete_rois: Vec::new(),
        };
        let report = slot.acdc.repair(&slot.state, is_3d);
        (slot, report)
    }

    /// Recompute region properties and re-intersect the delete-ROIs.
    pub fn refresh(&mut self, spacing: PhysicalSize, is_3d: bool) {
        self.state = FrameState::update(&self.labels, spacing, is_3d);
        for roi in &mut self.delete_rois {
            roi.intersect(&self.labels);
        }
    }

    /// IDs currently removed by delete-ROIs.
    pub fn roi_deleted_ids(&self) -> BTreeSet<CellId> {
        crate::model::deleted_by(&self.delete_rois)
    }

    /// Labels as they are saved: ROI-deleted objects removed.
    pub fn exported_labels(&self) -> Labels {
        export_labels(&self.labels, &self.delete_rois)
    }

    /// Annotation table as it is saved: rows of ROI-deleted objects removed.
    pub fn exported_acdc(&self) -> AcdcTable {
        let deleted = self.roi_deleted_ids();
        let mut acdc = self.acdc.clone();
        for id in deleted {
            acdc.remove(id);
        }
        acdc
    }
}

/// Where [`Position::get_labels`] reads a frame from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelSource {
    /// The visited slot
    Stored,
    /// The on-disk segmentation (zeros when absent)
    Disk,
    /// A blank frame
    Zeros,
}

// ============================================================================
// Position
// ============================================================================

/// One loaded field of view.
pub struct Position {
    /// Dimensions, calibration and channels
    pub meta: PositionMetadata,
    /// File names on disk
    pub layout: PositionLayout,
    /// Published segmentation, decoded lazily
    pub disk: DiskSegmentation,
    /// Published annotation rows per frame
    pub disk_acdc: BTreeMap<usize, AcdcTable>,
    /// Manual ID reassignments re-applied after tracking
    pub manual_edit_log: ManualEditLog,
    /// Registered custom annotations
    pub custom_annotations: Vec<CustomAnnotation>,
    /// Z-slice choices per channel and frame
    pub segm_info: SegmInfo,
    /// Undo history
    pub undo: UndoLog,
    /// IDs of a pending keep-selection
    pub kept_ids: BTreeSet<CellId>,
    frames: Vec<Option<FrameSlot>>,
    channels: BTreeMap<String, ChannelStack>,
    loaders: ChannelLoaderRegistry,
    brush_id: CellId,
    last_tracked_frame: Option<usize>,
    next_roi_id: u64,
    modified: BTreeSet<usize>,
    autosave_dirty: BTreeSet<usize>,
    recovery_available: bool,
}

impl Position {
    /// Empty position (no segmentation on disk).
    pub fn new(meta: PositionMetadata, layout: PositionLayout) -> Self {
        let size_t = meta.size_t.max(1);
        Self {
            disk: DiskSegmentation::empty(size_t),
            disk_acdc: BTreeMap::new(),
            manual_edit_log: ManualEditLog::new(),
            custom_annotations: Vec::new(),
            segm_info: SegmInfo::new(),
            undo: UndoLog::default(),
            kept_ids: BTreeSet::new(),
            frames: (0..size_t).map(|_| None).collect(),
            channels: BTreeMap::new(),
            loaders: ChannelLoaderRegistry::new(),
            brush_id: 1,
            last_tracked_frame: None,
            next_roi_id: 1,
            modified: BTreeSet::new(),
            autosave_dirty: BTreeSet::new(),
            recovery_available: false,
            meta,
            layout,
        }
    }

    /// Position whose on-disk segmentation is already in memory.
    pub fn from_frames(meta: PositionMetadata, layout: PositionLayout, frames: Vec<Labels>) -> Self {
        let mut position = Self::new(meta, layout);
        position.disk = DiskSegmentation::from_frames(frames);
        position.after_disk_loaded();
        position
    }

    /// Open a position directory.
    ///
    /// The segmentation is decoded in the background; only its header is
    /// awaited here. The user channel is loaded eagerly, other channels on
    /// first use.
    pub fn open(dir: &Path, endname: Option<&str>, chunk_size: usize) -> Result<Self> {
        let layout = PositionLayout::discover(dir, endname)?;
        let meta = PositionMetadata::load(&layout.metadata_path())?;
        log::info!(
            "Opening position '{}' (SizeT = {}, 3D = {}, endname = '{}')",
            layout.position_name(),
            meta.size_t,
            meta.is_segm_3d,
            layout.endname
        );
        let mut position = Self::new(meta, layout);

        let segm_path = position.layout.segm_path();
        if segm_path.exists() {
            position.disk = DiskSegmentation::spawn(
                segm_path,
                position.meta.is_segm_3d,
                position.meta.size_t,
                chunk_size,
            )?;
        } else {
            log::info!("No segmentation on disk, frames start empty");
        }

        position.custom_annotations = custom_annot::load(&position.layout.custom_annotations_path())?;
        let table_path = position.layout.acdc_output_path();
        if table_path.exists() {
            position.disk_acdc = read_table(&table_path, &position.custom_annotation_names())?;
        }
        let segm_info_path = position.layout.segm_info_path();
        if segm_info_path.exists() {
            position.segm_info = SegmInfo::load(&segm_info_path)?;
        }
        position.after_disk_loaded();
        position.recovery_available = position.layout.has_newer_recovery();
        if position.recovery_available {
            log::info!("Recovery data newer than the saved files found");
        }

        let user_channel = position.meta.user_channel.clone();
        if let Err(e) = position.channel(&user_channel) {
            log::warn!("User channel '{}' not loaded: {}", user_channel, e);
        }
        Ok(position)
    }

    /// Rescan the loaded data for the brush ID and the tracked range.
    fn after_disk_loaded(&mut self) {
        let table_max = self
            .disk_acdc
            .values()
            .flat_map(|t| t.ids())
            .max()
            .unwrap_or(0);
        let max_id = self
            .disk
            .max_id()
            .max(table_max)
            .max(self.manual_edit_log.max_id());
        self.brush_id = self.brush_id.max(max_id + 1);
        self.last_tracked_frame = self.disk.last_nonempty();
        log::debug!(
            "brushID = {}, last tracked frame = {:?}",
            self.brush_id,
            self.last_tracked_frame
        );
    }

    // ------------------------------------------------------------------------
    // Dimensions
    // ------------------------------------------------------------------------

    /// Number of frames.
    pub fn size_t(&self) -> usize {
        self.frames.len()
    }

    /// Whether labels are 3D per frame.
    pub fn is_3d(&self) -> bool {
        self.meta.is_segm_3d
    }

    /// Pixel calibration.
    pub fn spacing(&self) -> PhysicalSize {
        self.meta.physical_size
    }

    /// Shape of one frame `(Z, Y, X)`.
    pub fn frame_shape(&self) -> (usize, usize, usize) {
        self.meta.frame_shape()
    }

    /// Display name.
    pub fn name(&self) -> String {
        self.layout.position_name()
    }

    /// Names of the registered custom annotations.
    pub fn custom_annotation_names(&self) -> Vec<String> {
        self.custom_annotations.iter().map(|a| a.name.clone()).collect()
    }

    /// Refuse frame indices outside `0..SizeT`.
    pub fn check_frame(&self, i: usize) -> Result<()> {
        if i < self.size_t() {
            Ok(())
        } else {
            Err(EngineError::FrameOutOfRange {
                frame: i,
                size_t: self.size_t(),
            })
        }
    }

    // ------------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------------

    /// Labels of frame `i`.
    ///
    /// Stored and disk labels are borrowed; callers that need a snapshot
    /// call `into_owned`.
    pub fn get_labels(&mut self, i: usize, source: LabelSource) -> Result<Cow<'_, Labels>> {
        self.check_frame(i)?;
        let shape = self.frame_shape();
        match source {
            LabelSource::Stored => self.frames[i]
                .as_ref()
                .map(|slot| Cow::Borrowed(&slot.labels))
                .ok_or_else(|| EngineError::invalid_input(format!("frame {} has not been visited", i))),
            LabelSource::Disk => Ok(match self.disk.get(i)? {
                Some(labels) => Cow::Borrowed(labels),
                None => Cow::Owned(Labels::zeros(shape)),
            }),
            LabelSource::Zeros => Ok(Cow::Owned(Labels::zeros(shape))),
        }
    }

    /// Slot of a visited frame.
    pub fn slot(&self, i: usize) -> Option<&FrameSlot> {
        self.frames.get(i).and_then(Option::as_ref)
    }

    /// Mutable slot of a visited frame.
    pub fn slot_mut(&mut self, i: usize) -> Option<&mut FrameSlot> {
        self.frames.get_mut(i).and_then(Option::as_mut)
    }

    /// Slot of frame `i`, created from disk (or zeros) on first visit.
    ///
    /// A stored table that disagrees with its labels is repaired and the
    /// repair is logged.
    pub fn ensure_slot(&mut self, i: usize) -> Result<&mut FrameSlot> {
        self.check_frame(i)?;
        if self.frames[i].is_none() {
            let labels = self.get_labels(i, LabelSource::Disk)?.into_owned();
            let acdc = self.disk_acdc.get(&i).cloned().unwrap_or_default();
            let (slot, report) = FrameSlot::new(labels, acdc, self.spacing(), self.is_3d());
            if !report.is_clean() && self.disk_acdc.contains_key(&i) {
                log::info!(
                    "Repaired annotations of frame {}: dropped {:?}, added {:?}",
                    i,
                    report.dropped,
                    report.added
                );
            }
            self.bump_brush_id(slot.state.max_id());
            log::debug!("Frame {} visited for the first time ({} objects)", i, slot.state.len());
            self.frames[i] = Some(slot);
        }
        self.frames[i]
            .as_mut()
            .ok_or_else(|| EngineError::corrupted(i, "frame slot vanished"))
    }

    /// Store the state of frame `i`.
    pub fn store_frame(&mut self, i: usize, slot: FrameSlot) -> Result<()> {
        self.check_frame(i)?;
        self.bump_brush_id(slot.state.max_id());
        self.frames[i] = Some(slot);
        self.mark_modified(i);
        Ok(())
    }

    /// Forget the slot of frame `i`; the next visit rebuilds it.
    pub fn clear_slot(&mut self, i: usize) -> Option<FrameSlot> {
        let slot = self.frames.get_mut(i)?.take();
        if slot.is_some() {
            self.undo.forget_frame(i);
            log::debug!("Frame {} marked as unvisited", i);
        }
        slot
    }

    /// Whether frame `i` has a slot.
    pub fn is_visited(&self, i: usize) -> bool {
        self.slot(i).is_some()
    }

    /// Whether frame `i` counts as visited for the smart tracking toggle:
    /// it has a slot or was already segmented on disk at load time.
    pub fn visited_for_tracking(&self, i: usize) -> bool {
        self.is_visited(i) || self.last_tracked_frame.is_some_and(|last| i <= last)
    }

    /// Indices of every visited frame.
    pub fn visited_frames(&self) -> Vec<usize> {
        self.frames
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| i))
            .collect()
    }

    /// Largest visited frame.
    pub fn last_visited(&self) -> Option<usize> {
        self.frames.iter().rposition(Option::is_some)
    }

    /// Largest frame with objects on disk at load time.
    pub fn last_tracked_frame(&self) -> Option<usize> {
        self.last_tracked_frame
    }

    /// Call `f` on every visited slot in frame order.
    pub fn for_all_visited<F>(&mut self, mut f: F)
    where
        F: FnMut(usize, &mut FrameSlot),
    {
        for (i, slot) in self.frames.iter_mut().enumerate() {
            if let Some(slot) = slot {
                f(i, slot);
            }
        }
    }

    /// Frames changed since the last save.
    pub fn modified_frames(&self) -> &BTreeSet<usize> {
        &self.modified
    }

    /// Mark frame `i` as changed.
    pub fn mark_modified(&mut self, i: usize) {
        self.modified.insert(i);
        self.autosave_dirty.insert(i);
    }

    /// Frames changed since the previous call, for the next autosave snapshot.
    pub fn take_autosave_dirty(&mut self) -> BTreeSet<usize> {
        std::mem::take(&mut self.autosave_dirty)
    }

    /// Forget the change marks (after a save).
    pub fn clear_modified(&mut self) {
        self.modified.clear();
        self.autosave_dirty.clear();
        self.disk.clear_dirty();
    }

    // ------------------------------------------------------------------------
    // IDs
    // ------------------------------------------------------------------------

    /// The next unused ID.
    pub fn brush_id(&self) -> CellId {
        self.brush_id
    }

    /// Take the next unused ID.
    pub fn next_brush_id(&mut self) -> CellId {
        let id = self.brush_id;
        self.brush_id += 1;
        id
    }

    /// Keep the brush ID above `id`.
    pub fn bump_brush_id(&mut self, id: CellId) {
        if id >= self.brush_id {
            self.brush_id = id + 1;
        }
    }

    /// Append to the manual edit log.
    pub fn push_manual_edit(&mut self, entry: ManualEdit) {
        self.bump_brush_id(entry.new_id);
        self.manual_edit_log.push(entry);
    }

    /// New delete-ROI identifier.
    pub fn next_roi_id(&mut self) -> u64 {
        let id = self.next_roi_id;
        self.next_roi_id += 1;
        id
    }

    // ------------------------------------------------------------------------
    // Snapshots and repair
    // ------------------------------------------------------------------------

    /// Deep copy of the state of frame `i`.
    pub fn snapshot(&self, i: usize, description: impl Into<String>) -> Result<FrameSnapshot> {
        let slot = self
            .slot(i)
            .ok_or_else(|| EngineError::invalid_input(format!("frame {} has not been visited", i)))?;
        Ok(FrameSnapshot {
            labels: slot.labels.clone(),
            acdc: slot.acdc.clone(),
            manual_edit_log: self.manual_edit_log.clone(),
            kept_ids: self.kept_ids.clone(),
            delete_rois: slot.delete_rois.clone(),
            description: description.into(),
        })
    }

    /// Put a snapshot back into frame `i`.
    pub fn restore(&mut self, i: usize, snapshot: FrameSnapshot) -> Result<()> {
        let spacing = self.spacing();
        let is_3d = self.is_3d();
        let slot = self.ensure_slot(i)?;
        slot.labels = snapshot.labels;
        slot.acdc = snapshot.acdc;
        slot.delete_rois = snapshot.delete_rois;
        slot.refresh(spacing, is_3d);
        self.manual_edit_log = snapshot.manual_edit_log;
        self.kept_ids = snapshot.kept_ids;
        self.mark_modified(i);
        Ok(())
    }

    /// Drop orphan rows and add missing ones at frame `i`.
    pub fn repair_frame(&mut self, i: usize) -> Result<ReconcileReport> {
        let is_3d = self.is_3d();
        let slot = self.ensure_slot(i)?;
        let report = slot.acdc.repair(&slot.state, is_3d);
        if !report.is_clean() {
            log::info!(
                "Repaired annotations of frame {}: dropped {:?}, added {:?}",
                i,
                report.dropped,
                report.added
            );
            self.mark_modified(i);
        }
        Ok(report)
    }

    /// Check that rows and objects of frame `i` agree.
    pub fn check_frame_consistency(&self, i: usize) -> Result<()> {
        let Some(slot) = self.slot(i) else {
            return Ok(());
        };
        slot.acdc
            .check(&slot.state)
            .map_err(|message| EngineError::corrupted(i, message))
    }

    // ------------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------------

    /// Channel stack `(T, Z, Y, X)`, loaded on first use.
    pub fn channel(&mut self, name: &str) -> IoResult<&ChannelStack> {
        if !self.channels.contains_key(name) {
            let images = self.layout.images_dir();
            let path = self
                .loaders
                .find_channel_file(&images, &self.layout.basename, name)
                .ok_or_else(|| IoError::MissingFile(images.join(format!("{}_{}", self.layout.basename, name))))?;
            let dims = StackDims {
                size_t: self.meta.size_t,
                size_z: self.meta.size_z,
            };
            let stack = self.loaders.load(&path, dims)?;
            log::info!("Loaded channel '{}' {:?}", name, stack.dim());
            self.channels.insert(name.to_string(), stack);
        }
        self.channels
            .get(name)
            .ok_or_else(|| IoError::invalid_format(name, "channel not loaded"))
    }

    /// Insert an in-memory channel stack (tests and headless use).
    pub fn insert_channel(&mut self, name: impl Into<String>, stack: ChannelStack) {
        self.channels.insert(name.into(), stack);
    }

    // ------------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------------

    /// Whether autosave data newer than the saved files was found on open.
    pub fn recovery_available(&self) -> bool {
        self.recovery_available
    }

    /// Overlay the autosaved frames on the published data.
    ///
    /// Returns the recovered frame indices.
    pub fn apply_recovery(&mut self) -> Result<Vec<usize>> {
        let segm_path = self.layout.recovery_segm_path();
        let frames = read_frame_archive(&segm_path)?;
        let table_path = self.layout.recovery_table_path();
        let tables = if table_path.exists() {
            read_table(&table_path, &self.custom_annotation_names())?
        } else {
            BTreeMap::new()
        };

        let mut recovered = Vec::new();
        for (i, labels) in frames {
            if i >= self.size_t() {
                log::warn!("Ignoring recovered frame {} beyond SizeT", i);
                continue;
            }
            self.bump_brush_id(acdc_labels::max_id(&labels));
            self.disk.set(i, labels)?;
            match tables.get(&i) {
                Some(table) => {
                    self.disk_acdc.insert(i, table.clone());
                }
                None => {
                    self.disk_acdc.remove(&i);
                }
            }
            self.clear_slot(i);
            self.mark_modified(i);
            recovered.push(i);
        }
        self.recovery_available = false;
        self.last_tracked_frame = self.last_tracked_frame.max(recovered.last().copied());
        log::info!("Recovered {} frames of '{}'", recovered.len(), self.name());
        Ok(recovered)
    }

    /// Forget the recovery data without applying it.
    pub fn discard_recovery(&mut self) {
        self.recovery_available = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CcaRow, ObjectRow};

    fn meta(size_t: usize) -> PositionMetadata {
        PositionMetadata::new_2d(size_t, 6, 6, "phase")
    }

    fn frame_with(ids: &[(CellId, usize, usize)]) -> Labels {
        let mut labels = Labels::zeros((1, 6, 6));
        for &(id, y, x) in ids {
            labels[[0, y, x]] = id;
        }
        labels
    }

    fn position(frames: Vec<Labels>) -> Position {
        let n = frames.len();
        Position::from_frames(meta(n), PositionLayout::new("/tmp/none", "pos", ""), frames)
    }

    #[test]
    fn test_brush_id_from_disk() {
        let pos = position(vec![frame_with(&[(4, 1, 1)]), frame_with(&[(9, 2, 2)])]);
        assert_eq!(pos.brush_id(), 10);
        assert_eq!(pos.last_tracked_frame(), Some(1));
        assert!(pos.visited_for_tracking(1));
        assert!(!pos.is_visited(1));
    }

    #[test]
    fn test_first_visit_repairs_table() {
        let mut pos = position(vec![frame_with(&[(1, 1, 1), (2, 4, 4)])]);
        let mut rows = BTreeMap::new();
        rows.insert(1, ObjectRow::default());
        rows.insert(7, ObjectRow::default());
        pos.disk_acdc.insert(0, AcdcTable::from_parts(rows, None));

        let slot = pos.ensure_slot(0).unwrap();
        assert_eq!(slot.acdc.ids().collect::<Vec<_>>(), vec![1, 2]);
        assert!(pos.check_frame_consistency(0).is_ok());
    }

    #[test]
    fn test_get_labels_sources() {
        let mut pos = position(vec![frame_with(&[(3, 0, 0)])]);
        assert!(pos.get_labels(0, LabelSource::Stored).is_err());
        assert_eq!(pos.get_labels(0, LabelSource::Disk).unwrap()[[0, 0, 0]], 3);
        assert_eq!(pos.get_labels(0, LabelSource::Zeros).unwrap()[[0, 0, 0]], 0);
        pos.ensure_slot(0).unwrap();
        assert_eq!(pos.get_labels(0, LabelSource::Stored).unwrap()[[0, 0, 0]], 3);
        assert!(matches!(
            pos.get_labels(5, LabelSource::Zeros),
            Err(EngineError::FrameOutOfRange { frame: 5, size_t: 1 })
        ));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut pos = position(vec![frame_with(&[(1, 1, 1)])]);
        pos.ensure_slot(0).unwrap();
        let before = pos.snapshot(0, "test").unwrap();
        let slot = pos.slot_mut(0).unwrap();
        slot.labels[[0, 1, 1]] = 0;
        pos.restore(0, before.clone()).unwrap();
        let slot = pos.slot(0).unwrap();
        assert_eq!(slot.labels, before.labels);
        assert_eq!(slot.state.ids(), &[1]);
    }

    #[test]
    fn test_exported_acdc_drops_roi_ids() {
        use acdc_labels::raster::Point;
        use crate::model::RoiShape;

        let mut pos = position(vec![frame_with(&[(1, 1, 1), (2, 4, 4)])]);
        let slot = pos.ensure_slot(0).unwrap();
        slot.acdc.init_cca();
        let roi = DeleteRoi::new(
            1,
            RoiShape::Rect {
                a: Point::new(0.0, 0.0),
                b: Point::new(2.0, 2.0),
            },
            &slot.labels,
        );
        slot.delete_rois.push(roi);
        let exported = slot.exported_acdc();
        assert_eq!(exported.ids().collect::<Vec<_>>(), vec![2]);
        assert_eq!(exported.cca_row(2), Some(&CcaRow::default()));
        assert_eq!(slot.exported_labels()[[0, 1, 1]], 0);
    }

    #[test]
    fn test_clear_slot_and_last_visited() {
        let mut pos = position(vec![Labels::zeros((1, 6, 6)); 4]);
        pos.ensure_slot(0).unwrap();
        pos.ensure_slot(2).unwrap();
        assert_eq!(pos.visited_frames(), vec![0, 2]);
        assert_eq!(pos.last_visited(), Some(2));
        pos.clear_slot(2);
        assert_eq!(pos.last_visited(), Some(0));
    }
}
