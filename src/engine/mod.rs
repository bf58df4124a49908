//! The frame-state engine.
//!
//! [`Engine`] owns the loaded positions, the operating mode, the current
//! frame and the background workers. Every operator action goes through it:
//! it checks the mode, the error state and the save lock, runs the edit
//! operation, hands changes to the autosave worker and keeps the events
//! queue for the caller to drain.

mod mode;
mod persist;

pub use mode::Mode;
pub use persist::SaveStatus;

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use acdc_labels::raster::Point;
use acdc_labels::{CellId, Labels};
use ndarray::{Array2, Axis};

use crate::cca;
use crate::config::ConfigStore;
use crate::edit::{self, BrushStroke, EditContext, EraserStroke};
use crate::error::{CrashReport, EngineError, Result};
use crate::events::{EngineEvent, EventQueue};
use crate::io::custom_annot::CustomAnnotation;
use crate::io::segm_info::{ZProjection, ZSliceChoice};
use crate::measure::{CustomMetric, MeasurementSchema, project};
use crate::model::{ReconcileReport, RoiShape};
use crate::position::{FrameSlot, Position};
use crate::prompt::OperatorPrompt;
use crate::propagate::{PropagatedOp, PropagationPolicy, PropagationReport, propagate};
use crate::tracking::{Tracker, TrackerRegistry, TrackingToggle};
use crate::undo::UndoLog;
use crate::workers::{AutosaveWorker, Region, SegmentationMessage, SegmentationModel, SegmentationTask, SegmentationWorker, SaveWorker};

/// Interactive editing session over one or more positions.
pub struct Engine {
    positions: Vec<Position>,
    position: usize,
    frame: usize,
    mode: Mode,
    config: ConfigStore,
    trackers: TrackerRegistry,
    toggle: TrackingToggle,
    /// Whether edits on the current frame are tracked
    tracking_active: bool,
    events: EventQueue,
    prompt: Box<dyn OperatorPrompt>,
    error: Option<CrashReport>,
    session_log: Option<PathBuf>,
    autosave: Option<AutosaveWorker>,
    save: Option<SaveWorker>,
    save_lock: Option<(usize, RangeInclusive<usize>)>,
    published: Option<persist::Published>,
    save_measurements: Option<bool>,
    schema: Option<MeasurementSchema>,
    custom_metrics: Vec<Arc<dyn CustomMetric>>,
    segmentation: Option<SegmentationWorker>,
    last_commit: Option<(usize, usize)>,
}

impl Engine {
    /// Start a session on already opened positions.
    ///
    /// Positions with newer recovery data ask the operator whether to
    /// recover it.
    pub fn new(positions: Vec<Position>, config: ConfigStore, prompt: Box<dyn OperatorPrompt>) -> Result<Self> {
        if positions.is_empty() {
            return Err(EngineError::invalid_input("no position to load"));
        }
        let settings = config.get().clone();
        let autosave = if settings.autosave.enabled {
            Some(AutosaveWorker::spawn(Duration::from_millis(settings.autosave.debounce_ms))?)
        } else {
            None
        };
        let mode = if positions[0].size_t() <= 1 {
            Mode::Snapshot
        } else {
            Mode::Viewer
        };
        let mut engine = Self {
            positions,
            position: 0,
            frame: 0,
            mode,
            config,
            trackers: TrackerRegistry::new(settings.overlap_threshold),
            toggle: TrackingToggle::default(),
            tracking_active: false,
            events: EventQueue::new(),
            prompt,
            error: None,
            session_log: None,
            autosave,
            save: None,
            save_lock: None,
            published: None,
            save_measurements: None,
            schema: None,
            custom_metrics: Vec::new(),
            segmentation: None,
            last_commit: None,
        };
        for p in 0..engine.positions.len() {
            engine.positions[p].undo = UndoLog::new(settings.undo_depth);
            engine.offer_recovery(p)?;
        }
        engine.positions[0].ensure_slot(0)?;
        log::info!(
            "Engine started with {} position(s) in {} mode",
            engine.positions.len(),
            engine.mode.name()
        );
        Ok(engine)
    }

    /// Open one position directory and start a session on it.
    pub fn open(dir: &Path, endname: Option<&str>, config: ConfigStore, prompt: Box<dyn OperatorPrompt>) -> Result<Self> {
        let position = Position::open(dir, endname, config.get().chunk_size)?;
        Self::new(vec![position], config, prompt)
    }

    /// Log file shown to the operator after a critical failure.
    pub fn with_session_log(mut self, path: Option<PathBuf>) -> Self {
        self.session_log = path;
        self
    }

    /// Add a tracker plug-in.
    pub fn register_tracker(&mut self, tracker: Box<dyn Tracker>) {
        self.trackers.register(tracker);
    }

    /// Add a custom metric plug-in used by every later save.
    pub fn register_custom_metric(&mut self, metric: Arc<dyn CustomMetric>) {
        self.custom_metrics.push(metric);
    }

    /// Columns computed when saving measurements.
    pub fn set_measurement_schema(&mut self, schema: MeasurementSchema) {
        self.schema = Some(schema);
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Active mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Index of the current frame.
    pub fn current_frame(&self) -> usize {
        self.frame
    }

    /// Index of the current position.
    pub fn current_position(&self) -> usize {
        self.position
    }

    /// The current position.
    pub fn position(&self) -> &Position {
        &self.positions[self.position]
    }

    /// All loaded positions.
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// Slot of the current frame.
    pub fn slot(&self) -> Option<&FrameSlot> {
        self.position().slot(self.frame)
    }

    /// Settings of the session.
    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// Mutable settings; written back on the next flush.
    pub fn config_mut(&mut self) -> &mut ConfigStore {
        &mut self.config
    }

    /// Take the pending events.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        self.events.drain()
    }

    /// Whether a worker failure is waiting to be acknowledged.
    pub fn is_error_state(&self) -> bool {
        self.error.is_some()
    }

    /// Whether edits on the current frame are tracked.
    pub fn tracking_enabled(&self) -> bool {
        self.mode == Mode::SegmentationTracking && self.tracking_active
    }

    /// Clear the error state, returning what happened.
    pub fn acknowledge_error(&mut self) -> Option<CrashReport> {
        let report = self.error.take();
        if let Some(report) = &report {
            log::info!("Error acknowledged: {}", report.message);
        }
        report
    }

    fn pos_mut(&mut self) -> Result<&mut Position> {
        let position = self.position;
        self.positions
            .get_mut(position)
            .ok_or(EngineError::UnknownPosition(position))
    }

    // ========================================================================
    // Guards
    // ========================================================================

    fn check_not_in_error(&self) -> Result<()> {
        match &self.error {
            Some(report) => Err(EngineError::ErrorState(report.message.clone())),
            None => Ok(()),
        }
    }

    fn check_save_lock(&self, position: usize, first: usize, last: usize) -> Result<()> {
        if let Some((locked, range)) = &self.save_lock {
            if *locked == position && first <= *range.end() && last >= *range.start() {
                return Err(EngineError::PermissionDenied {
                    frame: first.max(*range.start()),
                });
            }
        }
        Ok(())
    }

    /// Refuse a label edit of frames `first..=last` of the current position.
    fn check_label_edit(&self, operation: &str, first: usize, last: usize) -> Result<()> {
        self.check_not_in_error()?;
        if !self.mode.allows_label_edits() {
            return Err(EngineError::wrong_mode(operation, self.mode.name()));
        }
        self.check_save_lock(self.position, first, last)
    }

    fn check_mode(&self, operation: &str, mode: Mode) -> Result<()> {
        self.check_not_in_error()?;
        if self.mode != mode {
            return Err(EngineError::wrong_mode(operation, self.mode.name()));
        }
        Ok(())
    }

    // ========================================================================
    // Worker failures
    // ========================================================================

    /// Enter error state after a worker failure.
    ///
    /// With `rollback` the last committed edit is undone since it could not
    /// be persisted.
    fn raise_critical(&mut self, worker: &'static str, message: String, rollback: bool) -> EngineError {
        let err = EngineError::worker_critical(worker, message);
        log::error!("{}", err);
        if rollback {
            if let Some((p, i)) = self.last_commit.take() {
                if let Some(pos) = self.positions.get_mut(p) {
                    match edit::undo_frame(pos, i) {
                        Ok(true) => log::warn!("Rolled back the last edit of frame {}", i),
                        Ok(false) => {}
                        Err(e) => log::error!("Rolling back frame {} failed: {}", i, e),
                    }
                }
            }
        }
        let report = CrashReport {
            message: err.to_string(),
            session_log: self.session_log.clone(),
        };
        self.events.push(EngineEvent::WorkerError {
            message: report.message.clone(),
            session_log: report.session_log.clone(),
        });
        self.error = Some(report);
        err
    }

    /// Service the background workers: autosave reports, segmentation
    /// results and a running save.
    pub fn poll(&mut self) -> Result<Option<SaveStatus>> {
        let failures: Vec<String> = self
            .autosave
            .as_ref()
            .map(|a| a.reports())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|r| r.result.err())
            .collect();
        for message in failures {
            self.raise_critical("autosave", message, true);
        }

        let messages: Vec<SegmentationMessage> = self
            .segmentation
            .as_ref()
            .map(|w| std::iter::from_fn(|| w.try_recv()).collect())
            .unwrap_or_default();
        for message in messages {
            match message {
                SegmentationMessage::Done(result) => {
                    let frame = result.frame;
                    match self.integrate_segmentation(&result) {
                        Ok(ids) => self
                            .events
                            .status(format!("Segmentation added {} objects to frame {}", ids.len(), frame)),
                        Err(e) => {
                            log::warn!("Segmentation of frame {} not applied: {}", frame, e);
                            self.events.status(e.to_string());
                        }
                    }
                }
                SegmentationMessage::Cancelled { frame } => {
                    self.events.status(format!("Segmentation of frame {} cancelled", frame));
                }
                SegmentationMessage::Error { frame, message } => {
                    self.raise_critical("segmentation", format!("frame {}: {}", frame, message), false);
                }
            }
        }
        self.poll_save()
    }

    // ========================================================================
    // Modes and navigation
    // ========================================================================

    /// Switch mode.
    ///
    /// Entering cell-cycle mode moves to the first frame without cell-cycle
    /// annotations (up to the current one) and initialises it.
    pub fn set_mode(&mut self, mode: Mode) -> Result<()> {
        self.check_not_in_error()?;
        let size_t = self.position().size_t();
        if !mode.available_for(size_t) {
            return Err(EngineError::invalid_input(format!(
                "{} mode is not available for a position with {} frame(s)",
                mode.name(),
                size_t
            )));
        }
        if mode == Mode::CellCycle {
            let frame = self.frame;
            let pos = &mut self.positions[self.position];
            if let Some(start) = cca::first_frame_without_cca(pos, frame) {
                cca::init_frame(pos, start, self.prompt.as_mut())?;
                if start < frame {
                    log::info!("Cell-cycle annotation continues at frame {}", start);
                }
                self.frame = start;
                self.schedule_autosave(self.position);
            }
        }
        self.mode = mode;
        log::info!("Mode: {}", mode.name());
        self.events.status(format!("{} mode", mode.name()));
        Ok(())
    }

    /// Pin real-time tracking on or off (`None` restores the automatic choice).
    pub fn set_tracking(&mut self, choice: Option<bool>) {
        self.toggle.set(choice);
        let visited = self.position().visited_for_tracking(self.frame);
        self.tracking_active = self.toggle.enabled(visited);
    }

    /// Go to the next frame.
    pub fn next_frame(&mut self) -> Result<()> {
        self.go_to_frame(self.frame + 1)
    }

    /// Go to the previous frame.
    pub fn prev_frame(&mut self) -> Result<()> {
        match self.frame.checked_sub(1) {
            Some(target) => self.go_to_frame(target),
            None => {
                self.events.status("Already at the first frame");
                Ok(())
            }
        }
    }

    /// Go to frame `target`.
    ///
    /// In cell-cycle mode moving forward visits every frame in between:
    /// disappearing S-phase cells are checked on the frame being left and
    /// the cell-cycle columns of the new frame are initialised. A declined
    /// confirmation stops on the last frame reached.
    pub fn go_to_frame(&mut self, target: usize) -> Result<()> {
        self.check_not_in_error()?;
        self.position().check_frame(target)?;
        if self.mode == Mode::CellCycle && target > self.frame {
            for j in self.frame + 1..=target {
                let position = self.position;
                let pos = &mut self.positions[position];
                cca::check_disappearing(pos, j - 1, self.prompt.as_mut())?;
                self.visit(j)?;
                let pos = &mut self.positions[position];
                cca::init_frame(pos, j, self.prompt.as_mut())?;
                self.frame = j;
                self.schedule_autosave(position);
            }
        } else {
            self.visit(target)?;
            self.frame = target;
        }
        log::debug!("Frame {}", self.frame);
        Ok(())
    }

    /// Create the slot of frame `j` if needed and apply the tracking toggle.
    fn visit(&mut self, j: usize) -> Result<()> {
        let position = self.position;
        let locked = self.check_save_lock(position, j, j).is_err();
        let pos = self
            .positions
            .get_mut(position)
            .ok_or(EngineError::UnknownPosition(position))?;
        let visited = pos.visited_for_tracking(j);
        let first_visit = !pos.is_visited(j);
        pos.ensure_slot(j)?;
        self.tracking_active = self.toggle.enabled(visited);

        if first_visit && j > 0 && self.tracking_active && self.mode == Mode::SegmentationTracking {
            if locked {
                self.events.status(format!("Frame {} is being saved, not tracked", j));
                return Ok(());
            }
            let tracker = self.trackers.get(&self.config.get().tracker);
            let mut ctx = EditContext::new(position, &mut self.events).with_tracker(tracker);
            if edit::repeat_tracking(pos, &mut ctx, j)? {
                self.schedule_autosave(position);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Label edits
    // ========================================================================

    /// Run an edit on frame `i` of `position` with the session's tracker.
    fn run_edit_at<T, F>(&mut self, position: usize, i: usize, op: F) -> Result<T>
    where
        F: FnOnce(&mut Position, &mut EditContext<'_>, usize) -> Result<T>,
    {
        let settings = self.config.get();
        let tracker = if self.mode == Mode::SegmentationTracking && self.tracking_active {
            self.trackers.get(&settings.tracker)
        } else {
            None
        };
        let pos = self
            .positions
            .get_mut(position)
            .ok_or(EngineError::UnknownPosition(position))?;
        let mut ctx = EditContext::new(position, &mut self.events)
            .with_tracker(tracker)
            .with_auto_fill_holes(settings.auto_fill_holes);
        let result = op(pos, &mut ctx, i)?;
        self.last_commit = Some((position, i));
        self.schedule_autosave(position);
        Ok(result)
    }

    /// Check the guards and run an edit on the current frame.
    fn edit<T, F>(&mut self, operation: &str, op: F) -> Result<T>
    where
        F: FnOnce(&mut Position, &mut EditContext<'_>, usize) -> Result<T>,
    {
        let i = self.frame;
        self.check_label_edit(operation, i, i)?;
        self.run_edit_at(self.position, i, op)
    }

    /// Paint a brush stroke. Returns the painted ID.
    pub fn brush(&mut self, stroke: &BrushStroke) -> Result<Option<CellId>> {
        self.edit("brush", |pos, ctx, i| edit::apply_brush(pos, ctx, i, stroke))
    }

    /// Erase along a stroke.
    pub fn erase(&mut self, stroke: &EraserStroke) -> Result<bool> {
        self.edit("eraser", |pos, ctx, i| edit::apply_eraser(pos, ctx, i, stroke))
    }

    /// Separate an object along its convexity defects.
    pub fn split_auto(&mut self, id: CellId) -> Result<Vec<CellId>> {
        self.edit("separate", |pos, ctx, i| edit::split_auto(pos, ctx, i, id))
    }

    /// Separate an object along a drawn cut.
    pub fn split_manual(&mut self, id: CellId, cut: &[Point]) -> Result<Vec<CellId>> {
        self.edit("separate", |pos, ctx, i| edit::split_manual(pos, ctx, i, id, cut))
    }

    /// Give every disconnected part of every object its own ID.
    pub fn relabel_components(&mut self) -> Result<Vec<(CellId, Vec<CellId>)>> {
        self.edit("relabel components", |pos, ctx, i| edit::relabel_components(pos, ctx, i))
    }

    /// Merge objects into `into`.
    pub fn merge(&mut self, into: CellId, from: &[CellId]) -> Result<bool> {
        self.edit("merge", |pos, ctx, i| edit::merge_ids(pos, ctx, i, into, from))
    }

    /// Grow an object by `iterations` pixels without overwriting neighbours.
    pub fn expand(&mut self, id: CellId, iterations: usize) -> Result<bool> {
        self.edit("expand", |pos, ctx, i| edit::expand_label(pos, ctx, i, id, iterations))
    }

    /// Shrink an object by `iterations` pixels.
    pub fn shrink(&mut self, id: CellId, iterations: usize) -> Result<bool> {
        self.edit("shrink", |pos, ctx, i| edit::shrink_label(pos, ctx, i, id, iterations))
    }

    /// Translate an object.
    pub fn move_label(&mut self, id: CellId, dy: i64, dx: i64) -> Result<bool> {
        self.edit("move label", |pos, ctx, i| edit::move_label(pos, ctx, i, id, dy, dx))
    }

    /// Fill the holes of an object.
    pub fn fill_holes(&mut self, id: CellId) -> Result<bool> {
        self.edit("fill holes", |pos, ctx, i| edit::fill_holes(pos, ctx, i, id))
    }

    /// Paint a mask as a new object.
    pub fn paint_mask(&mut self, mask: &Array2<bool>, z: Option<usize>) -> Result<Option<CellId>> {
        self.edit("paint mask", |pos, ctx, i| edit::paint_mask(pos, ctx, i, mask, z))
    }

    /// Paint the inside of a closed spline as a new object.
    pub fn spline(&mut self, points: &[Point], z: Option<usize>) -> Result<Option<CellId>> {
        self.edit("spline", |pos, ctx, i| edit::spline_mask(pos, ctx, i, points, z))
    }

    /// Flood-fill the user channel from `seed` and paint it as a new object.
    pub fn magic_wand(&mut self, seed: Point, tolerance: f32, z: Option<usize>) -> Result<Option<CellId>> {
        self.check_label_edit("magic wand", self.frame, self.frame)?;
        let image = self.user_plane(self.frame, z)?;
        self.edit("magic wand", |pos, ctx, i| {
            edit::magic_wand(pos, ctx, i, image.view(), seed, tolerance, z)
        })
    }

    /// Draw a delete-ROI. Returns its identifier.
    pub fn add_delete_roi(&mut self, shape: RoiShape) -> Result<u64> {
        self.edit("delete-ROI", |pos, ctx, i| edit::add_delete_roi(pos, ctx, i, shape))
    }

    /// Move or resize a delete-ROI.
    pub fn move_delete_roi(&mut self, roi_id: u64, shape: RoiShape) -> Result<bool> {
        self.edit("delete-ROI", |pos, ctx, i| edit::move_delete_roi(pos, ctx, i, roi_id, shape))
    }

    /// Remove a delete-ROI, restoring what only it covered.
    pub fn remove_delete_roi(&mut self, roi_id: u64) -> Result<bool> {
        self.edit("delete-ROI", |pos, ctx, i| edit::remove_delete_roi(pos, ctx, i, roi_id))
    }

    /// Re-run the tracker on the current frame and replay manual edits.
    pub fn repeat_tracking(&mut self) -> Result<bool> {
        let i = self.frame;
        self.check_label_edit("repeat tracking", i, i)?;
        let position = self.position;
        let tracker = self.trackers.get(&self.config.get().tracker);
        let pos = self
            .positions
            .get_mut(position)
            .ok_or(EngineError::UnknownPosition(position))?;
        let mut ctx = EditContext::new(position, &mut self.events).with_tracker(tracker);
        let changed = edit::repeat_tracking(pos, &mut ctx, i)?;
        if changed {
            self.last_commit = Some((position, i));
            self.schedule_autosave(position);
        }
        Ok(changed)
    }

    /// Renumber the objects of every visited frame to `1..N`.
    pub fn relabel(&mut self) -> Result<BTreeMap<CellId, CellId>> {
        let last = self.position().size_t().saturating_sub(1);
        self.check_label_edit("relabel", 0, last)?;
        let position = self.position;
        let pos = self.pos_mut()?;
        let mut events = EventQueue::new();
        let mapping = {
            let mut ctx = EditContext::new(position, &mut events);
            edit::relabel_sequential(pos, &mut ctx)?
        };
        for event in events.drain() {
            self.events.push(event);
        }
        self.schedule_autosave(position);
        Ok(mapping)
    }

    /// Drop orphan rows and add missing ones at frame `i`.
    pub fn repair_frame(&mut self, i: usize) -> Result<ReconcileReport> {
        self.check_not_in_error()?;
        self.check_save_lock(self.position, i, i)?;
        let report = self.pos_mut()?.repair_frame(i)?;
        if !report.is_clean() {
            self.schedule_autosave(self.position);
        }
        Ok(report)
    }

    // ========================================================================
    // Edits that propagate to other frames
    // ========================================================================

    /// Apply `op` to the current frame, then to later frames per `policy`.
    ///
    /// An explicit policy becomes the remembered default for this kind of
    /// operation. The autosave worker is paused while later frames change.
    pub fn apply_propagated(
        &mut self,
        op: PropagatedOp,
        policy: Option<PropagationPolicy>,
    ) -> Result<(bool, PropagationReport)> {
        let kind = op.kind();
        if let Some(policy) = policy {
            self.config.get_mut().propagation.set(kind, policy);
            self.flush_config();
        }
        let policy = self.config.get().propagation.get(kind);
        let i = self.frame;
        let last = match policy {
            PropagationPolicy::ThisFrameOnly => i,
            _ => self.position().size_t().saturating_sub(1),
        };
        let operation = format!("{:?}", kind);
        self.check_label_edit(&operation, i, last)?;

        let position = self.position;
        let changed = self.run_edit_at(position, i, |pos, ctx, i| op.apply_current(pos, ctx, i))?;
        if policy == PropagationPolicy::ThisFrameOnly {
            return Ok((changed, PropagationReport::default()));
        }
        if let Some(autosave) = &self.autosave {
            autosave.pause();
        }
        let report = self.run_edit_at(position, i, |pos, ctx, i| propagate(pos, ctx, i, &op, policy));
        if let Some(autosave) = &self.autosave {
            autosave.resume();
        }
        self.frame = i;
        Ok((changed, report?))
    }

    /// Rename `old` to `new`; swaps (or merges) when `new` exists.
    pub fn edit_id(
        &mut self,
        old: CellId,
        new: CellId,
        merge: bool,
        policy: Option<PropagationPolicy>,
    ) -> Result<(bool, PropagationReport)> {
        self.apply_propagated(PropagatedOp::EditId { old, new, merge }, policy)
    }

    /// Delete objects.
    pub fn delete_ids(
        &mut self,
        ids: BTreeSet<CellId>,
        policy: Option<PropagationPolicy>,
    ) -> Result<(bool, PropagationReport)> {
        self.apply_propagated(PropagatedOp::DeleteIds(ids), policy)
    }

    /// Delete every object not in `ids`.
    pub fn keep_ids(
        &mut self,
        ids: BTreeSet<CellId>,
        policy: Option<PropagationPolicy>,
    ) -> Result<(bool, PropagationReport)> {
        self.apply_propagated(PropagatedOp::Keep(ids), policy)
    }

    /// Keep the objects matching an expression such as `3,5-9,12`.
    pub fn keep_expression(&mut self, expr: &str, policy: Option<PropagationPolicy>) -> Result<(bool, PropagationReport)> {
        let max_id = self.position().brush_id().saturating_sub(1);
        let ids = edit::parse_id_expression(expr, max_id)?;
        self.keep_ids(ids, policy)
    }

    /// Exclude objects from analysis (or include them again).
    pub fn set_excluded(
        &mut self,
        ids: BTreeSet<CellId>,
        value: bool,
        policy: Option<PropagationPolicy>,
    ) -> Result<(bool, PropagationReport)> {
        self.apply_propagated(PropagatedOp::Bin { ids, value }, policy)
    }

    /// Mark objects as dead (or alive again).
    pub fn set_dead(
        &mut self,
        ids: BTreeSet<CellId>,
        value: bool,
        policy: Option<PropagationPolicy>,
    ) -> Result<(bool, PropagationReport)> {
        self.apply_propagated(PropagatedOp::Rip { ids, value }, policy)
    }

    // ========================================================================
    // Undo
    // ========================================================================

    /// Undo the last edit: the last cell-cycle edit in cell-cycle mode,
    /// the last edit of the current frame otherwise.
    pub fn undo(&mut self) -> Result<bool> {
        self.undo_redo(true)
    }

    /// Redo the last undone edit.
    pub fn redo(&mut self) -> Result<bool> {
        self.undo_redo(false)
    }

    fn undo_redo(&mut self, undo: bool) -> Result<bool> {
        let position = self.position;
        let i = self.frame;
        let changed_frame = if self.mode == Mode::CellCycle {
            self.check_not_in_error()?;
            self.check_save_lock(position, i, self.position().size_t().saturating_sub(1))?;
            let pos = self.pos_mut()?;
            if undo { cca::undo(pos) } else { cca::redo(pos) }
        } else {
            self.check_label_edit(if undo { "undo" } else { "redo" }, i, i)?;
            let pos = self.pos_mut()?;
            let changed = if undo {
                edit::undo_frame(pos, i)?
            } else {
                edit::redo_frame(pos, i)?
            };
            changed.then_some(i)
        };
        let Some(frame) = changed_frame else {
            return Ok(false);
        };
        self.events.push(EngineEvent::FrameDirty { position, frame });
        self.schedule_autosave(position);
        Ok(true)
    }

    // ========================================================================
    // Cell cycle
    // ========================================================================

    /// Assign `bud` to `mother` at the current frame.
    pub fn assign_bud(&mut self, bud: CellId, mother: CellId) -> Result<()> {
        self.cca_edit("assign bud", |pos, i, prompt| cca::assign_bud(pos, i, bud, mother, prompt))
    }

    /// Annotate the division of `id` and its relative at the current frame.
    pub fn annotate_division(&mut self, id: CellId) -> Result<()> {
        self.cca_edit("annotate division", |pos, i, _| cca::annotate_division(pos, i, id))
    }

    /// Undo the division annotation of `id` at the current frame.
    pub fn undo_division(&mut self, id: CellId) -> Result<()> {
        self.cca_edit("undo division", |pos, i, _| cca::undo_division(pos, i, id))
    }

    fn cca_edit<F>(&mut self, operation: &str, op: F) -> Result<()>
    where
        F: FnOnce(&mut Position, usize, &mut dyn OperatorPrompt) -> Result<()>,
    {
        self.check_mode(operation, Mode::CellCycle)?;
        let i = self.frame;
        let position = self.position;
        self.check_save_lock(position, i, self.position().size_t().saturating_sub(1))?;
        let pos = self
            .positions
            .get_mut(position)
            .ok_or(EngineError::UnknownPosition(position))?;
        op(pos, i, self.prompt.as_mut())?;
        self.events.push(EngineEvent::FrameDirty { position, frame: i });
        self.schedule_autosave(position);
        Ok(())
    }

    // ========================================================================
    // Custom annotations
    // ========================================================================

    /// Register a named annotation on the current position.
    pub fn add_custom_annotation(&mut self, name: &str, description: &str) -> Result<()> {
        self.check_not_in_error()?;
        let pos = self.pos_mut()?;
        if pos.custom_annotations.iter().any(|a| a.name == name) {
            return Err(EngineError::invalid_input(format!("annotation '{}' already exists", name)));
        }
        pos.custom_annotations.push(CustomAnnotation {
            name: name.to_string(),
            description: description.to_string(),
        });
        log::info!("Custom annotation '{}' added", name);
        Ok(())
    }

    /// Set or clear a custom annotation on an object of the current frame.
    pub fn set_custom_annotation(&mut self, name: &str, id: CellId, value: bool) -> Result<bool> {
        self.check_mode("custom annotation", Mode::CustomAnnotations)?;
        let i = self.frame;
        self.check_save_lock(self.position, i, i)?;
        self.run_edit_at(self.position, i, |pos, ctx, i| {
            edit::set_custom_annotation(pos, ctx, i, name, id, value)
        })
    }

    // ========================================================================
    // Segmentation
    // ========================================================================

    /// Load a segmentation model into a background worker.
    pub fn load_segmentation_model(&mut self, model: Box<dyn SegmentationModel>) -> Result<()> {
        self.segmentation = Some(SegmentationWorker::spawn(model)?);
        Ok(())
    }

    /// Segment the current frame, or only `region` of it.
    ///
    /// The result is integrated by [`poll`](Self::poll): a whole-frame
    /// result replaces the labels, a region result adds new objects on the
    /// background.
    pub fn segment(&mut self, region: Option<Region>) -> Result<()> {
        let i = self.frame;
        self.check_label_edit("segment", i, i)?;
        if self.segmentation.is_none() {
            return Err(EngineError::invalid_input("no segmentation model loaded"));
        }
        let (depth, _, _) = self.position().frame_shape();
        let image = self.user_frame(i, depth)?;
        let task = SegmentationTask {
            position: self.position,
            frame: i,
            image,
            region,
        };
        let submitted = self.segmentation.as_ref().is_some_and(|w| w.submit(task));
        if !submitted {
            return Err(self.raise_critical("segmentation", "worker is not running".to_string(), false));
        }
        Ok(())
    }

    /// Cancel running segmentation tasks.
    pub fn cancel_segmentation(&mut self) {
        if let Some(worker) = &self.segmentation {
            worker.cancel();
        }
    }

    fn integrate_segmentation(&mut self, result: &crate::workers::SegmentationResult) -> Result<Vec<CellId>> {
        self.check_not_in_error()?;
        if !self.mode.allows_label_edits() {
            return Err(EngineError::wrong_mode("segment", self.mode.name()));
        }
        self.check_save_lock(result.position, result.frame, result.frame)?;
        let origin = result.region.map(|r| (r.y0, r.x0)).unwrap_or((0, 0));
        let replace = result.region.is_none();
        self.run_edit_at(result.position, result.frame, |pos, ctx, i| {
            edit::paste_segmentation(pos, ctx, i, &result.labels, origin, replace)
        })
    }

    /// User-channel image of frame `i` shaped `(depth, Y, X)`.
    fn user_frame(&mut self, i: usize, depth: usize) -> Result<ndarray::Array3<f32>> {
        let pos = self.pos_mut()?;
        let user = pos.meta.user_channel.clone();
        let choice = pos.segm_info.get(&user, i);
        let stack = pos.channel(&user)?;
        if i >= stack.len_of(Axis(0)) {
            return Err(EngineError::invalid_input(format!("channel '{}' has no frame {}", user, i)));
        }
        let frame = stack.index_axis(Axis(0), i);
        let size_z = frame.len_of(Axis(0));
        if size_z == depth {
            return Ok(frame.to_owned());
        }
        let choice = choice.unwrap_or(ZSliceChoice {
            z_slice: size_z / 2,
            projection: ZProjection::SingleSlice,
        });
        Ok(project(frame, choice))
    }

    /// One plane of the user channel at frame `i`.
    fn user_plane(&mut self, i: usize, z: Option<usize>) -> Result<Array2<f32>> {
        let (depth, _, _) = self.position().frame_shape();
        let frame = self.user_frame(i, depth)?;
        let depth = frame.len_of(Axis(0));
        let z = z.unwrap_or(0).min(depth.saturating_sub(1));
        Ok(frame.index_axis(Axis(0), z).to_owned())
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    fn flush_config(&mut self) {
        match self.config.flush_on_change() {
            Ok(true) => log::debug!("Settings written"),
            Ok(false) => {}
            Err(e) => log::warn!("Settings not written: {}", e),
        }
    }

    /// Labels of frame `i` as they would be saved.
    pub fn exported_labels(&self, i: usize) -> Option<Labels> {
        self.position().slot(i).map(FrameSlot::exported_labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::io::metadata::PositionMetadata;
    use crate::position::PositionLayout;
    use crate::prompt::AutoAccept;

    pub(crate) fn engine_from(frames: Vec<Labels>) -> Engine {
        let (_, h, w) = frames[0].dim();
        let meta = PositionMetadata::new_2d(frames.len(), h, w, "phase");
        let pos = Position::from_frames(meta, PositionLayout::new("/tmp/none", "pos", ""), frames);
        let mut config = AppConfig::default();
        config.autosave.enabled = false;
        Engine::new(vec![pos], ConfigStore::in_memory(config), Box::new(AutoAccept)).unwrap()
    }

    fn frame(ids: &[(CellId, usize, usize)]) -> Labels {
        let mut labels = Labels::zeros((1, 8, 8));
        for &(id, y, x) in ids {
            for dy in 0..2 {
                for dx in 0..2 {
                    labels[[0, y + dy, x + dx]] = id;
                }
            }
        }
        labels
    }

    #[test]
    fn test_viewer_refuses_edits() {
        let mut engine = engine_from(vec![frame(&[(1, 1, 1)]), frame(&[(1, 1, 1)])]);
        assert_eq!(engine.mode(), Mode::Viewer);
        let err = engine.brush(&BrushStroke::new(Point::new(5.0, 5.0), 1.0)).unwrap_err();
        assert!(matches!(err, EngineError::WrongMode { .. }));
        assert!(!engine.position().undo.can_undo(0));
    }

    #[test]
    fn test_single_frame_starts_in_snapshot_mode() {
        let mut engine = engine_from(vec![frame(&[(1, 1, 1)])]);
        assert_eq!(engine.mode(), Mode::Snapshot);
        assert!(engine.set_mode(Mode::SegmentationTracking).is_err());
        assert_eq!(engine.brush(&BrushStroke::new(Point::new(5.0, 5.0), 1.0)).unwrap(), Some(2));
    }

    #[test]
    fn test_error_state_blocks_edits_until_acknowledged() {
        let mut engine = engine_from(vec![frame(&[(1, 1, 1)])]);
        engine.raise_critical("autosave", "disk full".to_string(), false);
        assert!(engine.is_error_state());
        let err = engine.delete_ids(BTreeSet::from([1]), None).unwrap_err();
        assert!(matches!(err, EngineError::ErrorState(_)));
        assert!(matches!(engine.drain_events().last(), Some(EngineEvent::WorkerError { .. })));
        assert!(engine.acknowledge_error().is_some());
        assert!(engine.delete_ids(BTreeSet::from([1]), None).unwrap().0);
    }

    #[test]
    fn test_critical_error_rolls_back_last_commit() {
        let mut engine = engine_from(vec![frame(&[(1, 1, 1)])]);
        engine.delete_ids(BTreeSet::from([1]), None).unwrap();
        assert!(engine.slot().unwrap().state.is_empty());
        engine.raise_critical("autosave", "disk full".to_string(), true);
        assert_eq!(engine.slot().unwrap().state.ids(), &[1]);
    }

    #[test]
    fn test_save_lock_denies_edits() {
        let mut engine = engine_from(vec![frame(&[(1, 1, 1)]), frame(&[(1, 1, 1)])]);
        engine.set_mode(Mode::SegmentationTracking).unwrap();
        engine.save_lock = Some((0, 0..=1));
        let err = engine.delete_ids(BTreeSet::from([1]), None).unwrap_err();
        assert!(matches!(err, EngineError::PermissionDenied { frame: 0 }));
    }

    #[test]
    fn test_new_frame_is_tracked_on_first_visit() {
        let mut engine = engine_from(vec![frame(&[(1, 1, 1), (2, 5, 5)]), frame(&[(7, 1, 1), (9, 5, 5)])]);
        engine.set_mode(Mode::SegmentationTracking).unwrap();
        // Frames loaded from disk count as already tracked.
        assert!(engine.position().visited_for_tracking(1));
        engine.set_tracking(Some(true));
        engine.next_frame().unwrap();
        assert_eq!(engine.current_frame(), 1);
        assert!(engine.tracking_enabled());
        assert_eq!(engine.slot().unwrap().state.ids(), &[1, 2]);
    }

    #[test]
    fn test_propagated_delete_restores_frame_index() {
        let mut engine = engine_from(vec![frame(&[(1, 1, 1), (2, 5, 5)]), frame(&[(1, 1, 1), (2, 5, 5)])]);
        engine.set_mode(Mode::SegmentationTracking).unwrap();
        engine.set_tracking(Some(false));
        engine.next_frame().unwrap();
        engine.prev_frame().unwrap();
        let (changed, report) = engine
            .delete_ids(BTreeSet::from([2]), Some(PropagationPolicy::ApplyVisitedFuture))
            .unwrap();
        assert!(changed);
        assert_eq!(report.visited, vec![1]);
        assert_eq!(engine.current_frame(), 0);
        assert_eq!(engine.position().slot(1).unwrap().state.ids(), &[1]);
        assert_eq!(
            engine.config().get().propagation.get(crate::propagate::PropagatedKind::DeleteId),
            PropagationPolicy::ApplyVisitedFuture
        );
    }

    #[test]
    fn test_keep_expression_with_unbounded_range() {
        let mut engine = engine_from(vec![frame(&[(1, 1, 1), (2, 5, 5), (3, 1, 5)])]);
        let (changed, _) = engine.keep_expression("2-4294967295", None).unwrap();
        assert!(changed);
        assert_eq!(engine.slot().unwrap().state.ids(), &[2, 3]);
    }

    #[test]
    fn test_undo_redo_current_frame() {
        let mut engine = engine_from(vec![frame(&[(1, 1, 1)])]);
        engine.delete_ids(BTreeSet::from([1]), None).unwrap();
        assert!(engine.undo().unwrap());
        assert_eq!(engine.slot().unwrap().state.ids(), &[1]);
        assert!(engine.redo().unwrap());
        assert!(engine.slot().unwrap().state.is_empty());
        assert!(!engine.redo().unwrap());
    }

    #[test]
    fn test_custom_annotation_needs_its_mode() {
        let mut engine = engine_from(vec![frame(&[(1, 1, 1)])]);
        engine.add_custom_annotation("budding", "").unwrap();
        assert!(engine.add_custom_annotation("budding", "").is_err());
        assert!(engine.set_custom_annotation("budding", 1, true).is_err());
        engine.set_mode(Mode::CustomAnnotations).unwrap();
        assert!(engine.set_custom_annotation("budding", 1, true).unwrap());
        assert!(engine.slot().unwrap().acdc.row(1).unwrap().custom.contains("budding"));
    }
}
