//! Saving, autosave and recovery.

use std::collections::BTreeMap;
use std::sync::Arc;

use acdc_labels::Labels;

use super::Engine;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::frame_state::FrameState;
use crate::io::custom_annot;
use crate::io::table::TableContext;
use crate::measure::{MeasurementSchema, Measurer};
use crate::model::AcdcTable;
use crate::position::{LabelSource, Position};
use crate::prompt::{PromptReply, PromptRequest};
use crate::workers::{AutosaveRequest, MeasurementJob, SaveJob, SaveMessage, SaveOutcome, SaveWorker};

/// State of a background save.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveStatus {
    /// Frames measured so far
    Running {
        /// Frames done
        done: usize,
        /// Frames to do
        total: usize,
    },
    /// Everything was written
    Finished(SaveOutcome),
    /// The operator aborted the save
    Aborted,
}

/// What a running save publishes once it finishes.
pub(super) struct Published {
    position: usize,
    frames: BTreeMap<usize, Labels>,
    tables: BTreeMap<usize, AcdcTable>,
    progress: (usize, usize),
}

fn table_context(pos: &Position) -> TableContext {
    TableContext {
        time_increment: pos.meta.time_increment,
        is_3d: pos.is_3d(),
        custom_annotations: pos.custom_annotation_names(),
        position: pos.layout.position_name(),
        segm_endname: pos.layout.endname.clone(),
    }
}

/// Labels and table of frame `i` as they are published.
fn export_frame(pos: &mut Position, i: usize) -> Result<(Labels, Option<AcdcTable>)> {
    if let Some(slot) = pos.slot(i) {
        return Ok((slot.exported_labels(), Some(slot.exported_acdc())));
    }
    let labels = pos.get_labels(i, LabelSource::Disk)?.into_owned();
    Ok((labels, pos.disk_acdc.get(&i).cloned()))
}

/// Install the saved frames as the on-disk state of `pos`.
fn publish_frames(pos: &mut Position, published: Published, outcome: &SaveOutcome) -> Result<()> {
    pos.segm_info = outcome.segm_info.clone();
    let end = published.frames.len().saturating_sub(1);
    // Frames after the save range may have changed while saving.
    let later: Vec<usize> = pos.modified_frames().iter().copied().filter(|&i| i > end).collect();
    for (i, labels) in published.frames {
        pos.disk.set(i, labels)?;
    }
    pos.disk_acdc.extend(published.tables);
    pos.clear_modified();
    for i in later {
        pos.mark_modified(i);
    }
    if let Err(e) = pos.layout.clear_recovery() {
        log::warn!("Recovery files of '{}' not removed: {}", pos.name(), e);
    }
    Ok(())
}

impl Engine {
    // ========================================================================
    // Recovery and autosave
    // ========================================================================

    /// Ask whether to recover autosaved data of position `p`.
    pub(super) fn offer_recovery(&mut self, p: usize) -> Result<()> {
        let pos = &mut self.positions[p];
        if !pos.recovery_available() {
            return Ok(());
        }
        let request = PromptRequest::Recover {
            position: pos.layout.dir.clone(),
        };
        if self.prompt.ask(&request).is_yes() {
            let frames = pos.apply_recovery()?;
            self.events
                .status(format!("Recovered {} unsaved frame(s) of '{}'", frames.len(), pos.name()));
        } else {
            log::info!("Recovery data of '{}' ignored", pos.name());
            pos.discard_recovery();
        }
        Ok(())
    }

    /// Hand the frames of `position` changed since the previous call to the
    /// autosave worker, which merges them into its recovery set.
    pub(super) fn schedule_autosave(&mut self, position: usize) {
        let Some(autosave) = &self.autosave else {
            return;
        };
        let Some(pos) = self.positions.get_mut(position) else {
            return;
        };
        let dirty = pos.take_autosave_dirty();
        if dirty.is_empty() {
            return;
        }
        let mut frames = BTreeMap::new();
        let mut tables = BTreeMap::new();
        for i in dirty {
            match export_frame(pos, i) {
                Ok((labels, table)) => {
                    frames.insert(i, labels);
                    if let Some(table) = table {
                        tables.insert(i, table);
                    }
                }
                Err(e) => {
                    log::warn!("Frame {} not autosaved: {}", i, e);
                    pos.mark_modified(i);
                }
            }
        }
        autosave.enqueue(AutosaveRequest {
            position,
            layout: pos.layout.clone(),
            frames,
            tables,
            table_ctx: table_context(pos),
        });
    }

    fn resume_autosave(&self) {
        if let Some(autosave) = &self.autosave {
            autosave.resume();
        }
    }

    // ========================================================================
    // Save
    // ========================================================================

    /// Whether a background save is running.
    pub fn is_saving(&self) -> bool {
        self.save.is_some()
    }

    /// Start saving the current position in the background.
    ///
    /// Frames up to the last visited, modified or segmented frame are
    /// written; the operator may extend the range to the end of the
    /// position. Saved frames refuse edits until the save ends. Progress
    /// and the outcome are reported by [`poll`](Self::poll).
    pub fn start_save(&mut self) -> Result<()> {
        self.check_not_in_error()?;
        if self.save.is_some() {
            return Err(EngineError::invalid_input("a save is already running"));
        }
        if let Some(autosave) = &self.autosave {
            autosave.drain();
            autosave.pause();
        }
        match self.spawn_save() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.resume_autosave();
                Err(e)
            }
        }
    }

    fn spawn_save(&mut self) -> Result<()> {
        let position = self.position;
        let measure = match self.save_measurements.or(self.config.get().save_measurements) {
            Some(measure) => measure,
            None => {
                let measure = self.prompt.ask(&PromptRequest::SaveMeasurements).is_yes();
                self.save_measurements = Some(measure);
                measure
            }
        };

        let pos = &mut self.positions[position];
        let size_t = pos.size_t();
        let mut end = [
            pos.last_visited(),
            pos.disk.last_nonempty(),
            pos.modified_frames().last().copied(),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0);
        if size_t > 1 && end < size_t - 1 {
            let request = PromptRequest::ExtendSaveRange {
                last_visited: end,
                size_t,
            };
            match self.prompt.ask(&request) {
                PromptReply::Yes => end = size_t - 1,
                PromptReply::Index(k) => end = k.clamp(end, size_t - 1),
                PromptReply::Abort => return Err(EngineError::Cancelled("save".to_string())),
                _ => {}
            }
        }

        let spacing = pos.spacing();
        let is_3d = pos.is_3d();
        let mut frames = Vec::with_capacity(end + 1);
        let mut states = Vec::with_capacity(end + 1);
        let mut tables = BTreeMap::new();
        for i in 0..=end {
            let (labels, table) = export_frame(pos, i)?;
            let state = FrameState::update(&labels, spacing, is_3d);
            let mut table = table.unwrap_or_else(|| AcdcTable::from_frame_state(&state, is_3d));
            let report = table.repair(&state, is_3d);
            if !report.is_clean() {
                log::debug!("Frame {} table repaired before saving: {:?}", i, report);
            }
            tables.insert(i, table);
            frames.push(labels);
            states.push(state);
        }

        let measurement = if measure {
            let mut schema = self
                .schema
                .clone()
                .unwrap_or_else(|| MeasurementSchema::all_for(pos.meta.channels.clone()));
            schema.load_combine(&pos.layout.combine_metrics_path())?;
            let mut channels = Vec::new();
            if schema.needs_channels() {
                for name in &schema.channels {
                    match pos.channel(name) {
                        Ok(stack) => channels.push((name.clone(), stack.clone())),
                        Err(e) => log::warn!("Channel '{}' not measured: {}", name, e),
                    }
                }
            }
            let measurer = self
                .custom_metrics
                .iter()
                .fold(Measurer::new(schema), |m, metric| m.with_custom(Box::new(Arc::clone(metric))));
            Some(MeasurementJob { measurer, channels })
        } else {
            None
        };

        if !pos.custom_annotations.is_empty() {
            custom_annot::save(&pos.layout.custom_annotations_path(), &pos.custom_annotations)?;
        }

        let job = SaveJob {
            position,
            layout: pos.layout.clone(),
            frames: frames.clone(),
            states,
            tables: tables.clone(),
            table_ctx: table_context(pos),
            is_3d,
            spacing,
            segm_info: pos.segm_info.clone(),
            measurement,
        };
        let worker = SaveWorker::spawn(job)?;
        log::info!("Saving frames 0..={} of '{}'", end, pos.name());
        self.published = Some(Published {
            position,
            frames: frames.into_iter().enumerate().collect(),
            tables,
            progress: (0, end + 1),
        });
        self.save = Some(worker);
        self.save_lock = Some((position, 0..=end));
        self.events.status(format!("Saving {} frame(s)...", end + 1));
        Ok(())
    }

    /// Ask the running save to stop before the next frame.
    pub fn abort_save(&mut self) {
        if let Some(worker) = &self.save {
            worker.abort();
        }
    }

    /// Save the current position and wait for the result.
    pub fn save(&mut self) -> Result<SaveOutcome> {
        self.start_save()?;
        loop {
            let message = self
                .save
                .as_mut()
                .and_then(SaveWorker::recv)
                .unwrap_or_else(|| SaveMessage::Failed("save worker is gone".to_string()));
            match self.handle_save_message(message)? {
                Some(SaveStatus::Finished(outcome)) => return Ok(outcome),
                Some(SaveStatus::Aborted) => return Err(EngineError::Cancelled("save".to_string())),
                _ => {}
            }
        }
    }

    /// Messages of the running save, without blocking.
    pub(super) fn poll_save(&mut self) -> Result<Option<SaveStatus>> {
        let mut status = None;
        while let Some(message) = self.save.as_mut().and_then(SaveWorker::try_recv) {
            status = self.handle_save_message(message)?;
            if matches!(status, Some(SaveStatus::Finished(_) | SaveStatus::Aborted)) {
                return Ok(status);
            }
        }
        if status.is_none() {
            status = self.published.as_ref().map(|p| SaveStatus::Running {
                done: p.progress.0,
                total: p.progress.1,
            });
        }
        Ok(status)
    }

    fn handle_save_message(&mut self, message: SaveMessage) -> Result<Option<SaveStatus>> {
        match message {
            SaveMessage::Progress { done, total } => {
                let position = self.save.as_ref().map(SaveWorker::position).unwrap_or(self.position);
                if let Some(published) = &mut self.published {
                    published.progress = (done, total);
                }
                self.events.push(EngineEvent::SaveProgress { position, done, total });
                Ok(Some(SaveStatus::Running { done, total }))
            }
            SaveMessage::Prompt { request, reply } => {
                let answer = self.prompt.ask(&request);
                if reply.send(answer).is_err() {
                    log::debug!("Save worker no longer waits for {:?}", request);
                }
                Ok(None)
            }
            SaveMessage::Finished(outcome) => {
                self.publish(&outcome)?;
                self.events.status(format!("Saved {} frame(s)", outcome.frames_written));
                Ok(Some(SaveStatus::Finished(outcome)))
            }
            SaveMessage::Aborted => {
                self.end_save();
                self.events.status("Save aborted");
                Ok(Some(SaveStatus::Aborted))
            }
            SaveMessage::Failed(message) => {
                self.end_save();
                Err(self.raise_critical("save", message, false))
            }
        }
    }

    /// Make the written data the new on-disk state of the position.
    fn publish(&mut self, outcome: &SaveOutcome) -> Result<()> {
        let Some(published) = self.published.take() else {
            self.end_save();
            return Ok(());
        };
        let position = published.position;
        let result = match self.positions.get_mut(position) {
            Some(pos) => publish_frames(pos, published, outcome),
            None => Err(EngineError::UnknownPosition(position)),
        };
        if let Some(autosave) = &self.autosave {
            autosave.discard(position);
        }
        self.end_save();
        self.schedule_autosave(position);
        result
    }

    /// Release the save lock and resume autosave.
    fn end_save(&mut self) {
        self.save = None;
        self.save_lock = None;
        self.published = None;
        self.resume_autosave();
    }

    /// End the session, saving every position with unsaved changes first
    /// when `save` is set.
    ///
    /// Without saving, pending autosave snapshots are still written so the
    /// changes can be recovered on the next open.
    pub fn close(mut self, save: bool) -> Result<()> {
        if self.save.is_some() {
            while self.is_saving() {
                let message = self
                    .save
                    .as_mut()
                    .and_then(SaveWorker::recv)
                    .unwrap_or_else(|| SaveMessage::Failed("save worker is gone".to_string()));
                self.handle_save_message(message)?;
            }
        }
        if save {
            for p in 0..self.positions.len() {
                if self.positions[p].modified_frames().is_empty() {
                    continue;
                }
                self.position = p;
                self.save()?;
            }
        }
        self.flush_config();
        log::info!("Session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::super::tests::engine_from;
    use super::*;
    use crate::config::{AppConfig, ConfigStore};
    use crate::engine::Mode;
    use crate::io::npz::read_frame_archive;
    use crate::position::PositionLayout;
    use crate::prompt::{AutoAccept, Scripted};

    fn labels(id: u32) -> Labels {
        let mut labels = Labels::zeros((1, 6, 6));
        labels[[0, 2, 2]] = id;
        labels[[0, 2, 3]] = id;
        labels
    }

    fn engine_in(dir: &std::path::Path, frames: Vec<Labels>, autosave: bool) -> Engine {
        let meta = crate::io::metadata::PositionMetadata::new_2d(frames.len(), 6, 6, "phase");
        let pos = Position::from_frames(meta, PositionLayout::new(dir, "pos", ""), frames);
        let mut config = AppConfig::default();
        config.autosave.enabled = autosave;
        config.autosave.debounce_ms = 0;
        config.save_measurements = Some(false);
        Engine::new(vec![pos], ConfigStore::in_memory(config), Box::new(AutoAccept)).unwrap()
    }

    #[test]
    fn test_save_publishes_and_clears_modified() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path(), vec![labels(1), labels(1)], false);
        engine.set_mode(Mode::SegmentationTracking).unwrap();
        engine.delete_ids(BTreeSet::from([1]), Some(crate::propagate::PropagationPolicy::ThisFrameOnly)).unwrap();
        assert!(!engine.position().modified_frames().is_empty());

        let outcome = engine.save().unwrap();
        assert_eq!(outcome.frames_written, 2);
        assert!(engine.position().modified_frames().is_empty());
        assert!(!engine.is_saving());
        let layout = PositionLayout::new(dir.path(), "pos", "");
        assert!(layout.segm_path().exists());
        assert!(layout.acdc_output_path().exists());
        assert!(matches!(engine.drain_events().last(), Some(EngineEvent::Status(_))));
    }

    #[test]
    fn test_edits_refused_while_saving() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path(), vec![labels(1), labels(1)], false);
        engine.set_mode(Mode::SegmentationTracking).unwrap();
        engine.start_save().unwrap();
        let err = engine.delete_ids(BTreeSet::from([1]), None).unwrap_err();
        assert!(matches!(err, EngineError::PermissionDenied { .. }));
        assert!(engine.start_save().is_err());
        loop {
            if let Some(SaveStatus::Finished(_)) = engine.poll().unwrap() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(engine.delete_ids(BTreeSet::from([1]), None).unwrap().0);
    }

    #[test]
    fn test_autosave_writes_recovery_and_save_clears_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path(), vec![labels(1)], true);
        engine.delete_ids(BTreeSet::from([1]), None).unwrap();
        if let Some(autosave) = &engine.autosave {
            autosave.drain();
        }
        let layout = PositionLayout::new(dir.path(), "pos", "");
        let recovered = read_frame_archive(&layout.recovery_segm_path()).unwrap();
        assert_eq!(acdc_labels::max_id(&recovered[&0]), 0);

        engine.save().unwrap();
        assert!(!layout.recovery_segm_path().exists());
    }

    #[test]
    fn test_autosave_sends_changed_frames_and_keeps_earlier_ones() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path(), vec![labels(1), labels(1)], true);
        engine.set_mode(Mode::SegmentationTracking).unwrap();
        engine.set_tracking(Some(false));
        engine.delete_ids(BTreeSet::from([1]), None).unwrap();
        assert!(engine.positions[0].take_autosave_dirty().is_empty());

        engine.next_frame().unwrap();
        engine.delete_ids(BTreeSet::from([1]), None).unwrap();
        if let Some(autosave) = &engine.autosave {
            autosave.drain();
        }
        let layout = PositionLayout::new(dir.path(), "pos", "");
        let recovered = read_frame_archive(&layout.recovery_segm_path()).unwrap();
        assert_eq!(recovered.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert!(recovered.values().all(|l| acdc_labels::max_id(l) == 0));
        assert_eq!(engine.position().modified_frames().len(), 2);
    }

    #[test]
    fn test_declined_measurements_are_remembered() {
        let mut engine = engine_from(vec![labels(1)]);
        engine.config_mut().get_mut().save_measurements = None;
        engine.prompt = Box::new(Scripted::new([PromptReply::No], Box::new(crate::prompt::AutoReject)));
        let dir = tempfile::tempdir().unwrap();
        engine.positions[0].layout = PositionLayout::new(dir.path(), "pos", "");
        engine.save().unwrap();
        assert_eq!(engine.save_measurements, Some(false));
        engine.save().unwrap();
        assert_eq!(engine.save_measurements, Some(false));
    }
}
