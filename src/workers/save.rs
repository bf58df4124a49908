//! Background save of one position.
//!
//! The main thread snapshots everything the save needs into a [`SaveJob`]
//! (labels, annotation tables and region properties of every frame in the
//! save range) and hands it to a [`SaveWorker`]. The worker computes the
//! measurements, backs up the previous annotation table and writes the
//! segmentation, the table and the z-slice choices, each through a temporary
//! file. Questions for the operator travel back as [`SaveMessage::Prompt`]
//! with a reply channel; the worker blocks until the main thread answers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};

use acdc_labels::{Labels, PhysicalSize};
use ndarray::Axis;

use crate::frame_state::FrameState;
use crate::io::history::archive_previous;
use crate::io::images::ChannelStack;
use crate::io::npz::write_segmentation;
use crate::io::segm_info::{SegmInfo, ZProjection, ZSliceChoice};
use crate::io::table::{FrameMetrics, TableContext, write_table};
use crate::io::{IoError, IoResult};
use crate::measure::{ChannelFrame, Measurer, project};
use crate::model::AcdcTable;
use crate::position::PositionLayout;
use crate::prompt::{PromptReply, PromptRequest};

/// Measurement part of a save.
pub struct MeasurementJob {
    /// Columns to compute
    pub measurer: Measurer,
    /// Channel stacks `(T, Z, Y, X)` named as in the schema
    pub channels: Vec<(String, ChannelStack)>,
}

/// Everything a save needs, detached from the position store.
pub struct SaveJob {
    /// Position index in the engine
    pub position: usize,
    /// Where to write
    pub layout: PositionLayout,
    /// Labels of frames `0..frames.len()`
    pub frames: Vec<Labels>,
    /// Region properties of every frame, computed by the caller
    pub states: Vec<FrameState>,
    /// Annotation rows per frame
    pub tables: BTreeMap<usize, AcdcTable>,
    /// Table metadata
    pub table_ctx: TableContext,
    /// Whether labels are 3D
    pub is_3d: bool,
    /// Physical pixel size
    pub spacing: PhysicalSize,
    /// Z-slice choices known so far
    pub segm_info: SegmInfo,
    /// Measurements to compute, if any
    pub measurement: Option<MeasurementJob>,
}

/// Result of a completed save.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
    /// Position index
    pub position: usize,
    /// Number of frames written
    pub frames_written: usize,
    /// Z-slice choices including the ones answered during the save
    pub segm_info: SegmInfo,
    /// Name of the backup entry of the previous table
    pub backup: Option<String>,
}

/// Message from the save thread.
#[derive(Debug)]
pub enum SaveMessage {
    /// Frames measured so far
    Progress {
        /// Frames done
        done: usize,
        /// Frames to do
        total: usize,
    },
    /// The worker waits for an answer on `reply`
    Prompt {
        /// The question
        request: PromptRequest,
        /// Where to send the answer
        reply: Sender<PromptReply>,
    },
    /// Everything was written
    Finished(SaveOutcome),
    /// The save was aborted; files already written are complete
    Aborted,
    /// The save failed
    Failed(String),
}

/// Handle of a running save.
pub struct SaveWorker {
    position: usize,
    /// Dropped before joining so a worker blocked on a prompt exits
    rx: Option<Receiver<SaveMessage>>,
    abort: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    done: bool,
}

impl SaveWorker {
    /// Start saving `job` in the background.
    pub fn spawn(job: SaveJob) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<SaveMessage>();
        let abort = Arc::new(AtomicBool::new(false));
        let position = job.position;
        let thread_abort = Arc::clone(&abort);
        let thread_handle = thread::Builder::new()
            .name("save-worker".to_string())
            .spawn(move || {
                log::info!("Save worker started for {:?}", job.layout.dir);
                let message = Self::thread_main(job, &tx, &thread_abort);
                match &message {
                    SaveMessage::Finished(outcome) => {
                        log::info!("Save worker finished ({} frames)", outcome.frames_written)
                    }
                    SaveMessage::Aborted => log::info!("Save worker aborted"),
                    SaveMessage::Failed(e) => log::error!("Save worker failed: {}", e),
                    _ => {}
                }
                let _ = tx.send(message);
            })?;
        Ok(Self {
            position,
            rx: Some(rx),
            abort,
            thread_handle: Some(thread_handle),
            done: false,
        })
    }

    /// Position being saved.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Ask the worker to stop before the next frame.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Next message, without blocking.
    pub fn try_recv(&mut self) -> Option<SaveMessage> {
        if self.done {
            return None;
        }
        match self.rx.as_ref()?.try_recv() {
            Ok(message) => {
                self.note_final(&message);
                Some(message)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.done = true;
                Some(SaveMessage::Failed("save worker exited without reporting".to_string()))
            }
        }
    }

    /// Next message, blocking; `None` once the final message was received.
    pub fn recv(&mut self) -> Option<SaveMessage> {
        if self.done {
            return None;
        }
        match self.rx.as_ref()?.recv() {
            Ok(message) => {
                self.note_final(&message);
                Some(message)
            }
            Err(_) => {
                self.done = true;
                Some(SaveMessage::Failed("save worker exited without reporting".to_string()))
            }
        }
    }

    /// Whether the final message was received.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn note_final(&mut self, message: &SaveMessage) {
        if matches!(
            message,
            SaveMessage::Finished(_) | SaveMessage::Aborted | SaveMessage::Failed(_)
        ) {
            self.done = true;
        }
    }

    // ========================================================================
    // Thread side
    // ========================================================================

    fn thread_main(mut job: SaveJob, tx: &Sender<SaveMessage>, abort: &AtomicBool) -> SaveMessage {
        let total = job.frames.len();
        let mut metrics: BTreeMap<usize, FrameMetrics> = BTreeMap::new();

        if let Some(measurement) = job.measurement.take() {
            for i in 0..total {
                if abort.load(Ordering::SeqCst) {
                    return SaveMessage::Aborted;
                }
                let channels = match Self::channel_frames(&mut job, &measurement, i, tx) {
                    Ok(Some(channels)) => channels,
                    Ok(None) => return SaveMessage::Aborted,
                    Err(e) => return SaveMessage::Failed(e),
                };
                let frame_metrics =
                    measurement
                        .measurer
                        .measure_frame(i, &job.frames[i], &job.states[i], &channels, job.spacing);
                metrics.insert(i, frame_metrics);
                let _ = tx.send(SaveMessage::Progress { done: i + 1, total });
            }
        }
        if abort.load(Ordering::SeqCst) {
            return SaveMessage::Aborted;
        }

        let layout = &job.layout;
        let backup = match with_retry(tx, || archive_previous(&layout.acdc_output_path(), &layout.history_path())) {
            Ok(Some(backup)) => backup,
            Ok(None) => return SaveMessage::Aborted,
            Err(e) => return SaveMessage::Failed(e.to_string()),
        };
        let writes: [&dyn Fn() -> IoResult<()>; 3] = [
            &|| write_segmentation(&layout.segm_path(), &job.frames, job.is_3d),
            &|| write_table(&layout.acdc_output_path(), &job.tables, &metrics, &job.table_ctx),
            &|| {
                if job.segm_info.is_empty() {
                    Ok(())
                } else {
                    job.segm_info.save(&layout.segm_info_path())
                }
            },
        ];
        for write in writes {
            match with_retry(tx, write) {
                Ok(Some(())) => {}
                Ok(None) => return SaveMessage::Aborted,
                Err(e) => return SaveMessage::Failed(e.to_string()),
            }
        }
        let _ = tx.send(SaveMessage::Progress { done: total, total });

        SaveMessage::Finished(SaveOutcome {
            position: job.position,
            frames_written: total,
            segm_info: job.segm_info,
            backup,
        })
    }

    /// Channel images of frame `i` shaped like its labels.
    ///
    /// `Ok(None)` when the operator aborted a z-slice question.
    fn channel_frames(
        job: &mut SaveJob,
        measurement: &MeasurementJob,
        i: usize,
        tx: &Sender<SaveMessage>,
    ) -> Result<Option<Vec<ChannelFrame>>, String> {
        let depth = job.frames[i].len_of(Axis(0));
        let mut channels = Vec::with_capacity(measurement.channels.len());
        for (name, stack) in &measurement.channels {
            if i >= stack.len_of(Axis(0)) {
                log::error!("Channel '{}' has no frame {}", name, i);
                continue;
            }
            let frame = stack.index_axis(Axis(0), i);
            let size_z = frame.len_of(Axis(0));
            let image = if size_z == depth {
                frame.to_owned()
            } else if depth == 1 {
                let choice = match job.segm_info.get(name, i) {
                    Some(choice) => choice,
                    None => {
                        let request = PromptRequest::ZSlice {
                            position: job.table_ctx.position.clone(),
                            channel: name.clone(),
                            frame: i,
                            size_z,
                        };
                        let choice = match ask(tx, request)? {
                            PromptReply::Index(z) => ZSliceChoice {
                                z_slice: z.min(size_z - 1),
                                projection: ZProjection::SingleSlice,
                            },
                            PromptReply::Abort => return Ok(None),
                            _ => {
                                log::warn!("No z-slice chosen for '{}' frame {}, using max projection", name, i);
                                ZSliceChoice {
                                    z_slice: size_z / 2,
                                    projection: ZProjection::Max,
                                }
                            }
                        };
                        job.segm_info.set(name, i, choice);
                        choice
                    }
                };
                project(frame, choice)
            } else {
                log::error!(
                    "Channel '{}' has {} z-slices, labels have {} at frame {}",
                    name,
                    size_z,
                    depth,
                    i
                );
                continue;
            };
            channels.push(ChannelFrame {
                name: name.clone(),
                image,
            });
        }
        Ok(Some(channels))
    }
}

impl Drop for SaveWorker {
    fn drop(&mut self) {
        self.abort();
        self.rx.take();
        if let Some(handle) = self.thread_handle.take() {
            if let Err(e) = handle.join() {
                log::warn!("Save worker thread panicked: {:?}", e);
            }
        }
    }
}

/// Send a question to the main thread and wait for the answer.
fn ask(tx: &Sender<SaveMessage>, request: PromptRequest) -> Result<PromptReply, String> {
    let (reply_tx, reply_rx) = mpsc::channel();
    tx.send(SaveMessage::Prompt {
        request,
        reply: reply_tx,
    })
    .map_err(|_| "save cancelled".to_string())?;
    // A dropped reply sender means nobody will answer.
    Ok(reply_rx.recv().unwrap_or(PromptReply::Abort))
}

/// Run `write`, asking the operator to release a locked file and retrying.
///
/// `Ok(None)` when the operator gave up.
fn with_retry<T>(tx: &Sender<SaveMessage>, write: impl Fn() -> IoResult<T>) -> IoResult<Option<T>> {
    loop {
        match write() {
            Ok(value) => return Ok(Some(value)),
            Err(IoError::FileLocked(path)) => {
                log::warn!("{:?} is held open, waiting for the operator", path);
                let reply = ask(tx, PromptRequest::FileHeldOpen { path: path.clone() })
                    .map_err(|_| IoError::FileLocked(path))?;
                if reply != PromptReply::Retry {
                    return Ok(None);
                }
            }
            Err(e) => return Err(e),
        }
    }
}
