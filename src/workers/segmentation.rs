//! Segmentation model runs on a background thread.
//!
//! A task is either a whole frame or a rectangular region of it (ROI
//! segmentation). The worker crops the image, calls the model and runs
//! the output through the connected-component relabel, so every returned
//! object is a single component. Cancellation is checked before and after
//! every model call; a cancelled task produces no labels.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use acdc_labels::Labels;
use acdc_labels::components::relabel_multi_component;
use ndarray::{Array3, s};

/// Segmentation plug-in.
pub trait SegmentationModel: Send {
    /// Model name for logs.
    fn name(&self) -> &str;

    /// Optional one-time setup before the first frame.
    fn init(&mut self) -> Result<(), String> {
        Ok(())
    }

    /// Segment a `(Z, Y, X)` image into labels of the same shape.
    fn segment(&mut self, image: &Array3<f32>) -> Result<Labels, String>;
}

/// Rectangle `[y0, y1) x [x0, x1)` of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First row
    pub y0: usize,
    /// First column
    pub x0: usize,
    /// One past the last row
    pub y1: usize,
    /// One past the last column
    pub x1: usize,
}

impl Region {
    /// Clip to a `(height, width)` image; `None` when nothing is left.
    pub fn clip(&self, height: usize, width: usize) -> Option<Region> {
        let region = Region {
            y0: self.y0.min(height),
            x0: self.x0.min(width),
            y1: self.y1.min(height),
            x1: self.x1.min(width),
        };
        (region.y0 < region.y1 && region.x0 < region.x1).then_some(region)
    }
}

/// Work for the segmentation thread.
#[derive(Debug, Clone)]
pub struct SegmentationTask {
    /// Position index
    pub position: usize,
    /// Frame index
    pub frame: usize,
    /// Image `(Z, Y, X)` of the frame
    pub image: Array3<f32>,
    /// Only segment this region
    pub region: Option<Region>,
}

/// Labels produced for a task.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationResult {
    /// Position index
    pub position: usize,
    /// Frame index
    pub frame: usize,
    /// Region the labels cover (`None` = whole frame)
    pub region: Option<Region>,
    /// Labels shaped like the region
    pub labels: Labels,
}

/// Message from the segmentation thread.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentationMessage {
    /// A task finished
    Done(SegmentationResult),
    /// A task was cancelled before its result was ready
    Cancelled {
        /// Frame of the task
        frame: usize,
    },
    /// The model failed
    Error {
        /// Frame of the task
        frame: usize,
        /// Error reported by the model
        message: String,
    },
}

/// Handle of the segmentation thread.
pub struct SegmentationWorker {
    tx: Option<Sender<SegmentationTask>>,
    rx: Receiver<SegmentationMessage>,
    cancel: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl SegmentationWorker {
    /// Start a worker around `model`.
    pub fn spawn(mut model: Box<dyn SegmentationModel>) -> std::io::Result<Self> {
        let (tx, task_rx) = mpsc::channel::<SegmentationTask>();
        let (result_tx, rx) = mpsc::channel::<SegmentationMessage>();
        let cancel = Arc::new(AtomicBool::new(false));
        let thread_cancel = Arc::clone(&cancel);
        let thread_handle = thread::Builder::new()
            .name("segmentation".to_string())
            .spawn(move || {
                log::info!("Segmentation worker started with model '{}'", model.name());
                if let Err(e) = model.init() {
                    log::error!("Model '{}' failed to initialise: {}", model.name(), e);
                }
                for task in task_rx {
                    let message = Self::run_task(model.as_mut(), task, &thread_cancel);
                    if result_tx.send(message).is_err() {
                        break;
                    }
                }
                log::info!("Segmentation worker exiting");
            })?;
        Ok(Self {
            tx: Some(tx),
            rx,
            cancel,
            thread_handle: Some(thread_handle),
        })
    }

    /// Queue a task.
    pub fn submit(&self, task: SegmentationTask) -> bool {
        self.cancel.store(false, Ordering::SeqCst);
        self.tx.as_ref().is_some_and(|tx| tx.send(task).is_ok())
    }

    /// Cancel the running and queued tasks.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Finished tasks, without blocking.
    pub fn try_recv(&self) -> Option<SegmentationMessage> {
        self.rx.try_recv().ok()
    }

    /// Block until the next task finishes.
    pub fn recv(&self) -> Option<SegmentationMessage> {
        self.rx.recv().ok()
    }

    fn run_task(model: &mut dyn SegmentationModel, task: SegmentationTask, cancel: &AtomicBool) -> SegmentationMessage {
        let frame = task.frame;
        if cancel.load(Ordering::SeqCst) {
            return SegmentationMessage::Cancelled { frame };
        }
        let (_, height, width) = task.image.dim();
        let region = match task.region.map(|r| r.clip(height, width)) {
            Some(None) => {
                return SegmentationMessage::Error {
                    frame,
                    message: "region lies outside the image".to_string(),
                };
            }
            Some(region) => region,
            None => None,
        };
        let image = match region {
            Some(r) => task.image.slice(s![.., r.y0..r.y1, r.x0..r.x1]).to_owned(),
            None => task.image,
        };

        log::debug!("Segmenting frame {} ({:?}) with '{}'", frame, image.dim(), model.name());
        let mut labels = match model.segment(&image) {
            Ok(labels) => labels,
            Err(message) => return SegmentationMessage::Error { frame, message },
        };
        if cancel.load(Ordering::SeqCst) {
            return SegmentationMessage::Cancelled { frame };
        }
        if labels.dim() != image.dim() {
            return SegmentationMessage::Error {
                frame,
                message: format!("model returned {:?} for an image of {:?}", labels.dim(), image.dim()),
            };
        }
        let mut max_id = acdc_labels::max_id(&labels);
        let split = relabel_multi_component(&mut labels, &mut max_id);
        if !split.is_empty() {
            log::debug!("Split {} multi-component objects of the model output", split.len());
        }
        SegmentationMessage::Done(SegmentationResult {
            position: task.position,
            frame,
            region,
            labels,
        })
    }
}

impl Drop for SegmentationWorker {
    fn drop(&mut self) {
        self.cancel();
        self.tx.take();
        if let Some(handle) = self.thread_handle.take() {
            if let Err(e) = handle.join() {
                log::warn!("Segmentation thread panicked: {:?}", e);
            }
        }
    }
}

/// Model thresholding the image: pixels above `threshold` are foreground,
/// connected foreground becomes one object.
#[derive(Debug, Clone)]
pub struct ThresholdModel {
    /// Foreground threshold
    pub threshold: f32,
}

impl SegmentationModel for ThresholdModel {
    fn name(&self) -> &str {
        "threshold"
    }

    fn segment(&mut self, image: &Array3<f32>) -> Result<Labels, String> {
        let mask = image.mapv(|v| v > self.threshold);
        Ok(acdc_labels::components::label_components(&mask).0)
    }
}
