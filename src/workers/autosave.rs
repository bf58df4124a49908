//! Autosave of modified frames into `<position>/.recovery/`.
//!
//! After each committed edit the engine enqueues only the frames changed
//! since its previous request. The worker folds pending requests of a
//! position together and, once no new change arrived for the debounce delay,
//! merges them into the recovery set it already wrote for that position and
//! rewrites the whole set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use acdc_labels::Labels;
use web_time::Instant;

use crate::io::IoResult;
use crate::io::npz::write_frame_archive;
use crate::io::table::{TableContext, write_table};
use crate::model::AcdcTable;
use crate::position::PositionLayout;

/// Frames of one position changed since the previous request.
#[derive(Debug, Clone)]
pub struct AutosaveRequest {
    /// Position index in the engine
    pub position: usize,
    /// Where the recovery files go
    pub layout: PositionLayout,
    /// Labels of the changed frames
    pub frames: BTreeMap<usize, Labels>,
    /// Annotation rows of the same frames
    pub tables: BTreeMap<usize, AcdcTable>,
    /// Table metadata
    pub table_ctx: TableContext,
}

impl AutosaveRequest {
    /// Fold a newer request of the same position into this one.
    fn merge(&mut self, newer: AutosaveRequest) {
        for i in newer.frames.keys() {
            self.tables.remove(i);
        }
        self.frames.extend(newer.frames);
        self.tables.extend(newer.tables);
        self.layout = newer.layout;
        self.table_ctx = newer.table_ctx;
    }
}

/// Outcome of one recovery write.
#[derive(Debug, Clone, PartialEq)]
pub struct AutosaveReport {
    /// Position index
    pub position: usize,
    /// Frames written, or the error
    pub result: Result<usize, String>,
}

#[derive(Default)]
struct Queue {
    pending: BTreeMap<usize, AutosaveRequest>,
    /// Everything written so far, per position
    written: BTreeMap<usize, AutosaveRequest>,
    /// Positions discarded while their write was in flight
    discarded: BTreeSet<usize>,
    last_change: Option<Instant>,
    paused: bool,
    flush: bool,
    stop: bool,
    writing: Option<usize>,
}

type Shared = Arc<(Mutex<Queue>, Condvar)>;

fn lock(shared: &Shared) -> MutexGuard<'_, Queue> {
    shared.0.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle of the autosave thread.
pub struct AutosaveWorker {
    shared: Shared,
    reports: Receiver<AutosaveReport>,
    thread_handle: Option<JoinHandle<()>>,
}

impl AutosaveWorker {
    /// Start the worker with the given debounce delay.
    pub fn spawn(debounce: Duration) -> std::io::Result<Self> {
        let shared: Shared = Arc::new((Mutex::new(Queue::default()), Condvar::new()));
        let (tx, reports) = mpsc::channel();
        let thread_shared = Arc::clone(&shared);
        let thread_handle = thread::Builder::new()
            .name("autosave".to_string())
            .spawn(move || {
                log::info!("Autosave worker started (debounce {:?})", debounce);
                Self::thread_main(&thread_shared, debounce, &tx);
                log::info!("Autosave worker exiting");
            })?;
        Ok(Self {
            shared,
            reports,
            thread_handle: Some(thread_handle),
        })
    }

    /// Queue changed frames, folding them into an unwritten request of the
    /// same position.
    pub fn enqueue(&self, request: AutosaveRequest) {
        let mut queue = lock(&self.shared);
        match queue.pending.get_mut(&request.position) {
            Some(pending) => {
                log::trace!("Autosave: merged into a pending request");
                pending.merge(request);
            }
            None => {
                queue.pending.insert(request.position, request);
            }
        }
        queue.last_change = Some(Instant::now());
        self.shared.1.notify_all();
    }

    /// Stop writing until [`resume`](Self::resume); requests keep queueing.
    pub fn pause(&self) {
        lock(&self.shared).paused = true;
        log::debug!("Autosave paused");
    }

    /// Resume writing.
    pub fn resume(&self) {
        lock(&self.shared).paused = false;
        self.shared.1.notify_all();
        log::debug!("Autosave resumed");
    }

    /// Whether the worker is paused.
    pub fn is_paused(&self) -> bool {
        lock(&self.shared).paused
    }

    /// Number of positions with an unwritten snapshot.
    pub fn pending(&self) -> usize {
        lock(&self.shared).pending.len()
    }

    /// Forget the pending and written frames of a position (it was saved).
    pub fn discard(&self, position: usize) {
        let mut queue = lock(&self.shared);
        queue.pending.remove(&position);
        queue.written.remove(&position);
        if queue.writing == Some(position) {
            queue.discarded.insert(position);
        }
    }

    /// Write every pending snapshot now and wait until they are on disk.
    ///
    /// Returns immediately while paused.
    pub fn drain(&self) {
        let mut queue = lock(&self.shared);
        if queue.paused {
            return;
        }
        queue.flush = true;
        self.shared.1.notify_all();
        while !queue.pending.is_empty() || queue.writing.is_some() {
            queue = self.shared.1.wait(queue).unwrap_or_else(PoisonError::into_inner);
        }
        queue.flush = false;
    }

    /// Reports of finished writes.
    pub fn reports(&self) -> Vec<AutosaveReport> {
        self.reports.try_iter().collect()
    }

    fn thread_main(shared: &Shared, debounce: Duration, tx: &Sender<AutosaveReport>) {
        let cvar = &shared.1;
        let mut queue = lock(shared);
        loop {
            if queue.pending.is_empty() {
                if queue.stop {
                    break;
                }
                queue = cvar.wait(queue).unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            if queue.paused && !queue.stop {
                queue = cvar.wait(queue).unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            if !queue.flush && !queue.stop {
                let waited = queue.last_change.map(|t| t.elapsed()).unwrap_or(debounce);
                if waited < debounce {
                    queue = cvar
                        .wait_timeout(queue, debounce - waited)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                    continue;
                }
            }
            let Some((position, request)) = queue.pending.pop_first() else {
                continue;
            };
            let snapshot = match queue.written.remove(&position) {
                Some(mut written) => {
                    written.merge(request);
                    written
                }
                None => request,
            };
            queue.writing = Some(position);
            drop(queue);

            let result = write_recovery(&snapshot).map_err(|e| e.to_string());
            match &result {
                Ok(n) => log::debug!("Autosaved {} frames of position {}", n, position),
                Err(e) => log::error!("Autosave of position {} failed: {}", position, e),
            }
            let _ = tx.send(AutosaveReport { position, result });

            queue = lock(shared);
            if !queue.discarded.remove(&position) {
                queue.written.insert(position, snapshot);
            }
            queue.writing = None;
            cvar.notify_all();
        }
    }
}

impl Drop for AutosaveWorker {
    fn drop(&mut self) {
        log::debug!("Stopping autosave worker");
        {
            let mut queue = lock(&self.shared);
            queue.stop = true;
            self.shared.1.notify_all();
        }
        if let Some(handle) = self.thread_handle.take() {
            if let Err(e) = handle.join() {
                log::warn!("Autosave thread panicked: {:?}", e);
            }
        }
    }
}

/// Write the recovery segmentation and table of one snapshot.
pub fn write_recovery(request: &AutosaveRequest) -> IoResult<usize> {
    std::fs::create_dir_all(request.layout.recovery_dir())?;
    write_frame_archive(&request.layout.recovery_segm_path(), &request.frames)?;
    write_table(
        &request.layout.recovery_table_path(),
        &request.tables,
        &BTreeMap::new(),
        &request.table_ctx,
    )?;
    Ok(request.frames.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_state::FrameState;
    use crate::io::npz::read_frame_archive;
    use acdc_labels::PhysicalSize;

    fn request(dir: &std::path::Path, id: u32) -> AutosaveRequest {
        request_at(dir, 0, id)
    }

    fn request_at(dir: &std::path::Path, frame: usize, id: u32) -> AutosaveRequest {
        let mut labels = Labels::zeros((1, 3, 3));
        labels[[0, 1, 1]] = id;
        let state = FrameState::update(&labels, PhysicalSize::new(1.0, 1.0, 1.0), false);
        AutosaveRequest {
            position: 0,
            layout: PositionLayout::new(dir, "pos", ""),
            frames: BTreeMap::from([(frame, labels)]),
            tables: BTreeMap::from([(frame, AcdcTable::from_frame_state(&state, false))]),
            table_ctx: TableContext::default(),
        }
    }

    #[test]
    fn test_newer_snapshot_supersedes_older() {
        let dir = tempfile::tempdir().unwrap();
        let worker = AutosaveWorker::spawn(Duration::from_secs(3600)).unwrap();
        worker.enqueue(request(dir.path(), 1));
        worker.enqueue(request(dir.path(), 2));
        assert_eq!(worker.pending(), 1);
        worker.drain();
        assert_eq!(worker.pending(), 0);

        let layout = PositionLayout::new(dir.path(), "pos", "");
        let frames = read_frame_archive(&layout.recovery_segm_path()).unwrap();
        assert_eq!(frames[&0][[0, 1, 1]], 2);
        assert!(layout.recovery_table_path().exists());
        assert_eq!(worker.reports().len(), 1);
    }

    #[test]
    fn test_changed_frames_join_the_written_set() {
        let dir = tempfile::tempdir().unwrap();
        let layout = PositionLayout::new(dir.path(), "pos", "");
        let worker = AutosaveWorker::spawn(Duration::ZERO).unwrap();
        worker.enqueue(request_at(dir.path(), 0, 1));
        worker.drain();
        worker.enqueue(request_at(dir.path(), 2, 7));
        worker.drain();
        let frames = read_frame_archive(&layout.recovery_segm_path()).unwrap();
        assert_eq!(frames.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(frames[&0][[0, 1, 1]], 1);
        assert_eq!(frames[&2][[0, 1, 1]], 7);

        // After a save only later changes are recovered.
        worker.discard(0);
        worker.enqueue(request_at(dir.path(), 1, 3));
        worker.drain();
        let frames = read_frame_archive(&layout.recovery_segm_path()).unwrap();
        assert_eq!(frames.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_paused_worker_keeps_requests() {
        let dir = tempfile::tempdir().unwrap();
        let worker = AutosaveWorker::spawn(Duration::ZERO).unwrap();
        worker.pause();
        worker.enqueue(request(dir.path(), 1));
        worker.drain();
        assert!(worker.is_paused());
        assert_eq!(worker.pending(), 1);
        worker.resume();
        worker.drain();
        assert_eq!(worker.pending(), 0);
        assert!(PositionLayout::new(dir.path(), "pos", "").recovery_segm_path().exists());
    }

    #[test]
    fn test_drop_flushes_pending() {
        let dir = tempfile::tempdir().unwrap();
        {
            let worker = AutosaveWorker::spawn(Duration::from_secs(3600)).unwrap();
            worker.enqueue(request(dir.path(), 4));
        }
        assert!(PositionLayout::new(dir.path(), "pos", "").recovery_segm_path().exists());
    }
}
