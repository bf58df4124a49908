//! Background decoding of the on-disk segmentation.
//!
//! The loader thread decodes the segmentation archive, reports a header
//! (frame count, largest ID, last non-empty frame) and then hands the frames
//! over in chunks through a bounded channel. The main thread blocks on
//! [`ChunkLoader::recv`] when it needs a frame that has not arrived yet.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use acdc_labels::{CellId, Labels};

use crate::io::npz::read_segmentation;

/// Summary sent before the first chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentationHeader {
    /// Number of frames in the archive
    pub n_frames: usize,
    /// Largest ID over all frames
    pub max_id: CellId,
    /// Last frame with at least one object
    pub last_nonempty: Option<usize>,
}

/// Message from the loader thread.
#[derive(Debug)]
pub enum ChunkMessage {
    /// Archive decoded
    Header(SegmentationHeader),
    /// Consecutive frames starting at `start`
    Chunk {
        /// Index of the first frame of the chunk
        start: usize,
        /// Frames of the chunk
        frames: Vec<Labels>,
    },
    /// Decoding failed
    Error(String),
}

/// Handle of the loader thread.
pub struct ChunkLoader {
    /// Receiver for chunks; dropped before joining so a blocked sender exits
    rx: Option<Receiver<ChunkMessage>>,
    /// Handle to the background thread
    thread_handle: Option<JoinHandle<()>>,
}

impl ChunkLoader {
    /// Spawn the loader for a segmentation archive.
    pub fn spawn(path: PathBuf, is_3d: bool, size_t: usize, chunk_size: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<ChunkMessage>(2);
        let chunk_size = chunk_size.max(1);
        let thread_handle = thread::Builder::new()
            .name("segm-chunk-loader".to_string())
            .spawn(move || {
                log::info!("Chunk loader started for {:?}", path);
                Self::thread_main(path, is_3d, size_t, chunk_size, tx);
                log::info!("Chunk loader exiting");
            })?;
        Ok(Self {
            rx: Some(rx),
            thread_handle: Some(thread_handle),
        })
    }

    fn thread_main(path: PathBuf, is_3d: bool, size_t: usize, chunk_size: usize, tx: SyncSender<ChunkMessage>) {
        let frames = match read_segmentation(&path, is_3d, size_t) {
            Ok(frames) => frames,
            Err(e) => {
                log::error!("Failed to decode {:?}: {}", path, e);
                let _ = tx.send(ChunkMessage::Error(e.to_string()));
                return;
            }
        };
        let header = SegmentationHeader {
            n_frames: frames.len(),
            max_id: frames.iter().map(acdc_labels::max_id).max().unwrap_or(0),
            last_nonempty: frames.iter().rposition(|f| f.iter().any(|&v| v > 0)),
        };
        if tx.send(ChunkMessage::Header(header)).is_err() {
            return;
        }
        let mut frames = frames.into_iter();
        let mut start = 0;
        loop {
            let chunk: Vec<Labels> = frames.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            let len = chunk.len();
            log::trace!("Handing over frames {}..{}", start, start + len);
            if tx.send(ChunkMessage::Chunk { start, frames: chunk }).is_err() {
                log::debug!("Chunk receiver dropped, loader exiting");
                return;
            }
            start += len;
        }
    }

    /// Block until the next message; `None` once the loader has finished.
    pub fn recv(&mut self) -> Option<ChunkMessage> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl Drop for ChunkLoader {
    fn drop(&mut self) {
        log::debug!("Shutting down chunk loader");
        self.rx.take();
        if let Some(handle) = self.thread_handle.take() {
            if let Err(e) = handle.join() {
                log::warn!("Chunk loader thread panicked: {:?}", e);
            }
        }
    }
}
