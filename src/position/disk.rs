//! On-disk segmentation held in memory as it arrives from the chunk loader.

use std::collections::BTreeSet;
use std::path::PathBuf;

use acdc_labels::{CellId, Labels};

use crate::io::{IoError, IoResult};
use crate::workers::chunk_loader::{ChunkLoader, ChunkMessage};

/// Frames of the published segmentation.
///
/// Frames changed in memory (propagation to unvisited frames, recovery) are
/// tracked as dirty so that saves and autosaves pick them up.
pub struct DiskSegmentation {
    frames: Vec<Option<Labels>>,
    received: usize,
    loader: Option<ChunkLoader>,
    present: bool,
    max_id: CellId,
    last_nonempty: Option<usize>,
    dirty: BTreeSet<usize>,
}

impl DiskSegmentation {
    /// No segmentation on disk.
    pub fn empty(size_t: usize) -> Self {
        Self {
            frames: vec![None; size_t],
            received: size_t,
            loader: None,
            present: false,
            max_id: 0,
            last_nonempty: None,
            dirty: BTreeSet::new(),
        }
    }

    /// Segmentation already in memory.
    pub fn from_frames(frames: Vec<Labels>) -> Self {
        let max_id = frames.iter().map(acdc_labels::max_id).max().unwrap_or(0);
        let last_nonempty = frames.iter().rposition(|f| f.iter().any(|&v| v > 0));
        let n = frames.len();
        Self {
            frames: frames.into_iter().map(Some).collect(),
            received: n,
            loader: None,
            present: true,
            max_id,
            last_nonempty,
            dirty: BTreeSet::new(),
        }
    }

    /// Start decoding `path` in the background and wait for its header.
    pub fn spawn(path: PathBuf, is_3d: bool, size_t: usize, chunk_size: usize) -> IoResult<Self> {
        let mut loader = ChunkLoader::spawn(path.clone(), is_3d, size_t, chunk_size)?;
        let header = match loader.recv() {
            Some(ChunkMessage::Header(header)) => header,
            Some(ChunkMessage::Error(message)) => return Err(IoError::invalid_format(path, message)),
            _ => return Err(IoError::invalid_format(path, "segmentation loader stopped early")),
        };
        if header.n_frames != size_t {
            log::warn!(
                "Segmentation {:?} has {} frames, metadata says {}",
                path,
                header.n_frames,
                size_t
            );
        }
        Ok(Self {
            frames: vec![None; size_t.max(header.n_frames)],
            received: 0,
            loader: Some(loader),
            present: true,
            max_id: header.max_id,
            last_nonempty: header.last_nonempty,
            dirty: BTreeSet::new(),
        })
    }

    /// Whether a segmentation exists on disk.
    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Largest ID over all frames at load time.
    pub fn max_id(&self) -> CellId {
        self.max_id
    }

    /// Last frame with objects at load time.
    pub fn last_nonempty(&self) -> Option<usize> {
        self.last_nonempty
    }

    /// Number of frame slots.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether there are no frame slots.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Whether frame `i` has already been handed over.
    pub fn is_loaded(&self, i: usize) -> bool {
        i < self.received
    }

    /// Block until frame `i` has arrived (or the loader has finished).
    fn ensure(&mut self, i: usize) -> IoResult<()> {
        while i >= self.received {
            let Some(loader) = self.loader.as_mut() else {
                break;
            };
            match loader.recv() {
                Some(ChunkMessage::Chunk { start, frames }) => {
                    let len = frames.len();
                    for (offset, frame) in frames.into_iter().enumerate() {
                        let index = start + offset;
                        if index < self.frames.len() && self.frames[index].is_none() {
                            self.frames[index] = Some(frame);
                        }
                    }
                    self.received = self.received.max(start + len);
                }
                Some(ChunkMessage::Error(message)) => {
                    self.loader = None;
                    return Err(IoError::invalid_format("segmentation", message));
                }
                Some(ChunkMessage::Header(_)) => {}
                None => {
                    self.loader = None;
                    self.received = self.frames.len();
                }
            }
        }
        Ok(())
    }

    /// Frame `i`, waiting for its chunk if needed.
    pub fn get(&mut self, i: usize) -> IoResult<Option<&Labels>> {
        self.ensure(i)?;
        Ok(self.frames.get(i).and_then(Option::as_ref))
    }

    /// Mutable frame `i`; the frame is marked dirty.
    pub fn get_mut(&mut self, i: usize) -> IoResult<Option<&mut Labels>> {
        self.ensure(i)?;
        let frame = self.frames.get_mut(i).and_then(Option::as_mut);
        if frame.is_some() {
            self.dirty.insert(i);
        }
        Ok(frame)
    }

    /// Replace frame `i` (recovery overlay); the frame is marked dirty.
    pub fn set(&mut self, i: usize, labels: Labels) -> IoResult<()> {
        self.ensure(i)?;
        if i >= self.frames.len() {
            self.frames.resize(i + 1, None);
        }
        self.max_id = self.max_id.max(acdc_labels::max_id(&labels));
        self.frames[i] = Some(labels);
        self.present = true;
        self.dirty.insert(i);
        Ok(())
    }

    /// Wait for every frame.
    pub fn load_all(&mut self) -> IoResult<()> {
        if let Some(last) = self.frames.len().checked_sub(1) {
            self.ensure(last)?;
        }
        Ok(())
    }

    /// Frames already in memory.
    pub fn loaded_mut(&mut self) -> impl Iterator<Item = (usize, &mut Labels)> + '_ {
        let received = self.received;
        self.frames
            .iter_mut()
            .enumerate()
            .take(received)
            .filter_map(|(i, f)| f.as_mut().map(|f| (i, f)))
    }

    /// Frames changed in memory since the last save.
    pub fn dirty(&self) -> &BTreeSet<usize> {
        &self.dirty
    }

    /// Forget the dirty marks (after a save).
    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::npz::write_segmentation;

    fn frame(v: CellId) -> Labels {
        let mut f = Labels::zeros((1, 2, 2));
        f[[0, 0, 0]] = v;
        f
    }

    #[test]
    fn test_lazy_frames_block_until_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pos_segm.npz");
        let frames: Vec<Labels> = (1..=5).map(frame).collect();
        write_segmentation(&path, &frames, false).unwrap();

        let mut disk = DiskSegmentation::spawn(path, false, 5, 2).unwrap();
        assert_eq!(disk.max_id(), 5);
        assert_eq!(disk.last_nonempty(), Some(4));
        assert_eq!(disk.get(3).unwrap(), Some(&frame(4)));
        assert!(disk.is_loaded(3));
        disk.load_all().unwrap();
        assert_eq!(disk.loaded_mut().count(), 5);
    }

    #[test]
    fn test_get_mut_marks_dirty() {
        let mut disk = DiskSegmentation::from_frames(vec![frame(1), frame(2)]);
        disk.get_mut(1).unwrap().unwrap()[[0, 1, 1]] = 2;
        assert_eq!(disk.dirty(), &BTreeSet::from([1]));
        disk.clear_dirty();
        assert!(disk.dirty().is_empty());
    }

    #[test]
    fn test_empty_has_no_frames() {
        let mut disk = DiskSegmentation::empty(3);
        assert!(!disk.is_present());
        assert_eq!(disk.get(2).unwrap(), None);
        assert_eq!(disk.get(7).unwrap(), None);
    }
}
