//! Per-frame z-slice choices (`<basename>_segmInfo.csv`).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{IoResult, write_atomic};

/// How a 3D channel is reduced to 2D for measurements against 2D labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ZProjection {
    /// A single z-slice
    #[default]
    #[serde(rename = "single z-slice")]
    SingleSlice,
    /// Maximum projection
    #[serde(rename = "max z-projection")]
    Max,
    /// Mean projection
    #[serde(rename = "mean z-projection")]
    Mean,
    /// Median projection
    #[serde(rename = "median z-proj.")]
    Median,
}

/// Z-slice choice for one channel at one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZSliceChoice {
    /// Slice index used when `projection` is `SingleSlice`
    pub z_slice: usize,
    /// Projection mode
    pub projection: ZProjection,
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmInfoRecord {
    filename: String,
    frame_i: usize,
    #[serde(rename = "z_slice_used_dataPrep")]
    z_slice_used: usize,
    which_z_proj: ZProjection,
}

/// Z-slice choices of a position keyed by `(channel, frame)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmInfo {
    entries: BTreeMap<(String, usize), ZSliceChoice>,
}

impl SegmInfo {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Choice for a channel at a frame.
    pub fn get(&self, channel: &str, frame: usize) -> Option<ZSliceChoice> {
        self.entries.get(&(channel.to_string(), frame)).copied()
    }

    /// Record a choice.
    pub fn set(&mut self, channel: &str, frame: usize, choice: ZSliceChoice) {
        self.entries.insert((channel.to_string(), frame), choice);
    }

    /// Number of recorded choices.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read the table; a missing file is an empty table.
    pub fn load(path: &Path) -> IoResult<Self> {
        let mut info = Self::new();
        if !path.exists() {
            return Ok(info);
        }
        let mut reader = csv::Reader::from_path(path)?;
        for record in reader.deserialize::<SegmInfoRecord>() {
            let record = record?;
            info.set(
                &record.filename,
                record.frame_i,
                ZSliceChoice {
                    z_slice: record.z_slice_used,
                    projection: record.which_z_proj,
                },
            );
        }
        log::debug!("Loaded {} z-slice choices from {:?}", info.len(), path);
        Ok(info)
    }

    /// Write the table atomically.
    pub fn save(&self, path: &Path) -> IoResult<()> {
        write_atomic(path, |w| {
            let mut writer = csv::Writer::from_writer(w);
            for ((channel, frame), choice) in &self.entries {
                writer.serialize(SegmInfoRecord {
                    filename: channel.clone(),
                    frame_i: *frame,
                    z_slice_used: choice.z_slice,
                    which_z_proj: choice.projection,
                })?;
            }
            writer.flush()?;
            Ok(())
        })
    }
}
