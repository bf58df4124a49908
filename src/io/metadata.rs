//! Position metadata table (`<basename>_metadata.csv`).

use std::collections::BTreeMap;
use std::path::Path;

use acdc_labels::PhysicalSize;

use super::{IoError, IoResult, format_bool, parse_bool, write_atomic};

/// Dimensions, calibration and channels of a position.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionMetadata {
    /// Number of frames
    pub size_t: usize,
    /// Number of z-slices of the raw images
    pub size_z: usize,
    /// Image height
    pub size_y: usize,
    /// Image width
    pub size_x: usize,
    /// Whether labels are 3D per frame
    pub is_segm_3d: bool,
    /// Pixel/voxel calibration in µm
    pub physical_size: PhysicalSize,
    /// Seconds between frames
    pub time_increment: f64,
    /// Channel names in acquisition order
    pub channels: Vec<String>,
    /// The segmented channel
    pub user_channel: String,
}

impl PositionMetadata {
    /// Metadata for a 2D time-lapse with one channel (mainly for tests).
    pub fn new_2d(size_t: usize, size_y: usize, size_x: usize, channel: &str) -> Self {
        Self {
            size_t,
            size_z: 1,
            size_y,
            size_x,
            is_segm_3d: false,
            physical_size: PhysicalSize::default(),
            time_increment: 1.0,
            channels: vec![channel.to_string()],
            user_channel: channel.to_string(),
        }
    }

    /// Whether the position is a single time-point.
    pub fn is_snapshot(&self) -> bool {
        self.size_t <= 1
    }

    /// Shape of one label frame `(Z, Y, X)`.
    pub fn frame_shape(&self) -> (usize, usize, usize) {
        let z = if self.is_segm_3d { self.size_z } else { 1 };
        (z, self.size_y, self.size_x)
    }

    /// Read the two-column `Description,values` table.
    pub fn load(path: &Path) -> IoResult<Self> {
        if !path.exists() {
            return Err(IoError::MissingFile(path.to_path_buf()));
        }
        let mut reader = csv::Reader::from_path(path)?;
        let mut values: BTreeMap<String, String> = BTreeMap::new();
        for record in reader.records() {
            let record = record?;
            if let (Some(key), Some(value)) = (record.get(0), record.get(1)) {
                values.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        let usize_of = |key: &str, default: Option<usize>| -> IoResult<usize> {
            match values.get(key) {
                Some(v) => v
                    .parse::<f64>()
                    .map(|f| f as usize)
                    .map_err(|_| IoError::invalid_format(path, format!("{} = '{}' is not a number", key, v))),
                None => default.ok_or_else(|| IoError::invalid_format(path, format!("missing {}", key))),
            }
        };
        let f64_of = |key: &str, default: f64| -> f64 {
            values.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
        };

        let mut channels: Vec<(usize, String)> = values
            .iter()
            .filter_map(|(k, v)| {
                let index = k.strip_prefix("channel_")?.strip_suffix("_name")?.parse().ok()?;
                Some((index, v.clone()))
            })
            .collect();
        channels.sort();
        let channels: Vec<String> = channels.into_iter().map(|(_, name)| name).collect();
        let user_channel = values
            .get("userChannel")
            .cloned()
            .or_else(|| channels.first().cloned())
            .ok_or_else(|| IoError::invalid_format(path, "no channel defined"))?;

        Ok(Self {
            size_t: usize_of("SizeT", Some(1))?,
            size_z: usize_of("SizeZ", Some(1))?,
            size_y: usize_of("SizeY", None)?,
            size_x: usize_of("SizeX", None)?,
            is_segm_3d: values.get("isSegm3D").and_then(|v| parse_bool(v)).unwrap_or(false),
            physical_size: PhysicalSize::new(
                f64_of("PhysicalSizeX", 1.0),
                f64_of("PhysicalSizeY", 1.0),
                f64_of("PhysicalSizeZ", 1.0),
            ),
            time_increment: f64_of("TimeIncrement", 1.0),
            channels,
            user_channel,
        })
    }

    /// Write the table atomically.
    pub fn save(&self, path: &Path) -> IoResult<()> {
        write_atomic(path, |w| {
            let mut writer = csv::Writer::from_writer(w);
            writer.write_record(["Description", "values"])?;
            let mut rows: Vec<(String, String)> = vec![
                ("SizeT".into(), self.size_t.to_string()),
                ("SizeZ".into(), self.size_z.to_string()),
                ("SizeY".into(), self.size_y.to_string()),
                ("SizeX".into(), self.size_x.to_string()),
                ("isSegm3D".into(), format_bool(self.is_segm_3d).into()),
                ("PhysicalSizeX".into(), self.physical_size.x.to_string()),
                ("PhysicalSizeY".into(), self.physical_size.y.to_string()),
                ("PhysicalSizeZ".into(), self.physical_size.z.to_string()),
                ("TimeIncrement".into(), self.time_increment.to_string()),
            ];
            for (i, name) in self.channels.iter().enumerate() {
                rows.push((format!("channel_{}_name", i), name.clone()));
            }
            rows.push(("userChannel".into(), self.user_channel.clone()));
            for (key, value) in rows {
                writer.write_record([key, value])?;
            }
            writer.flush()?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pos_metadata.csv");
        let mut meta = PositionMetadata::new_2d(10, 64, 48, "phase");
        meta.channels.push("GFP".to_string());
        meta.physical_size = PhysicalSize::new(0.1, 0.1, 0.3);
        meta.time_increment = 180.0;
        meta.save(&path).unwrap();
        assert_eq!(PositionMetadata::load(&path).unwrap(), meta);
    }

    #[test]
    fn test_missing_size_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pos_metadata.csv");
        std::fs::write(&path, "Description,values\nSizeT,3\nchannel_0_name,phase\n").unwrap();
        assert!(matches!(
            PositionMetadata::load(&path),
            Err(IoError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_frame_shape() {
        let mut meta = PositionMetadata::new_2d(1, 8, 9, "phase");
        assert!(meta.is_snapshot());
        assert_eq!(meta.frame_shape(), (1, 8, 9));
        meta.size_z = 5;
        meta.is_segm_3d = true;
        assert_eq!(meta.frame_shape(), (5, 8, 9));
    }
}
