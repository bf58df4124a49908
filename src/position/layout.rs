//! File names of a position on disk.
//!
//! Every file of a position lives in `<position>/Images/` and starts with the
//! position basename; the segmentation end name selects one of several
//! parallel segmentations. Autosave artifacts go to `<position>/.recovery/`.

use std::path::{Path, PathBuf};

use crate::constants::{IMAGES_DIR, RECOVERY_DIR};
use crate::io::{IoError, IoResult};

/// Paths of one position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionLayout {
    /// Position directory
    pub dir: PathBuf,
    /// File name prefix shared by every file of the position
    pub basename: String,
    /// Suffix of the active segmentation (`""` for the default one)
    pub endname: String,
}

impl PositionLayout {
    /// Layout with explicit names.
    pub fn new(dir: impl Into<PathBuf>, basename: impl Into<String>, endname: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            basename: basename.into(),
            endname: endname.into(),
        }
    }

    /// Find the basename from `<basename>_metadata.csv` and pick the
    /// segmentation end name.
    ///
    /// Without an explicit end name the default segmentation is preferred,
    /// then the first existing one in name order.
    pub fn discover(dir: &Path, endname: Option<&str>) -> IoResult<Self> {
        let images = dir.join(IMAGES_DIR);
        let entries = std::fs::read_dir(&images).map_err(|_| IoError::MissingFile(images.clone()))?;
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();

        let basename = names
            .iter()
            .find_map(|n| n.strip_suffix("_metadata.csv"))
            .map(str::to_string)
            .ok_or_else(|| IoError::invalid_format(&images, "no *_metadata.csv file"))?;

        let endname = match endname {
            Some(e) => e.to_string(),
            None => {
                let prefix = format!("{}_segm", basename);
                let found: Vec<&str> = names
                    .iter()
                    .filter_map(|n| n.strip_prefix(prefix.as_str())?.strip_suffix(".npz"))
                    .collect();
                if found.contains(&"") {
                    String::new()
                } else {
                    found.first().map(|e| e.to_string()).unwrap_or_default()
                }
            }
        };
        log::debug!("Position {:?}: basename '{}', endname '{}'", dir, basename, endname);
        Ok(Self::new(dir, basename, endname))
    }

    /// Position directory name.
    pub fn position_name(&self) -> String {
        self.dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string()
    }

    /// `<position>/Images`
    pub fn images_dir(&self) -> PathBuf {
        self.dir.join(IMAGES_DIR)
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.images_dir().join(format!("{}_{}", self.basename, suffix))
    }

    /// Published segmentation.
    pub fn segm_path(&self) -> PathBuf {
        self.file(&format!("segm{}.npz", self.endname))
    }

    /// Annotation table.
    pub fn acdc_output_path(&self) -> PathBuf {
        self.file(&format!("acdc_output{}.csv", self.endname))
    }

    /// Archive of previous annotation tables.
    pub fn history_path(&self) -> PathBuf {
        self.file(&format!("acdc_output{}_history.zip", self.endname))
    }

    /// Position metadata.
    pub fn metadata_path(&self) -> PathBuf {
        self.file("metadata.csv")
    }

    /// Per-frame z-slice choices.
    pub fn segm_info_path(&self) -> PathBuf {
        self.file("segmInfo.csv")
    }

    /// User-defined metric formulas.
    pub fn combine_metrics_path(&self) -> PathBuf {
        self.file("combineMetrics.ini")
    }

    /// Registered custom annotation names.
    pub fn custom_annotations_path(&self) -> PathBuf {
        self.file("custom_annot_params.json")
    }

    /// `<position>/.recovery`
    pub fn recovery_dir(&self) -> PathBuf {
        self.dir.join(RECOVERY_DIR)
    }

    /// Autosaved segmentation frames.
    pub fn recovery_segm_path(&self) -> PathBuf {
        self.recovery_dir()
            .join(format!("{}_segm{}.npz", self.basename, self.endname))
    }

    /// Autosaved annotation rows.
    pub fn recovery_table_path(&self) -> PathBuf {
        self.recovery_dir()
            .join(format!("{}_acdc_output{}.csv", self.basename, self.endname))
    }

    /// Whether autosave artifacts exist that are newer than the published files.
    pub fn has_newer_recovery(&self) -> bool {
        let modified = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified()).ok();
        let Some(recovered) = modified(&self.recovery_segm_path()) else {
            return false;
        };
        let published = [self.segm_path(), self.acdc_output_path()]
            .iter()
            .filter_map(|p| modified(p))
            .max();
        published.is_none_or(|p| recovered > p)
    }

    /// Remove autosave artifacts (after a successful save).
    pub fn clear_recovery(&self) -> IoResult<()> {
        for path in [self.recovery_segm_path(), self.recovery_table_path()] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let layout = PositionLayout::new("/data/Position_1", "exp_s01", "_v2");
        assert_eq!(
            layout.segm_path(),
            PathBuf::from("/data/Position_1/Images/exp_s01_segm_v2.npz")
        );
        assert_eq!(
            layout.acdc_output_path().file_name().unwrap(),
            "exp_s01_acdc_output_v2.csv"
        );
        assert_eq!(layout.position_name(), "Position_1");
        assert!(layout.recovery_dir().ends_with(".recovery"));
    }

    #[test]
    fn test_discover_prefers_default_segmentation() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join(IMAGES_DIR);
        std::fs::create_dir_all(&images).unwrap();
        for name in ["pos_metadata.csv", "pos_segm_v2.npz", "pos_segm.npz"] {
            std::fs::write(images.join(name), b"").unwrap();
        }
        let layout = PositionLayout::discover(dir.path(), None).unwrap();
        assert_eq!(layout.basename, "pos");
        assert_eq!(layout.endname, "");

        let explicit = PositionLayout::discover(dir.path(), Some("_v2")).unwrap();
        assert_eq!(explicit.endname, "_v2");
    }

    #[test]
    fn test_discover_without_metadata() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(IMAGES_DIR)).unwrap();
        assert!(PositionLayout::discover(dir.path(), None).is_err());
    }

    #[test]
    fn test_recovery_newer_than_missing_published() {
        let dir = tempfile::tempdir().unwrap();
        let layout = PositionLayout::new(dir.path(), "pos", "");
        assert!(!layout.has_newer_recovery());
        std::fs::create_dir_all(layout.recovery_dir()).unwrap();
        std::fs::write(layout.recovery_segm_path(), b"x").unwrap();
        assert!(layout.has_newer_recovery());
        layout.clear_recovery().unwrap();
        assert!(!layout.has_newer_recovery());
    }
}
