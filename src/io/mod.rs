//! Reading and writing position files.
//!
//! Every writer goes through [`write_atomic`]: data is written to a sibling
//! temporary file that is renamed over the destination, so an interrupted
//! save never leaves a partially written file behind.

mod error;
pub mod custom_annot;
pub mod history;
pub mod images;
pub mod metadata;
pub mod npz;
pub mod segm_info;
pub mod table;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub use error::{IoError, IoResult};

/// Temporary sibling used while writing `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write a file through a temporary sibling and rename it into place.
///
/// A rename refused by the OS (file held open elsewhere) is reported as
/// [`IoError::FileLocked`] and the temporary file is removed.
pub fn write_atomic<F>(path: &Path, write: F) -> IoResult<()>
where
    F: FnOnce(&mut BufWriter<File>) -> IoResult<()>,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        if let Err(e) = write(&mut writer).and_then(|_| writer.flush().map_err(IoError::from)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(if e.kind() == std::io::ErrorKind::PermissionDenied {
            IoError::FileLocked(path.to_path_buf())
        } else {
            IoError::Io(e)
        });
    }
    log::trace!("Wrote {:?}", path);
    Ok(())
}

/// Parse a boolean cell (`True`/`False`, `true`/`false`, `1`/`0`).
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "True" | "true" | "TRUE" | "1" | "1.0" => Some(true),
        "False" | "false" | "FALSE" | "0" | "0.0" | "" => Some(false),
        _ => None,
    }
}

/// Format a boolean cell.
pub fn format_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

/// Parse an optional integer cell where negative values mean "unknown".
pub fn parse_opt_int(value: &str) -> Option<Option<i64>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Some(None);
    }
    let parsed = trimmed
        .parse::<i64>()
        .ok()
        .or_else(|| trimmed.parse::<f64>().ok().map(|f| f as i64))?;
    Some((parsed >= 0).then_some(parsed))
}

/// Format an optional integer cell, writing `-1` for `None`.
pub fn format_opt_int(value: Option<u64>) -> String {
    value.map_or_else(|| "-1".to_string(), |v| v.to_string())
}

/// Parse a float cell; empty cells are `NaN`.
pub fn parse_float(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        return Some(f64::NAN);
    }
    trimmed.parse().ok()
}

/// Format a float cell; `NaN` is written as an empty cell.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.csv");
        std::fs::write(&path, "old").unwrap();
        write_atomic(&path, |w| {
            w.write_all(b"new")?;
            Ok(())
        })
        .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_failed_write_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.csv");
        std::fs::write(&path, "old").unwrap();
        let result = write_atomic(&path, |_| Err(IoError::invalid_format("x", "boom")));
        assert!(result.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_cell_parsers() {
        assert_eq!(parse_bool("True"), Some(true));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_opt_int("-1"), Some(None));
        assert_eq!(parse_opt_int("4"), Some(Some(4)));
        assert_eq!(parse_opt_int("4.0"), Some(Some(4)));
        assert!(parse_float("").unwrap().is_nan());
        assert_eq!(format_float(f64::NAN), "");
        assert_eq!(format_opt_int(None), "-1");
    }
}
