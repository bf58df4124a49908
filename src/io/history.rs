//! Backups of previous annotation tables.
//!
//! Before the annotation CSV is overwritten, its current content is appended
//! to a sibling ZIP archive as `<ISO timestamp>.csv`.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::IoResult;

/// Entry name for a backup taken now.
pub fn timestamp_entry_name() -> String {
    format!("{}.csv", chrono::Local::now().format("%Y-%m-%dT%H-%M-%S%.6f"))
}

/// Append the current content of `table` to the archive.
///
/// Returns the entry name, or `None` when there is nothing to back up.
pub fn archive_previous(table: &Path, archive: &Path) -> IoResult<Option<String>> {
    if !table.exists() {
        return Ok(None);
    }
    let content = std::fs::read(table)?;
    let name = timestamp_entry_name();

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    if archive.exists() {
        let file = OpenOptions::new().read(true).write(true).open(archive)?;
        let mut zip = ZipWriter::new_append(file)?;
        zip.start_file(name.as_str(), options)?;
        zip.write_all(&content)?;
        zip.finish()?;
    } else {
        let file = std::fs::File::create(archive)?;
        let mut zip = ZipWriter::new(file);
        zip.start_file(name.as_str(), options)?;
        zip.write_all(&content)?;
        zip.finish()?;
    }
    log::debug!("Backed up {:?} into {:?} as {}", table, archive, name);
    Ok(Some(name))
}

/// Names of the archived tables, oldest first.
pub fn list_entries(archive: &Path) -> IoResult<Vec<String>> {
    if !archive.exists() {
        return Ok(Vec::new());
    }
    let zip = ZipArchive::new(std::fs::File::open(archive)?)?;
    let mut names: Vec<String> = zip.file_names().map(str::to_string).collect();
    names.sort();
    Ok(names)
}

/// Content of one archived table.
pub fn read_entry(archive: &Path, name: &str) -> IoResult<String> {
    let mut zip = ZipArchive::new(std::fs::File::open(archive)?)?;
    let mut entry = zip.by_name(name)?;
    let mut content = String::new();
    entry.read_to_string(&mut content)?;
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_keeps_every_version() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("pos_acdc_output.csv");
        let archive = dir.path().join("pos_acdc_output_history.zip");

        assert_eq!(archive_previous(&table, &archive).unwrap(), None);

        std::fs::write(&table, "v1").unwrap();
        let first = archive_previous(&table, &archive).unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        std::fs::write(&table, "v2").unwrap();
        let second = archive_previous(&table, &archive).unwrap().unwrap();

        let entries = list_entries(&archive).unwrap();
        assert_eq!(entries, vec![first.clone(), second.clone()]);
        assert_eq!(read_entry(&archive, &first).unwrap(), "v1");
        assert_eq!(read_entry(&archive, &second).unwrap(), "v2");
    }
}
