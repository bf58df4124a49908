//! Registered custom annotation names (`<basename>_custom_annot_params.json`).

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{IoResult, write_atomic};

/// One registered annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomAnnotation {
    /// Column name in the annotation table
    pub name: String,
    /// Free-text description shown to the operator
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CustomAnnotationFile {
    #[serde(default)]
    annotations: Vec<CustomAnnotation>,
}

/// Read the registered annotations; a missing file means none.
pub fn load(path: &Path) -> IoResult<Vec<CustomAnnotation>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let json = std::fs::read_to_string(path)?;
    let file: CustomAnnotationFile = serde_json::from_str(&json)?;
    log::debug!("Loaded {} custom annotations from {:?}", file.annotations.len(), path);
    Ok(file.annotations)
}

/// Write the registered annotations atomically.
pub fn save(path: &Path, annotations: &[CustomAnnotation]) -> IoResult<()> {
    let file = CustomAnnotationFile {
        annotations: annotations.to_vec(),
    };
    write_atomic(path, |w| {
        serde_json::to_writer_pretty(w, &file)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pos_custom_annot_params.json");
        assert!(load(&path).unwrap().is_empty());

        let annotations = vec![CustomAnnotation {
            name: "elongated".to_string(),
            description: "abnormal shape".to_string(),
        }];
        save(&path, &annotations).unwrap();
        assert_eq!(load(&path).unwrap(), annotations);
    }
}
