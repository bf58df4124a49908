//! Annotation table (`<basename>_acdc_output<endname>.csv`).
//!
//! One row per object per frame, indexed by `(frame_i, time_seconds,
//! Cell_ID)`. Cell-cycle columns are written when any frame carries them;
//! frames without cell-cycle annotations leave those cells empty. Metric
//! columns follow, then the metadata columns.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use acdc_labels::CellId;

use super::{
    IoError, IoResult, format_bool, format_float, format_opt_int, parse_bool, parse_float, parse_opt_int,
    write_atomic,
};
use crate::constants::DEPRECATED_COLUMNS;
use crate::model::{AcdcTable, CcaRow, CcaTable, CellCycleStage, ObjectRow, Relationship};

/// Per-object metric values of one frame, keyed by column name.
pub type FrameMetrics = BTreeMap<CellId, BTreeMap<String, f64>>;

const INDEX_COLUMNS: [&str; 3] = ["frame_i", "time_seconds", "Cell_ID"];

const CCA_COLUMNS: [&str; 9] = [
    "cell_cycle_stage",
    "generation_num",
    "relative_ID",
    "relationship",
    "emerg_frame_i",
    "division_frame_i",
    "is_history_known",
    "corrected_assignment",
    "will_divide",
];

const META_COLUMNS: [&str; 2] = ["position", "segm_endname"];

/// Context written alongside the rows.
#[derive(Debug, Clone, Default)]
pub struct TableContext {
    /// Seconds between frames (`time_seconds = frame_i * time_increment`)
    pub time_increment: f64,
    /// Whether `z_centroid` is written
    pub is_3d: bool,
    /// Registered custom annotation names, one column each
    pub custom_annotations: Vec<String>,
    /// Position directory name
    pub position: String,
    /// Segmentation end name
    pub segm_endname: String,
}

fn annotation_columns(is_3d: bool) -> Vec<&'static str> {
    let mut columns = vec!["is_cell_dead", "is_cell_excluded", "x_centroid", "y_centroid"];
    if is_3d {
        columns.push("z_centroid");
    }
    columns.push("was_manually_edited");
    columns
}

fn cca_cells(row: Option<&CcaRow>) -> Vec<String> {
    let Some(row) = row else {
        return vec![String::new(); CCA_COLUMNS.len()];
    };
    vec![
        row.stage.as_str().to_string(),
        row.generation_num.to_string(),
        format_opt_int(row.relative_id.map(u64::from)),
        row.relationship.as_str().to_string(),
        format_opt_int(row.emerg_frame_i.map(|v| v as u64)),
        format_opt_int(row.division_frame_i.map(|v| v as u64)),
        format_bool(row.is_history_known).to_string(),
        format_bool(row.corrected_assignment).to_string(),
        u8::from(row.will_divide).to_string(),
    ]
}

/// Write the table atomically.
pub fn write_table(
    path: &Path,
    frames: &BTreeMap<usize, AcdcTable>,
    metrics: &BTreeMap<usize, FrameMetrics>,
    ctx: &TableContext,
) -> IoResult<()> {
    let with_cca = frames.values().any(AcdcTable::has_cca);
    let metric_names: BTreeSet<&str> = metrics
        .values()
        .flat_map(|frame| frame.values())
        .flat_map(|values| values.keys().map(String::as_str))
        .filter(|name| !DEPRECATED_COLUMNS.contains(name))
        .collect();

    let mut header: Vec<String> = INDEX_COLUMNS.iter().map(|c| c.to_string()).collect();
    header.extend(annotation_columns(ctx.is_3d).into_iter().map(String::from));
    if with_cca {
        header.extend(CCA_COLUMNS.iter().map(|c| c.to_string()));
    }
    header.extend(ctx.custom_annotations.iter().cloned());
    header.extend(metric_names.iter().map(|c| c.to_string()));
    header.extend(META_COLUMNS.iter().map(|c| c.to_string()));

    write_atomic(path, |w| {
        let mut writer = csv::Writer::from_writer(w);
        writer.write_record(&header)?;
        for (&frame_i, table) in frames {
            let frame_metrics = metrics.get(&frame_i);
            for (id, row) in table.rows() {
                let mut record = vec![
                    frame_i.to_string(),
                    format_float(frame_i as f64 * ctx.time_increment),
                    id.to_string(),
                    format_bool(row.is_cell_dead).to_string(),
                    format_bool(row.is_cell_excluded).to_string(),
                    format_float(row.x_centroid),
                    format_float(row.y_centroid),
                ];
                if ctx.is_3d {
                    record.push(format_float(row.z_centroid.unwrap_or(f64::NAN)));
                }
                record.push(format_bool(row.was_manually_edited).to_string());
                if with_cca {
                    record.extend(cca_cells(table.cca_row(id)));
                }
                for name in &ctx.custom_annotations {
                    record.push(u8::from(row.custom.contains(name)).to_string());
                }
                let values = frame_metrics.and_then(|m| m.get(&id));
                for name in &metric_names {
                    let value = values.and_then(|v| v.get(*name)).copied().unwrap_or(f64::NAN);
                    record.push(format_float(value));
                }
                record.push(ctx.position.clone());
                record.push(ctx.segm_endname.clone());
                writer.write_record(&record)?;
            }
        }
        writer.flush()?;
        Ok(())
    })?;
    log::info!("Saved annotation table {:?} ({} frames)", path, frames.len());
    Ok(())
}

/// Column positions resolved from the header.
struct Columns {
    index: BTreeMap<String, usize>,
}

impl Columns {
    fn new(headers: &csv::StringRecord) -> Self {
        Self {
            index: headers
                .iter()
                .enumerate()
                .map(|(i, name)| (name.trim().to_string(), i))
                .collect(),
        }
    }

    fn has(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn cell<'r>(&self, record: &'r csv::StringRecord, name: &str) -> Option<&'r str> {
        self.index.get(name).and_then(|&i| record.get(i))
    }
}

fn parse_cca(path: &Path, cols: &Columns, record: &csv::StringRecord) -> IoResult<Option<CcaRow>> {
    let stage = cols.cell(record, "cell_cycle_stage").unwrap_or("");
    if stage.trim().is_empty() {
        return Ok(None);
    }
    let bad = |column: &str| IoError::invalid_format(path, format!("bad value in column {}", column));
    let opt = |column: &str| -> IoResult<Option<i64>> {
        parse_opt_int(cols.cell(record, column).unwrap_or("")).ok_or_else(|| bad(column))
    };
    let flag = |column: &str| -> IoResult<bool> {
        parse_bool(cols.cell(record, column).unwrap_or("")).ok_or_else(|| bad(column))
    };
    Ok(Some(CcaRow {
        stage: CellCycleStage::parse(stage).ok_or_else(|| bad("cell_cycle_stage"))?,
        generation_num: opt("generation_num")?.unwrap_or(0) as u32,
        relative_id: opt("relative_ID")?.and_then(|v| CellId::try_from(v).ok()).filter(|&v| v > 0),
        relationship: Relationship::parse(cols.cell(record, "relationship").unwrap_or(""))
            .ok_or_else(|| bad("relationship"))?,
        emerg_frame_i: opt("emerg_frame_i")?.map(|v| v as usize),
        division_frame_i: opt("division_frame_i")?.map(|v| v as usize),
        is_history_known: flag("is_history_known")?,
        corrected_assignment: flag("corrected_assignment")?,
        will_divide: flag("will_divide")?,
    }))
}

/// Read the table into per-frame annotation tables.
///
/// Metric, metadata and deprecated columns are ignored; the columns named in
/// `custom_annotations` are read back into [`ObjectRow::custom`].
pub fn read_table(path: &Path, custom_annotations: &[String]) -> IoResult<BTreeMap<usize, AcdcTable>> {
    if !path.exists() {
        return Err(IoError::MissingFile(path.to_path_buf()));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let cols = Columns::new(reader.headers()?);
    for required in ["frame_i", "Cell_ID"] {
        if !cols.has(required) {
            return Err(IoError::invalid_format(path, format!("missing column {}", required)));
        }
    }
    let with_cca = cols.has("cell_cycle_stage");

    let mut rows: BTreeMap<usize, BTreeMap<CellId, ObjectRow>> = BTreeMap::new();
    let mut cca: BTreeMap<usize, CcaTable> = BTreeMap::new();
    for record in reader.records() {
        let record = record?;
        let int = |column: &str| -> IoResult<u64> {
            let value = cols.cell(&record, column).unwrap_or("").trim();
            value
                .parse::<u64>()
                .or_else(|_| value.parse::<f64>().map(|f| f as u64))
                .map_err(|_| IoError::invalid_format(path, format!("bad {} '{}'", column, value)))
        };
        let frame_i = int("frame_i")? as usize;
        let id = CellId::try_from(int("Cell_ID")?)
            .map_err(|_| IoError::invalid_format(path, "Cell_ID out of range"))?;
        let flag = |column: &str| cols.cell(&record, column).and_then(parse_bool).unwrap_or(false);
        let float = |column: &str| cols.cell(&record, column).and_then(parse_float).unwrap_or(f64::NAN);

        let row = ObjectRow {
            is_cell_dead: flag("is_cell_dead"),
            is_cell_excluded: flag("is_cell_excluded"),
            x_centroid: float("x_centroid"),
            y_centroid: float("y_centroid"),
            z_centroid: cols.has("z_centroid").then(|| float("z_centroid")),
            was_manually_edited: flag("was_manually_edited"),
            custom: custom_annotations
                .iter()
                .filter(|name| flag(name.as_str()))
                .cloned()
                .collect(),
        };
        rows.entry(frame_i).or_default().insert(id, row);

        if with_cca {
            if let Some(cca_row) = parse_cca(path, &cols, &record)? {
                cca.entry(frame_i).or_default().insert(id, cca_row);
            }
        }
    }

    let frames: BTreeMap<usize, AcdcTable> = rows
        .into_iter()
        .map(|(frame_i, rows)| {
            let mut table = AcdcTable::from_parts(rows, None);
            table.set_cca(cca.remove(&frame_i));
            (frame_i, table)
        })
        .collect();
    log::debug!("Loaded annotation table {:?} ({} frames)", path, frames.len());
    Ok(frames)
}
