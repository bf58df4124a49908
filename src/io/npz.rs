//! Segmentation archives (`.npz`).
//!
//! The published segmentation holds a single array `(T, [Z,] Y, X)`.
//! Recovery archives hold one `frame_<i>` array per modified frame.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use acdc_labels::Labels;
use ndarray::{ArrayD, ArrayView, Axis, Dimension, IxDyn, stack};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError};

use super::{IoError, IoResult, write_atomic};

/// Read an array entry as `u32` labels, accepting the integer dtypes
/// segmentation tools commonly write. Negative values become background.
fn read_labels_entry<R: Read + Seek>(npz: &mut NpzReader<R>, name: &str) -> IoResult<ArrayD<u32>> {
    match npz.by_name::<ndarray::OwnedRepr<u32>, IxDyn>(name) {
        Ok(arr) => return Ok(arr),
        Err(ReadNpzError::Npy(_)) => {}
        Err(e) => return Err(e.into()),
    }
    if let Ok(arr) = npz.by_name::<ndarray::OwnedRepr<u16>, IxDyn>(name) {
        return Ok(arr.mapv(u32::from));
    }
    if let Ok(arr) = npz.by_name::<ndarray::OwnedRepr<u8>, IxDyn>(name) {
        return Ok(arr.mapv(u32::from));
    }
    if let Ok(arr) = npz.by_name::<ndarray::OwnedRepr<i32>, IxDyn>(name) {
        return Ok(arr.mapv(|v| u32::try_from(v).unwrap_or(0)));
    }
    if let Ok(arr) = npz.by_name::<ndarray::OwnedRepr<i64>, IxDyn>(name) {
        return Ok(arr.mapv(|v| u32::try_from(v).unwrap_or(0)));
    }
    let arr = npz.by_name::<ndarray::OwnedRepr<u64>, IxDyn>(name)?;
    Ok(arr.mapv(|v| u32::try_from(v).unwrap_or(0)))
}

/// Split a stored array into per-frame `(Z, Y, X)` label images.
///
/// Accepted shapes: `(Y, X)` and `(T, Y, X)` for 2D segmentations,
/// `(Z, Y, X)` (single frame) and `(T, Z, Y, X)` for 3D ones.
pub fn split_frames(path: &Path, arr: ArrayD<u32>, is_3d: bool, size_t: usize) -> IoResult<Vec<Labels>> {
    let shape = arr.shape().to_vec();
    log::debug!("Segmentation {:?}: array shape = {:?}", path, shape);
    let frames = match (shape.len(), is_3d) {
        (2, false) => vec![arr.into_shape_with_order((1, shape[0], shape[1]))?],
        (3, false) => arr
            .axis_iter(Axis(0))
            .map(|f| f.to_owned().into_shape_with_order((1, shape[1], shape[2])))
            .collect::<Result<Vec<_>, _>>()?,
        (3, true) if size_t <= 1 => vec![arr.into_shape_with_order((shape[0], shape[1], shape[2]))?],
        (4, true) => arr
            .axis_iter(Axis(0))
            .map(|f| f.to_owned().into_shape_with_order((shape[1], shape[2], shape[3])))
            .collect::<Result<Vec<_>, _>>()?,
        _ => {
            return Err(IoError::invalid_format(
                path,
                format!("unexpected segmentation shape {:?} (3D = {})", shape, is_3d),
            ));
        }
    };
    Ok(frames)
}

/// Read the published segmentation of a position.
pub fn read_segmentation(path: &Path, is_3d: bool, size_t: usize) -> IoResult<Vec<Labels>> {
    if !path.exists() {
        return Err(IoError::MissingFile(path.to_path_buf()));
    }
    let mut npz = NpzReader::new(File::open(path)?)?;
    let names = npz.names()?;
    let Some(first) = names.first() else {
        return Err(IoError::invalid_format(path, "archive contains no array"));
    };
    let arr = read_labels_entry(&mut npz, first)?;
    split_frames(path, arr, is_3d, size_t)
}

fn stack_frames(frames: &[Labels], is_3d: bool) -> IoResult<ArrayD<u32>> {
    if frames.is_empty() {
        return Ok(ArrayD::zeros(IxDyn(&[0])));
    }
    let stacked = if is_3d {
        let views: Vec<ArrayView<'_, u32, _>> = frames.iter().map(|f| f.view()).collect();
        stack(Axis(0), &views)?.into_dyn()
    } else {
        let views: Vec<_> = frames.iter().map(|f| f.index_axis(Axis(0), 0)).collect();
        stack(Axis(0), &views)?.into_dyn()
    };
    Ok(stacked)
}

/// Write the published segmentation `(T, [Z,] Y, X)` atomically.
pub fn write_segmentation(path: &Path, frames: &[Labels], is_3d: bool) -> IoResult<()> {
    let arr = stack_frames(frames, is_3d)?;
    write_atomic(path, |w| {
        let mut npz = NpzWriter::new_compressed(w);
        npz.add_array("arr_0", &arr)?;
        npz.finish()?;
        Ok(())
    })?;
    log::info!("Saved segmentation {:?} ({} frames)", path, frames.len());
    Ok(())
}

/// Read a recovery archive of `frame_<i>` arrays.
pub fn read_frame_archive(path: &Path) -> IoResult<BTreeMap<usize, Labels>> {
    let mut npz = NpzReader::new(File::open(path)?)?;
    let mut frames = BTreeMap::new();
    for name in npz.names()? {
        let stem = name.trim_end_matches(".npy");
        let Some(index) = stem.strip_prefix("frame_").and_then(|s| s.parse::<usize>().ok()) else {
            log::warn!("Ignoring unexpected entry '{}' in {:?}", name, path);
            continue;
        };
        let arr = read_labels_entry(&mut npz, &name)?;
        let dim = arr.raw_dim();
        if dim.ndim() != 3 {
            return Err(IoError::invalid_format(path, format!("frame {} has {} dims", index, dim.ndim())));
        }
        let shape = (dim[0], dim[1], dim[2]);
        frames.insert(index, arr.into_shape_with_order(shape)?);
    }
    Ok(frames)
}

/// Write a recovery archive of `frame_<i>` arrays atomically.
pub fn write_frame_archive(path: &Path, frames: &BTreeMap<usize, Labels>) -> IoResult<()> {
    write_atomic(path, |w| {
        let mut npz = NpzWriter::new_compressed(w);
        for (index, labels) in frames {
            npz.add_array(format!("frame_{}", index), labels)?;
        }
        npz.finish()?;
        Ok(())
    })
}
