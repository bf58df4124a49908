//! Trait-based loading of channel rasters from `Images/`.
//!
//! Each file format implements [`ChannelLoader`]; the
//! [`ChannelLoaderRegistry`] picks the loader by file extension.
//!
//! ## Supported Formats
//!
//! - **NumPy archives**: `.npz` whose first array is `(T, [Z,] Y, X)`
//! - **NumPy arrays**: `.npy` with the same shapes
//! - **Rasters**: `.tif`/`.tiff`/`.png`, a single 2D frame
//!
//! Intensities are kept in their raw units (no normalisation) since they
//! feed measurements.

use std::fs::File;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use ndarray::{Array2, Array4, ArrayD, IxDyn};
use ndarray_npy::{NpzReader, ReadNpyExt};

use super::{IoError, IoResult};

/// A channel stack `(T, Z, Y, X)` of raw intensities.
pub type ChannelStack = Array4<f32>;

/// Expected stack dimensions, used to disambiguate 3D arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackDims {
    /// Number of frames
    pub size_t: usize,
    /// Number of z-slices
    pub size_z: usize,
}

/// Reshape a loaded array into `(T, Z, Y, X)`.
pub fn to_stack(path: &Path, arr: ArrayD<f32>, dims: StackDims) -> IoResult<ChannelStack> {
    let shape = arr.shape().to_vec();
    let target = match shape.len() {
        2 => (1, 1, shape[0], shape[1]),
        3 if dims.size_z > 1 && dims.size_t <= 1 => (1, shape[0], shape[1], shape[2]),
        3 => (shape[0], 1, shape[1], shape[2]),
        4 => (shape[0], shape[1], shape[2], shape[3]),
        _ => {
            return Err(IoError::invalid_format(
                path,
                format!("unexpected channel shape {:?}", shape),
            ));
        }
    };
    Ok(arr.into_shape_with_order(target)?)
}

/// Trait for channel file loaders.
pub trait ChannelLoader: Send + Sync {
    /// Unique identifier for this loader.
    fn id(&self) -> &'static str;

    /// File extensions this loader handles (lowercase, without dots).
    fn extensions(&self) -> &'static [&'static str];

    /// Load a channel stack from a file.
    fn load(&self, path: &Path, dims: StackDims) -> IoResult<ChannelStack>;
}

/// Loader for NumPy `.npz` archives.
pub struct NpzChannelLoader;

impl ChannelLoader for NpzChannelLoader {
    fn id(&self) -> &'static str {
        "npz"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["npz"]
    }

    fn load(&self, path: &Path, dims: StackDims) -> IoResult<ChannelStack> {
        let mut npz = NpzReader::new(File::open(path)?)?;
        let names = npz.names()?;
        let Some(name) = names.first() else {
            return Err(IoError::invalid_format(path, "archive contains no array"));
        };
        let arr = if let Ok(a) = npz.by_name::<ndarray::OwnedRepr<f32>, IxDyn>(name) {
            a
        } else if let Ok(a) = npz.by_name::<ndarray::OwnedRepr<u16>, IxDyn>(name) {
            a.mapv(f32::from)
        } else if let Ok(a) = npz.by_name::<ndarray::OwnedRepr<u8>, IxDyn>(name) {
            a.mapv(f32::from)
        } else {
            npz.by_name::<ndarray::OwnedRepr<f64>, IxDyn>(name)?
                .mapv(|v| v as f32)
        };
        to_stack(path, arr, dims)
    }
}

/// Loader for NumPy `.npy` files.
pub struct NpyChannelLoader;

impl ChannelLoader for NpyChannelLoader {
    fn id(&self) -> &'static str {
        "npy"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["npy"]
    }

    fn load(&self, path: &Path, dims: StackDims) -> IoResult<ChannelStack> {
        let arr = if let Ok(a) = ArrayD::<f32>::read_npy(File::open(path)?) {
            a
        } else if let Ok(a) = ArrayD::<u16>::read_npy(File::open(path)?) {
            a.mapv(f32::from)
        } else if let Ok(a) = ArrayD::<u8>::read_npy(File::open(path)?) {
            a.mapv(f32::from)
        } else {
            ArrayD::<f64>::read_npy(File::open(path)?)
                .map_err(|e| IoError::invalid_format(path, e.to_string()))?
                .mapv(|v| v as f32)
        };
        to_stack(path, arr, dims)
    }
}

/// Loader for single-frame rasters decoded with `image`.
pub struct RasterChannelLoader;

impl RasterChannelLoader {
    fn to_array(img: DynamicImage) -> Array2<f32> {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let values: Vec<f32> = match img {
            DynamicImage::ImageLuma8(buf) => buf.pixels().map(|p| f32::from(p.0[0])).collect(),
            DynamicImage::ImageLuma16(buf) => buf.pixels().map(|p| f32::from(p.0[0])).collect(),
            other => other.to_luma32f().pixels().map(|p| p.0[0]).collect(),
        };
        Array2::from_shape_vec((h, w), values).unwrap_or_else(|_| Array2::zeros((h, w)))
    }
}

impl ChannelLoader for RasterChannelLoader {
    fn id(&self) -> &'static str {
        "raster"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["tif", "tiff", "png"]
    }

    fn load(&self, path: &Path, dims: StackDims) -> IoResult<ChannelStack> {
        let img = image::open(path)?;
        let frame = Self::to_array(img);
        log::trace!("RasterChannelLoader: loaded {:?} {:?}", path, frame.dim());
        to_stack(path, frame.into_dyn(), dims)
    }
}

/// Registry of available channel loaders.
pub struct ChannelLoaderRegistry {
    loaders: Vec<Box<dyn ChannelLoader>>,
}

impl ChannelLoaderRegistry {
    /// Create a registry with all built-in loaders.
    pub fn new() -> Self {
        let mut registry = Self { loaders: Vec::new() };
        registry.register(Box::new(NpzChannelLoader));
        registry.register(Box::new(NpyChannelLoader));
        registry.register(Box::new(RasterChannelLoader));
        registry
    }

    /// Register a new loader.
    pub fn register(&mut self, loader: Box<dyn ChannelLoader>) {
        self.loaders.push(loader);
    }

    /// Get all supported file extensions.
    pub fn supported_extensions(&self) -> Vec<&'static str> {
        let mut extensions: Vec<&'static str> = self
            .loaders
            .iter()
            .flat_map(|l| l.extensions().iter().copied())
            .collect();
        extensions.sort();
        extensions.dedup();
        extensions
    }

    /// Find the file holding `<basename>_<channel>` in `images_dir`.
    pub fn find_channel_file(&self, images_dir: &Path, basename: &str, channel: &str) -> Option<PathBuf> {
        self.supported_extensions()
            .into_iter()
            .map(|ext| images_dir.join(format!("{}_{}.{}", basename, channel, ext)))
            .find(|p| p.exists())
    }

    /// Load a channel file with the loader matching its extension.
    pub fn load(&self, path: &Path, dims: StackDims) -> IoResult<ChannelStack> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        let loader = self
            .loaders
            .iter()
            .find(|l| l.extensions().contains(&ext.as_str()))
            .ok_or_else(|| IoError::invalid_format(path, format!("no loader for '.{}'", ext)))?;
        let stack = loader.load(path, dims)?;
        log::debug!("Loaded channel {:?} with {} loader: {:?}", path, loader.id(), stack.dim());
        Ok(stack)
    }
}

impl Default for ChannelLoaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use ndarray_npy::{NpzWriter, WriteNpyExt};

    const DIMS: StackDims = StackDims { size_t: 2, size_z: 1 };

    #[test]
    fn test_supported_extensions() {
        let registry = ChannelLoaderRegistry::new();
        let extensions = registry.supported_extensions();
        assert!(extensions.contains(&"npz"));
        assert!(extensions.contains(&"tif"));
    }

    #[test]
    fn test_npz_u16_stack() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pos_GFP.npz");
        let mut arr = Array3::<u16>::zeros((2, 3, 4));
        arr[[1, 2, 3]] = 500;
        let mut npz = NpzWriter::new(File::create(&path).unwrap());
        npz.add_array("arr_0", &arr).unwrap();
        npz.finish().unwrap();

        let registry = ChannelLoaderRegistry::new();
        let stack = registry.load(&path, DIMS).unwrap();
        assert_eq!(stack.dim(), (2, 1, 3, 4));
        assert_eq!(stack[[1, 0, 2, 3]], 500.0);
    }

    #[test]
    fn test_npy_snapshot_zstack() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pos_phase.npy");
        let arr = Array3::<f32>::from_elem((5, 3, 4), 2.5);
        arr.write_npy(File::create(&path).unwrap()).unwrap();
        let stack = NpyChannelLoader
            .load(&path, StackDims { size_t: 1, size_z: 5 })
            .unwrap();
        assert_eq!(stack.dim(), (1, 5, 3, 4));
    }

    #[test]
    fn test_find_channel_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pos_GFP.npz"), b"").unwrap();
        let registry = ChannelLoaderRegistry::new();
        assert!(registry.find_channel_file(dir.path(), "pos", "GFP").is_some());
        assert!(registry.find_channel_file(dir.path(), "pos", "mCherry").is_none());
    }
}
