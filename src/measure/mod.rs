//! Per-object measurements computed when saving.
//!
//! For every object and every requested channel the standard intensity
//! metrics are computed against the channel's automatic background (the
//! median of all background pixels of the frame). Size metrics, custom
//! metric plug-ins and combine-metric expressions follow, in that order,
//! so that later stages can read the columns of earlier ones.
//!
//! Measurements fail soft: a metric that cannot be computed is logged and
//! left as `NaN`, the save carries on.

pub mod combine;
mod standard;

pub use combine::{CombineMetric, Expr};
pub use standard::{StandardMetric, median, quantile};

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use acdc_labels::{Labels, PhysicalSize, RegionProps};
use ndarray::{Array3, ArrayView3, Axis};
use rayon::prelude::*;

use crate::error::Result;
use crate::frame_state::FrameState;
use crate::io::segm_info::{ZProjection, ZSliceChoice};
use crate::io::table::FrameMetrics;

/// Size columns written when size metrics are enabled.
pub const SIZE_COLUMNS: [&str; 4] = ["cell_area_pxl", "cell_area_um2", "cell_vol_vox", "cell_vol_fl"];

// ============================================================================
// Schema
// ============================================================================

/// Which columns to compute.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeasurementSchema {
    /// Channels to measure
    pub channels: Vec<String>,
    /// Intensity metrics per channel
    pub standard: Vec<StandardMetric>,
    /// Whether to write the size columns
    pub size_metrics: bool,
    /// User-defined expressions over the other columns
    pub combine: Vec<CombineMetric>,
}

impl MeasurementSchema {
    /// Every standard metric for `channels`, with size metrics.
    pub fn all_for(channels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            standard: StandardMetric::all().to_vec(),
            size_metrics: true,
            combine: Vec::new(),
        }
    }

    /// Add the expressions of a combine-metrics file, if it exists.
    pub fn load_combine(&mut self, path: &Path) -> Result<()> {
        let text = combine::load(path)?;
        let metrics = combine::parse_ini(&text)?;
        if !metrics.is_empty() {
            log::info!("Loaded {} combine metrics from {:?}", metrics.len(), path);
        }
        self.combine.extend(metrics);
        Ok(())
    }

    /// Whether any intensity metric is requested.
    pub fn needs_channels(&self) -> bool {
        !self.channels.is_empty() && !self.standard.is_empty()
    }

    /// Column names in output order (custom plug-in columns excluded).
    pub fn columns(&self) -> Vec<String> {
        let mut columns = Vec::new();
        for channel in &self.channels {
            columns.extend(self.standard.iter().map(|m| m.column(channel)));
        }
        if self.size_metrics {
            columns.extend(SIZE_COLUMNS.iter().map(|c| c.to_string()));
        }
        columns.extend(self.combine.iter().map(|c| c.name.clone()));
        columns
    }
}

// ============================================================================
// Plug-ins
// ============================================================================

/// What a custom metric sees of one object.
pub struct ObjectData<'a> {
    /// Region properties of the object
    pub props: &'a RegionProps,
    /// Sorted intensities of the object per channel
    pub intensities: &'a BTreeMap<String, Vec<f64>>,
    /// Background per channel
    pub backgrounds: &'a BTreeMap<String, f64>,
    /// Columns computed so far
    pub columns: &'a BTreeMap<String, f64>,
}

/// User-provided metric module.
pub trait CustomMetric: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Columns the module writes (filled with `NaN` when it fails).
    fn columns(&self) -> Vec<String>;

    /// Compute the module's columns for one object.
    fn compute(&self, object: &ObjectData<'_>) -> std::result::Result<BTreeMap<String, f64>, String>;
}

impl<T: CustomMetric + ?Sized> CustomMetric for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn columns(&self) -> Vec<String> {
        (**self).columns()
    }

    fn compute(&self, object: &ObjectData<'_>) -> std::result::Result<BTreeMap<String, f64>, String> {
        (**self).compute(object)
    }
}

// ============================================================================
// Channel data
// ============================================================================

/// One channel at one frame, shaped like the frame's labels.
#[derive(Debug, Clone)]
pub struct ChannelFrame {
    /// Channel name
    pub name: String,
    /// Intensities `(Z, Y, X)`
    pub image: Array3<f32>,
}

/// Reduce a `(Z, Y, X)` frame of a 3D channel to a single plane.
pub fn project(frame: ArrayView3<'_, f32>, choice: ZSliceChoice) -> Array3<f32> {
    let depth = frame.len_of(Axis(0));
    let plane = match choice.projection {
        ZProjection::SingleSlice => frame.index_axis(Axis(0), choice.z_slice.min(depth.saturating_sub(1))).to_owned(),
        ZProjection::Max => frame.map_axis(Axis(0), |lane| lane.iter().copied().fold(f32::NEG_INFINITY, f32::max)),
        ZProjection::Mean => frame.map_axis(Axis(0), |lane| lane.iter().sum::<f32>() / lane.len().max(1) as f32),
        ZProjection::Median => frame.map_axis(Axis(0), |lane| {
            let mut values: Vec<f64> = lane.iter().map(|&v| f64::from(v)).collect();
            median(&mut values) as f32
        }),
    };
    plane.insert_axis(Axis(0))
}

/// Median intensity of the background pixels of a frame.
pub fn background(image: ArrayView3<'_, f32>, labels: &Labels) -> f64 {
    let mut values: Vec<f64> = image
        .iter()
        .zip(labels.iter())
        .filter(|&(_, &id)| id == 0)
        .map(|(&v, _)| f64::from(v))
        .collect();
    median(&mut values)
}

/// Size columns of one object.
pub fn size_columns(rp: &RegionProps, spacing: PhysicalSize) -> BTreeMap<String, f64> {
    let projected: BTreeSet<(usize, usize)> = rp.coords.iter().map(|&[_, y, x]| (y, x)).collect();
    let area = projected.len() as f64;
    BTreeMap::from([
        ("cell_area_pxl".to_string(), area),
        ("cell_area_um2".to_string(), area * spacing.pixel_area()),
        ("cell_vol_vox".to_string(), rp.vol_vox),
        ("cell_vol_fl".to_string(), rp.vol_fl),
    ])
}

// ============================================================================
// Measurer
// ============================================================================

/// Computes the schema's columns for every object of a frame.
pub struct Measurer {
    schema: MeasurementSchema,
    custom: Vec<Box<dyn CustomMetric>>,
}

impl Measurer {
    /// Measurer without plug-ins.
    pub fn new(schema: MeasurementSchema) -> Self {
        Self {
            schema,
            custom: Vec::new(),
        }
    }

    /// Add a custom metric module.
    pub fn with_custom(mut self, metric: Box<dyn CustomMetric>) -> Self {
        log::debug!("Custom metric '{}' registered", metric.name());
        self.custom.push(metric);
        self
    }

    /// The schema being computed.
    pub fn schema(&self) -> &MeasurementSchema {
        &self.schema
    }

    /// Measure every object of a frame.
    ///
    /// `channels` must hold the schema's channels shaped like `labels`;
    /// missing or misshapen channels give `NaN` columns.
    pub fn measure_frame(
        &self,
        frame: usize,
        labels: &Labels,
        state: &FrameState,
        channels: &[ChannelFrame],
        spacing: PhysicalSize,
    ) -> FrameMetrics {
        let mut usable: Vec<(&str, ArrayView3<'_, f32>, f64)> = Vec::new();
        for name in &self.schema.channels {
            match channels.iter().find(|c| &c.name == name) {
                Some(channel) if channel.image.dim() == labels.dim() => {
                    let view = channel.image.view();
                    usable.push((name, view, background(view, labels)));
                }
                Some(channel) => log::error!(
                    "Channel '{}' at frame {} has shape {:?}, labels are {:?}",
                    name,
                    frame,
                    channel.image.dim(),
                    labels.dim()
                ),
                None => log::error!("Channel '{}' missing at frame {}", name, frame),
            }
        }

        let metrics: FrameMetrics = state
            .props()
            .par_iter()
            .map(|rp| (rp.label, self.measure_object(frame, rp, &usable, spacing)))
            .collect();
        log::debug!("Measured {} objects at frame {}", metrics.len(), frame);
        metrics
    }

    fn measure_object(
        &self,
        frame: usize,
        rp: &RegionProps,
        channels: &[(&str, ArrayView3<'_, f32>, f64)],
        spacing: PhysicalSize,
    ) -> BTreeMap<String, f64> {
        let mut columns: BTreeMap<String, f64> = self
            .schema
            .columns()
            .into_iter()
            .map(|c| (c, f64::NAN))
            .collect();

        let mut intensities = BTreeMap::new();
        let mut backgrounds = BTreeMap::new();
        for &(name, image, bkgr) in channels {
            let mut values: Vec<f64> = rp
                .coords
                .iter()
                .map(|&[z, y, x]| f64::from(image[[z, y, x]]))
                .collect();
            values.sort_by(f64::total_cmp);
            for metric in &self.schema.standard {
                columns.insert(metric.column(name), metric.evaluate(&values, bkgr, rp.area, rp.vol_fl));
            }
            intensities.insert(name.to_string(), values);
            backgrounds.insert(name.to_string(), bkgr);
        }
        if self.schema.size_metrics {
            columns.extend(size_columns(rp, spacing));
        }

        for custom in &self.custom {
            let object = ObjectData {
                props: rp,
                intensities: &intensities,
                backgrounds: &backgrounds,
                columns: &columns,
            };
            match custom.compute(&object) {
                Ok(values) => columns.extend(values),
                Err(e) => {
                    log::error!(
                        "Custom metric '{}' failed for ID {} at frame {}: {}",
                        custom.name(),
                        rp.label,
                        frame,
                        e
                    );
                    for column in custom.columns() {
                        columns.insert(column, f64::NAN);
                    }
                }
            }
        }

        for metric in &self.schema.combine {
            let value = metric.expr.eval(&columns).unwrap_or_else(|e| {
                log::error!(
                    "Combine metric '{}' failed for ID {} at frame {}: {}",
                    metric.name,
                    rp.label,
                    frame,
                    e
                );
                f64::NAN
            });
            columns.insert(metric.name.clone(), value);
        }
        columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn frame() -> (Labels, Array3<f32>) {
        let mut labels = Labels::zeros((1, 4, 4));
        let mut image = Array3::<f32>::from_elem((1, 4, 4), 1.0);
        for y in 0..2 {
            for x in 0..2 {
                labels[[0, y, x]] = 3;
                image[[0, y, x]] = 5.0;
            }
        }
        (labels, image)
    }

    struct Failing;

    impl CustomMetric for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn columns(&self) -> Vec<String> {
            vec!["custom_value".to_string()]
        }

        fn compute(&self, _object: &ObjectData<'_>) -> std::result::Result<BTreeMap<String, f64>, String> {
            Err("boom".to_string())
        }
    }

    #[test]
    fn test_measure_frame_with_background() {
        let (labels, image) = frame();
        let spacing = PhysicalSize::new(0.5, 0.5, 1.0);
        let state = FrameState::update(&labels, spacing, false);
        let mut schema = MeasurementSchema::all_for(["GFP"]);
        schema.combine.push(CombineMetric::new("double_mean", "GFP_mean * 2").unwrap());
        let measurer = Measurer::new(schema).with_custom(Box::new(Failing));
        let channels = [ChannelFrame {
            name: "GFP".to_string(),
            image,
        }];

        let metrics = measurer.measure_frame(0, &labels, &state, &channels, spacing);
        let row = &metrics[&3];
        assert_eq!(row["GFP_mean"], 5.0);
        assert_eq!(row["GFP_sum"], 20.0);
        assert_eq!(row["GFP_autoBkgr_amount"], 16.0);
        assert_eq!(row["cell_area_pxl"], 4.0);
        assert_eq!(row["cell_area_um2"], 1.0);
        assert_eq!(row["double_mean"], 10.0);
        assert!(row["custom_value"].is_nan());
    }

    #[test]
    fn test_missing_channel_leaves_nan() {
        let (labels, _) = frame();
        let spacing = PhysicalSize::new(1.0, 1.0, 1.0);
        let state = FrameState::update(&labels, spacing, false);
        let measurer = Measurer::new(MeasurementSchema::all_for(["GFP"]));
        let metrics = measurer.measure_frame(0, &labels, &state, &[], spacing);
        assert!(metrics[&3]["GFP_mean"].is_nan());
        assert_eq!(metrics[&3]["cell_area_pxl"], 4.0);
    }

    #[test]
    fn test_projection_modes() {
        let mut stack = Array3::<f32>::zeros((3, 1, 2));
        for z in 0..3 {
            stack[[z, 0, 0]] = z as f32;
            stack[[z, 0, 1]] = 10.0;
        }
        let single = project(stack.view(), ZSliceChoice {
            z_slice: 1,
            projection: ZProjection::SingleSlice,
        });
        assert_eq!(single.dim(), (1, 1, 2));
        assert_eq!(single[[0, 0, 0]], 1.0);
        let max = project(stack.view(), ZSliceChoice {
            z_slice: 0,
            projection: ZProjection::Max,
        });
        assert_eq!(max[[0, 0, 0]], 2.0);
        let mean = project(stack.view(), ZSliceChoice {
            z_slice: 0,
            projection: ZProjection::Mean,
        });
        assert_eq!(mean[[0, 0, 1]], 10.0);
    }
}
