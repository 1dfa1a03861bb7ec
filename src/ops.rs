//! Detection configuration.
//!
//! `DetectOps` is the single knob bag threaded through the pipeline. The
//! input side mirrors the recording setup (projection mode, expected cell
//! diameter, model thresholds); the output side is written back by
//! [`crate::detect::select_rois`] so callers can pick up the diameter
//! estimate and the projection images after a run. Missing keys in a JSON
//! config fall back to defaults.

use crate::image::ImageF32;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Strategy for the detection image handed to the segmentation model.
///
/// Serialized as the integers 0..=3; `Activity` (0) runs the functional
/// detector instead of the model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ProjectionMode {
    /// Activity-based detection on the high-pass movie (no model call).
    #[default]
    Activity,
    /// Log ratio of max-projection to temporal mean.
    RatioMax,
    /// Percentile-normalized temporal mean.
    Mean,
    /// Externally supplied enhanced mean image.
    EnhancedMean,
}

impl From<u8> for ProjectionMode {
    fn from(v: u8) -> Self {
        match v {
            1 => ProjectionMode::RatioMax,
            2 => ProjectionMode::Mean,
            3 => ProjectionMode::EnhancedMean,
            _ => ProjectionMode::Activity,
        }
    }
}

impl From<ProjectionMode> for u8 {
    fn from(m: ProjectionMode) -> Self {
        match m {
            ProjectionMode::Activity => 0,
            ProjectionMode::RatioMax => 1,
            ProjectionMode::Mean => 2,
            ProjectionMode::EnhancedMean => 3,
        }
    }
}

/// Expected cell diameter: one scale for square pixels, a `[row, col]`
/// pair when the pixel aspect ratio is not 1.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DiameterSpec {
    Scalar(f32),
    Pair([f32; 2]),
}

impl DiameterSpec {
    /// Resolve to a `[row, col]` pair plus the vertical rescale factor
    /// (`col / row`) applied to the detection image before the model runs.
    pub fn resolve(&self) -> ([f32; 2], f32) {
        match *self {
            DiameterSpec::Scalar(d) => ([d, d], 1.0),
            DiameterSpec::Pair([row, col]) => {
                let rescale = if row > 0.0 { col / row } else { 1.0 };
                ([row, col], rescale)
            }
        }
    }
}

/// Knobs for the activity-based (functional) detector.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityParams {
    /// Fraction of the first peak below which the peak loop stops.
    pub threshold_scale: f32,
    /// Fraction of the current peak a pixel must exceed to join the region.
    pub grow_fraction: f32,
    /// Sigma of the light spatial smoothing applied to the activity map.
    pub smooth_sigma: f32,
    /// Hard cap on extracted regions.
    pub max_regions: usize,
    /// Regions smaller than this many pixels are dropped.
    pub min_pixels: usize,
}

impl Default for ActivityParams {
    fn default() -> Self {
        Self {
            threshold_scale: 0.5,
            grow_fraction: 0.25,
            smooth_sigma: 1.0,
            max_regions: 500,
            min_pixels: 9,
        }
    }
}

/// Visualization placeholders written back for downstream display code.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct VisState {
    pub vmax: f32,
    pub vsplit: f32,
    pub vmap: f32,
    pub ihop: f32,
    pub spatscale_pix: f32,
}

/// Detection configuration plus the result fields the pipeline writes back.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectOps {
    /// Temporal high-pass window in frames.
    pub high_pass: usize,
    /// Detection image strategy (0..=3).
    pub anatomical_only: ProjectionMode,
    /// Expected cell diameter; absent or zero lets the model estimate.
    pub diameter: Option<DiameterSpec>,
    /// Cell-probability threshold forwarded to the model.
    pub cellprob_threshold: f32,
    /// Flow-consistency threshold forwarded to the model.
    pub flow_threshold: f32,
    /// Pretrained-weights identifier the caller built the model with.
    pub pretrained_model: Option<String>,
    /// Spatial high-pass scale factor (in cell diameters); 0 disables.
    pub spatial_hp_cp: f32,
    /// Row crop `[start, end)` of the enhanced mean image.
    pub yrange: Option<[usize; 2]>,
    /// Column crop `[start, end)` of the enhanced mean image.
    pub xrange: Option<[usize; 2]>,
    /// Enhanced mean image for `ProjectionMode::EnhancedMean`.
    #[serde(skip)]
    pub mean_img_e: Option<ImageF32>,
    /// Reconcile activity-derived footprints against anatomical masks.
    pub anatomical_assist: bool,
    /// Functional detector knobs.
    pub activity: ActivityParams,

    // Written back by the pipeline.
    /// Median cell diameter found during detection, if any.
    #[serde(skip)]
    pub diameter_estimate: Option<f32>,
    /// Max-projection of the high-pass movie.
    #[serde(skip)]
    pub max_proj: Option<ImageF32>,
    /// Detection image that was handed to the model.
    #[serde(skip)]
    pub vcorr: Option<ImageF32>,
    /// Placeholders consumed by visualization code.
    #[serde(skip)]
    pub vis: VisState,
}

impl Default for DetectOps {
    fn default() -> Self {
        Self {
            high_pass: 100,
            anatomical_only: ProjectionMode::Activity,
            diameter: None,
            cellprob_threshold: 0.0,
            flow_threshold: 1.5,
            pretrained_model: None,
            spatial_hp_cp: 0.0,
            yrange: None,
            xrange: None,
            mean_img_e: None,
            anatomical_assist: false,
            activity: ActivityParams::default(),
            diameter_estimate: None,
            max_proj: None,
            vcorr: None,
            vis: VisState::default(),
        }
    }
}

/// Load a `DetectOps` from a JSON file.
pub fn load_ops(path: &Path) -> Result<DetectOps, String> {
    let contents = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config {}: {e}", path.display()))?;
    let ops: DetectOps = serde_json::from_str(&contents)
        .map_err(|e| format!("Failed to parse config {}: {e}", path.display()))?;
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_mode_round_trips_through_integers() {
        for v in 0u8..=3 {
            let mode = ProjectionMode::from(v);
            assert_eq!(u8::from(mode), v);
        }
        assert_eq!(ProjectionMode::from(7), ProjectionMode::Activity);
    }

    #[test]
    fn diameter_pair_resolves_to_vertical_rescale() {
        let ([row, col], rescale) = DiameterSpec::Pair([10.0, 20.0]).resolve();
        assert_eq!((row, col), (10.0, 20.0));
        assert!((rescale - 2.0).abs() < 1e-6);

        let (pair, rescale) = DiameterSpec::Scalar(12.0).resolve();
        assert_eq!(pair, [12.0, 12.0]);
        assert_eq!(rescale, 1.0);
    }

    #[test]
    fn ops_parse_from_sparse_json() {
        let ops: DetectOps =
            serde_json::from_str(r#"{"anatomical_only": 1, "diameter": [10.0, 20.0]}"#)
                .expect("parse");
        assert_eq!(ops.anatomical_only, ProjectionMode::RatioMax);
        assert_eq!(ops.diameter, Some(DiameterSpec::Pair([10.0, 20.0])));
        assert_eq!(ops.high_pass, 100);
    }
}
