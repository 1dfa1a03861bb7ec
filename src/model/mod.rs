//! Boundary to the external deep-learning segmentation model.
//!
//! The pipeline treats the model as an opaque function: image patches in,
//! per-pixel flow vectors plus a cell-probability map out. Backends differ
//! across model generations in which batched entry point they expose, so
//! [`run_network`] probes the current one first and the legacy one second;
//! a backend exposing neither is a fatal, non-retried error.
//!
//! Flow convention: the flow channels point away from the object centre,
//! and the decoder integrates pixels along `-flow`. The integration step is
//! `-flow / 5` gated by `cellprob > 0`.

pub mod reference;

use crate::image::{ImageF32, LabelImage};
use thiserror::Error;

/// Errors raised at the model boundary.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The backend does not implement this entry point; callers may probe
    /// another generation's entry point before giving up.
    #[error("segmentation backend does not implement the `{0}` entry point")]
    UnsupportedEntryPoint(&'static str),
    /// Neither known entry point is available in this backend build.
    #[error("segmentation backend exposes no usable network entry point (tried `forward` and `forward_legacy`)")]
    MissingEntryPoint,
    /// The backend itself failed.
    #[error("segmentation backend failure: {0}")]
    Backend(String),
}

/// One network input: a two-channel square tile (image, spare channel).
#[derive(Clone, Debug)]
pub struct TileTensor {
    pub channels: [ImageF32; 2],
}

impl TileTensor {
    /// Build a tile from a single-channel image; the second channel is
    /// zero-filled.
    pub fn from_image(primary: ImageF32) -> Self {
        let spare = ImageF32::new(primary.w, primary.h);
        Self {
            channels: [primary, spare],
        }
    }

    /// Tile dimensions `(w, h)`.
    pub fn dims(&self) -> (usize, usize) {
        (self.channels[0].w, self.channels[0].h)
    }
}

/// Raw network output for one tile: two flow channels plus cell
/// probability, all at tile resolution.
#[derive(Clone, Debug)]
pub struct NetOutput {
    pub flow_y: ImageF32,
    pub flow_x: ImageF32,
    pub cellprob: ImageF32,
}

/// Parameters for a whole-image evaluation.
#[derive(Clone, Copy, Debug)]
pub struct EvalParams {
    /// Expected cell diameter in pixels; `None` asks the model to estimate.
    pub diameter: Option<f32>,
    /// Threshold on the cell-probability channel.
    pub cellprob_threshold: f32,
    /// Threshold on the flow-consistency error.
    pub flow_threshold: f32,
}

/// Diameter report from a whole-image evaluation.
#[derive(Clone, Debug)]
pub enum DiameterEstimate {
    /// One scale for the whole image.
    Scalar(f32),
    /// One scale per detected mask.
    PerMask(Vec<f32>),
}

impl DiameterEstimate {
    /// Collapse to a single diameter (median for per-mask reports).
    pub fn median(&self) -> Option<f32> {
        match self {
            DiameterEstimate::Scalar(d) => Some(*d),
            DiameterEstimate::PerMask(diams) => {
                if diams.is_empty() {
                    None
                } else {
                    Some(crate::image::percentile(diams, 50.0))
                }
            }
        }
    }
}

/// Whole-image evaluation result.
///
/// Older model generations do not report diameters; `diameters` is `None`
/// then and the caller falls back to an activity-derived estimate.
#[derive(Clone, Debug)]
pub struct EvalOutput {
    pub masks: LabelImage,
    pub flows: NetOutput,
    pub styles: Vec<f32>,
    pub diameters: Option<DiameterEstimate>,
}

/// The external segmentation model.
///
/// `eval` segments a whole image end-to-end. The batched entry points feed
/// normalized, padded tiles straight through the network; backends
/// implement whichever their generation exposes and leave the other at the
/// unsupported default.
pub trait SegmentationModel {
    /// Segment a whole image, returning masks, flows, a style vector and
    /// (for newer generations) a diameter estimate.
    fn eval(&self, image: &ImageF32, params: &EvalParams) -> Result<EvalOutput, ModelError>;

    /// Batched network entry point of current backends.
    fn forward(&self, _batch: &[TileTensor]) -> Result<Vec<NetOutput>, ModelError> {
        Err(ModelError::UnsupportedEntryPoint("forward"))
    }

    /// Batched network entry point of older backends.
    fn forward_legacy(&self, _batch: &[TileTensor]) -> Result<Vec<NetOutput>, ModelError> {
        Err(ModelError::UnsupportedEntryPoint("forward_legacy"))
    }
}

/// Run a batch through whichever network entry point the backend exposes.
///
/// Tries `forward`, then `forward_legacy`; any other error is propagated
/// as-is, and a backend supporting neither yields
/// [`ModelError::MissingEntryPoint`].
pub fn run_network(
    model: &dyn SegmentationModel,
    batch: &[TileTensor],
) -> Result<Vec<NetOutput>, ModelError> {
    match model.forward(batch) {
        Err(ModelError::UnsupportedEntryPoint(_)) => {}
        other => return other,
    }
    match model.forward_legacy(batch) {
        Err(ModelError::UnsupportedEntryPoint(_)) => Err(ModelError::MissingEntryPoint),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoEntryPoint;

    impl SegmentationModel for NoEntryPoint {
        fn eval(&self, _: &ImageF32, _: &EvalParams) -> Result<EvalOutput, ModelError> {
            Err(ModelError::Backend("eval unused".into()))
        }
    }

    struct LegacyOnly;

    impl SegmentationModel for LegacyOnly {
        fn eval(&self, _: &ImageF32, _: &EvalParams) -> Result<EvalOutput, ModelError> {
            Err(ModelError::Backend("eval unused".into()))
        }

        fn forward_legacy(&self, batch: &[TileTensor]) -> Result<Vec<NetOutput>, ModelError> {
            Ok(batch
                .iter()
                .map(|t| NetOutput {
                    flow_y: ImageF32::new(t.channels[0].w, t.channels[0].h),
                    flow_x: ImageF32::new(t.channels[0].w, t.channels[0].h),
                    cellprob: ImageF32::new(t.channels[0].w, t.channels[0].h),
                })
                .collect())
        }
    }

    #[test]
    fn run_network_reports_missing_entry_points() {
        let batch = [TileTensor::from_image(ImageF32::new(4, 4))];
        let err = run_network(&NoEntryPoint, &batch).unwrap_err();
        assert!(matches!(err, ModelError::MissingEntryPoint));
        let msg = err.to_string();
        assert!(msg.contains("forward_legacy"), "msg={}", msg);
    }

    #[test]
    fn run_network_falls_back_to_legacy_entry_point() {
        let batch = [TileTensor::from_image(ImageF32::new(4, 4))];
        let out = run_network(&LegacyOnly, &batch).expect("legacy path");
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn per_mask_diameters_collapse_to_median() {
        let est = DiameterEstimate::PerMask(vec![8.0, 12.0, 10.0]);
        assert_eq!(est.median(), Some(10.0));
        assert_eq!(DiameterEstimate::PerMask(Vec::new()).median(), None);
        assert_eq!(DiameterEstimate::Scalar(9.0).median(), Some(9.0));
    }
}
