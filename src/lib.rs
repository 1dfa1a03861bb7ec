#![doc = include_str!("../README.md")]

// Public modules (stable-ish surface)
pub mod detect;
pub mod diagnostics;
pub mod image;
pub mod model;
pub mod movie;
pub mod ops;
pub mod types;

// “Expert” modules – still public, but considered unstable internals.
pub mod dynamics;
pub mod masks;

// --- High-level re-exports -------------------------------------------------

// Main entry points: selection + results.
pub use crate::detect::{
    estimate_diameter_from_activity, patch_detect, refine_masks, roi_detect, select_rois,
    select_rois_with_report, DetectError, RoiDetection, SelectionReport,
};
pub use crate::types::Stat;

// Core data types.
pub use crate::image::{ImageF32, LabelImage};
pub use crate::movie::Movie;
pub use crate::ops::{load_ops, DetectOps, DiameterSpec, ProjectionMode};

// Model boundary.
pub use crate::model::{EvalOutput, EvalParams, ModelError, SegmentationModel};

// --- Prelude ---------------------------------------------------------------

/// Small prelude for quick experiments.
///
/// ```no_run
/// use cell_detector::prelude::*;
///
/// # fn main() {
/// let mut mov = Movie::new(50, 64, 64);
/// let model = cell_detector::model::reference::ReferenceModel::default();
/// let mut ops = DetectOps {
///     anatomical_only: ProjectionMode::RatioMax,
///     ..Default::default()
/// };
/// let stats = select_rois(&model, &mut ops, &mut mov).unwrap_or_default();
/// println!("{} ROIs", stats.len());
/// # }
/// ```
pub mod prelude {
    pub use crate::detect::select_rois;
    pub use crate::image::{ImageF32, LabelImage};
    pub use crate::movie::Movie;
    pub use crate::ops::{DetectOps, DiameterSpec, ProjectionMode};
    pub use crate::types::Stat;
}
