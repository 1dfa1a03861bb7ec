//! Detection orchestration.
//!
//! Overview
//! - [`select_rois`] is the entry point: it reduces the movie to a
//!   detection image, dispatches to either the anatomical model path or
//!   the activity-based detector, and writes the diameter estimate and the
//!   projection images back into the configuration.
//! - `anatomical` holds the model-facing pieces: whole-image detection,
//!   patch-level segmentation and mask reconciliation.
//! - `activity` is the functional detector used both as a detection mode
//!   of its own and as the fallback diameter estimator.
//!
//! Modules
//! - [`anatomical`] – `roi_detect`, `patch_detect`, `refine_masks`.
//! - [`activity`] – peak/grow detection over the high-pass movie.
//! - `select` – the top-level pipeline and the diameter fallback.

pub mod activity;
pub mod anatomical;
mod select;

use crate::model::ModelError;
use thiserror::Error;

pub use anatomical::{patch_detect, refine_masks, roi_detect, RoiDetection};
pub use select::{estimate_diameter_from_activity, select_rois, select_rois_with_report, SelectionReport};

/// Errors raised by the detection pipeline.
#[derive(Debug, Error)]
pub enum DetectError {
    /// The segmentation backend failed (version incompatibility included).
    #[error(transparent)]
    Model(#[from] ModelError),
    /// The movie carries no frames or zero-sized frames.
    #[error("movie has no frames or zero-sized frames")]
    EmptyMovie,
    /// Patch batch was empty or the patches disagree in size.
    #[error("patch batch is empty or patches differ in size")]
    BadPatches,
}
