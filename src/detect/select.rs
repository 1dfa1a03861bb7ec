//! Top-level ROI selection.
//!
//! Reduces the movie to a detection image and a weight image, dispatches
//! to the anatomical model path or the activity-based detector, and
//! writes the diameter estimate plus the projection images back into the
//! configuration. The configuration write-back is the deliberate side
//! channel downstream code reads results from.

use super::{activity, anatomical, DetectError};
use crate::diagnostics::{DetectionSummary, TimingBreakdown};
use crate::image::{
    gaussian_blur, normalize99, percentile, resize_bilinear, resize_nearest, ImageF32,
};
use crate::masks::{masks_to_stats, pixel_stats, square_mask};
use crate::model::SegmentationModel;
use crate::movie::Movie;
use crate::ops::{DetectOps, ProjectionMode, VisState};
use crate::types::Stat;
use log::{info, warn};
use std::time::Instant;

/// Fallback patch diameter when neither the config nor the activity stats
/// offer a scale.
const DEFAULT_ASSIST_DIAMETER: f32 = 12.0;

/// Stats plus the run summary returned by
/// [`select_rois_with_report`].
#[derive(Clone, Debug)]
pub struct SelectionReport {
    pub stats: Vec<Stat>,
    pub summary: DetectionSummary,
}

/// Find ROIs in the binned movie. See [`select_rois_with_report`].
pub fn select_rois(
    model: &dyn SegmentationModel,
    ops: &mut DetectOps,
    mov: &mut Movie,
) -> Result<Vec<Stat>, DetectError> {
    Ok(select_rois_with_report(model, ops, mov)?.stats)
}

/// Find ROIs in the binned movie and report run diagnostics.
///
/// The movie is temporally high-pass filtered in place. On return `ops`
/// carries the diameter estimate, the max-projection and the detection
/// image (`vcorr`).
pub fn select_rois_with_report(
    model: &dyn SegmentationModel,
    ops: &mut DetectOps,
    mov: &mut Movie,
) -> Result<SelectionReport, DetectError> {
    if mov.nframes == 0 || mov.ly == 0 || mov.lx == 0 {
        return Err(DetectError::EmptyMovie);
    }
    let (ly, lx) = (mov.ly, mov.lx);
    let total_start = Instant::now();
    let mut timings = TimingBreakdown::default();

    let proj_start = Instant::now();
    let mean_img = mov.mean_image();
    mov.temporal_high_pass(ops.high_pass);
    let max_proj = mov.max_projection();
    timings.push("projection", ms(proj_start));

    let (mut img, weights) = detection_image(ops, &mean_img, &max_proj, ly, lx);

    // Resolve the diameter argument; a [row, col] pair rescales the
    // detection image vertically before the model sees it.
    let mut rescale = 1.0f32;
    let mut diam_pair: Option<[f32; 2]> = None;
    if let Some(spec) = ops.diameter {
        let (pair, factor) = spec.resolve();
        if (factor - 1.0).abs() > f32::EPSILON {
            let new_ly = ((ly as f32) * factor).round().max(1.0) as usize;
            img = resize_bilinear(&img, lx, new_ly);
            rescale = factor;
        }
        diam_pair = Some(pair);
        if pair[1] > 0.0 {
            info!("diameter set to {:.2} for anatomical detection", pair[1]);
        } else {
            info!("diameter unset, the model will estimate it if possible");
        }
    } else {
        info!("diameter unset, the model will estimate it if possible");
    }

    // Optional spatial high-pass at a diameter-derived scale.
    if ops.spatial_hp_cp > 0.0 {
        match diam_pair.filter(|p| p[1] > 0.0) {
            Some(pair) => {
                let mut norm = normalize99(&img);
                norm.map_inplace(|v| v.clamp(0.0, 1.0));
                let blur = gaussian_blur(&norm, pair[1] * ops.spatial_hp_cp);
                for (v, &b) in norm.data.iter_mut().zip(&blur.data) {
                    *v -= b;
                }
                img = norm;
            }
            None => warn!("spatial high-pass skipped: it needs a configured diameter"),
        }
    }

    let detect_start = Instant::now();
    let (stats, n_refined) = if ops.anatomical_only == ProjectionMode::Activity {
        let mut stats = activity::detect(&ops.activity, &max_proj);
        ops.diameter_estimate = median_stat_diameter(&stats);
        let mut n_refined = 0;
        if ops.anatomical_assist {
            n_refined = assist(model, ops, &mut stats, &max_proj, ly, lx)?;
        }
        (stats, n_refined)
    } else {
        let detection =
            anatomical::roi_detect(model, ops, &img, mov, diam_pair.map(|p| p[1]))?;
        let mut masks = detection.masks;
        if (rescale - 1.0).abs() > f32::EPSILON {
            masks = resize_nearest(&masks, lx, ly);
            img = resize_bilinear(&img, lx, ly);
        }
        ops.diameter_estimate = detection.median_diam;
        (masks_to_stats(&masks, &weights), 0)
    };
    timings.push("detection", ms(detect_start));
    timings.total_ms = ms(total_start);

    ops.max_proj = Some(max_proj);
    ops.vcorr = Some(img);
    ops.vis = VisState::default();

    info!(
        "detected {} ROIs in {:.2}s",
        stats.len(),
        timings.total_ms / 1000.0
    );
    let summary = DetectionSummary {
        mode: ops.anatomical_only.into(),
        n_rois: stats.len(),
        n_refined,
        diameter_estimate: ops.diameter_estimate,
        timings,
    };
    Ok(SelectionReport { stats, summary })
}

/// Estimate the cell diameter by re-running selection in activity mode.
///
/// Never propagates a failure: any error, and an empty result set, are
/// logged and mapped to `None`.
pub fn estimate_diameter_from_activity(
    model: &dyn SegmentationModel,
    ops: &DetectOps,
    mov: &mut Movie,
) -> Option<f32> {
    let mut ops_copy = ops.clone();
    ops_copy.anatomical_only = ProjectionMode::Activity;
    ops_copy.anatomical_assist = false;
    match select_rois(model, &mut ops_copy, mov) {
        Ok(stats) if !stats.is_empty() => median_stat_diameter(&stats),
        Ok(_) => {
            warn!(
                "activity-based diameter estimation failed: no ROIs found -- \
                 check the registered binary and the spatial scale"
            );
            None
        }
        Err(e) => {
            warn!("activity-based diameter estimation failed: {e}");
            None
        }
    }
}

/// Reconcile activity stats against anatomical patch masks; returns how
/// many footprints were adopted.
fn assist(
    model: &dyn SegmentationModel,
    ops: &DetectOps,
    stats: &mut [Stat],
    max_proj: &ImageF32,
    ly: usize,
    lx: usize,
) -> Result<usize, DetectError> {
    if stats.is_empty() {
        return Ok(0);
    }
    let diam = ops
        .diameter
        .map(|spec| spec.resolve().0[1])
        .filter(|&d| d > 0.0)
        .or(ops.diameter_estimate)
        .unwrap_or(DEFAULT_ASSIST_DIAMETER);
    let half = (diam.ceil() as usize).max(8);
    let seeds: Vec<[usize; 2]> = stats.iter().map(|s| s.med).collect();
    let patches: Vec<ImageF32> = seeds
        .iter()
        .map(|&[y, x]| square_mask(max_proj, half, y, x))
        .collect();
    anatomical::refine_masks(model, stats, &patches, &seeds, diam, ly, lx)?;
    Ok(stats.iter().filter(|s| s.anatomical).count())
}

/// Median of the per-stat effective diameters.
fn median_stat_diameter(stats: &[Stat]) -> Option<f32> {
    if stats.is_empty() {
        return None;
    }
    let diams: Vec<f32> = stats
        .iter()
        .map(|s| pixel_stats(&s.ypix, &s.xpix).diam)
        .collect();
    Some(percentile(&diams, 50.0))
}

/// Detection image and weight image for the configured projection mode.
fn detection_image(
    ops: &DetectOps,
    mean_img: &ImageF32,
    max_proj: &ImageF32,
    ly: usize,
    lx: usize,
) -> (ImageF32, ImageF32) {
    match ops.anatomical_only {
        ProjectionMode::RatioMax => {
            let mut img = max_proj.clone();
            for (v, &m) in img.data.iter_mut().zip(&mean_img.data) {
                *v = (*v / m.max(1e-3)).max(1e-3).ln();
            }
            (img, max_proj.clone())
        }
        ProjectionMode::Mean => (mean_img.clone(), percentile_weights(mean_img)),
        ProjectionMode::EnhancedMean => (
            enhanced_mean(ops, mean_img, ly, lx),
            percentile_weights(mean_img),
        ),
        ProjectionMode::Activity => (max_proj.clone(), max_proj.clone()),
    }
}

/// `0.1 + clip01((mean - p1) / (p99 - p1))`, the weight image shared by
/// the mean-based modes.
fn percentile_weights(mean_img: &ImageF32) -> ImageF32 {
    let p1 = percentile(&mean_img.data, 1.0);
    let p99 = percentile(&mean_img.data, 99.0);
    let range = (p99 - p1).max(f32::EPSILON);
    let mut weights = mean_img.clone();
    weights.map_inplace(|v| 0.1 + ((v - p1) / range).clamp(0.0, 1.0));
    weights
}

fn enhanced_mean(ops: &DetectOps, mean_img: &ImageF32, ly: usize, lx: usize) -> ImageF32 {
    let Some(enhanced) = &ops.mean_img_e else {
        warn!("no enhanced mean image, using the mean image instead");
        return mean_img.clone();
    };
    let rows = ops.yrange.unwrap_or([0, enhanced.h]);
    let cols = ops.xrange.unwrap_or([0, enhanced.w]);
    let valid = rows[0] < rows[1]
        && cols[0] < cols[1]
        && rows[1] <= enhanced.h
        && cols[1] <= enhanced.w
        && rows[1] - rows[0] == ly
        && cols[1] - cols[0] == lx;
    if !valid {
        warn!("enhanced mean image crop does not match the movie frame, using the mean image instead");
        return mean_img.clone();
    }
    crate::image::crop(enhanced, rows, cols)
}

fn ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
