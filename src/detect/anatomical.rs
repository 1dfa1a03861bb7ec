//! Model-facing anatomical detection.
//!
//! `roi_detect` runs the segmentation model over a whole projection image;
//! `patch_detect` batches fixed-size patches through the network's raw
//! entry point and decodes the returned flow fields; `refine_masks`
//! reconciles activity-derived footprints against the decoded patch masks
//! via intersection-over-union.

use super::DetectError;
use crate::dynamics::decode_flows;
use crate::image::{
    crop, normalize99, pad_to_multiple, resize_bilinear, resize_nearest, ImageF32, LabelImage,
};
use crate::masks::{canonicalize_labels, foreground, mask_centers, mask_ious, SquareWindow};
use crate::model::{
    run_network, DiameterEstimate, EvalParams, ModelError, NetOutput, SegmentationModel, TileTensor,
};
use crate::movie::Movie;
use crate::ops::DetectOps;
use crate::types::Stat;
use log::{debug, info};
use rayon::prelude::*;
use std::time::Instant;

/// Canonical cell size (px) the network was trained at.
const MODEL_CELL_SIZE: f32 = 30.0;
/// Flow-consistency threshold used when decoding patch masks.
const FLOW_ERROR_THRESHOLD: f32 = 1.0;
/// Decoded masks smaller than this many pixels are discarded.
const MIN_MASK_SIZE: usize = 15;
/// Strict lower bound on the IOU for adopting an anatomical footprint.
const IOU_ACCEPT: f32 = 0.45;
/// Network input sides must be multiples of this.
const PAD_MULTIPLE: usize = 16;

/// Whole-image detection result.
#[derive(Clone, Debug)]
pub struct RoiDetection {
    /// Canonicalized label mask (ids contiguous from 1).
    pub masks: LabelImage,
    /// Per-mask representative (row, col), indexed by id - 1.
    pub centers: Vec<[i32; 2]>,
    /// Median cell diameter, when the model (or the activity fallback)
    /// could produce one.
    pub median_diam: Option<f32>,
    /// Per-mask effective diameters, indexed by id - 1.
    pub mask_diams: Vec<i32>,
}

/// Segment every patch through the network and decode the flows into
/// label masks, one per patch, each at its patch's original size.
pub fn patch_detect(
    model: &dyn SegmentationModel,
    patches: &[ImageF32],
    diam: f32,
) -> Result<Vec<LabelImage>, DetectError> {
    let Some(first) = patches.first() else {
        return Err(DetectError::BadPatches);
    };
    let side = first.w;
    if side == 0 || first.h != side || patches.iter().any(|p| p.w != side || p.h != side) {
        return Err(DetectError::BadPatches);
    }
    assert!(diam > 0.0, "diameter must be positive");
    info!("refining masks with the anatomical model: {} patches", patches.len());

    // Resize so cells land at the network's canonical size, pad to the
    // required input multiple. All patches share a size, so the crop-back
    // ranges of the first apply to every tile.
    let rsz = MODEL_CELL_SIZE / diam;
    let side_rsz = ((side as f32 * rsz).round() as usize).max(1);
    let niter = (200.0 * diam / MODEL_CELL_SIZE).round().max(1.0) as usize;
    let padded: Vec<(ImageF32, [usize; 2], [usize; 2])> = patches
        .iter()
        .map(|p| {
            let norm = normalize99(p);
            let resized = if side_rsz == side {
                norm
            } else {
                resize_bilinear(&norm, side_rsz, side_rsz)
            };
            pad_to_multiple(&resized, PAD_MULTIPLE)
        })
        .collect();
    let crop_rows = padded[0].1;
    let crop_cols = padded[0].2;
    let needs_crop = crop_rows[1] - crop_rows[0] != padded[0].0.h
        || crop_cols[1] - crop_cols[0] != padded[0].0.w;
    let tiles: Vec<TileTensor> = padded
        .into_iter()
        .map(|(img, _, _)| TileTensor::from_image(img))
        .collect();

    let batch_size = (8 * 224 / side).max(1);
    let start = Instant::now();
    let mut masks = Vec::with_capacity(patches.len());
    for (bi, batch) in tiles.chunks(batch_size).enumerate() {
        let outputs = run_network(model, batch)?;
        if outputs.len() != batch.len() {
            return Err(ModelError::Backend(format!(
                "backend returned {} outputs for a batch of {}",
                outputs.len(),
                batch.len()
            ))
            .into());
        }
        let decoded: Vec<LabelImage> = outputs
            .par_iter()
            .map(|net| {
                let net = if needs_crop {
                    crop_output(net, crop_rows, crop_cols)
                } else {
                    net.clone()
                };
                let decoded = decode_flows(&net, niter, FLOW_ERROR_THRESHOLD, MIN_MASK_SIZE);
                if side_rsz == side {
                    decoded
                } else {
                    resize_nearest(&decoded, side, side)
                }
            })
            .collect();
        masks.extend(decoded);
        if bi % 5 == 0 {
            info!(
                "{} / {} patch masks decoded in {:.2}s",
                masks.len(),
                patches.len(),
                start.elapsed().as_secs_f64()
            );
        }
    }
    Ok(masks)
}

fn crop_output(net: &NetOutput, rows: [usize; 2], cols: [usize; 2]) -> NetOutput {
    NetOutput {
        flow_y: crop(&net.flow_y, rows, cols),
        flow_x: crop(&net.flow_x, rows, cols),
        cellprob: crop(&net.cellprob, rows, cols),
    }
}

/// Reconcile activity-derived footprints against anatomical patch masks.
///
/// For each stat, the patch centered on its seed is segmented (batched for
/// the whole set), the decoded mask ids are matched against the stat's own
/// footprint by IOU, and the best-matching id replaces the footprint when
/// the IOU strictly exceeds 0.45 (ties resolve to the lowest id).
/// Replacement weights come from the stat's dense footprint map; any
/// non-positive value becomes the minimum positive weight so the record
/// stays usable for signal extraction. Footprints without a good match are
/// left untouched with `anatomical = false`.
pub fn refine_masks(
    model: &dyn SegmentationModel,
    stats: &mut [Stat],
    patches: &[ImageF32],
    seeds: &[[usize; 2]],
    diam: f32,
    ly: usize,
    lx: usize,
) -> Result<(), DetectError> {
    assert_eq!(stats.len(), patches.len(), "one patch per stat");
    assert_eq!(seeds.len(), patches.len(), "one seed per patch");
    if stats.is_empty() {
        return Ok(());
    }
    let patch_masks = patch_detect(model, patches, diam)?;
    let half = patches[0].w / 2;

    for i in 0..stats.len() {
        let stat = &mut stats[i];
        let patch_mask = &patch_masks[i];
        let [sy, sx] = seeds[i];

        // Dense weight map of the functional footprint, windowed the same
        // way the patch was cut.
        let mut dense = ImageF32::new(lx, ly);
        for ((&y, &x), &l) in stat.ypix.iter().zip(&stat.xpix).zip(&stat.lam) {
            dense.set(x, y, l);
        }
        let win = SquareWindow::new(sy, sx, half, ly, lx);
        let func_mask = win.extract(&dense);

        let ious = mask_ious(patch_mask, &foreground(&func_mask));
        let mut best = 0.0f32;
        let mut best_id = 0u32;
        for (k, row) in ious.iter().enumerate() {
            if let Some(&v) = row.first() {
                if v > best {
                    best = v;
                    best_id = k as u32 + 1;
                }
            }
        }
        if best <= IOU_ACCEPT {
            stat.anatomical = false;
            continue;
        }

        // Adopt the anatomical footprint: walk the window area that
        // overlaps the frame so recovered coordinates always land inside
        // it, and pull replacement weights from the functional crop.
        let (r0, r1) = win.overlap_rows();
        let (c0, c1) = win.overlap_cols();
        let mut ypix = Vec::new();
        let mut xpix = Vec::new();
        let mut lam = Vec::new();
        for wy in r0..r1 {
            for wx in c0..c1 {
                if patch_mask.get(wx, wy) == best_id {
                    let (fy, fx) = win.to_frame(wy, wx);
                    ypix.push(fy);
                    xpix.push(fx);
                    lam.push(func_mask.get(wx, wy));
                }
            }
        }
        let min_positive = lam
            .iter()
            .copied()
            .filter(|&v| v > 0.0)
            .fold(f32::INFINITY, f32::min);
        if ypix.is_empty() || !min_positive.is_finite() {
            debug!(
                "refine_masks: mask {} matched (iou {:.3}) but yielded no usable weights",
                i, best
            );
            stat.anatomical = false;
            continue;
        }
        for v in &mut lam {
            if *v <= 0.0 {
                *v = min_positive;
            }
        }
        stat.ypix = ypix;
        stat.xpix = xpix;
        stat.lam = lam;
        stat.anatomical = true;
    }
    Ok(())
}

/// Whole-image detection: run the model once over the projection image,
/// canonicalize the mask ids and compute per-mask centers and diameters.
///
/// Newer model generations report a diameter estimate; when the model
/// does not, the activity-based fallback supplies one (and `None` means
/// even that failed).
pub fn roi_detect(
    model: &dyn SegmentationModel,
    ops: &mut DetectOps,
    img: &ImageF32,
    mov: &mut Movie,
    diameter: Option<f32>,
) -> Result<RoiDetection, DetectError> {
    debug!(
        "roi_detect: {}x{} image, pretrained weights `{}`",
        img.h,
        img.w,
        ops.pretrained_model.as_deref().unwrap_or("cpsam")
    );
    // Diameter zero means "let the model estimate".
    let diameter = diameter.filter(|&d| d > 0.0);
    let eval = model.eval(
        img,
        &EvalParams {
            diameter,
            cellprob_threshold: ops.cellprob_threshold,
            flow_threshold: ops.flow_threshold,
        },
    )?;
    let mut masks = eval.masks;
    let median_diam = match eval.diameters.as_ref().and_then(DiameterEstimate::median) {
        Some(d) => Some(d),
        None => {
            info!("estimating diameter from activity-based detection");
            super::estimate_diameter_from_activity(model, ops, mov)
        }
    };
    canonicalize_labels(&mut masks);
    let (centers, diams) = mask_centers(&masks);
    match median_diam {
        Some(d) => info!(
            ">>>> {} masks detected, median diameter = {:.2}",
            masks.max_label(),
            d
        ),
        None => info!(
            ">>>> {} masks detected, median diameter unavailable (estimation failed)",
            masks.max_label()
        ),
    }
    Ok(RoiDetection {
        masks,
        centers,
        median_diam,
        mask_diams: diams.iter().map(|&d| d as i32).collect(),
    })
}
