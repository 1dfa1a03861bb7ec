//! Flow-field decoding.
//!
//! The segmentation network emits a per-pixel 2D flow plus a cell
//! probability. Decoding integrates every pixel along the (gated, scaled)
//! flow until the members of one cell pile up at a common sink, then
//! clusters the sinks: a padded 2D histogram of the converged positions is
//! scanned for local maxima, each seed is dilated a few times over
//! well-populated bins, and every pixel inherits the label of the bin it
//! converged into. Masks covering an implausibly large share of the frame
//! are discarded, and a flow-consistency check drops masks whose network
//! flows disagree with the mask's own radial field.

use crate::image::{ImageF32, LabelImage};
use crate::masks::{canonicalize_labels, fill_holes_and_remove_small_masks, gather_label_pixels};
use crate::model::NetOutput;
use nalgebra::Vector2;

/// Histogram padding around the frame, in bins.
const RPAD: usize = 20;
/// A sink bin must collect more than this many pixels to seed a mask.
const SEED_MIN_COUNT: u32 = 10;
/// Seed dilation keeps bins holding more than this many pixels.
const EXPAND_MIN_COUNT: u32 = 2;
/// Number of 3×3 dilation rounds applied to each seed.
const EXPAND_ITERS: usize = 5;
/// Masks claiming more than this fraction of the frame are discarded.
const MAX_MASK_FRACTION: f32 = 0.4;
/// Flow magnitude divisor in the integration step.
const STEP_SCALE: f32 = 5.0;

/// Integration step field: `-flow / 5` where the cell probability is
/// positive, zero elsewhere. Pixels outside cells therefore never move.
pub fn gated_steps(net: &NetOutput) -> (ImageF32, ImageF32) {
    let mut step_y = net.flow_y.clone();
    let mut step_x = net.flow_x.clone();
    for i in 0..step_y.data.len() {
        if net.cellprob.data[i] > 0.0 {
            step_y.data[i] = -step_y.data[i] / STEP_SCALE;
            step_x.data[i] = -step_x.data[i] / STEP_SCALE;
        } else {
            step_y.data[i] = 0.0;
            step_x.data[i] = 0.0;
        }
    }
    (step_y, step_x)
}

/// Integrate every pixel along the step field for `niter` iterations.
///
/// Positions stay clamped inside the frame; the step field is sampled
/// bilinearly at the current (fractional) position. Returns the final row
/// and column position of every pixel.
pub fn follow_flows(step_y: &ImageF32, step_x: &ImageF32, niter: usize) -> (ImageF32, ImageF32) {
    assert_eq!(
        (step_y.w, step_y.h),
        (step_x.w, step_x.h),
        "step channels must share a shape"
    );
    let (w, h) = (step_y.w, step_y.h);
    let mut py = ImageF32::new(w, h);
    let mut px = ImageF32::new(w, h);
    for y in 0..h {
        for x in 0..w {
            py.set(x, y, y as f32);
            px.set(x, y, x as f32);
        }
    }
    let max_y = (h.saturating_sub(1)) as f32;
    let max_x = (w.saturating_sub(1)) as f32;
    for _ in 0..niter {
        for i in 0..py.data.len() {
            let (row, col) = (py.data[i], px.data[i]);
            let step = Vector2::new(
                sample_bilinear(step_y, row, col),
                sample_bilinear(step_x, row, col),
            );
            if step.x == 0.0 && step.y == 0.0 {
                continue;
            }
            py.data[i] = (row + step.x).clamp(0.0, max_y);
            px.data[i] = (col + step.y).clamp(0.0, max_x);
        }
    }
    (py, px)
}

/// Bilinear sample of `img` at fractional (row, col), clamped to the
/// frame.
fn sample_bilinear(img: &ImageF32, y: f32, x: f32) -> f32 {
    let y = y.clamp(0.0, img.h as f32 - 1.0);
    let x = x.clamp(0.0, img.w as f32 - 1.0);
    let y0 = y.floor() as usize;
    let x0 = x.floor() as usize;
    let y1 = (y0 + 1).min(img.h - 1);
    let x1 = (x0 + 1).min(img.w - 1);
    let fy = y - y0 as f32;
    let fx = x - x0 as f32;
    let top = img.get(x0, y0) * (1.0 - fx) + img.get(x1, y0) * fx;
    let bot = img.get(x0, y1) * (1.0 - fx) + img.get(x1, y1) * fx;
    top * (1.0 - fy) + bot * fy
}

/// Cluster converged positions into a label mask.
///
/// `flows` enables the flow-consistency check: masks whose network flow
/// disagrees with the mask's own radial unit field by more than
/// `flow_error_threshold` (mean squared difference of unit vectors) are
/// removed.
pub fn get_masks(
    py: &ImageF32,
    px: &ImageF32,
    flows: Option<(&ImageF32, &ImageF32)>,
    flow_error_threshold: f32,
) -> LabelImage {
    let (w, h) = (py.w, py.h);
    let (hw, hh) = (w + 2 * RPAD, h + 2 * RPAD);
    let npix = w * h;

    // Padded histogram of rounded sink positions.
    let mut counts = vec![0u32; hw * hh];
    let mut bins = vec![0usize; npix];
    for i in 0..npix {
        let by = (py.data[i].round().max(0.0) as usize).min(h - 1) + RPAD;
        let bx = (px.data[i].round().max(0.0) as usize).min(w - 1) + RPAD;
        let bin = by * hw + bx;
        counts[bin] += 1;
        bins[i] = bin;
    }

    // Seeds: local maxima (5-wide window per axis) with enough mass.
    let maxed = max_filter_5(&counts, hw, hh);
    let mut seeds: Vec<(usize, u32)> = counts
        .iter()
        .enumerate()
        .filter(|&(bin, &c)| c > SEED_MIN_COUNT && c == maxed[bin])
        .map(|(bin, &c)| (bin, c))
        .collect();
    seeds.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    // Dilate each seed over well-populated bins; later (smaller) seeds
    // overwrite on overlap, matching the write order below.
    let mut bin_label = vec![0u32; hw * hh];
    for (k, &(seed, _)) in seeds.iter().enumerate() {
        let mut members = vec![seed];
        let mut in_set = std::collections::HashSet::from([seed]);
        for _ in 0..EXPAND_ITERS {
            let mut next = Vec::new();
            let mut next_set = std::collections::HashSet::new();
            for &bin in &members {
                let (by, bx) = (bin / hw, bin % hw);
                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        let ny = by as i64 + dy;
                        let nx = bx as i64 + dx;
                        if ny < 0 || nx < 0 || ny >= hh as i64 || nx >= hw as i64 {
                            continue;
                        }
                        let nb = ny as usize * hw + nx as usize;
                        if counts[nb] > EXPAND_MIN_COUNT && next_set.insert(nb) {
                            next.push(nb);
                        }
                    }
                }
            }
            if next.len() == members.len() && next_set == in_set {
                break;
            }
            members = next;
            in_set = next_set;
        }
        for &bin in &members {
            bin_label[bin] = k as u32 + 1;
        }
    }

    let mut masks = LabelImage::new(w, h);
    for i in 0..npix {
        masks.data[i] = bin_label[bins[i]];
    }

    // Remove masks that swallowed an implausible share of the frame.
    let max_id = masks.max_label() as usize;
    if max_id > 0 {
        let mut sizes = vec![0usize; max_id + 1];
        for &id in &masks.data {
            sizes[id as usize] += 1;
        }
        let limit = (npix as f32 * MAX_MASK_FRACTION) as usize;
        for v in &mut masks.data {
            if *v > 0 && sizes[*v as usize] > limit {
                *v = 0;
            }
        }
    }
    canonicalize_labels(&mut masks);

    if let Some((flow_y, flow_x)) = flows {
        if flow_error_threshold > 0.0 {
            remove_inconsistent_masks(&mut masks, flow_y, flow_x, flow_error_threshold);
        }
    }
    masks
}

/// Decode one network output into a label mask.
///
/// Composite of the gated integration, sink clustering, hole filling and
/// small-mask removal applied to every patch.
pub fn decode_flows(
    net: &NetOutput,
    niter: usize,
    flow_error_threshold: f32,
    min_size: usize,
) -> LabelImage {
    let (step_y, step_x) = gated_steps(net);
    let (py, px) = follow_flows(&step_y, &step_x, niter);
    let mut masks = get_masks(
        &py,
        &px,
        Some((&net.flow_y, &net.flow_x)),
        flow_error_threshold,
    );
    fill_holes_and_remove_small_masks(&mut masks, min_size);
    masks
}

/// Separable 5-wide maximum filter over a 2D grid.
fn max_filter_5(counts: &[u32], w: usize, h: usize) -> Vec<u32> {
    let mut horiz = vec![0u32; counts.len()];
    for y in 0..h {
        for x in 0..w {
            let lo = x.saturating_sub(2);
            let hi = (x + 2).min(w - 1);
            let mut m = 0;
            for nx in lo..=hi {
                m = m.max(counts[y * w + nx]);
            }
            horiz[y * w + x] = m;
        }
    }
    let mut out = vec![0u32; counts.len()];
    for y in 0..h {
        let lo = y.saturating_sub(2);
        let hi = (y + 2).min(h - 1);
        for x in 0..w {
            let mut m = 0;
            for ny in lo..=hi {
                m = m.max(horiz[ny * w + x]);
            }
            out[y * w + x] = m;
        }
    }
    out
}

/// Drop masks whose network flow disagrees with the mask's own radial
/// field, then repack ids.
fn remove_inconsistent_masks(
    masks: &mut LabelImage,
    flow_y: &ImageF32,
    flow_x: &ImageF32,
    threshold: f32,
) {
    let errors = flow_errors(masks, flow_y, flow_x);
    if errors.is_empty() {
        return;
    }
    let mut removed = false;
    for v in &mut masks.data {
        if *v > 0 && errors[*v as usize - 1] > threshold {
            *v = 0;
            removed = true;
        }
    }
    if removed {
        canonicalize_labels(masks);
    }
}

/// Mean squared difference between the unit network flow and the unit
/// radial field around the mask's median pixel, per mask id.
pub fn flow_errors(masks: &LabelImage, flow_y: &ImageF32, flow_x: &ImageF32) -> Vec<f32> {
    let pixels = gather_label_pixels(masks);
    let mut errors = vec![0.0f32; pixels.len()];
    for (k, (ys, xs)) in pixels.iter().enumerate() {
        if ys.is_empty() {
            continue;
        }
        let n = ys.len() as f32;
        let med = crate::masks::pixel_stats(ys, xs).med;
        let (cy, cx) = (med[0] as f32, med[1] as f32);
        let mut err = 0.0f32;
        for (&y, &x) in ys.iter().zip(xs) {
            let net = Vector2::new(flow_y.get(x, y), flow_x.get(x, y));
            let net_unit = if net.norm() > f32::EPSILON {
                net / net.norm()
            } else {
                Vector2::zeros()
            };
            let radial = Vector2::new(y as f32 - cy, x as f32 - cx);
            let radial_unit = if radial.norm() > f32::EPSILON {
                radial / radial.norm()
            } else {
                Vector2::zeros()
            };
            err += (net_unit - radial_unit).norm_squared();
        }
        errors[k] = err / n;
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NetOutput;

    /// Block of ones with outward flows contracting onto the median member
    /// pixel, the same convention the network uses.
    fn block_net(w: usize, h: usize, y0: usize, y1: usize, x0: usize, x1: usize) -> NetOutput {
        let mut flow_y = ImageF32::new(w, h);
        let mut flow_x = ImageF32::new(w, h);
        let mut cellprob = ImageF32::new(w, h);
        cellprob.map_inplace(|_| -3.0);
        let mut ys = Vec::new();
        let mut xs = Vec::new();
        for y in y0..y1 {
            for x in x0..x1 {
                ys.push(y);
                xs.push(x);
            }
        }
        let med = crate::masks::pixel_stats(&ys, &xs).med;
        let (cy, cx) = (med[0] as f32, med[1] as f32);
        for (&y, &x) in ys.iter().zip(&xs) {
            cellprob.set(x, y, 3.0);
            let dy = y as f32 - cy;
            let dx = x as f32 - cx;
            let r = (dy * dy + dx * dx).sqrt();
            if r > f32::EPSILON {
                let mag = 5.0 * (r / 2.0).tanh() / r;
                flow_y.set(x, y, mag * dy);
                flow_x.set(x, y, mag * dx);
            }
        }
        NetOutput {
            flow_y,
            flow_x,
            cellprob,
        }
    }

    #[test]
    fn follow_flows_contracts_members_onto_the_sink() {
        let net = block_net(20, 20, 4, 11, 5, 12);
        let (sy, sx) = gated_steps(&net);
        let (py, px) = follow_flows(&sy, &sx, 200);
        for y in 4..11 {
            for x in 5..12 {
                let i = y * 20 + x;
                assert!((py.data[i] - 7.0).abs() < 0.75, "py={}", py.data[i]);
                assert!((px.data[i] - 8.0).abs() < 0.75, "px={}", px.data[i]);
            }
        }
        // Background pixels never move.
        assert_eq!(py.get(0, 0), 0.0);
        assert_eq!(px.get(19, 19), 19.0);
    }

    #[test]
    fn decode_recovers_the_block_exactly() {
        let net = block_net(24, 24, 6, 11, 8, 13);
        let masks = decode_flows(&net, 200, 1.0, 15);
        assert_eq!(masks.max_label(), 1);
        let mut inside = 0;
        for y in 0..24 {
            for x in 0..24 {
                let expect = (6..11).contains(&y) && (8..13).contains(&x);
                if masks.get(x, y) == 1 {
                    inside += 1;
                }
                assert_eq!(masks.get(x, y) == 1, expect, "y={} x={}", y, x);
            }
        }
        assert_eq!(inside, 25);
    }

    #[test]
    fn masks_below_min_size_are_dropped() {
        // 3x4 block: enough mass to seed a sink, but 12 px < 15.
        let net = block_net(24, 24, 6, 9, 8, 12);
        let masks = decode_flows(&net, 200, 1.0, 15);
        assert_eq!(masks.max_label(), 0);
    }

    #[test]
    fn inconsistent_flows_fail_the_qc_check() {
        let mut net = block_net(24, 24, 6, 12, 8, 14);
        // Flip the flow the decoder never saw: the mask still forms from
        // the gated steps, but the raw flows disagree with the radial
        // field everywhere.
        let decoded = {
            let (sy, sx) = gated_steps(&net);
            let (py, px) = follow_flows(&sy, &sx, 200);
            net.flow_y.map_inplace(|v| -v);
            net.flow_x.map_inplace(|v| -v);
            get_masks(&py, &px, Some((&net.flow_y, &net.flow_x)), 1.0)
        };
        assert_eq!(decoded.max_label(), 0);
    }

    #[test]
    fn two_blobs_get_distinct_labels() {
        let a = block_net(32, 32, 4, 9, 4, 9);
        let b = block_net(32, 32, 20, 26, 20, 26);
        let mut net = a;
        for i in 0..net.flow_y.data.len() {
            if b.cellprob.data[i] > 0.0 {
                net.flow_y.data[i] = b.flow_y.data[i];
                net.flow_x.data[i] = b.flow_x.data[i];
                net.cellprob.data[i] = 3.0;
            }
        }
        let masks = decode_flows(&net, 200, 1.0, 15);
        assert_eq!(masks.max_label(), 2);
        assert_ne!(masks.get(6, 6), masks.get(22, 22));
        assert_ne!(masks.get(6, 6), 0);
    }
}
