//! Activity-based (functional) region detection.
//!
//! A deliberately simple peak/grow detector over the max-projection of the
//! high-pass movie: repeatedly take the brightest remaining pixel, grow a
//! 4-connected region while pixels hold a fraction of the peak, emit a
//! stat weighted by the activity map, and blank the claimed pixels. It
//! serves both as the `anatomical_only = 0` detection mode and as the
//! fallback the diameter estimator leans on when the model cannot report
//! a scale.

use crate::image::{gaussian_blur, ImageF32};
use crate::masks::pixel_stats;
use crate::ops::ActivityParams;
use crate::types::Stat;
use log::info;

/// Detect active regions in the (high-pass filtered) movie's
/// max-projection.
pub fn detect(params: &ActivityParams, max_proj: &ImageF32) -> Vec<Stat> {
    let vmap = if params.smooth_sigma > 0.0 {
        gaussian_blur(max_proj, params.smooth_sigma)
    } else {
        max_proj.clone()
    };
    let (w, h) = (vmap.w, vmap.h);
    let mut v = vmap.clone();
    let mut stats = Vec::new();

    let v0 = v.max_value();
    if !(v0 > 0.0) {
        return stats;
    }
    let stop = v0 * params.threshold_scale;

    let mut stack = Vec::new();
    while stats.len() < params.max_regions {
        let (mut peak, mut peak_idx) = (f32::NEG_INFINITY, 0usize);
        for (i, &val) in v.data.iter().enumerate() {
            if val > peak {
                peak = val;
                peak_idx = i;
            }
        }
        if peak < stop {
            break;
        }

        // Grow a 4-connected region around the peak, blanking claimed
        // pixels so later peaks cannot reuse them.
        let grow = peak * params.grow_fraction;
        let mut ypix = Vec::new();
        let mut xpix = Vec::new();
        stack.clear();
        stack.push(peak_idx);
        v.data[peak_idx] = 0.0;
        while let Some(i) = stack.pop() {
            let (y, x) = (i / w, i % w);
            ypix.push(y);
            xpix.push(x);
            let mut visit = |j: usize, v: &mut ImageF32, stack: &mut Vec<usize>| {
                if v.data[j] > grow {
                    v.data[j] = 0.0;
                    stack.push(j);
                }
            };
            if x > 0 {
                visit(i - 1, &mut v, &mut stack);
            }
            if x + 1 < w {
                visit(i + 1, &mut v, &mut stack);
            }
            if y > 0 {
                visit(i - w, &mut v, &mut stack);
            }
            if y + 1 < h {
                visit(i + w, &mut v, &mut stack);
            }
        }

        if ypix.len() < params.min_pixels {
            continue;
        }
        let lam: Vec<f32> = ypix
            .iter()
            .zip(&xpix)
            .map(|(&y, &x)| vmap.get(x, y).max(0.0))
            .collect();
        let med = pixel_stats(&ypix, &xpix).med;
        stats.push(Stat {
            ypix,
            xpix,
            lam,
            med,
            footprint: 1.0,
            anatomical: false,
        });
    }
    info!("activity-based detection found {} regions", stats.len());
    stats
}
