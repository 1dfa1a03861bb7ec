//! Separable Gaussian filtering and robust intensity normalization.
//!
//! The Gaussian kernel is derived from a sigma at call time (the spatial
//! high-pass scale depends on the configured cell diameter), truncated at
//! four sigmas like the usual ndimage convention. Edges are clamped.

use super::{ImageF32, ImageView, ImageViewMut};

/// 1D Gaussian taps for `sigma`, truncated at `4 * sigma` and normalized.
pub fn gaussian_taps(sigma: f32) -> Vec<f32> {
    assert!(sigma > 0.0, "sigma must be positive");
    let radius = (4.0 * sigma).ceil().max(1.0) as usize;
    let inv = 1.0 / (2.0 * sigma * sigma);
    let mut taps = Vec::with_capacity(2 * radius + 1);
    for k in 0..=2 * radius {
        let d = k as f32 - radius as f32;
        taps.push((-d * d * inv).exp());
    }
    let sum: f32 = taps.iter().sum();
    for t in &mut taps {
        *t /= sum;
    }
    taps
}

/// Convolve one row with `taps`, clamping at both ends.
pub fn filter_row(row: &[f32], out: &mut [f32], taps: &[f32]) {
    let radius = taps.len() / 2;
    let len = row.len();
    if len == 0 {
        return;
    }
    for (x, dst) in out.iter_mut().enumerate() {
        let mut acc = 0.0f32;
        for (k, &tap) in taps.iter().enumerate() {
            let idx = clamp_index(x as isize + k as isize - radius as isize, len);
            acc += tap * row[idx];
        }
        *dst = acc;
    }
}

/// Separable Gaussian blur with edge clamping.
pub fn gaussian_blur(img: &ImageF32, sigma: f32) -> ImageF32 {
    let taps = gaussian_taps(sigma);
    let radius = taps.len() / 2;

    let mut horiz = ImageF32::new(img.w, img.h);
    let mut scratch = vec![0.0f32; img.w];
    for y in 0..img.h {
        filter_row(img.row(y), &mut scratch, &taps);
        horiz.row_mut(y).copy_from_slice(&scratch);
    }

    let mut out = ImageF32::new(img.w, img.h);
    for y in 0..img.h {
        let dst = out.row_mut(y);
        for (k, &tap) in taps.iter().enumerate() {
            let sy = clamp_index(y as isize + k as isize - radius as isize, horiz.h);
            let src = &horiz.data[sy * horiz.stride..sy * horiz.stride + horiz.w];
            for (d, &s) in dst.iter_mut().zip(src) {
                *d += tap * s;
            }
        }
    }
    out
}

/// Percentile with linear interpolation between ranks (numpy convention).
pub fn percentile(values: &[f32], pct: f32) -> f32 {
    assert!(!values.is_empty(), "percentile of an empty slice");
    assert!((0.0..=100.0).contains(&pct), "percentile out of range");
    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    let rank = pct / 100.0 * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f32;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

/// Rescale intensities so the 1st percentile maps to 0 and the 99th to 1.
///
/// Values outside the percentile range are not clipped; callers clamp when
/// they need a bounded image. A flat image maps to all zeros.
pub fn normalize99(img: &ImageF32) -> ImageF32 {
    let p1 = percentile(&img.data, 1.0);
    let p99 = percentile(&img.data, 99.0);
    let mut out = img.clone();
    let range = p99 - p1;
    if range <= f32::EPSILON {
        out.map_inplace(|_| 0.0);
    } else {
        out.map_inplace(|v| (v - p1) / range);
    }
    out
}

fn clamp_index(idx: isize, upper: usize) -> usize {
    if upper == 0 {
        return 0;
    }
    idx.clamp(0, upper as isize - 1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_interpolates_between_ranks() {
        let v = [0.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&v, 0.0), 0.0);
        assert_eq!(percentile(&v, 100.0), 4.0);
        assert!((percentile(&v, 50.0) - 2.0).abs() < 1e-6);
        assert!((percentile(&v, 62.5) - 2.5).abs() < 1e-6);
    }

    #[test]
    fn blur_preserves_constant_images() {
        let img = ImageF32::from_vec(5, 4, vec![3.0; 20]);
        let blurred = gaussian_blur(&img, 1.5);
        for &v in &blurred.data {
            assert!((v - 3.0).abs() < 1e-5, "v={}", v);
        }
    }

    #[test]
    fn normalize99_maps_flat_images_to_zero() {
        let img = ImageF32::from_vec(3, 3, vec![7.0; 9]);
        let out = normalize99(&img);
        assert!(out.data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn gaussian_taps_sum_to_one() {
        let taps = gaussian_taps(2.0);
        let sum: f32 = taps.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert_eq!(taps.len() % 2, 1);
    }
}
