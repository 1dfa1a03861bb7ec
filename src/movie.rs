//! Binned movie volume (`frames × ly × lx`, f32) and its temporal
//! reductions.
//!
//! The detection pipeline consumes the movie through three operations: the
//! temporal mean, a temporal high-pass filter applied in place, and the
//! max-projection of the filtered movie. The high-pass filter picks a
//! rolling block-mean variant for wide windows and a Gaussian variant for
//! narrow ones, where "narrow" is anything under ten frames.

use crate::image::filters::gaussian_taps;
use crate::image::ImageF32;

/// Threshold (in frames) below which the Gaussian high-pass variant runs.
const GAUSSIAN_HP_LIMIT: usize = 10;

/// Owned movie volume in frame-major layout.
#[derive(Clone, Debug)]
pub struct Movie {
    /// Number of frames.
    pub nframes: usize,
    /// Frame height in pixels.
    pub ly: usize,
    /// Frame width in pixels.
    pub lx: usize,
    /// Backing storage, frame-major then row-major.
    pub data: Vec<f32>,
}

impl Movie {
    /// Construct an all-zero movie of `nframes` frames of size `ly × lx`.
    pub fn new(nframes: usize, ly: usize, lx: usize) -> Self {
        Self {
            nframes,
            ly,
            lx,
            data: vec![0.0; nframes * ly * lx],
        }
    }

    /// Wrap an existing frame-major buffer of length `nframes * ly * lx`.
    pub fn from_vec(nframes: usize, ly: usize, lx: usize, data: Vec<f32>) -> Self {
        assert_eq!(
            data.len(),
            nframes * ly * lx,
            "buffer length must equal nframes * ly * lx"
        );
        Self {
            nframes,
            ly,
            lx,
            data,
        }
    }

    #[inline]
    fn frame_len(&self) -> usize {
        self.ly * self.lx
    }

    /// Borrow frame `t` as a row-major slice.
    pub fn frame(&self, t: usize) -> &[f32] {
        let len = self.frame_len();
        &self.data[t * len..(t + 1) * len]
    }

    /// Borrow frame `t` mutably.
    pub fn frame_mut(&mut self, t: usize) -> &mut [f32] {
        let len = self.frame_len();
        &mut self.data[t * len..(t + 1) * len]
    }

    /// Pixelwise mean over frames.
    pub fn mean_image(&self) -> ImageF32 {
        assert!(self.nframes > 0, "mean of an empty movie");
        let len = self.frame_len();
        let mut acc = vec![0.0f64; len];
        for t in 0..self.nframes {
            for (a, &v) in acc.iter_mut().zip(self.frame(t)) {
                *a += v as f64;
            }
        }
        let inv = 1.0 / self.nframes as f64;
        let data = acc.iter().map(|&a| (a * inv) as f32).collect();
        ImageF32::from_vec(self.lx, self.ly, data)
    }

    /// Pixelwise maximum over frames.
    pub fn max_projection(&self) -> ImageF32 {
        assert!(self.nframes > 0, "max-projection of an empty movie");
        let len = self.frame_len();
        let mut acc = vec![f32::NEG_INFINITY; len];
        for t in 0..self.nframes {
            for (a, &v) in acc.iter_mut().zip(self.frame(t)) {
                *a = a.max(v);
            }
        }
        ImageF32::from_vec(self.lx, self.ly, acc)
    }

    /// Pixelwise standard deviation over frames (population).
    pub fn std_image(&self) -> ImageF32 {
        assert!(self.nframes > 0, "std of an empty movie");
        let len = self.frame_len();
        let mut sum = vec![0.0f64; len];
        let mut sumsq = vec![0.0f64; len];
        for t in 0..self.nframes {
            for (i, &v) in self.frame(t).iter().enumerate() {
                sum[i] += v as f64;
                sumsq[i] += (v as f64) * (v as f64);
            }
        }
        let inv = 1.0 / self.nframes as f64;
        let data = sum
            .iter()
            .zip(&sumsq)
            .map(|(&s, &sq)| {
                let var = (sq * inv - (s * inv) * (s * inv)).max(0.0);
                var.sqrt() as f32
            })
            .collect();
        ImageF32::from_vec(self.lx, self.ly, data)
    }

    /// Temporal high-pass filter, in place.
    ///
    /// Wide windows subtract the mean of each consecutive block of `width`
    /// frames; narrow windows subtract a temporal Gaussian smoothing with
    /// sigma `width`.
    pub fn temporal_high_pass(&mut self, width: usize) {
        let width = width.max(1);
        if width < GAUSSIAN_HP_LIMIT {
            self.high_pass_gaussian(width);
        } else {
            self.high_pass_rolling_mean(width);
        }
    }

    fn high_pass_rolling_mean(&mut self, width: usize) {
        let len = self.frame_len();
        let mut block_mean = vec![0.0f32; len];
        let mut start = 0;
        while start < self.nframes {
            let end = (start + width).min(self.nframes);
            let n = (end - start) as f32;
            block_mean.iter_mut().for_each(|m| *m = 0.0);
            for t in start..end {
                for (m, &v) in block_mean.iter_mut().zip(self.frame(t)) {
                    *m += v;
                }
            }
            for m in &mut block_mean {
                *m /= n;
            }
            for t in start..end {
                for (v, &m) in self.frame_mut(t).iter_mut().zip(&block_mean) {
                    *v -= m;
                }
            }
            start = end;
        }
    }

    fn high_pass_gaussian(&mut self, width: usize) {
        let taps = gaussian_taps(width as f32);
        let radius = taps.len() / 2;
        let len = self.frame_len();
        let nframes = self.nframes as isize;
        let mut smooth = vec![0.0f32; self.data.len()];
        for t in 0..self.nframes {
            let dst = &mut smooth[t * len..(t + 1) * len];
            for (k, &tap) in taps.iter().enumerate() {
                let st = (t as isize + k as isize - radius as isize).clamp(0, nframes - 1) as usize;
                let src = &self.data[st * len..(st + 1) * len];
                for (d, &s) in dst.iter_mut().zip(src) {
                    *d += tap * s;
                }
            }
        }
        for (v, &s) in self.data.iter_mut().zip(&smooth) {
            *v -= s;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_movie() -> Movie {
        // 4 frames of 2x2, pixel p in frame t holds t + p.
        let mut data = Vec::new();
        for t in 0..4 {
            for p in 0..4 {
                data.push((t + p) as f32);
            }
        }
        Movie::from_vec(4, 2, 2, data)
    }

    #[test]
    fn mean_and_max_projections() {
        let mov = ramp_movie();
        let mean = mov.mean_image();
        let max = mov.max_projection();
        for p in 0..4 {
            assert!((mean.data[p] - (1.5 + p as f32)).abs() < 1e-6);
            assert_eq!(max.data[p], 3.0 + p as f32);
        }
    }

    #[test]
    fn rolling_mean_high_pass_zeroes_block_means() {
        let mut mov = ramp_movie();
        mov.temporal_high_pass(20);
        // A single block spans the whole movie; each pixel trace must be
        // zero-mean afterwards.
        for p in 0..4 {
            let trace: f32 = (0..4).map(|t| mov.frame(t)[p]).sum();
            assert!(trace.abs() < 1e-5, "trace sum {}", trace);
        }
    }

    #[test]
    fn gaussian_high_pass_removes_constant_offsets() {
        let mut mov = Movie::from_vec(6, 1, 1, vec![5.0; 6]);
        mov.temporal_high_pass(2);
        for t in 0..6 {
            assert!(mov.frame(t)[0].abs() < 1e-5);
        }
    }

    #[test]
    fn std_image_of_constant_movie_is_zero() {
        let mov = Movie::from_vec(3, 1, 2, vec![2.0; 6]);
        let sd = mov.std_image();
        assert!(sd.data.iter().all(|&v| v.abs() < 1e-6));
    }
}
