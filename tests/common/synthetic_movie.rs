use cell_detector::Movie;

/// One Gaussian cell: center row/col, sigma, peak amplitude.
pub type Blob = (f32, f32, f32, f32);

/// Generates a movie of Gaussian blobs whose brightness oscillates over
/// time, the synthetic stand-in for flickering cells.
pub fn blob_movie(nframes: usize, ly: usize, lx: usize, blobs: &[Blob]) -> Movie {
    assert!(nframes > 0 && ly > 0 && lx > 0, "movie dimensions must be positive");
    let mut mov = Movie::new(nframes, ly, lx);
    for t in 0..nframes {
        let gain = 1.0 + 0.8 * (t as f32 * 0.37).sin();
        let frame = mov.frame_mut(t);
        for y in 0..ly {
            for x in 0..lx {
                let mut v = 0.0;
                for &(cy, cx, sigma, amp) in blobs {
                    let dy = y as f32 - cy;
                    let dx = x as f32 - cx;
                    v += amp * gain * (-(dy * dy + dx * dx) / (2.0 * sigma * sigma)).exp();
                }
                frame[y * lx + x] = v;
            }
        }
    }
    mov
}
