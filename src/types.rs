use serde::Serialize;

/// Per-region pixel/weight record produced by detection.
///
/// `ypix`/`xpix`/`lam` run in lockstep: one weight per member pixel. `med`
/// is a member pixel closest to the coordinate medians, used as the
/// region's representative point. Refinement rewrites the footprint in
/// place and flips `anatomical`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Stat {
    /// Row index of every member pixel.
    pub ypix: Vec<usize>,
    /// Column index of every member pixel.
    pub xpix: Vec<usize>,
    /// Per-pixel non-negative weight.
    pub lam: Vec<f32>,
    /// Representative (row, col) member pixel.
    pub med: [usize; 2],
    /// Footprint flag carried for downstream consumers.
    pub footprint: f32,
    /// Whether the footprint came from (or was refined by) anatomical
    /// detection.
    pub anatomical: bool,
}

impl Stat {
    /// Number of member pixels.
    pub fn npix(&self) -> usize {
        self.ypix.len()
    }
}
