//! Serializable summary of a detection run.
//!
//! Dumped as JSON by the demo binary; cheap enough to build on every run.

use serde::Serialize;

/// One named stage timing.
#[derive(Clone, Debug, Serialize)]
pub struct StageTiming {
    pub name: &'static str,
    pub elapsed_ms: f64,
}

/// Wall-clock breakdown of a detection run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TimingBreakdown {
    pub total_ms: f64,
    pub stages: Vec<StageTiming>,
}

impl TimingBreakdown {
    pub fn with_total(total_ms: f64) -> Self {
        Self {
            total_ms,
            stages: Vec::new(),
        }
    }

    pub fn push(&mut self, name: &'static str, elapsed_ms: f64) {
        self.stages.push(StageTiming { name, elapsed_ms });
    }
}

/// Headline numbers of one `select_rois` invocation.
#[derive(Clone, Debug, Serialize)]
pub struct DetectionSummary {
    /// Projection mode the run used (0..=3).
    pub mode: u8,
    /// Number of region records returned.
    pub n_rois: usize,
    /// How many footprints were anatomically refined (assist mode only).
    pub n_refined: usize,
    /// Median cell diameter, when one could be derived.
    pub diameter_estimate: Option<f32>,
    pub timings: TimingBreakdown,
}
