//! Deterministic threshold-based reference backend.
//!
//! Not a neural network: it segments by robust normalization plus a fixed
//! intensity threshold, and synthesizes flow fields that point away from
//! each mask's median member pixel with magnitude `5 * tanh(r / 2)`. The
//! decoder integrates pixels against the flow with step `-flow / 5`, so
//! every member pixel contracts onto that single integer sink and flow
//! decoding recovers exactly the thresholded components. Tests and the
//! demo binary use it in place of a pretrained backend; it ignores the
//! requested diameter and the flow-consistency threshold.

use super::{
    DiameterEstimate, EvalOutput, EvalParams, ModelError, NetOutput, SegmentationModel, TileTensor,
};
use crate::image::{normalize99, ImageF32, LabelImage};
use crate::masks::{canonicalize_labels, connected_components, gather_label_pixels, pixel_stats};

/// Magnitude scale matching the decoder's `-flow / 5` integration step.
const FLOW_SCALE: f32 = 5.0;

/// Threshold-based stand-in for a pretrained segmentation backend.
#[derive(Clone, Debug)]
pub struct ReferenceModel {
    /// Normalized-intensity threshold separating cells from background.
    pub cell_threshold: f32,
    /// Components below this pixel count are discarded.
    pub min_area: usize,
    /// Whether `eval` reports per-mask diameters (newer-generation
    /// behaviour); `false` mimics older backends.
    pub report_diameters: bool,
}

impl Default for ReferenceModel {
    fn default() -> Self {
        Self {
            cell_threshold: 0.5,
            min_area: 9,
            report_diameters: true,
        }
    }
}

impl ReferenceModel {
    /// Cell-probability map: positive where the normalized intensity
    /// exceeds the cell threshold.
    fn prob_map(&self, img: &ImageF32) -> ImageF32 {
        let mut norm = normalize99(img);
        norm.map_inplace(|v| (v.clamp(0.0, 1.0) - self.cell_threshold) * 6.0);
        norm
    }

    fn segment(&self, prob: &ImageF32, threshold: f32) -> LabelImage {
        let fg: Vec<bool> = prob.data.iter().map(|&v| v > threshold).collect();
        let mut masks = connected_components(&fg, prob.w, prob.h);
        let max_id = masks.max_label() as usize;
        if max_id > 0 {
            let mut counts = vec![0usize; max_id + 1];
            for &id in &masks.data {
                counts[id as usize] += 1;
            }
            for v in &mut masks.data {
                if *v > 0 && counts[*v as usize] < self.min_area {
                    *v = 0;
                }
            }
        }
        canonicalize_labels(&mut masks);
        masks
    }

    fn flows_for(&self, masks: &LabelImage, prob: ImageF32) -> NetOutput {
        let mut flow_y = ImageF32::new(masks.w, masks.h);
        let mut flow_x = ImageF32::new(masks.w, masks.h);
        for (ys, xs) in gather_label_pixels(masks) {
            if ys.is_empty() {
                continue;
            }
            // Flows radiate from the median-snapped member pixel, so the
            // decoder's sinks land on integer positions.
            let med = pixel_stats(&ys, &xs).med;
            let (cy, cx) = (med[0] as f32, med[1] as f32);
            for (&y, &x) in ys.iter().zip(&xs) {
                let dy = y as f32 - cy;
                let dx = x as f32 - cx;
                let r = (dy * dy + dx * dx).sqrt();
                if r > f32::EPSILON {
                    let mag = FLOW_SCALE * (r / 2.0).tanh() / r;
                    flow_y.set(x, y, mag * dy);
                    flow_x.set(x, y, mag * dx);
                }
            }
        }
        NetOutput {
            flow_y,
            flow_x,
            cellprob: prob,
        }
    }
}

impl SegmentationModel for ReferenceModel {
    fn eval(&self, image: &ImageF32, params: &EvalParams) -> Result<EvalOutput, ModelError> {
        let prob = self.prob_map(image);
        let masks = self.segment(&prob, params.cellprob_threshold);
        let pixels = gather_label_pixels(&masks);
        let diameters = (self.report_diameters && !pixels.is_empty()).then(|| {
            DiameterEstimate::PerMask(
                pixels
                    .iter()
                    .map(|(ys, _)| 2.0 * (ys.len() as f32 / std::f32::consts::PI).sqrt())
                    .collect(),
            )
        });
        let fg_fraction = prob.data.iter().filter(|&&v| v > 0.0).count() as f32
            / prob.data.len().max(1) as f32;
        let styles = vec![fg_fraction, masks.max_label() as f32];
        let flows = self.flows_for(&masks, prob);
        Ok(EvalOutput {
            masks,
            flows,
            styles,
            diameters,
        })
    }

    fn forward(&self, batch: &[TileTensor]) -> Result<Vec<NetOutput>, ModelError> {
        Ok(batch
            .iter()
            .map(|tile| {
                let prob = self.prob_map(&tile.channels[0]);
                let masks = self.segment(&prob, 0.0);
                self.flows_for(&masks, prob)
            })
            .collect())
    }
}
