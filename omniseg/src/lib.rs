//! Phase-contrast cell segmentation with a pretrained Omnipose-style network.
//!
//! The pieces mirror the batch workflow they serve: [`io::imread`] loads a
//! phase image, [`model::SegModel`] runs the network and turns its flow and
//! distance maps into labeled masks, and [`io::save_masks`] writes the
//! artifacts with the naming scheme downstream tooling expects.

pub mod dynamics;
pub mod io;
pub mod model;
pub mod transforms;

pub use io::SaveOptions;
pub use model::{gpu_available, SegModel};

use ndarray::{Array1, Array2, Array3, ArrayD};
use ndarray_stats::QuantileExt;
use serde::Deserialize;

/// Evaluation parameters. The defaults are the exact set the batch
/// segmentation workflow passes for `bact_phase_omni`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvalParams {
    /// Channel selection: `[0, 0]` collapses to grayscale with no second
    /// channel; a nonzero first entry picks that channel (1-based).
    pub channels: [u32; 2],
    /// Isotropic resize factor applied before evaluation; `None` means 1.
    pub rescale: Option<f32>,
    /// Distance-field threshold for mask candidate pixels.
    pub mask_threshold: f32,
    /// Flow-consistency cutoff for discarding masks; 0 disables the check.
    pub flow_threshold: f32,
    /// Render flow images as RGBA with magnitude in the alpha channel.
    pub transparency: bool,
    /// Omnipose-style reconstruction (unit flows, distance field).
    pub omni: bool,
    /// Group flow endpoints with DBSCAN instead of pixel bins.
    pub cluster: bool,
    /// Run mask reconstruction on the original grid after rescaling.
    pub resample: bool,
    /// Evaluate in overlapping tiles and blend.
    pub tile: bool,
    /// Euler integration steps; `None` derives from the distance field.
    pub niter: Option<usize>,
    /// Average the network over the four flip orientations.
    pub augment: bool,
    /// Experimental affinity-graph segmentation; rejected if set.
    pub affinity_seg: bool,
    /// Chatty per-image logging.
    pub verbose: bool,
}

impl Default for EvalParams {
    fn default() -> Self {
        EvalParams {
            channels: [0, 0],
            rescale: None,
            mask_threshold: -1.0,
            flow_threshold: 0.0,
            transparency: true,
            omni: true,
            cluster: true,
            resample: true,
            tile: false,
            niter: None,
            augment: false,
            affinity_seg: false,
            verbose: false,
        }
    }
}

/// A decoded image ready for evaluation: raw sample values as `f32` plus the
/// source dtype for preview reports.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// `(H, W)` or `(H, W, C)` raw sample values.
    pub data: ArrayD<f32>,
    /// Source sample type, numpy-style name.
    pub dtype: &'static str,
}

impl LoadedImage {
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Smallest raw sample value.
    pub fn min(&self) -> f32 {
        self.data.min().map_or(0.0, |v| *v)
    }

    /// Largest raw sample value.
    pub fn max(&self) -> f32 {
        self.data.max().map_or(0.0, |v| *v)
    }
}

/// Flow artifacts for one image.
#[derive(Debug, Clone)]
pub struct FlowSet {
    /// Flow rendering, `(H, W, 3)` RGB or `(H, W, 4)` RGBA.
    pub rgb: Array3<u8>,
    /// Raw flow components `[2, H, W]`, vertical then horizontal.
    pub dp: Array3<f32>,
    /// Distance field.
    pub distance: Array2<f32>,
    /// Boundary map when the network provides one.
    pub boundary: Option<Array2<f32>>,
}

/// One image's segmentation output.
#[derive(Debug, Clone)]
pub struct SegResult {
    /// Labeled mask, 0 = background.
    pub mask: Array2<u32>,
    pub flows: FlowSet,
    /// Style vector when the model exposes one.
    pub style: Option<Array1<f32>>,
}

impl SegResult {
    /// Number of distinct objects.
    pub fn object_count(&self) -> u32 {
        self.mask.iter().copied().max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_match_the_batch_call() {
        let p = EvalParams::default();
        assert_eq!(p.channels, [0, 0]);
        assert_eq!(p.rescale, None);
        assert_eq!(p.mask_threshold, -1.0);
        assert_eq!(p.flow_threshold, 0.0);
        assert!(p.transparency && p.omni && p.cluster && p.resample);
        assert!(!p.tile && !p.augment && !p.affinity_seg && !p.verbose);
        assert_eq!(p.niter, None);
    }
}
