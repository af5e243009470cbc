//! The pretrained network and the evaluation pipeline around it.

use crate::transforms;
use crate::{dynamics, io, EvalParams, FlowSet, LoadedImage, SegResult};
use anyhow::{anyhow, bail, ensure, Context, Result};
use log::{info, warn};
use ndarray::{s, Array1, Array2, Array3, ArrayView3, Axis};
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;

/// Side of the square window used for tiled inference, a multiple of 16.
const TILE: usize = 224;
/// Fractional overlap between neighboring tiles.
const TILE_OVERLAP: f64 = 0.1;

/// Raw network prediction for one input: `[C, H, W]` maps with C of 3
/// (flow y, flow x, distance) or 4 (plus boundary), and the style vector
/// when the model exports one.
pub struct NetworkOutput {
    pub maps: Array3<f32>,
    pub style: Option<Array1<f32>>,
}

/// Anything that turns a `[2, H, W]` input into prediction maps. The ONNX
/// session implements this; tests substitute canned predictions.
pub trait Network {
    fn forward(&mut self, input: ArrayView3<'_, f32>) -> Result<NetworkOutput>;
}

/// True when the CUDA execution provider can actually be used here.
pub fn gpu_available() -> bool {
    CUDAExecutionProvider::default().is_available().unwrap_or(false)
}

struct OrtNetwork {
    session: Session,
    input_name: String,
    output_name: String,
    style_name: Option<String>,
}

impl OrtNetwork {
    fn load(path: &Path, use_gpu: bool) -> Result<OrtNetwork> {
        ensure!(
            path.is_file(),
            "model weights not found at {}",
            path.display()
        );
        // one intra-op thread keeps CPU runs bit-reproducible
        let mut builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?;
        if use_gpu {
            builder =
                builder.with_execution_providers([CUDAExecutionProvider::default().build()])?;
        }
        let session = builder
            .commit_from_file(path)
            .with_context(|| format!("loading ONNX model from {}", path.display()))?;
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| anyhow!("model exposes no inputs"))?;
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| anyhow!("model exposes no outputs"))?;
        let style_name = session.outputs.get(1).map(|output| output.name.clone());
        Ok(OrtNetwork {
            session,
            input_name,
            output_name,
            style_name,
        })
    }
}

impl Network for OrtNetwork {
    fn forward(&mut self, input: ArrayView3<'_, f32>) -> Result<NetworkOutput> {
        let (c, h, w) = input.dim();
        let mut data = Vec::with_capacity(c * h * w);
        data.extend(input.iter().copied());
        let tensor =
            Tensor::from_array((vec![1, c as i64, h as i64, w as i64], data))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => tensor])?;
        let (shape, flat) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
        let dims = &shape[..];
        ensure!(
            dims.len() == 4 && dims[0] == 1,
            "expected [1, C, H, W] prediction maps, got {dims:?}"
        );
        let maps = Array3::from_shape_vec(
            (dims[1] as usize, dims[2] as usize, dims[3] as usize),
            flat.to_vec(),
        )?;
        let style = match &self.style_name {
            Some(name) => {
                let (_, flat) = outputs[name.as_str()].try_extract_tensor::<f32>()?;
                Some(Array1::from_vec(flat.to_vec()))
            }
            None => None,
        };
        Ok(NetworkOutput { maps, style })
    }
}

/// A segmentation model: the network plus everything needed to go from a
/// decoded image to labeled masks.
pub struct SegModel {
    network: Box<dyn Network>,
}

impl SegModel {
    /// Load ONNX weights from disk. With `use_gpu` the CUDA provider is
    /// requested and the runtime falls back to CPU when it is missing.
    pub fn load(path: &Path, use_gpu: bool) -> Result<SegModel> {
        Ok(SegModel {
            network: Box::new(OrtNetwork::load(path, use_gpu)?),
        })
    }

    /// Wrap an arbitrary network implementation.
    pub fn from_network(network: Box<dyn Network>) -> SegModel {
        SegModel { network }
    }

    /// Segment a batch. Results come back in input order; the first failing
    /// image aborts the run with its index in the error chain.
    pub fn eval(&mut self, images: &[LoadedImage], params: &EvalParams) -> Result<Vec<SegResult>> {
        let mut results = Vec::with_capacity(images.len());
        for (index, image) in images.iter().enumerate() {
            let result = self
                .eval_one(image, params)
                .with_context(|| format!("segmenting image {index}"))?;
            if params.verbose {
                info!("image {index}: {} objects", result.object_count());
            }
            results.push(result);
        }
        Ok(results)
    }

    fn eval_one(&mut self, image: &LoadedImage, params: &EvalParams) -> Result<SegResult> {
        if params.affinity_seg {
            bail!("affinity graph reconstruction is not supported");
        }
        let (gray, second) = transforms::select_channels(&image.data, params.channels)?;
        let (h0, w0) = gray.dim();
        ensure!(
            h0 >= 2 && w0 >= 2,
            "image of {h0}x{w0} pixels is too small to segment"
        );
        let gray = transforms::normalize99(&gray);
        let second = second.map(|plane| transforms::normalize99(&plane));

        let rescale = params.rescale.unwrap_or(1.0);
        ensure!(rescale > 0.0, "rescale factor must be positive");
        let h1 = ((h0 as f32 * rescale).round().max(1.0)) as usize;
        let w1 = ((w0 as f32 * rescale).round().max(1.0)) as usize;
        let gray = transforms::resize_bilinear(&gray, h1, w1);
        let second = second.map(|plane| transforms::resize_bilinear(&plane, h1, w1));

        let (padded, pad) = transforms::pad_to_16(&gray);
        let second_padded = second.map(|plane| transforms::pad_to_16(&plane).0);
        let input = pack_input(&padded, second_padded.as_ref());

        let output = self.run_network(&input, params)?;
        let (channels, oh, ow) = output.maps.dim();
        ensure!(
            channels == 3 || channels == 4,
            "expected 3 or 4 prediction maps, got {channels}"
        );
        let (ph, pw) = padded.dim();
        ensure!(
            (oh, ow) == (ph, pw),
            "network returned {oh}x{ow} maps for a {ph}x{pw} input"
        );

        let dy = transforms::crop(output.maps.index_axis(Axis(0), 0), &pad);
        let dx = transforms::crop(output.maps.index_axis(Axis(0), 1), &pad);
        let dist = transforms::crop(output.maps.index_axis(Axis(0), 2), &pad);
        let boundary =
            (channels == 4).then(|| transforms::crop(output.maps.index_axis(Axis(0), 3), &pad));

        // With resample the fields go back to the original resolution before
        // mask recovery; otherwise the finished mask is resized instead.
        let at_original = (h1, w1) == (h0, w0);
        let (dy, dx, dist, boundary, mask_needs_resize) = if params.resample && !at_original {
            (
                transforms::resize_bilinear(&dy, h0, w0),
                transforms::resize_bilinear(&dx, h0, w0),
                transforms::resize_bilinear(&dist, h0, w0),
                boundary.map(|b| transforms::resize_bilinear(&b, h0, w0)),
                false,
            )
        } else {
            (dy, dx, dist, boundary, !at_original)
        };

        let mask = dynamics::compute_masks(&dy, &dx, &dist, params)?;
        let mask = if mask_needs_resize {
            transforms::resize_nearest_u32(&mask, h0, w0)
        } else {
            mask
        };

        let rgb = io::render_flow(&dy, &dx, params.transparency);
        let (fh, fw) = dy.dim();
        let mut dp = Array3::zeros((2, fh, fw));
        dp.index_axis_mut(Axis(0), 0).assign(&dy);
        dp.index_axis_mut(Axis(0), 1).assign(&dx);

        Ok(SegResult {
            mask,
            flows: FlowSet {
                rgb,
                dp,
                distance: dist,
                boundary,
            },
            style: output.style,
        })
    }

    fn run_network(&mut self, input: &Array3<f32>, params: &EvalParams) -> Result<NetworkOutput> {
        if params.tile {
            if params.augment {
                warn!("tiled and augmented inference both requested; tiling wins");
            }
            self.run_tiled(input)
        } else if params.augment {
            self.run_augmented(input)
        } else {
            self.network.forward(input.view())
        }
    }

    /// Average the predictions over the four axis flips, negating the flow
    /// component along each flipped axis when mapping back.
    fn run_augmented(&mut self, input: &Array3<f32>) -> Result<NetworkOutput> {
        let base = self.network.forward(input.view())?;
        let mut maps = base.maps;
        for (flip_y, flip_x) in [(true, false), (false, true), (true, true)] {
            let mut view = input.view();
            if flip_y {
                view.invert_axis(Axis(1));
            }
            if flip_x {
                view.invert_axis(Axis(2));
            }
            let output = self.network.forward(view)?;
            let mut flipped = output.maps;
            if flip_y {
                flipped.invert_axis(Axis(1));
                flipped.index_axis_mut(Axis(0), 0).mapv_inplace(|v| -v);
            }
            if flip_x {
                flipped.invert_axis(Axis(2));
                flipped.index_axis_mut(Axis(0), 1).mapv_inplace(|v| -v);
            }
            ensure!(
                flipped.dim() == maps.dim(),
                "augmented passes disagree on output shape"
            );
            maps += &flipped;
        }
        maps /= 4.0;
        Ok(NetworkOutput {
            maps,
            style: base.style,
        })
    }

    /// Run overlapping windows and blend them with a tapered weight so tile
    /// seams do not show in the stitched maps.
    fn run_tiled(&mut self, input: &Array3<f32>) -> Result<NetworkOutput> {
        let (_, h, w) = input.dim();
        if h <= TILE && w <= TILE {
            return self.network.forward(input.view());
        }
        let bh = TILE.min(h);
        let bw = TILE.min(w);
        let ys = tile_starts(h, bh);
        let xs = tile_starts(w, bw);
        let wy = taper_profile(bh);
        let wx = taper_profile(bw);

        let mut sum: Option<Array3<f32>> = None;
        let mut weight = Array2::<f32>::zeros((h, w));
        let mut style = None;
        for &y0 in &ys {
            for &x0 in &xs {
                let tile = input.slice(s![.., y0..y0 + bh, x0..x0 + bw]);
                let output = self.network.forward(tile)?;
                let NetworkOutput {
                    maps,
                    style: tile_style,
                } = output;
                let (oc, oh, ow) = maps.dim();
                ensure!(
                    (oh, ow) == (bh, bw),
                    "network returned {oh}x{ow} maps for a {bh}x{bw} tile"
                );
                let sum = sum.get_or_insert_with(|| Array3::zeros((oc, h, w)));
                ensure!(sum.dim().0 == oc, "tiles disagree on output channels");
                for ch in 0..oc {
                    for ty in 0..bh {
                        for tx in 0..bw {
                            sum[[ch, y0 + ty, x0 + tx]] += maps[[ch, ty, tx]] * wy[ty] * wx[tx];
                        }
                    }
                }
                for ty in 0..bh {
                    for tx in 0..bw {
                        weight[[y0 + ty, x0 + tx]] += wy[ty] * wx[tx];
                    }
                }
                if style.is_none() {
                    style = tile_style;
                }
            }
        }
        let mut maps = sum.ok_or_else(|| anyhow!("image produced no tiles"))?;
        for ch in 0..maps.dim().0 {
            let mut plane = maps.index_axis_mut(Axis(0), ch);
            plane /= &weight;
        }
        Ok(NetworkOutput { maps, style })
    }
}

fn pack_input(first: &Array2<f32>, second: Option<&Array2<f32>>) -> Array3<f32> {
    let (h, w) = first.dim();
    let mut input = Array3::zeros((2, h, w));
    input.index_axis_mut(Axis(0), 0).assign(first);
    if let Some(second) = second {
        input.index_axis_mut(Axis(0), 1).assign(second);
    }
    input
}

/// Evenly spaced tile origins covering `0..dim`, first at 0, last at
/// `dim - tile`.
fn tile_starts(dim: usize, tile: usize) -> Vec<usize> {
    if dim <= tile {
        return vec![0];
    }
    let count = (((1.0 + 2.0 * TILE_OVERLAP) * dim as f64 / tile as f64).ceil() as usize).max(2);
    let span = (dim - tile) as f64 / (count - 1) as f64;
    (0..count).map(|i| (i as f64 * span).round() as usize).collect()
}

/// Per-pixel blend weight along one tile axis: a linear ramp at both ends,
/// flat 1.0 in the middle, never zero.
fn taper_profile(len: usize) -> Vec<f32> {
    let ramp = (len / 8).max(1);
    (0..len)
        .map(|i| {
            let edge = (i + 1).min(len - i);
            (edge as f32 / ramp as f32).min(1.0)
        })
        .collect()
}
