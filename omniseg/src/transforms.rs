//! Image preparation in front of the network: channel selection, intensity
//! normalization, rescaling, and padding.

use anyhow::{anyhow, bail, ensure, Result};
use ndarray::{s, Array2, ArrayD, ArrayView2, Axis, Ix2};

/// Pick the working channel(s) out of a decoded image.
///
/// Two-dimensional images pass through. For three-dimensional images the
/// smallest axis is taken to be the channel axis (the usual heuristic for
/// microscopy stacks). `channels[0] == 0` collapses to the grayscale mean;
/// a nonzero entry selects that channel, 1-based. `channels[1]` optionally
/// picks a second channel for the network's second input plane.
pub fn select_channels(
    image: &ArrayD<f32>,
    channels: [u32; 2],
) -> Result<(Array2<f32>, Option<Array2<f32>>)> {
    match image.ndim() {
        2 => {
            let plane = image.view().into_dimensionality::<Ix2>()?.to_owned();
            Ok((plane, None))
        }
        3 => {
            let axis = channel_axis(image.shape());
            let count = image.shape()[axis];
            let first = match channels[0] {
                0 => image
                    .mean_axis(Axis(axis))
                    .ok_or_else(|| anyhow!("image has an empty channel axis"))?,
                c => plane(image, axis, c, count)?,
            };
            let second = match channels[1] {
                0 => None,
                c => Some(plane(image, axis, c, count)?.into_dimensionality::<Ix2>()?),
            };
            Ok((first.into_dimensionality::<Ix2>()?, second))
        }
        n => bail!("expected a 2- or 3-dimensional image, got {n} axes"),
    }
}

/// First axis of minimal length.
fn channel_axis(shape: &[usize]) -> usize {
    let mut axis = 0;
    for (i, &d) in shape.iter().enumerate() {
        if d < shape[axis] {
            axis = i;
        }
    }
    axis
}

fn plane(image: &ArrayD<f32>, axis: usize, selection: u32, count: usize) -> Result<ArrayD<f32>> {
    let index = selection as usize - 1;
    ensure!(
        index < count,
        "channel {selection} out of range for {count}-channel image"
    );
    Ok(image.index_axis(Axis(axis), index).to_owned())
}

/// Rescale intensities so the 1st percentile maps to 0 and the 99th to 1.
/// A flat image comes back all zero.
pub fn normalize99(image: &Array2<f32>) -> Array2<f32> {
    let mut values: Vec<f32> = image.iter().copied().collect();
    if values.is_empty() {
        return image.clone();
    }
    values.sort_by(f32::total_cmp);
    let p01 = percentile_sorted(&values, 0.01);
    let p99 = percentile_sorted(&values, 0.99);
    let range = p99 - p01;
    if range <= f32::EPSILON {
        return Array2::zeros(image.raw_dim());
    }
    image.mapv(|v| (v - p01) / range)
}

/// Linear-interpolated percentile of an ascending slice, numpy style.
fn percentile_sorted(sorted: &[f32], q: f64) -> f32 {
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = (rank - lo as f64) as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Bilinear resize with the half-pixel center convention.
pub fn resize_bilinear(image: &Array2<f32>, new_h: usize, new_w: usize) -> Array2<f32> {
    let (h, w) = image.dim();
    if (new_h, new_w) == (h, w) {
        return image.clone();
    }
    let sy = h as f32 / new_h as f32;
    let sx = w as f32 / new_w as f32;
    let mut out = Array2::zeros((new_h, new_w));
    for y in 0..new_h {
        let fy = ((y as f32 + 0.5) * sy - 0.5).clamp(0.0, (h - 1) as f32);
        let y0 = fy.floor() as usize;
        let y1 = (y0 + 1).min(h - 1);
        let wy = fy - y0 as f32;
        for x in 0..new_w {
            let fx = ((x as f32 + 0.5) * sx - 0.5).clamp(0.0, (w - 1) as f32);
            let x0 = fx.floor() as usize;
            let x1 = (x0 + 1).min(w - 1);
            let wx = fx - x0 as f32;
            out[[y, x]] = image[[y0, x0]] * (1.0 - wy) * (1.0 - wx)
                + image[[y0, x1]] * (1.0 - wy) * wx
                + image[[y1, x0]] * wy * (1.0 - wx)
                + image[[y1, x1]] * wy * wx;
        }
    }
    out
}

/// Nearest-neighbor resize for label images.
pub fn resize_nearest_u32(mask: &Array2<u32>, new_h: usize, new_w: usize) -> Array2<u32> {
    let (h, w) = mask.dim();
    if (new_h, new_w) == (h, w) {
        return mask.clone();
    }
    let sy = h as f32 / new_h as f32;
    let sx = w as f32 / new_w as f32;
    let mut out = Array2::zeros((new_h, new_w));
    for y in 0..new_h {
        let sy0 = ((y as f32 * sy) as usize).min(h - 1);
        for x in 0..new_w {
            let sx0 = ((x as f32 * sx) as usize).min(w - 1);
            out[[y, x]] = mask[[sy0, sx0]];
        }
    }
    out
}

/// Where a padded image came from, for cropping network outputs back.
#[derive(Debug, Clone, Copy)]
pub struct Padding {
    pub top: usize,
    pub left: usize,
    pub height: usize,
    pub width: usize,
}

/// Pad both axes up to the next multiple of 16 by replicating edge pixels.
/// The network downsamples by powers of two, so its input must divide evenly.
pub fn pad_to_16(image: &Array2<f32>) -> (Array2<f32>, Padding) {
    let (h, w) = image.dim();
    let ph = h.next_multiple_of(16);
    let pw = w.next_multiple_of(16);
    let top = (ph - h) / 2;
    let left = (pw - w) / 2;
    let mut out = Array2::zeros((ph, pw));
    for y in 0..ph {
        let sy = y.saturating_sub(top).min(h - 1);
        for x in 0..pw {
            let sx = x.saturating_sub(left).min(w - 1);
            out[[y, x]] = image[[sy, sx]];
        }
    }
    (
        out,
        Padding {
            top,
            left,
            height: h,
            width: w,
        },
    )
}

/// Undo [`pad_to_16`] on a network output map.
pub fn crop(field: ArrayView2<'_, f32>, pad: &Padding) -> Array2<f32> {
    field
        .slice(s![
            pad.top..pad.top + pad.height,
            pad.left..pad.left + pad.width
        ])
        .to_owned()
}
