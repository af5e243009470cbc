//! Mask recovery: follow the predicted flow field until pixels of the same
//! object pile up, then group the converged points into labels.

use crate::EvalParams;
use anyhow::{ensure, Result};
use ndarray::{Array2, Zip};
use std::collections::{HashMap, VecDeque};

/// Clustering radius for converged points, in pixels.
const DBSCAN_EPS: f32 = 2.0;
/// Minimum neighborhood size (the point itself included) for a core point.
const DBSCAN_MIN_SAMPLES: usize = 5;
/// Cap on derived Euler iteration counts.
const MAX_NITER: usize = 200;

/// Turn predicted flows and a distance map into a labeled mask.
///
/// Pixels with `dist > mask_threshold` are candidates. Each candidate walks
/// the flow field by Euler steps; the walk end points are grouped either by
/// DBSCAN (`cluster`) or by rounding to pixel bins and joining 8-connected
/// ones. Labels are background 0 and objects numbered from 1 in row-major
/// order of first appearance. A positive `flow_threshold` afterwards drops
/// objects whose shape disagrees with the flows that produced them.
pub fn compute_masks(
    dy: &Array2<f32>,
    dx: &Array2<f32>,
    dist: &Array2<f32>,
    params: &EvalParams,
) -> Result<Array2<u32>> {
    let (h, w) = dist.dim();
    ensure!(
        dy.dim() == (h, w) && dx.dim() == (h, w),
        "flow and distance maps disagree on shape"
    );

    let mut candidates = Vec::new();
    for ((y, x), &d) in dist.indexed_iter() {
        if d > params.mask_threshold {
            candidates.push((y, x));
        }
    }
    if candidates.is_empty() {
        return Ok(Array2::zeros((h, w)));
    }

    let (fy, fx) = if params.omni {
        unit_flows(dy, dx)
    } else {
        (dy.mapv(|v| v / 5.0), dx.mapv(|v| v / 5.0))
    };

    let niter = match params.niter {
        Some(n) => n.max(1),
        None if params.omni => {
            let dist_max = candidates
                .iter()
                .map(|&(y, x)| dist[[y, x]])
                .fold(0.0f32, f32::max);
            ((2.0 * dist_max).ceil() as usize).clamp(1, MAX_NITER)
        }
        None => MAX_NITER,
    };

    let mut positions: Vec<(f32, f32)> = candidates
        .iter()
        .map(|&(y, x)| (y as f32, x as f32))
        .collect();
    let ymax = (h - 1) as f32;
    let xmax = (w - 1) as f32;
    for _ in 0..niter {
        for pos in &mut positions {
            let step_y = sample_bilinear(&fy, pos.0, pos.1);
            let step_x = sample_bilinear(&fx, pos.0, pos.1);
            pos.0 = (pos.0 + step_y).clamp(0.0, ymax);
            pos.1 = (pos.1 + step_x).clamp(0.0, xmax);
        }
    }

    let labels = if params.cluster {
        dbscan_labels(&positions)
    } else {
        bin_labels(&positions)
    };

    let mut mask = Array2::zeros((h, w));
    for (&(y, x), &label) in candidates.iter().zip(&labels) {
        mask[[y, x]] = label;
    }

    if params.flow_threshold > 0.0 {
        remove_bad_flows(&mut mask, &fy, &fx, params.flow_threshold);
    }

    relabel_sequential(&mut mask);
    Ok(mask)
}

/// Normalize the flow field to unit vectors, leaving zero vectors alone.
fn unit_flows(dy: &Array2<f32>, dx: &Array2<f32>) -> (Array2<f32>, Array2<f32>) {
    let mut fy = dy.clone();
    let mut fx = dx.clone();
    Zip::from(&mut fy).and(&mut fx).for_each(|y, x| {
        let mag = (*y * *y + *x * *x).sqrt();
        if mag > 0.0 {
            *y /= mag;
            *x /= mag;
        }
    });
    (fy, fx)
}

fn sample_bilinear(field: &Array2<f32>, y: f32, x: f32) -> f32 {
    let (h, w) = field.dim();
    let y = y.clamp(0.0, (h - 1) as f32);
    let x = x.clamp(0.0, (w - 1) as f32);
    let y0 = y.floor() as usize;
    let x0 = x.floor() as usize;
    let y1 = (y0 + 1).min(h - 1);
    let x1 = (x0 + 1).min(w - 1);
    let wy = y - y0 as f32;
    let wx = x - x0 as f32;
    field[[y0, x0]] * (1.0 - wy) * (1.0 - wx)
        + field[[y0, x1]] * (1.0 - wy) * wx
        + field[[y1, x0]] * wy * (1.0 - wx)
        + field[[y1, x1]] * wy * wx
}

/// DBSCAN over converged points with a uniform grid for neighbor lookup.
/// Returns one label per point; 0 marks noise.
fn dbscan_labels(points: &[(f32, f32)]) -> Vec<u32> {
    const UNVISITED: u32 = u32::MAX;
    const NOISE: u32 = 0;
    let eps2 = DBSCAN_EPS * DBSCAN_EPS;

    let mut grid: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
    for (i, &(y, x)) in points.iter().enumerate() {
        grid.entry(grid_cell(y, x)).or_default().push(i);
    }
    let neighbors = |i: usize| {
        let (y, x) = points[i];
        let (cy, cx) = grid_cell(y, x);
        let mut found = Vec::new();
        for oy in -1..=1 {
            for ox in -1..=1 {
                if let Some(cell) = grid.get(&(cy + oy, cx + ox)) {
                    for &j in cell {
                        let dy = points[j].0 - y;
                        let dx = points[j].1 - x;
                        if dy * dy + dx * dx <= eps2 {
                            found.push(j);
                        }
                    }
                }
            }
        }
        found
    };

    let mut labels = vec![UNVISITED; points.len()];
    let mut next = 0u32;
    for i in 0..points.len() {
        if labels[i] != UNVISITED {
            continue;
        }
        let seed = neighbors(i);
        if seed.len() < DBSCAN_MIN_SAMPLES {
            labels[i] = NOISE;
            continue;
        }
        next += 1;
        labels[i] = next;
        let mut queue: VecDeque<usize> = seed.into_iter().collect();
        while let Some(j) = queue.pop_front() {
            if labels[j] == NOISE {
                // border point reached from a core point
                labels[j] = next;
                continue;
            }
            if labels[j] != UNVISITED {
                continue;
            }
            labels[j] = next;
            let reach = neighbors(j);
            if reach.len() >= DBSCAN_MIN_SAMPLES {
                queue.extend(reach);
            }
        }
    }
    labels
}

fn grid_cell(y: f32, x: f32) -> (i64, i64) {
    ((y / DBSCAN_EPS).floor() as i64, (x / DBSCAN_EPS).floor() as i64)
}

/// Round each point to a pixel bin and label 8-connected groups of bins.
fn bin_labels(points: &[(f32, f32)]) -> Vec<u32> {
    let mut bin_of = Vec::with_capacity(points.len());
    let mut occupied: HashMap<(i64, i64), u32> = HashMap::new();
    for &(y, x) in points {
        let key = (y.round() as i64, x.round() as i64);
        bin_of.push(key);
        occupied.insert(key, 0);
    }
    let mut next = 0u32;
    for start in &bin_of {
        if occupied[start] != 0 {
            continue;
        }
        next += 1;
        occupied.insert(*start, next);
        let mut queue = VecDeque::from([*start]);
        while let Some((by, bx)) = queue.pop_front() {
            for oy in -1i64..=1 {
                for ox in -1i64..=1 {
                    if (oy, ox) == (0, 0) {
                        continue;
                    }
                    if let Some(label) = occupied.get_mut(&(by + oy, bx + ox)) {
                        if *label == 0 {
                            *label = next;
                            queue.push_back((by + oy, bx + ox));
                        }
                    }
                }
            }
        }
    }
    bin_of.iter().map(|key| occupied[key]).collect()
}

/// Drop labels whose mask-derived flows disagree with the predicted ones.
fn remove_bad_flows(mask: &mut Array2<u32>, fy: &Array2<f32>, fx: &Array2<f32>, threshold: f32) {
    let max_label = mask.iter().copied().max().unwrap_or(0);
    if max_label == 0 {
        return;
    }
    let errors = flow_errors(mask, fy, fx, max_label);
    mask.mapv_inplace(|value| {
        if value > 0 && errors[value as usize] > threshold {
            0
        } else {
            value
        }
    });
}

/// Mean squared difference, per label, between the predicted flows and the
/// flows the labeled shape itself implies.
fn flow_errors(mask: &Array2<u32>, fy: &Array2<f32>, fx: &Array2<f32>, max_label: u32) -> Vec<f32> {
    let dt = chamfer_distance(mask);
    let (gy, gx) = masked_gradient(&dt, mask);
    let mut err = vec![0.0f32; max_label as usize + 1];
    let mut count = vec![0usize; max_label as usize + 1];
    for ((y, x), &label) in mask.indexed_iter() {
        if label == 0 {
            continue;
        }
        let ey = gy[[y, x]] - fy[[y, x]];
        let ex = gx[[y, x]] - fx[[y, x]];
        err[label as usize] += 0.5 * (ey * ey + ex * ex);
        count[label as usize] += 1;
    }
    for (e, &n) in err.iter_mut().zip(&count) {
        if n > 0 {
            *e /= n as f32;
        }
    }
    err
}

/// Two-pass chamfer distance to the nearest pixel outside the label.
/// A neighbor carrying a different label counts as background.
fn chamfer_distance(mask: &Array2<u32>) -> Array2<f32> {
    let (h, w) = mask.dim();
    let diag = std::f32::consts::SQRT_2;
    let mut dt = Array2::from_elem((h, w), f32::INFINITY);
    let pass = |dt: &mut Array2<f32>, y: usize, x: usize, offsets: &[(i64, i64, f32)]| {
        let label = mask[[y, x]];
        if label == 0 {
            dt[[y, x]] = 0.0;
            return;
        }
        let mut best = dt[[y, x]];
        for &(oy, ox, wgt) in offsets {
            let ny = y as i64 + oy;
            let nx = x as i64 + ox;
            let outside = ny < 0
                || nx < 0
                || ny >= h as i64
                || nx >= w as i64
                || mask[[ny as usize, nx as usize]] != label;
            let cost = if outside {
                wgt
            } else {
                dt[[ny as usize, nx as usize]] + wgt
            };
            best = best.min(cost);
        }
        dt[[y, x]] = best;
    };

    let forward = [
        (-1, 0, 1.0),
        (0, -1, 1.0),
        (-1, -1, diag),
        (-1, 1, diag),
    ];
    for y in 0..h {
        for x in 0..w {
            pass(&mut dt, y, x, &forward);
        }
    }
    let backward = [(1, 0, 1.0), (0, 1, 1.0), (1, 1, diag), (1, -1, diag)];
    for y in (0..h).rev() {
        for x in (0..w).rev() {
            pass(&mut dt, y, x, &backward);
        }
    }
    dt
}

/// Unit gradient of the distance transform, restricted to each label.
fn masked_gradient(dt: &Array2<f32>, mask: &Array2<u32>) -> (Array2<f32>, Array2<f32>) {
    let (h, w) = mask.dim();
    let mut gy = Array2::zeros((h, w));
    let mut gx = Array2::zeros((h, w));
    let value = |y: i64, x: i64, label: u32| {
        if y < 0 || x < 0 || y >= h as i64 || x >= w as i64 {
            return 0.0;
        }
        if mask[[y as usize, x as usize]] == label {
            dt[[y as usize, x as usize]]
        } else {
            0.0
        }
    };
    for ((y, x), &label) in mask.indexed_iter() {
        if label == 0 {
            continue;
        }
        let (yi, xi) = (y as i64, x as i64);
        let dy = (value(yi + 1, xi, label) - value(yi - 1, xi, label)) / 2.0;
        let dx = (value(yi, xi + 1, label) - value(yi, xi - 1, label)) / 2.0;
        let mag = (dy * dy + dx * dx).sqrt();
        if mag > 0.0 {
            gy[[y, x]] = dy / mag;
            gx[[y, x]] = dx / mag;
        }
    }
    (gy, gx)
}

/// Renumber labels 1..=K in row-major order of first appearance.
fn relabel_sequential(mask: &mut Array2<u32>) {
    let mut remap: HashMap<u32, u32> = HashMap::new();
    let mut next = 0u32;
    mask.mapv_inplace(|value| {
        if value == 0 {
            return 0;
        }
        *remap.entry(value).or_insert_with(|| {
            next += 1;
            next
        })
    });
}
