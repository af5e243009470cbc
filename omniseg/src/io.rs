//! Reading images from disk and writing segmentation output next to them.

use crate::transforms;
use crate::{LoadedImage, SegResult};
use anyhow::{anyhow, bail, ensure, Context, Result};
use image::{DynamicImage, ImageBuffer, Luma, RgbImage, RgbaImage};
use log::warn;
use ndarray::{Array2, Array3, ArrayD, IxDyn};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};

/// Decode an image file into float samples, keeping the raw values.
///
/// TIFF goes through the `tiff` decoder and keeps its sample type name;
/// everything else goes through `image::open`. Multi-sample images come out
/// as `[H, W, S]`, single-sample ones as `[H, W]`.
pub fn imread(path: &Path) -> Result<LoadedImage> {
    let ext = path
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let loaded = match ext.as_str() {
        "tif" | "tiff" => read_tiff(path),
        _ => read_standard(path),
    };
    loaded.with_context(|| format!("reading image {}", path.display()))
}

fn read_tiff(path: &Path) -> Result<LoadedImage> {
    let file = BufReader::new(File::open(path)?);
    let mut decoder = Decoder::new(file)?.with_limits(Limits::unlimited());
    let (width, height) = decoder.dimensions()?;
    let (samples, dtype): (Vec<f32>, _) = match decoder.read_image()? {
        DecodingResult::U8(data) => (data.iter().map(|&v| f32::from(v)).collect(), "uint8"),
        DecodingResult::U16(data) => (data.iter().map(|&v| f32::from(v)).collect(), "uint16"),
        DecodingResult::U32(data) => (data.iter().map(|&v| v as f32).collect(), "uint32"),
        DecodingResult::F32(data) => (data, "float32"),
        DecodingResult::F64(data) => (data.iter().map(|&v| v as f32).collect(), "float64"),
        _ => bail!("unsupported TIFF sample type"),
    };
    Ok(LoadedImage {
        data: shape_samples(samples, height as usize, width as usize)?,
        dtype,
    })
}

fn read_standard(path: &Path) -> Result<LoadedImage> {
    let decoded = image::open(path)?;
    let (data, dtype) = match decoded {
        DynamicImage::ImageLuma8(img) => {
            let (w, h) = img.dimensions();
            let samples = img.as_raw().iter().map(|&v| f32::from(v)).collect();
            (shape_samples(samples, h as usize, w as usize)?, "uint8")
        }
        DynamicImage::ImageLuma16(img) => {
            let (w, h) = img.dimensions();
            let samples = img.as_raw().iter().map(|&v| f32::from(v)).collect();
            (shape_samples(samples, h as usize, w as usize)?, "uint16")
        }
        DynamicImage::ImageRgb8(img) => {
            let (w, h) = img.dimensions();
            let samples = img.as_raw().iter().map(|&v| f32::from(v)).collect();
            (shape_samples(samples, h as usize, w as usize)?, "uint8")
        }
        DynamicImage::ImageRgb16(img) => {
            let (w, h) = img.dimensions();
            let samples = img.as_raw().iter().map(|&v| f32::from(v)).collect();
            (shape_samples(samples, h as usize, w as usize)?, "uint16")
        }
        other => {
            let img = other.to_rgb8();
            let (w, h) = img.dimensions();
            let samples = img.as_raw().iter().map(|&v| f32::from(v)).collect();
            (shape_samples(samples, h as usize, w as usize)?, "uint8")
        }
    };
    Ok(LoadedImage { data, dtype })
}

/// `[H, W]` for one sample per pixel, `[H, W, S]` otherwise.
fn shape_samples(samples: Vec<f32>, height: usize, width: usize) -> Result<ArrayD<f32>> {
    let pixels = height * width;
    ensure!(pixels > 0, "image has no pixels");
    ensure!(
        samples.len() % pixels == 0,
        "sample count {} does not fill {height}x{width} pixels",
        samples.len()
    );
    let per_pixel = samples.len() / pixels;
    let array = if per_pixel == 1 {
        ArrayD::from_shape_vec(IxDyn(&[height, width]), samples)?
    } else {
        ArrayD::from_shape_vec(IxDyn(&[height, width, per_pixel]), samples)?
    };
    Ok(array)
}

/// Render a flow field as the usual color circle: hue from the flow angle,
/// strength from the normalized magnitude. With `transparency` the magnitude
/// goes into an alpha channel instead of darkening the colors.
pub fn render_flow(dy: &Array2<f32>, dx: &Array2<f32>, transparency: bool) -> Array3<u8> {
    let (h, w) = dy.dim();
    let mut mag = Array2::zeros((h, w));
    for ((y, x), value) in mag.indexed_iter_mut() {
        let vy = dy[[y, x]];
        let vx = dx[[y, x]];
        *value = (vy * vy + vx * vx).sqrt();
    }
    let mag = transforms::normalize99(&mag).mapv(|v| v.clamp(0.0, 1.0));

    let channels = if transparency { 4 } else { 3 };
    let mut out = Array3::zeros((h, w, channels));
    let third = 2.0 * std::f32::consts::PI / 3.0;
    for y in 0..h {
        for x in 0..w {
            let angle = dx[[y, x]].atan2(dy[[y, x]]) + std::f32::consts::PI;
            let r = (angle.cos() + 1.0) / 2.0;
            let g = ((angle + third).cos() + 1.0) / 2.0;
            let b = ((angle + 2.0 * third).cos() + 1.0) / 2.0;
            let m = mag[[y, x]];
            if transparency {
                out[[y, x, 0]] = (r * 255.0) as u8;
                out[[y, x, 1]] = (g * 255.0) as u8;
                out[[y, x, 2]] = (b * 255.0) as u8;
                out[[y, x, 3]] = (m * 255.0) as u8;
            } else {
                out[[y, x, 0]] = (r * m * 255.0) as u8;
                out[[y, x, 1]] = (g * m * 255.0) as u8;
                out[[y, x, 2]] = (b * m * 255.0) as u8;
            }
        }
    }
    out
}

/// What [`save_masks`] writes and where.
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Write masks as 16-bit PNG when the label count allows it.
    pub png: bool,
    /// Also write masks as 32-bit TIFF.
    pub tif: bool,
    /// Inserted into every file name before the extension.
    pub suffix: String,
    pub save_flows: bool,
    pub save_outlines: bool,
    pub save_txt: bool,
    pub save_ncolor: bool,
    /// How many directories above the image's own to place output in.
    pub dir_above: usize,
    /// Group output into masks/, flows/, outlines/... subdirectories.
    pub in_folders: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        SaveOptions {
            png: true,
            tif: false,
            suffix: String::new(),
            save_flows: false,
            save_outlines: false,
            save_txt: false,
            save_ncolor: false,
            dir_above: 0,
            in_folders: true,
        }
    }
}

/// Write the outputs for one segmented image next to its source file and
/// return the paths written, in order.
pub fn save_masks(image_path: &Path, result: &SegResult, opts: &SaveOptions) -> Result<Vec<PathBuf>> {
    let stem = image_path
        .file_stem()
        .and_then(OsStr::to_str)
        .ok_or_else(|| anyhow!("image path {} has no usable stem", image_path.display()))?;
    let mut root = image_path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
    for _ in 0..opts.dir_above {
        root = root
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("no directory {} levels above {}", opts.dir_above, image_path.display()))?;
    }
    if root.as_os_str().is_empty() {
        root = PathBuf::from(".");
    }

    let suffix = &opts.suffix;
    let mut written = Vec::new();
    let (h, w) = result.mask.dim();
    let max_label = result.mask.iter().copied().max().unwrap_or(0);

    let mut wrote_tif = false;
    if opts.png {
        if max_label < 65_536 {
            let dir = out_dir(&root, "masks", opts.in_folders)?;
            let path = dir.join(format!("{stem}_cp_masks{suffix}.png"));
            let small = result.mask.mapv(|v| v as u16);
            save_png_u16(&path, &small)?;
            written.push(path);
        } else {
            warn!("{stem}: label values exceed 16 bits, writing TIFF instead of PNG");
            let dir = out_dir(&root, "masks", opts.in_folders)?;
            let path = dir.join(format!("{stem}_cp_masks{suffix}.tif"));
            save_tiff_u32(&path, &result.mask)?;
            written.push(path);
            wrote_tif = true;
        }
    }
    if opts.tif && !wrote_tif {
        let dir = out_dir(&root, "masks", opts.in_folders)?;
        let path = dir.join(format!("{stem}_cp_masks{suffix}.tif"));
        save_tiff_u32(&path, &result.mask)?;
        written.push(path);
    }

    if opts.save_flows {
        let dir = out_dir(&root, "flows", opts.in_folders)?;
        let path = dir.join(format!("{stem}_flows{suffix}.png"));
        save_flow_png(&path, &result.flows.rgb)?;
        written.push(path);

        let path = dir.join(format!("{stem}_dP{suffix}.tif"));
        let mut encoder = TiffEncoder::new(BufWriter::new(File::create(&path)?))?;
        let (_, fh, fw) = result.flows.dp.dim();
        for plane in result.flows.dp.outer_iter() {
            let data: Vec<f32> = plane.iter().copied().collect();
            encoder.write_image::<colortype::Gray32Float>(fw as u32, fh as u32, &data)?;
        }
        written.push(path);
    }

    if opts.save_outlines {
        let dir = out_dir(&root, "outlines", opts.in_folders)?;
        let path = dir.join(format!("{stem}_cp_outlines{suffix}.png"));
        let outlines = mask_outlines(&result.mask);
        let img = ImageBuffer::<Luma<u8>, Vec<u8>>::from_raw(
            w as u32,
            h as u32,
            outlines.into_raw_vec_and_offset().0,
        )
        .ok_or_else(|| anyhow!("outline buffer does not match its dimensions"))?;
        img.save(&path)?;
        written.push(path);
    }

    if opts.save_txt {
        let dir = out_dir(&root, "txt_outlines", opts.in_folders)?;
        let path = dir.join(format!("{stem}_cp_outlines{suffix}.txt"));
        let mut out = BufWriter::new(File::create(&path)?);
        for label in 1..=max_label {
            let contour = trace_boundary(&result.mask, label);
            if contour.is_empty() {
                continue;
            }
            let line: Vec<String> = contour.iter().map(|&(x, y)| format!("{x},{y}")).collect();
            writeln!(out, "{}", line.join(","))?;
        }
        out.flush()?;
        written.push(path);
    }

    if opts.save_ncolor {
        let dir = out_dir(&root, "ncolor_masks", opts.in_folders)?;
        let path = dir.join(format!("{stem}_cp_ncolor_masks{suffix}.png"));
        let colored = ncolor_compress(&result.mask);
        let img = ImageBuffer::<Luma<u8>, Vec<u8>>::from_raw(
            w as u32,
            h as u32,
            colored.into_raw_vec_and_offset().0,
        )
        .ok_or_else(|| anyhow!("ncolor buffer does not match its dimensions"))?;
        img.save(&path)?;
        written.push(path);
    }

    Ok(written)
}

fn out_dir(root: &Path, sub: &str, in_folders: bool) -> Result<PathBuf> {
    let dir = if in_folders {
        root.join(sub)
    } else {
        root.to_path_buf()
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("creating output directory {}", dir.display()))?;
    Ok(dir)
}

fn save_png_u16(path: &Path, mask: &Array2<u16>) -> Result<()> {
    let (h, w) = mask.dim();
    let img = ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(
        w as u32,
        h as u32,
        mask.iter().copied().collect(),
    )
    .ok_or_else(|| anyhow!("mask buffer does not match its dimensions"))?;
    img.save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn save_tiff_u32(path: &Path, mask: &Array2<u32>) -> Result<()> {
    let (h, w) = mask.dim();
    let data: Vec<u32> = mask.iter().copied().collect();
    let mut encoder = TiffEncoder::new(BufWriter::new(File::create(path)?))?;
    encoder.write_image::<colortype::Gray32>(w as u32, h as u32, &data)?;
    Ok(())
}

fn save_flow_png(path: &Path, rgb: &Array3<u8>) -> Result<()> {
    let (h, w, channels) = rgb.dim();
    let data: Vec<u8> = rgb.iter().copied().collect();
    match channels {
        3 => {
            let img = RgbImage::from_raw(w as u32, h as u32, data)
                .ok_or_else(|| anyhow!("flow buffer does not match its dimensions"))?;
            img.save(path)?;
        }
        4 => {
            let img = RgbaImage::from_raw(w as u32, h as u32, data)
                .ok_or_else(|| anyhow!("flow buffer does not match its dimensions"))?;
            img.save(path)?;
        }
        n => bail!("flow images carry 3 or 4 channels, not {n}"),
    }
    Ok(())
}

/// 255 where a labeled pixel touches a different value 4-connectively,
/// counting pixels beyond the image edge as background.
fn mask_outlines(mask: &Array2<u32>) -> Array2<u8> {
    let (h, w) = mask.dim();
    let mut out = Array2::zeros((h, w));
    for ((y, x), &label) in mask.indexed_iter() {
        if label == 0 {
            continue;
        }
        let differs = |ny: i64, nx: i64| {
            if ny < 0 || nx < 0 || ny >= h as i64 || nx >= w as i64 {
                return true;
            }
            mask[[ny as usize, nx as usize]] != label
        };
        let (yi, xi) = (y as i64, x as i64);
        if differs(yi - 1, xi) || differs(yi + 1, xi) || differs(yi, xi - 1) || differs(yi, xi + 1)
        {
            out[[y, x]] = 255;
        }
    }
    out
}

/// Moore-neighbor boundary trace of one label, as `(x, y)` pixel coordinates
/// starting from its first row-major pixel.
fn trace_boundary(mask: &Array2<u32>, label: u32) -> Vec<(usize, usize)> {
    // clockwise from west, (dy, dx) with y pointing down
    const MOORE: [(i64, i64); 8] = [
        (0, -1),
        (-1, -1),
        (-1, 0),
        (-1, 1),
        (0, 1),
        (1, 1),
        (1, 0),
        (1, -1),
    ];
    let (h, w) = mask.dim();
    let Some(start) = mask
        .indexed_iter()
        .find(|&(_, &value)| value == label)
        .map(|((y, x), _)| (y, x))
    else {
        return Vec::new();
    };

    let mut contour = vec![(start.1, start.0)];
    let mut current = start;
    let mut backtrack = 0; // entered the start pixel from the west
    for _ in 0..4 * h * w {
        let mut advanced = false;
        for k in 0..8 {
            let dir = (backtrack + 1 + k) % 8;
            let (oy, ox) = MOORE[dir];
            let ny = current.0 as i64 + oy;
            let nx = current.1 as i64 + ox;
            if ny < 0 || nx < 0 || ny >= h as i64 || nx >= w as i64 {
                continue;
            }
            let next = (ny as usize, nx as usize);
            if mask[[next.0, next.1]] != label {
                continue;
            }
            if next == start {
                return contour;
            }
            contour.push((next.1, next.0));
            current = next;
            backtrack = (dir + 4) % 8;
            advanced = true;
            break;
        }
        if !advanced {
            // single-pixel object
            break;
        }
    }
    contour
}

/// Recolor labels with a small shared palette so nearby objects differ,
/// for compact visualization.
fn ncolor_compress(mask: &Array2<u32>) -> Array2<u8> {
    let max_label = mask.iter().copied().max().unwrap_or(0) as usize;
    if max_label == 0 {
        return mask.mapv(|_| 0);
    }
    let (h, w) = mask.dim();
    let mut touches: Vec<HashSet<u32>> = vec![HashSet::new(); max_label + 1];
    // forward half of a Chebyshev-radius-2 neighborhood
    let offsets: [(i64, i64); 12] = [
        (0, 1),
        (0, 2),
        (1, -2),
        (1, -1),
        (1, 0),
        (1, 1),
        (1, 2),
        (2, -2),
        (2, -1),
        (2, 0),
        (2, 1),
        (2, 2),
    ];
    for ((y, x), &label) in mask.indexed_iter() {
        if label == 0 {
            continue;
        }
        for (oy, ox) in offsets {
            let ny = y as i64 + oy;
            let nx = x as i64 + ox;
            if ny < 0 || nx < 0 || ny >= h as i64 || nx >= w as i64 {
                continue;
            }
            let other = mask[[ny as usize, nx as usize]];
            if other != 0 && other != label {
                touches[label as usize].insert(other);
                touches[other as usize].insert(label);
            }
        }
    }
    let mut color = vec![0u8; max_label + 1];
    for label in 1..=max_label {
        let used: HashSet<u8> = touches[label]
            .iter()
            .map(|&other| color[other as usize])
            .collect();
        let mut pick = 1u8;
        while used.contains(&pick) {
            pick = pick.saturating_add(1);
        }
        color[label] = pick;
    }
    mask.mapv(|v| color[v as usize])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FlowSet;
    use image::GrayImage;
    use ndarray::Array1;

    fn square_mask() -> Array2<u32> {
        let mut mask = Array2::zeros((8, 8));
        for y in 2..6 {
            for x in 2..6 {
                mask[[y, x]] = 1;
            }
        }
        mask
    }

    fn result_with_mask(mask: Array2<u32>) -> SegResult {
        let (h, w) = mask.dim();
        SegResult {
            mask,
            flows: FlowSet {
                rgb: Array3::zeros((h, w, 4)),
                dp: Array3::zeros((2, h, w)),
                distance: Array2::zeros((h, w)),
                boundary: None,
            },
            style: Some(Array1::zeros(4)),
        }
    }

    #[test]
    fn png_round_trips_through_imread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells.png");
        let img = GrayImage::from_fn(6, 4, |x, y| Luma([(y * 6 + x) as u8]));
        img.save(&path).unwrap();

        let loaded = imread(&path).unwrap();
        assert_eq!(loaded.dtype, "uint8");
        assert_eq!(loaded.shape(), &[4, 6]);
        assert_eq!(loaded.data[[2, 3]], 15.0);
    }

    #[test]
    fn rgb_images_keep_their_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("color.png");
        let img = RgbImage::from_fn(5, 3, |x, _| image::Rgb([x as u8, 0, 255]));
        img.save(&path).unwrap();

        let loaded = imread(&path).unwrap();
        assert_eq!(loaded.shape(), &[3, 5, 3]);
        assert_eq!(loaded.data[[1, 4, 0]], 4.0);
        assert_eq!(loaded.data[[0, 0, 2]], 255.0);
    }

    #[test]
    fn tiff_u16_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("phase.tif");
        let data: Vec<u16> = (0..12).map(|v| v * 1000).collect();
        let mut encoder = TiffEncoder::new(BufWriter::new(File::create(&path).unwrap())).unwrap();
        encoder
            .write_image::<colortype::Gray16>(4, 3, &data)
            .unwrap();

        let loaded = imread(&path).unwrap();
        assert_eq!(loaded.dtype, "uint16");
        assert_eq!(loaded.shape(), &[3, 4]);
        assert_eq!(loaded.data[[2, 1]], 9000.0);
    }

    #[test]
    fn missing_files_error_with_the_path() {
        let err = imread(Path::new("/nonexistent/im.png")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/im.png"));
    }

    #[test]
    fn default_save_writes_one_png_in_masks() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("well1.png");
        let written = save_masks(&image_path, &result_with_mask(square_mask()), &SaveOptions::default())
            .unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0], dir.path().join("masks").join("well1_cp_masks.png"));
        assert!(written[0].is_file());
    }

    #[test]
    fn full_save_writes_every_product() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("well2.png");
        let opts = SaveOptions {
            tif: true,
            suffix: "_run3".to_string(),
            save_flows: true,
            save_outlines: true,
            save_txt: true,
            save_ncolor: true,
            ..SaveOptions::default()
        };
        let written = save_masks(&image_path, &result_with_mask(square_mask()), &opts).unwrap();
        let names: Vec<String> = written
            .iter()
            .map(|p| {
                p.strip_prefix(dir.path())
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(
            names,
            vec![
                "masks/well2_cp_masks_run3.png",
                "masks/well2_cp_masks_run3.tif",
                "flows/well2_flows_run3.png",
                "flows/well2_dP_run3.tif",
                "outlines/well2_cp_outlines_run3.png",
                "txt_outlines/well2_cp_outlines_run3.txt",
                "ncolor_masks/well2_cp_ncolor_masks_run3.png",
            ]
        );
        for path in &written {
            assert!(path.is_file(), "{} missing", path.display());
        }
    }

    #[test]
    fn flat_save_skips_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("well3.png");
        let opts = SaveOptions {
            in_folders: false,
            ..SaveOptions::default()
        };
        let written = save_masks(&image_path, &result_with_mask(square_mask()), &opts).unwrap();
        assert_eq!(written[0], dir.path().join("well3_cp_masks.png"));
    }

    #[test]
    fn dir_above_climbs_toward_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("plate").join("day1");
        fs::create_dir_all(&sub).unwrap();
        let image_path = sub.join("well4.png");
        let opts = SaveOptions {
            dir_above: 1,
            ..SaveOptions::default()
        };
        let written = save_masks(&image_path, &result_with_mask(square_mask()), &opts).unwrap();
        assert_eq!(
            written[0],
            dir.path().join("plate").join("masks").join("well4_cp_masks.png")
        );
    }

    #[test]
    fn wide_labels_fall_back_to_tiff() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("well5.png");
        let mut mask = square_mask();
        mask[[2, 2]] = 70_000;
        let written = save_masks(&image_path, &result_with_mask(mask), &SaveOptions::default())
            .unwrap();
        assert_eq!(
            written[0],
            dir.path().join("masks").join("well5_cp_masks.tif")
        );
    }

    #[test]
    fn saved_masks_reload_with_their_labels() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("well6.png");
        let written = save_masks(&image_path, &result_with_mask(square_mask()), &SaveOptions::default())
            .unwrap();
        let loaded = imread(&written[0]).unwrap();
        assert_eq!(loaded.dtype, "uint16");
        assert_eq!(loaded.data[[3, 3]], 1.0);
        assert_eq!(loaded.data[[0, 0]], 0.0);
    }

    #[test]
    fn outline_of_a_square_is_its_border() {
        let outlines = mask_outlines(&square_mask());
        assert_eq!(outlines.iter().filter(|&&v| v == 255).count(), 12);
        assert_eq!(outlines[[2, 2]], 255);
        assert_eq!(outlines[[3, 3]], 0);
        assert_eq!(outlines[[0, 0]], 0);
    }

    #[test]
    fn trace_walks_the_square_boundary() {
        let contour = trace_boundary(&square_mask(), 1);
        assert_eq!(contour.len(), 12);
        assert_eq!(contour[0], (2, 2));
        for pair in contour.windows(2) {
            let (x0, y0) = pair[0];
            let (x1, y1) = pair[1];
            let step = x0.abs_diff(x1).max(y0.abs_diff(y1));
            assert_eq!(step, 1);
        }
        assert!(trace_boundary(&square_mask(), 9).is_empty());
    }

    #[test]
    fn touching_masks_get_different_colors() {
        let mut mask = Array2::zeros((6, 10));
        for y in 1..5 {
            for x in 1..5 {
                mask[[y, x]] = 1;
            }
            for x in 5..9 {
                mask[[y, x]] = 2;
            }
        }
        let colored = ncolor_compress(&mask);
        assert_ne!(colored[[2, 2]], colored[[2, 7]]);
        assert_ne!(colored[[2, 2]], 0);
        assert_ne!(colored[[2, 7]], 0);
        assert_eq!(colored[[0, 0]], 0);
    }

    #[test]
    fn flow_rendering_tracks_magnitude_and_shape() {
        let (h, w) = (4, 16);
        let dy = Array2::zeros((h, w));
        let dx = Array2::from_shape_fn((h, w), |(_, x)| x as f32);
        let rgba = render_flow(&dy, &dx, true);
        assert_eq!(rgba.dim(), (h, w, 4));
        assert!(rgba[[0, 15, 3]] > rgba[[0, 1, 3]]);

        let rgb = render_flow(&dy, &dx, false);
        assert_eq!(rgb.dim(), (h, w, 3));
    }
}
