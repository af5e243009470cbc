//! Batch phase-contrast segmentation with a pretrained bacterial model.

use crate::path_list::read_path_list;
use crate::utils::CliPath;
use anyhow::{Context, Result};
use clap::Args;
use log::info;
use omniseg::io::{imread, save_masks};
use omniseg::{gpu_available, EvalParams, SaveOptions, SegModel};
use std::fs;
use std::path::Path;
use std::time::Instant;

#[derive(Args, Debug)]
pub struct SegmentArgs {
    /// Text file listing one image path per line.
    #[arg(long, default_value = "mask_path_list.txt")]
    pub list: CliPath,

    /// Pretrained phase-contrast model in ONNX format.
    #[arg(long, default_value = "bact_phase_omni.onnx")]
    pub model: CliPath,

    /// TOML file overriding individual evaluation parameters.
    #[arg(long)]
    pub params: Option<CliPath>,

    /// Log a summary of each input image before segmentation.
    #[arg(long)]
    pub plot_phase: bool,

    /// Log the object count of each mask after segmentation.
    #[arg(long)]
    pub plot_masks: bool,

    /// Inserted into every output file name before the extension.
    #[arg(long, default_value = "")]
    pub suffix: String,

    /// Save flow renderings and the raw flow components.
    #[arg(long)]
    pub save_flows: bool,

    /// Save mask outlines as images.
    #[arg(long)]
    pub save_outlines: bool,

    /// Save mask outlines as point traces in text form.
    #[arg(long)]
    pub save_txt: bool,

    /// Save masks recolored so touching objects never share a color.
    #[arg(long)]
    pub save_ncolor: bool,

    /// Also save masks as 32-bit TIFF.
    #[arg(long)]
    pub tif: bool,

    /// Climb this many directories above each image before writing output.
    #[arg(long, default_value_t = 0)]
    pub dir_above: usize,

    /// Write all output into one directory instead of per-product folders.
    #[arg(long)]
    pub flat: bool,
}

pub fn run(args: &SegmentArgs) -> Result<()> {
    run_with_model(args, || {
        let use_gpu = gpu_available();
        info!(">>> GPU activated? {}", u8::from(use_gpu));
        SegModel::load(&args.model, use_gpu)
    })
}

/// The whole batch behind an injectable model loader. The loader runs only
/// once there is something to segment, so an empty list never touches the
/// model file.
fn run_with_model(args: &SegmentArgs, load: impl FnOnce() -> Result<SegModel>) -> Result<()> {
    let paths = read_path_list(&args.list)?;
    info!("segmenting {} image(s) from {}", paths.len(), args.list.display());
    if paths.is_empty() {
        return Ok(());
    }

    let params = match &args.params {
        Some(path) => load_params(path)?,
        None => EvalParams::default(),
    };

    let mut images = Vec::with_capacity(paths.len());
    for (index, path) in paths.iter().enumerate() {
        let image = imread(path).with_context(|| format!("loading image {index}"))?;
        if args.plot_phase {
            info!(
                "image {index}: shape {:?}, dtype {}, range [{:.1}, {:.1}]",
                image.shape(),
                image.dtype,
                image.min(),
                image.max()
            );
        }
        images.push(image);
    }

    let mut model = load()?;

    let started = Instant::now();
    let results = model.eval(&images, &params)?;
    info!(
        "segmented {} image(s) in {:.2}s",
        results.len(),
        started.elapsed().as_secs_f64()
    );

    if args.plot_masks {
        for (index, result) in results.iter().enumerate() {
            info!("image {index}: {} object(s)", result.object_count());
        }
    }

    let opts = save_options(args);
    for (index, (path, result)) in paths.iter().zip(&results).enumerate() {
        let written = save_masks(path, result, &opts)
            .with_context(|| format!("saving output for image {index}"))?;
        info!("image {index}: wrote {} file(s)", written.len());
    }
    Ok(())
}

/// Masks are always written as PNG; everything else follows the flags.
fn save_options(args: &SegmentArgs) -> SaveOptions {
    SaveOptions {
        png: true,
        tif: args.tif,
        suffix: args.suffix.clone(),
        save_flows: args.save_flows,
        save_outlines: args.save_outlines,
        save_txt: args.save_txt,
        save_ncolor: args.save_ncolor,
        dir_above: args.dir_above,
        in_folders: !args.flat,
    }
}

fn load_params(path: &Path) -> Result<EvalParams> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading parameter file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing parameter file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use ndarray::{Array3, ArrayView3, Axis};
    use omniseg::model::{Network, NetworkOutput};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn base_args() -> SegmentArgs {
        SegmentArgs {
            list: PathBuf::from("mask_path_list.txt").into(),
            model: PathBuf::from("bact_phase_omni.onnx").into(),
            params: None,
            plot_phase: false,
            plot_masks: false,
            suffix: String::new(),
            save_flows: false,
            save_outlines: false,
            save_txt: false,
            save_ncolor: false,
            tif: false,
            dir_above: 0,
            flat: false,
        }
    }

    /// Predicts one square cell in the middle of whatever frame it is shown:
    /// positive distance inside the square, unit flows pointing at its center.
    struct BlobNetwork;

    impl Network for BlobNetwork {
        fn forward(&mut self, input: ArrayView3<'_, f32>) -> Result<NetworkOutput> {
            let (_, h, w) = input.dim();
            let (cy, cx) = (h as f32 / 2.0, w as f32 / 2.0);
            let mut maps = Array3::zeros((4, h, w));
            maps.index_axis_mut(Axis(0), 2).fill(-5.0);
            for y in 0..h {
                for x in 0..w {
                    let dy = cy - y as f32;
                    let dx = cx - x as f32;
                    if dy.abs() <= 4.0 && dx.abs() <= 4.0 {
                        let mag = (dy * dy + dx * dx).sqrt().max(1e-6);
                        maps[[0, y, x]] = dy / mag;
                        maps[[1, y, x]] = dx / mag;
                        maps[[2, y, x]] = 5.0;
                    }
                }
            }
            Ok(NetworkOutput { maps, style: None })
        }
    }

    fn canned_model() -> Result<SegModel> {
        Ok(SegModel::from_network(Box::new(BlobNetwork)))
    }

    fn write_gray_png(path: &Path, seed: u8) {
        let img = image::GrayImage::from_fn(16, 16, |x, y| {
            image::Luma([seed.wrapping_add((x + y) as u8)])
        });
        img.save(path).unwrap();
    }

    /// Every file under `dir`, relative path to contents.
    fn snapshot(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        let mut files = BTreeMap::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            for entry in fs::read_dir(&current).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    let relative = path.strip_prefix(dir).unwrap().to_path_buf();
                    files.insert(relative, fs::read(&path).unwrap());
                }
            }
        }
        files
    }

    #[test]
    fn empty_lists_need_no_model() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("mask_path_list.txt");
        fs::write(&list, "\n").unwrap();

        let mut args = base_args();
        args.list = list.into();
        args.model = dir.path().join("no_such_model.onnx").into();
        run(&args).unwrap();
    }

    #[test]
    fn plot_flags_and_reruns_leave_outputs_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("img0.png");
        let second = dir.path().join("img1.png");
        write_gray_png(&first, 10);
        write_gray_png(&second, 60);
        let list = dir.path().join("mask_path_list.txt");
        fs::write(&list, format!("{}\n{}\n", first.display(), second.display())).unwrap();

        let mut args = base_args();
        args.list = list.into();
        run_with_model(&args, canned_model).unwrap();
        let plain = snapshot(dir.path());
        // two inputs, the list, and one mask per input
        assert_eq!(plain.len(), 5);
        assert!(plain.contains_key(Path::new("masks/img0_cp_masks.png")));
        assert!(plain.contains_key(Path::new("masks/img1_cp_masks.png")));

        run_with_model(&args, canned_model).unwrap();
        assert_eq!(snapshot(dir.path()), plain, "rerun changed the outputs");

        args.plot_phase = true;
        args.plot_masks = true;
        run_with_model(&args, canned_model).unwrap();
        assert_eq!(snapshot(dir.path()), plain, "plot flags changed the outputs");
    }

    #[test]
    fn flags_map_onto_save_options() {
        let mut args = base_args();
        args.suffix = "_run1".to_string();
        args.save_flows = true;
        args.save_txt = true;
        args.tif = true;
        args.dir_above = 2;
        args.flat = true;

        let opts = save_options(&args);
        assert!(opts.png);
        assert!(opts.tif);
        assert!(opts.save_flows);
        assert!(!opts.save_outlines);
        assert!(opts.save_txt);
        assert!(!opts.save_ncolor);
        assert_eq!(opts.suffix, "_run1");
        assert_eq!(opts.dir_above, 2);
        assert!(!opts.in_folders);
    }

    #[test]
    fn parameter_files_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("params.toml");
        fs::write(
            &file,
            "mask_threshold = 0.3\ncluster = false\nniter = 80\nchannels = [0, 2]\n",
        )
        .unwrap();

        let params = load_params(&file).unwrap();
        assert_eq!(params.mask_threshold, 0.3);
        assert!(!params.cluster);
        assert_eq!(params.niter, Some(80));
        assert_eq!(params.channels, [0, 2]);
        assert!(params.omni);
        assert_eq!(params.flow_threshold, 0.0);
    }

    #[test]
    fn unknown_parameter_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("params.toml");
        fs::write(&file, "mask_treshold = 0.3\n").unwrap();

        let err = load_params(&file).unwrap_err();
        assert!(format!("{err:#}").contains("params.toml"));
    }

    #[test]
    fn empty_parameter_files_keep_the_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("params.toml");
        fs::write(&file, "").unwrap();

        assert_eq!(load_params(&file).unwrap(), EvalParams::default());
    }

    #[test]
    fn cli_parses_the_documented_flags() {
        #[derive(Parser)]
        struct Harness {
            #[command(flatten)]
            args: SegmentArgs,
        }

        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("mask_path_list.txt");
        let model = dir.path().join("bact_phase_omni.onnx");
        fs::write(&list, "").unwrap();
        fs::write(&model, "").unwrap();

        let parsed = Harness::try_parse_from([
            "harness",
            "--list",
            list.to_str().unwrap(),
            "--model",
            model.to_str().unwrap(),
            "--save-flows",
            "--suffix",
            "_a",
            "--dir-above",
            "1",
            "--flat",
        ])
        .unwrap();
        assert!(parsed.args.save_flows);
        assert_eq!(parsed.args.suffix, "_a");
        assert_eq!(parsed.args.dir_above, 1);
        assert!(parsed.args.flat);

        let missing = Harness::try_parse_from(["harness", "--list", "/no/such/list.txt"]);
        assert!(missing.is_err());
    }
}
