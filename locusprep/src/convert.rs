//! The `convert` subcommand: ND2 recordings to MAT movies.

use crate::path_list::read_path_list;
use crate::utils::CliPath;
use anyhow::{Context, Result};
use clap::Args;
use log::info;
use mat5::MatArray;
use nd2::{Movie, Nd2File};
use std::path::Path;

/// Convert each listed ND2 recording to a `.mat` file next to it, holding
/// the movie under the variable `mov`.
#[derive(Args, Debug)]
pub struct ConvertArgs {
    /// Text file naming one ND2 recording per line.
    #[arg(long, default_value = "nd2_path_list.txt")]
    pub list: CliPath,
}

pub fn run(args: &ConvertArgs) -> Result<()> {
    let paths = read_path_list(&args.list)?;
    info!("{} recording(s) listed in {}", paths.len(), args.list.display());
    for (index, path) in paths.iter().enumerate() {
        convert_one(path)
            .with_context(|| format!("converting entry {index} ({})", path.display()))?;
    }
    Ok(())
}

fn convert_one(path: &Path) -> Result<()> {
    let mut file = Nd2File::open(path)?;
    let (width, height, channels) = {
        let attrs = file.attributes();
        (attrs.width, attrs.height, attrs.components)
    };
    info!(
        "{}: {} frame(s) of {width}x{height} px, {channels} channel(s)",
        path.display(),
        file.frame_count()
    );
    let movie = file.read_movie()?;
    let out = path.with_extension("mat");
    mat5::write_array(&out, "mov", &movie_to_array(movie))?;
    info!("wrote {}", out.display());
    Ok(())
}

fn movie_to_array(movie: Movie) -> MatArray {
    match movie {
        Movie::U8(data) => MatArray::from(data),
        Movie::U16(data) => MatArray::from(data),
        Movie::F32(data) => MatArray::from(data),
    }
}
