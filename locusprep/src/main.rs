//! Command line entry point for preparing bacterial locus imaging data.

use anyhow::Result;
use clap::{Parser, Subcommand};
use env_logger::{Builder, Env};
use locusprep::convert::{self, ConvertArgs};
use locusprep::segment::{self, SegmentArgs};

#[derive(Parser)]
#[command(
    name = "locusprep",
    version,
    about = "Prepare bacterial locus imaging data for analysis"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert listed ND2 recordings to MAT movies.
    Convert(ConvertArgs),
    /// Segment listed phase-contrast images with a pretrained model.
    Segment(SegmentArgs),
}

fn main() -> Result<()> {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    match Cli::parse().command {
        Command::Convert(args) => convert::run(&args),
        Command::Segment(args) => segment::run(&args),
    }
}
