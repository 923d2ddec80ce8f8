use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::process::exit;

use follitile::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use follitile::export::{export, read_predictions, write_geojson};
use follitile::manifest::read_tile_grids;
use follitile::Result;

#[derive(Parser, Debug)]
#[command(name = "follitile-to-qupath")]
#[command(author, version)]
#[command(about = "Convert tile predictions back into annotation GeoJSON, one file per slide.")]
struct Args {
    /// Tile manifest written by follitile.
    manifest: PathBuf,

    /// CSV of tile_id, label, confidence.
    predictions: PathBuf,

    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    #[arg(long, default_value = "-predictions.geojson")]
    suffix: String,

    #[arg(long, default_value = "follitile-to-qupath-diagnostics.csv")]
    output_diagnostics: PathBuf,
}

fn run_cli(args: Args) -> Result<()> {
    let grids = read_tile_grids(&args.manifest)?;
    let mut diagnostics = Diagnostics::new();
    let predictions = read_predictions(&args.predictions, &mut diagnostics)?;

    let known: HashSet<&str> = grids.iter().map(|g| g.slide_id.as_str()).collect();
    for prediction in &predictions {
        if !known.contains(prediction.tile_id.slide_id.as_str()) {
            diagnostics.record(
                Diagnostic::new(
                    DiagnosticKind::UnknownTile,
                    &prediction.tile_id.slide_id,
                    "prediction for a slide that is not in the manifest".to_string(),
                )
                .with_tile(&prediction.tile_id),
            );
        }
    }

    fs::create_dir_all(&args.output_dir)?;

    let progress = ProgressBar::new(grids.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{prefix:>12} {bar:40} {pos}/{len} slides {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    progress.set_prefix("Exporting");

    for grid in &grids {
        progress.set_message(grid.slide_id.clone());
        let geometries = export(&predictions, grid, &mut diagnostics);
        let path = args.output_dir.join(format!("{}{}", grid.slide_id, args.suffix));
        write_geojson(&path, &geometries)?;
        progress.inc(1);
    }
    progress.finish_and_clear();

    info!("Wrote {} slides to {}", grids.len(), args.output_dir.display());
    diagnostics.log_summary();
    diagnostics.write_csv(&args.output_diagnostics)?;
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run_cli(Args::parse()) {
        error!("{}", err);
        exit(1);
    }
}
