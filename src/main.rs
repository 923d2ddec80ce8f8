use clap::Parser;
use log::{error, info};
use rayon::current_num_threads;
use std::fs;
use std::path::PathBuf;
use std::process::exit;

use follitile::manifest::{write_manifest, write_review_sample, DEFAULT_REVIEW_SEED};
use follitile::pipeline::{read_slide_sheet, run, RunSettings};
use follitile::species::{LengthUnit, SpeciesRegistry, ThresholdOverrides};
use follitile::validate::PixelScale;
use follitile::Result;

#[derive(Parser, Debug)]
#[command(name = "follitile")]
#[command(author, version)]
#[command(about = "Align follicle annotations with classifier tile grids.")]
struct Args {
    /// CSV with one row per slide: slide_id, species, width, height,
    /// annotations and optionally tissue_ratios, microns_per_pixel.
    #[arg(required_unless_present = "list_species")]
    slide_sheet: Option<PathBuf>,

    /// TOML species table layered over the built-in profiles.
    #[arg(long, default_value = None)]
    species_config: Option<PathBuf>,

    #[arg(long, default_value = "follitile-manifest.csv.gz")]
    output_manifest: PathBuf,

    #[arg(long, default_value = "follitile-diagnostics.csv")]
    output_diagnostics: PathBuf,

    #[arg(long, default_value = "follitile-review.csv")]
    output_review: PathBuf,

    /// Write each slide's annotations, tagged with their validation status.
    #[arg(long, default_value = None)]
    output_validated_dir: Option<PathBuf>,

    /// Number of labelled tiles to sample for manual review.
    #[arg(long, default_value_t = 100)]
    review_size: usize,

    #[arg(long, default_value_t = DEFAULT_REVIEW_SEED)]
    review_seed: u64,

    /// Tile edge length in pixels. Defaults to each species' recommendation.
    #[arg(long, default_value = None)]
    tile_size: Option<u32>,

    /// Tile stride in pixels. Defaults to the tile size.
    #[arg(long, default_value = None)]
    stride: Option<u32>,

    #[arg(long, default_value = None)]
    min_overlap: Option<f64>,

    #[arg(long, default_value = None)]
    min_confidence: Option<f64>,

    #[arg(long, default_value = None)]
    min_tissue_ratio: Option<f64>,

    /// Pixel size for slides whose sheet row doesn't give one.
    #[arg(long, default_value = None)]
    microns_per_pixel: Option<f64>,

    /// Unit that pixel sizes are given in (um or px).
    #[arg(long, default_value = "um")]
    scale_unit: LengthUnit,

    #[arg(long, default_value = None)]
    nthreads: Option<usize>,

    /// Print the available species and exit.
    #[arg(long, default_value_t = false)]
    list_species: bool,
}

fn load_registry(args: &Args) -> Result<SpeciesRegistry> {
    let mut registry = SpeciesRegistry::builtin()?;
    if let Some(path) = &args.species_config {
        registry.extend(SpeciesRegistry::from_path(path)?)?;
    }
    Ok(registry)
}

fn list_species(registry: &SpeciesRegistry) -> Result<()> {
    for code in registry.list() {
        let profile = registry.get(code)?;
        println!(
            "{}\t{}\ttile_size={}\tlabels={}",
            profile.code,
            profile.scientific_name,
            profile.tile_size,
            profile.labels.join(",")
        );
    }
    Ok(())
}

fn run_cli(args: Args) -> Result<()> {
    let registry = load_registry(&args)?;
    if args.list_species {
        return list_species(&registry);
    }

    if let Some(nthreads) = args.nthreads {
        if let Err(err) = rayon::ThreadPoolBuilder::new().num_threads(nthreads).build_global() {
            error!("Unable to configure thread pool: {}", err);
        }
    }
    info!("Using {} threads", current_num_threads());

    let scale = args.microns_per_pixel.map(|per_pixel| PixelScale {
        unit: args.scale_unit,
        per_pixel,
    });
    if let Some(scale) = &scale {
        scale.validate()?;
    }

    let Some(slide_sheet) = &args.slide_sheet else {
        return Ok(());
    };
    let slides = read_slide_sheet(slide_sheet, &registry)?;

    if let Some(dir) = &args.output_validated_dir {
        fs::create_dir_all(dir)?;
    }

    let settings = RunSettings {
        tile_size: args.tile_size,
        stride: args.stride,
        thresholds: ThresholdOverrides {
            min_overlap: args.min_overlap,
            min_confidence: args.min_confidence,
            min_tissue_ratio: args.min_tissue_ratio,
        },
        scale,
        validated_dir: args.output_validated_dir.clone(),
    };

    let (manifest, diagnostics) = run(&slides, &registry, &settings)?;
    manifest.log_summary();
    diagnostics.log_summary();

    write_manifest(&args.output_manifest, &manifest)?;
    diagnostics.write_csv(&args.output_diagnostics)?;
    if args.review_size > 0 {
        write_review_sample(&args.output_review, &manifest, args.review_size, args.review_seed)?;
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run_cli(Args::parse()) {
        error!("{}", err);
        exit(1);
    }
}
