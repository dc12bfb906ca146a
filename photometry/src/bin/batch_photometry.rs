//! Run the full photometry benchmark and serialize every result.
//!
//! Each normal recipe runs under the normal, Gaussian-smoothing and
//! catalogue-position configurations; the cheating set is fitted with the
//! reference PSFs and the lowpass set with catalogue positions.
//!
//! ```bash
//! cargo run --release --bin batch_photometry -- --workers 10 --output-root runs/
//! cargo run --release --bin batch_photometry -- --only single_star --diagnostics
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;

use photometry::batch::{
    enumerate_jobs, partition_outcomes, run_batch, save_results, ConfigVariants,
};
use photometry::Config;
use simulator::recipes;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of worker threads
    #[arg(long, default_value_t = 10)]
    workers: usize,

    /// Folder for all_photometry_results.json
    #[arg(long, default_value = ".")]
    output: PathBuf,

    /// Folder holding cached recipe images
    #[arg(long)]
    image_folder: Option<PathBuf>,

    /// Parent folder of the per-variant output folders
    #[arg(long, default_value = ".")]
    output_root: PathBuf,

    /// JSON configuration overriding the defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Only run these recipes (repeatable)
    #[arg(long)]
    only: Vec<String>,

    /// Write EPSF and star mosaics for every unit
    #[arg(long)]
    diagnostics: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut base = match &args.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading config {}", path.display()))?
        }
        None => Config::instance().clone(),
    };
    if let Some(folder) = &args.image_folder {
        base = base.with_image_folder(folder);
    }
    base.save_diagnostics |= args.diagnostics;
    base.validate().context("invalid configuration")?;

    let variants = ConfigVariants::new(&base, &args.output_root);
    variants
        .create_folders()
        .context("creating output folders")?;

    let keep = |names: Vec<&'static str>| -> Vec<&'static str> {
        names
            .into_iter()
            .filter(|n| args.only.is_empty() || args.only.iter().any(|o| o == n))
            .collect()
    };
    let jobs = enumerate_jobs(
        &keep(recipes::normal_images()),
        &keep(recipes::cheating_images()),
        &keep(recipes::lowpass_images()),
        &variants,
    );
    if jobs.is_empty() {
        bail!("no recipes selected");
    }
    log::info!("Running {} units on {} workers", jobs.len(), args.workers);

    let progress = ProgressBar::new(jobs.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .context("progress template")?
            .progress_chars("=>-"),
    );

    let outcomes = run_batch(jobs, args.workers, &progress)?;
    progress.finish_with_message("done");

    let (results, failed) = partition_outcomes(outcomes);
    let path = save_results(&results, &args.output).context("saving results")?;
    println!("{} results written to {}", results.len(), path.display());

    if !failed.is_empty() {
        for label in &failed {
            eprintln!("failed: {label}");
        }
        bail!("{} of {} units failed", failed.len(), failed.len() + results.len());
    }
    Ok(())
}
