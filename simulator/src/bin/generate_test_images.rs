//! Pre-render recipe images into the image cache.
//!
//! ```bash
//! cargo run --release --bin generate_test_images -- --image-folder test_images
//! cargo run --release --bin generate_test_images -- --only single_star --list
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::path::PathBuf;

use simulator::recipes::{read_or_generate_image, read_or_generate_psf, registry};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Folder holding cached recipe images
    #[arg(long, default_value = "test_images")]
    image_folder: PathBuf,

    /// Only generate these recipes (repeatable)
    #[arg(long)]
    only: Vec<String>,

    /// Also generate the reference PSFs
    #[arg(long)]
    psfs: bool,

    /// Print the recipe names and exit
    #[arg(long)]
    list: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.list {
        for (name, recipe) in registry() {
            println!("{name:40} {:?}", recipe.scene.layout);
        }
        return Ok(());
    }

    let names: Vec<String> = if args.only.is_empty() {
        registry().keys().map(|s| s.to_string()).collect()
    } else {
        args.only.clone()
    };

    std::fs::create_dir_all(&args.image_folder)
        .with_context(|| format!("creating {}", args.image_folder.display()))?;

    let progress = ProgressBar::new(names.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .context("progress template")?
            .progress_chars("=>-"),
    );
    progress.set_message("rendering");

    names.par_iter().try_for_each(|name| -> Result<()> {
        let image = read_or_generate_image(name, &args.image_folder)
            .with_context(|| format!("recipe {name}"))?;
        log::info!("{name}: {} sources", image.sources.len());
        if args.psfs {
            let psf_name = registry()[name.as_str()].psf_name();
            read_or_generate_psf(psf_name, &args.image_folder)
                .with_context(|| format!("psf {psf_name}"))?;
        }
        progress.inc(1);
        Ok(())
    })?;

    progress.finish_with_message("done");
    Ok(())
}
