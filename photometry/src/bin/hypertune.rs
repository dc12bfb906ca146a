//! Hyperparameter search for the EPSF settings.
//!
//! Minimises the positional loss on one benchmark recipe. The optimizer
//! state is saved after every evaluation; rerunning with the same `--state`
//! file resumes the search. Ctrl-C stops submitting, abandons running
//! evaluations and saves.
//!
//! ```bash
//! cargo run --release --bin hypertune -- --evaluations 500 --workers 10
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use photometry::optimizer::Optimizer;
use photometry::search::{
    objective, run_search, SearchEnd, SearchParams, SearchSettings, SearchState, STATE_FILENAME,
};
use photometry::Config;
use simulator::recipes;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Evaluations to submit in this run
    #[arg(long, default_value_t = 500)]
    evaluations: usize,

    /// Maximum concurrent evaluations
    #[arg(long, default_value_t = 10)]
    workers: usize,

    /// Optimizer state file; resumed when present
    #[arg(long, default_value = STATE_FILENAME)]
    state: PathBuf,

    /// Recipe used as the objective
    #[arg(long, default_value = "gauss_grid_16_perturb2_mag18_24")]
    recipe: String,

    /// Optimizer random seed (fresh searches only)
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Random evaluations before the surrogate is used
    #[arg(long, default_value_t = 15)]
    initial_points: usize,

    /// JSON configuration overriding the defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Folder holding cached recipe images
    #[arg(long)]
    image_folder: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    recipes::lookup(&args.recipe).context("unknown objective recipe")?;
    let mut base = match &args.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading config {}", path.display()))?
        }
        None => Config::instance().clone(),
    };
    if let Some(folder) = &args.image_folder {
        base = base.with_image_folder(folder);
    }
    std::fs::create_dir_all(&base.image_folder)
        .with_context(|| format!("creating {}", base.image_folder.display()))?;

    let state = SearchState::load_or_new(&args.state, || {
        Optimizer::new(SearchParams::space(), args.seed, args.initial_points)
    })
    .with_context(|| format!("loading {}", args.state.display()))?;

    let settings = SearchSettings {
        evaluations: args.evaluations,
        workers: args.workers,
        state_path: args.state.clone(),
    };
    let recipe = args.recipe.clone();
    let (state, end) = run_search(state, &settings, move |params| {
        objective(&params, &recipe, &base)
    })
    .await?;

    match state.optimizer.best() {
        Some((point, loss)) => println!(
            "best loss {loss:.5} with {:?} ({} observations)",
            SearchParams::from_point(point),
            state.optimizer.n_observations()
        ),
        None => println!("no observations yet"),
    }
    if end == SearchEnd::Interrupted {
        println!("search interrupted, state saved to {}", args.state.display());
    }
    Ok(())
}
