//! Benchmark batch: every recipe under every configuration variant.

use indicatif::ProgressBar;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use shared::io::{load_json, save_json};
use std::path::{Path, PathBuf};

use crate::config::{Config, SmoothingKernel};
use crate::pipeline::{cheating_for_recipe, photometry_for_recipe, PhotometryResult};
use crate::{PhotometryError, Result};

/// File name of the serialized batch output.
pub const RESULTS_FILENAME: &str = "all_photometry_results.json";

/// One unit of batch work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BatchJob {
    /// Build an EPSF from the image and fit with it
    Photometry { recipe: String, config: Config },
    /// Fit the reference PSF at the true positions
    Cheating { recipe: String, config: Config },
}

impl BatchJob {
    pub fn recipe(&self) -> &str {
        match self {
            BatchJob::Photometry { recipe, .. } | BatchJob::Cheating { recipe, .. } => recipe,
        }
    }

    pub fn config(&self) -> &Config {
        match self {
            BatchJob::Photometry { config, .. } | BatchJob::Cheating { config, .. } => config,
        }
    }

    /// `<kind>:<recipe>@<output folder>`, unique within a standard batch.
    pub fn label(&self) -> String {
        let kind = match self {
            BatchJob::Photometry { .. } => "photometry",
            BatchJob::Cheating { .. } => "cheating",
        };
        format!(
            "{kind}:{}@{}",
            self.recipe(),
            self.config().output_folder.display()
        )
    }

    pub fn run(&self) -> Result<PhotometryResult> {
        match self {
            BatchJob::Photometry { recipe, config } => photometry_for_recipe(recipe, config),
            BatchJob::Cheating { recipe, config } => cheating_for_recipe(recipe, config),
        }
    }
}

/// The five configuration variants of the standard benchmark.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigVariants {
    pub normal: Config,
    pub gauss: Config,
    pub init_guess: Config,
    pub cheating: Config,
    pub lowpass: Config,
}

impl ConfigVariants {
    /// Derive the variants from `base`, each writing below `output_root`.
    pub fn new(base: &Config, output_root: &Path) -> Self {
        let gauss_smoothing = SmoothingKernel::Gaussian { sigma: 1.0 };
        Self {
            normal: base.clone().with_output_folder(output_root.join("output_files")),
            gauss: base
                .clone()
                .with_smoothing(gauss_smoothing.clone())
                .with_output_folder(output_root.join("output_files_gaussian_smooth")),
            init_guess: base
                .clone()
                .with_smoothing(gauss_smoothing.clone())
                .with_catalogue_positions()
                .with_output_folder(output_root.join("output_files_initial_guess")),
            cheating: base
                .clone()
                .with_output_folder(output_root.join("output_cheating_astrometry")),
            lowpass: base
                .clone()
                .with_smoothing(gauss_smoothing)
                .with_catalogue_positions()
                .with_output_folder(output_root.join("output_files_lowpass")),
        }
    }

    pub fn all(&self) -> [&Config; 5] {
        [
            &self.normal,
            &self.gauss,
            &self.init_guess,
            &self.cheating,
            &self.lowpass,
        ]
    }

    /// Create every output folder and the shared image folder.
    pub fn create_folders(&self) -> Result<()> {
        for config in self.all() {
            std::fs::create_dir_all(&config.output_folder)?;
            std::fs::create_dir_all(&config.image_folder)?;
        }
        Ok(())
    }
}

/// Normal recipes × {normal, gauss, init_guess}, then the cheating set, then
/// the lowpass set.
pub fn enumerate_jobs(
    normal: &[&str],
    cheating: &[&str],
    lowpass: &[&str],
    variants: &ConfigVariants,
) -> Vec<BatchJob> {
    let mut jobs = Vec::new();
    for recipe in normal {
        for config in [&variants.normal, &variants.gauss, &variants.init_guess] {
            jobs.push(BatchJob::Photometry {
                recipe: recipe.to_string(),
                config: config.clone(),
            });
        }
    }
    jobs.extend(cheating.iter().map(|recipe| BatchJob::Cheating {
        recipe: recipe.to_string(),
        config: variants.cheating.clone(),
    }));
    jobs.extend(lowpass.iter().map(|recipe| BatchJob::Photometry {
        recipe: recipe.to_string(),
        config: variants.lowpass.clone(),
    }));
    jobs
}

/// Result of one unit, labelled for reporting.
#[derive(Debug)]
pub struct BatchOutcome {
    pub label: String,
    pub result: Result<PhotometryResult>,
}

/// Run `jobs` on a pool of `workers` threads.
///
/// Outcomes come back in job order. A failing unit is logged and reported
/// in its outcome; it never stops the others.
pub fn run_batch(
    jobs: Vec<BatchJob>,
    workers: usize,
    progress: &ProgressBar,
) -> Result<Vec<BatchOutcome>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .map_err(|e| PhotometryError::InvalidConfig(format!("cannot build worker pool: {e}")))?;

    progress.set_length(jobs.len() as u64);
    let outcomes = pool.install(|| {
        jobs.par_iter()
            .map(|job| {
                let label = job.label();
                progress.set_message(job.recipe().to_string());
                let result = job.run();
                if let Err(e) = &result {
                    log::error!("{label} failed: {e}");
                }
                progress.inc(1);
                BatchOutcome { label, result }
            })
            .collect::<Vec<_>>()
    });
    Ok(outcomes)
}

/// Split outcomes into successes and the labels of failed units.
pub fn partition_outcomes(outcomes: Vec<BatchOutcome>) -> (Vec<PhotometryResult>, Vec<String>) {
    let mut results = Vec::new();
    let mut failed = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(result) => results.push(result),
            Err(_) => failed.push(outcome.label),
        }
    }
    (results, failed)
}

/// Write `results` to `<folder>/all_photometry_results.json`.
pub fn save_results(results: &[PhotometryResult], folder: &Path) -> Result<PathBuf> {
    let path = folder.join(RESULTS_FILENAME);
    save_json(results, &path)?;
    log::info!("{} results saved to {}", results.len(), path.display());
    Ok(path)
}

pub fn load_results(path: &Path) -> Result<Vec<PhotometryResult>> {
    Ok(load_json(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_variants_follow_base() {
        let base = Config {
            cutout_size: 31,
            ..Config::default()
        };
        let variants = ConfigVariants::new(&base, Path::new("/tmp/bench"));
        assert!(variants.all().iter().all(|c| c.cutout_size == 31));
        assert!(variants.init_guess.use_catalogue_positions);
        assert!(variants.lowpass.use_catalogue_positions);
        assert!(!variants.normal.use_catalogue_positions);
        assert_eq!(
            variants.cheating.output_folder,
            PathBuf::from("/tmp/bench/output_cheating_astrometry")
        );
    }

    #[test]
    fn test_enumerate_jobs_order() {
        let variants = ConfigVariants::new(&Config::default(), Path::new("out"));
        let jobs = enumerate_jobs(&["a", "b"], &["c"], &["d_lowpass"], &variants);
        assert_eq!(jobs.len(), 2 * 3 + 1 + 1);
        assert_eq!(jobs[0].recipe(), "a");
        assert_eq!(jobs[2].config(), &variants.init_guess);
        assert!(matches!(jobs[6], BatchJob::Cheating { .. }));
        assert_eq!(jobs[7].config(), &variants.lowpass);

        let labels: std::collections::HashSet<String> = jobs.iter().map(BatchJob::label).collect();
        assert_eq!(labels.len(), jobs.len());
    }

    #[test]
    fn test_failures_are_isolated() {
        let dir = TempDir::new().unwrap();
        let config = Config::default().with_image_folder(dir.path());
        let jobs = vec![
            BatchJob::Photometry {
                recipe: "no_such_recipe".into(),
                config: config.clone(),
            },
            BatchJob::Cheating {
                recipe: "single_star".into(),
                config,
            },
        ];
        let outcomes = run_batch(jobs, 2, &ProgressBar::hidden()).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].label.contains("no_such_recipe"));

        let (results, failed) = partition_outcomes(outcomes);
        assert_eq!(failed.len(), 1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result_table.len(), 1);
    }
}
