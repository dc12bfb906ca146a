//! Hyperparameter search over the EPSF settings.
//!
//! Evaluations run on tokio's blocking pool, at most `workers` at a time.
//! Each finished evaluation is told to the optimizer and the optimizer state
//! is written to disk, so an interrupted search resumes where it stopped.

use serde::{Deserialize, Serialize};
use shared::io::{load_json, save_json};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::config::{Config, SmoothingKernel};
use crate::optimizer::{Dimension, Optimizer};
use crate::pipeline::photometry_for_recipe;
use crate::Result;

/// Loss reported for evaluations that failed or fitted nothing.
pub const FAILED_LOSS: f64 = 100.0;

/// Default optimizer state file.
pub const STATE_FILENAME: &str = "optimize_result.json";

/// One point of the search space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    pub cutout_size: usize,
    /// Fit box is `2 * fitshape_half + 1` pixels
    pub fitshape_half: usize,
    /// Sigma of the 5x5 Gaussian smoothing kernel
    pub sigma: f64,
    /// EPSF builder iterations
    pub iters: usize,
}

impl SearchParams {
    pub fn space() -> Vec<Dimension> {
        vec![
            Dimension::Integer { low: 5, high: 40 },
            Dimension::Integer { low: 5, high: 15 },
            Dimension::Real { low: 0.2, high: 0.4 },
            Dimension::Integer { low: 5, high: 30 },
        ]
    }

    /// Decode an optimizer point; `None` if it has the wrong length or a
    /// negative integer coordinate.
    pub fn from_point(point: &[f64]) -> Option<Self> {
        let [cutout_size, fitshape_half, sigma, iters] = point else {
            return None;
        };
        let count = |v: f64| (v >= 0.0 && v.is_finite()).then_some(v.round() as usize);
        Some(Self {
            cutout_size: count(*cutout_size)?,
            fitshape_half: count(*fitshape_half)?,
            sigma: *sigma,
            iters: count(*iters)?,
        })
    }

    pub fn to_point(&self) -> Vec<f64> {
        vec![
            self.cutout_size as f64,
            self.fitshape_half as f64,
            self.sigma,
            self.iters as f64,
        ]
    }

    /// `base` with these settings, catalogue positions, one photometry pass
    /// and no oversampling.
    pub fn apply(&self, base: &Config) -> Config {
        Config {
            oversampling: 1,
            smoothing: SmoothingKernel::Gaussian { sigma: self.sigma },
            fitshape: Some(self.fitshape_half * 2 + 1),
            cutout_size: self.cutout_size,
            epsfbuilder_iters: self.iters,
            ..base.clone()
        }
        .with_catalogue_positions()
    }
}

/// Positional loss of one photometry run on `recipe`.
///
/// Any failure, and a run that fits nothing, scores [`FAILED_LOSS`].
pub fn objective(params: &SearchParams, recipe: &str, base: &Config) -> f64 {
    match photometry_for_recipe(recipe, &params.apply(base)) {
        Ok(result) if !result.result_table.is_empty() => {
            let loss = result.offset_loss();
            if loss.is_finite() {
                loss
            } else {
                FAILED_LOSS
            }
        }
        Ok(_) => {
            log::warn!("{params:?}: no sources fitted");
            FAILED_LOSS
        }
        Err(e) => {
            log::warn!("{params:?}: evaluation failed: {e}");
            FAILED_LOSS
        }
    }
}

/// Persistent search state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchState {
    pub optimizer: Optimizer,
}

impl SearchState {
    /// Resume from `path` if it exists, otherwise start from `fresh()`.
    ///
    /// Points that were in flight when the state was saved are dropped.
    pub fn load_or_new(path: &Path, fresh: impl FnOnce() -> Optimizer) -> Result<Self> {
        if path.exists() {
            let mut state: SearchState = load_json(path)?;
            state.optimizer.clear_pending();
            log::info!(
                "Resuming search from {} with {} observations",
                path.display(),
                state.optimizer.n_observations()
            );
            Ok(state)
        } else {
            log::info!("Starting a new search");
            Ok(Self { optimizer: fresh() })
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        Ok(save_json(self, path)?)
    }
}

/// Driver settings.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    /// Evaluations to submit in this run
    pub evaluations: usize,
    /// Maximum evaluations in flight
    pub workers: usize,
    pub state_path: PathBuf,
}

/// How a search run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchEnd {
    Completed,
    Interrupted,
}

/// Ask/tell loop over `evaluate`, stopping after `evaluations` submissions
/// or on Ctrl-C.
///
/// An evaluation that panics scores [`FAILED_LOSS`]. On interrupt,
/// evaluations still running are abandoned and the state
/// learned so far is saved.
pub async fn run_search<F>(
    mut state: SearchState,
    settings: &SearchSettings,
    evaluate: F,
) -> Result<(SearchState, SearchEnd)>
where
    F: Fn(SearchParams) -> f64 + Send + Sync + 'static,
{
    let evaluate = Arc::new(evaluate);
    let workers = settings.workers.max(1);
    let mut jobs: JoinSet<(Vec<f64>, f64)> = JoinSet::new();
    let mut submitted = 0;
    let mut end = SearchEnd::Completed;

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        while submitted < settings.evaluations && jobs.len() < workers {
            let point = state.optimizer.ask();
            submitted += 1;
            let Some(params) = SearchParams::from_point(&point) else {
                log::warn!("optimizer proposed an invalid point {point:?}");
                state.optimizer.tell(point, FAILED_LOSS);
                continue;
            };
            log::info!("Evaluation #{submitted}: {params:?}");
            let evaluate = Arc::clone(&evaluate);
            jobs.spawn_blocking(move || {
                // A panicking evaluation still has to be told, or the point stays pending
                let loss = catch_unwind(AssertUnwindSafe(|| (*evaluate)(params)))
                    .unwrap_or_else(|_| {
                        log::warn!("{params:?}: evaluation panicked");
                        FAILED_LOSS
                    });
                (point, loss)
            });
        }

        if jobs.is_empty() {
            break;
        }

        tokio::select! {
            joined = jobs.join_next() => match joined {
                Some(Ok((point, loss))) => {
                    log::info!("loss {loss:.5} at {point:?}");
                    state.optimizer.tell(point, loss);
                    state.save(&settings.state_path)?;
                }
                Some(Err(e)) => log::error!("evaluation task failed: {e}"),
                None => break,
            },
            signal = &mut interrupt => {
                match signal {
                    Ok(()) => log::warn!(
                        "Interrupted, abandoning {} running evaluations",
                        jobs.len()
                    ),
                    Err(e) => log::error!("cannot listen for Ctrl-C: {e}"),
                }
                end = SearchEnd::Interrupted;
                break;
            }
        }
    }

    jobs.abort_all();
    state.optimizer.clear_pending();
    state.save(&settings.state_path)?;
    if let Some((x, y)) = state.optimizer.best() {
        log::info!(
            "Best loss {y:.5} at {:?} after {} observations",
            SearchParams::from_point(x),
            state.optimizer.n_observations()
        );
    }
    Ok((state, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fresh() -> Optimizer {
        Optimizer::new(SearchParams::space(), 1, 4)
    }

    #[test]
    fn test_params_point_roundtrip() {
        let params = SearchParams {
            cutout_size: 20,
            fitshape_half: 7,
            sigma: 0.3,
            iters: 10,
        };
        assert_eq!(SearchParams::from_point(&params.to_point()), Some(params));
        assert!(SearchParams::from_point(&[1.0, 2.0]).is_none());
        assert!(SearchParams::from_point(&[-1.0, 2.0, 0.3, 4.0]).is_none());

        let config = params.apply(&Config::default());
        assert_eq!(config.fitshape, Some(15));
        assert_eq!(config.oversampling, 1);
        assert!(config.use_catalogue_positions);
        assert_eq!(config.photometry_iterations, 1);
    }

    #[test]
    fn test_objective_failure_is_sentinel() {
        let params = SearchParams {
            cutout_size: 20,
            fitshape_half: 7,
            sigma: 0.3,
            iters: 2,
        };
        let dir = TempDir::new().unwrap();
        let config = Config::default().with_image_folder(dir.path());
        assert_eq!(objective(&params, "no_such_recipe", &config), FAILED_LOSS);
    }

    #[tokio::test]
    async fn test_search_runs_and_persists() {
        let dir = TempDir::new().unwrap();
        let settings = SearchSettings {
            evaluations: 12,
            workers: 3,
            state_path: dir.path().join(STATE_FILENAME),
        };
        let state = SearchState::load_or_new(&settings.state_path, fresh).unwrap();
        let (state, end) = run_search(state, &settings, |p| (p.cutout_size as f64 - 20.0).abs())
            .await
            .unwrap();
        assert_eq!(end, SearchEnd::Completed);
        assert_eq!(state.optimizer.n_observations(), 12);
        assert_eq!(state.optimizer.n_pending(), 0);

        let reloaded = SearchState::load_or_new(&settings.state_path, fresh).unwrap();
        assert_eq!(reloaded, state);
    }

    #[tokio::test]
    async fn test_panicking_evaluation_scores_failed_loss() {
        let dir = TempDir::new().unwrap();
        let settings = SearchSettings {
            evaluations: 4,
            workers: 2,
            state_path: dir.path().join(STATE_FILENAME),
        };
        let state = SearchState::load_or_new(&settings.state_path, fresh).unwrap();
        let (state, end) = run_search(state, &settings, |p| {
            if p.cutout_size % 2 == 0 {
                panic!("even cutout size {}", p.cutout_size);
            }
            1.0
        })
        .await
        .unwrap();
        assert_eq!(end, SearchEnd::Completed);
        assert_eq!(state.optimizer.n_observations(), 4);
        assert_eq!(state.optimizer.n_pending(), 0);

        for (point, loss) in state.optimizer.observations() {
            let params = SearchParams::from_point(point).unwrap();
            let expected = if params.cutout_size % 2 == 0 { FAILED_LOSS } else { 1.0 };
            assert_eq!(loss, expected, "{params:?}");
        }
    }
}
