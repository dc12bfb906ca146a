//! Per-image photometry entry points.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use simulator::{read_or_generate_image, read_or_generate_psf, recipes};

use crate::config::Config;
use crate::diagnostics;
use crate::epsf::{make_epsf, StarCutout};
use crate::evaluation::{match_observation_to_source, total_offset_loss, OffsetSummary};
use crate::fitter::{do_photometry, fit_at_positions};
use crate::psf::PsfModel;
use crate::table::{FitRecord, MatchedRecord, SourceRecord};
use crate::Result;

/// Everything produced by one photometry run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotometryResult {
    pub image: Array2<f64>,
    /// Ground truth
    pub input_table: Vec<SourceRecord>,
    pub result_table: Vec<FitRecord>,
    pub psf: PsfModel,
    /// Stars the PSF was built from; empty when the PSF was supplied
    pub star_cutouts: Vec<StarCutout>,
    pub config: Config,
    pub filename: String,
}

impl PhotometryResult {
    /// Fitted sources joined with their nearest ground-truth source.
    pub fn matched(&self) -> Vec<MatchedRecord> {
        match_observation_to_source(&self.input_table, &self.result_table)
    }

    /// Root-sum-square positional offset against the ground truth.
    pub fn offset_loss(&self) -> f64 {
        total_offset_loss(&self.matched())
    }

    pub fn offset_summary(&self) -> Option<OffsetSummary> {
        OffsetSummary::from_matches(&self.matched())
    }

    fn finish(self) -> Result<Self> {
        match self.offset_summary() {
            Some(summary) => log::info!("{}: {summary}", self.filename),
            None => log::warn!("{}: no fitted sources", self.filename),
        }
        if self.config.save_diagnostics {
            diagnostics::write_diagnostics(&self, &self.config.output_folder)?;
        }
        Ok(self)
    }
}

/// Build an EPSF from `image` itself and fit every source with it.
///
/// With `use_catalogue_positions` the fitter starts from `input_table`
/// instead of detecting.
pub fn run_photometry(
    image: Array2<f64>,
    input_table: Vec<SourceRecord>,
    filename: &str,
    config: &Config,
) -> Result<PhotometryResult> {
    config.validate()?;
    log::info!("Running photometry on {filename}");
    let epsf = make_epsf(image.view(), config)?;
    let init_guesses = config
        .use_catalogue_positions
        .then_some(input_table.as_slice());
    let result_table = do_photometry(image.view(), &epsf.psf, config, init_guesses)?;

    PhotometryResult {
        image,
        input_table,
        result_table,
        psf: epsf.psf,
        star_cutouts: epsf.stars,
        config: config.clone(),
        filename: filename.to_string(),
    }
    .finish()
}

/// Fit every ground-truth source at its true position with a supplied PSF.
///
/// `psf` is sampled at detector resolution; it is normalised to unit sum
/// before fitting so fluxes come out in image units.
pub fn cheating_astrometry(
    image: Array2<f64>,
    input_table: Vec<SourceRecord>,
    psf: Array2<f64>,
    filename: &str,
    config: &Config,
) -> Result<PhotometryResult> {
    config.validate()?;
    log::info!("Running cheating astrometry on {filename}");
    let psf = PsfModel::normalized(psf, 1)?;
    let result_table = fit_at_positions(image.view(), &psf, config, &input_table)?;

    PhotometryResult {
        image,
        input_table,
        result_table,
        psf,
        star_cutouts: Vec::new(),
        config: config.clone(),
        filename: filename.to_string(),
    }
    .finish()
}

/// [`run_photometry`] on a registry image, generating it if needed.
pub fn photometry_for_recipe(name: &str, config: &Config) -> Result<PhotometryResult> {
    let test_image = read_or_generate_image(name, &config.image_folder)?;
    run_photometry(test_image.image, test_image.sources, name, config)
}

/// [`cheating_astrometry`] on a registry image with the reference PSF of its
/// star profile.
pub fn cheating_for_recipe(name: &str, config: &Config) -> Result<PhotometryResult> {
    let recipe = recipes::lookup(name)?;
    let test_image = read_or_generate_image(name, &config.image_folder)?;
    let psf = read_or_generate_psf(recipe.psf_name(), &config.image_folder)?;
    cheating_astrometry(test_image.image, test_image.sources, psf, name, config)
}
