//! Named test-image recipes and their on-disk cache.
//!
//! Every recipe is a deterministic scene description: star profile, layout,
//! magnitude range and detector noise. Generated pixels are written to
//! `<image_folder>/<name>.fits`, the source table of an image to
//! `<image_folder>/<name>.sources.json`, and both are reloaded on later runs.

use ndarray::{s, Array2};
use once_cell::sync::Lazy;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use shared::image_proc::{convolve2d, gaussian_kernel};
use shared::io::{load_json, save_json, PersistError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use crate::catalog::SourceRecord;
use crate::fits::{read_image, write_image, FitsError};
use crate::noise::add_noise;
use crate::render::{add_star, StarProfile};

/// Side length of every recipe image.
pub const IMAGE_SIZE: usize = 1024;

/// Side length of reference PSF arrays.
pub const PSF_SIZE: usize = 101;

const GRID_MARGIN: f64 = 64.0;
const CLUSTER_MARGIN: f64 = 32.0;
const SKY_BACKGROUND: f64 = 100.0;
const READ_NOISE: f64 = 5.0;

const GAUSS_SIGMA: f64 = 1.5;
const MOFFAT: StarProfile = StarProfile::Moffat {
    alpha: 2.0,
    beta: 2.5,
};

#[derive(Error, Debug)]
pub enum RecipeError {
    #[error("unknown recipe '{0}'")]
    UnknownRecipe(String),

    #[error("unknown PSF recipe '{0}'")]
    UnknownPsf(String),

    #[error("image cache error: {0}")]
    Cache(#[from] PersistError),

    #[error("image cache error: {0}")]
    Fits(#[from] FitsError),
}

/// Where stars are placed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Layout {
    /// `per_side × per_side` regular grid with uniform jitter of ±`perturb` pixels
    Grid { per_side: usize, perturb: f64 },
    /// `count` stars normally distributed about the image center
    Cluster { count: usize, spread: f64 },
    /// One star at a fixed position
    Single { x: f64, y: f64 },
}

/// Full description of a synthetic scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneSpec {
    pub size: usize,
    pub profile: StarProfile,
    pub layout: Layout,
    /// Magnitudes are drawn uniformly from `[lo, hi]`; equal bounds give a fixed magnitude
    pub magnitudes: (f64, f64),
    pub background: f64,
    pub read_noise: f64,
    pub noisy: bool,
    /// Gaussian low-pass applied to the noiseless star field before noise
    pub lowpass_sigma: Option<f64>,
}

impl SceneSpec {
    fn grid(profile: StarProfile, perturb: f64, magnitudes: (f64, f64)) -> Self {
        Self {
            size: IMAGE_SIZE,
            profile,
            layout: Layout::Grid {
                per_side: 16,
                perturb,
            },
            magnitudes,
            background: SKY_BACKGROUND,
            read_noise: READ_NOISE,
            noisy: true,
            lowpass_sigma: None,
        }
    }

    fn cluster(count: usize) -> Self {
        Self {
            layout: Layout::Cluster {
                count,
                spread: 150.0,
            },
            ..Self::grid(StarProfile::Gaussian { sigma: GAUSS_SIGMA }, 0.0, (18.0, 24.0))
        }
    }

    fn lowpass(self, sigma: f64) -> Self {
        Self {
            lowpass_sigma: Some(sigma),
            ..self
        }
    }

    fn positions(&self, rng: &mut ChaCha8Rng) -> Vec<(f64, f64)> {
        let size = self.size as f64;
        match self.layout {
            Layout::Grid { per_side, perturb } => {
                let step = if per_side > 1 {
                    (size - 2.0 * GRID_MARGIN) / (per_side - 1) as f64
                } else {
                    0.0
                };
                let mut out = Vec::with_capacity(per_side * per_side);
                for row in 0..per_side {
                    for col in 0..per_side {
                        let jitter = |rng: &mut ChaCha8Rng| {
                            if perturb > 0.0 {
                                rng.random_range(-perturb..=perturb)
                            } else {
                                0.0
                            }
                        };
                        let x = GRID_MARGIN + col as f64 * step + jitter(rng);
                        let y = GRID_MARGIN + row as f64 * step + jitter(rng);
                        out.push((x, y));
                    }
                }
                out
            }
            Layout::Cluster { count, spread } => {
                let center = (size - 1.0) / 2.0;
                let Ok(dist) = Normal::new(center, spread) else {
                    return Vec::new();
                };
                let lo = CLUSTER_MARGIN;
                let hi = size - 1.0 - CLUSTER_MARGIN;
                let mut out = Vec::with_capacity(count);
                while out.len() < count {
                    let x = dist.sample(rng);
                    let y = dist.sample(rng);
                    if (lo..=hi).contains(&x) && (lo..=hi).contains(&y) {
                        out.push((x, y));
                    }
                }
                out
            }
            Layout::Single { x, y } => vec![(x, y)],
        }
    }

    /// Render the scene. The same seed always yields the same image.
    pub fn render(&self, seed: u64) -> (Array2<f64>, Vec<SourceRecord>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let (mag_lo, mag_hi) = self.magnitudes;

        let sources: Vec<SourceRecord> = self
            .positions(&mut rng)
            .into_iter()
            .enumerate()
            .map(|(id, (x, y))| {
                let mag = if mag_hi > mag_lo {
                    rng.random_range(mag_lo..=mag_hi)
                } else {
                    mag_lo
                };
                SourceRecord::from_magnitude(id, x, y, mag)
            })
            .collect();

        let mut image = Array2::zeros((self.size, self.size));
        for source in &sources {
            add_star(&mut image, &self.profile, source.x, source.y, source.flux);
        }

        if let Some(sigma) = self.lowpass_sigma {
            let kernel = gaussian_kernel((6.0 * sigma).ceil() as usize, sigma);
            image = convolve2d(&image.view(), &kernel.view(), None);
        }

        if self.noisy {
            add_noise(&mut image, self.background, self.read_noise, rng.random());
        }

        (image, sources)
    }
}

/// A named, seeded scene.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub name: &'static str,
    pub scene: SceneSpec,
    pub seed: u64,
}

/// A rendered image with its ground-truth source table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestImage {
    pub name: String,
    pub image: Array2<f64>,
    pub sources: Vec<SourceRecord>,
}

impl Recipe {
    pub fn generate(&self) -> TestImage {
        let (image, sources) = self.scene.render(self.seed);
        TestImage {
            name: self.name.to_string(),
            image,
            sources,
        }
    }

    /// Name of the reference PSF matching this recipe's star profile.
    pub fn psf_name(&self) -> &'static str {
        match self.scene.profile {
            StarProfile::Gaussian { sigma } if sigma > GAUSS_SIGMA => "gauss_sigma5_psf",
            StarProfile::Gaussian { .. } => "gauss_psf",
            StarProfile::Moffat { .. } => "moffat_psf",
        }
    }
}

static REGISTRY: Lazy<BTreeMap<&'static str, Recipe>> = Lazy::new(|| {
    let gauss = StarProfile::Gaussian { sigma: GAUSS_SIGMA };
    let gauss5 = StarProfile::Gaussian { sigma: 5.0 };

    let recipes = [
        ("gauss_grid_16_perturb0", SceneSpec::grid(gauss, 0.0, (20.0, 20.0)), 101),
        ("gauss_grid_16_perturb2", SceneSpec::grid(gauss, 2.0, (20.0, 20.0)), 102),
        ("gauss_grid_16_sigma5_perturb2", SceneSpec::grid(gauss5, 2.0, (20.0, 20.0)), 103),
        ("gauss_grid_16_perturb2_mag18_24", SceneSpec::grid(gauss, 2.0, (18.0, 24.0)), 104),
        ("gauss_cluster_N1000", SceneSpec::cluster(1000), 105),
        ("moffat_grid_16_perturb2", SceneSpec::grid(MOFFAT, 2.0, (20.0, 20.0)), 106),
        (
            "single_star",
            SceneSpec {
                layout: Layout::Single { x: 512.0, y: 512.0 },
                noisy: false,
                background: 0.0,
                read_noise: 0.0,
                ..SceneSpec::grid(gauss, 0.0, (18.0, 18.0))
            },
            107,
        ),
        (
            "gauss_grid_16_perturb2_lowpass",
            SceneSpec::grid(gauss, 2.0, (20.0, 20.0)).lowpass(1.5),
            201,
        ),
        (
            "moffat_grid_16_perturb2_lowpass",
            SceneSpec::grid(MOFFAT, 2.0, (20.0, 20.0)).lowpass(1.5),
            202,
        ),
        (
            "gauss_cluster_N1000_lowpass",
            SceneSpec::cluster(1000).lowpass(1.5),
            203,
        ),
    ];

    recipes
        .into_iter()
        .map(|(name, scene, seed)| (name, Recipe { name, scene, seed }))
        .collect()
});

/// All known recipes by name.
pub fn registry() -> &'static BTreeMap<&'static str, Recipe> {
    &REGISTRY
}

pub fn lookup(name: &str) -> Result<&'static Recipe, RecipeError> {
    REGISTRY
        .get(name)
        .ok_or_else(|| RecipeError::UnknownRecipe(name.to_string()))
}

/// Recipes run with every standard configuration variant.
pub fn normal_images() -> Vec<&'static str> {
    REGISTRY
        .keys()
        .copied()
        .filter(|name| !name.ends_with("_lowpass") && *name != "single_star")
        .collect()
}

/// Recipes whose star field was low-pass filtered before noise.
pub fn lowpass_images() -> Vec<&'static str> {
    REGISTRY
        .keys()
        .copied()
        .filter(|name| name.ends_with("_lowpass"))
        .collect()
}

/// Recipes fitted with a reference PSF at the true positions.
pub fn cheating_images() -> Vec<&'static str> {
    vec![
        "gauss_grid_16_perturb0",
        "gauss_grid_16_perturb2",
        "gauss_grid_16_sigma5_perturb2",
        "moffat_grid_16_perturb2",
        "gauss_cluster_N1000",
    ]
}

/// Recipe used as the hyperparameter search objective.
pub fn benchmark_images() -> Vec<&'static str> {
    vec!["gauss_grid_16_perturb2_mag18_24"]
}

/// Serializes generation so concurrent workers never render the same
/// recipe twice or interleave cache writes.
static GENERATOR_LOCK: Mutex<()> = Mutex::new(());

fn pixels_path(image_folder: &Path, name: &str) -> PathBuf {
    image_folder.join(format!("{name}.fits"))
}

fn sources_path(image_folder: &Path, name: &str) -> PathBuf {
    image_folder.join(format!("{name}.sources.json"))
}

/// Run `load` if every file in `paths` exists, otherwise `generate` and
/// `store` under [`GENERATOR_LOCK`].
fn read_or_generate<T>(
    paths: &[&Path],
    load: impl Fn() -> Result<T, RecipeError>,
    generate: impl FnOnce() -> T,
    store: impl FnOnce(&T) -> Result<(), RecipeError>,
) -> Result<T, RecipeError> {
    let cached = || paths.iter().all(|p| p.exists());
    if cached() {
        log::debug!("Loading cached {}", paths[0].display());
        return load();
    }

    let _guard = GENERATOR_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    // Another worker may have written it while we waited
    if cached() {
        return load();
    }
    log::info!("Generating {}", paths[0].display());
    let value = generate();
    store(&value)?;
    Ok(value)
}

/// Load the cached image `name`, rendering and caching it first if absent.
pub fn read_or_generate_image(name: &str, image_folder: &Path) -> Result<TestImage, RecipeError> {
    let recipe = lookup(name)?;
    let pixels = pixels_path(image_folder, name);
    let sources = sources_path(image_folder, name);
    read_or_generate(
        &[pixels.as_path(), sources.as_path()],
        || {
            Ok(TestImage {
                name: name.to_string(),
                image: read_image(&pixels)?,
                sources: load_json(&sources)?,
            })
        },
        || recipe.generate(),
        |test_image| {
            write_image(&test_image.image, &pixels)?;
            // The table goes last so a complete pair marks a finished write
            save_json(&test_image.sources, &sources)?;
            Ok(())
        },
    )
}

fn psf_profile(name: &str) -> Option<StarProfile> {
    match name {
        "gauss_psf" => Some(StarProfile::Gaussian { sigma: GAUSS_SIGMA }),
        "gauss_sigma5_psf" => Some(StarProfile::Gaussian { sigma: 5.0 }),
        "moffat_psf" => Some(MOFFAT),
        _ => None,
    }
}

/// Cut a `shape` window from the middle of `data`.
///
/// The window's central pixel coincides with the central pixel of `data`
/// when both sizes are odd. Shapes larger than `data` are clamped.
pub fn center_cutout(data: &Array2<f64>, shape: (usize, usize)) -> Array2<f64> {
    let (rows, cols) = data.dim();
    let h = shape.0.min(rows);
    let w = shape.1.min(cols);
    let r0 = rows / 2 - h / 2;
    let c0 = cols / 2 - w / 2;
    data.slice(s![r0..r0 + h, c0..c0 + w]).to_owned()
}

/// Reference PSF for cheating-mode fits, peak-normalised to 1.
///
/// Rendered noiseless on a larger canvas, then center-cropped to
/// `PSF_SIZE × PSF_SIZE`.
pub fn read_or_generate_psf(name: &str, image_folder: &Path) -> Result<Array2<f64>, RecipeError> {
    let profile = psf_profile(name).ok_or_else(|| RecipeError::UnknownPsf(name.to_string()))?;
    let path = pixels_path(image_folder, name);
    read_or_generate(
        &[path.as_path()],
        || Ok(read_image(&path)?),
        || {
            let canvas = PSF_SIZE + 20;
            let center = (canvas / 2) as f64;
            let mut image = Array2::zeros((canvas, canvas));
            add_star(&mut image, &profile, center, center, 1.0);

            let mut psf = center_cutout(&image, (PSF_SIZE, PSF_SIZE));
            let peak = psf.iter().copied().fold(f64::MIN, f64::max);
            if peak > 0.0 {
                psf /= peak;
            }
            psf
        },
        |psf| Ok(write_image(psf, &path)?),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_subsets_resolve() {
        for name in normal_images()
            .into_iter()
            .chain(lowpass_images())
            .chain(cheating_images())
            .chain(benchmark_images())
        {
            assert!(lookup(name).is_ok(), "{name} missing from registry");
        }
        assert_eq!(lowpass_images().len(), 3);
        assert!(!normal_images().contains(&"single_star"));
    }

    #[test]
    fn test_unknown_recipe() {
        let err = lookup("no_such_image").unwrap_err();
        assert!(matches!(err, RecipeError::UnknownRecipe(ref n) if n == "no_such_image"));
    }

    #[test]
    fn test_grid_positions_inside_margins() {
        let spec = SceneSpec::grid(StarProfile::Gaussian { sigma: 1.5 }, 2.0, (20.0, 20.0));
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let positions = spec.positions(&mut rng);
        assert_eq!(positions.len(), 256);
        for (x, y) in positions {
            assert!(x >= GRID_MARGIN - 2.0 && x <= IMAGE_SIZE as f64 - GRID_MARGIN + 2.0);
            assert!(y >= GRID_MARGIN - 2.0 && y <= IMAGE_SIZE as f64 - GRID_MARGIN + 2.0);
        }
    }

    #[test]
    fn test_cluster_count_and_bounds() {
        let spec = SceneSpec::cluster(300);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let positions = spec.positions(&mut rng);
        assert_eq!(positions.len(), 300);
        assert!(positions
            .iter()
            .all(|&(x, y)| x >= CLUSTER_MARGIN && y >= CLUSTER_MARGIN));
    }

    #[test]
    fn test_psf_names_exist() {
        for recipe in registry().values() {
            assert!(psf_profile(recipe.psf_name()).is_some());
        }
        assert_eq!(lookup("gauss_grid_16_sigma5_perturb2").unwrap().psf_name(), "gauss_sigma5_psf");
    }

    #[test]
    fn test_center_cutout_odd() {
        let data = Array2::from_shape_fn((7, 9), |(r, c)| (r * 10 + c) as f64);
        let cut = center_cutout(&data, (3, 3));
        assert_eq!(cut[[1, 1]], data[[3, 4]]);
    }
}
