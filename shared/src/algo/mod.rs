//! Statistical algorithms shared between the simulator and the pipeline.

pub mod stats;

pub use stats::{
    mad_std, median, sigma_clipped_median, sigma_clipped_stats, ClippedStats, StatsError,
    MAD_TO_SIGMA,
};
