//! Matching fitted positions back to the ground truth.

use meter_math::match_nearest;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::table::{FitRecord, MatchedRecord, SourceRecord};

/// Join every fitted source with its nearest reference source.
///
/// Matches are not exclusive: several fits may share one reference source,
/// and references with no fit nearby are simply absent from the result.
pub fn match_observation_to_source(
    reference: &[SourceRecord],
    observed: &[FitRecord],
) -> Vec<MatchedRecord> {
    let fitted: Vec<Vector2<f64>> = observed
        .iter()
        .map(|f| Vector2::new(f.x_fit, f.y_fit))
        .collect();
    let truth: Vec<Vector2<f64>> = reference.iter().map(|s| Vector2::new(s.x, s.y)).collect();

    match_nearest(&fitted, &truth)
        .into_iter()
        .map(|m| {
            let source = &reference[m.target];
            MatchedRecord {
                fit: observed[m.source],
                x_orig: source.x,
                y_orig: source.y,
                flux_orig: source.flux,
                magnitude: source.magnitude,
                offset: m.distance,
            }
        })
        .collect()
}

/// Root of the summed squared offsets.
pub fn total_offset_loss(matched: &[MatchedRecord]) -> f64 {
    matched.iter().map(|m| m.offset * m.offset).sum::<f64>().sqrt()
}

/// Offset statistics of a matched table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OffsetSummary {
    pub count: usize,
    pub mean: f64,
    pub rms: f64,
    pub max: f64,
}

impl OffsetSummary {
    /// `None` for an empty table.
    pub fn from_matches(matched: &[MatchedRecord]) -> Option<Self> {
        if matched.is_empty() {
            return None;
        }
        let count = matched.len();
        let n = count as f64;
        let mean = matched.iter().map(|m| m.offset).sum::<f64>() / n;
        let rms = (matched.iter().map(|m| m.offset * m.offset).sum::<f64>() / n).sqrt();
        let max = matched.iter().map(|m| m.offset).fold(0.0, f64::max);
        Some(Self {
            count,
            mean,
            rms,
            max,
        })
    }
}

impl std::fmt::Display for OffsetSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} matches, offset mean {:.4} px, rms {:.4} px, max {:.4} px",
            self.count, self.mean, self.rms, self.max
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn fit(x: f64, y: f64) -> FitRecord {
        FitRecord {
            id: 0,
            group_id: 0,
            iter_detected: 1,
            x_0: x,
            y_0: y,
            flux_0: 1.0,
            x_fit: x,
            y_fit: y,
            flux_fit: 1.0,
        }
    }

    #[test]
    fn test_match_and_loss() {
        let reference = vec![
            SourceRecord::from_flux(Some(0), 10.0, 10.0, 100.0),
            SourceRecord::from_flux(Some(1), 50.0, 50.0, 200.0),
        ];
        let observed = vec![fit(10.3, 10.4), fit(50.0, 49.0)];
        let matched = match_observation_to_source(&reference, &observed);

        assert_eq!(matched.len(), 2);
        assert_relative_eq!(matched[0].offset, 0.5, epsilon = 1e-12);
        assert_relative_eq!(matched[0].x_offset(), 0.3, epsilon = 1e-12);
        assert_eq!(matched[1].flux_orig, 200.0);
        assert_relative_eq!(total_offset_loss(&matched), 1.25f64.sqrt(), epsilon = 1e-12);

        let summary = OffsetSummary::from_matches(&matched).unwrap();
        assert_eq!(summary.count, 2);
        assert_relative_eq!(summary.mean, 0.75, epsilon = 1e-12);
        assert_relative_eq!(summary.max, 1.0);
    }

    #[test]
    fn test_duplicates_are_kept() {
        let reference = vec![SourceRecord::from_flux(None, 0.0, 0.0, 1.0)];
        let matched = match_observation_to_source(&reference, &[fit(0.1, 0.0), fit(-0.1, 0.0)]);
        assert_eq!(matched.len(), 2);
        assert!(OffsetSummary::from_matches(&[]).is_none());
        assert_eq!(total_offset_loss(&[]), 0.0);
    }
}
