//! Point correspondence via nearest-neighbor matching.

use nalgebra::Vector2;

use crate::spatial::KdTree;

/// Nearest target for one source point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointMatch {
    pub source: usize,
    pub target: usize,
    /// Euclidean distance between the two points
    pub distance: f64,
}

/// Finds the closest target point for each source point.
///
/// Several sources may share a target. Sources with non-finite
/// coordinates, or an empty target set, produce no match.
pub fn match_nearest(
    source_points: &[Vector2<f64>],
    target_points: &[Vector2<f64>],
) -> Vec<PointMatch> {
    let tree = KdTree::build(target_points);
    source_points
        .iter()
        .enumerate()
        .filter_map(|(i, p)| {
            tree.nearest(*p).map(|(j, distance)| PointMatch {
                source: i,
                target: j,
                distance,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(matches: &[PointMatch]) -> Vec<(usize, usize)> {
        matches.iter().map(|m| (m.source, m.target)).collect()
    }

    #[test]
    fn test_exact_match() {
        let points = vec![
            Vector2::new(0.0, 0.0),
            Vector2::new(1.0, 0.0),
            Vector2::new(0.0, 1.0),
        ];
        let matches = match_nearest(&points, &points);
        assert_eq!(pairs(&matches), vec![(0, 0), (1, 1), (2, 2)]);
        assert!(matches.iter().all(|m| m.distance == 0.0));
    }

    #[test]
    fn test_asymmetric_sizes() {
        let source = vec![Vector2::new(0.0, 0.0), Vector2::new(10.0, 10.0)];
        let target = vec![
            Vector2::new(0.1, 0.0),
            Vector2::new(5.0, 5.0),
            Vector2::new(9.9, 10.0),
        ];
        let matches = match_nearest(&source, &target);
        assert_eq!(pairs(&matches), vec![(0, 0), (1, 2)]);
        assert!((matches[1].distance - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_many_to_one() {
        let source = vec![
            Vector2::new(0.0, 0.0),
            Vector2::new(0.1, 0.0),
            Vector2::new(0.2, 0.0),
        ];
        let target = vec![Vector2::new(0.0, 0.0), Vector2::new(100.0, 100.0)];
        assert_eq!(pairs(&match_nearest(&source, &target)), vec![(0, 0), (1, 0), (2, 0)]);
    }

    #[test]
    fn test_empty_target() {
        assert!(match_nearest(&[Vector2::new(1.0, 1.0)], &[]).is_empty());
    }
}
