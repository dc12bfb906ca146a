//! A 2D k-d tree over star positions.
//!
//! Built once per catalogue and queried for nearest neighbours (matching,
//! crowding filters) and fixed-radius neighbourhoods (star grouping).

use nalgebra::Vector2;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone)]
struct Node {
    point: usize,
    left: Option<usize>,
    right: Option<usize>,
    axis: usize,
}

/// Balanced 2D k-d tree storing indices into the original point slice.
#[derive(Debug, Clone)]
pub struct KdTree {
    points: Vec<Vector2<f64>>,
    nodes: Vec<Node>,
    root: Option<usize>,
}

/// Heap entry ordered by squared distance, largest first.
#[derive(Debug, PartialEq)]
struct Candidate {
    dist_sq: f64,
    index: usize,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist_sq
            .total_cmp(&other.dist_sq)
            .then(self.index.cmp(&other.index))
    }
}

impl KdTree {
    /// Build a tree by median splits, alternating x and y.
    ///
    /// Non-finite points are stored but never returned by queries.
    pub fn build(points: &[Vector2<f64>]) -> Self {
        let points = points.to_vec();
        let mut indices: Vec<usize> = (0..points.len())
            .filter(|&i| points[i].x.is_finite() && points[i].y.is_finite())
            .collect();
        let mut nodes = Vec::with_capacity(indices.len());
        let root = Self::build_recursive(&points, &mut indices, 0, &mut nodes);
        Self {
            points,
            nodes,
            root,
        }
    }

    fn build_recursive(
        points: &[Vector2<f64>],
        indices: &mut [usize],
        depth: usize,
        nodes: &mut Vec<Node>,
    ) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }
        let axis = depth % 2;
        indices.sort_by(|&a, &b| points[a][axis].total_cmp(&points[b][axis]));
        let median = indices.len() / 2;

        let node_idx = nodes.len();
        nodes.push(Node {
            point: indices[median],
            left: None,
            right: None,
            axis,
        });

        let (left, rest) = indices.split_at_mut(median);
        let left = Self::build_recursive(points, left, depth + 1, nodes);
        let right = Self::build_recursive(points, &mut rest[1..], depth + 1, nodes);
        nodes[node_idx].left = left;
        nodes[node_idx].right = right;
        Some(node_idx)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, index: usize) -> Vector2<f64> {
        self.points[index]
    }

    /// Nearest stored point to `query` as `(index, distance)`.
    pub fn nearest(&self, query: Vector2<f64>) -> Option<(usize, f64)> {
        self.k_nearest(query, 1).into_iter().next()
    }

    /// The `k` nearest points as `(index, distance)`, closest first.
    pub fn k_nearest(&self, query: Vector2<f64>, k: usize) -> Vec<(usize, f64)> {
        let Some(root) = self.root else {
            return Vec::new();
        };
        if k == 0 || !query.x.is_finite() || !query.y.is_finite() {
            return Vec::new();
        }
        let mut heap = BinaryHeap::with_capacity(k + 1);
        self.k_nearest_recursive(root, query, k, &mut heap);
        heap.into_sorted_vec()
            .into_iter()
            .map(|c| (c.index, c.dist_sq.sqrt()))
            .collect()
    }

    fn k_nearest_recursive(
        &self,
        node_idx: usize,
        query: Vector2<f64>,
        k: usize,
        heap: &mut BinaryHeap<Candidate>,
    ) {
        let node = &self.nodes[node_idx];
        let point = self.points[node.point];
        heap.push(Candidate {
            dist_sq: (point - query).norm_squared(),
            index: node.point,
        });
        if heap.len() > k {
            heap.pop();
        }

        let diff = query[node.axis] - point[node.axis];
        let (near, far) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };
        if let Some(near) = near {
            self.k_nearest_recursive(near, query, k, heap);
        }
        if let Some(far) = far {
            let worst = heap.peek().map_or(f64::INFINITY, |c| c.dist_sq);
            if heap.len() < k || diff * diff < worst {
                self.k_nearest_recursive(far, query, k, heap);
            }
        }
    }

    /// Indices of all points within `radius` of `query` (inclusive), unsorted.
    pub fn within_radius(&self, query: Vector2<f64>, radius: f64) -> Vec<usize> {
        let mut found = Vec::new();
        if let Some(root) = self.root {
            self.radius_recursive(root, query, radius * radius, &mut found);
        }
        found
    }

    fn radius_recursive(
        &self,
        node_idx: usize,
        query: Vector2<f64>,
        radius_sq: f64,
        found: &mut Vec<usize>,
    ) {
        let node = &self.nodes[node_idx];
        let point = self.points[node.point];
        if (point - query).norm_squared() <= radius_sq {
            found.push(node.point);
        }
        let diff = query[node.axis] - point[node.axis];
        let (near, far) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };
        if let Some(near) = near {
            self.radius_recursive(near, query, radius_sq, found);
        }
        if let Some(far) = far {
            if diff * diff <= radius_sq {
                self.radius_recursive(far, query, radius_sq, found);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn brute_nearest(points: &[Vector2<f64>], q: Vector2<f64>) -> usize {
        let mut best = (0, f64::INFINITY);
        for (i, p) in points.iter().enumerate() {
            let d = (p - q).norm_squared();
            if d < best.1 {
                best = (i, d);
            }
        }
        best.0
    }

    #[test]
    fn test_empty_tree() {
        let tree = KdTree::build(&[]);
        assert!(tree.is_empty());
        assert!(tree.nearest(Vector2::new(0.0, 0.0)).is_none());
        assert!(tree.within_radius(Vector2::new(0.0, 0.0), 10.0).is_empty());
    }

    #[test]
    fn test_nearest_matches_brute_force() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let points: Vec<Vector2<f64>> = (0..500)
            .map(|_| Vector2::new(rng.random_range(0.0..100.0), rng.random_range(0.0..100.0)))
            .collect();
        let tree = KdTree::build(&points);

        for _ in 0..200 {
            let q = Vector2::new(rng.random_range(-10.0..110.0), rng.random_range(-10.0..110.0));
            let (idx, dist) = tree.nearest(q).unwrap();
            assert_eq!(idx, brute_nearest(&points, q));
            assert!((dist - (points[idx] - q).norm()).abs() < 1e-12);
        }
    }

    #[test]
    fn test_k_nearest_sorted() {
        let points: Vec<Vector2<f64>> = (0..10).map(|i| Vector2::new(i as f64, 0.0)).collect();
        let tree = KdTree::build(&points);
        let found = tree.k_nearest(Vector2::new(3.2, 0.0), 3);
        let idx: Vec<usize> = found.iter().map(|f| f.0).collect();
        assert_eq!(idx, vec![3, 4, 2]);
        assert!(found.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn test_within_radius() {
        let points = vec![
            Vector2::new(0.0, 0.0),
            Vector2::new(1.0, 0.0),
            Vector2::new(0.0, 2.0),
            Vector2::new(5.0, 5.0),
        ];
        let tree = KdTree::build(&points);
        let mut found = tree.within_radius(Vector2::new(0.0, 0.0), 2.0);
        found.sort();
        assert_eq!(found, vec![0, 1, 2]);
    }

    #[test]
    fn test_nan_points_skipped() {
        let points = vec![Vector2::new(f64::NAN, 0.0), Vector2::new(3.0, 3.0)];
        let tree = KdTree::build(&points);
        assert_eq!(tree.nearest(Vector2::new(0.0, 0.0)).unwrap().0, 1);
    }
}
