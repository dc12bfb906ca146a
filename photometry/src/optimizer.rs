//! Sequential model-based minimisation with an ask/tell interface.
//!
//! The first `n_initial_points` proposals are uniform random. After that each
//! proposal is the best of a batch of random candidates under a
//! lower-confidence-bound score from a k-nearest-neighbour surrogate. Points
//! handed out but not yet told count as observed at the current mean loss,
//! so concurrent workers are steered apart.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Random candidates scored per proposal
const CANDIDATES: usize = 2000;
/// Neighbours averaged by the surrogate
const NEIGHBOURS: usize = 5;
/// Weight of the uncertainty term in the score
const KAPPA: f64 = 1.96;

/// One axis of the search space, bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Dimension {
    Integer { low: i64, high: i64 },
    Real { low: f64, high: f64 },
}

impl Dimension {
    fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        match *self {
            Dimension::Integer { low, high } => rng.random_range(low..=high) as f64,
            Dimension::Real { low, high } => rng.random_range(low..=high),
        }
    }

    /// Map a value onto `[0, 1]`.
    fn unit(&self, value: f64) -> f64 {
        let (low, high) = match *self {
            Dimension::Integer { low, high } => (low as f64, high as f64),
            Dimension::Real { low, high } => (low, high),
        };
        if high > low {
            (value - low) / (high - low)
        } else {
            0.0
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        match *self {
            Dimension::Integer { low, high } => {
                value.fract() == 0.0 && value >= low as f64 && value <= high as f64
            }
            Dimension::Real { low, high } => value >= low && value <= high,
        }
    }
}

/// Ask/tell optimizer state; fully serializable so a search can resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Optimizer {
    space: Vec<Dimension>,
    seed: u64,
    n_initial_points: usize,
    xs: Vec<Vec<f64>>,
    ys: Vec<f64>,
    pending: Vec<Vec<f64>>,
    /// Number of proposals made, used to derive the random stream
    asked: u64,
}

impl Optimizer {
    pub fn new(space: Vec<Dimension>, seed: u64, n_initial_points: usize) -> Self {
        Self {
            space,
            seed,
            n_initial_points,
            xs: Vec::new(),
            ys: Vec::new(),
            pending: Vec::new(),
            asked: 0,
        }
    }

    pub fn space(&self) -> &[Dimension] {
        &self.space
    }

    pub fn n_observations(&self) -> usize {
        self.ys.len()
    }

    pub fn n_pending(&self) -> usize {
        self.pending.len()
    }

    /// Forget points that were asked but never told.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Told points and their losses, in the order they were told.
    pub fn observations(&self) -> impl Iterator<Item = (&[f64], f64)> + '_ {
        self.xs.iter().map(Vec::as_slice).zip(self.ys.iter().copied())
    }

    /// Lowest observed loss and where it was found.
    pub fn best(&self) -> Option<(&[f64], f64)> {
        self.ys
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, &y)| (self.xs[i].as_slice(), y))
    }

    fn random_point(&self, rng: &mut ChaCha8Rng) -> Vec<f64> {
        self.space.iter().map(|d| d.sample(rng)).collect()
    }

    fn to_unit(&self, x: &[f64]) -> Vec<f64> {
        self.space.iter().zip(x).map(|(d, &v)| d.unit(v)).collect()
    }

    /// Propose the next point to evaluate.
    pub fn ask(&mut self) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(self.asked);
        self.asked += 1;

        let seen = self.ys.len() + self.pending.len();
        let point = if seen < self.n_initial_points || self.ys.is_empty() {
            self.random_point(&mut rng)
        } else {
            self.propose(&mut rng)
        };
        self.pending.push(point.clone());
        point
    }

    /// Best random candidate under the surrogate's lower confidence bound.
    fn propose(&self, rng: &mut ChaCha8Rng) -> Vec<f64> {
        let n = self.ys.len() as f64;
        let mean = self.ys.iter().sum::<f64>() / n;
        let spread = (self.ys.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n).sqrt();

        // Pending points are lies at the mean loss
        let known: Vec<(Vec<f64>, f64)> = self
            .xs
            .iter()
            .zip(&self.ys)
            .map(|(x, &y)| (self.to_unit(x), y))
            .chain(self.pending.iter().map(|x| (self.to_unit(x), mean)))
            .collect();

        let mut best: Option<(f64, Vec<f64>)> = None;
        for _ in 0..CANDIDATES {
            let candidate = self.random_point(rng);
            let score = self.score(&self.to_unit(&candidate), &known, spread);
            match &best {
                Some((s, _)) if score >= *s => {}
                _ => best = Some((score, candidate)),
            }
        }
        match best {
            Some((_, point)) => point,
            None => self.random_point(rng),
        }
    }

    fn score(&self, unit: &[f64], known: &[(Vec<f64>, f64)], spread: f64) -> f64 {
        let mut neighbours: Vec<(f64, f64)> = known
            .iter()
            .map(|(x, y)| {
                let d2: f64 = x.iter().zip(unit).map(|(a, b)| (a - b).powi(2)).sum();
                (d2.sqrt(), *y)
            })
            .collect();
        neighbours.sort_by(|a, b| a.0.total_cmp(&b.0));
        neighbours.truncate(NEIGHBOURS);

        let k = neighbours.len() as f64;
        let mu = neighbours.iter().map(|n| n.1).sum::<f64>() / k;
        let var = neighbours.iter().map(|n| (n.1 - mu).powi(2)).sum::<f64>() / k;
        let nearest = neighbours.first().map_or(1.0, |n| n.0);
        let dims = (self.space.len().max(1) as f64).sqrt();
        let sigma = (var + (spread * nearest / dims).powi(2)).sqrt();
        mu - KAPPA * sigma
    }

    /// Record the loss observed at `x`.
    ///
    /// Non-finite losses are ignored; the point stays unexplored.
    pub fn tell(&mut self, x: Vec<f64>, y: f64) {
        if let Some(i) = self.pending.iter().position(|p| *p == x) {
            self.pending.swap_remove(i);
        }
        if !y.is_finite() {
            log::warn!("ignoring non-finite loss at {x:?}");
            return;
        }
        self.xs.push(x);
        self.ys.push(y);
    }
}
