//! Isolation forest outlier scoring.
//!
//! The forest is fit on a batch of feature vectors and then scores vectors by
//! how quickly random axis-aligned splits isolate them. Scores are
//! batch-relative: `offset` is chosen so that roughly `contamination` of the
//! training data falls below zero.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ModelConfig;
use crate::detect::DetectError;
use crate::ingest::features::FEATURE_DIM;

/// Euler-Mascheroni constant, used in the harmonic number approximation.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

pub type Point = [f64; FEATURE_DIM];

/// Forest hyperparameters.
#[derive(Debug, Clone)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_samples: usize,
    pub contamination: f64,
    pub seed: u64,
}

impl From<&ModelConfig> for ForestParams {
    fn from(cfg: &ModelConfig) -> Self {
        Self {
            n_estimators: cfg.n_estimators,
            max_samples: cfg.max_samples,
            contamination: cfg.contamination,
            seed: cfg.seed,
        }
    }
}

/// Outlier verdict for one vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub anomaly_flag: bool,
    /// Lower is more anomalous; negative means below the contamination cut.
    pub anomaly_score: f64,
}

#[derive(Debug)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

#[derive(Debug)]
pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
    offset: f64,
}

impl IsolationForest {
    /// Grow the forest on `data` and calibrate the decision offset against it.
    pub fn fit(data: &[Point], params: &ForestParams) -> Result<Self, DetectError> {
        if data.is_empty() {
            return Err(DetectError::InsufficientBatch { needed: 1, have: 0 });
        }
        if let Some(index) = data.iter().position(|p| p.iter().any(|v| !v.is_finite())) {
            return Err(DetectError::NonFiniteFeature { index });
        }

        let n = data.len();
        let sample_size = params.max_samples.clamp(1, n);
        let height_limit = (sample_size.max(2) as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(params.seed);

        let trees = (0..params.n_estimators.max(1))
            .map(|_| {
                let sample = rand::seq::index::sample(&mut rng, n, sample_size).into_vec();
                grow(data, sample, 0, height_limit, &mut rng)
            })
            .collect();

        let mut forest = Self {
            trees,
            sample_size,
            offset: 0.0,
        };
        let train_scores: Vec<f64> = data.iter().map(|p| forest.score_sample(p)).collect();
        forest.offset = percentile(&train_scores, params.contamination * 100.0);
        Ok(forest)
    }

    /// Raw isolation score in `[-1, 0)`; closer to -1 is more anomalous.
    pub fn score_sample(&self, point: &Point) -> f64 {
        let total: f64 = self
            .trees
            .iter()
            .map(|tree| path_length(tree, point, 0))
            .sum();
        let mean_depth = total / self.trees.len() as f64;
        let normaliser = average_path_length(self.sample_size);
        let ratio = if normaliser > 0.0 {
            mean_depth / normaliser
        } else {
            1.0
        };
        -(2f64.powf(-ratio))
    }

    /// Score shifted by the calibrated offset.
    pub fn decision(&self, point: &Point) -> f64 {
        self.score_sample(point) - self.offset
    }

    pub fn verdict(&self, point: &Point) -> Verdict {
        let anomaly_score = self.decision(point);
        Verdict {
            anomaly_flag: anomaly_score < 0.0,
            anomaly_score,
        }
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }
}

/// Fit a fresh forest on `training` and score every vector of `batch`.
/// The output has the same length and order as `batch`.
pub fn score_batch(
    training: &[Point],
    batch: &[Point],
    params: &ForestParams,
) -> Result<Vec<Verdict>, DetectError> {
    if let Some(index) = batch.iter().position(|p| p.iter().any(|v| !v.is_finite())) {
        return Err(DetectError::NonFiniteFeature { index });
    }
    let forest = IsolationForest::fit(training, params)?;
    Ok(batch.iter().map(|p| forest.verdict(p)).collect())
}

fn grow(data: &[Point], sample: Vec<usize>, depth: usize, limit: usize, rng: &mut StdRng) -> Node {
    if depth >= limit || sample.len() <= 1 {
        return Node::Leaf { size: sample.len() };
    }

    // Only features that still vary inside this node can split it.
    let candidates: Vec<(usize, f64, f64)> = (0..FEATURE_DIM)
        .filter_map(|feature| {
            let (min, max) = sample.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                let v = data[i][feature];
                (lo.min(v), hi.max(v))
            });
            (max > min).then_some((feature, min, max))
        })
        .collect();

    if candidates.is_empty() {
        return Node::Leaf { size: sample.len() };
    }

    let (feature, min, max) = candidates[rng.gen_range(0..candidates.len())];
    let threshold = rng.gen_range(min..max);
    let (left, right): (Vec<usize>, Vec<usize>) = sample
        .into_iter()
        .partition(|&i| data[i][feature] <= threshold);

    Node::Split {
        feature,
        threshold,
        left: Box::new(grow(data, left, depth + 1, limit, rng)),
        right: Box::new(grow(data, right, depth + 1, limit, rng)),
    }
}

fn path_length(node: &Node, point: &Point, depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split {
            feature,
            threshold,
            left,
            right,
        } => {
            if point[*feature] <= *threshold {
                path_length(left, point, depth + 1)
            } else {
                path_length(right, point, depth + 1)
            }
        }
    }
}

/// Expected path length of an unsuccessful BST search over `n` items.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Percentile with linear interpolation between closest ranks.
fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ForestParams {
        ForestParams {
            n_estimators: 120,
            max_samples: 256,
            contamination: 0.03,
            seed: 42,
        }
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        // c(256) is roughly 10.24
        let c = average_path_length(256);
        assert!((c - 10.24).abs() < 0.01, "c(256) = {}", c);
    }

    #[test]
    fn test_percentile_interpolates() {
        let v = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(percentile(&v, 0.0), 1.0);
        assert_eq!(percentile(&v, 100.0), 4.0);
        assert!((percentile(&v, 50.0) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_isolates_obvious_outliers() {
        let mut data: Vec<Point> = (0..98)
            .map(|i| [0.01 + (i % 5) as f64 * 0.001, 50.0 + (i % 7) as f64])
            .collect();
        data.push([5.0, 52.0]);
        data.push([0.012, 500_000.0]);

        let verdicts = score_batch(&data, &data, &params()).unwrap();
        assert_eq!(verdicts.len(), data.len());
        assert!(verdicts[98].anomaly_flag);
        assert!(verdicts[99].anomaly_flag);

        let normal_min = verdicts[..98]
            .iter()
            .map(|v| v.anomaly_score)
            .fold(f64::INFINITY, f64::min);
        assert!(verdicts[98].anomaly_score < normal_min);
        assert!(verdicts[99].anomaly_score < normal_min);
    }

    #[test]
    fn test_fit_is_deterministic_for_a_seed() {
        let data: Vec<Point> = (0..40).map(|i| [i as f64 * 0.1, (i * i) as f64]).collect();
        let a = score_batch(&data, &data, &params()).unwrap();
        let b = score_batch(&data, &data, &params()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_uniform_batch_has_no_outliers() {
        let data: Vec<Point> = vec![[0.5, 100.0]; 30];
        let verdicts = score_batch(&data, &data, &params()).unwrap();
        assert!(verdicts.iter().all(|v| !v.anomaly_flag));
        assert!(verdicts.iter().all(|v| v.anomaly_score == 0.0));
    }

    #[test]
    fn test_single_record_batch_scores() {
        let data: Vec<Point> = vec![[1.0, 10.0]];
        let verdicts = score_batch(&data, &data, &params()).unwrap();
        assert_eq!(verdicts.len(), 1);
        assert!(!verdicts[0].anomaly_flag);
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let err = IsolationForest::fit(&[], &params()).unwrap_err();
        assert!(matches!(err, DetectError::InsufficientBatch { have: 0, .. }));
    }

    #[test]
    fn test_non_finite_is_rejected() {
        let data: Vec<Point> = vec![[1.0, 2.0], [f64::NAN, 3.0]];
        let err = IsolationForest::fit(&data, &params()).unwrap_err();
        assert!(matches!(err, DetectError::NonFiniteFeature { index: 1 }));
    }

    #[test]
    fn test_raw_scores_are_bounded() {
        let data: Vec<Point> = (0..64).map(|i| [i as f64, (64 - i) as f64]).collect();
        let forest = IsolationForest::fit(&data, &params()).unwrap();
        for p in &data {
            let s = forest.score_sample(p);
            assert!((-1.0..0.0).contains(&s), "score {} out of range", s);
        }
    }
}
