//! Random forest regression: bagged CART trees with a squared-error criterion,
//! out-of-bag scoring and impurity-based feature importance.
//!
//! Trees are grown in parallel with rayon. Every tree draws from its own RNG,
//! seeded from the forest seed, so results do not depend on thread scheduling.
use std::fmt;

use linfa::prelude::SingleTargetRegression;
use linfa::traits::{Fit, PredictInplace};
use linfa::DatasetBase;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::{Result, ShotError};

// Feature values closer than this are treated as equal when placing a split.
const FEATURE_THRESHOLD: f64 = 1e-7;
const IMPURITY_EPSILON: f64 = f64::EPSILON;

/// How many features each split may look at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaxFeatures {
    /// `max(1, floor(sqrt(p)))`
    Sqrt,
    /// `max(1, floor(f * p))` for `f` in `(0, 1]`
    Fraction(f64),
}

impl MaxFeatures {
    pub fn resolve(&self, n_features: usize) -> usize {
        let k = match self {
            MaxFeatures::Sqrt => (n_features as f64).sqrt().floor() as usize,
            MaxFeatures::Fraction(f) => (f * n_features as f64).floor() as usize,
        };
        k.clamp(1, n_features.max(1))
    }
}

impl fmt::Display for MaxFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxFeatures::Sqrt => write!(f, "sqrt"),
            MaxFeatures::Fraction(x) => write!(f, "{x}"),
        }
    }
}

/// Hyperparameters of a forest. Implements [`Fit`] over a linfa dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct ForestParams {
    pub n_trees: usize,
    /// `None` grows trees until leaves are pure or too small to split.
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub max_features: MaxFeatures,
    pub bootstrap: bool,
    pub oob_score: bool,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: MaxFeatures::Fraction(1.0),
            bootstrap: true,
            oob_score: false,
            seed: 42,
        }
    }
}

impl fmt::Display for ForestParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let depth = self
            .max_depth
            .map_or_else(|| "None".to_string(), |d| d.to_string());
        write!(
            f,
            "n_trees={} max_depth={} min_samples_split={} min_samples_leaf={} max_features={} bootstrap={}",
            self.n_trees,
            depth,
            self.min_samples_split,
            self.min_samples_leaf,
            self.max_features,
            self.bootstrap
        )
    }
}

impl ForestParams {
    pub fn with_oob_score(mut self, oob_score: bool) -> Self {
        self.oob_score = oob_score;
        self
    }

    fn check(&self) -> Result<()> {
        if self.n_trees == 0 {
            return Err(ShotError::InvalidArgument("n_trees must be at least 1".into()));
        }
        if self.min_samples_split < 2 {
            return Err(ShotError::InvalidArgument("min_samples_split must be at least 2".into()));
        }
        if self.min_samples_leaf < 1 {
            return Err(ShotError::InvalidArgument("min_samples_leaf must be at least 1".into()));
        }
        if let MaxFeatures::Fraction(f) = self.max_features {
            if !(f > 0.0 && f <= 1.0) {
                return Err(ShotError::InvalidArgument(format!(
                    "max_features fraction {f} is outside (0, 1]"
                )));
            }
        }
        if self.oob_score && !self.bootstrap {
            return Err(ShotError::InvalidArgument(
                "out-of-bag scoring needs bootstrap sampling".into(),
            ));
        }
        Ok(())
    }
}

/// A binary split: rows with `x[feature] <= threshold` go left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Split {
    pub feature: usize,
    pub threshold: f64,
    pub left: usize,
    pub right: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Mean target over the training rows reaching this node.
    pub value: f64,
    /// Training rows reaching this node, counting bootstrap repeats.
    pub n_samples: f64,
    /// Mean squared deviation from `value`.
    pub impurity: f64,
    pub split: Option<Split>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegressionTree {
    nodes: Vec<Node>,
    n_features: usize,
}

impl RegressionTree {
    /// Nodes in build order; index 0 is the root.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn predict_row(&self, x: ArrayView1<'_, f64>) -> f64 {
        let mut idx = 0;
        while let Some(split) = self.nodes[idx].split {
            idx = if x[split.feature] <= split.threshold {
                split.left
            } else {
                split.right
            };
        }
        self.nodes[idx].value
    }

    /// Impurity decrease per feature, normalized to sum to one (all zeros
    /// for a tree that never split).
    pub fn feature_importances(&self) -> Array1<f64> {
        let mut imp = Array1::<f64>::zeros(self.n_features);
        for node in &self.nodes {
            if let Some(split) = node.split {
                let left = &self.nodes[split.left];
                let right = &self.nodes[split.right];
                imp[split.feature] += node.n_samples * node.impurity
                    - left.n_samples * left.impurity
                    - right.n_samples * right.impurity;
            }
        }
        normalize(&mut imp);
        imp
    }
}

fn normalize(values: &mut Array1<f64>) {
    let total = values.sum();
    if total > 0.0 {
        values.mapv_inplace(|v| v / total);
    }
}

struct TreeBuilder<'a> {
    x: ArrayView2<'a, f64>,
    y: ArrayView1<'a, f64>,
    params: &'a ForestParams,
    max_features: usize,
    rng: StdRng,
    nodes: Vec<Node>,
}

impl TreeBuilder<'_> {
    fn node_stats(&self, samples: &[usize]) -> (f64, f64, f64) {
        let n = samples.len() as f64;
        let mean = samples.iter().map(|&s| self.y[s]).sum::<f64>() / n;
        let impurity = samples
            .iter()
            .map(|&s| (self.y[s] - mean).powi(2))
            .sum::<f64>()
            / n;
        (n, mean, impurity)
    }

    fn build(&mut self, samples: &mut [usize], depth: usize) -> usize {
        let (n, value, impurity) = self.node_stats(samples);
        let idx = self.nodes.len();
        self.nodes.push(Node {
            value,
            n_samples: n,
            impurity,
            split: None,
        });

        let len = samples.len();
        let is_leaf = self.params.max_depth.is_some_and(|d| depth >= d)
            || len < self.params.min_samples_split
            || len < 2 * self.params.min_samples_leaf
            || impurity <= IMPURITY_EPSILON;
        if is_leaf {
            return idx;
        }

        let Some((feature, threshold)) = self.best_split(samples) else {
            return idx;
        };
        let x = self.x;
        samples.sort_by(|&a, &b| {
            let goes_right = |s: usize| x[[s, feature]] > threshold;
            goes_right(a).cmp(&goes_right(b))
        });
        let cut = samples.partition_point(|&s| x[[s, feature]] <= threshold);
        let (left_samples, right_samples) = samples.split_at_mut(cut);

        let left = self.build(left_samples, depth + 1);
        let right = self.build(right_samples, depth + 1);
        self.nodes[idx].split = Some(Split {
            feature,
            threshold,
            left,
            right,
        });
        idx
    }

    // Visits features in random order until `max_features` non-constant ones
    // have been evaluated.
    fn best_split(&mut self, samples: &[usize]) -> Option<(usize, f64)> {
        let mut order: Vec<usize> = (0..self.x.ncols()).collect();
        order.shuffle(&mut self.rng);

        let min_leaf = self.params.min_samples_leaf;
        let n = samples.len();
        let total: f64 = samples.iter().map(|&s| self.y[s]).sum();

        let mut best: Option<(f64, usize, f64)> = None;
        let mut visited = 0;
        let mut pairs: Vec<(f64, f64)> = Vec::with_capacity(n);
        for feature in order {
            if visited >= self.max_features {
                break;
            }
            pairs.clear();
            pairs.extend(samples.iter().map(|&s| (self.x[[s, feature]], self.y[s])));
            pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
            if pairs[n - 1].0 <= pairs[0].0 + FEATURE_THRESHOLD {
                continue;
            }
            visited += 1;

            let mut left_sum = 0.0;
            for i in 0..n - 1 {
                left_sum += pairs[i].1;
                let n_left = i + 1;
                let n_right = n - n_left;
                if n_left < min_leaf || n_right < min_leaf {
                    continue;
                }
                if pairs[i + 1].0 <= pairs[i].0 + FEATURE_THRESHOLD {
                    continue;
                }
                let right_sum = total - left_sum;
                // maximizing this is equivalent to minimizing child SSE
                let proxy = left_sum * left_sum / n_left as f64 + right_sum * right_sum / n_right as f64;
                if best.map_or(true, |(b, _, _)| proxy > b) {
                    let mut threshold = (pairs[i].0 + pairs[i + 1].0) / 2.0;
                    if threshold >= pairs[i + 1].0 {
                        threshold = pairs[i].0;
                    }
                    best = Some((proxy, feature, threshold));
                }
            }
        }
        best.map(|(_, feature, threshold)| (feature, threshold))
    }
}

fn grow_tree<'a>(
    x: ArrayView2<'a, f64>,
    y: ArrayView1<'a, f64>,
    params: &'a ForestParams,
    max_features: usize,
    seed: u64,
) -> (RegressionTree, Vec<bool>) {
    let n = x.nrows();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut in_bag = vec![!params.bootstrap; n];
    let mut samples: Vec<usize> = if params.bootstrap {
        (0..n)
            .map(|_| {
                let s = rng.random_range(0..n);
                in_bag[s] = true;
                s
            })
            .collect()
    } else {
        (0..n).collect()
    };

    let mut builder = TreeBuilder {
        x,
        y,
        params,
        max_features,
        rng,
        nodes: Vec::new(),
    };
    builder.build(&mut samples, 0);
    let tree = RegressionTree {
        nodes: builder.nodes,
        n_features: x.ncols(),
    };
    (tree, in_bag)
}

/// A fitted forest. Predictions average the trees.
#[derive(Debug, Clone)]
pub struct RandomForestRegressor {
    params: ForestParams,
    trees: Vec<RegressionTree>,
    n_features: usize,
    importances: Array1<f64>,
    oob_score: Option<f64>,
}

impl RandomForestRegressor {
    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Mean of the per-tree importances, renormalized to sum to one.
    pub fn feature_importances(&self) -> &Array1<f64> {
        &self.importances
    }

    /// R² of out-of-bag predictions; `None` unless fitted with `oob_score`.
    pub fn oob_score(&self) -> Option<f64> {
        self.oob_score
    }

    pub fn predict_row(&self, x: ArrayView1<'_, f64>) -> f64 {
        self.trees.iter().map(|t| t.predict_row(x)).sum::<f64>() / self.trees.len() as f64
    }
}

impl Fit<Array2<f64>, Array1<f64>, ShotError> for ForestParams {
    type Object = RandomForestRegressor;

    fn fit(&self, dataset: &DatasetBase<Array2<f64>, Array1<f64>>) -> Result<Self::Object> {
        self.check()?;
        let x = dataset.records().view();
        let y = dataset.targets().view();
        let (n, p) = x.dim();
        if n == 0 || p == 0 {
            return Err(ShotError::Fit(format!(
                "training data has {n} rows and {p} features"
            )));
        }
        if y.len() != n {
            return Err(ShotError::Fit(format!("{} targets for {n} rows", y.len())));
        }
        if !x.iter().chain(y.iter()).all(|v| v.is_finite()) {
            return Err(ShotError::Fit("training data contains non-finite values".into()));
        }

        let max_features = self.max_features.resolve(p);
        let mut rng = StdRng::seed_from_u64(self.seed);
        let seeds: Vec<u64> = (0..self.n_trees).map(|_| rng.random()).collect();
        let grown: Vec<(RegressionTree, Vec<bool>)> = seeds
            .into_par_iter()
            .map(|seed| grow_tree(x, y, self, max_features, seed))
            .collect();

        let mut importances = Array1::<f64>::zeros(p);
        for (tree, _) in &grown {
            importances += &tree.feature_importances();
        }
        importances /= grown.len() as f64;
        normalize(&mut importances);

        let oob_score = if self.oob_score {
            Some(oob_r2(&grown, x, y)?)
        } else {
            None
        };

        Ok(RandomForestRegressor {
            params: self.clone(),
            trees: grown.into_iter().map(|(t, _)| t).collect(),
            n_features: p,
            importances,
            oob_score,
        })
    }
}

fn oob_r2(grown: &[(RegressionTree, Vec<bool>)], x: ArrayView2<'_, f64>, y: ArrayView1<'_, f64>) -> Result<f64> {
    let n = x.nrows();
    let mut sums = vec![0.0; n];
    let mut counts = vec![0usize; n];
    for (tree, in_bag) in grown {
        for i in (0..n).filter(|&i| !in_bag[i]) {
            sums[i] += tree.predict_row(x.row(i));
            counts[i] += 1;
        }
    }
    let scored: Vec<usize> = (0..n).filter(|&i| counts[i] > 0).collect();
    if scored.is_empty() {
        return Err(ShotError::Fit(
            "no sample was left out of every bootstrap draw; out-of-bag score is undefined".into(),
        ));
    }
    let pred: Array1<f64> = scored.iter().map(|&i| sums[i] / counts[i] as f64).collect();
    let truth: Array1<f64> = scored.iter().map(|&i| y[i]).collect();
    Ok(pred.r2(&truth)?)
}

impl PredictInplace<Array2<f64>, Array1<f64>> for RandomForestRegressor {
    fn predict_inplace(&self, x: &Array2<f64>, y: &mut Array1<f64>) {
        assert_eq!(
            x.nrows(),
            y.len(),
            "The number of data points must match the number of output targets."
        );
        for (row, out) in x.rows().into_iter().zip(y.iter_mut()) {
            *out = self.predict_row(row);
        }
    }

    fn default_target(&self, x: &Array2<f64>) -> Array1<f64> {
        Array1::zeros(x.nrows())
    }
}
