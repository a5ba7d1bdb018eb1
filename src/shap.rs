//! Exact Tree SHAP attributions for a fitted forest.
//!
//! Follows the polynomial-time path algorithm of Lundberg et al. (2018): one
//! recursive pass per tree that tracks, along the decision path, what share of
//! feature subsets would reach each leaf. The forest attribution is the mean of
//! the per-tree attributions, so for every row
//! `base_value + sum(values[row]) == prediction` up to rounding.
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

use crate::forest::{RandomForestRegressor, RegressionTree};

/// Additive attribution of each prediction to each feature.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribution {
    /// Expected model output over the training data.
    pub base_value: f64,
    /// One row per explained instance, one column per feature.
    pub values: Array2<f64>,
    pub feature_names: Vec<String>,
}

impl Attribution {
    /// Mean absolute attribution per feature, the usual global summary.
    pub fn mean_abs(&self) -> Array1<f64> {
        self.values
            .mapv(f64::abs)
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(self.values.ncols()))
    }
}

#[derive(Debug, Clone, Copy)]
struct PathElement {
    feature: Option<usize>,
    zero_fraction: f64,
    one_fraction: f64,
    weight: f64,
}

fn extend_path(path: &mut Vec<PathElement>, zero_fraction: f64, one_fraction: f64, feature: Option<usize>) {
    let depth = path.len();
    path.push(PathElement {
        feature,
        zero_fraction,
        one_fraction,
        weight: if depth == 0 { 1.0 } else { 0.0 },
    });
    let denom = (depth + 1) as f64;
    for i in (0..depth).rev() {
        path[i + 1].weight += one_fraction * path[i].weight * (i + 1) as f64 / denom;
        path[i].weight = zero_fraction * path[i].weight * (depth - i) as f64 / denom;
    }
}

fn unwind_path(path: &mut Vec<PathElement>, index: usize) {
    let depth = path.len() - 1;
    let one_fraction = path[index].one_fraction;
    let zero_fraction = path[index].zero_fraction;
    let denom = (depth + 1) as f64;
    let mut next_one_portion = path[depth].weight;

    for i in (0..depth).rev() {
        if one_fraction != 0.0 {
            let tmp = path[i].weight;
            path[i].weight = next_one_portion * denom / ((i + 1) as f64 * one_fraction);
            next_one_portion = tmp - path[i].weight * zero_fraction * (depth - i) as f64 / denom;
        } else {
            path[i].weight = path[i].weight * denom / (zero_fraction * (depth - i) as f64);
        }
    }
    for i in index..depth {
        path[i].feature = path[i + 1].feature;
        path[i].zero_fraction = path[i + 1].zero_fraction;
        path[i].one_fraction = path[i + 1].one_fraction;
    }
    path.pop();
}

// Total permutation weight if the element at `index` were unwound.
fn unwound_path_sum(path: &[PathElement], index: usize) -> f64 {
    let depth = path.len() - 1;
    let one_fraction = path[index].one_fraction;
    let zero_fraction = path[index].zero_fraction;
    let mut next_one_portion = path[depth].weight;
    let mut total = 0.0;

    if one_fraction != 0.0 {
        for i in (0..depth).rev() {
            let tmp = next_one_portion / ((i + 1) as f64 * one_fraction);
            total += tmp;
            next_one_portion = path[i].weight - tmp * zero_fraction * (depth - i) as f64;
        }
    } else {
        for i in (0..depth).rev() {
            total += path[i].weight / (zero_fraction * (depth - i) as f64);
        }
    }
    total * (depth + 1) as f64
}

struct TreeExplainer<'a> {
    tree: &'a RegressionTree,
    x: ArrayView1<'a, f64>,
}

impl TreeExplainer<'_> {
    fn recurse(
        &self,
        node_idx: usize,
        phi: &mut [f64],
        mut path: Vec<PathElement>,
        zero_fraction: f64,
        one_fraction: f64,
        feature: Option<usize>,
    ) {
        extend_path(&mut path, zero_fraction, one_fraction, feature);
        let nodes = self.tree.nodes();
        let node = &nodes[node_idx];

        let Some(split) = node.split else {
            for i in 1..path.len() {
                let w = unwound_path_sum(&path, i);
                let el = path[i];
                if let Some(f) = el.feature {
                    phi[f] += w * (el.one_fraction - el.zero_fraction) * node.value;
                }
            }
            return;
        };

        let (hot, cold) = if self.x[split.feature] <= split.threshold {
            (split.left, split.right)
        } else {
            (split.right, split.left)
        };
        let hot_zero = nodes[hot].n_samples / node.n_samples;
        let cold_zero = nodes[cold].n_samples / node.n_samples;

        // a feature already on the path is undone so this split can redo it
        let mut incoming_zero = 1.0;
        let mut incoming_one = 1.0;
        if let Some(k) = path.iter().position(|e| e.feature == Some(split.feature)) {
            incoming_zero = path[k].zero_fraction;
            incoming_one = path[k].one_fraction;
            unwind_path(&mut path, k);
        }

        self.recurse(
            hot,
            phi,
            path.clone(),
            hot_zero * incoming_zero,
            incoming_one,
            Some(split.feature),
        );
        self.recurse(
            cold,
            phi,
            path,
            cold_zero * incoming_zero,
            0.0,
            Some(split.feature),
        );
    }
}

/// Exact attributions of one tree's prediction for one row.
pub fn tree_shap<'a>(tree: &'a RegressionTree, x: ArrayView1<'a, f64>, n_features: usize) -> Vec<f64> {
    let mut phi = vec![0.0; n_features];
    let explainer = TreeExplainer { tree, x };
    explainer.recurse(0, &mut phi, Vec::new(), 1.0, 1.0, None);
    phi
}

/// Attributions of the forest's predictions for every row of `x`.
pub fn forest_shap(
    forest: &RandomForestRegressor,
    x: ArrayView2<'_, f64>,
    feature_names: &[String],
) -> Attribution {
    let trees = forest.trees();
    let p = forest.n_features();
    let scale = 1.0 / trees.len() as f64;

    let rows: Vec<Vec<f64>> = (0..x.nrows())
        .into_par_iter()
        .map(|r| {
            let row = x.row(r);
            let mut phi = vec![0.0; p];
            for tree in trees {
                for (acc, v) in phi.iter_mut().zip(tree_shap(tree, row, p)) {
                    *acc += v * scale;
                }
            }
            phi
        })
        .collect();

    let mut values = Array2::<f64>::zeros((x.nrows(), p));
    for (mut out, phi) in values.rows_mut().into_iter().zip(rows) {
        out.assign(&Array1::from(phi));
    }
    let base_value = trees.iter().map(|t| t.nodes()[0].value).sum::<f64>() * scale;

    Attribution {
        base_value,
        values,
        feature_names: feature_names.to_vec(),
    }
}
