/// Train, tune, evaluate and explain a random-forest regressor on shot data.
use linfa::prelude::SingleTargetRegression;
use linfa::traits::{Fit, Predict};
use linfa::Dataset;
use ndarray::{Array1, Array2, Axis};
use polars::prelude::{BooleanChunked, DataFrame, DataType, ToDummies};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::clean::DATE;
use crate::error::{Result, ShotError};
use crate::forest::{ForestParams, MaxFeatures, RandomForestRegressor};
use crate::shap::{forest_shap, Attribution};

/// Seed for the train/test split and every forest.
pub const SEED: u64 = 42;

/// Distance metrics that are near-linear functions of one another. Predicting
/// one of them with another in the features would leak the target.
pub const DISTANCE_GROUP: [&str; 3] = ["Carry", "TotalDistance", "rawCarryGame"];

/// Columns always kept out of the features when predicting `target`.
pub fn default_exclusions(target: &str) -> Vec<String> {
    let mut cols = vec![DATE.to_string(), target.to_string()];
    if DISTANCE_GROUP.contains(&target) {
        cols.extend(
            DISTANCE_GROUP
                .iter()
                .filter(|c| **c != target)
                .map(|c| c.to_string()),
        );
    }
    cols
}

/// Hyperparameter space searched by [`ShotRegressionModel::fit`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGrid {
    pub n_trees: Vec<usize>,
    pub max_depth: Vec<Option<usize>>,
    pub min_samples_split: Vec<usize>,
    pub min_samples_leaf: Vec<usize>,
    pub max_features: Vec<MaxFeatures>,
    pub bootstrap: Vec<bool>,
}

impl Default for ParamGrid {
    fn default() -> Self {
        Self {
            n_trees: vec![50, 100],
            max_depth: vec![None, Some(5), Some(10)],
            min_samples_split: vec![2, 5],
            min_samples_leaf: vec![1, 2],
            max_features: vec![MaxFeatures::Sqrt, MaxFeatures::Fraction(0.5)],
            bootstrap: vec![true],
        }
    }
}

impl ParamGrid {
    /// Every combination, with the tree count varying fastest.
    pub fn candidates(&self, seed: u64) -> Vec<ForestParams> {
        let mut out = Vec::new();
        for &bootstrap in &self.bootstrap {
            for &max_depth in &self.max_depth {
                for &max_features in &self.max_features {
                    for &min_samples_leaf in &self.min_samples_leaf {
                        for &min_samples_split in &self.min_samples_split {
                            for &n_trees in &self.n_trees {
                                out.push(ForestParams {
                                    n_trees,
                                    max_depth,
                                    min_samples_split,
                                    min_samples_leaf,
                                    max_features,
                                    bootstrap,
                                    oob_score: false,
                                    seed,
                                });
                            }
                        }
                    }
                }
            }
        }
        out
    }
}

/// Cross-validation outcome of one grid candidate. Scores are negative MSE.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CvResult {
    pub rank: usize,
    pub mean_test_score: f64,
    pub std_test_score: f64,
    pub n_trees: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub max_features: String,
    pub bootstrap: bool,
    #[serde(skip)]
    pub params: ForestParams,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub oob_score: f64,
    pub mse: f64,
    pub r2: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

/// Everything the presentation layer needs from one run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub evaluation: Evaluation,
    pub importances: Vec<FeatureImportance>,
    pub attribution: Attribution,
}

/// Lifecycle of a [`ShotRegressionModel`]; each stage needs all earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Constructed,
    Encoded,
    Split,
    Fitted,
}

/// Held-out partition of the encoded features.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitData {
    pub x_train: Array2<f64>,
    pub x_test: Array2<f64>,
    pub y_train: Array1<f64>,
    pub y_test: Array1<f64>,
}

#[derive(Debug, Clone)]
struct Encoded {
    names: Vec<String>,
    x: Array2<f64>,
}

#[derive(Debug, Clone)]
struct Fitted {
    forest: RandomForestRegressor,
    cv_results: Vec<CvResult>,
    y_pred: Array1<f64>,
}

/// End-to-end regression pipeline for one target over one cleaned dataset.
#[derive(Debug, Clone)]
pub struct ShotRegressionModel {
    target: String,
    excluded: Vec<String>,
    features: DataFrame,
    y: Array1<f64>,
    grid: ParamGrid,
    encoded: Option<Encoded>,
    split: Option<SplitData>,
    fitted: Option<Fitted>,
}

impl ShotRegressionModel {
    /// Selects features and rows. `exclude` is added to the default
    /// exclusions for `target`; rows missing the target or any feature are
    /// dropped.
    pub fn new(data: &DataFrame, target: &str, exclude: &[String]) -> Result<Self> {
        let target_values = data
            .column(target)
            .map_err(|_| ShotError::schema(target, "is missing from the dataset"))?
            .f64()
            .map_err(|_| ShotError::schema(target, "is not numeric and cannot be a target"))?;
        if target_values.null_count() == target_values.len() {
            return Err(ShotError::empty(format!("no rows have a value for target `{target}`")));
        }

        let mut excluded = default_exclusions(target);
        for col in exclude {
            if !excluded.contains(col) {
                excluded.push(col.clone());
            }
        }

        // numbers and text only; timestamps never become features
        let candidates: Vec<&str> = data
            .get_columns()
            .iter()
            .filter(|c| matches!(c.dtype(), DataType::Float64 | DataType::String))
            .map(|c| c.name().as_str())
            .filter(|name| !excluded.iter().any(|e| e == name))
            .collect();
        if candidates.is_empty() {
            return Err(ShotError::empty(format!(
                "no feature columns remain for target `{target}` after exclusions"
            )));
        }

        let mut keep: Vec<bool> = target_values.into_iter().map(|v| v.is_some()).collect();
        for name in &candidates {
            let nulls = data.column(name)?.is_null();
            for (slot, missing) in keep.iter_mut().zip(&nulls) {
                *slot &= missing == Some(false);
            }
        }
        let rows = keep.iter().filter(|k| **k).count();
        if rows == 0 {
            return Err(ShotError::empty(format!(
                "no row has both `{target}` and every feature present"
            )));
        }

        let y: Array1<f64> = target_values
            .into_iter()
            .zip(&keep)
            .filter_map(|(v, &k)| if k { v } else { None })
            .collect();
        let mask: BooleanChunked = keep.into_iter().collect();
        let features = data.select(candidates.iter().copied())?.filter(&mask)?;

        info!(
            column = target,
            rows,
            dropped = data.height() - rows,
            features = features.width(),
            "built feature matrix"
        );
        Ok(Self {
            target: target.to_string(),
            excluded,
            features,
            y,
            grid: ParamGrid::default(),
            encoded: None,
            split: None,
            fitted: None,
        })
    }

    /// Replaces the hyperparameter space searched by [`Self::fit`].
    pub fn with_grid(mut self, grid: ParamGrid) -> Self {
        self.grid = grid;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    pub fn n_rows(&self) -> usize {
        self.y.len()
    }

    pub fn stage(&self) -> Stage {
        if self.fitted.is_some() {
            Stage::Fitted
        } else if self.split.is_some() {
            Stage::Split
        } else if self.encoded.is_some() {
            Stage::Encoded
        } else {
            Stage::Constructed
        }
    }

    /// Feature names: encoded columns once encoded, source columns before.
    pub fn feature_names(&self) -> Vec<String> {
        match &self.encoded {
            Some(enc) => enc.names.clone(),
            None => self
                .features
                .get_column_names_str()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn split_data(&self) -> Result<&SplitData> {
        self.split.as_ref().ok_or(ShotError::NotSplit)
    }

    /// One-hot expands text features into `<column>_<category>` indicators
    /// placed after the numeric features. Repeated calls do nothing.
    pub fn encode_categoricals(&mut self) -> Result<()> {
        if self.encoded.is_some() {
            return Ok(());
        }
        let n = self.y.len();
        let mut names = Vec::new();
        let mut columns: Vec<Vec<f64>> = Vec::new();

        let source = self.features.get_columns();
        for column in source.iter().filter(|c| c.dtype() == &DataType::Float64) {
            names.push(column.name().to_string());
            columns.push(column.f64()?.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect());
        }
        let mut categorical = 0;
        for column in source.iter().filter(|c| c.dtype() == &DataType::String) {
            categorical += 1;
            let dummies = column.as_materialized_series().to_dummies(None, false)?;
            for indicator in dummies.get_columns() {
                names.push(indicator.name().to_string());
                let indicator = indicator.cast(&DataType::Float64)?;
                columns.push(indicator.f64()?.into_iter().map(|v| v.unwrap_or(0.0)).collect());
            }
        }

        let x = Array2::from_shape_fn((n, columns.len()), |(r, c)| columns[c][r]);
        debug!(categorical, encoded = names.len(), "encoded features");
        self.encoded = Some(Encoded { names, x });
        Ok(())
    }

    /// Shuffled train/test partition with a fixed seed. `test_fraction` must
    /// lie in `(0, 1)`; the test part gets `ceil(test_fraction * n)` rows.
    pub fn split(&mut self, test_fraction: f64) -> Result<&SplitData> {
        let enc = self.encoded.as_ref().ok_or(ShotError::NotEncoded)?;
        if !(test_fraction > 0.0 && test_fraction < 1.0) {
            return Err(ShotError::InvalidArgument(format!(
                "test fraction {test_fraction} is outside (0, 1)"
            )));
        }
        let n = self.y.len();
        let n_test = (test_fraction * n as f64).ceil() as usize;
        if n_test == 0 || n_test >= n {
            return Err(ShotError::empty(format!(
                "{n} rows cannot be split with test fraction {test_fraction}"
            )));
        }

        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut StdRng::seed_from_u64(SEED));
        let (test_idx, train_idx) = order.split_at(n_test);

        self.fitted = None;
        let split = self.split.insert(SplitData {
            x_train: enc.x.select(Axis(0), train_idx),
            x_test: enc.x.select(Axis(0), test_idx),
            y_train: self.y.select(Axis(0), train_idx),
            y_test: self.y.select(Axis(0), test_idx),
        });
        info!(train = split.y_train.len(), test = split.y_test.len(), "split data");
        Ok(&*split)
    }

    /// Grid search with k-fold cross-validation on the training split, scored
    /// by negative mean squared error, then a refit of the best candidate on
    /// the whole training split with out-of-bag scoring.
    pub fn fit(&mut self, cv_folds: usize) -> Result<&RandomForestRegressor> {
        if self.encoded.is_none() {
            return Err(ShotError::NotEncoded);
        }
        let split = self.split.as_ref().ok_or(ShotError::NotSplit)?;
        let n_train = split.y_train.len();
        if cv_folds < 2 || cv_folds > n_train {
            return Err(ShotError::Fit(format!(
                "{cv_folds}-fold cross-validation needs between 2 and {n_train} folds"
            )));
        }

        let folds = kfold_indices(n_train, cv_folds);
        let candidates = self.grid.candidates(SEED);
        if candidates.is_empty() {
            return Err(ShotError::Fit("hyperparameter grid is empty".into()));
        }
        info!(
            candidates = candidates.len(),
            folds = cv_folds,
            fits = candidates.len() * cv_folds,
            "starting grid search"
        );

        let jobs: Vec<(usize, usize)> = (0..candidates.len())
            .flat_map(|c| (0..folds.len()).map(move |f| (c, f)))
            .collect();
        let scores: Vec<f64> = jobs
            .par_iter()
            .map(|&(c, f)| -> Result<f64> {
                let (train, valid) = &folds[f];
                let ds = Dataset::new(
                    split.x_train.select(Axis(0), train),
                    split.y_train.select(Axis(0), train),
                );
                let forest = candidates[c].fit(&ds).map_err(|e| {
                    ShotError::Fit(format!("candidate {} on fold {}: {e}", candidates[c], f + 1))
                })?;
                let x_valid = split.x_train.select(Axis(0), valid);
                let y_valid = split.y_train.select(Axis(0), valid);
                let pred: Array1<f64> = forest.predict(&x_valid);
                Ok(-pred.mean_squared_error(&y_valid)?)
            })
            .collect::<Result<Vec<f64>>>()?;

        let k = folds.len();
        let summaries: Vec<(f64, f64)> = scores
            .chunks(k)
            .map(|fold_scores| {
                let mean = fold_scores.iter().sum::<f64>() / k as f64;
                let var = fold_scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / k as f64;
                (mean, var.sqrt())
            })
            .collect();
        if summaries.iter().any(|(mean, _)| !mean.is_finite()) {
            return Err(ShotError::Fit("cross-validation produced a non-finite score".into()));
        }

        let mut cv_results: Vec<CvResult> = candidates
            .iter()
            .zip(&summaries)
            .map(|(params, &(mean, std))| CvResult {
                rank: 1 + summaries.iter().filter(|(m, _)| *m > mean).count(),
                mean_test_score: mean,
                std_test_score: std,
                n_trees: params.n_trees,
                max_depth: params.max_depth,
                min_samples_split: params.min_samples_split,
                min_samples_leaf: params.min_samples_leaf,
                max_features: params.max_features.to_string(),
                bootstrap: params.bootstrap,
                params: params.clone(),
            })
            .collect();
        // stable, so equal scores keep grid order and the first one wins
        cv_results.sort_by(|a, b| b.mean_test_score.total_cmp(&a.mean_test_score));
        let best = cv_results[0].params.clone().with_oob_score(true);
        info!(
            best = %best,
            score = cv_results[0].mean_test_score,
            "grid search finished"
        );

        let forest = best
            .fit(&Dataset::new(split.x_train.clone(), split.y_train.clone()))
            .map_err(|e| match e {
                ShotError::Fit(_) => e,
                other => ShotError::Fit(format!("refit of best candidate failed: {other}")),
            })?;
        let y_pred: Array1<f64> = forest.predict(&split.x_test);

        let fitted = self.fitted.insert(Fitted {
            forest,
            cv_results,
            y_pred,
        });
        Ok(&fitted.forest)
    }

    fn fitted(&self) -> Result<&Fitted> {
        self.fitted.as_ref().ok_or(ShotError::NotFitted)
    }

    pub fn forest(&self) -> Result<&RandomForestRegressor> {
        Ok(&self.fitted()?.forest)
    }

    /// Grid candidates, best first.
    pub fn cv_results(&self) -> Result<&[CvResult]> {
        Ok(&self.fitted()?.cv_results)
    }

    /// Out-of-bag R², and MSE and R² on the held-out test split.
    pub fn evaluate(&self) -> Result<Evaluation> {
        let fitted = self.fitted()?;
        let split = self.split_data()?;
        let oob_score = fitted
            .forest
            .oob_score()
            .ok_or_else(|| ShotError::Fit("model was fit without out-of-bag scoring".into()))?;
        let mse = fitted.y_pred.mean_squared_error(&split.y_test)?;
        let r2 = fitted.y_pred.r2(&split.y_test)?;
        Ok(Evaluation { oob_score, mse, r2 })
    }

    /// The `top_n` most important features, most important first. Ties keep
    /// feature order.
    pub fn feature_importance(&self, top_n: usize) -> Result<Vec<FeatureImportance>> {
        let fitted = self.fitted()?;
        let names = self.feature_names();
        let imp = fitted.forest.feature_importances();
        let mut order: Vec<usize> = (0..imp.len()).collect();
        order.sort_by(|&a, &b| imp[b].total_cmp(&imp[a]));
        Ok(order
            .into_iter()
            .take(top_n)
            .map(|i| FeatureImportance {
                feature: names[i].clone(),
                importance: imp[i],
            })
            .collect())
    }

    /// Exact Tree SHAP attributions for every row of the test split.
    pub fn attribution(&self) -> Result<Attribution> {
        let fitted = self.fitted()?;
        let split = self.split_data()?;
        Ok(forest_shap(&fitted.forest, split.x_test.view(), &self.feature_names()))
    }

    /// Runs every stage in order and collects the results.
    pub fn run_pipeline(
        &mut self,
        cv_folds: usize,
        test_fraction: f64,
        top_n: usize,
    ) -> Result<PipelineReport> {
        self.encode_categoricals()?;
        self.split(test_fraction)?;
        self.fit(cv_folds)?;
        Ok(PipelineReport {
            evaluation: self.evaluate()?,
            importances: self.feature_importance(top_n)?,
            attribution: self.attribution()?,
        })
    }
}

/// Contiguous, unshuffled folds; the first `n % k` folds get one extra row.
/// Returns `(train, validation)` row indices per fold.
pub fn kfold_indices(n: usize, k: usize) -> Vec<(Vec<usize>, Vec<usize>)> {
    let base = n / k;
    let extra = n % k;
    let mut start = 0;
    (0..k)
        .map(|fold| {
            let size = base + usize::from(fold < extra);
            let valid: Vec<usize> = (start..start + size).collect();
            let train: Vec<usize> = (0..start).chain(start + size..n).collect();
            start += size;
            (train, valid)
        })
        .collect()
}
