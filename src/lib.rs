//! Shot telemetry pipeline for a golf simulator: clean raw session exports,
//! merge them into one master dataset, suppress statistical outliers, and
//! train an explainable random-forest model of shot distance.
pub mod clean;
pub mod error;
pub mod filter;
pub mod forest;
pub mod io;
pub mod merge;
pub mod model;
pub mod preprocess;
pub mod shap;

pub use clean::{ExportBatch, RawRecordCleaner};
pub use error::{Result, ShotError};
pub use filter::{filter_shots, ClubFilter, DateRange};
pub use forest::{ForestParams, MaxFeatures, RandomForestRegressor};
pub use merge::{concat_frames, discover_exports, DatasetMerger, MergeReport, RunRecord, RunStatus};
pub use model::{
    CvResult, Evaluation, FeatureImportance, ParamGrid, PipelineReport, ShotRegressionModel, Stage,
};
pub use preprocess::{OutlierPolicy, PolicyTable, Preprocessor};
pub use shap::Attribution;

pub use polars::prelude::DataFrame;
