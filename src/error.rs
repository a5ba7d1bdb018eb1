// Error kinds for the ingestion, preprocessing and modeling core.
use std::path::PathBuf;
use thiserror::Error;

/// Everything that can go wrong between a raw export and a fitted model.
#[derive(Debug, Error)]
pub enum ShotError {
    /// A raw export carried an unusable timestamp or distance value.
    #[error("malformed source {file}: {reason}")]
    MalformedSource { file: PathBuf, reason: String },

    /// An expected column was absent or had the wrong type.
    #[error("schema error: column `{column}` {context}")]
    Schema { column: String, context: String },

    /// Filtering left nothing to work with.
    #[error("empty dataset: {context}")]
    EmptyDataset { context: String },

    /// Training could not produce a model.
    #[error("fit failed: {0}")]
    Fit(String),

    #[error("categorical features have not been encoded; call encode_categoricals() first")]
    NotEncoded,

    #[error("data has not been split; call split() first")]
    NotSplit,

    #[error("model has not been fit; call fit() first")]
    NotFitted,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Polars(#[from] polars::error::PolarsError),

    #[error(transparent)]
    Linfa(#[from] linfa::Error),
}

impl ShotError {
    pub(crate) fn malformed(file: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedSource {
            file: file.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn schema(column: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Schema {
            column: column.into(),
            context: context.into(),
        }
    }

    pub(crate) fn empty(context: impl Into<String>) -> Self {
        Self::EmptyDataset {
            context: context.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ShotError>;
