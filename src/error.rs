use std::path::PathBuf;

use polars::error::PolarsError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForecastError {
    #[error("cannot find config at `{}`", .0.display())]
    ConfigFileNotFound(PathBuf),

    #[error("config error: {0}")]
    ConfigParse(String),

    #[error("unknown model name `{0}`")]
    UnknownModel(String),

    #[error("unknown loss type `{0}`")]
    UnknownLossType(String),

    #[error("unknown validation metric `{0}`")]
    UnknownMetric(String),

    #[error("model `{model}` needs the {input} input, which was not loaded")]
    MissingAuxiliary { model: &'static str, input: &'static str },

    #[error("training diverged at epoch {epoch}, step {step}: loss is {loss}")]
    Diverged { epoch: usize, step: u64, loss: f32 },

    #[error("data loading error: {0}")]
    DataLoading(#[from] PolarsError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, ForecastError>;
