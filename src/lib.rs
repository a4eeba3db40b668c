pub mod checkpoint;
pub mod config;
pub mod data_loader;
pub mod error;
pub mod experiment;
pub mod losses;
pub mod metrics;
pub mod models;
pub mod reporting;
pub mod trainer;

pub use config::RunConfig;
pub use data_loader::{DailyDataset, DataLoader, SplitLoaders};
pub use error::{ForecastError, Result};
pub use experiment::{Experiment, RepeatSummary, RunOutcome};
pub use models::{ForecastModel, ModelKind};
