use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use clap::parser::ValueSource;
use clap::{CommandFactory, FromArgMatches, Parser};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ForecastError, Result};
use crate::losses::LossKind;
use crate::metrics::ValidationMetric;
use crate::models::ModelKind;

/// Every knob of a training run.
///
/// Flags keep the snake_case spelling used by the existing experiment
/// scripts (`--model_name`, `--n_epochs`, ...). Later flags override earlier
/// ones. A `--config` file is applied in argv order: its keys override the
/// flags before it, and flags after it override the file.
#[derive(Parser, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[command(
    name = "ranking-forecast",
    about = "Train and evaluate cross-sectional stock ranking models",
    args_override_self = true
)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    // model
    #[arg(long = "model_name", default_value = "HIST")]
    pub model_name: String,
    #[arg(long = "d_feat", default_value_t = 6)]
    pub d_feat: usize,
    #[arg(long = "hidden_size", default_value_t = 128)]
    pub hidden_size: usize,
    #[arg(long = "num_layers", default_value_t = 2)]
    pub num_layers: usize,
    #[arg(long = "dropout", default_value_t = 0.1)]
    pub dropout: f32,
    /// HIST: number of most similar peers each stock mines hidden concepts from.
    #[arg(long = "K", default_value_t = 1)]
    #[serde(rename = "K")]
    pub k: usize,
    /// `mse` when empty; otherwise one of `ic`, `pair_wise`, `ndcg`, `appndcg`.
    #[arg(long = "loss_type", default_value = "")]
    pub loss_type: String,
    #[arg(long = "ranking_alpha", default_value_t = 0.1)]
    pub ranking_alpha: f64,
    #[arg(long = "seq_len", default_value_t = 60)]
    pub seq_len: usize,

    // training
    #[arg(long = "n_epochs", default_value_t = 100)]
    pub n_epochs: usize,
    #[arg(long = "lr", default_value_t = 2e-4)]
    pub lr: f64,
    #[arg(long = "early_stop", default_value_t = 30)]
    pub early_stop: usize,
    /// Series used for checkpoint selection: `IC` or `RankIC`.
    #[arg(long = "metric", default_value = "RankIC")]
    pub metric: String,
    #[arg(long = "repeat", default_value_t = 3)]
    pub repeat: usize,

    // data
    #[arg(long = "data_set", default_value = "csi300")]
    pub data_set: String,
    /// Parquet glob for the feature table; derived from `data_set` when empty.
    #[arg(long = "data_path", default_value = "")]
    pub data_path: String,
    /// Rows per training batch; `-1` groups one trading day per batch.
    #[arg(long = "batch_size", default_value_t = -1, allow_hyphen_values = true)]
    pub batch_size: i64,
    /// Training days with fewer rows than this are dropped. Defaults to 0
    /// rather than a full-universe count such as 1137, which would drop every
    /// day of a smaller universe (a CSI300 day has about 300 rows).
    #[arg(long = "least_samples_num", default_value_t = 0.0)]
    pub least_samples_num: f64,
    /// Label column of the feature table; `label` when empty.
    #[arg(long = "label", default_value = "")]
    pub label: String,
    #[arg(long = "train_start_date", default_value = "2007-01-01")]
    pub train_start_date: NaiveDate,
    #[arg(long = "train_end_date", default_value = "2014-12-31")]
    pub train_end_date: NaiveDate,
    #[arg(long = "valid_start_date", default_value = "2015-01-01")]
    pub valid_start_date: NaiveDate,
    #[arg(long = "valid_end_date", default_value = "2016-12-31")]
    pub valid_end_date: NaiveDate,
    #[arg(long = "test_start_date", default_value = "2017-01-01")]
    pub test_start_date: NaiveDate,
    #[arg(long = "test_end_date", default_value = "2020-12-31")]
    pub test_end_date: NaiveDate,

    // other
    #[arg(long = "seed", default_value_t = 2024)]
    pub seed: u64,
    #[arg(long = "annot", default_value = "")]
    pub annot: String,
    #[arg(long = "config")]
    #[serde(skip)]
    pub config: Option<PathBuf>,
    #[arg(long = "name", default_value = "PatchTST")]
    pub name: String,

    // auxiliary inputs
    #[arg(long = "market_value_path", default_value = "./data/csi300_market_value_07to22.parquet")]
    pub market_value_path: PathBuf,
    #[arg(long = "stock2concept_matrix", default_value = "./data/csi300_stock2concept.npy")]
    pub stock2concept_matrix: PathBuf,
    #[arg(long = "stock2stock_matrix", default_value = "./data/csi300_multi_stock2stock.npy")]
    pub stock2stock_matrix: PathBuf,
    #[arg(long = "stock_index", default_value = "./data/csi300_stock_index.json")]
    pub stock_index: PathBuf,
    #[arg(long = "outdir", default_value = "./output/csi300_RSR")]
    pub outdir: String,
    #[arg(long = "overwrite", default_value_t = false)]
    pub overwrite: bool,
    #[arg(long = "device", default_value = "cuda:1")]
    pub device: String,
}

impl RunConfig {
    /// Parses flags, applies the optional config file, and validates the result.
    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        let parsed = Self::try_parse_from(args.iter().cloned())
            .map_err(|e| ForecastError::ConfigParse(e.to_string()))?;
        let config = match parsed.config.clone() {
            Some(path) => {
                let config = parsed.overlay_file(&path)?;
                match flags_after_config(&args) {
                    Some(tail) if !tail.is_empty() => config.reapply_flags(&args[0], tail, path)?,
                    _ => config,
                }
            }
            None => parsed,
        };
        config.validate()?;
        Ok(config)
    }

    /// Re-applies flags given on the command line after `--config`.
    fn reapply_flags(self, program: &OsString, tail: &[OsString], source: PathBuf) -> Result<Self> {
        let argv = std::iter::once(program.clone()).chain(tail.iter().cloned());
        let matches = Self::command()
            .try_get_matches_from(argv)
            .map_err(|e| ForecastError::ConfigParse(e.to_string()))?;
        let flags = Self::from_arg_matches(&matches).map_err(|e| ForecastError::ConfigParse(e.to_string()))?;
        let serde_json::Value::Object(values) = serde_json::to_value(&flags)? else {
            return Ok(self);
        };
        let mut overrides = serde_json::Map::new();
        for id in matches.ids() {
            let id = id.as_str();
            if id == "config" || matches.value_source(id) != Some(ValueSource::CommandLine) {
                continue;
            }
            let key = if id == "k" { "K" } else { id };
            if let Some(value) = values.get(key) {
                overrides.insert(key.to_string(), value.clone());
            }
        }
        self.overlay(serde_json::Value::Object(overrides), Some(source))
    }

    /// Applies every key of a JSON (or `.toml`) object onto this config.
    pub fn overlay_file(self, path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ForecastError::ConfigFileNotFound(path.to_path_buf()));
        }
        debug!("Loading config overlay from path: {}", path.display());
        let contents = fs::read_to_string(path)?;
        let overrides: serde_json::Value = if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&contents).map_err(|e| ForecastError::ConfigParse(e.to_string()))?
        } else {
            serde_json::from_str(&contents)?
        };
        self.overlay(overrides, Some(path.to_path_buf()))
    }

    fn overlay(self, overrides: serde_json::Value, source: Option<PathBuf>) -> Result<Self> {
        let serde_json::Value::Object(overrides) = overrides else {
            return Err(ForecastError::ConfigParse(
                "config file must contain a JSON object".to_string(),
            ));
        };
        let mut merged = serde_json::to_value(&self)?;
        if let serde_json::Value::Object(fields) = &mut merged {
            for (key, value) in overrides {
                fields.insert(key, value);
            }
        }
        let mut config: RunConfig = serde_json::from_value(merged)
            .map_err(|e| ForecastError::ConfigParse(e.to_string()))?;
        config.config = source;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.model_kind()?;
        self.loss_kind()?;
        self.validation_metric()?;
        if self.d_feat == 0 || self.hidden_size == 0 || self.num_layers == 0 {
            return Err(ForecastError::ConfigParse(
                "d_feat, hidden_size and num_layers must be positive".to_string(),
            ));
        }
        if self.train_start_date > self.train_end_date
            || self.valid_start_date > self.valid_end_date
            || self.test_start_date > self.test_end_date
        {
            return Err(ForecastError::ConfigParse(
                "every split needs start_date <= end_date".to_string(),
            ));
        }
        Ok(())
    }

    pub fn model_kind(&self) -> Result<ModelKind> {
        self.model_name.parse()
    }

    pub fn loss_kind(&self) -> Result<LossKind> {
        LossKind::from_config(&self.loss_type, self.ranking_alpha)
    }

    pub fn validation_metric(&self) -> Result<ValidationMetric> {
        self.metric.parse()
    }

    /// Directory name used when `outdir` is left empty.
    pub fn run_suffix(&self) -> String {
        format!(
            "{}_dh{}_dn{}_drop{}_lr{}_bs{}_seed{}{}",
            self.model_name,
            self.hidden_size,
            self.num_layers,
            self.dropout,
            self.lr,
            self.batch_size,
            self.seed,
            self.annot
        )
    }

    pub fn output_path(&self) -> PathBuf {
        if self.outdir.is_empty() {
            PathBuf::from("./output").join(self.run_suffix())
        } else {
            PathBuf::from(&self.outdir)
        }
    }

    pub fn label_column(&self) -> &str {
        if self.label.is_empty() {
            "label"
        } else {
            &self.label
        }
    }

    pub fn data_pattern(&self) -> String {
        if self.data_path.is_empty() {
            format!("./data/{}/*.parquet", self.data_set)
        } else {
            self.data_path.clone()
        }
    }
}

/// Tokens following the last `--config PATH` (or `--config=PATH`).
fn flags_after_config(args: &[OsString]) -> Option<&[OsString]> {
    let mut tail = None;
    let mut i = 1;
    while i < args.len() {
        let token = args[i].to_string_lossy();
        if token == "--config" {
            tail = Some((i + 2).min(args.len()));
            i += 2;
            continue;
        }
        if token.starts_with("--config=") {
            tail = Some(i + 1);
        }
        i += 1;
    }
    tail.map(|start| &args[start..])
}
