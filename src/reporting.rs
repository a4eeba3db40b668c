use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::config::RunConfig;
use crate::error::Result;

fn append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// `[YYYY-MM-DD HH:MM:SS] -` in UTC+8.
pub fn timestamp() -> String {
    let now = Utc::now() + Duration::hours(8);
    format!("[{}] -", now.format("%Y-%m-%d %H:%M:%S"))
}

/// Timestamped progress log for one run, mirrored into tracing.
#[derive(Debug, Default)]
pub struct RunLog {
    file: Option<File>,
}

impl RunLog {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self { file: Some(append(path.as_ref())?) })
    }

    /// Tracing only, no file.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn log(&self, msg: impl fmt::Display) -> Result<()> {
        let msg = msg.to_string();
        info!("{}", msg);
        if let Some(mut file) = self.file.as_ref() {
            writeln!(file, "{} {}", timestamp(), msg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ScalarRecord<'a> {
    tag: &'a str,
    value: f64,
    step: u64,
}

/// JSON-lines scalar sink: one `{tag, value, step}` object per line.
/// Non-finite values are written as `null`.
#[derive(Debug, Default)]
pub struct ScalarWriter {
    file: Option<File>,
}

impl ScalarWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self { file: Some(append(path.as_ref())?) })
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn add_scalar(&self, tag: &str, value: f64, step: u64) -> Result<()> {
        self.write_line(&serde_json::to_string(&ScalarRecord { tag, value, step })?)
    }

    /// Records the run's hyperparameters next to its final metrics.
    pub fn add_hparams(&self, config: &RunConfig, metrics: &BTreeMap<String, f64>) -> Result<()> {
        let metrics: BTreeMap<String, f64> = metrics
            .iter()
            .map(|(k, v)| (format!("hparam/{k}"), *v))
            .collect();
        let record = json!({ "tag": "hparams", "hparams": config, "metrics": metrics });
        self.write_line(&serde_json::to_string(&record)?)
    }

    fn write_line(&self, line: &str) -> Result<()> {
        if let Some(mut file) = self.file.as_ref() {
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}

/// Contents of `info.json`.
#[derive(Debug, Serialize)]
pub struct RunInfo<'a> {
    pub config: &'a RunConfig,
    pub best_epoch: usize,
    pub best_score: &'a BTreeMap<String, f64>,
}

impl RunInfo<'_> {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
