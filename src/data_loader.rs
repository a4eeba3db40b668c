use std::collections::HashMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use chrono::NaiveDate;
use glob::glob;
use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::error::{ForecastError, Result};
use crate::metrics::ScoredRow;

/// Identifies one row of a cross-sectional dataset.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    pub datetime: NaiveDate,
    pub instrument: String,
}

/// One (day, stock) observation before it is packed into a dataset.
#[derive(Debug, Clone)]
pub struct StockRecord {
    pub datetime: NaiveDate,
    pub instrument: String,
    pub features: Vec<f32>,
    pub label: f32,
    pub market_value: f32,
    pub stock_index: u32,
}

/// A slice of rows ready for a model call.
#[derive(Debug, Clone)]
pub struct Batch {
    pub feature: Tensor,
    pub label: Tensor,
    pub market_value: Tensor,
    pub stock_index: Tensor,
    pub index: Vec<RowKey>,
    pub mask: Vec<bool>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Row positions with a finite label, or `None` when every row is valid.
    pub fn valid_rows(&self) -> Option<Vec<u32>> {
        if self.mask.iter().all(|m| *m) {
            return None;
        }
        Some(
            self.mask
                .iter()
                .enumerate()
                .filter(|(_, m)| **m)
                .map(|(i, _)| i as u32)
                .collect(),
        )
    }

    /// Pairs a 1-D prediction with this batch's row labels.
    pub fn scored_rows(&self, pred: &Tensor) -> Result<Vec<ScoredRow>> {
        let scores = pred.to_dtype(candle_core::DType::F64)?.to_vec1::<f64>()?;
        let labels = self.label.to_dtype(candle_core::DType::F64)?.to_vec1::<f64>()?;
        Ok(self
            .index
            .iter()
            .zip(scores)
            .zip(labels)
            .map(|((key, score), label)| ScoredRow {
                datetime: key.datetime,
                instrument: key.instrument.clone(),
                score,
                label,
            })
            .collect())
    }
}

/// Day-sorted rows of one split, sliced into batches on demand.
pub struct DailyDataset {
    features: Vec<f32>,
    n_features: usize,
    labels: Vec<f32>,
    market_values: Vec<f32>,
    stock_index: Vec<u32>,
    index: Vec<RowKey>,
    days: Vec<Range<usize>>,
    batch_size: i64,
    device: Device,
}

impl DailyDataset {
    pub fn from_records(mut records: Vec<StockRecord>, batch_size: i64, device: &Device) -> Result<Self> {
        records.sort_by(|a, b| (a.datetime, &a.instrument).cmp(&(b.datetime, &b.instrument)));
        let n_features = records.first().map_or(0, |r| r.features.len());
        if let Some(bad) = records.iter().find(|r| r.features.len() != n_features) {
            return Err(ForecastError::InvalidInput(format!(
                "row {} {} has {} features, expected {}",
                bad.datetime,
                bad.instrument,
                bad.features.len(),
                n_features
            )));
        }

        let mut days = Vec::new();
        let mut start = 0;
        for i in 1..=records.len() {
            if i == records.len() || records[i].datetime != records[start].datetime {
                days.push(start..i);
                start = i;
            }
        }

        let mut features = Vec::with_capacity(records.len() * n_features);
        let mut labels = Vec::with_capacity(records.len());
        let mut market_values = Vec::with_capacity(records.len());
        let mut stock_index = Vec::with_capacity(records.len());
        let mut index = Vec::with_capacity(records.len());
        for r in records {
            features.extend_from_slice(&r.features);
            labels.push(r.label);
            market_values.push(r.market_value);
            stock_index.push(r.stock_index);
            index.push(RowKey { datetime: r.datetime, instrument: r.instrument });
        }

        Ok(Self {
            features,
            n_features,
            labels,
            market_values,
            stock_index,
            index,
            days,
            batch_size,
            device: device.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn daily_length(&self) -> usize {
        self.days.len()
    }

    /// One row range per trading day, in ascending date order.
    pub fn iter_daily(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.days.iter().cloned()
    }

    pub fn batch_length(&self) -> usize {
        if self.batch_size <= 0 {
            self.daily_length()
        } else {
            self.len().div_ceil(self.batch_size as usize)
        }
    }

    /// Training order: whole days when `batch_size <= 0`, otherwise
    /// contiguous fixed-size chunks of the day-sorted rows.
    pub fn iter_batch(&self) -> Box<dyn Iterator<Item = Range<usize>> + '_> {
        if self.batch_size <= 0 {
            return Box::new(self.iter_daily());
        }
        let size = self.batch_size as usize;
        let len = self.len();
        Box::new((0..len).step_by(size).map(move |start| start..(start + size).min(len)))
    }

    /// Drops days with fewer than `least` rows.
    pub fn retain_days_with_at_least(&mut self, least: usize) {
        if least == 0 {
            return;
        }
        let before = self.days.len();
        self.days.retain(|day| day.len() >= least);
        if self.days.len() != before {
            debug!(dropped = before - self.days.len(), least, "Dropped sparse days");
        }
        // Fixed-size batching must not cross into the dropped rows either.
        if self.batch_size > 0 {
            let keep: Vec<usize> = self.days.iter().flat_map(|d| d.clone()).collect();
            self.compact(&keep);
        }
    }

    fn compact(&mut self, keep: &[usize]) {
        let nf = self.n_features;
        self.features = keep
            .iter()
            .flat_map(|&i| self.features[i * nf..(i + 1) * nf].iter().copied())
            .collect();
        self.labels = keep.iter().map(|&i| self.labels[i]).collect();
        self.market_values = keep.iter().map(|&i| self.market_values[i]).collect();
        self.stock_index = keep.iter().map(|&i| self.stock_index[i]).collect();
        self.index = keep.iter().map(|&i| self.index[i].clone()).collect();
        let mut days = Vec::with_capacity(self.days.len());
        let mut start = 0;
        for day in &self.days {
            days.push(start..start + day.len());
            start += day.len();
        }
        self.days = days;
    }

    pub fn get(&self, slc: Range<usize>) -> Result<Batch> {
        let n = slc.len();
        let nf = self.n_features;
        let labels = &self.labels[slc.clone()];
        Ok(Batch {
            feature: Tensor::from_slice(&self.features[slc.start * nf..slc.end * nf], (n, nf), &self.device)?,
            label: Tensor::from_slice(labels, n, &self.device)?,
            market_value: Tensor::from_slice(&self.market_values[slc.clone()], n, &self.device)?,
            stock_index: Tensor::from_slice(&self.stock_index[slc.clone()], n, &self.device)?,
            index: self.index[slc].to_vec(),
            mask: labels.iter().map(|l| l.is_finite()).collect(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Valid, Split::Test];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Valid => "valid",
            Self::Test => "test",
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Train => "Train",
            Self::Valid => "Valid",
            Self::Test => "Test",
        }
    }
}

pub struct SplitLoaders {
    pub train: DailyDataset,
    pub valid: DailyDataset,
    pub test: DailyDataset,
}

impl SplitLoaders {
    pub fn get(&self, split: Split) -> &DailyDataset {
        match split {
            Split::Train => &self.train,
            Split::Valid => &self.valid,
            Split::Test => &self.test,
        }
    }
}

/// Concept membership `(S, C)` and stock relations `(S, S, R)`, indexed by stock index.
#[derive(Debug, Clone, Default)]
pub struct AuxiliaryInputs {
    pub concepts: Option<Tensor>,
    pub relations: Option<Tensor>,
}

impl AuxiliaryInputs {
    pub fn num_relation(&self) -> Option<usize> {
        self.relations.as_ref().and_then(|r| r.dims().get(2).copied())
    }

    /// Reads only the matrices the chosen model consumes.
    pub fn load(config: &RunConfig, device: &Device) -> Result<Self> {
        let kind = config.model_kind()?;
        let concepts = if kind.needs_concepts() {
            Some(read_matrix(&config.stock2concept_matrix, 2, device)?)
        } else {
            None
        };
        let relations = if kind.needs_relations() {
            Some(read_matrix(&config.stock2stock_matrix, 3, device)?)
        } else {
            None
        };
        Ok(Self { concepts, relations })
    }
}

fn read_matrix(path: &Path, rank: usize, device: &Device) -> Result<Tensor> {
    debug!("Reading auxiliary matrix from {}", path.display());
    let tensor = Tensor::read_npy(path)?
        .to_dtype(candle_core::DType::F32)?
        .to_device(device)?;
    if tensor.rank() != rank {
        return Err(ForecastError::InvalidInput(format!(
            "{} has shape {:?}, expected rank {}",
            path.display(),
            tensor.dims(),
            rank
        )));
    }
    Ok(tensor)
}

/// Scans parquet feature files and builds the per-split datasets.
pub struct DataLoader {
    lazy_frame: LazyFrame,
}

impl DataLoader {
    /// Creates a new DataLoader from a parquet file pattern
    pub fn new<P: AsRef<Path>>(path_pattern: P) -> Result<Self> {
        let pattern = path_pattern.as_ref().to_string_lossy().into_owned();
        info!("Loading parquet files matching pattern: {}", pattern);

        let paths: Vec<PathBuf> = glob(&pattern)
            .map_err(|e| ForecastError::InvalidInput(format!("bad glob pattern `{pattern}`: {e}")))?
            .filter_map(std::result::Result::ok)
            .collect();
        if paths.is_empty() {
            return Err(ForecastError::InvalidInput(format!(
                "no files found matching pattern: {pattern}"
            )));
        }

        let lazy_frame = LazyFrame::scan_parquet_files(Arc::from(paths), Default::default())?;
        Ok(Self { lazy_frame })
    }

    /// Reads `datetime`, `instrument`, every `feature_*` column and the
    /// `label_column` target.
    pub fn load_records(
        &self,
        label_column: &str,
        market_values: &MarketValues,
        stock_index: &HashMap<String, u32>,
    ) -> Result<Vec<StockRecord>> {
        let df = self
            .lazy_frame
            .clone()
            .with_columns([
                col("datetime").cast(DataType::String),
                col("instrument").cast(DataType::String),
                col(label_column).cast(DataType::Float32),
            ])
            .collect()?;
        debug!("DataFrame shape: {:?}", df.shape());

        let feature_names: Vec<String> = df
            .get_column_names()
            .into_iter()
            .filter(|name| name.starts_with("feature_"))
            .map(|name| name.to_string())
            .collect();
        if feature_names.is_empty() {
            return Err(ForecastError::InvalidInput("no feature_* columns found".to_string()));
        }

        let dates = df.column("datetime")?.as_materialized_series().str()?.clone();
        let instruments = df.column("instrument")?.as_materialized_series().str()?.clone();
        let labels = df.column(label_column)?.as_materialized_series().f32()?.clone();
        let mut feature_columns = Vec::with_capacity(feature_names.len());
        for name in &feature_names {
            let series = df
                .column(name)?
                .as_materialized_series()
                .cast(&DataType::Float32)?;
            feature_columns.push(series.f32()?.clone());
        }

        let mut missing_index = 0usize;
        let mut records = Vec::with_capacity(df.height());
        for row in 0..df.height() {
            let (Some(date), Some(instrument)) = (dates.get(row), instruments.get(row)) else {
                continue;
            };
            let datetime = parse_date(date)?;
            let idx = match stock_index.get(instrument) {
                Some(idx) => *idx,
                None => {
                    missing_index += 1;
                    0
                }
            };
            records.push(StockRecord {
                datetime,
                instrument: instrument.to_string(),
                features: feature_columns
                    .iter()
                    .map(|c| c.get(row).filter(|v| v.is_finite()).unwrap_or(0.0))
                    .collect(),
                label: labels.get(row).unwrap_or(f32::NAN),
                market_value: f32::NAN,
                stock_index: idx,
            });
        }
        if missing_index > 0 && !stock_index.is_empty() {
            warn!(rows = missing_index, "Instruments missing from the stock index; using index 0");
        }
        market_values.fill(&mut records);
        Ok(records)
    }
}

/// Per-(day, stock) market capitalisation used by the concept model.
#[derive(Debug, Default)]
pub struct MarketValues {
    values: HashMap<RowKey, f32>,
}

impl MarketValues {
    pub fn from_map(values: HashMap<RowKey, f32>) -> Self {
        Self { values }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let df = LazyFrame::scan_parquet(path.as_ref(), Default::default())?
            .select([
                col("datetime").cast(DataType::String),
                col("instrument").cast(DataType::String),
                col("market_value").cast(DataType::Float32),
            ])
            .collect()?;
        let dates = df.column("datetime")?.as_materialized_series().str()?.clone();
        let instruments = df.column("instrument")?.as_materialized_series().str()?.clone();
        let values = df.column("market_value")?.as_materialized_series().f32()?.clone();

        let mut map = HashMap::with_capacity(df.height());
        for row in 0..df.height() {
            if let (Some(d), Some(i), Some(v)) = (dates.get(row), instruments.get(row), values.get(row)) {
                map.insert(RowKey { datetime: parse_date(d)?, instrument: i.to_string() }, v);
            }
        }
        Ok(Self { values: map })
    }

    /// Looks up each record; gaps take the day's mean, or 1.0 for an empty day.
    pub fn fill(&self, records: &mut [StockRecord]) {
        let mut day_sum: HashMap<NaiveDate, (f64, usize)> = HashMap::new();
        for r in records.iter_mut() {
            let key = RowKey { datetime: r.datetime, instrument: r.instrument.clone() };
            if let Some(v) = self.values.get(&key).filter(|v| v.is_finite()) {
                r.market_value = *v;
                let entry = day_sum.entry(r.datetime).or_insert((0.0, 0));
                entry.0 += *v as f64;
                entry.1 += 1;
            }
        }
        for r in records.iter_mut().filter(|r| r.market_value.is_nan()) {
            r.market_value = match day_sum.get(&r.datetime) {
                Some((sum, n)) if *n > 0 => (*sum / *n as f64) as f32,
                _ => 1.0,
            };
        }
    }
}

pub fn load_stock_index<P: AsRef<Path>>(path: P) -> Result<HashMap<String, u32>> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|e| ForecastError::InvalidInput(format!("bad datetime `{raw}`: {e}")))
}

fn within(records: &[StockRecord], start: NaiveDate, end: NaiveDate) -> Vec<StockRecord> {
    records
        .iter()
        .filter(|r| r.datetime >= start && r.datetime <= end)
        .cloned()
        .collect()
}

/// Cuts the records into train/valid/test by the configured date ranges.
pub fn build_split_loaders(records: &[StockRecord], config: &RunConfig, device: &Device) -> Result<SplitLoaders> {
    let mut train = DailyDataset::from_records(
        within(records, config.train_start_date, config.train_end_date),
        config.batch_size,
        device,
    )?;
    train.retain_days_with_at_least(config.least_samples_num.max(0.0) as usize);
    let valid = DailyDataset::from_records(
        within(records, config.valid_start_date, config.valid_end_date),
        -1,
        device,
    )?;
    let test = DailyDataset::from_records(
        within(records, config.test_start_date, config.test_end_date),
        -1,
        device,
    )?;
    info!(
        train_days = train.daily_length(),
        valid_days = valid.daily_length(),
        test_days = test.daily_length(),
        "Split loaders ready"
    );
    Ok(SplitLoaders { train, valid, test })
}

/// Loads everything a run needs from the paths in `config`.
pub fn create_loaders(config: &RunConfig, device: &Device) -> Result<SplitLoaders> {
    let kind = config.model_kind()?;
    let market_values = if kind.needs_concepts() {
        MarketValues::load(&config.market_value_path)?
    } else {
        MarketValues::default()
    };
    let stock_index = if kind.needs_concepts() || kind.needs_relations() {
        load_stock_index(&config.stock_index)?
    } else {
        HashMap::new()
    };
    let records = DataLoader::new(config.data_pattern())?.load_records(
        config.label_column(),
        &market_values,
        &stock_index,
    )?;
    build_split_loaders(&records, config, device)
}
