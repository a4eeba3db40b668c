use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::checkpoint::{CheckpointSelector, Decision, ParamSnapshot};
use crate::config::RunConfig;
use crate::data_loader::{create_loaders, AuxiliaryInputs, Split, SplitLoaders};
use crate::error::{ForecastError, Result};
use crate::metrics::{metric_fn, RankingMetrics, Summary, TOP_K};
use crate::models::{initialize_params, DropoutRng, ForecastModel};
use crate::reporting::{RunInfo, RunLog, ScalarWriter};
use crate::trainer::{inference, test_epoch, train_epoch};

pub const INFO_FILE: &str = "info.json";
pub const SCALARS_FILE: &str = "scalars.jsonl";
pub const FINAL_CHECKPOINT: &str = "model.safetensors";
pub const BEST_CHECKPOINT: &str = "model_best.safetensors";

/// `cpu`, `cuda` or `cuda:N`. CUDA falls back to CPU when it is not available.
pub fn select_device(name: &str) -> Result<Device> {
    let name = name.trim().to_ascii_lowercase();
    if name == "cpu" {
        return Ok(Device::Cpu);
    }
    let ordinal = match name.strip_prefix("cuda") {
        Some("") => 0,
        Some(rest) => rest
            .strip_prefix(':')
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| ForecastError::ConfigParse(format!("bad device `{name}`")))?,
        None => return Err(ForecastError::ConfigParse(format!("bad device `{name}`"))),
    };
    Ok(Device::cuda_if_available(ordinal)?)
}

/// Test-split ranking metrics of one repetition.
#[derive(Debug, Clone)]
struct RepetitionMetrics {
    ic: f64,
    rank_ic: f64,
    precision: Vec<f64>,
    recall: Vec<f64>,
    ndcg: Vec<f64>,
}

impl From<&RankingMetrics> for RepetitionMetrics {
    fn from(m: &RankingMetrics) -> Self {
        Self {
            ic: m.ic.mean,
            rank_ic: m.rank_ic.mean,
            precision: m.precision_vec(),
            recall: m.recall_vec(),
            ndcg: m.ndcg_vec(),
        }
    }
}

/// Mean and std across repetitions. The `*_mean`/`*_std` vectors follow [`TOP_K`].
#[derive(Debug, Clone, Serialize)]
pub struct RepeatSummary {
    pub repetitions: usize,
    pub best_epochs: Vec<usize>,
    pub best_scores: Vec<f64>,
    pub ic: Summary,
    pub rank_ic: Summary,
    pub precision_mean: Vec<f64>,
    pub precision_std: Vec<f64>,
    pub recall_mean: Vec<f64>,
    pub recall_std: Vec<f64>,
    pub ndcg_mean: Vec<f64>,
    pub ndcg_std: Vec<f64>,
}

fn column_stats(rows: &[Vec<f64>]) -> (Vec<f64>, Vec<f64>) {
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    let Ok(table) = Array2::from_shape_vec((rows.len(), TOP_K.len()), flat) else {
        return (vec![f64::NAN; TOP_K.len()], vec![f64::NAN; TOP_K.len()]);
    };
    let mean = table
        .mean_axis(Axis(0))
        .map_or_else(|| vec![f64::NAN; TOP_K.len()], |m| m.to_vec());
    let std = if rows.is_empty() {
        vec![f64::NAN; TOP_K.len()]
    } else {
        table.std_axis(Axis(0), 0.0).to_vec()
    };
    (mean, std)
}

impl RepeatSummary {
    fn from_repetitions(reps: &[RepetitionMetrics], best_epochs: Vec<usize>, best_scores: Vec<f64>) -> Self {
        let ic: Vec<f64> = reps.iter().map(|r| r.ic).collect();
        let rank_ic: Vec<f64> = reps.iter().map(|r| r.rank_ic).collect();
        let precision: Vec<Vec<f64>> = reps.iter().map(|r| r.precision.clone()).collect();
        let recall: Vec<Vec<f64>> = reps.iter().map(|r| r.recall.clone()).collect();
        let ndcg: Vec<Vec<f64>> = reps.iter().map(|r| r.ndcg.clone()).collect();
        let (precision_mean, precision_std) = column_stats(&precision);
        let (recall_mean, recall_std) = column_stats(&recall);
        let (ndcg_mean, ndcg_std) = column_stats(&ndcg);
        Self {
            repetitions: reps.len(),
            best_epochs,
            best_scores,
            ic: Summary::of(&ic),
            rank_ic: Summary::of(&rank_ic),
            precision_mean,
            precision_std,
            recall_mean,
            recall_std,
            ndcg_mean,
            ndcg_std,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// `info.json` already existed and overwriting was not requested.
    Skipped,
    Completed(RepeatSummary),
}

/// Drives `repeat` independent train/select/evaluate cycles for one config.
pub struct Experiment {
    config: RunConfig,
    device: Device,
    output_path: PathBuf,
    rng: StdRng,
    global_step: u64,
}

impl Experiment {
    pub fn new(config: RunConfig) -> Result<Self> {
        let device = select_device(&config.device)?;
        Ok(Self::with_device(config, device))
    }

    pub fn with_device(config: RunConfig, device: Device) -> Self {
        let output_path = config.output_path();
        let rng = StdRng::seed_from_u64(config.seed);
        Self { config, device, output_path, rng, global_step: 0 }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn already_completed(&self) -> bool {
        !self.config.overwrite && self.output_path.join(INFO_FILE).exists()
    }

    fn open_log(&self) -> Result<RunLog> {
        fs::create_dir_all(&self.output_path)?;
        RunLog::create(self.output_path.join(format!("{}_run.log", self.config.name)))
    }

    /// Loads data from the configured paths and runs every repetition.
    pub fn run(&mut self) -> Result<RunOutcome> {
        let log = self.open_log()?;
        if self.already_completed() {
            log.log("already run, exit.")?;
            return Ok(RunOutcome::Skipped);
        }
        log.log("create loaders...")?;
        let loaders = create_loaders(&self.config, &self.device)?;
        let aux = AuxiliaryInputs::load(&self.config, &self.device)?;
        self.run_repeats(&log, &loaders, &aux)
    }

    /// Same as [`Experiment::run`] with data that is already in memory.
    pub fn run_on(&mut self, loaders: &SplitLoaders, aux: &AuxiliaryInputs) -> Result<RunOutcome> {
        let log = self.open_log()?;
        if self.already_completed() {
            log.log("already run, exit.")?;
            return Ok(RunOutcome::Skipped);
        }
        self.run_repeats(&log, loaders, aux)
    }

    #[instrument(skip_all, fields(model = %self.config.model_name, repeat = self.config.repeat))]
    fn run_repeats(&mut self, log: &RunLog, loaders: &SplitLoaders, aux: &AuxiliaryInputs) -> Result<RunOutcome> {
        let kind = self.config.model_kind()?;
        let train_loss = self.config.loss_kind()?;
        let eval_loss = train_loss.for_evaluation();
        let metric = self.config.validation_metric()?;
        let writer = ScalarWriter::create(self.output_path.join(SCALARS_FILE))?;
        debug!(?kind, ?train_loss, ?eval_loss, ?metric, "Resolved run settings");

        let mut global_best_score = f64::NEG_INFINITY;
        let mut repetitions = Vec::with_capacity(self.config.repeat);
        let mut best_epochs = Vec::with_capacity(self.config.repeat);
        let mut best_scores = Vec::with_capacity(self.config.repeat);

        for times in 0..self.config.repeat {
            log.log("create model...")?;
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);
            let dropout_rng = DropoutRng::fork(&mut self.rng);
            let model = ForecastModel::new(kind, &self.config, aux.num_relation(), &dropout_rng, vb)?;
            initialize_params(&varmap, &mut self.rng)?;
            let mut optimizer = AdamW::new(
                varmap.all_vars(),
                ParamsAdamW { lr: self.config.lr, weight_decay: 0.0, ..Default::default() },
            )?;

            let mut selector = CheckpointSelector::new(ParamSnapshot::capture(&varmap)?, self.config.early_stop);
            for epoch in 0..self.config.n_epochs {
                log.log(format!("Running {times} Epoch: {epoch}"))?;

                log.log("training...")?;
                train_epoch(
                    epoch,
                    &model,
                    &mut optimizer,
                    &varmap,
                    &loaders.train,
                    aux,
                    train_loss,
                    &writer,
                    &mut self.global_step,
                )?;
                let params_ckpt = ParamSnapshot::capture(&varmap)?;

                log.log("evaluating...")?;
                let eval = |split: Split| {
                    test_epoch(epoch, &model, loaders.get(split), aux, eval_loss, metric, &writer, split)
                };
                let train = eval(Split::Train)?;
                let valid = eval(Split::Valid)?;
                let test = eval(Split::Test)?;
                let bundles = [(Split::Train, &train), (Split::Valid, &valid), (Split::Test, &test)];
                log.log(format!(
                    "train_loss {:.6}, valid_loss {:.6}, test_loss {:.6}",
                    train.loss.mean, valid.loss.mean, test.loss.mean
                ))?;
                log.log(format!(
                    "train_ic {:.6}, valid_ic {:.6}, test_ic {:.6}",
                    train.metrics.ic.mean, valid.metrics.ic.mean, test.metrics.ic.mean
                ))?;
                log.log(format!(
                    "train_rank_ic {:.6}, valid_rank_ic {:.6}, test_rank_ic {:.6}",
                    train.metrics.rank_ic.mean, valid.metrics.rank_ic.mean, test.metrics.rank_ic.mean
                ))?;
                for (split, bundle) in bundles {
                    log.log(format!("{} Precision: {:?}", split.prefix(), bundle.metrics.precision))?;
                }
                for (split, bundle) in bundles {
                    log.log(format!("{} Recall: {:?}", split.prefix(), bundle.metrics.recall))?;
                }
                for (split, bundle) in bundles {
                    log.log(format!("{} NDCG: {:?}", split.prefix(), bundle.metrics.ndcg))?;
                }

                if selector.observe(epoch, valid.score(), params_ckpt) == Decision::Stop {
                    log.log("early stop")?;
                    break;
                }
            }

            log.log(format!("best score: {} @ {}", selector.best_score(), selector.best_epoch()))?;
            let best_params = selector.best_params();
            best_params.restore(&varmap)?;
            best_params.save(self.output_path.join(FINAL_CHECKPOINT))?;
            if selector.best_score() > global_best_score {
                best_params.save(self.output_path.join(BEST_CHECKPOINT))?;
                global_best_score = selector.best_score();
            }

            log.log("inference...")?;
            let mut res = BTreeMap::new();
            let mut last = None;
            for split in Split::ALL {
                let rows = inference(&model, loaders.get(split), aux)?;
                let metrics = metric_fn(&rows);
                let name = split.name();
                log.log(format!("{name}: IC {:.6} Rank IC {:.6}", metrics.ic.mean, metrics.rank_ic.mean))?;
                log.log(format!("{name} : Precision {:?}", metrics.precision))?;
                log.log(format!("{name} : Recall {:?}", metrics.recall))?;
                log.log(format!("{name} :NDCG {:?}", metrics.ndcg))?;
                res.insert(format!("{name}-IC"), metrics.ic.mean);
                res.insert(format!("{name}-RankIC"), metrics.rank_ic.mean);
                res.insert(
                    format!("{name}-NDCG@100"),
                    metrics.ndcg.get(&100).copied().unwrap_or(f64::NAN),
                );
                last = Some(metrics);
            }
            if let Some(test_metrics) = &last {
                repetitions.push(RepetitionMetrics::from(test_metrics));
            }
            best_epochs.push(selector.best_epoch());
            best_scores.push(selector.best_score());

            log.log("save info...")?;
            writer.add_hparams(&self.config, &res)?;
            RunInfo { config: &self.config, best_epoch: selector.best_epoch(), best_score: &res }
                .save(self.output_path.join(INFO_FILE))?;
        }

        let summary = RepeatSummary::from_repetitions(&repetitions, best_epochs, best_scores);
        log.log(format!(
            "IC: {:.4} ({:.4}), Rank IC: {:.4} ({:.4})",
            summary.ic.mean, summary.ic.std, summary.rank_ic.mean, summary.rank_ic.std
        ))?;
        for (k, n) in TOP_K.iter().enumerate() {
            log.log(format!(
                "Precision@{n}: {:.4} ({:.4})",
                summary.precision_mean[k], summary.precision_std[k]
            ))?;
            log.log(format!("NDCG@{n}: {:.4} ({:.4})", summary.ndcg_mean[k], summary.ndcg_std[k]))?;
        }
        log.log("finished.")?;
        info!(repetitions = summary.repetitions, global_best_score, "Experiment finished");
        Ok(RunOutcome::Completed(summary))
    }
}
