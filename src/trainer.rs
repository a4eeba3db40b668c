use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor};
use candle_nn::{AdamW, Optimizer, VarMap};
use tracing::{debug, instrument};

use crate::data_loader::{AuxiliaryInputs, Batch, DailyDataset, Split};
use crate::error::{ForecastError, Result};
use crate::losses::LossKind;
use crate::metrics::{metric_fn, RankingMetrics, ScoredRow, Summary, ValidationMetric};
use crate::models::ForecastModel;
use crate::reporting::ScalarWriter;

/// Element-wise gradient bound applied before every optimizer step.
pub const GRAD_CLIP_VALUE: f64 = 3.0;

/// Everything one evaluation pass over a split produces.
#[derive(Debug, Clone)]
pub struct MetricsBundle {
    pub loss: Summary,
    /// Daily values of the validation metric.
    pub scores: Vec<f64>,
    pub metrics: RankingMetrics,
}

impl MetricsBundle {
    /// Mean of the daily validation metric; this is what checkpoint selection compares.
    pub fn score(&self) -> f64 {
        Summary::of(&self.scores).mean
    }
}

/// Prediction and label restricted to rows with a finite label.
/// `None` when the batch has no such row.
fn valid_pair(batch: &Batch, pred: &Tensor) -> Result<Option<(Tensor, Tensor)>> {
    match batch.valid_rows() {
        None => Ok(Some((pred.clone(), batch.label.clone()))),
        Some(rows) if rows.is_empty() => Ok(None),
        Some(rows) => {
            let idx = Tensor::new(rows.as_slice(), pred.device())?;
            Ok(Some((pred.index_select(&idx, 0)?, batch.label.index_select(&idx, 0)?)))
        }
    }
}

fn scalar(loss: &Tensor) -> Result<f32> {
    Ok(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

/// Clamps every gradient of `vars` into `[-clip, clip]`.
pub fn clip_grad_value(grads: &mut GradStore, vars: &VarMap, clip: f64) -> Result<()> {
    for var in vars.all_vars() {
        if let Some(grad) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), grad.clamp(-clip, clip)?);
        }
    }
    Ok(())
}

/// One optimization pass over the training batches in loader order.
/// Returns the mean training loss of the epoch.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(epoch = epoch))]
pub fn train_epoch(
    epoch: usize,
    model: &ForecastModel,
    optimizer: &mut AdamW,
    vars: &VarMap,
    loader: &DailyDataset,
    aux: &AuxiliaryInputs,
    loss_kind: LossKind,
    writer: &ScalarWriter,
    global_step: &mut u64,
) -> Result<f64> {
    let mut losses = Vec::with_capacity(loader.batch_length());
    for slc in loader.iter_batch() {
        *global_step += 1;
        let batch = loader.get(slc)?;
        let pred = model.predict(&batch, aux, true)?;
        let Some((pred, label)) = valid_pair(&batch, &pred)? else {
            debug!(step = *global_step, "Skipping batch without labels");
            continue;
        };

        let loss = loss_kind.compute(&pred, &label)?;
        let value = scalar(&loss)?;
        if !value.is_finite() {
            return Err(ForecastError::Diverged { epoch, step: *global_step, loss: value });
        }

        let mut grads = loss.backward()?;
        clip_grad_value(&mut grads, vars, GRAD_CLIP_VALUE)?;
        optimizer.step(&grads)?;

        writer.add_scalar("Train/StepLoss", value as f64, *global_step)?;
        losses.push(value as f64);
    }
    let mean = Summary::of(&losses).mean;
    debug!(batches = losses.len(), mean_loss = mean, "Training pass done");
    Ok(mean)
}

/// Forward-only pass over every day of a split.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(epoch = epoch, split = split.name()))]
pub fn test_epoch(
    epoch: usize,
    model: &ForecastModel,
    loader: &DailyDataset,
    aux: &AuxiliaryInputs,
    loss_kind: LossKind,
    metric: ValidationMetric,
    writer: &ScalarWriter,
    split: Split,
) -> Result<MetricsBundle> {
    let mut losses = Vec::with_capacity(loader.daily_length());
    let mut rows = Vec::with_capacity(loader.len());
    for slc in loader.iter_daily() {
        let batch = loader.get(slc)?;
        let pred = model.predict(&batch, aux, false)?;
        if let Some((p, l)) = valid_pair(&batch, &pred)? {
            losses.push(scalar(&loss_kind.compute(&p, &l)?)? as f64);
        }
        rows.extend(batch.scored_rows(&pred)?);
    }

    let metrics = metric_fn(&rows);
    let scores = metrics.daily(metric).to_vec();
    let loss = Summary::of(&losses);
    let score = Summary::of(&scores);

    let prefix = split.prefix();
    let step = epoch as u64;
    writer.add_scalar(&format!("{prefix}/Loss"), loss.mean, step)?;
    writer.add_scalar(&format!("{prefix}/std(Loss)"), loss.std, step)?;
    writer.add_scalar(&format!("{prefix}/{}", metric.label()), score.mean, step)?;
    writer.add_scalar(&format!("{prefix}/std({})", metric.label()), score.std, step)?;

    Ok(MetricsBundle { loss, scores, metrics })
}

/// Scores every row of a split, day by day.
pub fn inference(model: &ForecastModel, loader: &DailyDataset, aux: &AuxiliaryInputs) -> Result<Vec<ScoredRow>> {
    let mut rows = Vec::with_capacity(loader.len());
    for slc in loader.iter_daily() {
        let batch = loader.get(slc)?;
        let pred = model.predict(&batch, aux, false)?;
        rows.extend(batch.scored_rows(&pred)?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};
    use candle_nn::{ParamsAdamW, VarBuilder};
    use chrono::NaiveDate;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::config::RunConfig;
    use crate::data_loader::StockRecord;
    use crate::models::{initialize_params, DropoutRng, ModelKind};

    fn config() -> RunConfig {
        RunConfig::from_args([
            "ranking-forecast",
            "--model_name",
            "MLP",
            "--d_feat",
            "2",
            "--seq_len",
            "2",
            "--hidden_size",
            "8",
            "--num_layers",
            "1",
        ])
        .unwrap()
    }

    fn dataset(batch_size: i64) -> DailyDataset {
        let mut records = Vec::new();
        for day in 1..=4u32 {
            for s in 0..5u32 {
                let x = (day * 5 + s) as f32 / 20.0;
                records.push(StockRecord {
                    datetime: NaiveDate::from_ymd_opt(2021, 3, day).unwrap(),
                    instrument: format!("S{s}"),
                    features: vec![x, -x, x * x, 1.0 - x],
                    label: if day == 2 && s == 0 { f32::NAN } else { x - 0.5 },
                    market_value: 1.0,
                    stock_index: s,
                });
            }
        }
        DailyDataset::from_records(records, batch_size, &Device::Cpu).unwrap()
    }

    fn model(varmap: &VarMap) -> ForecastModel {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        let model = ForecastModel::new(ModelKind::Mlp, &config(), None, &DropoutRng::seed_from_u64(11), vb).unwrap();
        initialize_params(varmap, &mut StdRng::seed_from_u64(11)).unwrap();
        model
    }

    #[test]
    fn clipping_bounds_every_gradient_element() {
        let w = Var::from_tensor(&Tensor::new(&[[50.0f32], [-50.0]], &Device::Cpu).unwrap()).unwrap();
        let varmap = VarMap::new();
        varmap.data().lock().unwrap().insert("w".to_string(), w.clone());

        let x = Tensor::new(&[[100.0f32, -200.0], [300.0, 4.0]], &Device::Cpu).unwrap();
        let loss = x.matmul(w.as_tensor()).unwrap().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        let before = grads.get(w.as_tensor()).unwrap().abs().unwrap().max_all().unwrap();
        assert!(before.to_scalar::<f32>().unwrap() > 3.0);

        clip_grad_value(&mut grads, &varmap, GRAD_CLIP_VALUE).unwrap();
        let after = grads.get(w.as_tensor()).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(after.iter().all(|g| g.abs() <= 3.0));
        assert!(after.iter().any(|g| g.abs() == 3.0));
    }

    #[test]
    fn train_epoch_steps_once_per_batch() {
        let varmap = VarMap::new();
        let model = model(&varmap);
        let mut optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW { lr: 1e-3, weight_decay: 0.0, ..Default::default() },
        )
        .unwrap();
        let loader = dataset(3);
        let mut step = 0;
        let loss = train_epoch(
            0,
            &model,
            &mut optimizer,
            &varmap,
            &loader,
            &AuxiliaryInputs::default(),
            LossKind::Mse,
            &ScalarWriter::disabled(),
            &mut step,
        )
        .unwrap();
        assert_eq!(step, loader.batch_length() as u64);
        assert!(loss.is_finite());
    }

    #[test]
    fn training_changes_parameters() {
        let varmap = VarMap::new();
        let model = model(&varmap);
        let before = crate::checkpoint::ParamSnapshot::capture(&varmap).unwrap();
        let mut optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW { lr: 1e-2, weight_decay: 0.0, ..Default::default() },
        )
        .unwrap();
        let mut step = 0;
        train_epoch(
            0,
            &model,
            &mut optimizer,
            &varmap,
            &dataset(-1),
            &AuxiliaryInputs::default(),
            LossKind::PairWise { alpha: 0.1 },
            &ScalarWriter::disabled(),
            &mut step,
        )
        .unwrap();
        let data = varmap.data().lock().unwrap();
        let changed = data.iter().any(|(name, var)| {
            let old = before.get(name).unwrap();
            let diff = (var.as_tensor() - old).unwrap().abs().unwrap().sum_all().unwrap();
            diff.to_scalar::<f32>().unwrap() > 0.0
        });
        assert!(changed);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let varmap = VarMap::new();
        let model = model(&varmap);
        let loader = dataset(-1);
        let aux = AuxiliaryInputs::default();
        let first = inference(&model, &loader, &aux).unwrap();
        let second = inference(&model, &loader, &aux).unwrap();
        assert_eq!(first.len(), 20);
        let score_bits = |rows: &[ScoredRow]| rows.iter().map(|r| r.score.to_bits()).collect::<Vec<_>>();
        assert_eq!(score_bits(&first), score_bits(&second));

        let run = || {
            test_epoch(
                0,
                &model,
                &loader,
                &aux,
                LossKind::Mse,
                ValidationMetric::RankIc,
                &ScalarWriter::disabled(),
                Split::Valid,
            )
            .unwrap()
        };
        let (a, b) = (run(), run());
        assert_eq!(a.scores.len(), 4);
        let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&a.scores), bits(&b.scores));
        assert_eq!(bits(&a.metrics.ndcg_vec()), bits(&b.metrics.ndcg_vec()));
        assert_eq!(a.loss.mean.to_bits(), b.loss.mean.to_bits());
    }

    #[test]
    fn test_epoch_writes_split_scalars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scalars.jsonl");
        let writer = ScalarWriter::create(&path).unwrap();
        let varmap = VarMap::new();
        let model = model(&varmap);
        let bundle = test_epoch(
            7,
            &model,
            &dataset(-1),
            &AuxiliaryInputs::default(),
            LossKind::Mse,
            ValidationMetric::Ic,
            &writer,
            Split::Test,
        )
        .unwrap();
        assert!(bundle.loss.mean.is_finite());

        let tags: Vec<(String, u64)> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                (v["tag"].as_str().unwrap().to_string(), v["step"].as_u64().unwrap())
            })
            .collect();
        assert_eq!(
            tags,
            vec![
                ("Test/Loss".to_string(), 7),
                ("Test/std(Loss)".to_string(), 7),
                ("Test/IC".to_string(), 7),
                ("Test/std(IC)".to_string(), 7),
            ]
        );
    }
}
