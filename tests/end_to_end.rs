use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor};
use chrono::NaiveDate;
use polars::prelude::*;
use ranking_forecast::data_loader::{build_split_loaders, AuxiliaryInputs, StockRecord};
use ranking_forecast::{Experiment, RunConfig, RunOutcome};
use tempfile::tempdir;

const DAYS: [&str; 3] = ["2020-01-02", "2020-01-03", "2020-01-06"];

fn config(outdir: &Path, model: &str, extra: &[&str]) -> RunConfig {
    let outdir = outdir.to_string_lossy().into_owned();
    let mut args = vec![
        "ranking-forecast",
        "--model_name",
        model,
        "--d_feat",
        "2",
        "--seq_len",
        "2",
        "--hidden_size",
        "16",
        "--num_layers",
        "2",
        "--n_epochs",
        "1",
        "--repeat",
        "1",
        "--lr",
        "0.001",
        "--device",
        "cpu",
        "--name",
        "e2e",
        "--train_start_date",
        "2020-01-01",
        "--train_end_date",
        "2020-01-31",
        "--valid_start_date",
        "2020-01-01",
        "--valid_end_date",
        "2020-01-31",
        "--test_start_date",
        "2020-01-01",
        "--test_end_date",
        "2020-01-31",
        "--outdir",
        &outdir,
    ];
    args.extend_from_slice(extra);
    RunConfig::from_args(args).unwrap()
}

/// Two stocks over three trading days with distinct features and labels.
fn records() -> Vec<StockRecord> {
    let mut records = Vec::new();
    for (d, day) in DAYS.iter().enumerate() {
        for s in 0..2u32 {
            let base = d as f32 + if s == 0 { 0.5 } else { -0.5 };
            records.push(StockRecord {
                datetime: NaiveDate::parse_from_str(day, "%Y-%m-%d").unwrap(),
                instrument: format!("SH60000{s}"),
                features: vec![base, 1.0 - base, base * 0.5, -(s as f32)],
                label: if s == 0 { 0.02 * (d as f32 + 1.0) } else { -0.01 },
                market_value: 10.0 + s as f32,
                stock_index: s,
            });
        }
    }
    records
}

fn read_info(outdir: &Path) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(outdir.join("info.json")).unwrap()).unwrap()
}

#[test]
fn mlp_run_writes_info_and_checkpoints() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), "MLP", &[]);
    let loaders = build_split_loaders(&records(), &cfg, &Device::Cpu).unwrap();
    assert_eq!(loaders.train.daily_length(), 3);

    let mut experiment = Experiment::new(cfg).unwrap();
    let RunOutcome::Completed(summary) = experiment.run_on(&loaders, &AuxiliaryInputs::default()).unwrap() else {
        panic!("first run must not be skipped");
    };
    assert_eq!(summary.repetitions, 1);
    assert_eq!(summary.precision_mean.len(), 8);
    assert_eq!(summary.ndcg_std.len(), 8);

    let info = read_info(dir.path());
    assert_eq!(info["best_epoch"], 0);
    assert_eq!(info["config"]["model_name"], "MLP");
    for split in ["train", "valid", "test"] {
        for metric in ["IC", "RankIC"] {
            let value = info["best_score"][format!("{split}-{metric}")].as_f64().unwrap();
            assert!(value.is_finite() && (-1.0..=1.0).contains(&value), "{split}-{metric} = {value}");
        }
        assert!(info["best_score"].get(format!("{split}-NDCG@100")).is_some());
    }

    for file in ["model.safetensors", "model_best.safetensors", "scalars.jsonl", "e2e_run.log"] {
        assert!(dir.path().join(file).exists(), "{file} missing");
    }
    let log = fs::read_to_string(dir.path().join("e2e_run.log")).unwrap();
    assert!(log.contains("Running 0 Epoch: 0"));
    assert!(log.contains("finished."));
}

#[test]
fn completed_output_is_not_rerun() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), "MLP", &[]);
    let loaders = build_split_loaders(&records(), &cfg, &Device::Cpu).unwrap();
    let aux = AuxiliaryInputs::default();

    Experiment::new(cfg.clone()).unwrap().run_on(&loaders, &aux).unwrap();
    let before = fs::read(dir.path().join("info.json")).unwrap();
    let scalars_before = fs::read(dir.path().join("scalars.jsonl")).unwrap();

    let mut second = Experiment::new(cfg.clone()).unwrap();
    assert!(second.already_completed());
    assert!(matches!(second.run_on(&loaders, &aux).unwrap(), RunOutcome::Skipped));
    assert_eq!(fs::read(dir.path().join("info.json")).unwrap(), before);
    assert_eq!(fs::read(dir.path().join("scalars.jsonl")).unwrap(), scalars_before);
    let log = fs::read_to_string(dir.path().join("e2e_run.log")).unwrap();
    assert!(log.trim_end().ends_with("already run, exit."));

    // the skip also happens before any data is read
    let mut third = Experiment::new(cfg).unwrap();
    assert!(matches!(third.run().unwrap(), RunOutcome::Skipped));
}

#[test]
fn overwrite_forces_a_new_run() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), "MLP", &["--overwrite"]);
    let loaders = build_split_loaders(&records(), &cfg, &Device::Cpu).unwrap();
    let aux = AuxiliaryInputs::default();
    Experiment::new(cfg.clone()).unwrap().run_on(&loaders, &aux).unwrap();
    let outcome = Experiment::new(cfg).unwrap().run_on(&loaders, &aux).unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));
}

#[test]
fn repeat_runs_every_cycle() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), "GRU", &["--repeat", "3", "--n_epochs", "2"]);
    let loaders = build_split_loaders(&records(), &cfg, &Device::Cpu).unwrap();

    let mut experiment = Experiment::new(cfg).unwrap();
    let RunOutcome::Completed(summary) = experiment.run_on(&loaders, &AuxiliaryInputs::default()).unwrap() else {
        panic!("run must complete");
    };
    assert_eq!(summary.repetitions, 3);
    assert_eq!(summary.best_epochs.len(), 3);
    assert_eq!(summary.best_scores.len(), 3);
    for v in [&summary.precision_mean, &summary.recall_std, &summary.ndcg_mean] {
        assert_eq!(v.len(), 8);
    }

    let hparams = fs::read_to_string(dir.path().join("scalars.jsonl"))
        .unwrap()
        .lines()
        .filter(|l| l.contains("\"tag\":\"hparams\""))
        .count();
    assert_eq!(hparams, 3);
    let log = fs::read_to_string(dir.path().join("e2e_run.log")).unwrap();
    assert!(log.contains("Running 2 Epoch: 1"));
}

#[test]
fn relation_model_runs_with_relation_tensor() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), "RSR", &[]);
    let loaders = build_split_loaders(&records(), &cfg, &Device::Cpu).unwrap();
    let relations = Tensor::new(&[[[0f32, 0.0], [1.0, 0.0]], [[1.0, 0.0], [0.0, 0.0]]], &Device::Cpu).unwrap();
    let aux = AuxiliaryInputs { concepts: None, relations: Some(relations) };

    let outcome = Experiment::new(cfg).unwrap().run_on(&loaders, &aux).unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));
    assert!(dir.path().join("info.json").exists());
}

#[test]
fn concept_model_runs_with_concept_matrix() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), "HIST", &[]);
    let loaders = build_split_loaders(&records(), &cfg, &Device::Cpu).unwrap();
    let concepts = Tensor::new(&[[1f32, 0.0, 1.0], [0.0, 1.0, 1.0]], &Device::Cpu).unwrap();
    let aux = AuxiliaryInputs { concepts: Some(concepts), relations: None };

    let outcome = Experiment::new(cfg).unwrap().run_on(&loaders, &aux).unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));
}

#[test]
fn run_reads_parquet_from_the_data_path() {
    let dir = tempdir().unwrap();
    let data_dir = dir.path().join("data");
    fs::create_dir_all(&data_dir).unwrap();
    let recs = records();
    let mut df = df!(
        "datetime" => recs.iter().map(|r| r.datetime.to_string()).collect::<Vec<_>>(),
        "instrument" => recs.iter().map(|r| r.instrument.clone()).collect::<Vec<_>>(),
        "feature_00" => recs.iter().map(|r| r.features[0] as f64).collect::<Vec<_>>(),
        "feature_01" => recs.iter().map(|r| r.features[1] as f64).collect::<Vec<_>>(),
        "feature_02" => recs.iter().map(|r| r.features[2] as f64).collect::<Vec<_>>(),
        "feature_03" => recs.iter().map(|r| r.features[3] as f64).collect::<Vec<_>>(),
        "label" => recs.iter().map(|r| r.label as f64).collect::<Vec<_>>(),
    )
    .unwrap();
    let file = fs::File::create(data_dir.join("part-0.parquet")).unwrap();
    ParquetWriter::new(file).finish(&mut df).unwrap();

    let outdir = dir.path().join("out");
    let pattern = data_dir.join("*.parquet").to_string_lossy().into_owned();
    let cfg = config(&outdir, "MLP", &["--data_path", &pattern]);
    let outcome = Experiment::new(cfg).unwrap().run().unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));
    let info = read_info(&outdir);
    assert!(info["best_score"]["test-IC"].as_f64().is_some());
}

#[test]
fn attention_and_lstm_models_train_through_the_experiment() {
    for model in ["GATs", "LSTM"] {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), model, &["--n_epochs", "2"]);
        let loaders = build_split_loaders(&records(), &cfg, &Device::Cpu).unwrap();

        let RunOutcome::Completed(summary) =
            Experiment::new(cfg).unwrap().run_on(&loaders, &AuxiliaryInputs::default()).unwrap()
        else {
            panic!("{model} run must complete");
        };
        assert_eq!(summary.repetitions, 1, "{model}");
        let info = read_info(dir.path());
        assert_eq!(info["config"]["model_name"], model);
        assert!(info["best_score"].get("test-IC").is_some(), "{model}");
        let log = fs::read_to_string(dir.path().join("e2e_run.log")).unwrap();
        assert!(log.contains("Running 0 Epoch: 1"), "{model}");
    }
}

#[test]
fn same_seed_with_dropout_reproduces_the_run() {
    let run = || {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), "MLP", &["--dropout", "0.5", "--n_epochs", "3", "--repeat", "2"]);
        let loaders = build_split_loaders(&records(), &cfg, &Device::Cpu).unwrap();
        let RunOutcome::Completed(summary) =
            Experiment::new(cfg).unwrap().run_on(&loaders, &AuxiliaryInputs::default()).unwrap()
        else {
            panic!("run must complete");
        };
        let step_losses: Vec<String> = fs::read_to_string(dir.path().join("scalars.jsonl"))
            .unwrap()
            .lines()
            .filter(|l| l.contains("\"tag\":\"Train/StepLoss\""))
            .map(str::to_string)
            .collect();
        (summary, step_losses)
    };
    let (first, first_losses) = run();
    let (second, second_losses) = run();

    let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&first.best_scores), bits(&second.best_scores));
    assert_eq!(first.best_epochs, second.best_epochs);
    assert_eq!(first.ic.mean.to_bits(), second.ic.mean.to_bits());
    assert_eq!(first.rank_ic.mean.to_bits(), second.rank_ic.mean.to_bits());
    assert!(!first_losses.is_empty());
    assert_eq!(first_losses, second_losses);
}

#[test]
fn concept_model_honours_top_k_peers() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), "HIST", &["--K", "3"]);
    assert_eq!(cfg.k, 3);
    let loaders = build_split_loaders(&records(), &cfg, &Device::Cpu).unwrap();
    let concepts = Tensor::new(&[[1f32, 0.0], [1.0, 1.0]], &Device::Cpu).unwrap();
    let aux = AuxiliaryInputs { concepts: Some(concepts), relations: None };

    let outcome = Experiment::new(cfg).unwrap().run_on(&loaders, &aux).unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));
}
