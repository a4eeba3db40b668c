pub mod dropout;
pub mod gats;
pub mod hist;
pub mod mlp;
pub mod recurrent;
pub mod rsr;
pub mod traits;

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::Rng;

use crate::config::RunConfig;
use crate::data_loader::{AuxiliaryInputs, Batch};
use crate::error::{ForecastError, Result};

pub use dropout::{Dropout, DropoutRng};
pub use gats::Gats;
pub use hist::Hist;
pub use mlp::Mlp;
pub use recurrent::{CellKind, RecurrentEncoder, RecurrentModel};
pub use rsr::Rsr;
pub use traits::{ModelInputs, Predictor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Mlp,
    Lstm,
    Gru,
    Gats,
    Hist,
    Rsr,
}

impl ModelKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mlp => "MLP",
            Self::Lstm => "LSTM",
            Self::Gru => "GRU",
            Self::Gats => "GATS",
            Self::Hist => "HIST",
            Self::Rsr => "RSR",
        }
    }

    /// HIST reads the stock-to-concept matrix and market values.
    pub fn needs_concepts(&self) -> bool {
        matches!(self, Self::Hist)
    }

    /// RSR reads the stock-to-stock relation tensor.
    pub fn needs_relations(&self) -> bool {
        matches!(self, Self::Rsr)
    }
}

impl FromStr for ModelKind {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MLP" => Ok(Self::Mlp),
            "LSTM" => Ok(Self::Lstm),
            "GRU" => Ok(Self::Gru),
            "GATS" => Ok(Self::Gats),
            "HIST" => Ok(Self::Hist),
            "RSR" => Ok(Self::Rsr),
            _ => Err(ForecastError::UnknownModel(s.to_string())),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The closed set of supported forecasters.
pub enum ForecastModel {
    Mlp(Mlp),
    Lstm(RecurrentModel),
    Gru(RecurrentModel),
    Gats(Gats),
    Hist(Hist),
    Rsr(Rsr),
}

impl ForecastModel {
    /// Builds the network for `kind`, registering its parameters under `vb`.
    /// RSR needs the relation count of the loaded relation tensor. Every
    /// dropout layer draws its masks from `dropout_rng`.
    pub fn new(
        kind: ModelKind,
        config: &RunConfig,
        num_relation: Option<usize>,
        dropout_rng: &DropoutRng,
        vb: VarBuilder,
    ) -> Result<Self> {
        let d_feat = config.d_feat;
        let hidden = config.hidden_size;
        let layers = config.num_layers;
        let dropout = Dropout::new(config.dropout, dropout_rng);
        Ok(match kind {
            ModelKind::Mlp => Self::Mlp(Mlp::new(d_feat * config.seq_len, hidden, layers, dropout, vb)?),
            ModelKind::Lstm => {
                Self::Lstm(RecurrentModel::new(CellKind::Lstm, d_feat, hidden, layers, dropout, vb)?)
            }
            ModelKind::Gru => {
                Self::Gru(RecurrentModel::new(CellKind::Gru, d_feat, hidden, layers, dropout, vb)?)
            }
            ModelKind::Gats => Self::Gats(Gats::new(d_feat, hidden, layers, dropout, vb)?),
            ModelKind::Hist => Self::Hist(Hist::new(d_feat, hidden, layers, config.k, dropout, vb)?),
            ModelKind::Rsr => {
                let num_relation = num_relation.ok_or(ForecastError::MissingAuxiliary {
                    model: "RSR",
                    input: "stock2stock relation",
                })?;
                Self::Rsr(Rsr::new(d_feat, hidden, layers, dropout, num_relation, vb)?)
            }
        })
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Mlp(_) => ModelKind::Mlp,
            Self::Lstm(_) => ModelKind::Lstm,
            Self::Gru(_) => ModelKind::Gru,
            Self::Gats(_) => ModelKind::Gats,
            Self::Hist(_) => ModelKind::Hist,
            Self::Rsr(_) => ModelKind::Rsr,
        }
    }

    /// Routes the batch to the variant's call signature: HIST gets the concept
    /// rows of the batch's stocks, RSR the relation block among them.
    pub fn predict(&self, batch: &Batch, aux: &AuxiliaryInputs, train: bool) -> Result<Tensor> {
        let kind = self.kind();
        let concepts = if kind.needs_concepts() {
            let matrix = aux.concepts.as_ref().ok_or(ForecastError::MissingAuxiliary {
                model: kind.name(),
                input: "stock2concept",
            })?;
            Some(matrix.index_select(&batch.stock_index, 0)?)
        } else {
            None
        };
        let relations = if kind.needs_relations() {
            let matrix = aux.relations.as_ref().ok_or(ForecastError::MissingAuxiliary {
                model: kind.name(),
                input: "stock2stock relation",
            })?;
            Some(
                matrix
                    .index_select(&batch.stock_index, 0)?
                    .index_select(&batch.stock_index, 1)?,
            )
        } else {
            None
        };
        let inputs = ModelInputs {
            features: &batch.feature,
            market_value: &batch.market_value,
            concepts,
            relations,
        };
        self.as_predictor().forward(&inputs, train)
    }

    fn as_predictor(&self) -> &dyn Predictor {
        match self {
            Self::Mlp(m) => m,
            Self::Lstm(m) | Self::Gru(m) => m,
            Self::Gats(m) => m,
            Self::Hist(m) => m,
            Self::Rsr(m) => m,
        }
    }
}

/// Redraws every parameter from `rng`, uniform in ±1/sqrt(fan_in), visiting
/// parameters in name order so a given seed always yields the same weights.
pub fn initialize_params(varmap: &VarMap, rng: &mut StdRng) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| ForecastError::InvalidInput("parameter store lock poisoned".to_string()))?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    for name in names {
        let var = &data[name];
        let dims = var.dims();
        let fan_in: usize = match dims {
            [] => 1,
            [n] => *n,
            [_, rest @ ..] => rest.iter().product(),
        };
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        let values: Vec<f32> = (0..var.elem_count()).map(|_| rng.gen_range(-bound..bound)).collect();
        let fresh = Tensor::from_vec(values, var.shape(), var.device())?.to_dtype(var.dtype())?;
        var.set(&fresh)?;
    }
    Ok(())
}

/// `(n, n)` identity matrix.
pub(crate) fn eye(n: usize, device: &Device) -> Result<Tensor> {
    let values: Vec<f32> = (0..n * n).map(|i| if i % (n + 1) == 0 { 1.0 } else { 0.0 }).collect();
    Ok(Tensor::from_vec(values, (n, n), device)?)
}

pub(crate) fn leaky_relu(x: &Tensor, slope: f64) -> Result<Tensor> {
    Ok(x.maximum(&(x * slope)?)?)
}

/// Row-wise cosine similarity between `(N, H)` and `(M, H)`.
pub(crate) fn cosine_similarity(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let a_norm = a.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    let b_norm = b.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    let dot = a.matmul(&b.t()?)?;
    let den = (a_norm.matmul(&b_norm.t()?)? + 1e-6)?;
    Ok((dot / den)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use chrono::NaiveDate;
    use rand::SeedableRng;

    use crate::data_loader::{DailyDataset, StockRecord};

    fn config(model: &str) -> RunConfig {
        RunConfig::from_args([
            "ranking-forecast",
            "--model_name",
            model,
            "--d_feat",
            "2",
            "--seq_len",
            "3",
            "--hidden_size",
            "4",
            "--num_layers",
            "2",
        ])
        .unwrap()
    }

    fn batch(n: usize) -> Batch {
        let records = (0..n)
            .map(|i| StockRecord {
                datetime: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                instrument: format!("S{i}"),
                features: (0..6).map(|j| (i * 6 + j) as f32 / 10.0).collect(),
                label: i as f32,
                market_value: 1.0 + i as f32,
                stock_index: i as u32,
            })
            .collect();
        let ds = DailyDataset::from_records(records, -1, &Device::Cpu).unwrap();
        ds.get(0..n).unwrap()
    }

    fn aux(n: usize) -> AuxiliaryInputs {
        let concepts: Vec<f32> = (0..n * 2).map(|i| (i % 2) as f32).collect();
        let relations: Vec<f32> = (0..n * n * 3).map(|i| (i % 3 == 0) as u8 as f32).collect();
        AuxiliaryInputs {
            concepts: Some(Tensor::from_vec(concepts, (n, 2), &Device::Cpu).unwrap()),
            relations: Some(Tensor::from_vec(relations, (n, n, 3), &Device::Cpu).unwrap()),
        }
    }

    #[test]
    fn model_names_are_case_insensitive() {
        assert_eq!("mlp".parse::<ModelKind>().unwrap(), ModelKind::Mlp);
        assert_eq!("GaTs".parse::<ModelKind>().unwrap(), ModelKind::Gats);
        assert!(matches!("PatchTST".parse::<ModelKind>(), Err(ForecastError::UnknownModel(_))));
    }

    #[test]
    fn every_variant_scores_each_stock() {
        for name in ["MLP", "LSTM", "GRU", "GATs", "HIST", "RSR"] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let cfg = config(name);
            let aux = aux(4);
            let rng = DropoutRng::seed_from_u64(0);
            let model = ForecastModel::new(cfg.model_kind().unwrap(), &cfg, aux.num_relation(), &rng, vb).unwrap();
            let pred = model.predict(&batch(4), &aux, false).unwrap();
            assert_eq!(pred.dims(), &[4], "{name}");
            let values = pred.to_vec1::<f32>().unwrap();
            assert!(values.iter().all(|v| v.is_finite()), "{name}");
        }
    }

    #[test]
    fn relation_model_requires_relation_tensor() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = config("RSR");
        let err = ForecastModel::new(ModelKind::Rsr, &cfg, None, &DropoutRng::seed_from_u64(0), vb)
            .err()
            .unwrap();
        assert!(matches!(err, ForecastError::MissingAuxiliary { .. }));
    }

    #[test]
    fn concept_model_requires_concept_matrix() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = config("HIST");
        let model = ForecastModel::new(ModelKind::Hist, &cfg, None, &DropoutRng::seed_from_u64(0), vb).unwrap();
        let err = model.predict(&batch(3), &AuxiliaryInputs::default(), false).unwrap_err();
        assert!(matches!(err, ForecastError::MissingAuxiliary { .. }));
    }

    #[test]
    fn seeded_initialization_is_reproducible() {
        let weights = |seed: u64| {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let cfg = config("MLP");
            let _model = ForecastModel::new(ModelKind::Mlp, &cfg, None, &DropoutRng::seed_from_u64(0), vb).unwrap();
            initialize_params(&varmap, &mut StdRng::seed_from_u64(seed)).unwrap();
            let data = varmap.data().lock().unwrap();
            let mut names: Vec<_> = data.keys().cloned().collect();
            names.sort();
            names
                .iter()
                .flat_map(|n| data[n].flatten_all().unwrap().to_vec1::<f32>().unwrap())
                .collect::<Vec<f32>>()
        };
        assert_eq!(weights(7), weights(7));
        assert_ne!(weights(7), weights(8));
    }
}
