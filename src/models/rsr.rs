use candle_core::{DType, Module, Tensor};
use candle_nn::{linear, ops, Linear, VarBuilder};

use super::dropout::Dropout;
use super::recurrent::{CellKind, RecurrentEncoder};
use super::traits::{ModelInputs, Predictor};
use super::{eye, leaky_relu};
use crate::error::{ForecastError, Result};

/// Relational stock ranking: each stock aggregates the embeddings of the stocks
/// it is explicitly related to, weighted by a learned function of both
/// embeddings and the relation vector.
pub struct Rsr {
    encoder: RecurrentEncoder,
    w_src: Tensor,
    w_dst: Tensor,
    w_rel: Tensor,
    b: Tensor,
    fc: Linear,
    fc_out: Linear,
}

impl Rsr {
    pub fn new(
        d_feat: usize,
        hidden_size: usize,
        num_layers: usize,
        dropout: Dropout,
        num_relation: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            encoder: RecurrentEncoder::new(CellKind::Gru, d_feat, hidden_size, num_layers, dropout, vb.pp("rnn"))?,
            w_src: vb.get((hidden_size, 1), "w_src")?,
            w_dst: vb.get((hidden_size, 1), "w_dst")?,
            w_rel: vb.get((num_relation, 1), "w_rel")?,
            b: vb.get(1, "b")?,
            fc: linear(hidden_size * 2, hidden_size, vb.pp("fc"))?,
            fc_out: linear(hidden_size, 1, vb.pp("fc_out"))?,
        })
    }
}

impl Predictor for Rsr {
    fn forward(&self, inputs: &ModelInputs<'_>, train: bool) -> Result<Tensor> {
        let relations = inputs.relations.as_ref().ok_or(ForecastError::MissingAuxiliary {
            model: "RSR",
            input: "stock2stock relation",
        })?;
        let hidden = self.encoder.last_hidden(inputs.features, train)?;
        let (n, _, r) = relations.dims3()?;

        // w · [h_i || h_j || r_ij] + b, split into its three linear parts.
        let src = hidden.matmul(&self.w_src)?;
        let dst = hidden.matmul(&self.w_dst)?.t()?;
        let rel = relations.reshape((n * n, r))?.matmul(&self.w_rel)?.reshape((n, n))?;
        let scores = src.broadcast_add(&dst)?.add(&rel)?.broadcast_add(&self.b)?;
        let scores = leaky_relu(&scores, 0.01)?;

        // only related pairs (and the stock itself) may exchange information
        let related = relations.abs()?.sum(2)?.gt(0.0)?.to_dtype(DType::F32)?;
        let mask = (related + eye(n, hidden.device())?)?.gt(0.0)?;
        let blocked = Tensor::full(-1e9f32, (n, n), hidden.device())?;
        let weights = ops::softmax(&mask.where_cond(&scores, &blocked)?, 1)?;

        let aggregated = weights.matmul(&hidden)?;
        let hidden = Tensor::cat(&[&hidden, &aggregated], 1)?;
        let hidden = leaky_relu(&self.fc.forward(&hidden)?, 0.01)?;
        Ok(self.fc_out.forward(&hidden)?.squeeze(1)?)
    }
}
