use candle_core::{DType, Module, Tensor};
use candle_nn::{linear, ops, Linear, VarBuilder};

use super::dropout::Dropout;
use super::recurrent::{CellKind, RecurrentEncoder};
use super::traits::{ModelInputs, Predictor};
use super::{cosine_similarity, leaky_relu};
use crate::error::{ForecastError, Result};

const SLOPE: f64 = 0.01;

/// Hidden-concept network.
///
/// A GRU embedding of each stock is decomposed into three parts:
///
/// * shared information carried by predefined concepts (concept embeddings are
///   market-value-weighted averages of their member stocks),
/// * shared information carried by hidden concepts, mined from the residual by
///   stock-to-stock similarity,
/// * the individual remainder.
///
/// Each part contributes a forecast head output; their sum is scored by `fc_out`.
/// Hidden concepts of a stock are drawn from its `top_k` most similar peers.
pub struct Hist {
    encoder: RecurrentEncoder,
    top_k: usize,
    fc_es: Linear,
    fc_es_fore: Linear,
    fc_es_back: Linear,
    fc_is: Linear,
    fc_is_fore: Linear,
    fc_is_back: Linear,
    fc_indi: Linear,
    fc_out: Linear,
}

impl Hist {
    pub fn new(
        d_feat: usize,
        hidden_size: usize,
        num_layers: usize,
        top_k: usize,
        dropout: Dropout,
        vb: VarBuilder,
    ) -> Result<Self> {
        let h = hidden_size;
        Ok(Self {
            encoder: RecurrentEncoder::new(CellKind::Gru, d_feat, h, num_layers, dropout, vb.pp("rnn"))?,
            top_k: top_k.max(1),
            fc_es: linear(h, h, vb.pp("fc_es"))?,
            fc_es_fore: linear(h, h, vb.pp("fc_es_fore"))?,
            fc_es_back: linear(h, h, vb.pp("fc_es_back"))?,
            fc_is: linear(h, h, vb.pp("fc_is"))?,
            fc_is_fore: linear(h, h, vb.pp("fc_is_fore"))?,
            fc_is_back: linear(h, h, vb.pp("fc_is_back"))?,
            fc_indi: linear(h, h, vb.pp("fc_indi"))?,
            fc_out: linear(h, 1, vb.pp("fc_out"))?,
        })
    }

    /// `(C', H)` embeddings of the concepts that have at least one member in the batch.
    fn concept_embeddings(&self, hidden: &Tensor, concepts: &Tensor, market_value: &Tensor) -> Result<Option<Tensor>> {
        let weighted = concepts.broadcast_mul(&market_value.unsqueeze(1)?)?;
        let totals = weighted.sum(0)?;
        let keep: Vec<u32> = totals
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?
            .iter()
            .enumerate()
            .filter(|(_, t)| **t != 0.0)
            .map(|(i, _)| i as u32)
            .collect();
        if keep.is_empty() {
            return Ok(None);
        }
        let keep = Tensor::new(keep.as_slice(), hidden.device())?;
        let weighted = weighted.index_select(&keep, 1)?;
        let totals = totals.index_select(&keep, 0)?.unsqueeze(0)?;
        let share = weighted.broadcast_div(&totals)?;
        Ok(Some(share.t()?.matmul(hidden)?))
    }
}

impl Predictor for Hist {
    fn forward(&self, inputs: &ModelInputs<'_>, train: bool) -> Result<Tensor> {
        let concepts = inputs.concepts.as_ref().ok_or(ForecastError::MissingAuxiliary {
            model: "HIST",
            input: "stock2concept",
        })?;
        let hidden = self.encoder.last_hidden(inputs.features, train)?;
        let n = hidden.dim(0)?;

        // predefined concepts
        let e_shared = match self.concept_embeddings(&hidden, concepts, inputs.market_value)? {
            Some(concept_hidden) => {
                let weights = ops::softmax(&cosine_similarity(&hidden, &concept_hidden)?, 1)?;
                weights.matmul(&concept_hidden)?
            }
            None => hidden.zeros_like()?,
        };
        let e_shared = leaky_relu(&self.fc_es.forward(&e_shared)?, SLOPE)?;
        let output_es = leaky_relu(&self.fc_es_fore.forward(&e_shared)?, SLOPE)?;
        let e_back = leaky_relu(&self.fc_es_back.forward(&e_shared)?, SLOPE)?;

        // hidden concepts
        let residual = (&hidden - e_back)?;
        let i_shared = if n > 1 {
            let sim = cosine_similarity(&residual, &residual)?;
            let sim = (&sim + top_k_mask(&sim, self.top_k)?)?;
            ops::softmax(&sim, 1)?.matmul(&residual)?
        } else {
            residual.zeros_like()?
        };
        let i_shared = leaky_relu(&self.fc_is.forward(&i_shared)?, SLOPE)?;
        let output_is = leaky_relu(&self.fc_is_fore.forward(&i_shared)?, SLOPE)?;
        let i_back = leaky_relu(&self.fc_is_back.forward(&i_shared)?, SLOPE)?;

        // individual information
        let individual = (&residual - i_back)?;
        let output_indi = leaky_relu(&self.fc_indi.forward(&individual)?, SLOPE)?;

        let all = ((output_es + output_is)? + output_indi)?;
        Ok(self.fc_out.forward(&all)?.squeeze(1)?)
    }
}

/// Additive `(N, N)` mask keeping, per row, the `k` most similar other stocks.
/// The diagonal and everything outside the top `k` get `-1e9`.
fn top_k_mask(sim: &Tensor, k: usize) -> Result<Tensor> {
    let rows = sim.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let n = rows.len();
    let k = k.min(n.saturating_sub(1));
    let mut mask = vec![-1e9f32; n * n];
    for (i, row) in rows.iter().enumerate() {
        let mut peers: Vec<usize> = (0..n).filter(|j| *j != i).collect();
        peers.sort_by(|a, b| row[*b].total_cmp(&row[*a]));
        for j in peers.into_iter().take(k) {
            mask[i * n + j] = 0.0;
        }
    }
    Ok(Tensor::from_vec(mask, (n, n), sim.device())?.to_dtype(sim.dtype())?)
}
