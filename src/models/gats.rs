use candle_core::{Module, Tensor};
use candle_nn::{linear, ops, Linear, VarBuilder};

use super::dropout::Dropout;
use super::leaky_relu;
use super::recurrent::{CellKind, RecurrentEncoder};
use super::traits::{ModelInputs, Predictor};
use crate::error::Result;

/// GRU encoder followed by one graph-attention hop over the whole cross-section.
pub struct Gats {
    encoder: RecurrentEncoder,
    transformation: Linear,
    a: Tensor,
    fc: Linear,
    fc_out: Linear,
    dropout: Dropout,
    hidden_size: usize,
}

impl Gats {
    pub fn new(d_feat: usize, hidden_size: usize, num_layers: usize, dropout: Dropout, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            encoder: RecurrentEncoder::new(CellKind::Gru, d_feat, hidden_size, num_layers, dropout.clone(), vb.pp("rnn"))?,
            transformation: linear(hidden_size, hidden_size, vb.pp("transformation"))?,
            a: vb.get((2 * hidden_size, 1), "a")?,
            fc: linear(hidden_size, hidden_size, vb.pp("fc"))?,
            fc_out: linear(hidden_size, 1, vb.pp("fc_out"))?,
            dropout,
            hidden_size,
        })
    }

    /// Attention weights `(N, N)`: row i attends over every stock j.
    fn attention(&self, hidden: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.transformation.forward(hidden)?;
        let src = x.matmul(&self.a.narrow(0, 0, self.hidden_size)?)?;
        let dst = x.matmul(&self.a.narrow(0, self.hidden_size, self.hidden_size)?)?;
        let scores = leaky_relu(&src.broadcast_add(&dst.t()?)?, 0.2)?;
        let weights = ops::softmax(&scores, 1)?;
        self.dropout.forward(&weights, train)
    }
}

impl Predictor for Gats {
    fn forward(&self, inputs: &ModelInputs<'_>, train: bool) -> Result<Tensor> {
        let hidden = self.encoder.last_hidden(inputs.features, train)?;
        let att = self.attention(&hidden, train)?;
        let hidden = (&hidden + att.matmul(&hidden)?)?;
        let hidden = leaky_relu(&self.fc.forward(&hidden)?, 0.01)?;
        Ok(self.fc_out.forward(&hidden)?.squeeze(1)?)
    }
}
