use candle_core::{Module, Tensor};
use candle_nn::rnn::{gru, lstm, GRUConfig, LSTMConfig, GRU, LSTM, RNN};
use candle_nn::{linear, Linear, VarBuilder};

use super::dropout::Dropout;
use super::traits::{ModelInputs, Predictor};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Lstm,
    Gru,
}

enum Layer {
    Lstm(LSTM),
    Gru(GRU),
}

/// Stacked recurrent encoder over `(N, d_feat * T)` feature rows.
///
/// Each row holds `d_feat` consecutive blocks of `T` values, so the input
/// is reshaped to `(N, d_feat, T)` and transposed to a `(N, T, d_feat)` sequence.
pub struct RecurrentEncoder {
    layers: Vec<Layer>,
    d_feat: usize,
    dropout: Dropout,
}

impl RecurrentEncoder {
    pub fn new(
        cell: CellKind,
        d_feat: usize,
        hidden_size: usize,
        num_layers: usize,
        dropout: Dropout,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let in_dim = if i == 0 { d_feat } else { hidden_size };
            let vb = vb.pp(format!("layer{i}"));
            layers.push(match cell {
                CellKind::Lstm => Layer::Lstm(lstm(in_dim, hidden_size, LSTMConfig::default(), vb)?),
                CellKind::Gru => Layer::Gru(gru(in_dim, hidden_size, GRUConfig::default(), vb)?),
            });
        }
        Ok(Self { layers, d_feat, dropout })
    }

    /// Hidden states for every time step, `(N, T, hidden)`.
    pub fn forward_seq(&self, features: &Tensor, train: bool) -> Result<Tensor> {
        let (n, width) = features.dims2()?;
        let steps = width / self.d_feat;
        let mut seq = features
            .reshape((n, self.d_feat, steps))?
            .transpose(1, 2)?
            .contiguous()?;
        for (i, layer) in self.layers.iter().enumerate() {
            if i > 0 {
                seq = self.dropout.forward(&seq, train)?;
            }
            // one hidden state per step, stacked back along the time axis
            let hs: Vec<Tensor> = match layer {
                Layer::Lstm(cell) => cell.seq(&seq)?.into_iter().map(|s| s.h).collect(),
                Layer::Gru(cell) => cell.seq(&seq)?.into_iter().map(|s| s.h).collect(),
            };
            seq = Tensor::stack(&hs, 1)?;
        }
        Ok(seq)
    }

    /// Hidden state after the last time step, `(N, hidden)`.
    pub fn last_hidden(&self, features: &Tensor, train: bool) -> Result<Tensor> {
        let seq = self.forward_seq(features, train)?;
        let steps = seq.dim(1)?;
        Ok(seq.narrow(1, steps - 1, 1)?.squeeze(1)?)
    }
}

/// Plain LSTM / GRU forecaster: last hidden state through a linear head.
pub struct RecurrentModel {
    encoder: RecurrentEncoder,
    fc_out: Linear,
}

impl RecurrentModel {
    pub fn new(
        cell: CellKind,
        d_feat: usize,
        hidden_size: usize,
        num_layers: usize,
        dropout: Dropout,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            encoder: RecurrentEncoder::new(cell, d_feat, hidden_size, num_layers, dropout, vb.pp("rnn"))?,
            fc_out: linear(hidden_size, 1, vb.pp("fc_out"))?,
        })
    }
}

impl Predictor for RecurrentModel {
    fn forward(&self, inputs: &ModelInputs<'_>, train: bool) -> Result<Tensor> {
        let hidden = self.encoder.last_hidden(inputs.features, train)?;
        Ok(self.fc_out.forward(&hidden)?.squeeze(1)?)
    }
}
