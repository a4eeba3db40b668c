use candle_core::{Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use super::dropout::Dropout;
use super::traits::{ModelInputs, Predictor};
use crate::error::Result;

/// Feed-forward baseline over the flattened feature row.
pub struct Mlp {
    layers: Vec<Linear>,
    dropout: Dropout,
    fc_out: Linear,
}

impl Mlp {
    pub fn new(d_in: usize, hidden_size: usize, num_layers: usize, dropout: Dropout, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let in_dim = if i == 0 { d_in } else { hidden_size };
            layers.push(linear(in_dim, hidden_size, vb.pp(format!("fc{i}")))?);
        }
        Ok(Self {
            layers,
            dropout,
            fc_out: linear(hidden_size, 1, vb.pp("fc_out"))?,
        })
    }
}

impl Predictor for Mlp {
    fn forward(&self, inputs: &ModelInputs<'_>, train: bool) -> Result<Tensor> {
        let mut h = inputs.features.clone();
        for layer in &self.layers {
            h = self.dropout.forward(&h, train)?;
            h = layer.forward(&h)?.relu()?;
        }
        Ok(self.fc_out.forward(&h)?.squeeze(1)?)
    }
}
