use candle_core::{DType, Tensor};
use candle_nn::ops;

use crate::error::{ForecastError, Result};

const EPS: f64 = 1e-12;

/// Training objective selected by `--loss_type`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossKind {
    Mse,
    Ic,
    PairWise { alpha: f64 },
    Ndcg,
    ApproxNdcg,
}

impl LossKind {
    pub fn from_config(loss_type: &str, ranking_alpha: f64) -> Result<Self> {
        match loss_type.to_ascii_lowercase().as_str() {
            "" | "mse" => Ok(Self::Mse),
            "ic" => Ok(Self::Ic),
            "pair_wise" => Ok(Self::PairWise { alpha: ranking_alpha }),
            "ndcg" => Ok(Self::Ndcg),
            "appndcg" => Ok(Self::ApproxNdcg),
            _ => Err(ForecastError::UnknownLossType(loss_type.to_string())),
        }
    }

    /// Objective reported during evaluation. `ic` and `ndcg` only shape
    /// training; evaluation falls back to mse for them.
    pub fn for_evaluation(self) -> Self {
        match self {
            Self::PairWise { .. } | Self::ApproxNdcg => self,
            _ => Self::Mse,
        }
    }

    /// `pred` and `label` are 1-D and already restricted to rows with a finite label.
    pub fn compute(&self, pred: &Tensor, label: &Tensor) -> Result<Tensor> {
        match self {
            Self::Mse => mse(pred, label),
            Self::Ic => ic_loss(pred, label),
            Self::PairWise { alpha } => pair_wise_loss(pred, label, *alpha),
            Self::Ndcg => listnet_loss(pred, label),
            Self::ApproxNdcg => approx_ndcg_loss(pred, label),
        }
    }
}

pub fn mse(pred: &Tensor, label: &Tensor) -> Result<Tensor> {
    Ok((pred - label)?.sqr()?.mean_all()?)
}

/// Negative Pearson correlation between predictions and labels.
pub fn ic_loss(pred: &Tensor, label: &Tensor) -> Result<Tensor> {
    let pc = pred.broadcast_sub(&pred.mean_all()?)?;
    let lc = label.broadcast_sub(&label.mean_all()?)?;
    let num = (&pc * &lc)?.sum_all()?;
    let den = ((pc.sqr()?.sum_all()?.sqrt()? * lc.sqr()?.sum_all()?.sqrt()?)? + EPS)?;
    Ok((num / den)?.neg()?)
}

pub fn pair_wise_loss(pred: &Tensor, label: &Tensor, alpha: f64) -> Result<Tensor> {
    let pred_diff = pairwise_diff(pred)?;
    let label_diff = pairwise_diff(label)?;
    let pair_wise = (pred_diff * label_diff)?.neg()?.relu()?.mean_all()?;
    Ok((mse(pred, label)? + (pair_wise * alpha)?)?)
}

/// ListNet cross entropy between the label and score distributions of one day.
pub fn listnet_loss(pred: &Tensor, label: &Tensor) -> Result<Tensor> {
    let target = ops::softmax(label, 0)?;
    let log_p = ops::log_softmax(pred, 0)?;
    Ok((target * log_p)?.sum_all()?.neg()?)
}

/// Smooth NDCG surrogate: ranks are approximated with pairwise sigmoids.
pub fn approx_ndcg_loss(pred: &Tensor, label: &Tensor) -> Result<Tensor> {
    let labels = label.to_dtype(DType::F64)?.to_vec1::<f64>()?;
    let (min, max) = labels
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if labels.len() < 2 || max - min <= EPS {
        return Ok(pred.sum_all()?.zeros_like()?);
    }
    let gains: Vec<f64> = labels
        .iter()
        .map(|v| 2f64.powf((v - min) / (max - min)) - 1.0)
        .collect();

    let mut ideal = gains.clone();
    ideal.sort_by(|a, b| b.total_cmp(a));
    let idcg: f64 = ideal
        .iter()
        .enumerate()
        .map(|(i, g)| g / ((i + 2) as f64).log2())
        .sum();

    // [i, j] = p_j - p_i; the diagonal contributes sigmoid(0) = 0.5.
    let diff = pred.unsqueeze(0)?.broadcast_sub(&pred.unsqueeze(1)?)?;
    let approx_rank = (ops::sigmoid(&diff)?.sum(1)? + 0.5)?;
    let discount = ((approx_rank + 1.0)?.log()? / std::f64::consts::LN_2)?;
    let gains = Tensor::new(gains.as_slice(), pred.device())?.to_dtype(pred.dtype())?;
    let dcg = (gains / discount)?.sum_all()?;
    Ok((dcg / idcg)?.neg()?)
}

fn pairwise_diff(x: &Tensor) -> Result<Tensor> {
    Ok(x.unsqueeze(1)?.broadcast_sub(&x.unsqueeze(0)?)?)
}
