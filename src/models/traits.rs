use candle_core::Tensor;

use crate::error::Result;

/// Everything a model call may read for one batch.
///
/// `concepts` is the `(N, C)` membership sub-matrix of the batch's stocks and
/// `relations` the `(N, N, R)` relation sub-tensor; both are `None` for
/// models that never look at them.
pub struct ModelInputs<'a> {
    pub features: &'a Tensor,
    pub market_value: &'a Tensor,
    pub concepts: Option<Tensor>,
    pub relations: Option<Tensor>,
}

/// A forecaster maps a cross-section of stocks to one score per stock.
pub trait Predictor {
    /// Returns a 1-D tensor with one score per row of `inputs.features`.
    /// `train` enables dropout.
    fn forward(&self, inputs: &ModelInputs<'_>, train: bool) -> Result<Tensor>;
}
