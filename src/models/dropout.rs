use std::cell::RefCell;
use std::rc::Rc;

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{ForecastError, Result};

/// Random stream shared by every dropout layer of one model.
#[derive(Debug, Clone)]
pub struct DropoutRng(Rc<RefCell<StdRng>>);

impl DropoutRng {
    pub fn seed_from_u64(seed: u64) -> Self {
        Self(Rc::new(RefCell::new(StdRng::seed_from_u64(seed))))
    }

    /// Forks a stream off `rng`, so the model's masks follow the run seed.
    pub fn fork(rng: &mut StdRng) -> Self {
        Self::seed_from_u64(rng.gen())
    }
}

/// Inverted dropout whose masks come from a [`DropoutRng`].
#[derive(Debug, Clone)]
pub struct Dropout {
    p: f32,
    rng: DropoutRng,
}

impl Dropout {
    pub fn new(p: f32, rng: &DropoutRng) -> Self {
        Self { p, rng: rng.clone() }
    }

    /// Identity outside training; otherwise zeroes each element with
    /// probability `p` and scales the survivors by `1 / (1 - p)`.
    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.p <= 0.0 {
            return Ok(xs.clone());
        }
        if self.p >= 1.0 {
            return Ok(xs.zeros_like()?);
        }
        let keep = 1.0 - self.p;
        let scale = 1.0 / keep;
        let mask: Vec<f32> = {
            let mut rng = self
                .rng
                .0
                .try_borrow_mut()
                .map_err(|_| ForecastError::InvalidInput("dropout stream already in use".to_string()))?;
            (0..xs.elem_count())
                .map(|_| if rng.gen::<f32>() < keep { scale } else { 0.0 })
                .collect()
        };
        let mask = Tensor::from_vec(mask, xs.shape(), xs.device())?.to_dtype(xs.dtype())?;
        Ok(xs.mul(&mask)?)
    }
}
