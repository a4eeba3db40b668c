use std::collections::HashMap;
use std::path::Path;

use candle_core::Tensor;
use candle_nn::VarMap;

use crate::error::{ForecastError, Result};

/// Value copy of every named parameter of a model.
#[derive(Debug, Clone)]
pub struct ParamSnapshot {
    tensors: HashMap<String, Tensor>,
}

impl ParamSnapshot {
    pub fn capture(varmap: &VarMap) -> Result<Self> {
        let data = lock(varmap)?;
        let mut tensors = HashMap::with_capacity(data.len());
        for (name, var) in data.iter() {
            tensors.insert(name.clone(), var.as_tensor().copy()?);
        }
        Ok(Self { tensors })
    }

    /// Writes the snapshot back into the live parameters.
    pub fn restore(&self, varmap: &VarMap) -> Result<()> {
        let data = lock(varmap)?;
        for (name, tensor) in &self.tensors {
            let var = data.get(name).ok_or_else(|| {
                ForecastError::InvalidInput(format!("snapshot has unknown parameter `{name}`"))
            })?;
            var.set(tensor)?;
        }
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        candle_core::safetensors::save(&self.tensors, path)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

fn lock(varmap: &VarMap) -> Result<std::sync::MutexGuard<'_, HashMap<String, candle_core::Var>>> {
    varmap
        .data()
        .lock()
        .map_err(|_| ForecastError::InvalidInput("parameter store lock poisoned".to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Improved,
    Continue,
    Stop,
}

/// Best-validation tracking with patience-based early stopping.
#[derive(Debug)]
pub struct CheckpointSelector {
    best_score: f64,
    best_epoch: usize,
    stop_round: usize,
    patience: usize,
    best_params: ParamSnapshot,
}

impl CheckpointSelector {
    /// `initial` is kept as the best parameters until some epoch improves on -inf.
    pub fn new(initial: ParamSnapshot, patience: usize) -> Self {
        Self {
            best_score: f64::NEG_INFINITY,
            best_epoch: 0,
            stop_round: 0,
            patience,
            best_params: initial,
        }
    }

    /// Only a strictly greater score replaces the best, so ties keep the earlier epoch.
    pub fn observe(&mut self, epoch: usize, score: f64, params: ParamSnapshot) -> Decision {
        if score > self.best_score {
            self.best_score = score;
            self.best_epoch = epoch;
            self.stop_round = 0;
            self.best_params = params;
            Decision::Improved
        } else {
            self.stop_round += 1;
            if self.stop_round >= self.patience {
                Decision::Stop
            } else {
                Decision::Continue
            }
        }
    }

    pub fn best_score(&self) -> f64 {
        self.best_score
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }

    pub fn stop_round(&self) -> usize {
        self.stop_round
    }

    pub fn best_params(&self) -> &ParamSnapshot {
        &self.best_params
    }

    pub fn into_best_params(self) -> ParamSnapshot {
        self.best_params
    }
}
