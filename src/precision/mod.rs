//! Precision modes and the precision plugin
//!
//! The plugin owns the loss scaler (fp16-mixed only) and tracks which
//! gradients have already been unscaled this step, so clipping can request
//! unscaling any number of times, for any parameter groups, and each
//! gradient is divided exactly once.

pub mod grad_scaler;

pub use grad_scaler::GradScaler;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{ReduceOps, ScalarOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::TensorId;
use serde::{Deserialize, Serialize};

/// Numeric precision of the training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Precision {
    /// Full f32 compute and gradients.
    #[default]
    #[serde(rename = "32-true", alias = "32")]
    F32True,
    /// bf16 compute, f32 master weights; no loss scaling.
    #[serde(rename = "bf16-mixed")]
    Bf16Mixed,
    /// f16 compute, f32 master weights, dynamic loss scaling.
    #[serde(rename = "16-mixed", alias = "16")]
    F16Mixed,
}

impl Precision {
    /// Dtype the forward/backward pass runs in.
    pub fn compute_dtype(&self) -> DType {
        match self {
            Precision::F32True => DType::F32,
            Precision::Bf16Mixed => DType::BF16,
            Precision::F16Mixed => DType::F16,
        }
    }

    /// Dtype of the master gradients that clipping operates on.
    pub fn grad_dtype(&self) -> DType {
        DType::F32
    }

    pub fn uses_loss_scaling(&self) -> bool {
        matches!(self, Precision::F16Mixed)
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Precision::F32True => "32-true",
            Precision::Bf16Mixed => "bf16-mixed",
            Precision::F16Mixed => "16-mixed",
        };
        f.write_str(name)
    }
}

impl FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "32-true" | "32" => Ok(Precision::F32True),
            "bf16-mixed" => Ok(Precision::Bf16Mixed),
            "16-mixed" | "16" => Ok(Precision::F16Mixed),
            other => Err(Error::ConfigError {
                reason: format!(
                    "unknown precision '{other}', expected one of '32-true', 'bf16-mixed', '16-mixed'"
                ),
            }),
        }
    }
}

/// Per-run precision state consulted before every clip.
#[derive(Debug, Clone)]
pub struct PrecisionPlugin {
    precision: Precision,
    scaler: Option<GradScaler>,
    unscaled: HashSet<TensorId>,
    found_inf: bool,
}

impl PrecisionPlugin {
    pub fn new(precision: Precision) -> Self {
        let scaler = precision
            .uses_loss_scaling()
            .then(GradScaler::default_fp16);
        Self {
            precision,
            scaler,
            unscaled: HashSet::new(),
            found_inf: false,
        }
    }

    /// Replace the default loss scaler (fp16-mixed only).
    pub fn with_grad_scaler(mut self, scaler: GradScaler) -> Result<Self> {
        if !self.precision.uses_loss_scaling() {
            return Err(Error::ConfigError {
                reason: format!("precision '{}' does not use loss scaling", self.precision),
            });
        }
        self.scaler = Some(scaler);
        Ok(self)
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn grad_scaler(&self) -> Option<&GradScaler> {
        self.scaler.as_ref()
    }

    /// Multiply the loss by the current loss scale (identity without a scaler).
    pub fn scale_loss(&self, loss: f64) -> f64 {
        match &self.scaler {
            Some(scaler) => scaler.scale_loss(loss),
            None => loss,
        }
    }

    /// Whether the gradient of `id` was already unscaled this step.
    pub fn is_unscaled(&self, id: TensorId) -> bool {
        self.unscaled.contains(&id)
    }

    /// Whether unscaling this step found NaN/Inf gradients.
    pub fn found_inf(&self) -> bool {
        self.found_inf
    }

    /// Fail unless every present gradient of `parameters` is in the master
    /// gradient dtype.
    pub fn check_gradients<R: Runtime<DType = DType>>(
        &self,
        parameters: &[TensorId],
        grads: &GradStore<R>,
    ) -> Result<()> {
        let expected = self.precision.grad_dtype();
        for &id in parameters {
            let Some(grad) = grads.get(id) else {
                continue;
            };
            if grad.dtype() != expected {
                return Err(Error::DTypeMismatch {
                    expected,
                    got: grad.dtype(),
                });
            }
        }
        Ok(())
    }

    /// Unscale the loss-scaled gradients of `parameters`, each at most once
    /// per optimizer step.
    ///
    /// Gradients already unscaled this step are left alone; no-op without a
    /// loss scaler. Returns whether NaN/Inf were found in any gradient
    /// unscaled so far this step.
    pub fn unscale_gradients<R, C>(
        &mut self,
        client: &C,
        parameters: &[TensorId],
        grads: &mut GradStore<R>,
    ) -> Result<bool>
    where
        R: Runtime<DType = DType>,
        C: RuntimeClient<R> + ScalarOps<R> + UnaryOps<R> + ReduceOps<R>,
    {
        let Some(scaler) = &self.scaler else {
            return Ok(false);
        };
        let pending: Vec<TensorId> = parameters
            .iter()
            .copied()
            .filter(|id| !self.unscaled.contains(id) && grads.get(*id).is_some())
            .collect();
        if pending.is_empty() {
            return Ok(self.found_inf);
        }

        self.found_inf |= scaler.unscale_grads(client, &pending, grads)?;
        self.unscaled.extend(pending);
        Ok(self.found_inf)
    }

    /// Finish the optimizer step: update the loss scale and reset per-step state.
    ///
    /// Returns `true` if the step overflowed and its optimizer update should
    /// be skipped.
    pub fn update(&mut self) -> bool {
        let overflow = self.found_inf;
        if let Some(scaler) = &mut self.scaler {
            scaler.update_scale(overflow);
        }
        self.unscaled.clear();
        self.found_inf = false;
        overflow
    }
}

impl Default for PrecisionPlugin {
    fn default() -> Self {
        Self::new(Precision::default())
    }
}
