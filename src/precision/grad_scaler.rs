//! Dynamic loss scaling for FP16 mixed precision training
//!
//! FP16 has a narrower exponent range than FP32/BF16, so gradients can underflow.
//! GradScaler multiplies the loss by a large scale factor before backward, then
//! divides gradients by that factor. Clipping thresholds are expressed in
//! unscaled units, so gradients must be unscaled before any clipping.
//!
//! Not needed for BF16 (same exponent range as FP32).

use crate::error::{Error, Result};
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{ReduceOps, ScalarOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};

/// Dynamic loss scaler for FP16 training
///
/// Maintains a scale factor that grows when training is stable and shrinks
/// when overflow is detected.
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: u64,
    consecutive_ok: u64,
}

impl GradScaler {
    /// Create a new GradScaler with dynamic scaling parameters.
    ///
    /// # Arguments
    /// * `initial_scale` - Starting loss scale (e.g., 2^16 = 65536)
    /// * `growth_factor` - Multiply scale by this after `growth_interval` clean steps (e.g., 2.0)
    /// * `backoff_factor` - Multiply scale by this on overflow (e.g., 0.5)
    /// * `growth_interval` - Number of consecutive clean steps before growing scale
    pub fn new(
        initial_scale: f64,
        growth_factor: f64,
        backoff_factor: f64,
        growth_interval: u64,
    ) -> Result<Self> {
        if initial_scale <= 0.0 {
            return Err(Error::TrainingError {
                reason: format!("initial_scale must be positive, got {initial_scale}"),
            });
        }
        if growth_factor <= 1.0 {
            return Err(Error::TrainingError {
                reason: format!("growth_factor must be > 1.0, got {growth_factor}"),
            });
        }
        if backoff_factor <= 0.0 || backoff_factor >= 1.0 {
            return Err(Error::TrainingError {
                reason: format!("backoff_factor must be in (0, 1), got {backoff_factor}"),
            });
        }
        if growth_interval == 0 {
            return Err(Error::TrainingError {
                reason: "growth_interval must be > 0".to_string(),
            });
        }

        Ok(Self {
            scale: initial_scale,
            growth_factor,
            backoff_factor,
            growth_interval,
            consecutive_ok: 0,
        })
    }

    /// Create with sensible defaults: scale=65536, grow=2x, backoff=0.5x, interval=2000
    pub fn default_fp16() -> Self {
        Self {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            consecutive_ok: 0,
        }
    }

    /// Get the current loss scale factor.
    ///
    /// Multiply your loss by this before calling `backward()`.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Scale a loss value before backward pass.
    pub fn scale_loss(&self, loss: f64) -> f64 {
        loss * self.scale
    }

    /// Unscale the gradients of `parameters` in place.
    ///
    /// Divides every present gradient by the current scale factor and
    /// reports whether any of them contains NaN or Inf afterwards. Unlike a
    /// hard failure, all gradients are still unscaled so the caller can decide
    /// to skip the optimizer step.
    pub fn unscale_grads<R, C>(
        &self,
        client: &C,
        parameters: &[TensorId],
        grads: &mut GradStore<R>,
    ) -> Result<bool>
    where
        R: Runtime<DType = DType>,
        C: RuntimeClient<R> + ScalarOps<R> + UnaryOps<R> + ReduceOps<R>,
    {
        let inv_scale = 1.0 / self.scale;
        let mut found_inf = false;

        for &id in parameters {
            let Some(grad) = grads.get(id) else {
                continue;
            };
            let g = client.mul_scalar(grad, inv_scale)?;
            found_inf |= Self::has_nan_inf(client, &g)?;
            grads.insert(id, g);
        }

        Ok(found_inf)
    }

    /// Update the scale factor after an optimizer step.
    ///
    /// Call with `overflow=true` if `unscale_grads` found NaN/Inf.
    /// Call with `overflow=false` after a successful optimizer step.
    pub fn update_scale(&mut self, overflow: bool) {
        if overflow {
            self.scale *= self.backoff_factor;
            self.consecutive_ok = 0;
            tracing::warn!(scale = self.scale, "gradient overflow, backing off loss scale");
        } else {
            self.consecutive_ok += 1;
            if self.consecutive_ok >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.consecutive_ok = 0;
                tracing::debug!(scale = self.scale, "growing loss scale");
            }
        }
    }

    /// Check if a tensor contains NaN or Inf values on-device.
    fn has_nan_inf<R, C>(client: &C, tensor: &Tensor<R>) -> Result<bool>
    where
        R: Runtime<DType = DType>,
        C: UnaryOps<R> + ReduceOps<R>,
    {
        let nan_mask = client.isnan(tensor)?;
        let inf_mask = client.isinf(tensor)?;
        let has_nan = client.any(&nan_mask, &[], false)?;
        let has_inf = client.any(&inf_mask, &[], false)?;
        Ok(has_nan.item::<u8>()? != 0 || has_inf.item::<u8>()? != 0)
    }
}
