//! Strategies whose optimizer engine clips inside its own step
//!
//! The engine owns partitioned optimizer state and fused update kernels;
//! clipping must happen at a point only the engine controls. External
//! clipping requests are therefore refused and the threshold is carried in
//! [`InternalOptimizerConfig`] instead.

use super::{Strategy, StrategyCapability};
use crate::clip::{ClipClient, ClipMode, NonFinitePolicy, NormClip, clip_grad_norm};
use crate::error::{Error, Result};
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::TensorId;
use serde::{Deserialize, Serialize};

/// Engine-side clipping settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalOptimizerConfig {
    /// Max L2 norm applied during the optimizer step; `None` disables clipping.
    pub gradient_clipping: Option<f64>,
    pub nonfinite: NonFinitePolicy,
}

impl Default for InternalOptimizerConfig {
    fn default() -> Self {
        Self {
            gradient_clipping: None,
            nonfinite: NonFinitePolicy::Propagate,
        }
    }
}

impl InternalOptimizerConfig {
    pub fn with_gradient_clipping(mut self, max_norm: f64) -> Self {
        self.gradient_clipping = Some(max_norm);
        self
    }
}

/// Strategy backed by an optimizer engine that clips internally ("deepspeed").
#[derive(Debug, Clone)]
pub struct InternalOptimizerStrategy {
    config: InternalOptimizerConfig,
}

impl InternalOptimizerStrategy {
    pub fn new(config: InternalOptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InternalOptimizerConfig {
        &self.config
    }

    /// Clipping as performed by the engine during its step.
    ///
    /// Returns the total norm when `gradient_clipping` is configured, `None`
    /// otherwise. This is the engine's hook; user code goes through
    /// [`Strategy::clip_gradients_norm`], which refuses.
    pub fn clip_in_step<R, C>(
        &self,
        client: &C,
        parameters: &[TensorId],
        grads: &mut GradStore<R>,
    ) -> Result<Option<f64>>
    where
        R: Runtime<DType = DType>,
        C: ClipClient<R>,
    {
        let Some(max_norm) = self.config.gradient_clipping else {
            return Ok(None);
        };
        let spec = NormClip::new(max_norm).with_nonfinite_policy(self.config.nonfinite);
        spec.validate().map_err(|e| Error::ConfigError {
            reason: format!("invalid `gradient_clipping`: {e}"),
        })?;
        clip_grad_norm(client, parameters, grads, &spec).map(Some)
    }
}

impl<R: Runtime<DType = DType>> Strategy<R> for InternalOptimizerStrategy {
    fn name(&self) -> &'static str {
        "deepspeed"
    }

    fn capability(&self) -> StrategyCapability {
        StrategyCapability::INTERNAL
    }

    fn unsupported_reason(&self, _mode: ClipMode) -> String {
        "The embedded optimizer handles gradient clipping automatically within its step. \
         Make sure to set the `gradient_clipping` value in your config."
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::ValueClip;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;
    use numr::tensor::Tensor;

    fn grads_of(values: &[f32]) -> (TensorId, GradStore<CpuRuntime>) {
        let (_client, device) = cpu_setup();
        let id = TensorId::new();
        let mut grads = GradStore::new();
        grads.insert(
            id,
            Tensor::<CpuRuntime>::from_slice(values, &[values.len()], &device),
        );
        (id, grads)
    }

    #[test]
    fn test_refuses_external_norm_clip() {
        let (client, _device) = cpu_setup();
        let strategy = InternalOptimizerStrategy::new(InternalOptimizerConfig::default());
        let (id, mut grads) = grads_of(&[3.0, 4.0]);

        let err = strategy
            .clip_gradients_norm(&client, &[id], &mut grads, &NormClip::new(1.0))
            .unwrap_err();
        match err {
            Error::UnsupportedOperation { strategy, reason } => {
                assert_eq!(strategy, "deepspeed");
                assert!(reason.contains("`gradient_clipping`"));
            }
            other => panic!("expected UnsupportedOperation, got {other:?}"),
        }
        assert_eq!(grads.get(id).unwrap().to_vec::<f32>(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_refuses_external_value_clip() {
        let strategy = InternalOptimizerStrategy::new(InternalOptimizerConfig::default());
        let (id, mut grads) = grads_of(&[3.0, 4.0]);

        let result = Strategy::<CpuRuntime>::clip_gradients_value(
            &strategy,
            &[id],
            &mut grads,
            &ValueClip::new(1.0),
        );
        assert!(matches!(result, Err(Error::UnsupportedOperation { .. })));
    }

    #[test]
    fn test_clip_in_step_uses_config() {
        let (client, _device) = cpu_setup();
        let strategy = InternalOptimizerStrategy::new(
            InternalOptimizerConfig::default().with_gradient_clipping(1.0),
        );
        let (id, mut grads) = grads_of(&[3.0, 4.0]);

        let norm = strategy.clip_in_step(&client, &[id], &mut grads).unwrap();
        assert!((norm.unwrap() - 5.0).abs() < 1e-5);

        let data = grads.get(id).unwrap().to_vec::<f32>();
        assert!((data[0] - 0.6).abs() < 1e-5);
    }

    #[test]
    fn test_clip_in_step_disabled() {
        let (client, _device) = cpu_setup();
        let strategy = InternalOptimizerStrategy::new(InternalOptimizerConfig::default());
        let (id, mut grads) = grads_of(&[3.0, 4.0]);

        assert!(strategy.clip_in_step(&client, &[id], &mut grads).unwrap().is_none());
        assert_eq!(grads.get(id).unwrap().to_vec::<f32>(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_clip_in_step_rejects_bad_threshold() {
        let (client, _device) = cpu_setup();
        let strategy = InternalOptimizerStrategy::new(
            InternalOptimizerConfig::default().with_gradient_clipping(-1.0),
        );
        let (id, mut grads) = grads_of(&[3.0]);

        assert!(matches!(
            strategy.clip_in_step(&client, &[id], &mut grads),
            Err(Error::ConfigError { .. })
        ));
    }

    #[test]
    fn test_config_yaml() {
        let cfg: InternalOptimizerConfig = serde_yaml::from_str("gradient_clipping: 0.5\n").unwrap();
        assert_eq!(cfg.gradient_clipping, Some(0.5));
        assert_eq!(cfg.nonfinite, NonFinitePolicy::Propagate);
    }
}
