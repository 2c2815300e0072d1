//! Training strategies and their gradient-clipping capabilities
//!
//! A strategy describes how parameters and gradients are laid out across
//! devices, and therefore which clipping algorithms are legal. Legality is
//! data, not control flow: every strategy reports a [`StrategyCapability`] and
//! the default trait methods consult it before touching any gradient.
//!
//! | strategy | norm | value | notes |
//! |---|---|---|---|
//! | [`SingleDeviceStrategy`] | yes | yes | |
//! | [`DataParallelStrategy`] | yes | yes | gradients averaged before clipping |
//! | [`ShardedStrategy`] | yes | no | partial norm all-reduced across shards |
//! | [`InternalOptimizerStrategy`] | no | no | optimizer clips inside its step |

pub mod data_parallel;
pub mod internal_optimizer;
pub mod sharded;
pub mod single_device;

pub use data_parallel::DataParallelStrategy;
pub use internal_optimizer::{InternalOptimizerConfig, InternalOptimizerStrategy};
pub use sharded::ShardedStrategy;
pub use single_device::SingleDeviceStrategy;

use crate::clip::{ClipClient, ClipMode, NormClip, ValueClip, clip_grad_norm, clip_grad_value};
use crate::error::{Error, Result};
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::TensorId;

/// Which clipping algorithms a strategy can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyCapability {
    pub supports_norm_clip: bool,
    pub supports_value_clip: bool,
    /// Clipping happens inside the optimizer step; external clipping is refused.
    pub requires_internal_clip: bool,
}

impl StrategyCapability {
    /// Full control over local gradient buffers.
    pub const FULL: Self = Self {
        supports_norm_clip: true,
        supports_value_clip: true,
        requires_internal_clip: false,
    };

    /// Norm clipping via a cross-shard reduction only.
    pub const NORM_ONLY: Self = Self {
        supports_norm_clip: true,
        supports_value_clip: false,
        requires_internal_clip: false,
    };

    /// The optimizer owns clipping.
    pub const INTERNAL: Self = Self {
        supports_norm_clip: false,
        supports_value_clip: false,
        requires_internal_clip: true,
    };

    pub fn supports(&self, mode: ClipMode) -> bool {
        if self.requires_internal_clip {
            return false;
        }
        match mode {
            ClipMode::Norm => self.supports_norm_clip,
            ClipMode::Value => self.supports_value_clip,
        }
    }
}

/// A distribution strategy as seen by gradient clipping.
///
/// Implementors usually only provide [`name`](Strategy::name),
/// [`capability`](Strategy::capability) and a message for unsupported modes;
/// the clipping methods default to the local algorithms in [`crate::clip`].
pub trait Strategy<R: Runtime<DType = DType>> {
    /// Short name, as accepted in configs (`"ddp"`, `"fsdp"`, ...).
    fn name(&self) -> &'static str;

    fn capability(&self) -> StrategyCapability;

    /// Why `mode` is refused, naming what to do instead.
    fn unsupported_reason(&self, mode: ClipMode) -> String {
        format!(
            "the '{}' strategy does not support clipping gradients by {mode}",
            self.name()
        )
    }

    /// Fail with `UnsupportedOperation` if `mode` is not legal here.
    fn ensure_supported(&self, mode: ClipMode) -> Result<()> {
        if self.capability().supports(mode) {
            Ok(())
        } else {
            Err(Error::UnsupportedOperation {
                strategy: self.name(),
                reason: self.unsupported_reason(mode),
            })
        }
    }

    /// Clip the gradients of `parameters` by joint norm; returns the total norm.
    fn clip_gradients_norm<C>(
        &self,
        client: &C,
        parameters: &[TensorId],
        grads: &mut GradStore<R>,
        spec: &NormClip,
    ) -> Result<f64>
    where
        C: ClipClient<R>,
    {
        self.ensure_supported(ClipMode::Norm)?;
        clip_grad_norm(client, parameters, grads, spec)
    }

    /// Clamp every gradient element of `parameters` to `[-clip_val, clip_val]`.
    fn clip_gradients_value(
        &self,
        parameters: &[TensorId],
        grads: &mut GradStore<R>,
        spec: &ValueClip,
    ) -> Result<()> {
        self.ensure_supported(ClipMode::Value)?;
        clip_grad_value(parameters, grads, spec)
    }
}

/// Any of the built-in strategies, selected at runtime from config.
pub enum AnyStrategy<R: Runtime<DType = DType>> {
    SingleDevice(SingleDeviceStrategy),
    DataParallel(DataParallelStrategy),
    Sharded(ShardedStrategy<R>),
    InternalOptimizer(InternalOptimizerStrategy),
}

macro_rules! dispatch {
    ($self:ident, $s:ident => $body:expr) => {
        match $self {
            AnyStrategy::SingleDevice($s) => $body,
            AnyStrategy::DataParallel($s) => $body,
            AnyStrategy::Sharded($s) => $body,
            AnyStrategy::InternalOptimizer($s) => $body,
        }
    };
}

impl<R: Runtime<DType = DType>> Strategy<R> for AnyStrategy<R> {
    fn name(&self) -> &'static str {
        dispatch!(self, s => Strategy::<R>::name(s))
    }

    fn capability(&self) -> StrategyCapability {
        dispatch!(self, s => Strategy::<R>::capability(s))
    }

    fn unsupported_reason(&self, mode: ClipMode) -> String {
        dispatch!(self, s => Strategy::<R>::unsupported_reason(s, mode))
    }

    fn clip_gradients_norm<C>(
        &self,
        client: &C,
        parameters: &[TensorId],
        grads: &mut GradStore<R>,
        spec: &NormClip,
    ) -> Result<f64>
    where
        C: ClipClient<R>,
    {
        dispatch!(self, s => s.clip_gradients_norm(client, parameters, grads, spec))
    }

    fn clip_gradients_value(
        &self,
        parameters: &[TensorId],
        grads: &mut GradStore<R>,
        spec: &ValueClip,
    ) -> Result<()> {
        dispatch!(self, s => Strategy::<R>::clip_gradients_value(s, parameters, grads, spec))
    }
}

impl<R: Runtime<DType = DType>> From<SingleDeviceStrategy> for AnyStrategy<R> {
    fn from(s: SingleDeviceStrategy) -> Self {
        AnyStrategy::SingleDevice(s)
    }
}

impl<R: Runtime<DType = DType>> From<DataParallelStrategy> for AnyStrategy<R> {
    fn from(s: DataParallelStrategy) -> Self {
        AnyStrategy::DataParallel(s)
    }
}

impl<R: Runtime<DType = DType>> From<ShardedStrategy<R>> for AnyStrategy<R> {
    fn from(s: ShardedStrategy<R>) -> Self {
        AnyStrategy::Sharded(s)
    }
}

impl<R: Runtime<DType = DType>> From<InternalOptimizerStrategy> for AnyStrategy<R> {
    fn from(s: InternalOptimizerStrategy) -> Self {
        AnyStrategy::InternalOptimizer(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::NoOpCommunicator;
    use numr::runtime::cpu::CpuRuntime;
    use std::sync::Arc;

    fn all_strategies() -> Vec<AnyStrategy<CpuRuntime>> {
        let (_client, device) = cpu_setup();
        let comm = Arc::new(NoOpCommunicator);
        vec![
            SingleDeviceStrategy.into(),
            DataParallelStrategy::new(comm.clone()).into(),
            DataParallelStrategy::replicated().into(),
            ShardedStrategy::new(comm, device).into(),
            InternalOptimizerStrategy::new(InternalOptimizerConfig::default()).into(),
        ]
    }

    #[test]
    fn test_capability_table() {
        let table: Vec<(&str, bool, bool)> = all_strategies()
            .iter()
            .map(|s| {
                (
                    s.name(),
                    s.capability().supports(ClipMode::Norm),
                    s.capability().supports(ClipMode::Value),
                )
            })
            .collect();

        assert_eq!(
            table,
            vec![
                ("single_device", true, true),
                ("ddp", true, true),
                ("dp", true, true),
                ("fsdp", true, false),
                ("deepspeed", false, false),
            ]
        );
    }

    #[test]
    fn test_internal_flag_overrides_support() {
        let cap = StrategyCapability {
            supports_norm_clip: true,
            supports_value_clip: true,
            requires_internal_clip: true,
        };
        assert!(!cap.supports(ClipMode::Norm));
        assert!(!cap.supports(ClipMode::Value));
    }

    #[test]
    fn test_ensure_supported_reports_strategy() {
        for strategy in all_strategies() {
            for mode in [ClipMode::Norm, ClipMode::Value] {
                let result = strategy.ensure_supported(mode);
                if strategy.capability().supports(mode) {
                    assert!(result.is_ok());
                } else {
                    match result {
                        Err(Error::UnsupportedOperation { strategy: name, .. }) => {
                            assert_eq!(name, strategy.name())
                        }
                        other => panic!("expected UnsupportedOperation, got {other:?}"),
                    }
                }
            }
        }
    }

    #[test]
    fn test_any_strategy_clips_like_inner() {
        use numr::tensor::Tensor;

        let (client, device) = cpu_setup();
        for strategy in all_strategies() {
            if !strategy.capability().supports(ClipMode::Norm) {
                continue;
            }
            let id = TensorId::new();
            let mut grads = GradStore::new();
            grads.insert(
                id,
                Tensor::<CpuRuntime>::from_slice(&[3.0f32, 4.0], &[2], &device),
            );

            let norm = strategy
                .clip_gradients_norm(&client, &[id], &mut grads, &NormClip::new(1.0))
                .unwrap();
            assert!((norm - 5.0).abs() < 1e-5, "{}: norm {norm}", strategy.name());

            let data = grads.get(id).unwrap().to_vec::<f32>();
            assert!((data[0] - 0.6).abs() < 1e-5);
            assert!((data[1] - 0.8).abs() < 1e-5);
        }
    }
}
