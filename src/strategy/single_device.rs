//! One process, one device.

use super::{Strategy, StrategyCapability};
use numr::dtype::DType;
use numr::runtime::Runtime;

/// Training on a single device; gradients are local and fully owned, so
/// both clipping modes run directly on them.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleDeviceStrategy;

impl<R: Runtime<DType = DType>> Strategy<R> for SingleDeviceStrategy {
    fn name(&self) -> &'static str {
        "single_device"
    }

    fn capability(&self) -> StrategyCapability {
        StrategyCapability::FULL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::{NormClip, ValueClip};
    use crate::test_utils::cpu_setup;
    use numr::autograd::GradStore;
    use numr::runtime::cpu::CpuRuntime;
    use numr::tensor::{Tensor, TensorId};

    #[test]
    fn test_single_device_norm_clip() {
        let (client, device) = cpu_setup();
        let strategy = SingleDeviceStrategy;

        let a = TensorId::new();
        let b = TensorId::new();
        let mut grads = GradStore::new();
        grads.insert(a, Tensor::<CpuRuntime>::from_slice(&[3.0f32], &[1], &device));
        grads.insert(b, Tensor::<CpuRuntime>::from_slice(&[4.0f32], &[1], &device));

        let norm = strategy
            .clip_gradients_norm(&client, &[a, b], &mut grads, &NormClip::new(1.0))
            .unwrap();
        assert!((norm - 5.0).abs() < 1e-5);

        let ga = grads.get(a).unwrap().to_vec::<f32>()[0];
        let gb = grads.get(b).unwrap().to_vec::<f32>()[0];
        assert!((ga - 0.6).abs() < 1e-5);
        assert!((gb - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_single_device_value_clip() {
        let (_client, device) = cpu_setup();
        let strategy = SingleDeviceStrategy;

        let id = TensorId::new();
        let mut grads = GradStore::new();
        grads.insert(
            id,
            Tensor::<CpuRuntime>::from_slice(&[-2.0f32, 0.1, 7.0], &[3], &device),
        );

        Strategy::<CpuRuntime>::clip_gradients_value(
            &strategy,
            &[id],
            &mut grads,
            &ValueClip::new(0.5),
        )
        .unwrap();

        assert_eq!(grads.get(id).unwrap().to_vec::<f32>(), vec![-0.5, 0.1, 0.5]);
    }
}
