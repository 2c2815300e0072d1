//! Training-loop facade
//!
//! [`Fabric`] pairs a distribution strategy with a precision plugin and is the
//! single entry point a training loop calls between `backward()` and the
//! optimizer step:
//!
//! ```text
//! ClipArgs ──validate──► ClipSpec
//!                          │
//!            strategy.ensure_supported(mode)
//!                          │
//!            precision: dtype check, unscale (each gradient once per step)
//!                          │
//!          ┌───────────────┴───────────────┐
//!   clip_gradients_norm            clip_gradients_value
//!     → Some(total_norm)               → None
//! ```

use std::marker::PhantomData;

use crate::clip::{ClipClient, ClipSpec, NormClip, ValueClip};
use crate::config::ClipConfig;
use crate::error::{Error, Result};
use crate::precision::{Precision, PrecisionPlugin};
use crate::strategy::{AnyStrategy, Strategy};
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::TensorId;

/// Arguments of a `clip_gradients` call.
///
/// Exactly one of `max_norm` and `clip_val` must be set; that choice selects
/// the algorithm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipArgs {
    pub max_norm: Option<f64>,
    pub norm_type: f64,
    pub error_if_nonfinite: bool,
    pub clip_val: Option<f64>,
}

impl Default for ClipArgs {
    fn default() -> Self {
        Self {
            max_norm: None,
            norm_type: 2.0,
            error_if_nonfinite: true,
            clip_val: None,
        }
    }
}

impl ClipArgs {
    /// Clip by L2 norm to `max_norm`.
    pub fn norm(max_norm: f64) -> Self {
        Self::default().with_max_norm(max_norm)
    }

    /// Clamp elements to `[-clip_val, clip_val]`.
    pub fn value(clip_val: f64) -> Self {
        Self::default().with_clip_val(clip_val)
    }

    pub fn with_max_norm(mut self, max_norm: f64) -> Self {
        self.max_norm = Some(max_norm);
        self
    }

    pub fn with_clip_val(mut self, clip_val: f64) -> Self {
        self.clip_val = Some(clip_val);
        self
    }

    pub fn with_norm_type(mut self, norm_type: f64) -> Self {
        self.norm_type = norm_type;
        self
    }

    pub fn with_error_if_nonfinite(mut self, error_if_nonfinite: bool) -> Self {
        self.error_if_nonfinite = error_if_nonfinite;
        self
    }

    /// Resolve into a validated [`ClipSpec`].
    pub fn into_spec(self) -> Result<ClipSpec> {
        let spec = match (self.max_norm, self.clip_val) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidArgument {
                    arg: "clip_val",
                    reason: "Only one of `clip_val` or `max_norm` can be set as this specifies \
                             the underlying clipping algorithm!"
                        .to_string(),
                });
            }
            (None, None) => {
                return Err(Error::InvalidArgument {
                    arg: "max_norm",
                    reason: "You have to specify either `clip_val` or `max_norm` to do gradient \
                             clipping!"
                        .to_string(),
                });
            }
            (Some(max_norm), None) => ClipSpec::Norm(
                NormClip::new(max_norm)
                    .with_norm_type(self.norm_type)
                    .with_error_if_nonfinite(self.error_if_nonfinite),
            ),
            (None, Some(clip_val)) => ClipSpec::Value(ValueClip::new(clip_val)),
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Strategy plus precision, driving gradient clipping for a training loop.
pub struct Fabric<R: Runtime<DType = DType>, S: Strategy<R> = AnyStrategy<R>> {
    strategy: S,
    precision: PrecisionPlugin,
    _runtime: PhantomData<R>,
}

impl<R, S> Fabric<R, S>
where
    R: Runtime<DType = DType>,
    S: Strategy<R>,
{
    pub fn new(strategy: S, precision: Precision) -> Self {
        tracing::info!(strategy = strategy.name(), %precision, "fabric initialized");
        Self {
            strategy,
            precision: PrecisionPlugin::new(precision),
            _runtime: PhantomData,
        }
    }

    /// Replace the precision plugin, e.g. to use a custom loss scaler.
    pub fn with_precision_plugin(mut self, plugin: PrecisionPlugin) -> Self {
        self.precision = plugin;
        self
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn precision_plugin(&self) -> &PrecisionPlugin {
        &self.precision
    }

    /// Clip the gradients of `parameters` in place.
    ///
    /// Returns the total norm before clipping for norm clipping, `None` for
    /// value clipping. Nothing is modified when the arguments are invalid or
    /// the strategy refuses the requested mode.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if both or neither of `max_norm`/`clip_val` are set,
    ///   or a threshold is out of range
    /// - `UnsupportedOperation` if the strategy cannot clip in the requested mode
    /// - `DTypeMismatch` if a gradient is not a F32 master gradient
    /// - `NonFiniteGradient` if the norm is NaN/Inf and `error_if_nonfinite` is set
    pub fn clip_gradients<C>(
        &mut self,
        client: &C,
        parameters: &[TensorId],
        grads: &mut GradStore<R>,
        args: ClipArgs,
    ) -> Result<Option<f64>>
    where
        C: ClipClient<R>,
    {
        let spec = args.into_spec()?;
        self.strategy.ensure_supported(spec.mode())?;

        self.precision.check_gradients(parameters, grads)?;
        self.precision.unscale_gradients(client, parameters, grads)?;

        match spec {
            ClipSpec::Norm(norm) => self
                .strategy
                .clip_gradients_norm(client, parameters, grads, &norm)
                .map(Some),
            ClipSpec::Value(value) => self
                .strategy
                .clip_gradients_value(parameters, grads, &value)
                .map(|()| None),
        }
    }

    /// Clip as configured by a training config; `Ok(None)` when clipping is off.
    pub fn clip_with_config<C>(
        &mut self,
        client: &C,
        parameters: &[TensorId],
        grads: &mut GradStore<R>,
        config: &ClipConfig,
    ) -> Result<Option<f64>>
    where
        C: ClipClient<R>,
    {
        match config.to_clip_args() {
            Some(args) => self.clip_gradients(client, parameters, grads, args),
            None => Ok(None),
        }
    }

    /// Close out the optimizer step.
    ///
    /// Updates the loss scale from the overflow seen while unscaling and
    /// resets the per-step unscale state. Returns `true` if the optimizer
    /// update must be skipped.
    pub fn step_finished(&mut self) -> bool {
        let skip = self.precision.update();
        if skip {
            tracing::warn!("skipping optimizer step after gradient overflow");
        }
        skip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::ClipMode;
    use crate::precision::GradScaler;
    use crate::strategy::{
        InternalOptimizerConfig, InternalOptimizerStrategy, ShardedStrategy, SingleDeviceStrategy,
    };
    use crate::test_utils::cpu_setup;
    use numr::runtime::NoOpCommunicator;
    use numr::runtime::cpu::{CpuDevice, CpuRuntime};
    use numr::tensor::Tensor;
    use std::sync::Arc;

    fn scenario(device: &CpuDevice) -> (Vec<TensorId>, GradStore<CpuRuntime>) {
        let data: [&[f32]; 3] = [&[3.0, 4.0], &[0.0], &[0.0]];
        let mut ids = Vec::new();
        let mut grads = GradStore::new();
        for values in data {
            let id = TensorId::new();
            grads.insert(
                id,
                Tensor::<CpuRuntime>::from_slice(values, &[values.len()], device),
            );
            ids.push(id);
        }
        (ids, grads)
    }

    fn single() -> Fabric<CpuRuntime> {
        Fabric::new(SingleDeviceStrategy.into(), Precision::F32True)
    }

    #[test]
    fn test_clip_args_resolution() {
        assert_eq!(ClipArgs::norm(1.0).into_spec().unwrap().mode(), ClipMode::Norm);
        assert_eq!(ClipArgs::value(1.0).into_spec().unwrap().mode(), ClipMode::Value);

        match ClipArgs::norm(1.0).with_error_if_nonfinite(false).into_spec().unwrap() {
            ClipSpec::Norm(n) => assert!(!n.error_if_nonfinite()),
            other => panic!("expected norm spec, got {other:?}"),
        }
    }

    #[test]
    fn test_clip_args_both_set() {
        let err = ClipArgs::norm(1.0).with_clip_val(1.0).into_spec().unwrap_err();
        assert!(err.to_string().contains("Only one of `clip_val` or `max_norm`"));
    }

    #[test]
    fn test_clip_args_neither_set() {
        let err = ClipArgs::default().into_spec().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert!(err.to_string().contains("You have to specify either"));
    }

    #[test]
    fn test_fabric_norm_scenario() {
        let (client, device) = cpu_setup();
        let mut fabric = single();
        let (ids, mut grads) = scenario(&device);

        let norm = fabric
            .clip_gradients(&client, &ids, &mut grads, ClipArgs::norm(1.0))
            .unwrap();
        assert!((norm.unwrap() - 5.0).abs() < 1e-5);

        let g0 = grads.get(ids[0]).unwrap().to_vec::<f32>();
        assert!((g0[0] - 0.6).abs() < 1e-5);
        assert!((g0[1] - 0.8).abs() < 1e-5);
        assert_eq!(grads.get(ids[1]).unwrap().to_vec::<f32>(), vec![0.0]);
        assert_eq!(grads.get(ids[2]).unwrap().to_vec::<f32>(), vec![0.0]);
    }

    #[test]
    fn test_fabric_value_returns_none() {
        let (client, device) = cpu_setup();
        let mut fabric = single();
        let (ids, mut grads) = scenario(&device);

        let out = fabric
            .clip_gradients(&client, &ids, &mut grads, ClipArgs::value(3.5))
            .unwrap();
        assert!(out.is_none());
        assert_eq!(grads.get(ids[0]).unwrap().to_vec::<f32>(), vec![3.0, 3.5]);
    }

    #[test]
    fn test_fabric_invalid_args_leave_grads() {
        let (client, device) = cpu_setup();
        let mut fabric = single();
        let (ids, mut grads) = scenario(&device);

        let both = ClipArgs::norm(1.0).with_clip_val(1.0);
        assert!(fabric.clip_gradients(&client, &ids, &mut grads, both).is_err());
        assert_eq!(grads.get(ids[0]).unwrap().to_vec::<f32>(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_fabric_nonfinite() {
        let (client, device) = cpu_setup();
        let mut fabric = single();

        let id = TensorId::new();
        let mut grads = GradStore::new();
        grads.insert(
            id,
            Tensor::<CpuRuntime>::from_slice(&[f32::NAN, 1.0], &[2], &device),
        );

        let strict = fabric.clip_gradients(&client, &[id], &mut grads, ClipArgs::norm(1.0));
        assert!(matches!(strict, Err(Error::NonFiniteGradient { .. })));

        let lenient = ClipArgs::norm(1.0).with_error_if_nonfinite(false);
        let norm = fabric
            .clip_gradients(&client, &[id], &mut grads, lenient)
            .unwrap()
            .unwrap();
        assert!(norm.is_nan());
        assert!(grads.get(id).unwrap().to_vec::<f32>().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_fabric_internal_optimizer_refuses_before_unscale() {
        let (client, device) = cpu_setup();
        let scaler = GradScaler::new(10.0, 2.0, 0.5, 100).unwrap();
        let plugin = PrecisionPlugin::new(Precision::F16Mixed)
            .with_grad_scaler(scaler)
            .unwrap();
        let mut fabric: Fabric<CpuRuntime> = Fabric::new(
            InternalOptimizerStrategy::new(InternalOptimizerConfig::default()).into(),
            Precision::F16Mixed,
        )
        .with_precision_plugin(plugin);
        let (ids, mut grads) = scenario(&device);

        for args in [ClipArgs::norm(1.0), ClipArgs::value(1.0)] {
            let err = fabric.clip_gradients(&client, &ids, &mut grads, args).unwrap_err();
            assert!(matches!(err, Error::UnsupportedOperation { strategy: "deepspeed", .. }));
        }
        assert!(!fabric.precision_plugin().is_unscaled(ids[0]));
        assert_eq!(grads.get(ids[0]).unwrap().to_vec::<f32>(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_fabric_sharded() {
        let (client, device) = cpu_setup();
        let mut fabric: Fabric<CpuRuntime> = Fabric::new(
            ShardedStrategy::new(Arc::new(NoOpCommunicator), device.clone()).into(),
            Precision::Bf16Mixed,
        );
        let (ids, mut grads) = scenario(&device);

        let err = fabric
            .clip_gradients(&client, &ids, &mut grads, ClipArgs::value(1.0))
            .unwrap_err();
        assert!(err.to_string().contains("Consider clipping by norm instead"));

        let norm = fabric
            .clip_gradients(&client, &ids, &mut grads, ClipArgs::norm(1.0))
            .unwrap();
        assert!((norm.unwrap() - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_fabric_fp16_unscales_once_per_step() {
        let (client, device) = cpu_setup();
        let scaler = GradScaler::new(10.0, 2.0, 0.5, 100).unwrap();
        let plugin = PrecisionPlugin::new(Precision::F16Mixed)
            .with_grad_scaler(scaler)
            .unwrap();
        let mut fabric: Fabric<CpuRuntime> =
            Fabric::new(SingleDeviceStrategy.into(), Precision::F16Mixed)
                .with_precision_plugin(plugin);

        let id = TensorId::new();
        let mut grads = GradStore::new();
        grads.insert(
            id,
            Tensor::<CpuRuntime>::from_slice(&[30.0f32, 40.0], &[2], &device),
        );

        // unscaled norm is 5
        let norm = fabric
            .clip_gradients(&client, &[id], &mut grads, ClipArgs::norm(10.0))
            .unwrap();
        assert!((norm.unwrap() - 5.0).abs() < 1e-4);

        // second clip in the same step must not divide again
        fabric
            .clip_gradients(&client, &[id], &mut grads, ClipArgs::value(100.0))
            .unwrap();
        let data = grads.get(id).unwrap().to_vec::<f32>();
        assert!((data[0] - 3.0).abs() < 1e-4);
        assert!((data[1] - 4.0).abs() < 1e-4);

        assert!(!fabric.step_finished());
        assert!(!fabric.precision_plugin().is_unscaled(id));
    }

    #[test]
    fn test_fabric_fp16_unscales_each_group() {
        let (client, device) = cpu_setup();
        let scaler = GradScaler::new(10.0, 2.0, 0.5, 100).unwrap();
        let plugin = PrecisionPlugin::new(Precision::F16Mixed)
            .with_grad_scaler(scaler)
            .unwrap();
        let mut fabric: Fabric<CpuRuntime> =
            Fabric::new(SingleDeviceStrategy.into(), Precision::F16Mixed)
                .with_precision_plugin(plugin);

        let a = TensorId::new();
        let b = TensorId::new();
        let mut grads = GradStore::new();
        grads.insert(a, Tensor::<CpuRuntime>::from_slice(&[30.0f32, 40.0], &[2], &device));
        grads.insert(b, Tensor::<CpuRuntime>::from_slice(&[30.0f32, 40.0], &[2], &device));

        let norm_a = fabric
            .clip_gradients(&client, &[a], &mut grads, ClipArgs::norm(100.0))
            .unwrap();
        let norm_b = fabric
            .clip_gradients(&client, &[b], &mut grads, ClipArgs::norm(100.0))
            .unwrap();

        assert!((norm_a.unwrap() - 5.0).abs() < 1e-4);
        assert!((norm_b.unwrap() - 5.0).abs() < 1e-4);
        let gb = grads.get(b).unwrap().to_vec::<f32>();
        assert!((gb[0] - 3.0).abs() < 1e-4);
        assert!((gb[1] - 4.0).abs() < 1e-4);
    }

    #[test]
    fn test_fabric_overflow_skips_step() {
        let (client, device) = cpu_setup();
        let mut fabric: Fabric<CpuRuntime> =
            Fabric::new(SingleDeviceStrategy.into(), Precision::F16Mixed);

        let id = TensorId::new();
        let mut grads = GradStore::new();
        grads.insert(
            id,
            Tensor::<CpuRuntime>::from_slice(&[f32::INFINITY], &[1], &device),
        );

        let args = ClipArgs::norm(1.0).with_error_if_nonfinite(false);
        fabric.clip_gradients(&client, &[id], &mut grads, args).unwrap();

        let before = fabric.precision_plugin().grad_scaler().unwrap().scale();
        assert!(fabric.step_finished());
        let after = fabric.precision_plugin().grad_scaler().unwrap().scale();
        assert_eq!(after, before * 0.5);
    }

    #[test]
    fn test_clip_with_config() {
        let (client, device) = cpu_setup();
        let mut fabric = single();
        let (ids, mut grads) = scenario(&device);

        let off = ClipConfig::default();
        assert!(
            fabric
                .clip_with_config(&client, &ids, &mut grads, &off)
                .unwrap()
                .is_none()
        );
        assert_eq!(grads.get(ids[0]).unwrap().to_vec::<f32>(), vec![3.0, 4.0]);

        let by_value = ClipConfig::default()
            .with_gradient_clip_val(1.0)
            .with_gradient_clip_algorithm(ClipMode::Value);
        fabric
            .clip_with_config(&client, &ids, &mut grads, &by_value)
            .unwrap();
        assert_eq!(grads.get(ids[0]).unwrap().to_vec::<f32>(), vec![1.0, 1.0]);
    }
}
