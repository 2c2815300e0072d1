//! Fully sharded data parallelism
//!
//! Each rank owns only a slice of every parameter and its gradient. The
//! joint norm is assembled from per-rank partials:
//!
//! ```text
//!   rank 0: Σ|g₀|ᵖ ─┐
//!   rank 1: Σ|g₁|ᵖ ─┼─ all_reduce(Sum) ─► (Σ)^(1/p) ─► scale local shard
//!   rank N: Σ|gₙ|ᵖ ─┘
//! ```
//!
//! The inf-norm reduces with `Max` instead. Value clipping is refused: the
//! flattened shards are not addressable per parameter here.

use std::sync::Arc;

use super::{Strategy, StrategyCapability};
use crate::clip::norm::apply_norm_clip;
use crate::clip::{
    ClipClient, ClipMode, NormClip, PartialNorm, finish_norm, grads_present, partial_norm,
};
use crate::distributed::all_reduce_scalar;
use crate::error::Result;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::runtime::{Communicator, ReduceOp, Runtime};
use numr::tensor::TensorId;

/// Sharded strategy ("fsdp").
pub struct ShardedStrategy<R: Runtime<DType = DType>> {
    comm: Arc<dyn Communicator>,
    device: R::Device,
}

impl<R: Runtime<DType = DType>> ShardedStrategy<R> {
    /// `device` hosts the staging buffer for the norm all-reduce.
    pub fn new(comm: Arc<dyn Communicator>, device: R::Device) -> Self {
        Self { comm, device }
    }

    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }
}

impl<R: Runtime<DType = DType>> Strategy<R> for ShardedStrategy<R> {
    fn name(&self) -> &'static str {
        "fsdp"
    }

    fn capability(&self) -> StrategyCapability {
        StrategyCapability::NORM_ONLY
    }

    fn unsupported_reason(&self, mode: ClipMode) -> String {
        match mode {
            ClipMode::Value => "The sharded strategy does not support clipping gradients by value. \
                Consider clipping by norm instead or choose another strategy!"
                .to_string(),
            ClipMode::Norm => "The sharded strategy cannot clip gradients by norm here".to_string(),
        }
    }

    /// Clip the local shards against the norm of the full, unsharded gradients.
    ///
    /// Every rank must call this collectively, including ranks whose shards
    /// hold no gradient this step. `spec` must be identical on all ranks, so
    /// its validation fails everywhere or nowhere. A rank whose own gradients
    /// cannot be reduced (wrong dtype, numr failure) still joins the
    /// all-reduce with a NaN contribution before returning its error, so peers
    /// do not block and see a non-finite norm.
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
        spec.validate()?;

        let local = grads_present(parameters, grads).and_then(|ids| {
            let partial = partial_norm(client, grads, &ids, spec.norm_type)?;
            Ok((ids, partial))
        });
        let (contribution, op) = match &local {
            Ok((_, PartialNorm::PowerSum(v))) => (*v, ReduceOp::Sum),
            Ok((_, PartialNorm::Max(v))) => (*v, ReduceOp::Max),
            Err(_) if spec.norm_type == f64::INFINITY => (f64::NAN, ReduceOp::Max),
            Err(_) => (f64::NAN, ReduceOp::Sum),
        };
        let reduced = all_reduce_scalar::<R>(self.comm.as_ref(), contribution, op, &self.device)?;

        let (ids, partial) = local?;
        let total = finish_norm(partial.with_value(reduced), spec.norm_type);

        tracing::debug!(
            rank = self.comm.rank(),
            world_size = self.comm.world_size(),
            local = partial.value(),
            total_norm = total,
            "reduced sharded gradient norm"
        );

        apply_norm_clip(client, grads, &ids, total, spec)?;
        Ok(total)
    }
}
