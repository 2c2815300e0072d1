//! Clip gradients by joint Lp norm
//!
//! All gradients of a parameter set are treated as one concatenated vector:
//! the total norm is computed over every element, and every tensor is scaled
//! by the same factor so relative gradient directions are preserved.
//!
//! The reduction is split in two halves (`partial_norm` / `finish_norm`) so
//! that a sharded strategy can all-reduce the partial across ranks in between.

use crate::clip::{ClipClient, NonFinitePolicy, NormClip, grads_present};
use crate::error::{Error, Result};
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::{Tensor, TensorId};

/// Added to the total norm before dividing, so a zero norm never divides by zero.
pub const NORM_EPS: f64 = 1e-6;

/// Per-rank (or per-call) partial reduction of the total norm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PartialNorm {
    /// `sum(|g|^p)` for finite `p`.
    PowerSum(f64),
    /// `max(|g|)` for `p = inf`.
    Max(f64),
}

impl PartialNorm {
    pub fn value(&self) -> f64 {
        match self {
            PartialNorm::PowerSum(v) | PartialNorm::Max(v) => *v,
        }
    }

    /// Same kind of partial with a different (e.g. all-reduced) value.
    pub fn with_value(&self, value: f64) -> Self {
        match self {
            PartialNorm::PowerSum(_) => PartialNorm::PowerSum(value),
            PartialNorm::Max(_) => PartialNorm::Max(value),
        }
    }
}

/// Reduce the gradients listed in `ids` to a partial norm of order `norm_type`.
///
/// Orders 1 and 2 run as device reductions in f64; other orders (including
/// inf) read the gradients back to the host. NaN anywhere yields a NaN partial.
pub fn partial_norm<R, C>(
    client: &C,
    grads: &GradStore<R>,
    ids: &[TensorId],
    norm_type: f64,
) -> Result<PartialNorm>
where
    R: Runtime<DType = DType>,
    C: ClipClient<R>,
{
    if norm_type == f64::INFINITY {
        let mut max_abs = 0.0f64;
        for &id in ids {
            if let Some(grad) = grads.get(id) {
                max_abs = nan_max(max_abs, host_max_abs(grad));
            }
        }
        return Ok(PartialNorm::Max(max_abs));
    }

    let mut total = 0.0f64;
    for &id in ids {
        let Some(grad) = grads.get(id) else {
            continue;
        };
        if grad.numel() == 0 {
            continue;
        }
        total += if norm_type == 2.0 {
            // sum(grad^2), accumulated in f64 so finite f32 grads cannot overflow
            let flat = client.cast(&grad.reshape(&[grad.numel()])?, DType::F64)?;
            let sq = client.mul(&flat, &flat)?;
            let sum = client.sum(&sq, &[0], false)?;
            sum.to_vec::<f64>()[0]
        } else if norm_type == 1.0 {
            let flat = client.cast(&grad.reshape(&[grad.numel()])?, DType::F64)?;
            let abs = client.abs(&flat)?;
            let sum = client.sum(&abs, &[0], false)?;
            sum.to_vec::<f64>()[0]
        } else {
            grad.to_vec::<f32>()
                .iter()
                .map(|&v| (v as f64).abs().powf(norm_type))
                .sum::<f64>()
        };
    }
    Ok(PartialNorm::PowerSum(total))
}

/// Turn a (possibly all-reduced) partial into the total norm.
pub fn finish_norm(partial: PartialNorm, norm_type: f64) -> f64 {
    match partial {
        PartialNorm::Max(m) => m,
        PartialNorm::PowerSum(s) if norm_type == 1.0 => s,
        PartialNorm::PowerSum(s) if norm_type == 2.0 => s.sqrt(),
        PartialNorm::PowerSum(s) => s.powf(1.0 / norm_type),
    }
}

/// Total norm of order `norm_type` over every gradient of `parameters`.
///
/// Parameters without a gradient are skipped. An empty set has norm 0.
pub fn total_norm<R, C>(
    client: &C,
    parameters: &[TensorId],
    grads: &GradStore<R>,
    norm_type: f64,
) -> Result<f64>
where
    R: Runtime<DType = DType>,
    C: ClipClient<R>,
{
    let ids = grads_present(parameters, grads)?;
    let partial = partial_norm(client, grads, &ids, norm_type)?;
    Ok(finish_norm(partial, norm_type))
}

/// Multiply every gradient in `ids` by `scale`, replacing it in the store.
pub fn scale_grads<R, C>(
    client: &C,
    grads: &mut GradStore<R>,
    ids: &[TensorId],
    scale: f64,
) -> Result<()>
where
    R: Runtime<DType = DType>,
    C: ClipClient<R>,
{
    for &id in ids {
        if let Some(grad) = grads.get(id) {
            let clipped = client.mul_scalar(grad, scale)?;
            grads.insert(id, clipped);
        }
    }
    Ok(())
}

/// Clip gradients in-place by joint Lp norm.
///
/// Computes the total norm across all gradients of `parameters`, then scales
/// each gradient by `max_norm / (total_norm + eps)` when that factor is below
/// one. Returns the total norm before clipping.
///
/// # Errors
///
/// - `InvalidArgument` for a non-positive `max_norm` or `norm_type`
/// - `DTypeMismatch` if a gradient is not F32
/// - `NonFiniteGradient` if the norm is NaN/Inf and the policy is `Error`
pub fn clip_grad_norm<R, C>(
    client: &C,
    parameters: &[TensorId],
    grads: &mut GradStore<R>,
    spec: &NormClip,
) -> Result<f64>
where
    R: Runtime<DType = DType>,
    C: ClipClient<R>,
{
    spec.validate()?;
    let ids = grads_present(parameters, grads)?;
    let partial = partial_norm(client, grads, &ids, spec.norm_type)?;
    let total = finish_norm(partial, spec.norm_type);
    apply_norm_clip(client, grads, &ids, total, spec)?;
    Ok(total)
}

/// Scale `ids` given an already-computed total norm, honoring the nonfinite policy.
pub(crate) fn apply_norm_clip<R, C>(
    client: &C,
    grads: &mut GradStore<R>,
    ids: &[TensorId],
    total: f64,
    spec: &NormClip,
) -> Result<()>
where
    R: Runtime<DType = DType>,
    C: ClipClient<R>,
{
    let scale = spec.max_norm / (total + NORM_EPS);

    if !total.is_finite() {
        match spec.nonfinite {
            NonFinitePolicy::Error => {
                return Err(Error::NonFiniteGradient {
                    norm: total,
                    norm_type: spec.norm_type,
                });
            }
            NonFinitePolicy::Ignore => {
                tracing::warn!(total_norm = total, "non-finite gradient norm, leaving gradients unclipped");
                return Ok(());
            }
            NonFinitePolicy::Propagate => {
                tracing::warn!(total_norm = total, "non-finite gradient norm, scaling anyway");
                return scale_grads(client, grads, ids, scale);
            }
        }
    }

    if scale < 1.0 {
        tracing::debug!(
            total_norm = total,
            max_norm = spec.max_norm,
            scale,
            "clipping gradients by norm"
        );
        scale_grads(client, grads, ids, scale)?;
    }
    Ok(())
}

fn host_max_abs<R: Runtime<DType = DType>>(grad: &Tensor<R>) -> f64 {
    grad.to_vec::<f32>()
        .iter()
        .fold(0.0f64, |acc, &v| nan_max(acc, (v as f64).abs()))
}

/// `max` that propagates NaN (unlike `f64::max`).
pub(crate) fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}
