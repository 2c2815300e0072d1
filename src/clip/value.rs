//! Clip gradients element-wise
//!
//! Each element is clamped independently, so value clipping needs no
//! cross-parameter reduction.

use crate::clip::{ValueClip, grads_present};
use crate::error::Result;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::{Tensor, TensorId};

/// Clip every gradient of `parameters` in-place to `[-clip_val, clip_val]`.
///
/// NaN elements stay NaN. Parameters without a gradient are skipped.
pub fn clip_grad_value<R: Runtime<DType = DType>>(
    parameters: &[TensorId],
    grads: &mut GradStore<R>,
    spec: &ValueClip,
) -> Result<()> {
    spec.validate()?;
    let ids = grads_present(parameters, grads)?;
    let bound = spec.clip_val as f32;

    tracing::debug!(clip_val = spec.clip_val, params = ids.len(), "clipping gradients by value");

    for id in ids {
        if let Some(grad) = grads.get(id) {
            let clamped: Vec<f32> = grad
                .to_vec::<f32>()
                .iter()
                .map(|v| v.clamp(-bound, bound))
                .collect();
            let clipped = Tensor::<R>::from_slice(&clamped, grad.shape(), grad.device());
            grads.insert(id, clipped);
        }
    }
    Ok(())
}
