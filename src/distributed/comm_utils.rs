//! Safe wrappers around the raw-pointer `Communicator` trait.
//!
//! Tensor-level helpers so strategies don't repeat the
//! contiguity-check → extract-pointer → unsafe-call → sync pattern.

use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::{Communicator, ReduceOp, Runtime};
use numr::tensor::Tensor;

/// All-reduce a single tensor in-place with the given reduction op.
///
/// Checks contiguity, extracts the device pointer and calls the unsafe
/// communicator method. The caller is responsible for `sync()`.
pub fn all_reduce_tensor<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    tensor: &Tensor<R>,
    op: ReduceOp,
) -> Result<()> {
    if !tensor.is_contiguous() {
        return Err(Error::DistributedError {
            reason: "all_reduce requires contiguous tensor".to_string(),
        });
    }

    let ptr = tensor.ptr();
    let count = tensor.numel();
    let dtype = tensor.dtype();

    // Safety: tensor is contiguous, ptr is valid device pointer with `count` elements of `dtype`
    unsafe {
        comm.all_reduce(ptr, count, dtype, op)
            .map_err(|e| Error::DistributedError {
                reason: format!("all_reduce failed: {e}"),
            })?;
    }

    Ok(())
}

/// All-reduce one host scalar across ranks and return the reduced value.
///
/// The scalar is staged through a one-element F64 tensor on `device`.
/// Every rank must call this at the same point; with `world_size <= 1`
/// the value is returned unchanged without touching the communicator.
pub fn all_reduce_scalar<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    value: f64,
    op: ReduceOp,
    device: &R::Device,
) -> Result<f64> {
    if comm.world_size() <= 1 {
        return Ok(value);
    }

    let staged = Tensor::<R>::from_slice(&[value], &[1], device);
    all_reduce_tensor(comm, &staged, op)?;

    comm.sync().map_err(|e| Error::DistributedError {
        reason: format!("sync after scalar all_reduce failed: {e}"),
    })?;

    Ok(staged.to_vec::<f64>()[0])
}
