//! Gradient averaging for data-parallel replication.

use crate::distributed::comm_utils::all_reduce_tensor;
use crate::error::{Error, Result};
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::ScalarOps;
use numr::runtime::{Communicator, ReduceOp, Runtime, RuntimeClient};
use numr::tensor::TensorId;

/// AllReduce the gradients of `parameters` (in-place sum, then average by world_size).
///
/// Each gradient tensor is all-reduced with `ReduceOp::Sum` across all ranks,
/// then divided by `world_size` to produce the average gradient. After this,
/// every replica holds identical gradients, so local clipping gives the same
/// result on every rank.
///
/// Collectives are issued in `parameters` order, never in `GradStore`
/// iteration order, which differs between processes. Every rank must pass the
/// same `parameters` and hold gradients for the same subset of them.
///
/// # Errors
///
/// Returns `DistributedError` if any tensor is non-contiguous or if a
/// communicator operation fails.
pub fn all_reduce_grads<R, C>(
    comm: &dyn Communicator,
    client: &C,
    parameters: &[TensorId],
    grads: &mut GradStore<R>,
) -> Result<()>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + ScalarOps<R>,
{
    let world_size = comm.world_size();
    if world_size <= 1 {
        return Ok(());
    }

    let ids = reduction_order(parameters, grads);

    for id in &ids {
        let tensor = grads.get(*id).ok_or_else(|| Error::DistributedError {
            reason: "gradient disappeared during iteration".to_string(),
        })?;

        all_reduce_tensor(comm, tensor, ReduceOp::Sum)?;
    }

    comm.sync().map_err(|e| Error::DistributedError {
        reason: format!("sync after all_reduce failed: {e}"),
    })?;

    let scale = 1.0 / world_size as f64;
    for id in &ids {
        let tensor = grads.get(*id).ok_or_else(|| Error::DistributedError {
            reason: "gradient disappeared during averaging iteration".to_string(),
        })?;
        let scaled = client.mul_scalar(tensor, scale)?;
        grads.insert(*id, scaled);
    }

    tracing::debug!(world_size, tensors = ids.len(), "averaged gradients across replicas");
    Ok(())
}

/// Ids of `parameters` that have a gradient, in parameter order.
fn reduction_order<R: Runtime<DType = DType>>(
    parameters: &[TensorId],
    grads: &GradStore<R>,
) -> Vec<TensorId> {
    parameters
        .iter()
        .copied()
        .filter(|&id| grads.get(id).is_some())
        .collect()
}
