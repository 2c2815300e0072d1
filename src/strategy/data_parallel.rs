//! Replicated data parallelism
//!
//! Every rank holds the full model and a full gradient set. Once gradients
//! are averaged across ranks they are identical everywhere, so clipping is
//! the local algorithm and needs no further communication.

use std::sync::Arc;

use super::{Strategy, StrategyCapability};
use crate::distributed::all_reduce_grads;
use crate::error::Result;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::ScalarOps;
use numr::runtime::{Communicator, NoOpCommunicator, Runtime, RuntimeClient};
use numr::tensor::TensorId;

/// Data-parallel strategy ("ddp" across processes, "dp" within one process).
pub struct DataParallelStrategy {
    comm: Arc<dyn Communicator>,
    name: &'static str,
}

impl DataParallelStrategy {
    /// Multi-process replication over `comm`.
    pub fn new(comm: Arc<dyn Communicator>) -> Self {
        Self { comm, name: "ddp" }
    }

    /// Single-process replication; gradients are already gathered locally.
    pub fn replicated() -> Self {
        Self {
            comm: Arc::new(NoOpCommunicator),
            name: "dp",
        }
    }

    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// Average the gradients of `parameters` across ranks, in `parameters`
    /// order. Call after backward, before clipping.
    pub fn reduce_gradients<R, C>(
        &self,
        client: &C,
        parameters: &[TensorId],
        grads: &mut GradStore<R>,
    ) -> Result<()>
    where
        R: Runtime<DType = DType>,
        C: RuntimeClient<R> + ScalarOps<R>,
    {
        all_reduce_grads(self.comm.as_ref(), client, parameters, grads)
    }
}

impl<R: Runtime<DType = DType>> Strategy<R> for DataParallelStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn capability(&self) -> StrategyCapability {
        StrategyCapability::FULL
    }
}
