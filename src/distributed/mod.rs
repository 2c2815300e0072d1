pub mod comm_utils;
pub mod grad_sync;

pub use comm_utils::{all_reduce_scalar, all_reduce_tensor};
pub use grad_sync::all_reduce_grads;
