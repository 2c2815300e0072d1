//! # accelr
//!
//! **Strategy-aware gradient clipping for numr training loops.**
//!
//! accelr sits between a numr training loop and its optimizer. It knows how
//! parameters and gradients are laid out (one device, replicated across
//! ranks, sharded across ranks, or owned by an optimizer engine) and at what
//! precision they were produced, and clips gradients accordingly. It uses
//! numr's tensors, gradient stores and communicators directly.
//!
//! ## Relationship to numr
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   accelr ◄── YOU ARE HERE               │
//! │   (Fabric, strategies, precision plugin, clipping)      │
//! └──────────────────────────┬──────────────────────────────┘
//! │                      numr                                │
//! │   (tensors, ops, runtime, autograd, communicators)       │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Capability table**: each strategy reports which clip modes it can run;
//!   refusals are data, checked before any gradient is touched
//! - **Split norms**: partial reductions are separated from the final root so
//!   sharded strategies can all-reduce in between
//! - **Unscale once**: fp16 loss scaling is undone exactly once per step,
//!   however many times clipping is requested

pub mod clip;
pub mod config;
pub mod distributed;
pub mod error;
pub mod fabric;
pub mod precision;
pub mod strategy;

pub use clip::{ClipMode, ClipSpec, NonFinitePolicy, NormClip, ValueClip};
pub use config::{ClipConfig, FabricConfig, StrategyKind};
pub use error::{Error, Result};
pub use fabric::{ClipArgs, Fabric};
pub use precision::{GradScaler, Precision, PrecisionPlugin};
pub use strategy::{AnyStrategy, Strategy, StrategyCapability};

// Re-export numr types that users will commonly need
pub use numr::autograd::GradStore;
pub use numr::dtype::DType;
pub use numr::error::{Error as NumrError, Result as NumrResult};
pub use numr::runtime::{Communicator, Runtime, RuntimeClient};
pub use numr::tensor::{Tensor, TensorId};

#[cfg(test)]
pub(crate) mod test_utils {
    use numr::runtime::cpu::{CpuClient, CpuDevice};

    /// Create a CPU client and device for use in unit tests.
    pub(crate) fn cpu_setup() -> (CpuClient, CpuDevice) {
        let device = CpuDevice::new();
        let client = CpuClient::new(device.clone());
        (client, device)
    }
}
