//! Gradient clipping algorithms
//!
//! Strategy-agnostic numeric core: given an ordered parameter set and a
//! `GradStore`, compute the joint Lp norm of all gradients and rescale them,
//! or clamp every element into a fixed range. Strategies decide *whether* a
//! mode is legal and *where* the reductions happen; this module only does the
//! math.

pub mod norm;
pub mod value;

pub use norm::{
    NORM_EPS, PartialNorm, clip_grad_norm, finish_norm, partial_norm, scale_grads, total_norm,
};
pub use value::clip_grad_value;

use crate::error::{Error, Result};
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{BinaryOps, ReduceOps, ScalarOps, TypeConversionOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::TensorId;
use serde::{Deserialize, Serialize};

/// Runtime client capabilities needed by every clipping path.
pub trait ClipClient<R: Runtime<DType = DType>>:
    RuntimeClient<R>
    + BinaryOps<R>
    + UnaryOps<R>
    + ScalarOps<R>
    + ReduceOps<R>
    + TypeConversionOps<R>
{
}

impl<R, C> ClipClient<R> for C
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R>
        + BinaryOps<R>
        + UnaryOps<R>
        + ScalarOps<R>
        + ReduceOps<R>
        + TypeConversionOps<R>,
{
}

/// What to do when the total norm comes out NaN or infinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonFinitePolicy {
    /// Fail with [`Error::NonFiniteGradient`] and leave gradients untouched.
    #[default]
    Error,
    /// Apply the (nonfinite) scale anyway; NaN/Inf reach the gradients.
    Propagate,
    /// Leave gradients untouched and report the norm.
    Ignore,
}

impl NonFinitePolicy {
    /// Policy equivalent of the `error_if_nonfinite` flag.
    pub fn from_error_flag(error_if_nonfinite: bool) -> Self {
        if error_if_nonfinite {
            Self::Error
        } else {
            Self::Propagate
        }
    }
}

/// Clip by joint Lp norm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormClip {
    pub max_norm: f64,
    /// Order of the norm; `f64::INFINITY` for the max-abs norm.
    pub norm_type: f64,
    pub nonfinite: NonFinitePolicy,
}

impl NormClip {
    /// L2 clipping with strict nonfinite checking.
    pub fn new(max_norm: f64) -> Self {
        Self {
            max_norm,
            norm_type: 2.0,
            nonfinite: NonFinitePolicy::Error,
        }
    }

    pub fn with_norm_type(mut self, norm_type: f64) -> Self {
        self.norm_type = norm_type;
        self
    }

    pub fn with_error_if_nonfinite(mut self, error_if_nonfinite: bool) -> Self {
        self.nonfinite = NonFinitePolicy::from_error_flag(error_if_nonfinite);
        self
    }

    pub fn with_nonfinite_policy(mut self, policy: NonFinitePolicy) -> Self {
        self.nonfinite = policy;
        self
    }

    pub fn error_if_nonfinite(&self) -> bool {
        self.nonfinite == NonFinitePolicy::Error
    }

    /// Reject non-positive thresholds and norm orders.
    pub fn validate(&self) -> Result<()> {
        if !(self.max_norm > 0.0) || !self.max_norm.is_finite() {
            return Err(Error::InvalidArgument {
                arg: "max_norm",
                reason: format!("must be positive and finite, got {}", self.max_norm),
            });
        }
        if !(self.norm_type > 0.0) {
            return Err(Error::InvalidArgument {
                arg: "norm_type",
                reason: format!("must be positive or infinity, got {}", self.norm_type),
            });
        }
        Ok(())
    }
}

/// Clip every element into `[-clip_val, clip_val]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueClip {
    pub clip_val: f64,
}

impl ValueClip {
    pub fn new(clip_val: f64) -> Self {
        Self { clip_val }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.clip_val >= 0.0) || !self.clip_val.is_finite() {
            return Err(Error::InvalidArgument {
                arg: "clip_val",
                reason: format!("must be non-negative and finite, got {}", self.clip_val),
            });
        }
        Ok(())
    }
}

/// A single, already-disambiguated clipping request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClipSpec {
    Norm(NormClip),
    Value(ValueClip),
}

impl ClipSpec {
    pub fn mode(&self) -> ClipMode {
        match self {
            ClipSpec::Norm(_) => ClipMode::Norm,
            ClipSpec::Value(_) => ClipMode::Value,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ClipSpec::Norm(spec) => spec.validate(),
            ClipSpec::Value(spec) => spec.validate(),
        }
    }
}

/// Clipping algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipMode {
    Norm,
    Value,
}

impl std::fmt::Display for ClipMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClipMode::Norm => write!(f, "norm"),
            ClipMode::Value => write!(f, "value"),
        }
    }
}

/// Ids from `parameters` that currently have a gradient, in parameter order.
///
/// Fails if any present gradient is not F32; clipping runs on master
/// gradients only.
pub(crate) fn grads_present<R: Runtime<DType = DType>>(
    parameters: &[TensorId],
    grads: &GradStore<R>,
) -> Result<Vec<TensorId>> {
    let mut ids = Vec::with_capacity(parameters.len());
    for &id in parameters {
        if let Some(grad) = grads.get(id) {
            if grad.dtype() != DType::F32 {
                return Err(Error::DTypeMismatch {
                    expected: DType::F32,
                    got: grad.dtype(),
                });
            }
            ids.push(id);
        }
    }
    Ok(ids)
}
