//! Fabric and clipping configuration.

use std::path::Path;
use std::sync::Arc;

use crate::clip::ClipMode;
use crate::error::{Error, Result};
use crate::fabric::{ClipArgs, Fabric};
use crate::precision::Precision;
use crate::strategy::{
    AnyStrategy, DataParallelStrategy, InternalOptimizerConfig, InternalOptimizerStrategy,
    ShardedStrategy, SingleDeviceStrategy,
};
use numr::dtype::DType;
use numr::runtime::{Communicator, Runtime};
use serde::{Deserialize, Serialize};

/// Strategy selector as written in configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// `single_device` for one rank, `ddp` otherwise
    #[default]
    Auto,
    SingleDevice,
    Dp,
    Ddp,
    Fsdp,
    Deepspeed,
}

/// Top-level run configuration: how to distribute and at what precision.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FabricConfig {
    #[serde(default)]
    pub strategy: StrategyKind,

    #[serde(default)]
    pub precision: Precision,

    /// Settings for the `deepspeed` strategy's internal clipping
    #[serde(default)]
    pub deepspeed: InternalOptimizerConfig,

    /// Clipping applied by `Fabric::clip_with_config`
    #[serde(default)]
    pub clip: ClipConfig,
}

impl FabricConfig {
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_clip(mut self, clip: ClipConfig) -> Self {
        self.clip = clip;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(max_norm) = self.deepspeed.gradient_clipping {
            if !(max_norm > 0.0) || !max_norm.is_finite() {
                return Err(Error::ConfigError {
                    reason: format!(
                        "deepspeed.gradient_clipping must be positive and finite, got {max_norm}"
                    ),
                });
            }
        }
        self.clip.validate()
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| Error::ConfigError {
            reason: format!("YAML parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::ConfigError {
            reason: format!("IO error: {e}"),
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::ConfigError {
            reason: format!("IO error: {e}"),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| Error::ConfigError {
            reason: format!("JSON parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Instantiate the configured strategy.
    ///
    /// `comm` is this process's communicator and `device` its compute device;
    /// single-process strategies ignore them.
    pub fn build_strategy<R: Runtime<DType = DType>>(
        &self,
        comm: Arc<dyn Communicator>,
        device: R::Device,
    ) -> Result<AnyStrategy<R>> {
        let world_size = comm.world_size();
        let strategy: AnyStrategy<R> = match self.strategy {
            StrategyKind::Auto if world_size > 1 => DataParallelStrategy::new(comm).into(),
            StrategyKind::Auto => SingleDeviceStrategy.into(),
            StrategyKind::SingleDevice if world_size > 1 => {
                return Err(Error::ConfigError {
                    reason: format!(
                        "strategy 'single_device' cannot run with world size {world_size}"
                    ),
                });
            }
            StrategyKind::SingleDevice => SingleDeviceStrategy.into(),
            StrategyKind::Dp => DataParallelStrategy::replicated().into(),
            StrategyKind::Ddp => DataParallelStrategy::new(comm).into(),
            StrategyKind::Fsdp => ShardedStrategy::new(comm, device).into(),
            StrategyKind::Deepspeed => InternalOptimizerStrategy::new(self.deepspeed).into(),
        };
        Ok(strategy)
    }

    /// Build a [`Fabric`] for this process.
    pub fn build<R: Runtime<DType = DType>>(
        &self,
        comm: Arc<dyn Communicator>,
        device: R::Device,
    ) -> Result<Fabric<R>> {
        self.validate()?;
        let strategy = self.build_strategy(comm, device)?;
        Ok(Fabric::new(strategy, self.precision))
    }
}

/// Training-config driven clipping.
///
/// `gradient_clip_val` of `None` or `0` disables clipping. The value is a
/// max norm or a clamp bound depending on `gradient_clip_algorithm`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipConfig {
    pub gradient_clip_val: Option<f64>,
    pub gradient_clip_algorithm: ClipMode,
    pub norm_type: f64,
    pub error_if_nonfinite: bool,
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            gradient_clip_val: None,
            gradient_clip_algorithm: ClipMode::Norm,
            norm_type: 2.0,
            error_if_nonfinite: true,
        }
    }
}

impl ClipConfig {
    pub fn with_gradient_clip_val(mut self, val: f64) -> Self {
        self.gradient_clip_val = Some(val);
        self
    }

    pub fn with_gradient_clip_algorithm(mut self, algorithm: ClipMode) -> Self {
        self.gradient_clip_algorithm = algorithm;
        self
    }

    pub fn with_norm_type(mut self, norm_type: f64) -> Self {
        self.norm_type = norm_type;
        self
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.gradient_clip_val, Some(v) if v != 0.0)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(val) = self.gradient_clip_val {
            if !(val >= 0.0) || !val.is_finite() {
                return Err(Error::ConfigError {
                    reason: format!("gradient_clip_val must be non-negative and finite, got {val}"),
                });
            }
        }
        if !(self.norm_type > 0.0) {
            return Err(Error::ConfigError {
                reason: format!("norm_type must be positive, got {}", self.norm_type),
            });
        }
        Ok(())
    }

    /// Call arguments equivalent to this config, or `None` when disabled.
    pub fn to_clip_args(&self) -> Option<ClipArgs> {
        if !self.is_enabled() {
            return None;
        }
        let val = self.gradient_clip_val?;
        let args = match self.gradient_clip_algorithm {
            ClipMode::Norm => ClipArgs::norm(val)
                .with_norm_type(self.norm_type)
                .with_error_if_nonfinite(self.error_if_nonfinite),
            ClipMode::Value => ClipArgs::value(val),
        };
        Some(args)
    }
}
