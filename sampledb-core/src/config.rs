//! Engine configuration
//!
//! Every tunable of the core lives in [`EngineConfig`], which is passed to
//! [`Collection`](crate::Collection) constructors and flows from there into
//! views, save contexts and batchers. There is no process-wide mutable
//! engine state.
//!
//! # Defaults
//!
//! | key                       | default                     |
//! |---------------------------|-----------------------------|
//! | `default_batching`        | `Latency { target: 0.2s }`  |
//! | `static_batch_size`       | 100                         |
//! | `size_target_bytes`       | 1 MiB                       |
//! | `latency_target`          | 0.2 s                       |
//! | `adaptive_init_size`      | 10                          |
//! | `adaptive_min_size`       | 1                           |
//! | `adaptive_max_size`       | 100_000                     |
//! | `adaptive_max_beta`       | 2.0                         |
//! | `introspection_max_depth` | 8                           |
//! | `strict_fields`           | true                        |
//! | `sample_cache_capacity`   | 1024                        |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SampleDbError};

/// How a [`SaveContext`](crate::batching::SaveContext) decides to flush
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use sampledb_core::BatchingStrategy;
///
/// // Flush after every 3 registered mutations
/// let strategy = BatchingStrategy::Static { batch_size: 3 };
///
/// // Flush once ~1 MiB of serialized updates is pending
/// let strategy = BatchingStrategy::Size { target_bytes: 1 << 20 };
///
/// // Flush when 200ms passed since the last flush
/// let strategy = BatchingStrategy::Latency { target: Duration::from_millis(200) };
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum BatchingStrategy {
    /// Flush after `batch_size` registered mutations
    Static { batch_size: usize },

    /// Flush once the serialized size of pending mutations reaches the target
    Size { target_bytes: usize },

    /// Flush once the time since the last flush exceeds the target
    Latency {
        #[serde(with = "duration_secs")]
        target: Duration,
    },
}

impl Default for BatchingStrategy {
    fn default() -> Self {
        BatchingStrategy::Latency {
            target: Duration::from_millis(200),
        }
    }
}

impl BatchingStrategy {
    /// Build a strategy from its short name using the targets of `config`
    pub fn from_name(name: &str, config: &EngineConfig) -> Result<Self> {
        match name {
            "static" => Ok(BatchingStrategy::Static {
                batch_size: config.static_batch_size,
            }),
            "size" => Ok(BatchingStrategy::Size {
                target_bytes: config.size_target_bytes,
            }),
            "latency" => Ok(BatchingStrategy::Latency {
                target: config.latency_target,
            }),
            other => Err(SampleDbError::InvalidQuery(format!(
                "Unknown batching strategy '{}'",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BatchingStrategy::Static { .. } => "static",
            BatchingStrategy::Size { .. } => "size",
            BatchingStrategy::Latency { .. } => "latency",
        }
    }
}

/// Tunables threaded through collections, views and batchers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_batching: BatchingStrategy,
    pub static_batch_size: usize,
    pub size_target_bytes: usize,
    #[serde(with = "duration_secs")]
    pub latency_target: Duration,
    pub adaptive_init_size: usize,
    pub adaptive_min_size: usize,
    pub adaptive_max_size: usize,
    pub adaptive_max_beta: f64,
    /// Maximum number of introspection rounds of a dynamic schema scan
    pub introspection_max_depth: usize,
    /// Reject stages that reference undeclared fields
    pub strict_fields: bool,
    /// Upper bound of cached sample documents per collection
    pub sample_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            default_batching: BatchingStrategy::default(),
            static_batch_size: 100,
            size_target_bytes: 1 << 20,
            latency_target: Duration::from_millis(200),
            adaptive_init_size: 10,
            adaptive_min_size: 1,
            adaptive_max_size: 100_000,
            adaptive_max_beta: 2.0,
            introspection_max_depth: 8,
            strict_fields: true,
            sample_cache_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a (possibly partial) JSON object; missing keys keep their defaults
    pub fn from_json(value: &Value) -> Result<Self> {
        let config: EngineConfig = serde_json::from_value(value.clone())?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_default_batching(mut self, strategy: BatchingStrategy) -> Self {
        self.default_batching = strategy;
        self
    }

    pub fn with_adaptive_bounds(mut self, init: usize, min: usize, max: usize) -> Self {
        self.adaptive_init_size = init;
        self.adaptive_min_size = min;
        self.adaptive_max_size = max;
        self
    }

    pub fn with_max_beta(mut self, max_beta: f64) -> Self {
        self.adaptive_max_beta = max_beta;
        self
    }

    pub fn with_introspection_max_depth(mut self, depth: usize) -> Self {
        self.introspection_max_depth = depth;
        self
    }

    pub fn with_strict_fields(mut self, strict: bool) -> Self {
        self.strict_fields = strict;
        self
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.adaptive_min_size == 0 || self.adaptive_min_size > self.adaptive_max_size {
            return Err(SampleDbError::InvalidQuery(format!(
                "adaptive batch bounds must satisfy 1 <= min ({}) <= max ({})",
                self.adaptive_min_size, self.adaptive_max_size
            )));
        }
        if self.adaptive_max_beta < 1.0 {
            return Err(SampleDbError::InvalidQuery(format!(
                "adaptive_max_beta must be >= 1.0, got {}",
                self.adaptive_max_beta
            )));
        }
        if let BatchingStrategy::Static { batch_size: 0 } = self.default_batching {
            return Err(SampleDbError::InvalidQuery(
                "static batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serialize `Duration` as fractional seconds
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "duration must be a non-negative number of seconds, got {}",
                secs
            )));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
