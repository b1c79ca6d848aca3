//! Configuration
//!
//! Options are plain serde structs with defaults for every field, so a
//! partial JSON document (or none at all) is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Bounds for one render pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    /// Maximum nesting of block-and-render async directives. A directive
    /// that would exceed it renders its fallback marked `timeout`.
    pub max_depth: usize,

    /// Wall-clock budget of the whole pass, in milliseconds. Once spent,
    /// every block-and-render directive renders its fallback marked
    /// `timeout`.
    pub timeout_ms: u64,

    /// Optional limit on each streamed unit, in milliseconds.
    pub stream_timeout_ms: Option<u64>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            max_depth: 10,
            timeout_ms: 5_000,
            stream_timeout_ms: None,
        }
    }
}

impl RenderOptions {
    /// Load options from JSON text. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// The pass budget.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The per-unit streaming limit, if any.
    pub fn stream_timeout(&self) -> Option<Duration> {
        self.stream_timeout_ms.map(Duration::from_millis)
    }

    /// Set `max_depth`.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Set the pass budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the per-unit streaming limit.
    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// How directives are spelled in markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Prefix of directive attributes and element tags.
    pub prefix: String,

    /// Attribute whose object value initializes a node's local scope.
    pub data_attribute: String,

    /// Prefix of dynamic attribute bindings.
    pub bind_prefix: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            prefix: "x-".to_string(),
            data_attribute: "x-data".to_string(),
            bind_prefix: ":".to_string(),
        }
    }
}
