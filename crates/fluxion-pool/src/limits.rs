//! Worker resource limits.

use serde::{Deserialize, Serialize};

pub(crate) const MB: u64 = 1024 * 1024;

/// Resource caps applied to one worker.
///
/// Heap and stack sizes are fixed at spawn; the rest are runtime guards the
/// supervisor enforces per request or per memory sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorOptions {
    pub max_old_generation_size_mb: u64,
    pub max_young_generation_size_mb: u64,
    pub stack_size_mb: u64,
    pub request_timeout_ms: u64,
    pub max_inflight: usize,
    pub memory_soft_limit_mb: u64,
    pub memory_hard_limit_mb: u64,
    pub memory_sample_interval_ms: u64,
    pub max_response_bytes: u64,
    /// Soft-limit breaches normally wait for the worker to go idle before
    /// restarting it; set this to restart immediately regardless.
    pub restart_on_soft_limit_when_busy: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_old_generation_size_mb: 128,
            max_young_generation_size_mb: 32,
            stack_size_mb: 4,
            request_timeout_ms: 3000,
            max_inflight: 64,
            memory_soft_limit_mb: 96,
            memory_hard_limit_mb: 128,
            memory_sample_interval_ms: 5000,
            max_response_bytes: 16 * MB,
            restart_on_soft_limit_when_busy: false,
        }
    }
}

impl ExecutorOptions {
    pub fn with_overrides(&self, overrides: &ExecutorOverrides) -> Self {
        let mut options = self.clone();
        overrides.apply(&mut options);
        options
    }
}

/// Per-worker overrides carried by a worker spec; unset fields keep the
/// pool-wide value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorOverrides {
    pub max_old_generation_size_mb: Option<u64>,
    pub max_young_generation_size_mb: Option<u64>,
    pub stack_size_mb: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub max_inflight: Option<usize>,
    pub memory_soft_limit_mb: Option<u64>,
    pub memory_hard_limit_mb: Option<u64>,
    pub memory_sample_interval_ms: Option<u64>,
    pub max_response_bytes: Option<u64>,
    pub restart_on_soft_limit_when_busy: Option<bool>,
}

impl ExecutorOverrides {
    pub fn apply(&self, options: &mut ExecutorOptions) {
        if let Some(value) = self.max_old_generation_size_mb {
            options.max_old_generation_size_mb = value;
        }
        if let Some(value) = self.max_young_generation_size_mb {
            options.max_young_generation_size_mb = value;
        }
        if let Some(value) = self.stack_size_mb {
            options.stack_size_mb = value;
        }
        if let Some(value) = self.request_timeout_ms {
            options.request_timeout_ms = value;
        }
        if let Some(value) = self.max_inflight {
            options.max_inflight = value;
        }
        if let Some(value) = self.memory_soft_limit_mb {
            options.memory_soft_limit_mb = value;
        }
        if let Some(value) = self.memory_hard_limit_mb {
            options.memory_hard_limit_mb = value;
        }
        if let Some(value) = self.memory_sample_interval_ms {
            options.memory_sample_interval_ms = value;
        }
        if let Some(value) = self.max_response_bytes {
            options.max_response_bytes = value;
        }
        if let Some(value) = self.restart_on_soft_limit_when_busy {
            options.restart_on_soft_limit_when_busy = value;
        }
    }
}
