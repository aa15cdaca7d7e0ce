// src/config.rs
//
// Engine configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

// Default engine configuration
pub const DEFAULT_TICK_PERIOD_MS: u64 = 10;
pub const DEFAULT_SAMPLE_RATE: f64 = 48_000.0;
pub const DEFAULT_BPM: f64 = 120.0;
pub const DEFAULT_SCRIPT_OP_BUDGET: u64 = 100_000;
pub const DEFAULT_MAX_LOG_LINES: usize = 100;

/// Specification id of the generative-music service block.
///
/// Its lifecycle lives entirely in the audio backend, so the logic engine
/// never runs its logic body.
pub const GENERATIVE_SERVICE_SPEC_ID: &str = "generative-music";

/// Configuration for the logic engine and its tick loop.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Period of the logic tick timer in milliseconds.
    pub tick_period_ms: u64,

    /// Sample rate reported to block logic when no backend supplies one.
    pub default_sample_rate: f64,

    /// Initial global tempo in BPM.
    pub default_bpm: f64,

    /// Maximum interpreter steps one block may take per tick.
    pub script_op_budget: u64,

    /// Per-instance log cap (oldest lines are dropped).
    pub max_log_lines: usize,

    /// Specification id the logic engine skips.
    pub generative_spec_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: DEFAULT_TICK_PERIOD_MS,
            default_sample_rate: DEFAULT_SAMPLE_RATE,
            default_bpm: DEFAULT_BPM,
            script_op_budget: DEFAULT_SCRIPT_OP_BUDGET,
            max_log_lines: DEFAULT_MAX_LOG_LINES,
            generative_spec_id: GENERATIVE_SERVICE_SPEC_ID.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_period_ms == 0 {
            return Err(ConfigError::Invalid("tickPeriodMs must be positive".into()));
        }
        if !(self.default_sample_rate > 0.0) {
            return Err(ConfigError::Invalid(
                "defaultSampleRate must be positive".into(),
            ));
        }
        if self.script_op_budget == 0 {
            return Err(ConfigError::Invalid("scriptOpBudget must be positive".into()));
        }
        Ok(())
    }

    #[inline]
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }
}
