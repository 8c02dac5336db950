//! Engine configuration
//!
//! Plain JSON via serde. Every field has a default (`#[serde(default)]`), so
//! a config file only needs the keys it overrides:
//!
//! ```json
//! { "frame_pool_capacity": 8, "ready_bound": 3 }
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::core::frame::frame_duration;
use crate::core::scheduler::SchedulerConfig;
use crate::core::shared_pool::DEFAULT_READY_BOUND;

/// Default config file name (see `paths::config_file`)
pub const CONFIG_FILE: &str = "playout.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Max frames allocated per generation (decoder backpressure bound)
    pub frame_pool_capacity: usize,
    /// Max published-but-unread shared surfaces
    pub ready_bound: usize,
    pub flush_timeout_ms: u64,
    pub close_timeout_ms: u64,
    /// Used for frames submitted without a duration
    pub nominal_frame_rate: f64,
    /// Target color when there is nothing to show
    pub fallback_color: [f32; 4],
    pub scheduler_thread_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_pool_capacity: 4,
            ready_bound: DEFAULT_READY_BOUND,
            flush_timeout_ms: 500,
            close_timeout_ms: 1000,
            nominal_frame_rate: 30.0,
            fallback_color: [0.0, 0.0, 0.0, 1.0],
            scheduler_thread_name: "playout-scheduler".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let mut config: EngineConfig = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.validate();
        debug!("Config loaded from {}", path.display());
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Clamp values into their valid ranges
    pub fn validate(&mut self) {
        if self.frame_pool_capacity == 0 {
            warn!("frame_pool_capacity 0 is invalid, using 1");
            self.frame_pool_capacity = 1;
        }
        if self.ready_bound == 0 {
            warn!("ready_bound 0 is invalid, using 1");
            self.ready_bound = 1;
        }
        if !self.nominal_frame_rate.is_finite() || self.nominal_frame_rate <= 0.0 {
            warn!(
                "nominal_frame_rate {} is invalid, using 30",
                self.nominal_frame_rate
            );
            self.nominal_frame_rate = 30.0;
        }
        if self.scheduler_thread_name.is_empty() {
            self.scheduler_thread_name = Self::default().scheduler_thread_name;
        }
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            thread_name: self.scheduler_thread_name.clone(),
            flush_timeout: self.flush_timeout(),
            nominal_duration: frame_duration(self.nominal_frame_rate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{ "ready_bound": 3 }"#).unwrap();
        assert_eq!(config.ready_bound, 3);
        assert_eq!(config.frame_pool_capacity, 4);
        assert_eq!(config.flush_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_validate_clamps() {
        let mut config = EngineConfig {
            frame_pool_capacity: 0,
            ready_bound: 0,
            nominal_frame_rate: -1.0,
            scheduler_thread_name: String::new(),
            ..Default::default()
        };
        config.validate();
        assert_eq!(config.frame_pool_capacity, 1);
        assert_eq!(config.ready_bound, 1);
        assert_eq!(config.nominal_frame_rate, 30.0);
        assert_eq!(config.scheduler_thread_name, "playout-scheduler");
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("playout-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);

        let config = EngineConfig {
            frame_pool_capacity: 6,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_file() {
        let path = std::env::temp_dir().join("playout-does-not-exist.json");
        assert!(EngineConfig::load(&path).is_err());
        assert_eq!(EngineConfig::load_or_default(&path).unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_scheduler_config_duration() {
        let config = EngineConfig::default();
        assert_eq!(config.scheduler_config().nominal_duration, 33_333);
    }
}
