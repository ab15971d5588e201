//! Engine configuration
//!
//! Loaded from JSON. Every field has a default so partial files are fine:
//!
//! ```json
//! {
//!   "initial_capacity": 64,
//!   "default_entity_timeout_secs": 10.0,
//!   "max_group_candidates": 16
//! }
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MatchError, MatchResult};

/// Environment variable naming a config file read by [`EngineConfig::global`].
pub const CONFIG_ENV_VAR: &str = "LIVEMATCH_CONFIG";

static GLOBAL_CONFIG: Lazy<EngineConfig> = Lazy::new(|| {
    let Ok(path) = std::env::var(CONFIG_ENV_VAR) else {
        return EngineConfig::default();
    };
    match EngineConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            warn!("Ignoring config file {}: {}", path, e);
            EngineConfig::default()
        }
    }
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Slots allocated in the member store up front.
    pub initial_capacity: usize,
    /// Seconds a query may seek before it times out. Negative means never.
    pub default_entity_timeout_secs: f32,
    /// Best candidates per member considered when solving a group.
    pub max_group_candidates: usize,
    /// Seeking rows at or above which rating fans out across threads.
    pub parallel_rating_threshold: usize,
    /// Emit update events when matched data changes.
    pub emit_updates: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 8,
            default_entity_timeout_secs: -1.0,
            max_group_candidates: 16,
            parallel_rating_threshold: 256,
            emit_updates: true,
        }
    }
}

impl EngineConfig {
    /// Configuration read once per process from `LIVEMATCH_CONFIG`.
    pub fn global() -> &'static EngineConfig {
        &GLOBAL_CONFIG
    }

    pub fn from_json_str(json: &str) -> MatchResult<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> MatchResult<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> MatchResult<()> {
        if self.initial_capacity == 0 {
            return Err(MatchError::Config(
                "initial_capacity must be greater than zero".into(),
            ));
        }
        if self.max_group_candidates == 0 {
            return Err(MatchError::Config(
                "max_group_candidates must be greater than zero".into(),
            ));
        }
        if self.default_entity_timeout_secs.is_nan() {
            return Err(MatchError::Config(
                "default_entity_timeout_secs must be a number".into(),
            ));
        }
        Ok(())
    }

    /// The default timeout as a duration, `None` when queries never time out.
    pub fn default_timeout(&self) -> Option<Duration> {
        timeout_from_secs(self.default_entity_timeout_secs)
    }
}

pub(crate) fn timeout_from_secs(secs: f32) -> Option<Duration> {
    if secs < 0.0 {
        None
    } else {
        Duration::try_from_secs_f32(secs).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.default_timeout(), None);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = EngineConfig::from_json_str(r#"{ "initial_capacity": 32 }"#).unwrap();
        assert_eq!(cfg.initial_capacity, 32);
        assert_eq!(cfg.max_group_candidates, 16);
        assert!(cfg.emit_updates);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "initial_capacity": 0 }"#)
            .expect_err("config should be invalid");
        match err {
            MatchError::Config(msg) => assert!(msg.contains("initial_capacity")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_timeout_conversion() {
        let cfg = EngineConfig {
            default_entity_timeout_secs: 2.5,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.default_timeout(), Some(Duration::from_millis(2500)));
    }
}
