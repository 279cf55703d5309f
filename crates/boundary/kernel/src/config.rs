//! Kernel configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use boundary_types::GateId;
use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// Budgets and redaction settings for the kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Default evaluation budget per gate, in milliseconds
    #[serde(default = "default_gate_timeout")]
    pub gate_timeout_ms: u64,

    /// Per-gate overrides keyed by gate id (`K1`..`K8`)
    #[serde(default)]
    pub gate_timeouts: BTreeMap<String, u64>,

    /// Budget for a suspended gate to be resolved, in milliseconds
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_ms: u64,

    /// Budget for one audit ledger append, in milliseconds
    #[serde(default = "default_ledger_timeout")]
    pub ledger_timeout_ms: u64,

    /// Payload keys whose shape is withheld from audit summaries
    #[serde(default = "default_redact_fields")]
    pub redact_fields: Vec<String>,

    /// Capacity of the broadcast event sink
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            gate_timeout_ms: default_gate_timeout(),
            gate_timeouts: BTreeMap::new(),
            approval_timeout_ms: default_approval_timeout(),
            ledger_timeout_ms: default_ledger_timeout(),
            redact_fields: default_redact_fields(),
            event_buffer: default_event_buffer(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_gate_timeout() -> u64 {
    5_000
}

fn default_approval_timeout() -> u64 {
    300_000
}

fn default_ledger_timeout() -> u64 {
    10_000
}

fn default_redact_fields() -> Vec<String> {
    ["password", "secret", "token", "api_key", "authorization"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_event_buffer() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

impl KernelConfig {
    /// Load configuration: defaults, then an optional file, then `BOUNDARY__*`
    /// environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, KernelError> {
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&KernelConfig::default())
                .map_err(|e| KernelError::Config(e.to_string()))?,
        );

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("BOUNDARY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: KernelConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| KernelError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject zero budgets and unknown gate ids.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.gate_timeout_ms == 0 {
            return Err(KernelError::Config("gate_timeout_ms must be > 0".into()));
        }
        if self.approval_timeout_ms == 0 {
            return Err(KernelError::Config("approval_timeout_ms must be > 0".into()));
        }
        if self.ledger_timeout_ms == 0 {
            return Err(KernelError::Config("ledger_timeout_ms must be > 0".into()));
        }
        if self.event_buffer == 0 {
            return Err(KernelError::Config("event_buffer must be > 0".into()));
        }
        for (gate, ms) in &self.gate_timeouts {
            gate.parse::<GateId>()
                .map_err(|e| KernelError::Config(e.to_string()))?;
            if *ms == 0 {
                return Err(KernelError::Config(format!(
                    "gate_timeouts.{gate} must be > 0"
                )));
            }
        }
        Ok(())
    }

    /// Evaluation budget for one gate.
    pub fn gate_budget(&self, gate: GateId) -> Duration {
        let ms = self
            .gate_timeouts
            .iter()
            .find(|(k, _)| k.parse::<GateId>().ok() == Some(gate))
            .map(|(_, ms)| *ms)
            .unwrap_or(self.gate_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn approval_budget(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }

    pub fn ledger_budget(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = KernelConfig::default();
        assert_eq!(config.gate_timeout_ms, 5_000);
        assert_eq!(config.approval_timeout_ms, 300_000);
        assert!(config.redact_fields.contains(&"password".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn gate_budget_override() {
        let mut config = KernelConfig::default();
        config.gate_timeouts.insert("K7".into(), 50);
        assert_eq!(config.gate_budget(GateId::K7), Duration::from_millis(50));
        assert_eq!(config.gate_budget(GateId::K1), Duration::from_millis(5_000));
    }

    #[test]
    fn validate_rejects_zero_budget() {
        let config = KernelConfig {
            ledger_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(KernelError::Config(_))));
    }

    #[test]
    fn validate_rejects_unknown_gate() {
        let mut config = KernelConfig::default();
        config.gate_timeouts.insert("K9".into(), 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "gate_timeout_ms = 250").unwrap();
        writeln!(file, "ledger_timeout_ms = 900").unwrap();
        writeln!(file, "[logging]").unwrap();
        writeln!(file, "json = true").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = KernelConfig::load(Some(&path)).unwrap();
        assert_eq!(config.gate_timeout_ms, 250);
        assert_eq!(config.ledger_timeout_ms, 900);
        assert!(config.logging.json);
        assert_eq!(config.approval_timeout_ms, 300_000);
    }

    #[test]
    fn environment_uses_double_underscore_prefix() {
        std::env::set_var("BOUNDARY__EVENT_BUFFER", "64");
        std::env::set_var("BOUNDARY__LOGGING__LEVEL", "debug");
        std::env::set_var("BOUNDARY_APPROVAL_TIMEOUT_MS", "7");
        let config = KernelConfig::load(None);
        std::env::remove_var("BOUNDARY__EVENT_BUFFER");
        std::env::remove_var("BOUNDARY__LOGGING__LEVEL");
        std::env::remove_var("BOUNDARY_APPROVAL_TIMEOUT_MS");

        let config = config.unwrap();
        assert_eq!(config.event_buffer, 64);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.approval_timeout_ms, 300_000);
    }
}
