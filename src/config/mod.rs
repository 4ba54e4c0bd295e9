//! Configuration management
//!
//! Builds an immutable [`AppConfig`] once at startup from environment
//! variables, validating every range up front — invalid values abort the
//! process (§6.7, §9 "Global configuration"). Hot-reload is out of scope.

use crate::error::{HealError, HealResult};
use serde::{Deserialize, Serialize};

/// Loads configuration from the environment.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from environment variables, falling back to
    /// documented defaults, then validate.
    pub fn load_from_env() -> HealResult<AppConfig> {
        let mut config = AppConfig::default();

        if let Ok(val) = std::env::var("WP_HEAL_LOG_LEVEL") {
            config.logging.level = val;
        }
        if let Ok(val) = std::env::var("MAX_FIX_ATTEMPTS") {
            config.incident.max_fix_attempts = parse_env("MAX_FIX_ATTEMPTS", &val)?;
        }
        if let Ok(val) = std::env::var("INCIDENT_COOLDOWN_WINDOW") {
            config.incident.cooldown_window_secs = parse_env("INCIDENT_COOLDOWN_WINDOW", &val)?;
        }
        if let Ok(val) = std::env::var("SSH_CONNECTION_TIMEOUT") {
            config.incident.ssh_connection_timeout_ms = parse_env("SSH_CONNECTION_TIMEOUT", &val)?;
        }
        if let Ok(val) = std::env::var("CIRCUIT_BREAKER_THRESHOLD") {
            config.circuit.failure_threshold = parse_env("CIRCUIT_BREAKER_THRESHOLD", &val)?;
        }
        if let Ok(val) = std::env::var("CIRCUIT_BREAKER_TIMEOUT") {
            config.circuit.recovery_timeout_ms = parse_env("CIRCUIT_BREAKER_TIMEOUT", &val)?;
        }
        if let Ok(val) = std::env::var("VERIFICATION_TIMEOUT") {
            config.incident.verification_timeout_ms = parse_env("VERIFICATION_TIMEOUT", &val)?;
        }
        if let Ok(val) = std::env::var("VERIFICATION_RETRY_ATTEMPTS") {
            config.incident.verification_retry_attempts =
                parse_env("VERIFICATION_RETRY_ATTEMPTS", &val)?;
        }
        if let Ok(val) = std::env::var("DEFAULT_RETENTION_DAYS") {
            config.retention.default_retention_days = parse_env("DEFAULT_RETENTION_DAYS", &val)?;
        }
        if let Ok(val) = std::env::var("MAX_RETENTION_DAYS") {
            config.retention.max_retention_days = parse_env("MAX_RETENTION_DAYS", &val)?;
        }
        if let Ok(val) = std::env::var("ENABLE_AUTO_PURGE") {
            config.retention.enable_auto_purge = parse_env("ENABLE_AUTO_PURGE", &val)?;
        }
        if let Ok(val) = std::env::var("ENABLE_DATA_ANONYMIZATION") {
            config.retention.enable_data_anonymization =
                parse_env("ENABLE_DATA_ANONYMIZATION", &val)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, val: &str) -> HealResult<T> {
    val.parse()
        .map_err(|_| HealError::Config(format!("{name}: invalid value {val:?}")))
}

/// Application configuration (§6.7). Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Service identity.
    pub service: ServiceConfig,
    /// Logging.
    pub logging: LoggingConfig,
    /// Incident state machine knobs.
    pub incident: IncidentConfig,
    /// Circuit breaker defaults.
    pub circuit: CircuitConfig,
    /// Flapping prevention defaults.
    pub flapping: FlappingConfig,
    /// Queue dispatcher concurrency.
    pub queue: QueueConfig,
    /// Retention coordinator knobs.
    pub retention: RetentionConfig,
}

impl AppConfig {
    /// Validate every sub-config. Invalid values abort the process.
    pub fn validate(&self) -> HealResult<()> {
        self.service.validate()?;
        self.logging.validate()?;
        self.incident.validate()?;
        self.circuit.validate()?;
        self.flapping.validate()?;
        self.queue.validate()?;
        self.retention.validate()?;
        Ok(())
    }
}

/// Service identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name.
    pub name: String,
    /// Service version.
    pub version: String,
}

impl ServiceConfig {
    fn validate(&self) -> HealResult<()> {
        if self.name.is_empty() {
            return Err(HealError::Config("service name cannot be empty".into()));
        }
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "wp-autoheal-core".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` env-filter level.
    pub level: String,
    /// Emit JSON-formatted log lines.
    pub json: bool,
}

impl LoggingConfig {
    fn validate(&self) -> HealResult<()> {
        let valid = ["trace", "debug", "info", "warn", "error"];
        if !valid.contains(&self.level.as_str()) {
            return Err(HealError::Config(format!("invalid log level: {}", self.level)));
        }
        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Incident state machine configuration (§6.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentConfig {
    /// `MAX_FIX_ATTEMPTS`, 1..20, default 15.
    pub max_fix_attempts: u32,
    /// `INCIDENT_COOLDOWN_WINDOW` seconds, 60..3600, default 600.
    pub cooldown_window_secs: u64,
    /// `SSH_CONNECTION_TIMEOUT` ms, 10_000..120_000.
    pub ssh_connection_timeout_ms: u64,
    /// `VERIFICATION_TIMEOUT` ms.
    pub verification_timeout_ms: u64,
    /// `VERIFICATION_RETRY_ATTEMPTS`, default 3.
    pub verification_retry_attempts: u32,
}

impl IncidentConfig {
    fn validate(&self) -> HealResult<()> {
        if !(1..=20).contains(&self.max_fix_attempts) {
            return Err(HealError::Config(format!(
                "max_fix_attempts must be in 1..=20, got {}",
                self.max_fix_attempts
            )));
        }
        if !(60..=3600).contains(&self.cooldown_window_secs) {
            return Err(HealError::Config(format!(
                "cooldown_window_secs must be in 60..=3600, got {}",
                self.cooldown_window_secs
            )));
        }
        if !(10_000..=120_000).contains(&self.ssh_connection_timeout_ms) {
            return Err(HealError::Config(format!(
                "ssh_connection_timeout_ms must be in 10000..=120000, got {}",
                self.ssh_connection_timeout_ms
            )));
        }
        Ok(())
    }
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            max_fix_attempts: 15,
            cooldown_window_secs: 600,
            ssh_connection_timeout_ms: 30_000,
            verification_timeout_ms: 30_000,
            verification_retry_attempts: 3,
        }
    }
}

/// Circuit breaker default configuration (§3 Circuit record config).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Failure count before tripping to OPEN.
    pub failure_threshold: u32,
    /// Time OPEN stays before admitting a probe (ms).
    pub recovery_timeout_ms: u64,
    /// Sliding monitoring window (ms).
    pub monitoring_period_ms: u64,
}

impl CircuitConfig {
    fn validate(&self) -> HealResult<()> {
        if self.failure_threshold == 0 {
            return Err(HealError::Config("failure_threshold must be >= 1".into()));
        }
        Ok(())
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            monitoring_period_ms: 300_000,
        }
    }
}

/// Flapping prevention default configuration (§3 Flapping record config).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlappingConfig {
    /// Rolling window width (ms).
    pub cooldown_window_ms: u64,
    /// Incidents-per-window before cooldown kicks in.
    pub max_incidents_per_window: u32,
    /// Incidents-per-window before `shouldEscalate` is set.
    pub escalation_threshold: u32,
}

impl FlappingConfig {
    fn validate(&self) -> HealResult<()> {
        if self.escalation_threshold < self.max_incidents_per_window {
            return Err(HealError::Config(
                "escalation_threshold must be >= max_incidents_per_window".into(),
            ));
        }
        Ok(())
    }
}

impl Default for FlappingConfig {
    fn default() -> Self {
        Self {
            cooldown_window_ms: 10 * 60 * 1000,
            max_incidents_per_window: 3,
            escalation_threshold: 5,
        }
    }
}

/// Queue dispatcher configuration (§4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueConfig {
    /// `incident-processing` concurrency.
    pub incident_processing_concurrency: usize,
    /// `data-retention` concurrency (sequential by default).
    pub data_retention_concurrency: usize,
    /// `health-checks` concurrency.
    pub health_checks_concurrency: usize,
}

impl QueueConfig {
    fn validate(&self) -> HealResult<()> {
        if self.incident_processing_concurrency == 0
            || self.data_retention_concurrency == 0
            || self.health_checks_concurrency == 0
        {
            return Err(HealError::Config("queue concurrency must be >= 1".into()));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            incident_processing_concurrency: 3,
            data_retention_concurrency: 1,
            health_checks_concurrency: 5,
        }
    }
}

/// Retention coordinator configuration (§6.7, §4.8).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// `DEFAULT_RETENTION_DAYS`, 1..7, default 3.
    pub default_retention_days: u32,
    /// `MAX_RETENTION_DAYS`, 1..7, default 7.
    pub max_retention_days: u32,
    /// `ENABLE_AUTO_PURGE`.
    pub enable_auto_purge: bool,
    /// `ENABLE_DATA_ANONYMIZATION`.
    pub enable_data_anonymization: bool,
}

impl RetentionConfig {
    fn validate(&self) -> HealResult<()> {
        if !(1..=7).contains(&self.default_retention_days) {
            return Err(HealError::Config(format!(
                "default_retention_days must be in 1..=7, got {}",
                self.default_retention_days
            )));
        }
        if !(1..=7).contains(&self.max_retention_days) {
            return Err(HealError::Config(format!(
                "max_retention_days must be in 1..=7, got {}",
                self.max_retention_days
            )));
        }
        if self.default_retention_days > self.max_retention_days {
            return Err(HealError::Config(
                "default_retention_days cannot exceed max_retention_days".into(),
            ));
        }
        Ok(())
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            default_retention_days: 3,
            max_retention_days: 7,
            enable_auto_purge: true,
            enable_data_anonymization: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn max_fix_attempts_boundaries() {
        let mut cfg = IncidentConfig::default();
        cfg.max_fix_attempts = 0;
        assert!(cfg.validate().is_err());
        cfg.max_fix_attempts = 1;
        assert!(cfg.validate().is_ok());
        cfg.max_fix_attempts = 20;
        assert!(cfg.validate().is_ok());
        cfg.max_fix_attempts = 21;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn retention_days_boundaries() {
        let mut cfg = RetentionConfig::default();
        for (days, ok) in [(0, false), (1, true), (7, true), (8, false)] {
            cfg.default_retention_days = days;
            cfg.max_retention_days = 7;
            assert_eq!(cfg.validate().is_ok(), ok, "days={days}");
        }
    }
}
