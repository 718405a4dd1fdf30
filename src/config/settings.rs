use std::collections::HashSet;
use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use rand::Rng;
use serde::Deserialize;

use crate::error::ConfigValidationError;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// Connection manager configuration, fixed for the lifetime of a manager
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Maximum number of live (non-errored) connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Reconnect attempts per failure episode before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Keepalive probe period; silence for twice this long marks a connection stale
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// First reconnect delay, doubled on every further attempt
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Upper bound on a single connect
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Drain loop cadence
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    /// Messages taken from each queue per drain pass
    #[serde(default = "default_drain_batch_size")]
    pub drain_batch_size: usize,
    /// Hand still-open sockets to the pool on removal instead of closing them
    #[serde(default)]
    pub reuse_idle_sockets: bool,
}

fn default_max_connections() -> usize {
    10
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_drain_interval_ms() -> u64 {
    16 // one frame at 60Hz
}

fn default_drain_batch_size() -> usize {
    10
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            drain_interval_ms: default_drain_interval_ms(),
            drain_batch_size: default_drain_batch_size(),
            reuse_idle_sockets: false,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let positive = [
            ("max_connections", self.max_connections as u64),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("reconnect_base_delay_ms", self.reconnect_base_delay_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("drain_interval_ms", self.drain_interval_ms),
            ("drain_batch_size", self.drain_batch_size as u64),
        ];

        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigValidationError {
                    field,
                    reason: "must be greater than 0",
                });
            }
        }
        Ok(())
    }

    /// Copy with `reconnect_base_delay_ms` randomized within `±factor`.
    ///
    /// The backoff itself is deterministic; give each connection its own
    /// jittered config to spread reconnect storms.
    pub fn with_jitter(&self, factor: f64) -> Self {
        let factor = factor.clamp(0.0, 1.0);
        let base = self.reconnect_base_delay_ms as f64;
        let spread = base * factor;

        let jittered = if spread > 0.0 {
            rand::rng().random_range((base - spread)..=(base + spread))
        } else {
            base
        };

        Self {
            reconnect_base_delay_ms: (jittered.round() as u64).max(1),
            ..self.clone()
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,
    /// Export spans over OTLP
    #[serde(default)]
    pub otel_enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "ara-realtime-link".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json_logs: false,
            otel_enabled: false,
            otel_endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

/// A connection to open at startup
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("connection.max_connections", 10)?
            .set_default("connection.heartbeat_interval_ms", 30_000)?
            .set_default("connection.connect_timeout_ms", 10_000)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // CONNECTION__MAX_CONNECTIONS, TELEMETRY__JSON_LOGS, ...
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Load from every source and reject values the manager cannot run with
    pub fn load() -> crate::error::Result<Self> {
        let settings = Self::new()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.connection.validate()?;

        let mut ids = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.id.is_empty() {
                return Err(ConfigValidationError {
                    field: "endpoints.id",
                    reason: "must not be empty",
                });
            }
            if !ids.insert(endpoint.id.as_str()) {
                return Err(ConfigValidationError {
                    field: "endpoints.id",
                    reason: "must be unique",
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.drain_interval_ms, 16);
        assert_eq!(config.drain_batch_size, 10);
        assert!(!config.reuse_idle_sockets);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = ConnectionConfig {
            heartbeat_interval_ms: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.field, "heartbeat_interval_ms");
    }

    #[test]
    fn test_zero_reconnect_attempts_is_valid() {
        let config = ConnectionConfig {
            max_reconnect_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = ConnectionConfig {
            reconnect_base_delay_ms: 1_000,
            ..Default::default()
        };
        for _ in 0..100 {
            let jittered = config.with_jitter(0.2);
            assert!((800..=1_200).contains(&jittered.reconnect_base_delay_ms));
            assert_eq!(jittered.max_connections, config.max_connections);
        }
        assert_eq!(config.with_jitter(0.0).reconnect_base_delay_ms, 1_000);
    }

    fn settings_from_json(json: &str) -> Settings {
        Config::builder()
            .add_source(config::File::from_str(json, config::FileFormat::Json))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_duplicate_endpoint_ids_rejected() {
        let settings = settings_from_json(
            r#"{"endpoints": [{"id": "a", "url": "ws://localhost:9000/x"}, {"id": "a", "url": "ws://localhost:9000/y"}]}"#,
        );
        let err = settings.validate().unwrap_err();
        assert_eq!(err.field, "endpoints.id");
        assert_eq!(err.reason, "must be unique");

        let err: crate::error::AppError = err.into();
        assert!(err.to_string().starts_with("Validation error"));
    }

    #[test]
    fn test_invalid_connection_section_rejected() {
        let settings = settings_from_json(r#"{"connection": {"drain_batch_size": 0}}"#);
        assert_eq!(settings.validate().unwrap_err().field, "drain_batch_size");
    }

    #[test]
    fn test_settings_from_partial_json() {
        let settings: Settings = Config::builder()
            .add_source(config::File::from_str(
                r#"{"connection": {"max_connections": 2}, "endpoints": [{"id": "a", "url": "ws://localhost:9000/feed"}]}"#,
                config::FileFormat::Json,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.connection.max_connections, 2);
        assert_eq!(settings.connection.max_reconnect_attempts, 5);
        assert_eq!(settings.endpoints.len(), 1);
        assert!(settings.endpoints[0].subscriptions.is_empty());
        assert!(!settings.telemetry.otel_enabled);
    }
}
