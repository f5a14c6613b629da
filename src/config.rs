//! # Configuration Management
//!
//! This module handles loading and managing application configuration from
//! multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_STREAMING_MAX_CHUNK_BYTES, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, streaming, usage)
/// makes it easier to understand and maintain as the application grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub streaming: StreamingConfig,
    pub usage: UsageConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Knobs for the live-transcription streaming protocol.
///
/// ## Fields:
/// - `max_chunk_bytes`: Hard cap on a single audio chunk after decoding.
///   Oversize chunks are rejected with `PAYLOAD_TOO_LARGE`.
/// - `partial_throttle_ms`: Minimum spacing between two partial-transcript
///   broadcasts for the same session.
/// - `heartbeat_interval_secs` / `client_timeout_secs`: WebSocket ping
///   cadence and how long a silent client is tolerated before the
///   connection is dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub max_chunk_bytes: usize,
    pub partial_throttle_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Usage-accounting configuration.
///
/// ## Fields:
/// - `preflight_probe_minutes`: Minimal amount probed against the quota at
///   join time, before the real session duration is known. The actual
///   elapsed duration is recorded separately at session end; the two-phase
///   check/record is deliberately not atomic (a burst of joins can pass the
///   probe and collectively overrun the quota before any records land).
/// - `quota_recheck_secs`: How often an active authenticated session is
///   re-checked against its quota. Exhaustion mid-stream force-ends the
///   session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    pub preflight_probe_minutes: f64,
    pub quota_recheck_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            streaming: StreamingConfig {
                max_chunk_bytes: 512 * 1024, // protocol hard cap per message
                partial_throttle_ms: 300,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            usage: UsageConfig {
                preflight_probe_minutes: 1.0,
                quota_recheck_secs: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///    (deployment platforms set these without the APP_ prefix)
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors early prevents runtime failures and
    /// provides clear error messages about what's wrong.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.streaming.max_chunk_bytes == 0 {
            return Err(anyhow::anyhow!("Max chunk size must be greater than 0"));
        }

        if self.streaming.client_timeout_secs <= self.streaming.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than the heartbeat interval"
            ));
        }

        if self.usage.preflight_probe_minutes <= 0.0 {
            return Err(anyhow::anyhow!(
                "Pre-flight probe minutes must be greater than 0"
            ));
        }

        if self.usage.quota_recheck_secs == 0 {
            return Err(anyhow::anyhow!(
                "Quota re-check interval must be greater than 0"
            ));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed. For example,
    /// `{"streaming": {"partial_throttle_ms": 500}}` changes only the
    /// partial throttle. The updated configuration is re-validated before
    /// being accepted.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(streaming) = partial_config.get("streaming") {
            if let Some(cap) = streaming.get("max_chunk_bytes").and_then(|v| v.as_u64()) {
                self.streaming.max_chunk_bytes = cap as usize;
            }
            if let Some(throttle) = streaming.get("partial_throttle_ms").and_then(|v| v.as_u64()) {
                self.streaming.partial_throttle_ms = throttle;
            }
            if let Some(hb) = streaming
                .get("heartbeat_interval_secs")
                .and_then(|v| v.as_u64())
            {
                self.streaming.heartbeat_interval_secs = hb;
            }
            if let Some(timeout) = streaming
                .get("client_timeout_secs")
                .and_then(|v| v.as_u64())
            {
                self.streaming.client_timeout_secs = timeout;
            }
        }

        if let Some(usage) = partial_config.get("usage") {
            if let Some(probe) = usage
                .get("preflight_probe_minutes")
                .and_then(|v| v.as_f64())
            {
                self.usage.preflight_probe_minutes = probe;
            }
            if let Some(recheck) = usage.get("quota_recheck_secs").and_then(|v| v.as_u64()) {
                self.usage.quota_recheck_secs = recheck;
            }
        }

        self.validate()?;
        Ok(())
    }
}
