//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::ConfigError;

/// Intake engine configuration.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Websocket endpoint of the conversational agent service.
    pub agent_ws_url: Url,
    /// Local database path.
    pub db_path: PathBuf,
    /// Port for the REST status server.
    pub http_port: u16,
    /// How long to wait for the agent to drive a stage transition after a
    /// widget submission before advancing locally.
    pub fallback_timeout: Duration,
    /// Hard timeout for the initial agent connect.
    pub connect_timeout: Duration,
    /// Bounded retry attempts for progress-store saves.
    pub save_retry_attempts: u32,
    /// PCM sample rate for captured audio sent to the agent.
    pub sample_rate_hz: u32,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            agent_ws_url: Url::parse("wss://agent.vita.example/v1/live")
                .expect("default agent url"),
            db_path: PathBuf::from("./data/vita-intake.db"),
            http_port: 8080,
            fallback_timeout: Duration::from_secs(8),
            connect_timeout: Duration::from_secs(10),
            save_retry_attempts: 3,
            sample_rate_hz: 16_000,
        }
    }
}

impl IntakeConfig {
    /// Build configuration from `VITA_*` environment variables, falling back
    /// to defaults for everything except the agent endpoint.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        let raw_url = std::env::var("VITA_AGENT_WS_URL")
            .map_err(|_| ConfigError::MissingEnvVar("VITA_AGENT_WS_URL".to_string()))?;
        cfg.agent_ws_url = Url::parse(&raw_url).map_err(|e| ConfigError::InvalidValue {
            key: "VITA_AGENT_WS_URL".to_string(),
            message: e.to_string(),
        })?;

        if let Ok(path) = std::env::var("VITA_DB_PATH") {
            cfg.db_path = PathBuf::from(path);
        }
        if let Ok(port) = std::env::var("VITA_HTTP_PORT") {
            cfg.http_port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "VITA_HTTP_PORT".to_string(),
                message: format!("not a port number: {port}"),
            })?;
        }
        if let Ok(secs) = std::env::var("VITA_FALLBACK_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| ConfigError::InvalidValue {
                key: "VITA_FALLBACK_TIMEOUT_SECS".to_string(),
                message: format!("not a number of seconds: {secs}"),
            })?;
            cfg.fallback_timeout = Duration::from_secs(secs);
        }
        if let Ok(attempts) = std::env::var("VITA_SAVE_RETRY_ATTEMPTS") {
            cfg.save_retry_attempts =
                attempts.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "VITA_SAVE_RETRY_ATTEMPTS".to_string(),
                    message: format!("not a count: {attempts}"),
                })?;
        }

        Ok(cfg)
    }
}
