//! Gateway settings.
//!
//! All settings are read from environment variables with defaults that work
//! out of the box, grouped the same way the subsystems consume them.

use std::path::PathBuf;
use std::time::Duration;

/// Registry database settings.
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: std::env::var("GATEWAY_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://gateway.db?mode=rwc".to_string()),
            max_connections: std::env::var("GATEWAY_DATABASE_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        }
    }
}

/// NLP and classification settings.
#[derive(Debug, Clone)]
pub struct NlpSettings {
    /// Minimum classifier confidence for non-forced intents.
    pub intent_confidence_threshold: f64,
}

impl Default for NlpSettings {
    fn default() -> Self {
        Self {
            intent_confidence_threshold: std::env::var("GATEWAY_INTENT_CONFIDENCE_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.7),
        }
    }
}

/// MCP connection settings.
#[derive(Debug, Clone)]
pub struct McpSettings {
    /// Path to the server catalog file (`mcpServers` map or `servers` array).
    pub servers_config_path: PathBuf,
    pub discovery_timeout: Duration,
    pub execution_timeout: Duration,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            servers_config_path: std::env::var("GATEWAY_MCP_SERVERS_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config/mcp_servers.json")),
            discovery_timeout: Duration::from_secs(
                std::env::var("GATEWAY_MCP_DISCOVERY_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            execution_timeout: Duration::from_secs(
                std::env::var("GATEWAY_MCP_EXECUTION_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
        }
    }
}

/// Intent classifier persistence settings.
#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    pub model_path: PathBuf,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            model_path: std::env::var("GATEWAY_CLASSIFIER_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("models/intent_classifier.json")),
        }
    }
}

/// Top-level gateway settings.
#[derive(Debug, Clone, Default)]
pub struct GatewaySettings {
    pub database: DatabaseSettings,
    pub nlp: NlpSettings,
    pub mcp: McpSettings,
    pub classifier: ClassifierSettings,
}

/// Install a `tracing` subscriber driven by `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_settings_default() {
        let settings = DatabaseSettings::default();
        assert!(settings.url.starts_with("sqlite"));
        assert!(settings.max_connections >= 1);
    }

    #[test]
    fn nlp_threshold_default() {
        let settings = NlpSettings::default();
        assert!(settings.intent_confidence_threshold > 0.0);
        assert!(settings.intent_confidence_threshold <= 1.0);
    }

    #[test]
    fn mcp_timeouts_default() {
        let settings = McpSettings::default();
        assert_eq!(settings.discovery_timeout, Duration::from_secs(30));
        assert_eq!(settings.execution_timeout, Duration::from_secs(60));
    }
}
