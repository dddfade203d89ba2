//! Server discovery.
//!
//! Control-plane only: loads the server catalog file, registers servers,
//! connects through the MCP client, and persists each server's tool
//! catalog to the registry. Discovery never executes tools.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::GatewayError;
use crate::mcp::client::{create_transport, ConnectionConfig, McpClient};
use crate::mcp::transport::Transport;
use crate::registry::{NewServer, NewTool, ServerStatus, ToolRegistry, TransportKind};

/// One server entry from the catalog file.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub transport: TransportKind,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub url: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
struct RawServerEntry {
    id: Option<String>,
    name: Option<String>,
    description: Option<String>,
    transport: Option<String>,
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    enabled: Option<bool>,
}

impl RawServerEntry {
    fn into_config(self, fallback_id: Option<String>) -> Option<ServerConfig> {
        let id = self.id.or(fallback_id)?;
        let transport: TransportKind = match self.transport.as_deref().unwrap_or("stdio").parse() {
            Ok(kind) => kind,
            Err(e) => {
                warn!(server = %id, %e, "skipping server with unknown transport");
                return None;
            }
        };
        Some(ServerConfig {
            name: self.name.unwrap_or_else(|| id.clone()),
            id,
            description: self.description,
            transport,
            command: self.command,
            args: self.args,
            url: self.url,
            headers: self.headers,
            enabled: self.enabled.unwrap_or(true),
        })
    }
}

/// Per-server discovery outcome.
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub server_id: String,
    pub success: bool,
    pub tools_discovered: usize,
    pub error: Option<String>,
}

type TransportFactory =
    Box<dyn Fn(&ServerConfig) -> Result<Box<dyn Transport>, GatewayError> + Send + Sync>;

/// Discovers MCP servers and persists their tool catalogs.
pub struct DiscoveryService {
    config_path: PathBuf,
    client: Arc<McpClient>,
    registry: Arc<ToolRegistry>,
    configs: Mutex<Vec<ServerConfig>>,
    transport_factory: TransportFactory,
}

impl DiscoveryService {
    pub fn new(
        config_path: impl Into<PathBuf>,
        client: Arc<McpClient>,
        registry: Arc<ToolRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            config_path: config_path.into(),
            client,
            registry,
            configs: Mutex::new(Vec::new()),
            transport_factory: Box::new(move |config| {
                create_transport(&connection_config(config, timeout))
            }),
        }
    }

    /// Replace how transports are built; the seam tests and embedders use
    /// to wire in-process servers.
    pub fn with_transport_factory(
        mut self,
        factory: impl Fn(&ServerConfig) -> Result<Box<dyn Transport>, GatewayError> + Send + Sync + 'static,
    ) -> Self {
        self.transport_factory = Box::new(factory);
        self
    }

    /// Load server configurations from the catalog file.
    ///
    /// Accepts both shapes: a `mcpServers` map keyed by id, or a
    /// `servers` array with explicit ids. Disabled entries are skipped.
    pub async fn load_config(&self) -> Result<Vec<ServerConfig>, GatewayError> {
        if !self.config_path.exists() {
            warn!(path = %self.config_path.display(), "server catalog file not found");
            return Ok(Vec::new());
        }

        let contents = std::fs::read_to_string(&self.config_path)?;
        let data: Value = serde_json::from_str(&contents)?;
        let configs = parse_catalog(&data)?;

        info!(count = configs.len(), "loaded server catalog");
        *self.configs.lock().await = configs.clone();
        Ok(configs)
    }

    /// Discover every enabled configured server. Partial success is
    /// reported per server.
    pub async fn discover_all(&self) -> Result<Vec<DiscoveryResult>, GatewayError> {
        let configs = {
            let cached = self.configs.lock().await.clone();
            if cached.is_empty() {
                self.load_config().await?
            } else {
                cached
            }
        };

        let mut results = Vec::new();
        for config in &configs {
            if !config.enabled {
                continue;
            }
            results.push(self.discover_server(config).await);
        }

        let successful = results.iter().filter(|r| r.success).count();
        let total_tools: usize = results.iter().map(|r| r.tools_discovered).sum();
        info!(
            servers = results.len(),
            successful, total_tools, "discovery complete"
        );

        Ok(results)
    }

    /// Discover one server: register, connect, snapshot its catalog.
    pub async fn discover_server(&self, config: &ServerConfig) -> DiscoveryResult {
        info!(server = %config.id, "discovering server");

        let server_uuid = match self
            .registry
            .upsert_server(NewServer {
                server_id: config.id.clone(),
                name: config.name.clone(),
                description: config.description.clone(),
                transport: Some(config.transport),
                command: config.command.clone(),
                args: config.args.clone(),
                url: config.url.clone(),
                headers: config.headers.clone(),
                enabled: config.enabled,
            })
            .await
        {
            Ok(uuid) => uuid,
            Err(e) => return self.fail(&config.id, e.to_string()).await,
        };

        if let Err(e) = self
            .registry
            .set_server_status(&config.id, ServerStatus::Discovering, None)
            .await
        {
            return self.fail(&config.id, e.to_string()).await;
        }

        let transport = match (self.transport_factory)(config) {
            Ok(transport) => transport,
            Err(e) => return self.fail(&config.id, e.to_string()).await,
        };
        if let Err(e) = self.client.connect_with_transport(&config.id, transport).await {
            return self.fail(&config.id, e.to_string()).await;
        }

        let tools = self.client.server_tools(&config.id).await;
        let records: Vec<NewTool> = tools
            .iter()
            .map(|tool| NewTool {
                tool_name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
                output_schema: None,
                category: None,
                tags: Vec::new(),
                intent_patterns: generate_intent_patterns(&tool.name),
                requires_confirmation: false,
                timeout_seconds: None,
            })
            .collect();

        // Fresh snapshot: the old catalog is replaced in one transaction.
        if let Err(e) = self.registry.replace_tools_for_server(server_uuid, records).await {
            return self.fail(&config.id, e.to_string()).await;
        }

        if let Err(e) = self
            .registry
            .set_server_status(&config.id, ServerStatus::Active, None)
            .await
        {
            return self.fail(&config.id, e.to_string()).await;
        }

        info!(server = %config.id, tools = tools.len(), "discovered server");
        DiscoveryResult {
            server_id: config.id.clone(),
            success: true,
            tools_discovered: tools.len(),
            error: None,
        }
    }

    async fn fail(&self, server_id: &str, message: String) -> DiscoveryResult {
        error!(server = %server_id, error = %message, "discovery failed");
        let _ = self
            .registry
            .set_server_status(server_id, ServerStatus::Error, Some(&message))
            .await;
        DiscoveryResult {
            server_id: server_id.to_string(),
            success: false,
            tools_discovered: 0,
            error: Some(message),
        }
    }

    /// Rediscover one server from its cached config, falling back to the
    /// registry-stored configuration.
    pub async fn refresh_server(&self, server_id: &str) -> Result<Option<DiscoveryResult>, GatewayError> {
        let cached = {
            self.configs
                .lock()
                .await
                .iter()
                .find(|c| c.id == server_id)
                .cloned()
        };

        let config = match cached {
            Some(config) => config,
            None => {
                let Some(server) = self.registry.get_server(server_id).await? else {
                    return Ok(None);
                };
                ServerConfig {
                    id: server.server_id,
                    name: server.name,
                    description: server.description,
                    transport: server.transport,
                    command: server.command,
                    args: server.args,
                    url: server.url,
                    headers: server.headers,
                    enabled: server.enabled,
                }
            }
        };

        Ok(Some(self.discover_server(&config).await))
    }
}

fn connection_config(config: &ServerConfig, timeout: Duration) -> ConnectionConfig {
    ConnectionConfig {
        transport: config.transport,
        command: config.command.clone(),
        args: config.args.clone(),
        url: config.url.clone(),
        headers: config.headers.clone(),
        timeout,
    }
}

fn parse_catalog(data: &Value) -> Result<Vec<ServerConfig>, GatewayError> {
    let mut configs = Vec::new();

    if let Some(map) = data.get("mcpServers").and_then(Value::as_object) {
        for (id, entry) in map {
            let raw: RawServerEntry = serde_json::from_value(entry.clone())?;
            if let Some(config) = raw.into_config(Some(id.clone())) {
                if config.enabled {
                    configs.push(config);
                }
            }
        }
    } else if let Some(items) = data.get("servers").and_then(Value::as_array) {
        for entry in items {
            let raw: RawServerEntry = serde_json::from_value(entry.clone())?;
            if let Some(config) = raw.into_config(None) {
                if config.enabled {
                    configs.push(config);
                }
            }
        }
    } else {
        warn!("no 'mcpServers' or 'servers' key in catalog");
    }

    Ok(configs)
}

/// Derive intent patterns from a tool name: the name itself, the name
/// with `_` and `-` swapped, the name with separators removed, and (for
/// multi-segment names) the segments reversed.
pub fn generate_intent_patterns(tool_name: &str) -> Vec<String> {
    let swapped: String = tool_name
        .chars()
        .map(|c| match c {
            '_' => '-',
            '-' => '_',
            other => other,
        })
        .collect();
    let squashed = tool_name.replace(['_', '-'], "");

    let mut patterns = vec![tool_name.to_string(), swapped, squashed];

    let parts: Vec<&str> = tool_name.split(['_', '-']).collect();
    if parts.len() >= 2 {
        let mut reversed = parts.clone();
        reversed.reverse();
        patterns.push(reversed.join("_"));
    }

    let mut seen = std::collections::HashSet::new();
    patterns.retain(|p| seen.insert(p.clone()));
    patterns
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_map_form_catalog() {
        let data = json!({
            "mcpServers": {
                "files": {"transport": "stdio", "command": "mcp-files", "args": ["--stdio"]},
                "disabled": {"transport": "stdio", "command": "x", "enabled": false},
            }
        });

        let configs = parse_catalog(&data).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].id, "files");
        assert_eq!(configs[0].transport, TransportKind::Stdio);
        assert_eq!(configs[0].command.as_deref(), Some("mcp-files"));
    }

    #[test]
    fn parses_array_form_catalog() {
        let data = json!({
            "servers": [
                {"id": "web", "transport": "http", "url": "http://localhost:9000/rpc"},
                {"id": "sock", "transport": "websocket", "url": "ws://localhost:9001"},
            ]
        });

        let configs = parse_catalog(&data).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].transport, TransportKind::Http);
        assert_eq!(configs[1].transport, TransportKind::Websocket);
    }

    #[test]
    fn unknown_transport_entries_are_skipped() {
        let data = json!({
            "servers": [{"id": "odd", "transport": "carrier-pigeon"}]
        });
        assert!(parse_catalog(&data).unwrap().is_empty());
    }

    #[test]
    fn intent_patterns_for_multi_segment_name() {
        let patterns = generate_intent_patterns("read_file");
        assert_eq!(patterns, vec!["read_file", "read-file", "readfile", "file_read"]);
    }

    #[test]
    fn intent_patterns_deduplicate() {
        let patterns = generate_intent_patterns("ping");
        assert_eq!(patterns, vec!["ping"]);
    }

    #[test]
    fn intent_patterns_swap_hyphens_too() {
        let patterns = generate_intent_patterns("fetch-page");
        assert!(patterns.contains(&"fetch_page".to_string()));
        assert!(patterns.contains(&"fetchpage".to_string()));
        assert!(patterns.contains(&"page_fetch".to_string()));
    }
}
