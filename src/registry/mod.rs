//! Tool registry.
//!
//! The registry is the single source of truth for server configurations,
//! tool definitions, and their JSON Schemas, plus the override/rule/
//! training tables the intent and rule engines load from. All reads
//! return plain value objects; a process-local tool cache is invalidated
//! on every tool mutation.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::types::Json;
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DatabaseSettings;
use crate::error::GatewayError;
use crate::intent::OverrideRecord;
use crate::rules::RuleRecord;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// MCP transport kind. Persisted and serialized as the lowercase wire
/// value everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
    Websocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
            TransportKind::Websocket => "websocket",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TransportKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdio" => Ok(TransportKind::Stdio),
            "http" => Ok(TransportKind::Http),
            "websocket" => Ok(TransportKind::Websocket),
            other => Err(GatewayError::Config(format!("unknown transport: {other}"))),
        }
    }
}

/// Server lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Inactive,
    Discovering,
    Active,
    Error,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerStatus::Inactive => "inactive",
            ServerStatus::Discovering => "discovering",
            ServerStatus::Active => "active",
            ServerStatus::Error => "error",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ServerStatus {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(ServerStatus::Inactive),
            "discovering" => Ok(ServerStatus::Discovering),
            "active" => Ok(ServerStatus::Active),
            "error" => Ok(ServerStatus::Error),
            other => Err(GatewayError::Config(format!("unknown server status: {other}"))),
        }
    }
}

/// Server record as a plain value object.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerInfo {
    pub id: Uuid,
    pub server_id: String,
    pub name: String,
    pub description: Option<String>,
    pub transport: TransportKind,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub url: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub status: ServerStatus,
    pub last_error: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Tool record as a plain value object.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolInfo {
    pub id: Uuid,
    /// Owning server's database id.
    pub server_uuid: Uuid,
    pub tool_name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub intent_patterns: Vec<String>,
    pub enabled: bool,
    pub requires_confirmation: bool,
    pub timeout_seconds: Option<i64>,
}

/// Fields for registering or updating a server.
#[derive(Debug, Clone, Default)]
pub struct NewServer {
    pub server_id: String,
    pub name: String,
    pub description: Option<String>,
    pub transport: Option<TransportKind>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub url: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub enabled: bool,
}

/// Fields for registering a tool.
#[derive(Debug, Clone)]
pub struct NewTool {
    pub tool_name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub intent_patterns: Vec<String>,
    pub requires_confirmation: bool,
    pub timeout_seconds: Option<i64>,
}

/// SQLite-backed registry with a process-local tool cache.
pub struct ToolRegistry {
    pool: SqlitePool,
    cache: RwLock<Option<Arc<Vec<ToolInfo>>>>,
}

impl ToolRegistry {
    /// Connect using the configured database URL and apply the schema.
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, GatewayError> {
        // A shared in-memory database only exists per connection; clamp
        // the pool so every query sees the same database.
        let max_connections = if settings.url.contains(":memory:") {
            1
        } else {
            settings.max_connections
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&settings.url)
            .await?;

        info!(url = %settings.url, "connected registry database");
        Self::from_pool(pool).await
    }

    /// Registry over an ephemeral in-memory database.
    pub async fn in_memory() -> Result<Self, GatewayError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, GatewayError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self {
            pool,
            cache: RwLock::new(None),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn invalidate_cache(&self) {
        *self.cache.write().await = None;
        debug!("tool cache invalidated");
    }

    // ==================== Server operations ====================

    /// Insert a server, or update it in place. Re-registration preserves
    /// the existing database id.
    pub async fn upsert_server(&self, server: NewServer) -> Result<Uuid, GatewayError> {
        let now = Utc::now();
        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM mcp_servers WHERE server_id = ?")
                .bind(&server.server_id)
                .fetch_optional(&self.pool)
                .await?;

        let transport = server.transport.unwrap_or(TransportKind::Stdio);

        if let Some(id) = existing {
            sqlx::query(
                r#"UPDATE mcp_servers
                   SET name = ?, description = ?, transport = ?, command = ?,
                       args = ?, url = ?, headers = ?, enabled = ?, updated_at = ?
                   WHERE server_id = ?"#,
            )
            .bind(&server.name)
            .bind(&server.description)
            .bind(transport.to_string())
            .bind(&server.command)
            .bind(Json(&server.args))
            .bind(&server.url)
            .bind(Json(&server.headers))
            .bind(server.enabled)
            .bind(now)
            .bind(&server.server_id)
            .execute(&self.pool)
            .await?;

            return parse_uuid(&id);
        }

        let id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO mcp_servers
               (id, server_id, name, description, transport, command, args, url,
                headers, status, enabled, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'inactive', ?, ?, ?)"#,
        )
        .bind(id.to_string())
        .bind(&server.server_id)
        .bind(&server.name)
        .bind(&server.description)
        .bind(transport.to_string())
        .bind(&server.command)
        .bind(Json(&server.args))
        .bind(&server.url)
        .bind(Json(&server.headers))
        .bind(server.enabled)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(server_id = %server.server_id, "registered server");
        Ok(id)
    }

    pub async fn get_server(&self, server_id: &str) -> Result<Option<ServerInfo>, GatewayError> {
        let row = sqlx::query("SELECT * FROM mcp_servers WHERE server_id = ?")
            .bind(server_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| server_from_row(&r)).transpose()
    }

    pub async fn list_servers(&self, enabled_only: bool) -> Result<Vec<ServerInfo>, GatewayError> {
        let query = if enabled_only {
            "SELECT * FROM mcp_servers WHERE enabled = 1 ORDER BY server_id"
        } else {
            "SELECT * FROM mcp_servers ORDER BY server_id"
        };
        let rows = sqlx::query(query).fetch_all(&self.pool).await?;
        rows.iter().map(server_from_row).collect()
    }

    pub async fn set_server_status(
        &self,
        server_id: &str,
        status: ServerStatus,
        error: Option<&str>,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            r#"UPDATE mcp_servers
               SET status = ?, last_error = ?, updated_at = ?
               WHERE server_id = ?"#,
        )
        .bind(status.to_string())
        .bind(error)
        .bind(Utc::now())
        .bind(server_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Tool operations ====================

    /// Insert a tool or update it in place; unique per (server, name).
    pub async fn upsert_tool(
        &self,
        server_uuid: Uuid,
        tool: NewTool,
    ) -> Result<Uuid, GatewayError> {
        let mut conn = self.pool.acquire().await?;
        let id = self.upsert_tool_on(&mut conn, server_uuid, tool).await?;
        self.invalidate_cache().await;
        Ok(id)
    }

    async fn upsert_tool_on(
        &self,
        executor: &mut sqlx::SqliteConnection,
        server_uuid: Uuid,
        tool: NewTool,
    ) -> Result<Uuid, GatewayError> {
        let now = Utc::now();
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM mcp_tools WHERE server_id = ? AND tool_name = ?",
        )
        .bind(server_uuid.to_string())
        .bind(&tool.tool_name)
        .fetch_optional(&mut *executor)
        .await?;

        if let Some(id) = existing {
            sqlx::query(
                r#"UPDATE mcp_tools
                   SET description = ?, input_schema = ?, output_schema = ?,
                       category = ?, tags = ?, intent_patterns = ?,
                       requires_confirmation = ?, timeout_seconds = ?, updated_at = ?
                   WHERE id = ?"#,
            )
            .bind(&tool.description)
            .bind(Json(&tool.input_schema))
            .bind(tool.output_schema.as_ref().map(Json))
            .bind(&tool.category)
            .bind(Json(&tool.tags))
            .bind(Json(&tool.intent_patterns))
            .bind(tool.requires_confirmation)
            .bind(tool.timeout_seconds)
            .bind(now)
            .bind(&id)
            .execute(&mut *executor)
            .await?;
            return parse_uuid(&id);
        }

        let id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO mcp_tools
               (id, server_id, tool_name, description, input_schema, output_schema,
                category, tags, intent_patterns, enabled, requires_confirmation,
                timeout_seconds, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?)"#,
        )
        .bind(id.to_string())
        .bind(server_uuid.to_string())
        .bind(&tool.tool_name)
        .bind(&tool.description)
        .bind(Json(&tool.input_schema))
        .bind(tool.output_schema.as_ref().map(Json))
        .bind(&tool.category)
        .bind(Json(&tool.tags))
        .bind(Json(&tool.intent_patterns))
        .bind(tool.requires_confirmation)
        .bind(tool.timeout_seconds)
        .bind(now)
        .bind(now)
        .execute(&mut *executor)
        .await?;

        debug!(tool = %tool.tool_name, "registered tool");
        Ok(id)
    }

    /// Delete every tool owned by a server.
    pub async fn delete_tools_for_server(&self, server_uuid: Uuid) -> Result<u64, GatewayError> {
        let result = sqlx::query("DELETE FROM mcp_tools WHERE server_id = ?")
            .bind(server_uuid.to_string())
            .execute(&self.pool)
            .await?;
        self.invalidate_cache().await;
        Ok(result.rows_affected())
    }

    /// Replace a server's tool catalog in one transaction.
    ///
    /// Readers observe either the old catalog or the new one, never a
    /// mixture; a failure mid-rewrite rolls everything back.
    pub async fn replace_tools_for_server(
        &self,
        server_uuid: Uuid,
        tools: Vec<NewTool>,
    ) -> Result<usize, GatewayError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM mcp_tools WHERE server_id = ?")
            .bind(server_uuid.to_string())
            .execute(&mut *tx)
            .await?;

        let count = tools.len();
        for tool in tools {
            self.upsert_tool_on(&mut *tx, server_uuid, tool).await?;
        }

        tx.commit().await?;
        self.invalidate_cache().await;
        Ok(count)
    }

    pub async fn get_tool(&self, tool_name: &str) -> Result<Option<ToolInfo>, GatewayError> {
        let row = sqlx::query(
            "SELECT * FROM mcp_tools WHERE tool_name = ? AND enabled = 1 ORDER BY server_id LIMIT 1",
        )
        .bind(tool_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| tool_from_row(&r)).transpose()
    }

    /// Tool plus its owning server.
    pub async fn get_tool_with_server(
        &self,
        tool_name: &str,
    ) -> Result<Option<(ToolInfo, ServerInfo)>, GatewayError> {
        let Some(tool) = self.get_tool(tool_name).await? else {
            return Ok(None);
        };
        let row = sqlx::query("SELECT * FROM mcp_servers WHERE id = ?")
            .bind(tool.server_uuid.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(Some((tool, server_from_row(&r)?))),
            None => Ok(None),
        }
    }

    pub async fn list_tools(
        &self,
        server_id: Option<&str>,
        category: Option<&str>,
    ) -> Result<Vec<ToolInfo>, GatewayError> {
        let mut tools = self.cached_tools().await?.as_ref().clone();

        if let Some(server_id) = server_id {
            let server_uuid = self.get_server(server_id).await?.map(|s| s.id);
            tools.retain(|t| Some(t.server_uuid) == server_uuid);
        }
        if let Some(category) = category {
            tools.retain(|t| t.category.as_deref() == Some(category));
        }

        Ok(tools)
    }

    /// Find a tool for an intent.
    ///
    /// Primary match: the intent appears in the tool's intent-pattern list
    /// or equals the tool name. Secondary: separator-normalized equality.
    /// The cached list is sorted, so the first match is stable.
    pub async fn find_tool_by_intent(
        &self,
        intent: &str,
    ) -> Result<Option<ToolInfo>, GatewayError> {
        let tools = self.cached_tools().await?;

        for tool in tools.iter() {
            if tool.intent_patterns.iter().any(|p| p == intent) || intent == tool.tool_name {
                return Ok(Some(tool.clone()));
            }
        }

        let normalized = intent.replace('-', "_");
        for tool in tools.iter() {
            if normalized == tool.tool_name.replace('-', "_") {
                return Ok(Some(tool.clone()));
            }
        }

        Ok(None)
    }

    /// Enabled tools, sorted by `(tool_name, server_uuid)`, cached until
    /// the next mutation.
    async fn cached_tools(&self) -> Result<Arc<Vec<ToolInfo>>, GatewayError> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            return Ok(Arc::clone(cached));
        }

        let rows = sqlx::query("SELECT * FROM mcp_tools WHERE enabled = 1")
            .fetch_all(&self.pool)
            .await?;
        let mut tools: Vec<ToolInfo> = rows
            .iter()
            .map(tool_from_row)
            .collect::<Result<_, _>>()?;
        tools.sort_by(|a, b| {
            a.tool_name
                .cmp(&b.tool_name)
                .then_with(|| a.server_uuid.cmp(&b.server_uuid))
        });

        let tools = Arc::new(tools);
        *self.cache.write().await = Some(Arc::clone(&tools));
        Ok(tools)
    }

    // ==================== Overrides / rules / training ====================

    pub async fn get_forced_overrides(&self) -> Result<Vec<OverrideRecord>, GatewayError> {
        let rows = sqlx::query(
            "SELECT * FROM forced_intent_overrides WHERE enabled = 1 ORDER BY priority DESC, created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(OverrideRecord {
                    pattern: row.try_get("pattern")?,
                    pattern_kind: row.try_get("pattern_kind")?,
                    target_intent: row.try_get("target_intent")?,
                    priority: row.try_get("priority")?,
                    enabled: row.try_get("enabled")?,
                })
            })
            .collect()
    }

    pub async fn add_forced_override(&self, record: &OverrideRecord) -> Result<(), GatewayError> {
        sqlx::query(
            r#"INSERT INTO forced_intent_overrides
               (id, pattern, pattern_kind, target_intent, priority, enabled, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&record.pattern)
        .bind(&record.pattern_kind)
        .bind(&record.target_intent)
        .bind(record.priority)
        .bind(record.enabled)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_rules(&self, kind: Option<&str>) -> Result<Vec<RuleRecord>, GatewayError> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query(
                    "SELECT * FROM rule_definitions WHERE enabled = 1 AND rule_kind = ? ORDER BY priority DESC",
                )
                .bind(kind)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM rule_definitions WHERE enabled = 1 ORDER BY priority DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter()
            .map(|row| {
                let logic: Json<Value> = row.try_get("rule_logic")?;
                let modifications: Json<BTreeMap<String, Value>> = row.try_get("modifications")?;
                Ok(RuleRecord {
                    name: row.try_get("rule_name")?,
                    description: row.try_get("description")?,
                    rule_kind: row.try_get("rule_kind")?,
                    logic: logic.0,
                    priority: row.try_get("priority")?,
                    enabled: row.try_get("enabled")?,
                    decision_on_match: row.try_get("decision_on_match")?,
                    modifications: modifications.0,
                })
            })
            .collect()
    }

    pub async fn add_rule(&self, record: &RuleRecord) -> Result<(), GatewayError> {
        sqlx::query(
            r#"INSERT INTO rule_definitions
               (id, rule_name, description, rule_kind, rule_logic, priority,
                enabled, decision_on_match, modifications, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&record.name)
        .bind(&record.description)
        .bind(&record.rule_kind)
        .bind(Json(&record.logic))
        .bind(record.priority)
        .bind(record.enabled)
        .bind(&record.decision_on_match)
        .bind(Json(&record.modifications))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_training_data(
        &self,
        validated_only: bool,
    ) -> Result<Vec<(String, String)>, GatewayError> {
        let query = if validated_only {
            "SELECT text, intent FROM intent_training_data WHERE is_validated = 1 ORDER BY created_at"
        } else {
            "SELECT text, intent FROM intent_training_data ORDER BY created_at"
        };
        let rows = sqlx::query(query).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| Ok((row.try_get("text")?, row.try_get("intent")?)))
            .collect()
    }

    pub async fn add_training_sample(
        &self,
        text: &str,
        intent: &str,
        validated: bool,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            r#"INSERT INTO intent_training_data (id, text, intent, is_validated, created_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(text)
        .bind(intent)
        .bind(validated)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, GatewayError> {
    Uuid::parse_str(s).map_err(|e| GatewayError::Config(format!("corrupt uuid in registry: {e}")))
}

fn server_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ServerInfo, GatewayError> {
    let id: String = row.try_get("id")?;
    let transport: String = row.try_get("transport")?;
    let status: String = row.try_get("status")?;
    let args: Json<Vec<String>> = row.try_get("args")?;
    let headers: Json<BTreeMap<String, String>> = row.try_get("headers")?;

    Ok(ServerInfo {
        id: parse_uuid(&id)?,
        server_id: row.try_get("server_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        transport: transport.parse()?,
        command: row.try_get("command")?,
        args: args.0,
        url: row.try_get("url")?,
        headers: headers.0,
        status: status.parse()?,
        last_error: row.try_get("last_error")?,
        enabled: row.try_get("enabled")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn tool_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ToolInfo, GatewayError> {
    let id: String = row.try_get("id")?;
    let server_uuid: String = row.try_get("server_id")?;
    let input_schema: Json<Value> = row.try_get("input_schema")?;
    let output_schema: Option<Json<Value>> = row.try_get("output_schema")?;
    let tags: Json<Vec<String>> = row.try_get("tags")?;
    let intent_patterns: Json<Vec<String>> = row.try_get("intent_patterns")?;

    Ok(ToolInfo {
        id: parse_uuid(&id)?,
        server_uuid: parse_uuid(&server_uuid)?,
        tool_name: row.try_get("tool_name")?,
        description: row.try_get("description")?,
        input_schema: input_schema.0,
        output_schema: output_schema.map(|j| j.0),
        category: row.try_get("category")?,
        tags: tags.0,
        intent_patterns: intent_patterns.0,
        enabled: row.try_get("enabled")?,
        requires_confirmation: row.try_get("requires_confirmation")?,
        timeout_seconds: row.try_get("timeout_seconds")?,
    })
}
