//! The deterministic execution pipeline.
//!
//! Eight stages in fixed order: extract, classify, evaluate rules,
//! select tool, build parameters, validate, execute, format. No stage is
//! skipped or reordered; a stage failure terminates the pipeline and
//! subsequent stages do not run. No language model is consulted anywhere.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::config::GatewaySettings;
use crate::executor::{ParameterBuildResult, SchemaExecutor};
use crate::intent::{IntentEngine, IntentResult};
use crate::mcp::client::{ConnectionConfig, McpClient, ToolCallResult};
use crate::nlp::{EntityExtractor, ExtractionResult};
use crate::registry::{ToolInfo, ToolRegistry};
use crate::rules::{RuleContext, RuleDecision, RuleEngine, RuleResult};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    EntityExtraction,
    IntentClassification,
    RuleEvaluation,
    ToolSelection,
    ParameterBuilding,
    SchemaValidation,
    ToolExecution,
    ResponseFormatting,
}

impl PipelineStage {
    /// The fixed stage order.
    pub const ALL: [PipelineStage; 8] = [
        PipelineStage::EntityExtraction,
        PipelineStage::IntentClassification,
        PipelineStage::RuleEvaluation,
        PipelineStage::ToolSelection,
        PipelineStage::ParameterBuilding,
        PipelineStage::SchemaValidation,
        PipelineStage::ToolExecution,
        PipelineStage::ResponseFormatting,
    ];
}

/// Final pipeline status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Denied,
}

/// Per-stage diagnostic record.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StageResult {
    pub stage: PipelineStage,
    pub success: bool,
    pub duration_ms: f64,
    pub error: Option<String>,
}

/// Input to one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineInput {
    pub text: String,
    pub user_id: Option<String>,
    pub user_role: String,
    pub user_permissions: Vec<String>,
    pub session_id: Option<String>,
    pub request_count: i64,
    pub context: Map<String, Value>,
    pub overrides: Map<String, Value>,
}

impl Default for PipelineInput {
    fn default() -> Self {
        Self {
            text: String::new(),
            user_id: None,
            user_role: "guest".to_string(),
            user_permissions: Vec::new(),
            session_id: None,
            request_count: 0,
            context: Map::new(),
            overrides: Map::new(),
        }
    }
}

impl PipelineInput {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Complete execution record for one pipeline run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    pub status: ExecutionStatus,

    pub entities: Option<ExtractionResult>,
    pub intent: Option<IntentResult>,
    pub rule_result: Option<RuleResult>,
    pub tool: Option<ToolInfo>,
    pub parameter_result: Option<ParameterBuildResult>,
    pub tool_result: Option<ToolCallResult>,

    pub tool_name: Option<String>,
    pub parameters: Option<Map<String, Value>>,
    pub result: Option<Value>,
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,

    pub stage_results: Vec<StageResult>,
    pub failed_stage: Option<PipelineStage>,
}

impl PipelineResult {
    fn pending() -> Self {
        Self {
            success: false,
            status: ExecutionStatus::Pending,
            entities: None,
            intent: None,
            rule_result: None,
            tool: None,
            parameter_result: None,
            tool_result: None,
            tool_name: None,
            parameters: None,
            result: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            stage_results: Vec::new(),
            failed_stage: None,
        }
    }
}

/// Intent-name stems treated as destructive unless the request context
/// says otherwise.
const DESTRUCTIVE_STEMS: &[&str] = &["delete", "remove", "drop", "kill", "overwrite", "write"];

/// The deterministic execution pipeline.
pub struct Pipeline {
    extractor: EntityExtractor,
    intent_engine: IntentEngine,
    rule_engine: RuleEngine,
    executor: SchemaExecutor,
    registry: Arc<ToolRegistry>,
    client: Arc<McpClient>,
    execution_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        intent_engine: IntentEngine,
        rule_engine: RuleEngine,
        registry: Arc<ToolRegistry>,
        client: Arc<McpClient>,
        settings: &GatewaySettings,
    ) -> Self {
        Self {
            extractor: EntityExtractor::new(),
            intent_engine,
            rule_engine,
            executor: SchemaExecutor::new(),
            registry,
            client,
            execution_timeout: settings.mcp.execution_timeout,
        }
    }

    pub fn intent_engine_mut(&mut self) -> &mut IntentEngine {
        &mut self.intent_engine
    }

    pub fn rule_engine_mut(&mut self) -> &mut RuleEngine {
        &mut self.rule_engine
    }

    /// Execute the complete pipeline for one input.
    pub async fn execute(&self, input: PipelineInput) -> PipelineResult {
        let mut result = PipelineResult::pending();

        // Stage 1: entity extraction.
        let started = Instant::now();
        let entities = self.extractor.extract(&input.text);
        debug!(count = entities.entities.len(), "extracted entities");
        result.stage_results.push(StageResult {
            stage: PipelineStage::EntityExtraction,
            success: true,
            duration_ms: elapsed_ms(started),
            error: None,
        });
        result.entities = Some(entities.clone());

        // Stage 2: intent classification.
        let started = Instant::now();
        let intent = self.intent_engine.classify(&input.text);
        debug!(
            intent = %intent.intent,
            confidence = intent.confidence,
            forced = intent.is_forced,
            "classified intent"
        );
        result.stage_results.push(StageResult {
            stage: PipelineStage::IntentClassification,
            success: true,
            duration_ms: elapsed_ms(started),
            error: None,
        });
        result.intent = Some(intent.clone());

        // Stage 3: rule evaluation.
        let started = Instant::now();
        let rule_context = self.build_rule_context(&input, &intent);
        let rule_result = self.rule_engine.evaluate(&rule_context);
        debug!(decision = ?rule_result.decision, matched = ?rule_result.matched_rules, "evaluated rules");
        result.stage_results.push(StageResult {
            stage: PipelineStage::RuleEvaluation,
            success: true,
            duration_ms: elapsed_ms(started),
            error: None,
        });
        let denied = rule_result.decision == RuleDecision::Deny;
        let deny_reason = rule_result.reason.clone();
        result.rule_result = Some(rule_result);

        if denied {
            result.status = ExecutionStatus::Denied;
            result.error = deny_reason.or_else(|| Some("Denied by rule engine".to_string()));
            return finalize(result, None);
        }

        // Stage 4: tool selection.
        let started = Instant::now();
        let intent_name = intent.intent.clone();
        let tool = match self.registry.find_tool_by_intent(&intent_name).await {
            Ok(Some(tool)) => tool,
            Ok(None) => {
                let stage = StageResult {
                    stage: PipelineStage::ToolSelection,
                    success: false,
                    duration_ms: elapsed_ms(started),
                    error: Some(format!("No tool found for intent: {intent_name}")),
                };
                result.stage_results.push(stage.clone());
                return finalize(result, Some(stage));
            }
            Err(e) => {
                let stage = StageResult {
                    stage: PipelineStage::ToolSelection,
                    success: false,
                    duration_ms: elapsed_ms(started),
                    error: Some(e.to_string()),
                };
                result.stage_results.push(stage.clone());
                return finalize(result, Some(stage));
            }
        };
        debug!(tool = %tool.tool_name, "selected tool");
        result.stage_results.push(StageResult {
            stage: PipelineStage::ToolSelection,
            success: true,
            duration_ms: elapsed_ms(started),
            error: None,
        });
        result.tool_name = Some(tool.tool_name.clone());
        result.tool = Some(tool.clone());

        // Stage 5: parameter building.
        let started = Instant::now();
        let parameter_result = self.executor.build_parameters(
            &tool.input_schema,
            &entities,
            &input.context,
            &input.overrides,
        );
        if !parameter_result.success {
            let mut message = "Parameter building failed".to_string();
            if !parameter_result.missing_required.is_empty() {
                message.push_str(&format!(
                    ": missing required params {:?}",
                    parameter_result.missing_required
                ));
            }
            if !parameter_result.validation_errors.is_empty() {
                message.push_str(&format!(": {:?}", parameter_result.validation_errors));
            }
            let stage = StageResult {
                stage: PipelineStage::ParameterBuilding,
                success: false,
                duration_ms: elapsed_ms(started),
                error: Some(message),
            };
            result.stage_results.push(stage.clone());
            result.parameter_result = Some(parameter_result);
            return finalize(result, Some(stage));
        }
        debug!(params = ?parameter_result.parameters, "built parameters");
        result.stage_results.push(StageResult {
            stage: PipelineStage::ParameterBuilding,
            success: true,
            duration_ms: elapsed_ms(started),
            error: None,
        });
        let parameters = parameter_result.parameters.clone();
        result.parameters = Some(parameters.clone());
        result.parameter_result = Some(parameter_result);

        // Stage 6: schema validation. The executor already validated;
        // this protects against callers that inject parameters later.
        let started = Instant::now();
        let (is_valid, errors) = self
            .executor
            .validate_parameters(&parameters, &tool.input_schema);
        if !is_valid {
            let stage = StageResult {
                stage: PipelineStage::SchemaValidation,
                success: false,
                duration_ms: elapsed_ms(started),
                error: Some(format!("Validation failed: {errors:?}")),
            };
            result.stage_results.push(stage.clone());
            return finalize(result, Some(stage));
        }
        result.stage_results.push(StageResult {
            stage: PipelineStage::SchemaValidation,
            success: true,
            duration_ms: elapsed_ms(started),
            error: None,
        });

        // Stage 7: tool execution.
        let started = Instant::now();
        let call = self.execute_tool(&tool, parameters).await;
        match call {
            Ok(tool_result) if tool_result.success => {
                result.stage_results.push(StageResult {
                    stage: PipelineStage::ToolExecution,
                    success: true,
                    duration_ms: elapsed_ms(started),
                    error: None,
                });
                result.tool_result = Some(tool_result);
            }
            Ok(tool_result) => {
                let stage = StageResult {
                    stage: PipelineStage::ToolExecution,
                    success: false,
                    duration_ms: elapsed_ms(started),
                    error: tool_result.error.clone(),
                };
                result.stage_results.push(stage.clone());
                result.tool_result = Some(tool_result);
                result.status = ExecutionStatus::Failed;
                return finalize(result, Some(stage));
            }
            Err(message) => {
                let stage = StageResult {
                    stage: PipelineStage::ToolExecution,
                    success: false,
                    duration_ms: elapsed_ms(started),
                    error: Some(message),
                };
                result.stage_results.push(stage.clone());
                result.status = ExecutionStatus::Failed;
                return finalize(result, Some(stage));
            }
        }

        // Stage 8: response formatting. Formatting never fails the
        // pipeline; the raw content stands in when it cannot be shaped.
        let started = Instant::now();
        let content = result
            .tool_result
            .as_ref()
            .map(|r| r.content.clone())
            .unwrap_or(Value::Null);
        result.result = Some(format_content(&content));
        result.stage_results.push(StageResult {
            stage: PipelineStage::ResponseFormatting,
            success: true,
            duration_ms: elapsed_ms(started),
            error: None,
        });

        result.success = true;
        result.status = ExecutionStatus::Success;
        finalize(result, None)
    }

    fn build_rule_context(&self, input: &PipelineInput, intent: &IntentResult) -> RuleContext {
        let is_destructive = input
            .context
            .get("is_destructive")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| {
                DESTRUCTIVE_STEMS.iter().any(|stem| intent.intent.contains(stem))
            });

        RuleContext {
            user_id: input.user_id.clone(),
            user_role: input.user_role.clone(),
            user_permissions: input.user_permissions.clone(),
            intent: intent.intent.clone(),
            intent_confidence: intent.confidence,
            is_forced_intent: intent.is_forced,
            is_destructive_operation: is_destructive,
            session_id: input.session_id.clone(),
            request_count: input.request_count,
            custom: input
                .context
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            ..Default::default()
        }
    }

    /// Look up the server, reconnect if needed, and call the tool.
    async fn execute_tool(
        &self,
        tool: &ToolInfo,
        parameters: Map<String, Value>,
    ) -> Result<ToolCallResult, String> {
        let pair = self
            .registry
            .get_tool_with_server(&tool.tool_name)
            .await
            .map_err(|e| e.to_string())?;
        let Some((_, server)) = pair else {
            return Err("Tool or server not found".to_string());
        };

        if !self.client.is_connected(&server.server_id).await {
            let timeout = tool
                .timeout_seconds
                .map(|s| Duration::from_secs(s.max(0) as u64))
                .unwrap_or(self.execution_timeout);
            let config = ConnectionConfig::from_server(&server, timeout);
            if let Err(e) = self.client.connect_server(&server.server_id, &config).await {
                error!(server = %server.server_id, %e, "reconnect failed");
                return Err(format!("Could not connect to server: {}", server.server_id));
            }
        }

        Ok(self
            .client
            .call_tool(&server.server_id, &tool.tool_name, parameters)
            .await)
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

fn finalize(mut result: PipelineResult, failed_stage: Option<StageResult>) -> PipelineResult {
    let completed = Utc::now();
    result.duration_ms = Some((completed - result.started_at).num_milliseconds());
    result.completed_at = Some(completed);

    if let Some(stage) = failed_stage {
        result.failed_stage = Some(stage.stage);
        result.error = stage.error;
        if result.status == ExecutionStatus::Pending {
            result.status = ExecutionStatus::Failed;
        }
    }

    result
}

/// Concatenate text blocks; image blocks become a placeholder; anything
/// else is stringified. Non-array content passes through unchanged.
fn format_content(content: &Value) -> Value {
    let Some(items) = content.as_array() else {
        return content.clone();
    };

    let parts: Vec<String> = items
        .iter()
        .map(|item| match item.get("type").and_then(Value::as_str) {
            Some("text") => item
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Some("image") => "[Image content]".to_string(),
            _ => item.to_string(),
        })
        .collect();

    Value::String(parts.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stage_order_is_fixed() {
        assert_eq!(PipelineStage::ALL.len(), 8);
        assert_eq!(PipelineStage::ALL[0], PipelineStage::EntityExtraction);
        assert_eq!(PipelineStage::ALL[7], PipelineStage::ResponseFormatting);
    }

    #[test]
    fn format_joins_text_blocks() {
        let content = json!([
            {"type": "text", "text": "line one"},
            {"type": "text", "text": "line two"},
        ]);
        assert_eq!(format_content(&content), json!("line one\nline two"));
    }

    #[test]
    fn format_replaces_image_blocks() {
        let content = json!([
            {"type": "text", "text": "before"},
            {"type": "image", "data": "aGk="},
        ]);
        assert_eq!(format_content(&content), json!("before\n[Image content]"));
    }

    #[test]
    fn format_passes_plain_values_through() {
        assert_eq!(format_content(&json!("already text")), json!("already text"));
        assert_eq!(format_content(&json!({"k": 1})), json!({"k": 1}));
    }

    #[test]
    fn stage_names_serialize_snake_case() {
        let value = serde_json::to_value(PipelineStage::EntityExtraction).unwrap();
        assert_eq!(value, json!("entity_extraction"));
    }
}
