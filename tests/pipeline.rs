//! End-to-end pipeline scenarios over an in-memory registry and scripted
//! in-process servers.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use mcp_gateway::config::GatewaySettings;
use mcp_gateway::executor::SchemaExecutor;
use mcp_gateway::intent::{IntentClassifier, IntentEngine};
use mcp_gateway::mcp::test_support::ScriptedTransport;
use mcp_gateway::mcp::McpClient;
use mcp_gateway::pipeline::{ExecutionStatus, Pipeline, PipelineInput, PipelineStage};
use mcp_gateway::registry::{NewServer, NewTool, ToolRegistry, TransportKind};
use mcp_gateway::rules::RuleEngine;

struct Harness {
    pipeline: Pipeline,
    registry: Arc<ToolRegistry>,
    client: Arc<McpClient>,
}

async fn seed_tool(
    registry: &ToolRegistry,
    server_id: &str,
    tool_name: &str,
    input_schema: Value,
) {
    let server_uuid = registry
        .upsert_server(NewServer {
            server_id: server_id.to_string(),
            name: server_id.to_string(),
            transport: Some(TransportKind::Stdio),
            command: Some("unused".to_string()),
            enabled: true,
            ..Default::default()
        })
        .await
        .unwrap();

    registry
        .upsert_tool(
            server_uuid,
            NewTool {
                tool_name: tool_name.to_string(),
                description: None,
                input_schema,
                output_schema: None,
                category: None,
                tags: Vec::new(),
                intent_patterns: vec![tool_name.to_string()],
                requires_confirmation: false,
                timeout_seconds: None,
            },
        )
        .await
        .unwrap();
}

/// Connect a scripted transport for a server id so stage 7 finds a live
/// connection.
async fn attach_scripted(client: &McpClient, server_id: &str, transport: ScriptedTransport) {
    client
        .connect_with_transport(server_id, Box::new(transport))
        .await
        .unwrap();
}

async fn harness() -> Harness {
    let settings = GatewaySettings::default();
    let registry = Arc::new(ToolRegistry::in_memory().await.unwrap());
    let client = Arc::new(McpClient::default());
    let pipeline = Pipeline::new(
        IntentEngine::new(IntentClassifier::new("unused-model.json")),
        RuleEngine::with_defaults(settings.nlp.intent_confidence_threshold),
        Arc::clone(&registry),
        Arc::clone(&client),
        &settings,
    );
    Harness {
        pipeline,
        registry,
        client,
    }
}

fn user_input(text: &str) -> PipelineInput {
    PipelineInput {
        user_role: "user".to_string(),
        ..PipelineInput::from_text(text)
    }
}

#[tokio::test]
async fn help_request_runs_end_to_end() {
    let h = harness().await;
    seed_tool(&h.registry, "system", "show_help", json!({"type": "object", "properties": {}})).await;
    attach_scripted(
        &h.client,
        "system",
        ScriptedTransport::new().with_call_result(
            "show_help",
            json!({"content": [{"type": "text", "text": "available commands: ..."}]}),
        ),
    )
    .await;

    let result = h.pipeline.execute(user_input("help")).await;

    assert_eq!(result.status, ExecutionStatus::Success, "error: {:?}", result.error);
    let intent = result.intent.as_ref().unwrap();
    assert!(intent.is_forced);
    assert_eq!(intent.confidence, 1.0);
    assert_eq!(result.tool_name.as_deref(), Some("show_help"));
    assert_eq!(result.result, Some(json!("available commands: ...")));
    assert_eq!(result.stage_results.len(), 8);
}

#[tokio::test]
async fn navigation_fills_url_from_token() {
    let h = harness().await;
    seed_tool(
        &h.registry,
        "browser",
        "browser_navigate",
        json!({
            "type": "object",
            "properties": {"url": {"type": "string", "description": "The URL to open"}},
            "required": ["url"],
        }),
    )
    .await;

    let transport = ScriptedTransport::new();
    let calls = transport.call_log();
    attach_scripted(&h.client, "browser", transport).await;

    let result = h.pipeline.execute(user_input("navigate to google")).await;

    assert_eq!(result.status, ExecutionStatus::Success, "error: {:?}", result.error);
    assert_eq!(result.intent.as_ref().unwrap().intent, "browser_navigate");
    assert_eq!(
        result.parameters.as_ref().unwrap()["url"],
        json!("https://google.com")
    );

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["arguments"]["url"], json!("https://google.com"));
}

#[tokio::test]
async fn read_file_uses_entity_and_schema_default() {
    let h = harness().await;
    seed_tool(
        &h.registry,
        "files",
        "read_file",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "encoding": {"type": "string", "default": "utf-8"},
            },
            "required": ["path"],
        }),
    )
    .await;
    attach_scripted(&h.client, "files", ScriptedTransport::new()).await;

    let result = h.pipeline.execute(user_input("read file /tmp/a.txt")).await;

    assert_eq!(result.status, ExecutionStatus::Success, "error: {:?}", result.error);
    let params = result.parameters.as_ref().unwrap();
    assert_eq!(params["path"], json!("/tmp/a.txt"));
    assert_eq!(params["encoding"], json!("utf-8"));

    let build = result.parameter_result.as_ref().unwrap();
    assert!(build.mapping_log["path"].starts_with("entity:FILE_PATH:"));
    assert_eq!(build.mapping_log["encoding"], "schema_default");
}

#[tokio::test]
async fn guest_destructive_request_is_denied() {
    let h = harness().await;

    let mut input = PipelineInput::from_text("delete everything");
    input.user_role = "guest".to_string();
    let result = h.pipeline.execute(input).await;

    assert_eq!(result.status, ExecutionStatus::Denied);
    assert!(result.error.is_some());
    // The pipeline short-circuits after rule evaluation.
    assert_eq!(result.stage_results.len(), 3);
    assert_eq!(
        result.stage_results[2].stage,
        PipelineStage::RuleEvaluation
    );
    assert!(result.tool_name.is_none());
}

#[tokio::test]
async fn direct_validation_rejects_out_of_range_port() {
    let h = harness().await;
    seed_tool(
        &h.registry,
        "net",
        "set_port",
        json!({
            "type": "object",
            "properties": {"port": {"type": "integer", "minimum": 1, "maximum": 65535}},
            "required": ["port"],
        }),
    )
    .await;

    // Schema-only direct invocation path: look up, validate, call.
    let (tool, _server) = h
        .registry
        .get_tool_with_server("set_port")
        .await
        .unwrap()
        .unwrap();

    let mut parameters = Map::new();
    parameters.insert("port".to_string(), json!(99999));
    let (valid, errors) = SchemaExecutor::new().validate_parameters(&parameters, &tool.input_schema);

    assert!(!valid);
    assert!(errors.iter().any(|e| e.starts_with("port:")));
}

#[tokio::test]
async fn out_of_range_override_fails_before_execution() {
    let h = harness().await;
    seed_tool(
        &h.registry,
        "net",
        "set_port",
        json!({
            "type": "object",
            "properties": {"port": {"type": "integer", "minimum": 1, "maximum": 65535}},
            "required": ["port"],
        }),
    )
    .await;

    let mut input = user_input("set_port");
    input.overrides.insert("port".to_string(), json!(99999));
    // "set_port" matches no override; use a forced route via tool name
    // equality through the classifier-untrained path is denied, so force
    // the intent with an override record.
    // Simpler: the intent engine's default table has no entry, so drive
    // selection through a forced override added for the test.
    let result = h.pipeline.execute(input).await;

    // Untrained classifier yields unknown intent, denied by threshold.
    assert_eq!(result.status, ExecutionStatus::Denied);

    // Now with an admin-forced path: overrides loaded from the registry.
    let mut pipeline = Pipeline::new(
        IntentEngine::new(IntentClassifier::new("unused-model.json")),
        RuleEngine::with_defaults(0.7),
        Arc::clone(&h.registry),
        Arc::clone(&h.client),
        &GatewaySettings::default(),
    );
    pipeline
        .intent_engine_mut()
        .load_overrides(vec![mcp_gateway::intent::OverrideRecord {
            pattern: "set_port".to_string(),
            pattern_kind: "exact".to_string(),
            target_intent: "set_port".to_string(),
            priority: 300,
            enabled: true,
        }]);

    let mut input = user_input("set_port");
    input.overrides.insert("port".to_string(), json!(99999));
    let result = pipeline.execute(input).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.failed_stage, Some(PipelineStage::ParameterBuilding));
    assert!(result.error.as_ref().unwrap().contains("port"));
}

#[tokio::test]
async fn missing_tool_fails_at_selection() {
    let h = harness().await;

    let result = h.pipeline.execute(user_input("screenshot please")).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.failed_stage, Some(PipelineStage::ToolSelection));
    assert_eq!(
        result.error.as_deref(),
        Some("No tool found for intent: browser_screenshot")
    );
    assert_eq!(result.stage_results.len(), 4);
}

#[tokio::test]
async fn remote_error_fails_at_execution() {
    let h = harness().await;
    seed_tool(&h.registry, "system", "show_help", json!({"type": "object", "properties": {}})).await;
    attach_scripted(
        &h.client,
        "system",
        ScriptedTransport::new().with_call_error("show_help", -32050, "backend unavailable"),
    )
    .await;

    let result = h.pipeline.execute(user_input("help")).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.failed_stage, Some(PipelineStage::ToolExecution));
    assert_eq!(result.error.as_deref(), Some("backend unavailable"));
    assert_eq!(result.stage_results.len(), 7);
}

#[tokio::test]
async fn pipeline_is_deterministic() {
    let h = harness().await;
    seed_tool(
        &h.registry,
        "files",
        "read_file",
        json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"],
        }),
    )
    .await;
    attach_scripted(&h.client, "files", ScriptedTransport::new()).await;

    let first = h.pipeline.execute(user_input("read file /tmp/a.txt")).await;
    let second = h.pipeline.execute(user_input("read file /tmp/a.txt")).await;

    assert_eq!(first.tool_name, second.tool_name);
    assert_eq!(first.parameters, second.parameters);
    assert_eq!(first.status, second.status);
}

#[tokio::test]
async fn stage_results_are_a_prefix_of_the_fixed_order() {
    let h = harness().await;
    seed_tool(&h.registry, "system", "show_help", json!({"type": "object", "properties": {}})).await;
    attach_scripted(&h.client, "system", ScriptedTransport::new()).await;

    for text in ["help", "delete everything", "screenshot please"] {
        let result = h.pipeline.execute(user_input(text)).await;
        for (index, stage_result) in result.stage_results.iter().enumerate() {
            assert_eq!(
                stage_result.stage,
                PipelineStage::ALL[index],
                "stage order diverged for input {text:?}"
            );
        }
    }
}
