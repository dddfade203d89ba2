//! Schema-driven parameter assembly and validation.
//!
//! Fills a JSON-Schema input object from extraction results with no
//! awareness of specific tools: the schema is the only source of truth.
//! Assembly resolves each property through a fixed chain (override,
//! matched entity, URL-token fallback, free-text fallback, caller
//! default, schema default) and the finished map is validated under a
//! draft-7 validator.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};
use tracing::debug;

use crate::nlp::{ExtractedEntity, ExtractionResult};

/// Result of parameter building.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ParameterBuildResult {
    pub success: bool,
    pub parameters: Map<String, Value>,
    pub missing_required: Vec<String>,
    pub validation_errors: Vec<String>,
    /// Per-parameter provenance: `override`, `entity:LABEL:conf`,
    /// `token_url:<token>`, `noun_chunks`, `full_text`, `default`,
    /// `schema_default`.
    pub mapping_log: BTreeMap<String, String>,
    pub metadata: BuildMetadata,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct BuildMetadata {
    pub entities_used: usize,
    pub entities_total: usize,
    pub params_built: usize,
    pub params_total: usize,
}

/// Schema analysis helpers.
pub struct SchemaAnalyzer;

impl SchemaAnalyzer {
    pub fn required_params(schema: &Value) -> Vec<String> {
        schema
            .get("required")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn properties(schema: &Value) -> Vec<(String, Value)> {
        schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn param_type(param_def: &Value) -> &str {
        param_def.get("type").and_then(Value::as_str).unwrap_or("string")
    }

    /// Constraints relevant to conversion and matching.
    pub fn param_constraints(param_def: &Value) -> Map<String, Value> {
        const KEYS: &[&str] = &[
            "minLength", "maxLength", "pattern", "enum", "minimum", "maximum", "items",
            "minItems", "maxItems", "default",
        ];
        let mut constraints = Map::new();
        for key in KEYS {
            if let Some(value) = param_def.get(*key) {
                constraints.insert((*key).to_string(), value.clone());
            }
        }
        constraints
    }

    /// Entity labels likely to fill a parameter, from name hints first
    /// and the parameter type second.
    pub fn suggest_entity_labels(param_name: &str, param_def: &Value) -> Vec<&'static str> {
        const NAME_PATTERNS: &[(&str, &[&str])] = &[
            ("path", &["FILE_PATH"]),
            ("file", &["FILE_PATH"]),
            ("directory", &["FILE_PATH"]),
            ("url", &["URL"]),
            ("uri", &["URL"]),
            ("email", &["EMAIL"]),
            ("name", &["PERSON", "ORG"]),
            ("location", &["GPE", "LOC"]),
            ("date", &["DATE"]),
            ("time", &["TIME"]),
            ("amount", &["MONEY", "CARDINAL"]),
            ("count", &["CARDINAL"]),
            ("number", &["CARDINAL"]),
            ("command", &["COMMAND"]),
            // Free-text parameters carry no entity preference.
            ("query", &[]),
            ("content", &[]),
            ("text", &[]),
        ];
        const TYPE_LABELS: &[(&str, &[&str])] = &[
            ("string", &["FILE_PATH", "URL", "EMAIL", "PERSON", "ORG", "GPE", "COMMAND"]),
            ("integer", &["CARDINAL", "QUANTITY"]),
            ("number", &["CARDINAL", "MONEY", "PERCENT", "QUANTITY"]),
        ];

        let lower = param_name.to_lowercase();
        let mut suggestions: Vec<&'static str> = Vec::new();
        for (pattern, labels) in NAME_PATTERNS {
            if lower.contains(pattern) {
                suggestions.extend(labels.iter().copied());
            }
        }
        let param_type = Self::param_type(param_def);
        for (ty, labels) in TYPE_LABELS {
            if *ty == param_type {
                suggestions.extend(labels.iter().copied());
            }
        }

        let mut seen = HashSet::new();
        suggestions.retain(|label| seen.insert(*label));
        suggestions
    }
}

/// Matches extracted entities to schema parameters.
pub struct EntityMatcher;

impl EntityMatcher {
    /// Score an entity against a parameter; `None` means no match.
    pub fn match_entity_to_param(
        entity: &ExtractedEntity,
        param_name: &str,
        param_def: &Value,
    ) -> Option<f64> {
        let suggested = SchemaAnalyzer::suggest_entity_labels(param_name, param_def);
        if suggested.contains(&entity.label.as_str()) {
            return Some(0.9);
        }

        if let Some(values) = param_def.get("enum").and_then(Value::as_array) {
            let text = entity.text.to_lowercase();
            if values.iter().any(|v| value_as_text(v).to_lowercase() == text) {
                return Some(1.0);
            }
        }

        match SchemaAnalyzer::param_type(param_def) {
            "string" => Some(0.5),
            "integer" | "number" => {
                let cleaned = entity.text.replace(',', "");
                cleaned.trim().parse::<f64>().ok().map(|_| 0.8)
            }
            "boolean" => {
                matches!(
                    entity.text.to_lowercase().as_str(),
                    "true" | "false" | "yes" | "no" | "1" | "0"
                )
                .then_some(0.9)
            }
            _ => None,
        }
    }

    /// Highest-scoring entity not yet consumed by another parameter.
    pub fn find_best_entity<'a>(
        entities: &'a [ExtractedEntity],
        param_name: &str,
        param_def: &Value,
        used: &mut HashSet<usize>,
    ) -> Option<(&'a ExtractedEntity, f64)> {
        let mut best: Option<(usize, f64)> = None;
        for (index, entity) in entities.iter().enumerate() {
            if used.contains(&index) {
                continue;
            }
            if let Some(score) = Self::match_entity_to_param(entity, param_name, param_def) {
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((index, score));
                }
            }
        }

        best.map(|(index, score)| {
            used.insert(index);
            (&entities[index], score)
        })
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Converts entity text to typed parameter values.
pub struct ValueConverter;

impl ValueConverter {
    /// Add protocol and TLD to bare domain-like text.
    pub fn normalize_url(url: &str) -> String {
        let url = url.trim();
        if url.starts_with("http://")
            || url.starts_with("https://")
            || url.starts_with("ftp://")
            || url.starts_with("file://")
        {
            return url.to_string();
        }

        let with_tld = if !url.contains('.') && !url.starts_with("localhost") {
            format!("{url}.com")
        } else {
            url.to_string()
        };
        format!("https://{with_tld}")
    }

    /// Whether a parameter takes a URL, by name, format, or description.
    pub fn is_url_param(param_name: &str, param_def: &Value) -> bool {
        if param_name == "url" {
            return true;
        }
        if param_def.get("format").and_then(Value::as_str) == Some("uri") {
            return true;
        }
        let description = param_def
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase();
        description.contains("url") || description.contains("uri")
    }

    /// Convert a string value to the parameter's declared type.
    pub fn convert(value: &str, param_name: &str, param_def: &Value) -> Result<Value, String> {
        match SchemaAnalyzer::param_type(param_def) {
            "string" => {
                if Self::is_url_param(param_name, param_def) {
                    Ok(Value::String(Self::normalize_url(value)))
                } else {
                    Ok(Value::String(value.to_string()))
                }
            }
            "integer" => {
                let cleaned = value.replace(',', "");
                let parsed: f64 = cleaned
                    .trim()
                    .parse()
                    .map_err(|_| format!("cannot convert '{value}' to integer"))?;
                Ok(Value::from(parsed.trunc() as i64))
            }
            "number" => {
                let cleaned = value.replace(',', "");
                let parsed: f64 = cleaned
                    .trim()
                    .parse()
                    .map_err(|_| format!("cannot convert '{value}' to number"))?;
                Ok(serde_json::Number::from_f64(parsed)
                    .map(Value::Number)
                    .unwrap_or(Value::Null))
            }
            "boolean" => match value.to_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "0" => Ok(Value::Bool(false)),
                _ => Err(format!("cannot convert '{value}' to boolean")),
            },
            "array" => {
                let items_def = param_def.get("items").cloned().unwrap_or_else(|| {
                    serde_json::json!({"type": "string"})
                });
                let converted: Result<Vec<Value>, String> = value
                    .split(',')
                    .map(|item| Self::convert(item.trim(), param_name, &items_def))
                    .collect();
                Ok(Value::Array(converted?))
            }
            "null" => Ok(Value::Null),
            _ => Ok(Value::String(value.to_string())),
        }
    }
}

/// Validates parameter maps against JSON Schema draft-7.
pub struct SchemaValidator;

impl SchemaValidator {
    /// Validate and collect every error with a dotted instance path.
    pub fn validate(parameters: &Map<String, Value>, schema: &Value) -> (bool, Vec<String>) {
        let validator = match jsonschema::options()
            .with_draft(jsonschema::Draft::Draft7)
            .build(schema)
        {
            Ok(validator) => validator,
            Err(e) => return (false, vec![format!("Invalid schema: {e}")]),
        };

        let instance = Value::Object(parameters.clone());
        let errors: Vec<String> = validator
            .iter_errors(&instance)
            .map(|error| {
                let path = error
                    .instance_path
                    .to_string()
                    .trim_start_matches('/')
                    .replace('/', ".");
                if path.is_empty() {
                    error.to_string()
                } else {
                    format!("{path}: {error}")
                }
            })
            .collect();

        (errors.is_empty(), errors)
    }
}

/// The schema executor.
///
/// Builds parameters from entities and a schema, then validates. Works
/// for schemas it has never seen; no tool-specific branches.
#[derive(Default)]
pub struct SchemaExecutor;

impl SchemaExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Build a parameter map for `schema` from extraction results.
    ///
    /// Resolution order per property: explicit override, best matching
    /// entity, URL-token fallback, free-text fallback, caller default,
    /// schema default. Required properties left unset are reported in
    /// `missing_required` and suppress validation.
    pub fn build_parameters(
        &self,
        schema: &Value,
        entities: &ExtractionResult,
        defaults: &Map<String, Value>,
        overrides: &Map<String, Value>,
    ) -> ParameterBuildResult {
        let mut parameters = Map::new();
        let mut mapping_log = BTreeMap::new();
        let mut missing_required = Vec::new();
        let mut used: HashSet<usize> = HashSet::new();

        let properties = SchemaAnalyzer::properties(schema);
        let required = SchemaAnalyzer::required_params(schema);

        for (param_name, param_def) in &properties {
            if let Some(value) = overrides.get(param_name) {
                parameters.insert(param_name.clone(), value.clone());
                mapping_log.insert(param_name.clone(), "override".to_string());
                continue;
            }

            if let Some((entity, confidence)) =
                EntityMatcher::find_best_entity(&entities.entities, param_name, param_def, &mut used)
            {
                match ValueConverter::convert(&entity.text, param_name, param_def) {
                    Ok(value) => {
                        parameters.insert(param_name.clone(), value);
                        mapping_log.insert(
                            param_name.clone(),
                            format!("entity:{}:{confidence:.2}", entity.label),
                        );
                        continue;
                    }
                    Err(e) => debug!(param = param_name, error = e, "entity conversion failed"),
                }
            }

            // URL parameters fall back to scanning the token stream.
            if ValueConverter::is_url_param(param_name, param_def) {
                const SKIP_VERBS: &[&str] = &[
                    "navigate", "go", "open", "visit", "browse", "to", "show", "get", "fetch",
                ];
                if let Some(token) = entities.tokens.iter().find(|token| {
                    token.len() >= 3 && !SKIP_VERBS.contains(&token.to_lowercase().as_str())
                }) {
                    parameters.insert(
                        param_name.clone(),
                        Value::String(ValueConverter::normalize_url(token)),
                    );
                    mapping_log.insert(param_name.clone(), format!("token_url:{token}"));
                    continue;
                }
            }

            // Free-text parameters absorb noun phrases or the whole input.
            if matches!(
                param_name.as_str(),
                "query" | "content" | "text" | "message" | "description"
            ) {
                if !entities.noun_chunks.is_empty() {
                    parameters.insert(
                        param_name.clone(),
                        Value::String(entities.noun_chunks.join(" ")),
                    );
                    mapping_log.insert(param_name.clone(), "noun_chunks".to_string());
                    continue;
                } else if !entities.normalized_text.is_empty() {
                    parameters.insert(
                        param_name.clone(),
                        Value::String(entities.normalized_text.clone()),
                    );
                    mapping_log.insert(param_name.clone(), "full_text".to_string());
                    continue;
                }
            }

            if let Some(value) = defaults.get(param_name) {
                parameters.insert(param_name.clone(), value.clone());
                mapping_log.insert(param_name.clone(), "default".to_string());
                continue;
            }

            if let Some(value) = param_def.get("default") {
                parameters.insert(param_name.clone(), value.clone());
                mapping_log.insert(param_name.clone(), "schema_default".to_string());
                continue;
            }

            if required.contains(param_name) {
                missing_required.push(param_name.clone());
            }
        }

        let (is_valid, validation_errors) = if missing_required.is_empty() {
            SchemaValidator::validate(&parameters, schema)
        } else {
            (false, Vec::new())
        };

        let success = is_valid && missing_required.is_empty();
        ParameterBuildResult {
            success,
            metadata: BuildMetadata {
                entities_used: used.len(),
                entities_total: entities.entities.len(),
                params_built: parameters.len(),
                params_total: properties.len(),
            },
            parameters,
            missing_required,
            validation_errors,
            mapping_log,
        }
    }

    /// Validate a pre-built parameter map against a schema.
    pub fn validate_parameters(
        &self,
        parameters: &Map<String, Value>,
        schema: &Value,
    ) -> (bool, Vec<String>) {
        SchemaValidator::validate(parameters, schema)
    }
}
