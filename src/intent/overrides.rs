//! Forced intent overrides.
//!
//! A priority-sorted table of deterministic patterns consulted before the
//! statistical classifier. A match short-circuits classification entirely.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::GatewayError;

/// How an override pattern is matched against input text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Exact,
    Prefix,
    Contains,
    Regex,
}

impl std::str::FromStr for PatternKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(PatternKind::Exact),
            "prefix" => Ok(PatternKind::Prefix),
            "contains" => Ok(PatternKind::Contains),
            "regex" => Ok(PatternKind::Regex),
            other => Err(GatewayError::Config(format!(
                "unknown override pattern kind: {other}"
            ))),
        }
    }
}

/// A single forced override.
#[derive(Debug, Clone)]
pub struct ForcedOverride {
    pub pattern: String,
    pub kind: PatternKind,
    pub target_intent: String,
    pub priority: i32,
    pub enabled: bool,
    compiled: Option<Regex>,
}

impl ForcedOverride {
    /// Build an override; regex patterns must compile.
    pub fn new(
        pattern: impl Into<String>,
        kind: PatternKind,
        target_intent: impl Into<String>,
        priority: i32,
    ) -> Result<Self, GatewayError> {
        let pattern = pattern.into();
        let compiled = match kind {
            PatternKind::Regex => Some(
                Regex::new(&format!("(?i){pattern}"))
                    .map_err(|e| GatewayError::Config(format!("invalid override regex: {e}")))?,
            ),
            _ => None,
        };

        Ok(Self {
            pattern,
            kind,
            target_intent: target_intent.into(),
            priority,
            enabled: true,
            compiled,
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        if !self.enabled {
            return false;
        }

        let normalized = text.trim().to_lowercase();
        match self.kind {
            PatternKind::Exact => normalized == self.pattern.to_lowercase(),
            PatternKind::Prefix => normalized.starts_with(&self.pattern.to_lowercase()),
            PatternKind::Contains => normalized.contains(&self.pattern.to_lowercase()),
            PatternKind::Regex => self
                .compiled
                .as_ref()
                .map(|re| re.is_match(text))
                .unwrap_or(false),
        }
    }
}

/// Priority-sorted override table.
///
/// These patterns bypass the classifier entirely; ties in priority resolve
/// to insertion order.
pub struct OverrideRegistry {
    overrides: Vec<ForcedOverride>,
}

impl Default for OverrideRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl OverrideRegistry {
    pub fn empty() -> Self {
        Self { overrides: Vec::new() }
    }

    /// Registry seeded with the stock override table.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for (pattern, kind, intent, priority) in default_override_table() {
            match ForcedOverride::new(pattern, kind, intent, priority) {
                Ok(o) => registry.overrides.push(o),
                Err(e) => warn!(pattern, %e, "skipping default override"),
            }
        }
        registry.sort();
        registry
    }

    pub fn add(&mut self, override_: ForcedOverride) {
        self.overrides.push(override_);
        self.sort();
    }

    /// Append overrides loaded from the registry store; invalid regex
    /// patterns are logged and skipped.
    pub fn load(&mut self, records: impl IntoIterator<Item = ForcedOverride>) {
        self.overrides.extend(records);
        self.sort();
    }

    fn sort(&mut self) {
        // Stable sort keeps insertion order among equal priorities.
        self.overrides.sort_by_key(|o| std::cmp::Reverse(o.priority));
    }

    /// First matching override in priority order.
    pub fn find_match(&self, text: &str) -> Option<(&str, &str)> {
        self.overrides
            .iter()
            .find(|o| o.matches(text))
            .map(|o| (o.target_intent.as_str(), o.pattern.as_str()))
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

fn default_override_table() -> Vec<(&'static str, PatternKind, &'static str, i32)> {
    use PatternKind::*;

    vec![
        // System commands
        ("help", Exact, "show_help", 200),
        (r"(list|show|get)\s+(all\s+)?tools?", Regex, "list_tools", 200),
        (r"(list|show|get)\s+(all\s+)?servers?", Regex, "list_servers", 200),
        (r"(show|get|check)\s+(server\s+)?status", Regex, "list_servers", 200),
        // Browser automation
        (r"(navigate|go)\s+(to\s+)?(\w+|https?://)", Regex, "browser_navigate", 150),
        (r"(click|press|tap)\s+(on\s+)?", Regex, "browser_click", 150),
        (r"(screenshot|capture|snap)", Regex, "browser_screenshot", 150),
        // File operations
        (r"^(list|show|get)\s+(files?|directory|dir|folder)", Regex, "list_files", 100),
        (r"^read\s+(file|content)", Regex, "read_file", 100),
        (r"^(create|write|save)\s+file", Regex, "write_file", 100),
        (r"^(delete|remove)\s+file", Regex, "delete_file", 100),
        // Fetch operations
        (r"^fetch\s+(url|http|https|webpage|page)", Regex, "fetch_url", 100),
        (r"^(get|download)\s+(from\s+)?(url|http|https)", Regex, "fetch_url", 100),
        // Memory operations
        (r"^(store|save|put)\s+(in|to)?\s*memory", Regex, "store_memory", 100),
        (r"^(get|retrieve|fetch)\s+(from\s+)?memory", Regex, "retrieve_memory", 100),
    ]
}
