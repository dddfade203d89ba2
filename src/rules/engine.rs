//! Rule engine.
//!
//! Evaluates an ordered rule list against the flat decision context and
//! returns ALLOW, DENY, or MODIFY. Deny rules are terminal; modify rules
//! accumulate a modifications map; evaluation has no side effects.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::rules::logic::Expr;

/// Final decision of rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDecision {
    Allow,
    Deny,
    Modify,
}

impl std::str::FromStr for RuleDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "allow" => Ok(RuleDecision::Allow),
            "deny" => Ok(RuleDecision::Deny),
            "modify" => Ok(RuleDecision::Modify),
            other => Err(format!("unknown rule decision: {other}")),
        }
    }
}

/// Context the rules are evaluated against.
#[derive(Debug, Clone, Default)]
pub struct RuleContext {
    pub user_id: Option<String>,
    pub user_role: String,
    pub user_permissions: Vec<String>,

    pub intent: String,
    pub intent_confidence: f64,
    pub is_forced_intent: bool,

    pub tool_name: Option<String>,
    pub tool_category: Option<String>,
    pub tool_requires_confirmation: bool,

    pub is_destructive_operation: bool,
    pub target_resource: Option<String>,

    pub session_id: Option<String>,
    pub request_count: i64,

    pub custom: BTreeMap<String, Value>,
}

impl RuleContext {
    /// Flatten into the nested JSON document predicates dereference.
    pub fn to_value(&self) -> Value {
        json!({
            "user": {
                "id": self.user_id,
                "role": self.user_role,
                "permissions": self.user_permissions,
            },
            "intent": {
                "name": self.intent,
                "confidence": self.intent_confidence,
                "is_forced": self.is_forced_intent,
            },
            "tool": {
                "name": self.tool_name,
                "category": self.tool_category,
                "requires_confirmation": self.tool_requires_confirmation,
            },
            "execution": {
                "is_destructive": self.is_destructive_operation,
                "target_resource": self.target_resource,
            },
            "session": {
                "id": self.session_id,
                "request_count": self.request_count,
            },
            "custom": self.custom,
        })
    }
}

/// Result of rule evaluation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RuleResult {
    pub decision: RuleDecision,
    pub matched_rules: Vec<String>,
    pub reason: Option<String>,
    pub modifications: BTreeMap<String, Value>,
    pub rules_evaluated: usize,
}

/// A single declarative rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub description: String,
    /// Advisory label: `permission`, `threshold`, `context`.
    pub kind: String,
    pub logic: Expr,
    pub priority: i32,
    pub enabled: bool,
    pub decision_on_match: RuleDecision,
    pub modifications: BTreeMap<String, Value>,
}

/// Rule row as stored in the registry.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RuleRecord {
    pub name: String,
    pub description: String,
    pub rule_kind: String,
    pub logic: Value,
    pub priority: i32,
    pub enabled: bool,
    pub decision_on_match: String,
    pub modifications: BTreeMap<String, Value>,
}

/// Priority-ordered rule evaluator.
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Engine seeded with the stock rules. `confidence_threshold` is baked
    /// into the threshold and admin-bypass rules at construction.
    pub fn with_defaults(confidence_threshold: f64) -> Self {
        let mut engine = Self::empty();
        for rule in default_rules(confidence_threshold) {
            engine.rules.push(rule);
        }
        engine.sort();
        engine
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
        self.sort();
    }

    /// Append registry-stored rules; rows with an unknown decision are
    /// logged and skipped.
    pub fn load_records(&mut self, records: Vec<RuleRecord>) {
        for record in records {
            let decision: RuleDecision = match record.decision_on_match.parse() {
                Ok(d) => d,
                Err(e) => {
                    warn!(rule = %record.name, %e, "skipping rule");
                    continue;
                }
            };
            self.rules.push(Rule {
                name: record.name,
                description: record.description,
                kind: record.rule_kind,
                logic: Expr::parse(&record.logic),
                priority: record.priority,
                enabled: record.enabled,
                decision_on_match: decision,
                modifications: record.modifications,
            });
        }
        self.sort();
    }

    fn sort(&mut self) {
        self.rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
    }

    /// Walk rules by descending priority.
    ///
    /// The first matching deny terminates evaluation. Modify decisions
    /// accumulate modifications; an allow never downgrades a modify.
    /// When nothing matches, the decision is allow.
    pub fn evaluate(&self, context: &RuleContext) -> RuleResult {
        let context_value = context.to_value();
        let mut matched_rules = Vec::new();
        let mut modifications = BTreeMap::new();
        let mut decision = RuleDecision::Allow;

        for rule in &self.rules {
            if !rule.enabled {
                continue;
            }
            if !rule.logic.truthy(&context_value) {
                continue;
            }

            matched_rules.push(rule.name.clone());
            debug!(rule = %rule.name, decision = ?rule.decision_on_match, "rule matched");

            match rule.decision_on_match {
                RuleDecision::Deny => {
                    return RuleResult {
                        decision: RuleDecision::Deny,
                        matched_rules,
                        reason: Some(rule.description.clone()),
                        modifications,
                        rules_evaluated: self.rules.len(),
                    };
                }
                RuleDecision::Modify => {
                    decision = RuleDecision::Modify;
                    modifications.extend(rule.modifications.clone());
                }
                RuleDecision::Allow => {
                    if decision != RuleDecision::Modify {
                        decision = RuleDecision::Allow;
                    }
                }
            }
        }

        RuleResult {
            decision,
            matched_rules,
            reason: None,
            modifications,
            rules_evaluated: self.rules.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn default_rules(threshold: f64) -> Vec<Rule> {
    vec![
        Rule {
            name: "admin_confidence_bypass".to_string(),
            description: "Admin users can bypass low confidence".to_string(),
            kind: "permission".to_string(),
            logic: Expr::parse(&json!({
                "and": [
                    {"==": [{"var": "user.role"}, "admin"]},
                    {"<": [{"var": "intent.confidence"}, threshold]},
                ]
            })),
            priority: 200,
            enabled: true,
            decision_on_match: RuleDecision::Allow,
            modifications: BTreeMap::new(),
        },
        Rule {
            name: "confidence_threshold".to_string(),
            description: "Deny if intent confidence is below threshold".to_string(),
            kind: "threshold".to_string(),
            logic: Expr::parse(&json!({
                "and": [
                    {"!": {"var": "intent.is_forced"}},
                    {"<": [{"var": "intent.confidence"}, threshold]},
                ]
            })),
            priority: 100,
            enabled: true,
            decision_on_match: RuleDecision::Deny,
            modifications: BTreeMap::new(),
        },
        Rule {
            name: "guest_readonly".to_string(),
            description: "Guest users can only use read operations".to_string(),
            kind: "permission".to_string(),
            logic: Expr::parse(&json!({
                "and": [
                    {"==": [{"var": "user.role"}, "guest"]},
                    {"var": "execution.is_destructive"},
                ]
            })),
            priority: 90,
            enabled: true,
            decision_on_match: RuleDecision::Deny,
            modifications: BTreeMap::new(),
        },
        Rule {
            name: "destructive_confirmation".to_string(),
            description: "Require confirmation for destructive operations".to_string(),
            kind: "context".to_string(),
            logic: Expr::parse(&json!({
                "and": [
                    {"var": "execution.is_destructive"},
                    {"!": {"var": "tool.requires_confirmation"}},
                ]
            })),
            priority: 80,
            enabled: true,
            decision_on_match: RuleDecision::Modify,
            modifications: [("requires_confirmation".to_string(), json!(true))]
                .into_iter()
                .collect(),
        },
        Rule {
            name: "rate_limit".to_string(),
            description: "Deny if too many requests in session".to_string(),
            kind: "context".to_string(),
            logic: Expr::parse(&json!({
                ">": [{"var": "session.request_count"}, 1000]
            })),
            priority: 50,
            enabled: true,
            decision_on_match: RuleDecision::Deny,
            modifications: BTreeMap::new(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: f64 = 0.7;

    fn base_context() -> RuleContext {
        RuleContext {
            user_role: "user".to_string(),
            intent: "read_file".to_string(),
            intent_confidence: 0.9,
            ..Default::default()
        }
    }

    #[test]
    fn clean_context_is_allowed() {
        let engine = RuleEngine::with_defaults(THRESHOLD);
        let result = engine.evaluate(&base_context());
        assert_eq!(result.decision, RuleDecision::Allow);
        assert!(result.matched_rules.is_empty());
    }

    #[test]
    fn low_confidence_is_denied_with_reason() {
        let engine = RuleEngine::with_defaults(THRESHOLD);
        let mut context = base_context();
        context.intent_confidence = 0.3;

        let result = engine.evaluate(&context);
        assert_eq!(result.decision, RuleDecision::Deny);
        assert_eq!(result.matched_rules, vec!["confidence_threshold"]);
        assert!(result.reason.is_some());
    }

    #[test]
    fn forced_intent_bypasses_confidence_threshold() {
        let engine = RuleEngine::with_defaults(THRESHOLD);
        let mut context = base_context();
        context.intent_confidence = 1.0;
        context.is_forced_intent = true;

        assert_eq!(engine.evaluate(&context).decision, RuleDecision::Allow);
    }

    #[test]
    fn admin_bypass_matches_before_threshold_deny() {
        let engine = RuleEngine::with_defaults(THRESHOLD);
        let mut context = base_context();
        context.user_role = "admin".to_string();
        context.intent_confidence = 0.2;

        let result = engine.evaluate(&context);
        // The bypass outranks the threshold rule, so it is recorded first;
        // a matching deny is still terminal.
        assert_eq!(result.matched_rules[0], "admin_confidence_bypass");
        assert_eq!(result.decision, RuleDecision::Deny);
    }

    #[test]
    fn guest_destructive_is_denied() {
        let engine = RuleEngine::with_defaults(THRESHOLD);
        let mut context = base_context();
        context.user_role = "guest".to_string();
        context.is_destructive_operation = true;

        let result = engine.evaluate(&context);
        assert_eq!(result.decision, RuleDecision::Deny);
        assert_eq!(result.matched_rules, vec!["guest_readonly"]);
    }

    #[test]
    fn destructive_without_confirmation_is_modified() {
        let engine = RuleEngine::with_defaults(THRESHOLD);
        let mut context = base_context();
        context.is_destructive_operation = true;

        let result = engine.evaluate(&context);
        assert_eq!(result.decision, RuleDecision::Modify);
        assert_eq!(
            result.modifications.get("requires_confirmation"),
            Some(&json!(true))
        );
    }

    #[test]
    fn deny_is_terminal() {
        let mut engine = RuleEngine::empty();
        engine.add_rule(Rule {
            name: "always_deny".to_string(),
            description: "blocked".to_string(),
            kind: "permission".to_string(),
            logic: Expr::parse(&json!(true)),
            priority: 100,
            enabled: true,
            decision_on_match: RuleDecision::Deny,
            modifications: BTreeMap::new(),
        });
        engine.add_rule(Rule {
            name: "later_allow".to_string(),
            description: "should not run".to_string(),
            kind: "permission".to_string(),
            logic: Expr::parse(&json!(true)),
            priority: 10,
            enabled: true,
            decision_on_match: RuleDecision::Allow,
            modifications: BTreeMap::new(),
        });

        let result = engine.evaluate(&base_context());
        assert_eq!(result.decision, RuleDecision::Deny);
        assert_eq!(result.matched_rules, vec!["always_deny"]);
        assert_eq!(result.reason.as_deref(), Some("blocked"));
    }

    #[test]
    fn allow_does_not_downgrade_modify() {
        let mut engine = RuleEngine::empty();
        engine.add_rule(Rule {
            name: "modify_first".to_string(),
            description: "m".to_string(),
            kind: "context".to_string(),
            logic: Expr::parse(&json!(true)),
            priority: 100,
            enabled: true,
            decision_on_match: RuleDecision::Modify,
            modifications: [("flag".to_string(), json!(1))].into_iter().collect(),
        });
        engine.add_rule(Rule {
            name: "allow_later".to_string(),
            description: "a".to_string(),
            kind: "permission".to_string(),
            logic: Expr::parse(&json!(true)),
            priority: 10,
            enabled: true,
            decision_on_match: RuleDecision::Allow,
            modifications: BTreeMap::new(),
        });

        let result = engine.evaluate(&base_context());
        assert_eq!(result.decision, RuleDecision::Modify);
        assert_eq!(result.modifications.get("flag"), Some(&json!(1)));
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut engine = RuleEngine::empty();
        engine.add_rule(Rule {
            name: "disabled_deny".to_string(),
            description: "d".to_string(),
            kind: "permission".to_string(),
            logic: Expr::parse(&json!(true)),
            priority: 100,
            enabled: false,
            decision_on_match: RuleDecision::Deny,
            modifications: BTreeMap::new(),
        });

        assert_eq!(engine.evaluate(&base_context()).decision, RuleDecision::Allow);
    }

    #[test]
    fn rate_limit_denies_after_1000_requests() {
        let engine = RuleEngine::with_defaults(THRESHOLD);
        let mut context = base_context();
        context.request_count = 1001;

        let result = engine.evaluate(&context);
        assert_eq!(result.decision, RuleDecision::Deny);
        assert_eq!(result.matched_rules, vec!["rate_limit"]);
    }

    #[test]
    fn records_load_from_registry_shape() {
        let mut engine = RuleEngine::empty();
        engine.load_records(vec![RuleRecord {
            name: "weekend_block".to_string(),
            description: "No runs on weekends".to_string(),
            rule_kind: "context".to_string(),
            logic: json!({"==": [{"var": "custom.weekend"}, true]}),
            priority: 10,
            enabled: true,
            decision_on_match: "deny".to_string(),
            modifications: BTreeMap::new(),
        }]);

        let mut context = base_context();
        context.custom.insert("weekend".to_string(), json!(true));

        assert_eq!(engine.evaluate(&context).decision, RuleDecision::Deny);
    }
}
