//! Intent engine: forced overrides first, trained classifier second.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::intent::classifier::{IntentClassifier, TrainingReport};
use crate::intent::overrides::{ForcedOverride, OverrideRegistry, PatternKind};

/// Result of intent classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent: String,
    pub confidence: f64,
    pub is_forced: bool,
    pub matched_pattern: Option<String>,
    pub alternatives: Vec<(String, f64)>,
    /// Where the result came from: `forced_override`, `classifier`,
    /// `classifier_not_trained`, or `empty_input`.
    pub source: String,
}

impl IntentResult {
    fn unknown(source: &str) -> Self {
        Self {
            intent: "unknown".to_string(),
            confidence: 0.0,
            is_forced: false,
            matched_pattern: None,
            alternatives: Vec::new(),
            source: source.to_string(),
        }
    }
}

/// Two-stage intent classification engine.
pub struct IntentEngine {
    overrides: OverrideRegistry,
    classifier: IntentClassifier,
}

impl IntentEngine {
    pub fn new(classifier: IntentClassifier) -> Self {
        Self {
            overrides: OverrideRegistry::with_defaults(),
            classifier,
        }
    }

    /// Classify input text.
    ///
    /// Forced overrides short-circuit with confidence 1.0; otherwise the
    /// trained classifier supplies a probability distribution. Without a
    /// trained model the result is `unknown`.
    pub fn classify(&self, text: &str) -> IntentResult {
        if text.trim().is_empty() {
            return IntentResult::unknown("empty_input");
        }

        if let Some((intent, pattern)) = self.overrides.find_match(text) {
            debug!(intent, pattern, "forced override matched");
            return IntentResult {
                intent: intent.to_string(),
                confidence: 1.0,
                is_forced: true,
                matched_pattern: Some(pattern.to_string()),
                alternatives: Vec::new(),
                source: "forced_override".to_string(),
            };
        }

        if !self.classifier.is_trained() {
            return IntentResult::unknown("classifier_not_trained");
        }

        match self.classifier.predict(text) {
            Ok((intent, confidence, alternatives)) => IntentResult {
                intent,
                confidence,
                is_forced: false,
                matched_pattern: None,
                alternatives,
                source: "classifier".to_string(),
            },
            Err(e) => {
                warn!(%e, "classification failed");
                IntentResult::unknown("classifier_error")
            }
        }
    }

    pub fn train_classifier(
        &mut self,
        samples: &[(String, String)],
    ) -> Result<TrainingReport, GatewayError> {
        self.classifier.train(samples)
    }

    pub fn save_classifier(&self) -> Result<(), GatewayError> {
        self.classifier.save()
    }

    pub fn load_classifier(&mut self) -> Result<bool, GatewayError> {
        self.classifier.load()
    }

    pub fn classifier(&self) -> &IntentClassifier {
        &self.classifier
    }

    /// Append registry-stored overrides; invalid patterns are skipped.
    pub fn load_overrides(&mut self, records: Vec<OverrideRecord>) {
        let overrides = records.into_iter().filter_map(|record| {
            let kind: PatternKind = match record.pattern_kind.parse() {
                Ok(kind) => kind,
                Err(e) => {
                    warn!(pattern = %record.pattern, %e, "skipping override");
                    return None;
                }
            };
            match ForcedOverride::new(record.pattern.clone(), kind, record.target_intent, record.priority)
            {
                Ok(mut o) => {
                    o.enabled = record.enabled;
                    Some(o)
                }
                Err(e) => {
                    warn!(pattern = %record.pattern, %e, "skipping override");
                    None
                }
            }
        });
        self.overrides.load(overrides);
    }

    pub fn add_override(&mut self, override_: ForcedOverride) {
        self.overrides.add(override_);
    }
}

/// Override row as stored in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideRecord {
    pub pattern: String,
    pub pattern_kind: String,
    pub target_intent: String,
    pub priority: i32,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> IntentEngine {
        IntentEngine::new(IntentClassifier::new("unused.json"))
    }

    #[test]
    fn forced_override_bypasses_classifier() {
        let result = engine().classify("help");
        assert_eq!(result.intent, "show_help");
        assert!(result.is_forced);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.source, "forced_override");
    }

    #[test]
    fn empty_input_is_unknown() {
        let result = engine().classify("   ");
        assert_eq!(result.intent, "unknown");
        assert_eq!(result.source, "empty_input");
    }

    #[test]
    fn untrained_classifier_is_unknown() {
        let result = engine().classify("something entirely different");
        assert_eq!(result.intent, "unknown");
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.source, "classifier_not_trained");
    }

    #[test]
    fn trained_classifier_supplies_alternatives() {
        let mut engine = engine();
        let samples: Vec<(String, String)> = [
            ("read the file main.rs", "read_file"),
            ("show the file contents", "read_file"),
            ("open the file and read it", "read_file"),
            ("read file config.toml", "read_file"),
            ("print that file", "read_file"),
            ("read my log file", "read_file"),
            ("search the knowledge base", "search_docs"),
            ("query the docs", "search_docs"),
            ("search documentation now", "search_docs"),
            ("look through the docs", "search_docs"),
            ("search the manual", "search_docs"),
            ("query documentation index", "search_docs"),
        ]
        .iter()
        .map(|(t, l)| (t.to_string(), l.to_string()))
        .collect();

        engine.train_classifier(&samples).unwrap();

        let result = engine.classify("search the documentation please");
        assert_eq!(result.intent, "search_docs");
        assert!(!result.is_forced);
        assert_eq!(result.source, "classifier");
        assert!(!result.alternatives.is_empty());
    }

    #[test]
    fn registry_overrides_are_loaded() {
        let mut engine = engine();
        engine.load_overrides(vec![OverrideRecord {
            pattern: "deploy".to_string(),
            pattern_kind: "contains".to_string(),
            target_intent: "run_deploy".to_string(),
            priority: 500,
            enabled: true,
        }]);

        let result = engine.classify("deploy the service");
        assert_eq!(result.intent, "run_deploy");
        assert!(result.is_forced);
    }
}
