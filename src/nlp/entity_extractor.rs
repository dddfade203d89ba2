//! Entity extraction.
//!
//! Combines two sources over the normalized input text:
//! 1. The rule-based tagger (standard NER labels, tokens, noun phrases)
//! 2. A fixed table of compiled regex patterns for structured values
//!    (file paths, URLs, emails, addresses, ports, versions, commands)
//!
//! Overlapping spans are deduplicated left-to-right; tagger entities win
//! ties at the same start offset.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::nlp::tagger::Tagger;

/// Where an entity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitySource {
    /// Rule-based tagger (standard NER labels).
    Ner,
    /// Compiled regex pattern table.
    Pattern,
}

/// A single extracted entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub text: String,
    pub label: String,
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
    pub source: EntitySource,
}

/// Result of entity extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub original_text: String,
    pub normalized_text: String,
    pub entities: Vec<ExtractedEntity>,
    pub tokens: Vec<String>,
    pub noun_chunks: Vec<String>,
    pub metadata: ExtractionMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    pub empty_input: bool,
    pub ner_entity_count: usize,
    pub pattern_entity_count: usize,
}

impl ExtractionResult {
    pub fn entities_by_label(&self, label: &str) -> Vec<&ExtractedEntity> {
        self.entities.iter().filter(|e| e.label == label).collect()
    }

    pub fn entity_texts_by_label(&self, label: &str) -> Vec<&str> {
        self.entities
            .iter()
            .filter(|e| e.label == label)
            .map(|e| e.text.as_str())
            .collect()
    }

    pub fn has_entity(&self, label: &str) -> bool {
        self.entities.iter().any(|e| e.label == label)
    }
}

/// One compiled pattern contributing a label.
struct LabeledPattern {
    label: &'static str,
    regex: Regex,
}

static CUSTOM_PATTERNS: LazyLock<Vec<LabeledPattern>> = LazyLock::new(|| {
    let table: &[(&str, &str)] = &[
        // Unix and Windows absolute paths
        ("FILE_PATH", r#"[/\\]?(?:[a-zA-Z]:)?(?:[/\\][^\s/\\:*?"<>|]+)+"#),
        // Relative paths
        ("FILE_PATH", r"\./[^\s]+"),
        // Home directory paths
        ("FILE_PATH", r"~[/\\][^\s]+"),
        ("URL", r#"https?://[^\s<>"{}|\\^`\[\]]+"#),
        ("URL", r#"www\.[^\s<>"{}|\\^`\[\]]+"#),
        ("EMAIL", r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}"),
        ("IP_ADDRESS", r"\b(?:\d{1,3}\.){3}\d{1,3}\b"),
        ("IP_ADDRESS", r"\b(?:[0-9a-fA-F]{1,4}:){7}[0-9a-fA-F]{1,4}\b"),
        ("PORT", r":\d{1,5}\b"),
        ("VERSION", r"\bv?\d+\.\d+(?:\.\d+)*(?:-[a-zA-Z0-9]+)?\b"),
        ("JSON_PATH", r"\$\.[a-zA-Z0-9_.\[\]]+"),
        ("COMMAND", r"`[^`]+`"),
    ];

    table
        .iter()
        .map(|(label, pattern)| LabeledPattern {
            label,
            regex: Regex::new(&format!("(?i){pattern}")).expect("entity pattern"),
        })
        .collect()
});

/// Entity extractor combining the tagger with the pattern table.
#[derive(Default)]
pub struct EntityExtractor {
    tagger: Tagger,
}

impl EntityExtractor {
    pub fn new() -> Self {
        Self { tagger: Tagger::new() }
    }

    /// Extract entities, tokens, and noun phrases from `text`.
    ///
    /// Empty or whitespace-only input yields an empty result flagged in
    /// metadata rather than an error.
    pub fn extract(&self, text: &str) -> ExtractionResult {
        if text.trim().is_empty() {
            return ExtractionResult {
                original_text: text.to_string(),
                metadata: ExtractionMetadata {
                    empty_input: true,
                    ..Default::default()
                },
                ..Default::default()
            };
        }

        let normalized = normalize_text(text);
        let tagged = self.tagger.tag(&normalized);

        let mut entities: Vec<ExtractedEntity> = tagged
            .entities
            .iter()
            .map(|span| ExtractedEntity {
                text: span.text.clone(),
                label: span.label.clone(),
                start: span.start,
                end: span.end,
                confidence: span.confidence,
                source: EntitySource::Ner,
            })
            .collect();
        let ner_count = entities.len();

        let pattern_entities = extract_pattern_entities(&normalized);
        let pattern_count = pattern_entities.len();
        entities.extend(pattern_entities);

        let entities = deduplicate(entities);
        debug!(count = entities.len(), "extracted entities");

        ExtractionResult {
            original_text: text.to_string(),
            normalized_text: normalized,
            entities,
            tokens: tagged
                .tokens
                .iter()
                .filter(|t| !t.is_stop && !t.is_punct && !t.text.trim().is_empty())
                .map(|t| t.text.clone())
                .collect(),
            noun_chunks: tagged.noun_chunks,
            metadata: ExtractionMetadata {
                empty_input: false,
                ner_entity_count: ner_count,
                pattern_entity_count: pattern_count,
            },
        }
    }
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract_pattern_entities(text: &str) -> Vec<ExtractedEntity> {
    let mut entities = Vec::new();

    for pattern in CUSTOM_PATTERNS.iter() {
        for m in pattern.regex.find_iter(text) {
            // Command entities drop the surrounding backticks.
            let matched = m.as_str().trim_matches('`');
            entities.push(ExtractedEntity {
                text: matched.to_string(),
                label: pattern.label.to_string(),
                start: m.start(),
                end: m.end(),
                confidence: 0.9,
                source: EntitySource::Pattern,
            });
        }
    }

    entities
}

/// Drop overlapping spans: sort by `(start, NER-first)`, then emit any
/// entity whose start is at or past the previous entity's end.
fn deduplicate(mut entities: Vec<ExtractedEntity>) -> Vec<ExtractedEntity> {
    entities.sort_by_key(|e| (e.start, matches!(e.source, EntitySource::Pattern)));

    let mut deduplicated: Vec<ExtractedEntity> = Vec::with_capacity(entities.len());
    let mut last_end = 0usize;
    let mut first = true;

    for entity in entities {
        if first || entity.start >= last_end {
            last_end = entity.end;
            first = false;
            deduplicated.push(entity);
        }
    }

    deduplicated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_file_path() {
        let extractor = EntityExtractor::new();
        let result = extractor.extract("read file /tmp/a.txt");

        let paths = result.entity_texts_by_label("FILE_PATH");
        assert_eq!(paths, vec!["/tmp/a.txt"]);
    }

    #[test]
    fn extracts_url_and_email() {
        let extractor = EntityExtractor::new();
        let result = extractor.extract("send https://example.com/x to bob@example.com");

        assert!(result.has_entity("URL"));
        assert!(result.has_entity("EMAIL"));
    }

    #[test]
    fn strips_command_backticks() {
        let extractor = EntityExtractor::new();
        let result = extractor.extract("run `ls -la` for me");

        let commands = result.entity_texts_by_label("COMMAND");
        assert_eq!(commands, vec!["ls -la"]);
    }

    #[test]
    fn entities_never_overlap() {
        let extractor = EntityExtractor::new();
        let result =
            extractor.extract("fetch https://example.com:8080/v1.2.3 at 10.0.0.1 tomorrow");

        for pair in result.entities.windows(2) {
            assert!(
                pair[1].start >= pair[0].end,
                "{:?} overlaps {:?}",
                pair[1],
                pair[0]
            );
        }
    }

    #[test]
    fn empty_input_is_flagged_not_an_error() {
        let extractor = EntityExtractor::new();
        let result = extractor.extract("   ");

        assert!(result.metadata.empty_input);
        assert!(result.entities.is_empty());
        assert!(result.tokens.is_empty());
    }

    #[test]
    fn whitespace_is_collapsed() {
        let extractor = EntityExtractor::new();
        let result = extractor.extract("  read   the\tfile ");
        assert_eq!(result.normalized_text, "read the file");
    }

    #[test]
    fn tokens_exclude_stopwords() {
        let extractor = EntityExtractor::new();
        let result = extractor.extract("navigate to google");
        assert_eq!(result.tokens, vec!["navigate", "google"]);
    }
}
