//! Deterministic rule-based tagger.
//!
//! Produces the standard label set (PERSON, ORG, GPE, LOC, DATE, TIME,
//! MONEY, CARDINAL, QUANTITY, PERCENT) from lexicons and token shape,
//! plus the token stream and noun phrases the rest of the gateway
//! consumes. Every decision is a pure function of the input text.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// A single token with byte offsets into the normalized text.
#[derive(Debug, Clone)]
pub struct Token {
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub is_stop: bool,
    pub is_punct: bool,
}

/// An entity span produced by the tagger.
#[derive(Debug, Clone)]
pub struct TaggedSpan {
    pub text: String,
    pub label: String,
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
}

/// Full tagger output for one input.
#[derive(Debug, Clone, Default)]
pub struct TaggerOutput {
    pub entities: Vec<TaggedSpan>,
    pub tokens: Vec<Token>,
    pub noun_chunks: Vec<String>,
}

static STOPWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "an", "the", "to", "of", "in", "on", "at", "for", "from", "with", "and", "or",
        "but", "is", "are", "was", "were", "be", "been", "being", "am", "i", "you", "he",
        "she", "it", "we", "they", "me", "him", "them", "my", "your", "his", "her", "its",
        "our", "their", "this", "that", "these", "those", "as", "by", "so", "if", "then",
        "than", "too", "very", "can", "could", "will", "would", "shall", "should", "may",
        "might", "must", "just", "do", "does", "did", "doing", "not", "no", "nor", "all",
        "any", "both", "each", "few", "more", "most", "other", "some", "such", "only",
        "own", "same", "about", "against", "between", "into", "through", "during",
        "before", "after", "above", "below", "up", "down", "out", "off", "over", "under",
        "again", "further", "once", "here", "there", "when", "where", "why", "how",
        "what", "which", "who", "whom", "have", "has", "had", "having", "please",
    ]
    .into_iter()
    .collect()
});

// Action verbs are kept in the token stream but excluded from noun phrases.
static ACTION_VERBS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "navigate", "go", "open", "visit", "browse", "show", "get", "fetch", "read",
        "write", "create", "save", "store", "delete", "remove", "list", "run", "execute",
        "click", "press", "tap", "capture", "download", "upload", "send", "set", "put",
        "retrieve", "search", "find", "check", "make", "take", "snap", "screenshot",
        "help", "kill", "drop", "overwrite", "start", "stop",
    ]
    .into_iter()
    .collect()
});

static MONTHS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "january", "february", "march", "april", "may", "june", "july", "august",
        "september", "october", "november", "december",
    ]
    .into_iter()
    .collect()
});

static WEEKDAYS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    ["monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday"]
        .into_iter()
        .collect()
});

static RELATIVE_DAYS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    ["today", "tomorrow", "yesterday", "tonight"].into_iter().collect()
});

static NUMBER_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine",
        "ten", "eleven", "twelve", "twenty", "thirty", "forty", "fifty", "hundred",
        "thousand", "million", "billion",
    ]
    .into_iter()
    .collect()
});

static CURRENCY_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    ["dollar", "dollars", "euro", "euros", "pound", "pounds", "cent", "cents", "usd", "eur", "gbp"]
        .into_iter()
        .collect()
});

static UNIT_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "kb", "mb", "gb", "tb", "bytes", "byte", "km", "kilometers", "miles", "kg",
        "kilograms", "grams", "pounds", "meters", "seconds", "minutes", "hours", "days",
        "items", "rows", "lines", "files",
    ]
    .into_iter()
    .collect()
});

static GEO_NAMES: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "london", "paris", "berlin", "tokyo", "beijing", "moscow", "madrid", "rome",
        "chicago", "boston", "seattle", "sydney", "toronto", "dublin", "amsterdam",
        "stockholm", "france", "germany", "japan", "china", "russia", "spain", "italy",
        "england", "ireland", "canada", "australia", "sweden", "india", "brazil",
        "europe", "asia", "africa", "america", "usa", "uk",
        "new york", "san francisco", "los angeles", "hong kong", "new zealand",
        "united states", "united kingdom",
    ]
    .into_iter()
    .collect()
});

static ORG_SUFFIXES: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    ["inc", "inc.", "corp", "corp.", "ltd", "ltd.", "llc", "gmbh", "co", "co.", "plc"]
        .into_iter()
        .collect()
});

struct TaggerPatterns {
    time: Regex,
    iso_date: Regex,
    percent: Regex,
    money_symbol: Regex,
    number: Regex,
}

static PATTERNS: LazyLock<TaggerPatterns> = LazyLock::new(|| TaggerPatterns {
    time: Regex::new(r"^\d{1,2}:\d{2}(?::\d{2})?(?:am|pm)?$|^\d{1,2}(?:am|pm)$").expect("time pattern"),
    iso_date: Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("iso date pattern"),
    percent: Regex::new(r"^\d+(?:\.\d+)?%$").expect("percent pattern"),
    money_symbol: Regex::new(r"^[$€£]\d[\d,]*(?:\.\d+)?$").expect("money pattern"),
    number: Regex::new(r"^\d[\d,]*(?:\.\d+)?$").expect("number pattern"),
});

/// Shared stopword check, also used by the classifier's vectorizer.
pub(crate) fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(word)
}

/// Rule-based tagger over normalized text.
#[derive(Default)]
pub struct Tagger;

impl Tagger {
    pub fn new() -> Self {
        Self
    }

    /// Tokenize, tag entity spans, and chunk noun phrases.
    pub fn tag(&self, text: &str) -> TaggerOutput {
        let tokens = tokenize(text);
        let entities = tag_entities(&tokens);
        let noun_chunks = chunk_noun_phrases(&tokens);

        TaggerOutput {
            entities,
            tokens,
            noun_chunks,
        }
    }
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;

    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(s) = start.take() {
                push_token(text, s, idx, &mut tokens);
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }
    if let Some(s) = start {
        push_token(text, s, text.len(), &mut tokens);
    }

    tokens
}

fn push_token(text: &str, start: usize, end: usize, out: &mut Vec<Token>) {
    let raw = &text[start..end];

    // Strip trailing sentence punctuation but keep offsets aligned.
    let trimmed = raw.trim_end_matches(['.', ',', '!', '?', ';']);
    let (raw, end) = if trimmed.is_empty() {
        (raw, end)
    } else {
        (trimmed, start + trimmed.len())
    };

    let lower = raw.to_lowercase();
    let is_punct = raw.chars().all(|c| !c.is_alphanumeric());
    out.push(Token {
        text: raw.to_string(),
        start,
        end,
        is_stop: STOPWORDS.contains(lower.as_str()),
        is_punct,
    });
}

fn is_capitalized(token: &Token) -> bool {
    token
        .text
        .chars()
        .next()
        .map(|c| c.is_uppercase())
        .unwrap_or(false)
}

fn tag_entities(tokens: &[Token]) -> Vec<TaggedSpan> {
    let mut spans = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        let token = &tokens[i];
        let lower = token.text.to_lowercase();
        let p = &*PATTERNS;

        if token.is_punct {
            i += 1;
            continue;
        }

        if p.percent.is_match(&lower) {
            spans.push(span_over(tokens, i, i, "PERCENT", 0.95));
            i += 1;
            continue;
        }

        if p.money_symbol.is_match(&token.text) {
            spans.push(span_over(tokens, i, i, "MONEY", 0.95));
            i += 1;
            continue;
        }

        if p.time.is_match(&lower) {
            spans.push(span_over(tokens, i, i, "TIME", 0.95));
            i += 1;
            continue;
        }

        if p.iso_date.is_match(&lower)
            || WEEKDAYS.contains(lower.as_str())
            || RELATIVE_DAYS.contains(lower.as_str())
        {
            spans.push(span_over(tokens, i, i, "DATE", 0.95));
            i += 1;
            continue;
        }

        if MONTHS.contains(lower.as_str()) {
            // "june 5" style spans cover the day number too.
            let end = if i + 1 < tokens.len() && p.number.is_match(&tokens[i + 1].text) {
                i + 1
            } else {
                i
            };
            spans.push(span_over(tokens, i, end, "DATE", 0.95));
            i = end + 1;
            continue;
        }

        if p.number.is_match(&token.text) {
            if let Some(next) = tokens.get(i + 1) {
                let next_lower = next.text.to_lowercase();
                if CURRENCY_WORDS.contains(next_lower.as_str()) {
                    spans.push(span_over(tokens, i, i + 1, "MONEY", 0.95));
                    i += 2;
                    continue;
                }
                if UNIT_WORDS.contains(next_lower.as_str()) {
                    spans.push(span_over(tokens, i, i + 1, "QUANTITY", 0.9));
                    i += 2;
                    continue;
                }
                if next_lower == "percent" {
                    spans.push(span_over(tokens, i, i + 1, "PERCENT", 0.95));
                    i += 2;
                    continue;
                }
            }
            spans.push(span_over(tokens, i, i, "CARDINAL", 0.9));
            i += 1;
            continue;
        }

        if NUMBER_WORDS.contains(lower.as_str()) && !token.is_stop {
            spans.push(span_over(tokens, i, i, "CARDINAL", 0.7));
            i += 1;
            continue;
        }

        if is_capitalized(token) && !token.is_stop && !ACTION_VERBS.contains(lower.as_str()) {
            // Gather the full capitalized run ("New York", "John Smith").
            let mut end = i;
            while end + 1 < tokens.len()
                && is_capitalized(&tokens[end + 1])
                && !tokens[end + 1].is_stop
            {
                end += 1;
            }

            let joined_lower = tokens[i..=end]
                .iter()
                .map(|t| t.text.to_lowercase())
                .collect::<Vec<_>>()
                .join(" ");

            let label = if GEO_NAMES.contains(joined_lower.as_str()) {
                "GPE"
            } else if ORG_SUFFIXES.contains(
                tokens[end].text.to_lowercase().as_str(),
            ) || tokens[i..=end].iter().any(|t| {
                t.text.len() >= 2 && t.text.chars().all(|c| c.is_uppercase())
            }) {
                "ORG"
            } else {
                "PERSON"
            };
            let confidence = if label == "PERSON" { 0.6 } else { 0.8 };

            spans.push(span_over(tokens, i, end, label, confidence));
            i = end + 1;
            continue;
        }

        i += 1;
    }

    spans
}

fn span_over(tokens: &[Token], first: usize, last: usize, label: &str, confidence: f64) -> TaggedSpan {
    let start = tokens[first].start;
    let end = tokens[last].end;
    let text = tokens[first..=last]
        .iter()
        .map(|t| t.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    TaggedSpan {
        text,
        label: label.to_string(),
        start,
        end,
        confidence,
    }
}

fn chunk_noun_phrases(tokens: &[Token]) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for token in tokens {
        let lower = token.text.to_lowercase();
        let in_chunk = !token.is_stop && !token.is_punct && !ACTION_VERBS.contains(lower.as_str());
        if in_chunk {
            current.push(&token.text);
        } else if !current.is_empty() {
            chunks.push(current.join(" "));
            current.clear();
        }
    }
    if !current.is_empty() {
        chunks.push(current.join(" "));
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_with_offsets() {
        let tagger = Tagger::new();
        let output = tagger.tag("read the file now");
        let texts: Vec<_> = output.tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["read", "the", "file", "now"]);
        assert_eq!(output.tokens[0].start, 0);
        assert_eq!(output.tokens[2].start, 9);
        assert!(output.tokens[1].is_stop);
    }

    #[test]
    fn tags_money_and_cardinal() {
        let tagger = Tagger::new();
        let output = tagger.tag("transfer $500 and 42 items");
        let labels: Vec<_> = output.entities.iter().map(|e| e.label.as_str()).collect();
        assert!(labels.contains(&"MONEY"));
        assert!(labels.contains(&"QUANTITY"));
    }

    #[test]
    fn tags_date_and_time() {
        let tagger = Tagger::new();
        let output = tagger.tag("meet tomorrow at 14:30");
        let labels: Vec<_> = output.entities.iter().map(|e| e.label.as_str()).collect();
        assert!(labels.contains(&"DATE"));
        assert!(labels.contains(&"TIME"));
    }

    #[test]
    fn tags_capitalized_runs() {
        let tagger = Tagger::new();
        let output = tagger.tag("ask John Smith about Acme Corp in London");
        let by_label = |label: &str| {
            output
                .entities
                .iter()
                .find(|e| e.label == label)
                .map(|e| e.text.clone())
        };
        assert_eq!(by_label("PERSON").as_deref(), Some("John Smith"));
        assert_eq!(by_label("ORG").as_deref(), Some("Acme Corp"));
        assert_eq!(by_label("GPE").as_deref(), Some("London"));
    }

    #[test]
    fn sentence_initial_verb_is_not_an_entity() {
        let tagger = Tagger::new();
        let output = tagger.tag("Read file contents");
        assert!(output.entities.iter().all(|e| e.label != "PERSON"));
    }

    #[test]
    fn noun_chunks_skip_verbs_and_stopwords() {
        let tagger = Tagger::new();
        let output = tagger.tag("navigate to google");
        assert_eq!(output.noun_chunks, vec!["google"]);
    }
}
