//! Trained intent classifier.
//!
//! A TF-IDF vectorizer (unigrams + bigrams, stopword-filtered, capped
//! feature table) feeding a multinomial logistic-regression model trained
//! by deterministic full-batch gradient descent with balanced class
//! weights. The trained model is persisted as a single JSON file written
//! atomically (write to a temp file, then rename into place).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::nlp::tagger::is_stopword;

const MAX_FEATURES: usize = 5000;
const MIN_TRAINING_SAMPLES: usize = 10;
const EPOCHS: usize = 300;
const LEARNING_RATE: f64 = 0.5;
const L2_PENALTY: f64 = 1e-4;
/// One out of every HOLD_OUT_EVERY samples per class is held out.
const HOLD_OUT_EVERY: usize = 5;

/// Per-class evaluation metrics from the held-out split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Training summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub num_classes: usize,
    pub classes: Vec<String>,
    pub train_size: usize,
    pub test_size: usize,
    pub metrics: BTreeMap<String, ClassMetrics>,
}

/// TF-IDF vocabulary and weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Vectorizer {
    vocabulary: BTreeMap<String, usize>,
    idf: Vec<f64>,
}

impl Vectorizer {
    fn fit(documents: &[&str]) -> Self {
        // Count document frequency and total frequency per term.
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        let mut total_freq: HashMap<String, usize> = HashMap::new();

        for doc in documents {
            let terms = extract_terms(doc);
            let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
            for term in &terms {
                *total_freq.entry(term.clone()).or_default() += 1;
                if seen.insert(term.as_str()) {
                    *doc_freq.entry(term.clone()).or_default() += 1;
                }
            }
        }

        // Cap the vocabulary: most frequent terms first, ties alphabetical.
        let mut ranked: Vec<(String, usize)> = total_freq.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(MAX_FEATURES);
        ranked.sort_by(|a, b| a.0.cmp(&b.0));

        let n_docs = documents.len() as f64;
        let mut vocabulary = BTreeMap::new();
        let mut idf = Vec::with_capacity(ranked.len());
        for (index, (term, _)) in ranked.into_iter().enumerate() {
            let df = doc_freq.get(&term).copied().unwrap_or(0) as f64;
            // Smoothed idf, matching the usual tf-idf formulation.
            idf.push(((1.0 + n_docs) / (1.0 + df)).ln() + 1.0);
            vocabulary.insert(term, index);
        }

        Self { vocabulary, idf }
    }

    /// Sparse L2-normalized tf-idf vector.
    fn transform(&self, text: &str) -> Vec<(usize, f64)> {
        let mut counts: BTreeMap<usize, f64> = BTreeMap::new();
        for term in extract_terms(text) {
            if let Some(&index) = self.vocabulary.get(&term) {
                *counts.entry(index).or_default() += 1.0;
            }
        }

        let mut vector: Vec<(usize, f64)> = counts
            .into_iter()
            .map(|(index, tf)| (index, tf * self.idf[index]))
            .collect();

        let norm = vector.iter().map(|(_, v)| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for (_, v) in vector.iter_mut() {
                *v /= norm;
            }
        }

        vector
    }

    fn num_features(&self) -> usize {
        self.idf.len()
    }
}

fn extract_terms(text: &str) -> Vec<String> {
    let words: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !is_stopword(w))
        .map(|w| w.to_string())
        .collect();

    let mut terms = words.clone();
    for pair in words.windows(2) {
        terms.push(format!("{} {}", pair[0], pair[1]));
    }
    terms
}

/// Multinomial logistic-regression weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LinearModel {
    classes: Vec<String>,
    /// Row per class, column per feature.
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
}

impl LinearModel {
    fn fit(vectors: &[Vec<(usize, f64)>], labels: &[usize], classes: Vec<String>, n_features: usize) -> Self {
        let n_classes = classes.len();
        let n_samples = vectors.len() as f64;

        // Balanced class weights.
        let mut class_counts = vec![0usize; n_classes];
        for &label in labels {
            class_counts[label] += 1;
        }
        let sample_weights: Vec<f64> = labels
            .iter()
            .map(|&l| n_samples / (n_classes as f64 * class_counts[l] as f64))
            .collect();

        let mut weights = vec![vec![0.0; n_features]; n_classes];
        let mut bias = vec![0.0; n_classes];

        for _ in 0..EPOCHS {
            let mut grad_w = vec![vec![0.0; n_features]; n_classes];
            let mut grad_b = vec![0.0; n_classes];

            for (i, vector) in vectors.iter().enumerate() {
                let probs = softmax(&scores(vector, &weights, &bias));
                let sw = sample_weights[i];
                for c in 0..n_classes {
                    let error = sw * (probs[c] - if labels[i] == c { 1.0 } else { 0.0 });
                    grad_b[c] += error;
                    for &(index, value) in vector {
                        grad_w[c][index] += error * value;
                    }
                }
            }

            for c in 0..n_classes {
                for f in 0..n_features {
                    weights[c][f] -=
                        LEARNING_RATE * (grad_w[c][f] / n_samples + L2_PENALTY * weights[c][f]);
                }
                bias[c] -= LEARNING_RATE * grad_b[c] / n_samples;
            }
        }

        Self { classes, weights, bias }
    }

    fn predict_proba(&self, vector: &[(usize, f64)]) -> Vec<f64> {
        softmax(&scores(vector, &self.weights, &self.bias))
    }
}

fn scores(vector: &[(usize, f64)], weights: &[Vec<f64>], bias: &[f64]) -> Vec<f64> {
    weights
        .iter()
        .zip(bias)
        .map(|(row, b)| b + vector.iter().map(|&(i, v)| row[i] * v).sum::<f64>())
        .collect()
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

/// Serialized model file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedModel {
    vectorizer: Vectorizer,
    model: LinearModel,
    is_trained: bool,
}

/// Intent classifier with atomic persistence.
pub struct IntentClassifier {
    model_path: PathBuf,
    persisted: Option<PersistedModel>,
}

impl IntentClassifier {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            persisted: None,
        }
    }

    pub fn is_trained(&self) -> bool {
        self.persisted.as_ref().map(|p| p.is_trained).unwrap_or(false)
    }

    pub fn classes(&self) -> &[String] {
        self.persisted
            .as_ref()
            .map(|p| p.model.classes.as_slice())
            .unwrap_or(&[])
    }

    /// Train on `(text, label)` pairs.
    ///
    /// Requires at least ten samples across at least two labels. A
    /// deterministic stratified hold-out split (one in five per class)
    /// feeds the per-class precision/recall/F1 report.
    pub fn train(&mut self, samples: &[(String, String)]) -> Result<TrainingReport, GatewayError> {
        if samples.len() < MIN_TRAINING_SAMPLES {
            return Err(GatewayError::Training(format!(
                "need at least {MIN_TRAINING_SAMPLES} training samples, got {}",
                samples.len()
            )));
        }

        let mut classes: Vec<String> = samples.iter().map(|(_, l)| l.clone()).collect();
        classes.sort();
        classes.dedup();
        if classes.len() < 2 {
            return Err(GatewayError::Training(
                "need at least 2 distinct intent labels".to_string(),
            ));
        }

        let class_index: BTreeMap<&str, usize> = classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_str(), i))
            .collect();

        // Deterministic stratified split: within each class, every fifth
        // sample (in input order) is held out.
        let mut train: Vec<(&str, usize)> = Vec::new();
        let mut test: Vec<(&str, usize)> = Vec::new();
        let mut per_class_seen = vec![0usize; classes.len()];
        for (text, label) in samples {
            let label_index = class_index[label.as_str()];
            per_class_seen[label_index] += 1;
            if per_class_seen[label_index] % HOLD_OUT_EVERY == 0 {
                test.push((text.as_str(), label_index));
            } else {
                train.push((text.as_str(), label_index));
            }
        }

        let train_docs: Vec<&str> = train.iter().map(|(t, _)| *t).collect();
        let vectorizer = Vectorizer::fit(&train_docs);
        let vectors: Vec<Vec<(usize, f64)>> =
            train_docs.iter().map(|d| vectorizer.transform(d)).collect();
        let labels: Vec<usize> = train.iter().map(|(_, l)| *l).collect();

        let model = LinearModel::fit(&vectors, &labels, classes.clone(), vectorizer.num_features());

        let report = evaluate(&vectorizer, &model, &test, &classes, train.len());
        info!(classes = classes.len(), train = train.len(), test = test.len(), "trained intent classifier");

        self.persisted = Some(PersistedModel {
            vectorizer,
            model,
            is_trained: true,
        });

        Ok(report)
    }

    /// Predict `(intent, confidence, top-3 alternatives)`.
    pub fn predict(&self, text: &str) -> Result<(String, f64, Vec<(String, f64)>), GatewayError> {
        let persisted = self
            .persisted
            .as_ref()
            .filter(|p| p.is_trained)
            .ok_or(GatewayError::ClassifierNotTrained)?;

        let vector = persisted.vectorizer.transform(text);
        let probs = persisted.model.predict_proba(&vector);

        let mut ranked: Vec<(usize, f64)> = probs.iter().copied().enumerate().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let (best, confidence) = ranked[0];
        let alternatives = ranked
            .iter()
            .skip(1)
            .take(3)
            .map(|&(i, p)| (persisted.model.classes[i].clone(), p))
            .collect();

        Ok((persisted.model.classes[best].clone(), confidence, alternatives))
    }

    /// Persist the trained model atomically to the configured path.
    pub fn save(&self) -> Result<(), GatewayError> {
        let persisted = self
            .persisted
            .as_ref()
            .ok_or(GatewayError::ClassifierNotTrained)?;

        if let Some(parent) = self.model_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let parent = self.model_path.parent().unwrap_or_else(|| Path::new("."));
        let file = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer(file.as_file(), persisted)?;
        file.persist(&self.model_path)
            .map_err(|e| GatewayError::Io(e.error))?;

        info!(path = %self.model_path.display(), "saved intent classifier");
        Ok(())
    }

    /// Load a previously saved model; returns false when none exists.
    pub fn load(&mut self) -> Result<bool, GatewayError> {
        if !self.model_path.exists() {
            return Ok(false);
        }

        let contents = std::fs::read_to_string(&self.model_path)?;
        match serde_json::from_str::<PersistedModel>(&contents) {
            Ok(persisted) => {
                self.persisted = Some(persisted);
                info!(path = %self.model_path.display(), "loaded intent classifier");
                Ok(true)
            }
            Err(e) => {
                warn!(path = %self.model_path.display(), %e, "failed to parse saved model");
                Ok(false)
            }
        }
    }
}

fn evaluate(
    vectorizer: &Vectorizer,
    model: &LinearModel,
    test: &[(&str, usize)],
    classes: &[String],
    train_size: usize,
) -> TrainingReport {
    let n = classes.len();
    let mut true_positive = vec![0usize; n];
    let mut predicted_count = vec![0usize; n];
    let mut actual_count = vec![0usize; n];

    for (text, actual) in test {
        actual_count[*actual] += 1;
        let probs = model.predict_proba(&vectorizer.transform(text));
        let predicted = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0);
        predicted_count[predicted] += 1;
        if predicted == *actual {
            true_positive[predicted] += 1;
        }
    }

    let mut metrics = BTreeMap::new();
    for (i, class) in classes.iter().enumerate() {
        let precision = if predicted_count[i] > 0 {
            true_positive[i] as f64 / predicted_count[i] as f64
        } else {
            0.0
        };
        let recall = if actual_count[i] > 0 {
            true_positive[i] as f64 / actual_count[i] as f64
        } else {
            0.0
        };
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        metrics.insert(
            class.clone(),
            ClassMetrics {
                precision,
                recall,
                f1,
                support: actual_count[i],
            },
        );
    }

    TrainingReport {
        num_classes: n,
        classes: classes.to_vec(),
        train_size,
        test_size: test.len(),
        metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn training_samples() -> Vec<(String, String)> {
        let rows = [
            ("read the file main.rs", "read_file"),
            ("show me the file contents", "read_file"),
            ("open that file and read it", "read_file"),
            ("read file config.toml", "read_file"),
            ("print the file please", "read_file"),
            ("read the log file", "read_file"),
            ("fetch the page from the web", "fetch_url"),
            ("download the webpage", "fetch_url"),
            ("fetch url for me", "fetch_url"),
            ("get the web page", "fetch_url"),
            ("fetch that website", "fetch_url"),
            ("download from the url", "fetch_url"),
        ];
        rows.iter().map(|(t, l)| (t.to_string(), l.to_string())).collect()
    }

    #[test]
    fn rejects_too_few_samples() {
        let mut classifier = IntentClassifier::new("unused.json");
        let samples = vec![("a".to_string(), "x".to_string()); 5];
        assert!(classifier.train(&samples).is_err());
    }

    #[test]
    fn rejects_single_label() {
        let mut classifier = IntentClassifier::new("unused.json");
        let samples = vec![("read the file".to_string(), "read_file".to_string()); 12];
        assert!(classifier.train(&samples).is_err());
    }

    #[test]
    fn trains_and_predicts() {
        let mut classifier = IntentClassifier::new("unused.json");
        let report = classifier.train(&training_samples()).unwrap();

        assert_eq!(report.num_classes, 2);
        assert!(report.test_size > 0);

        let (intent, confidence, alternatives) =
            classifier.predict("please read the file notes.txt").unwrap();
        assert_eq!(intent, "read_file");
        assert!(confidence > 0.5);
        assert!(!alternatives.is_empty());
    }

    #[test]
    fn prediction_is_deterministic() {
        let mut classifier = IntentClassifier::new("unused.json");
        classifier.train(&training_samples()).unwrap();

        let a = classifier.predict("fetch the page").unwrap();
        let b = classifier.predict("fetch the page").unwrap();
        assert_eq!(a.0, b.0);
        assert_eq!(a.1, b.1);
    }

    #[test]
    fn untrained_predict_fails() {
        let classifier = IntentClassifier::new("unused.json");
        assert!(matches!(
            classifier.predict("anything"),
            Err(GatewayError::ClassifierNotTrained)
        ));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        let mut classifier = IntentClassifier::new(&path);
        classifier.train(&training_samples()).unwrap();
        classifier.save().unwrap();

        let mut reloaded = IntentClassifier::new(&path);
        assert!(reloaded.load().unwrap());
        assert!(reloaded.is_trained());

        let (intent, _, _) = reloaded.predict("read the file").unwrap();
        assert_eq!(intent, "read_file");
    }

    #[test]
    fn load_missing_model_is_not_an_error() {
        let mut classifier = IntentClassifier::new("does/not/exist.json");
        assert!(!classifier.load().unwrap());
        assert!(!classifier.is_trained());
    }
}
