//! Topic classification: the pluggable model capability, the keyword model artifact and the
//! per-section id-to-label tables.

use crate::section::{PerSection, Section};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use unicode_normalization::UnicodeNormalization;

/// Topic identifier produced by a model; ids are ranked at training time.
pub type TopicId = i64;

/// Reserved id for documents the model could not assign confidently.
pub const OUTLIER_TOPIC: TopicId = -1;

/// Label substituted for ids missing from a section's label table.
pub const UNCLASSIFIED_LABEL: &str = "unclassified";

/// Delimiter used when label sequences are persisted as one string.
pub const LABEL_DELIMITER: char = ',';

/// Failures loading or running a topic model.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    /// The artifact file could not be read.
    #[error("failed to read topic model {path}: {source}")]
    Io {
        /// Artifact location.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The artifact is not valid JSON for the expected schema.
    #[error("failed to parse topic model {path}: {source}")]
    Parse {
        /// Artifact location.
        path: PathBuf,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },
    /// The artifact parsed but violates a model invariant.
    #[error("invalid topic model: {0}")]
    InvalidArtifact(String),
    /// The model failed while scoring documents.
    #[error("inference failed: {0}")]
    Inference(String),
}

/// A pre-trained model assigning one topic id to each input document.
///
/// Implementations are CPU-bound and called from a blocking worker thread.
pub trait TopicClassifier: Send + Sync {
    /// Returns one topic id per entry of `documents`, in order.
    fn classify(&self, documents: &[String]) -> Result<Vec<TopicId>, ClassifierError>;
}

/// Maps topic ids to human-readable labels for one section.
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    labels: HashMap<TopicId, String>,
}

impl LabelTable {
    /// Builds a table from `(id, label)` pairs. Delimiter characters in labels are replaced
    /// so persisted sequences split back unambiguously.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (TopicId, S)>,
        S: Into<String>,
    {
        let labels = pairs
            .into_iter()
            .map(|(id, label)| (id, sanitize_label(&label.into())))
            .collect();
        Self { labels }
    }

    /// Label for `id`, or [`UNCLASSIFIED_LABEL`] when the table has no entry.
    pub fn label(&self, section: Section, id: TopicId) -> &str {
        match self.labels.get(&id) {
            Some(label) => label,
            None => {
                warn!(section = %section, topic = id, "classifier returned unknown topic id");
                UNCLASSIFIED_LABEL
            }
        }
    }

    /// Number of known topics.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

fn sanitize_label(label: &str) -> String {
    let label = label.trim();
    if label.is_empty() {
        return UNCLASSIFIED_LABEL.to_string();
    }
    label.replace(LABEL_DELIMITER, ";")
}

/// A section's model paired with its label table.
#[derive(Clone)]
pub struct SectionClassifier {
    section: Section,
    model: Arc<dyn TopicClassifier>,
    labels: LabelTable,
}

impl SectionClassifier {
    /// Wraps a model and its label table.
    pub fn new(section: Section, model: Arc<dyn TopicClassifier>, labels: LabelTable) -> Self {
        Self {
            section,
            model,
            labels,
        }
    }

    /// Section this classifier was trained on.
    pub fn section(&self) -> Section {
        self.section
    }

    /// Label table used to name topic ids.
    pub fn labels(&self) -> &LabelTable {
        &self.labels
    }

    /// Runs the model and names every resulting id, one label per document.
    pub fn classify_labels(&self, documents: &[String]) -> Result<Vec<String>, ClassifierError> {
        let ids = self.model.classify(documents)?;
        if !ids.is_empty() && ids.len() != documents.len() {
            return Err(ClassifierError::Inference(format!(
                "{} model returned {} ids for {} documents",
                self.section,
                ids.len(),
                documents.len()
            )));
        }
        Ok(ids
            .into_iter()
            .map(|id| self.labels.label(self.section, id).to_string())
            .collect())
    }
}

/// Loads `<dir>/<SectionName>.json` keyword models for every section.
pub fn load_section_classifiers(
    dir: &Path,
) -> Result<PerSection<SectionClassifier>, ClassifierError> {
    PerSection::try_from_fn(|section| -> Result<SectionClassifier, ClassifierError> {
        let path = dir.join(format!("{}.json", section.name()));
        let (model, labels) = KeywordTopicModel::load(&path)?;
        info!(
            section = %section,
            topics = labels.len(),
            path = %path.display(),
            "loaded topic model"
        );
        Ok(SectionClassifier::new(section, Arc::new(model), labels))
    })
}

/// Serialized keyword topic model: each topic is a weighted term list as produced by
/// class-based TF-IDF at training time.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicModelArtifact {
    /// Topics including the optional outlier entry.
    pub topics: Vec<TopicEntry>,
    /// Minimum cosine similarity needed to assign a non-outlier topic.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
    /// Curated labels keyed by generated topic name.
    #[serde(default)]
    pub custom_labels: HashMap<String, String>,
}

fn default_min_similarity() -> f64 {
    0.05
}

/// One topic in a [`TopicModelArtifact`].
#[derive(Debug, Clone, Deserialize)]
pub struct TopicEntry {
    /// Topic id.
    pub id: TopicId,
    /// Generated topic name, e.g. `3_libor_sofr_reference rates_usd libor`.
    pub name: String,
    /// Representative terms (unigrams or bigrams) with their weights.
    #[serde(default)]
    pub words: Vec<(String, f64)>,
}

/// Cosine-similarity classifier over topic term weights.
#[derive(Debug, Clone)]
pub struct KeywordTopicModel {
    topics: Vec<TopicVector>,
    min_similarity: f64,
}

#[derive(Debug, Clone)]
struct TopicVector {
    id: TopicId,
    weights: HashMap<String, f64>,
    norm: f64,
}

impl KeywordTopicModel {
    /// Reads and validates an artifact from disk.
    pub fn load(path: &Path) -> Result<(Self, LabelTable), ClassifierError> {
        let raw = fs::read_to_string(path).map_err(|source| ClassifierError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let artifact: TopicModelArtifact =
            serde_json::from_str(&raw).map_err(|source| ClassifierError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_artifact(artifact)
    }

    /// Builds the model and its label table from a parsed artifact.
    pub fn from_artifact(
        artifact: TopicModelArtifact,
    ) -> Result<(Self, LabelTable), ClassifierError> {
        if !artifact.min_similarity.is_finite() || artifact.min_similarity < 0.0 {
            return Err(ClassifierError::InvalidArtifact(format!(
                "min_similarity must be a non-negative number, got {}",
                artifact.min_similarity
            )));
        }

        let mut seen = HashSet::new();
        let mut topics = Vec::new();
        let mut labels = Vec::with_capacity(artifact.topics.len());
        for topic in artifact.topics {
            if !seen.insert(topic.id) {
                return Err(ClassifierError::InvalidArtifact(format!(
                    "duplicate topic id {}",
                    topic.id
                )));
            }
            if topic.id < OUTLIER_TOPIC {
                return Err(ClassifierError::InvalidArtifact(format!(
                    "topic id {} is below the outlier id",
                    topic.id
                )));
            }
            let label = artifact
                .custom_labels
                .get(&topic.name)
                .cloned()
                .unwrap_or_else(|| topic.name.clone());
            labels.push((topic.id, label));

            if topic.id == OUTLIER_TOPIC {
                continue;
            }
            let mut weights = HashMap::new();
            for (term, weight) in topic.words {
                let key = normalize_term(&term);
                if key.is_empty() || !weight.is_finite() || weight <= 0.0 {
                    continue;
                }
                *weights.entry(key).or_insert(0.0) += weight;
            }
            let norm = weights.values().map(|w| w * w).sum::<f64>().sqrt();
            topics.push(TopicVector {
                id: topic.id,
                weights,
                norm,
            });
        }
        topics.sort_by_key(|topic| topic.id);

        Ok((
            Self {
                topics,
                min_similarity: artifact.min_similarity,
            },
            LabelTable::from_pairs(labels),
        ))
    }

    fn classify_one(&self, document: &str) -> TopicId {
        let terms = term_counts(document);
        let doc_norm = terms.values().map(|c| c * c).sum::<f64>().sqrt();
        if doc_norm == 0.0 {
            return OUTLIER_TOPIC;
        }

        let mut best = (OUTLIER_TOPIC, 0.0f64);
        for topic in &self.topics {
            if topic.norm == 0.0 {
                continue;
            }
            let dot: f64 = topic
                .weights
                .iter()
                .filter_map(|(term, weight)| terms.get(term).map(|count| count * weight))
                .sum();
            let score = dot / (doc_norm * topic.norm);
            // Ties keep the lower, more significant id.
            if score > best.1 {
                best = (topic.id, score);
            }
        }

        if best.0 != OUTLIER_TOPIC && best.1 >= self.min_similarity {
            best.0
        } else {
            OUTLIER_TOPIC
        }
    }
}

impl TopicClassifier for KeywordTopicModel {
    fn classify(&self, documents: &[String]) -> Result<Vec<TopicId>, ClassifierError> {
        Ok(documents
            .iter()
            .map(|doc| self.classify_one(doc))
            .collect())
    }
}

fn tokens(text: &str) -> Vec<String> {
    let normalized: String = text.nfc().collect::<String>().to_lowercase();
    normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= 3)
        .map(str::to_string)
        .collect()
}

fn normalize_term(term: &str) -> String {
    tokens(term).join(" ")
}

fn term_counts(text: &str) -> HashMap<String, f64> {
    let tokens = tokens(text);
    let mut counts = HashMap::new();
    for token in &tokens {
        *counts.entry(token.clone()).or_insert(0.0) += 1.0;
    }
    for pair in tokens.windows(2) {
        *counts.entry(format!("{} {}", pair[0], pair[1])).or_insert(0.0) += 1.0;
    }
    counts
}
