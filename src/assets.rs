//! Pre-computed topic tables loaded once at startup.
//!
//! Each asset file is a JSON object keyed by section name whose values are data frames. Frames
//! may be record arrays, column-oriented objects, `split` objects, or any of those encoded a
//! second time as a JSON string.

use crate::classifier::TopicId;
use crate::section::{PerSection, Section};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File holding topic frequencies over time.
pub const TOPICS_OVER_TIME_FILE: &str = "topics_overtime.json";
/// File holding per-document sentiment with topic assignments.
pub const TOPICS_SENTIMENT_FILE: &str = "topics_and_docs_sentiment.json";

/// One topic's frequency at one timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesRow {
    /// Topic id.
    #[serde(rename = "Topic")]
    pub topic: TopicId,
    /// Representative words at this timestamp.
    #[serde(rename = "Words")]
    pub words: String,
    /// Topic name.
    #[serde(rename = "Name")]
    pub name: String,
    /// Observation time.
    #[serde(rename = "Timestamp", deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Document count for the topic at this time.
    #[serde(rename = "Frequency", deserialize_with = "deserialize_nullable_f64")]
    pub frequency: f64,
}

/// Sentiment of one document assigned to a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentRow {
    /// Topic id.
    #[serde(rename = "Topic")]
    pub topic: TopicId,
    /// Topic name.
    #[serde(rename = "Name")]
    pub name: String,
    /// Filing time of the document.
    #[serde(rename = "Timestamp", deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Document text, when the asset carries it.
    #[serde(rename = "Document", default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    /// Sentiment score; missing values load as NaN.
    #[serde(rename = "sentiment_sigma_fsa", deserialize_with = "deserialize_nullable_f64")]
    pub sentiment: f64,
}

/// Failures loading an asset file.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    /// The file could not be read.
    #[error("failed to read asset {path}: {source}")]
    Io {
        /// Asset location.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not a JSON object of frames.
    #[error("failed to parse asset {path}: {source}")]
    Parse {
        /// Asset location.
        path: PathBuf,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },
    /// A section's frame could not be decoded into rows.
    #[error("invalid frame for {section} in {path}: {message}")]
    Frame {
        /// Asset location.
        path: PathBuf,
        /// Offending section.
        section: Section,
        /// Decoder message.
        message: String,
    },
}

/// Read-only in-memory tables, shared by every request.
#[derive(Debug, Clone, Default)]
pub struct AssetStore {
    topics_over_time: PerSection<Vec<TimeSeriesRow>>,
    sentiment: PerSection<Vec<SentimentRow>>,
}

impl AssetStore {
    /// Wraps tables that are already in memory.
    pub fn new(
        topics_over_time: PerSection<Vec<TimeSeriesRow>>,
        sentiment: PerSection<Vec<SentimentRow>>,
    ) -> Self {
        Self {
            topics_over_time,
            sentiment,
        }
    }

    /// Loads both asset files from `dir`.
    pub fn load(dir: &Path) -> Result<Self, AssetError> {
        let topics_over_time = load_sections(&dir.join(TOPICS_OVER_TIME_FILE))?;
        let sentiment = load_sections(&dir.join(TOPICS_SENTIMENT_FILE))?;
        for (section, rows) in topics_over_time.iter() {
            info!(
                section = %section,
                time_rows = rows.len(),
                sentiment_rows = sentiment.get(section).len(),
                "loaded assets"
            );
        }
        Ok(Self::new(topics_over_time, sentiment))
    }

    /// Topic frequency rows per section.
    pub fn topics_over_time(&self) -> &PerSection<Vec<TimeSeriesRow>> {
        &self.topics_over_time
    }

    /// Document sentiment rows per section.
    pub fn sentiment(&self) -> &PerSection<Vec<SentimentRow>> {
        &self.sentiment
    }
}

fn load_sections<T: DeserializeOwned>(path: &Path) -> Result<PerSection<Vec<T>>, AssetError> {
    let raw = fs::read_to_string(path).map_err(|source| AssetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut frames: Map<String, Value> =
        serde_json::from_str(&raw).map_err(|source| AssetError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let tables = PerSection::try_from_fn(|section| match frames.remove(section.name()) {
        Some(frame) => decode_frame(frame).map_err(|message| AssetError::Frame {
            path: path.to_path_buf(),
            section,
            message,
        }),
        None => {
            warn!(section = %section, path = %path.display(), "section missing from asset");
            Ok(Vec::new())
        }
    })?;
    for key in frames.keys() {
        warn!(key = %key, path = %path.display(), "ignoring unknown asset key");
    }
    Ok(tables)
}

/// Decodes one data frame into typed rows.
pub fn decode_frame<T: DeserializeOwned>(frame: Value) -> Result<Vec<T>, String> {
    let frame = match frame {
        Value::String(encoded) => serde_json::from_str(&encoded).map_err(|e| e.to_string())?,
        other => other,
    };
    let records = match frame {
        Value::Array(records) => records,
        Value::Object(object) if object.contains_key("columns") && object.contains_key("data") => {
            split_to_records(object)?
        }
        Value::Object(columns) => columns_to_records(columns)?,
        other => return Err(format!("expected an array or object frame, found {other}")),
    };
    records
        .into_iter()
        .enumerate()
        .map(|(idx, record)| {
            serde_json::from_value(record).map_err(|e| format!("row {idx}: {e}"))
        })
        .collect()
}

fn columns_to_records(columns: Map<String, Value>) -> Result<Vec<Value>, String> {
    let mut rows: BTreeMap<IndexKey, Map<String, Value>> = BTreeMap::new();
    for (column, cells) in columns {
        let cells: Vec<(IndexKey, Value)> = match cells {
            Value::Object(cells) => cells
                .into_iter()
                .map(|(index, value)| (IndexKey::parse(index), value))
                .collect(),
            Value::Array(cells) => cells
                .into_iter()
                .enumerate()
                .map(|(index, value)| (IndexKey::Position(index as i64), value))
                .collect(),
            _ => return Err(format!("column `{column}` is not an object or array")),
        };
        for (index, value) in cells {
            rows.entry(index).or_default().insert(column.clone(), value);
        }
    }
    Ok(rows.into_values().map(Value::Object).collect())
}

fn split_to_records(mut object: Map<String, Value>) -> Result<Vec<Value>, String> {
    let columns: Vec<String> = object
        .remove("columns")
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| format!("split columns: {e}"))?
        .unwrap_or_default();
    let data: Vec<Vec<Value>> = object
        .remove("data")
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| format!("split data: {e}"))?
        .unwrap_or_default();
    data.into_iter()
        .map(|row| {
            if row.len() != columns.len() {
                return Err(format!(
                    "split row has {} cells for {} columns",
                    row.len(),
                    columns.len()
                ));
            }
            Ok(Value::Object(columns.iter().cloned().zip(row).collect()))
        })
        .collect()
}

/// Frame index label; numeric labels sort numerically ahead of string labels.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum IndexKey {
    Position(i64),
    Label(String),
}

impl IndexKey {
    fn parse(raw: String) -> Self {
        raw.parse().map(Self::Position).unwrap_or(Self::Label(raw))
    }
}

/// Accepts epoch milliseconds or date / date-time strings.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Float(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Millis(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| de::Error::custom(format!("timestamp {ms} out of range"))),
        Raw::Float(ms) => Utc
            .timestamp_millis_opt(ms as i64)
            .single()
            .ok_or_else(|| de::Error::custom(format!("timestamp {ms} out of range"))),
        Raw::Text(text) => parse_timestamp_text(&text)
            .ok_or_else(|| de::Error::custom(format!("unrecognized timestamp `{text}`"))),
    }
}

/// Frames written from pandas store NaN as `null`.
fn deserialize_nullable_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

fn parse_timestamp_text(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Some(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_record_frames_with_millisecond_timestamps() {
        let rows: Vec<TimeSeriesRow> = decode_frame(json!([
            {"Topic": 0, "Words": "libor, sofr", "Name": "0_libor", "Timestamp": 1577836800000i64, "Frequency": 3}
        ]))
        .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp.to_rfc3339(), "2020-01-01T00:00:00+00:00");
        assert_eq!(rows[0].frequency, 3.0);
    }

    #[test]
    fn decodes_double_encoded_column_frames() {
        let columns = json!({
            "Topic": {"0": -1, "1": 2, "10": 5},
            "Name": {"0": "-1_outliers", "1": "2_risk", "10": "5_debt"},
            "Timestamp": {"0": "2019-03-01", "1": "2019-06-30 12:00:00", "10": "2020-01-01T00:00:00Z"},
            "sentiment_sigma_fsa": {"0": 0.1, "1": -0.4, "10": 0.0}
        });
        let rows: Vec<SentimentRow> = decode_frame(Value::String(columns.to_string())).unwrap();

        let topics: Vec<TopicId> = rows.iter().map(|r| r.topic).collect();
        assert_eq!(topics, vec![-1, 2, 5]);
        assert_eq!(rows[1].sentiment, -0.4);
        assert!(rows[0].document.is_none());
    }

    #[test]
    fn decodes_split_frames() {
        let rows: Vec<SentimentRow> = decode_frame(json!({
            "columns": ["Topic", "Name", "Timestamp", "Document", "sentiment_sigma_fsa"],
            "index": [0],
            "data": [[1, "1_rates", "2021-05-05", "Rates rose.", 0.25]]
        }))
        .unwrap();
        assert_eq!(rows[0].document.as_deref(), Some("Rates rose."));
    }

    #[test]
    fn null_measurements_load_as_nan() {
        let rows: Vec<SentimentRow> = decode_frame(json!([
            {"Topic": 1, "Name": "1_rates", "Timestamp": "2021-05-05", "sentiment_sigma_fsa": null},
            {"Topic": 1, "Name": "1_rates", "Timestamp": "2021-05-06", "sentiment_sigma_fsa": 0.5}
        ]))
        .unwrap();
        assert!(rows[0].sentiment.is_nan());
        assert_eq!(rows[1].sentiment, 0.5);
        assert!(serde_json::to_value(&rows[0]).unwrap()["sentiment_sigma_fsa"].is_null());

        let rows: Vec<TimeSeriesRow> = decode_frame(json!({
            "Topic": {"0": 0},
            "Words": {"0": "w"},
            "Name": {"0": "0_w"},
            "Timestamp": {"0": 1577836800000i64},
            "Frequency": {"0": null}
        }))
        .unwrap();
        assert!(rows[0].frequency.is_nan());
    }

    #[test]
    fn reports_bad_rows() {
        let err = decode_frame::<TimeSeriesRow>(json!([{"Topic": "x"}])).unwrap_err();
        assert!(err.starts_with("row 0"), "{err}");
    }

    #[test]
    fn loads_asset_directory() {
        let dir = tempfile::tempdir().unwrap();
        let row = json!({"Topic": 0, "Words": "w", "Name": "0_w", "Timestamp": "2020-01-01", "Frequency": 1});
        fs::write(
            dir.path().join(TOPICS_OVER_TIME_FILE),
            json!({"Section1": [row], "Section7": "[]", "Extra": []}).to_string(),
        )
        .unwrap();
        fs::write(dir.path().join(TOPICS_SENTIMENT_FILE), "{}").unwrap();

        let store = AssetStore::load(dir.path()).unwrap();

        assert_eq!(store.topics_over_time().get(Section::Section1).len(), 1);
        assert!(store.topics_over_time().get(Section::Section1A).is_empty());
        assert!(store.sentiment().get(Section::Section7).is_empty());
    }

    #[test]
    fn missing_asset_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AssetStore::load(dir.path()),
            Err(AssetError::Io { .. })
        ));
    }
}
