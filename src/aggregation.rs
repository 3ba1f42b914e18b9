//! Resampling and top-N filtering over the in-memory asset tables.

use crate::assets::{AssetStore, SentimentRow, TimeSeriesRow};
use crate::classifier::{TopicId, OUTLIER_TOPIC};
use crate::resample::{InvalidFrequency, ResampleRule};
use crate::section::PerSection;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Failures while aggregating.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregationError {
    /// The resample rule was not recognized.
    #[error(transparent)]
    InvalidFrequency(#[from] InvalidFrequency),
    /// A bucket boundary fell outside the representable calendar.
    #[error("resampled timestamp out of range")]
    TimestampOutOfRange,
}

/// Mean and median sentiment of one topic over one bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedSentimentRow {
    /// Topic id.
    #[serde(rename = "Topic")]
    pub topic: TopicId,
    /// Topic name.
    #[serde(rename = "Name")]
    pub name: String,
    /// Bucket label.
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Mean sentiment.
    pub mean: f64,
    /// Median sentiment.
    pub median: f64,
}

/// Per-section sentiment payload: raw documents, or aggregated buckets when resampled.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SentimentRows {
    /// One row per document.
    Documents(Vec<SentimentRow>),
    /// One row per topic and bucket.
    Aggregated(Vec<AggregatedSentimentRow>),
}

impl SentimentRows {
    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            Self::Documents(rows) => rows.len(),
            Self::Aggregated(rows) => rows.len(),
        }
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parses an optional rule; blank strings count as absent.
pub fn parse_frequency(freq: Option<&str>) -> Result<Option<ResampleRule>, AggregationError> {
    match freq.map(str::trim).filter(|f| !f.is_empty()) {
        Some(raw) => Ok(Some(raw.parse()?)),
        None => Ok(None),
    }
}

/// Topic frequencies per section, optionally resampled and limited to the top `top_n` ids.
///
/// Resampling sums `Frequency` per `(Topic, Words, Name)` and bucket, emitting zero rows for
/// empty buckets inside a group's span. The top-N filter keeps ids in `[-1, top_n - 1]` and
/// runs after resampling.
pub fn topics_over_time(
    store: &AssetStore,
    freq: Option<&str>,
    top_n: Option<usize>,
) -> Result<PerSection<Vec<TimeSeriesRow>>, AggregationError> {
    let rule = parse_frequency(freq)?;
    PerSection::try_from_fn(|section| -> Result<Vec<TimeSeriesRow>, AggregationError> {
        let rows = store.topics_over_time().get(section);
        let mut rows = match &rule {
            Some(rule) => resample_frequencies(rows, rule)?,
            None => rows.clone(),
        };
        if let Some(top_n) = top_n {
            retain_top_topics(&mut rows, top_n);
        }
        Ok(rows)
    })
}

/// Sentiment per section: raw document rows, or per `(Topic, Name)` bucket mean and median.
pub fn topics_sentiment(
    store: &AssetStore,
    freq: Option<&str>,
) -> Result<PerSection<SentimentRows>, AggregationError> {
    let rule = parse_frequency(freq)?;
    PerSection::try_from_fn(|section| -> Result<SentimentRows, AggregationError> {
        let rows = store.sentiment().get(section);
        Ok(match &rule {
            Some(rule) => SentimentRows::Aggregated(aggregate_sentiment(rows, rule)?),
            None => SentimentRows::Documents(rows.clone()),
        })
    })
}

fn retain_top_topics(rows: &mut Vec<TimeSeriesRow>, top_n: usize) {
    let upper = TopicId::try_from(top_n).unwrap_or(TopicId::MAX);
    rows.retain(|row| row.topic >= OUTLIER_TOPIC && row.topic < upper);
}

fn resample_frequencies(
    rows: &[TimeSeriesRow],
    rule: &ResampleRule,
) -> Result<Vec<TimeSeriesRow>, AggregationError> {
    let mut groups: BTreeMap<(TopicId, &str, &str), Vec<(i64, f64)>> = BTreeMap::new();
    for row in rows {
        groups
            .entry((row.topic, row.words.as_str(), row.name.as_str()))
            .or_default()
            .push((rule.period_of(&row.timestamp), row.frequency));
    }

    let mut out = Vec::new();
    for ((topic, words, name), observations) in groups {
        let Some(anchor) = observations.iter().map(|(period, _)| *period).min() else {
            continue;
        };
        let mut sums: BTreeMap<i64, f64> = BTreeMap::new();
        for (period, frequency) in observations {
            let sum = sums.entry(rule.bucket_of(anchor, period)).or_insert(0.0);
            if !frequency.is_nan() {
                *sum += frequency;
            }
        }
        let last = sums.keys().next_back().copied().unwrap_or(0);
        for bucket in 0..=last {
            let timestamp = rule
                .bucket_label(anchor, bucket)
                .ok_or(AggregationError::TimestampOutOfRange)?;
            out.push(TimeSeriesRow {
                topic,
                words: words.to_string(),
                name: name.to_string(),
                timestamp,
                frequency: sums.get(&bucket).copied().unwrap_or(0.0),
            });
        }
    }
    Ok(out)
}

fn aggregate_sentiment(
    rows: &[SentimentRow],
    rule: &ResampleRule,
) -> Result<Vec<AggregatedSentimentRow>, AggregationError> {
    let mut groups: BTreeMap<(TopicId, &str), Vec<(i64, f64)>> = BTreeMap::new();
    for row in rows {
        groups
            .entry((row.topic, row.name.as_str()))
            .or_default()
            .push((rule.period_of(&row.timestamp), row.sentiment));
    }

    let mut out = Vec::new();
    for ((topic, name), observations) in groups {
        let Some(anchor) = observations.iter().map(|(period, _)| *period).min() else {
            continue;
        };
        let mut buckets: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
        for (period, value) in observations {
            if value.is_nan() {
                continue;
            }
            buckets
                .entry(rule.bucket_of(anchor, period))
                .or_default()
                .push(value);
        }
        for (bucket, mut values) in buckets {
            let timestamp = rule
                .bucket_label(anchor, bucket)
                .ok_or(AggregationError::TimestampOutOfRange)?;
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            out.push(AggregatedSentimentRow {
                topic,
                name: name.to_string(),
                timestamp,
                mean,
                median: median(&mut values),
            });
        }
    }
    Ok(out)
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::Section;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn time_row(topic: TopicId, at: DateTime<Utc>, frequency: f64) -> TimeSeriesRow {
        TimeSeriesRow {
            topic,
            words: format!("words {topic}"),
            name: format!("{topic}_name"),
            timestamp: at,
            frequency,
        }
    }

    fn sentiment_row(topic: TopicId, at: DateTime<Utc>, sentiment: f64) -> SentimentRow {
        SentimentRow {
            topic,
            name: format!("{topic}_name"),
            timestamp: at,
            document: None,
            sentiment,
        }
    }

    fn store_with(time: Vec<TimeSeriesRow>, sentiment: Vec<SentimentRow>) -> AssetStore {
        AssetStore::new(
            PerSection::from_fn(|_| time.clone()),
            PerSection::from_fn(|_| sentiment.clone()),
        )
    }

    #[test]
    fn no_parameters_return_raw_rows() {
        let rows = vec![time_row(3, ts(2020, 1, 1), 2.0), time_row(0, ts(2019, 1, 1), 1.0)];
        let store = store_with(rows.clone(), Vec::new());

        let result = topics_over_time(&store, None, None).unwrap();
        assert_eq!(result.get(Section::Section1A), &rows);

        let blank = topics_over_time(&store, Some("  "), None).unwrap();
        assert_eq!(blank.get(Section::Section7), &rows);
    }

    #[test]
    fn yearly_resample_sums_and_fills_gaps() {
        let rows = vec![
            time_row(0, ts(2018, 2, 1), 1.0),
            time_row(0, ts(2018, 9, 1), 2.0),
            time_row(0, ts(2020, 5, 1), 4.0),
            time_row(1, ts(2019, 1, 1), 7.0),
        ];
        let store = store_with(rows, Vec::new());

        let result = topics_over_time(&store, Some("1Y"), None).unwrap();
        let section = result.get(Section::Section1);
        let summary: Vec<(TopicId, String, f64)> = section
            .iter()
            .map(|r| (r.topic, r.timestamp.date_naive().to_string(), r.frequency))
            .collect();

        assert_eq!(
            summary,
            vec![
                (0, "2018-12-31".to_string(), 3.0),
                (0, "2019-12-31".to_string(), 0.0),
                (0, "2020-12-31".to_string(), 4.0),
                (1, "2019-12-31".to_string(), 7.0),
            ]
        );
    }

    #[test]
    fn missing_frequencies_do_not_poison_sums() {
        let rows = vec![
            time_row(2, ts(2020, 1, 1), 2.0),
            time_row(2, ts(2020, 2, 1), f64::NAN),
        ];
        let store = store_with(rows, Vec::new());

        let result = topics_over_time(&store, Some("1Y"), None).unwrap();
        let section = result.get(Section::Section1);
        assert_eq!(section.len(), 1);
        assert_eq!(section[0].frequency, 2.0);
    }

    #[test]
    fn top_n_keeps_outliers_and_lowest_ids() {
        let rows: Vec<_> = (-1..30).map(|t| time_row(t, ts(2020, 1, 1), 1.0)).collect();
        let store = store_with(rows, Vec::new());

        let result = topics_over_time(&store, None, Some(20)).unwrap();
        for (_, rows) in result.iter() {
            let ids: BTreeSet<TopicId> = rows.iter().map(|r| r.topic).collect();
            assert_eq!(ids.len(), 21);
            assert_eq!(ids.first(), Some(&-1));
            assert_eq!(ids.last(), Some(&19));
        }

        let outliers_only = topics_over_time(&store, None, Some(0)).unwrap();
        assert!(outliers_only
            .get(Section::Section1)
            .iter()
            .all(|r| r.topic == OUTLIER_TOPIC));
    }

    #[test]
    fn resample_runs_before_top_n() {
        let rows = vec![
            time_row(0, ts(2020, 1, 1), 1.0),
            time_row(0, ts(2020, 6, 1), 1.0),
            time_row(5, ts(2020, 1, 1), 9.0),
        ];
        let store = store_with(rows, Vec::new());

        let result = topics_over_time(&store, Some("1Y"), Some(1)).unwrap();
        let section = result.get(Section::Section1);
        assert_eq!(section.len(), 1);
        assert_eq!(section[0].frequency, 2.0);
    }

    #[test]
    fn invalid_rule_is_reported() {
        let store = store_with(Vec::new(), Vec::new());
        assert!(matches!(
            topics_over_time(&store, Some("fortnightly"), None),
            Err(AggregationError::InvalidFrequency(_))
        ));
        assert!(matches!(
            topics_sentiment(&store, Some("9Z")),
            Err(AggregationError::InvalidFrequency(_))
        ));
    }

    #[test]
    fn quarterly_sentiment_has_mean_and_median() {
        let rows = vec![
            sentiment_row(2, ts(2021, 1, 10), 0.1),
            sentiment_row(2, ts(2021, 2, 10), 0.2),
            sentiment_row(2, ts(2021, 3, 10), 0.9),
            sentiment_row(2, ts(2021, 11, 10), -0.5),
            sentiment_row(2, ts(2021, 12, 10), f64::NAN),
        ];
        let store = store_with(Vec::new(), rows);

        let result = topics_sentiment(&store, Some("3M")).unwrap();
        let SentimentRows::Aggregated(buckets) = result.get(Section::Section7) else {
            panic!("expected aggregated rows");
        };

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].timestamp.date_naive().to_string(), "2021-03-31");
        assert!((buckets[0].mean - 0.4).abs() < 1e-9);
        assert!((buckets[0].median - 0.2).abs() < 1e-9);
        assert_eq!(buckets[1].timestamp.date_naive().to_string(), "2021-12-31");
        assert_eq!(buckets[1].median, -0.5);
    }

    #[test]
    fn sentiment_without_rule_returns_documents() {
        let rows = vec![sentiment_row(0, ts(2021, 1, 1), 0.3)];
        let store = store_with(Vec::new(), rows.clone());

        let result = topics_sentiment(&store, None).unwrap();
        assert_eq!(result.get(Section::Section1), &SentimentRows::Documents(rows));
    }

    #[test]
    fn median_of_even_count_averages_middle_values() {
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
    }
}
