//! URL enrichment: cache check, fetch, chunk, classify per section, persist once.

use crate::cache::{CacheError, CacheRecord, InsertOutcome, UrlCache};
use crate::classifier::{ClassifierError, SectionClassifier};
use crate::fetcher::{FetchError, PageFetcher};
use crate::normalizer::{NormalizationError, Normalizer};
use crate::section::{PerSection, Section};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, info};
use url::Url;

/// Failures of [`Enricher::enrich`]. None of them leave a cache record behind.
#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    /// The input is not an absolute http(s) URL.
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl {
        /// Trimmed input.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The page could not be retrieved.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// The page held no classifiable text.
    #[error("no classifiable text: {0}")]
    EmptyContent(#[from] NormalizationError),
    /// A section model failed.
    #[error(transparent)]
    Classification(#[from] ClassifierError),
    /// The cache store failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// A blocking worker panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Worker(#[from] JoinError),
    /// The inference pool was shut down.
    #[error("inference pool closed")]
    PoolClosed,
}

/// Where an enrichment's labels came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelSource {
    /// Read back from the URL cache.
    Cache,
    /// Freshly fetched and classified.
    Computed,
}

/// Labels for one URL, shaped per `keep_all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrichment {
    /// Cache key the labels are stored under.
    pub url: String,
    /// Labels per section.
    pub labels: PerSection<Vec<String>>,
    /// Cache hit or fresh computation.
    pub source: LabelSource,
}

/// Runs the enrichment pipeline against shared collaborators.
#[derive(Clone)]
pub struct Enricher {
    cache: Arc<UrlCache>,
    fetcher: Arc<dyn PageFetcher>,
    normalizer: Normalizer,
    classifiers: Arc<PerSection<SectionClassifier>>,
    permits: Arc<Semaphore>,
}

impl Enricher {
    /// Wires the pipeline; `inference_workers` bounds concurrent model runs (minimum 1).
    pub fn new(
        cache: Arc<UrlCache>,
        fetcher: Arc<dyn PageFetcher>,
        normalizer: Normalizer,
        classifiers: PerSection<SectionClassifier>,
        inference_workers: usize,
    ) -> Self {
        Self {
            cache,
            fetcher,
            normalizer,
            classifiers: Arc::new(classifiers),
            permits: Arc::new(Semaphore::new(inference_workers.max(1))),
        }
    }

    /// Shared cache handle.
    pub fn cache(&self) -> &Arc<UrlCache> {
        &self.cache
    }

    /// Labels for `raw_url`, from the cache when present, otherwise computed and stored.
    ///
    /// The cache always holds the full per-chunk sequence; `keep_all = false` deduplicates
    /// on the way out keeping first occurrences, so hits and misses shape labels the same way.
    pub async fn enrich(&self, raw_url: &str, keep_all: bool) -> Result<Enrichment, EnrichError> {
        let (key, url) = resolve_target(raw_url)?;

        if let Some(record) = self.lookup(&key).await? {
            debug!(url = %key, "url cache hit");
            return Ok(Enrichment {
                url: key,
                labels: shape_labels(record.split_labels(), keep_all),
                source: LabelSource::Cache,
            });
        }

        let start = Instant::now();
        let page = self.fetcher.fetch(&url).await?;
        let normalizer = self.normalizer.clone();
        let chunks = tokio::task::spawn_blocking(move || normalizer.chunk_page(&page)).await??;
        let documents: Arc<Vec<String>> = Arc::new(chunks.into_iter().map(|c| c.text).collect());

        let (business, risk, mdna) = tokio::try_join!(
            self.classify_section(Section::Section1, Arc::clone(&documents)),
            self.classify_section(Section::Section1A, Arc::clone(&documents)),
            self.classify_section(Section::Section7, Arc::clone(&documents)),
        )?;
        let labels = PerSection::from_array([business, risk, mdna]);

        let record = CacheRecord::from_labels(key.clone(), &labels);
        match self.store(record).await? {
            InsertOutcome::Inserted => {}
            InsertOutcome::AlreadyExists => {
                debug!(url = %key, "url cached concurrently; keeping existing record")
            }
        }

        info!(
            url = %key,
            chunks = documents.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "enriched url"
        );
        Ok(Enrichment {
            url: key,
            labels: shape_labels(labels, keep_all),
            source: LabelSource::Computed,
        })
    }

    async fn lookup(&self, key: &str) -> Result<Option<CacheRecord>, EnrichError> {
        let cache = Arc::clone(&self.cache);
        let key = key.to_string();
        Ok(tokio::task::spawn_blocking(move || cache.lookup(&key)).await??)
    }

    async fn store(&self, record: CacheRecord) -> Result<InsertOutcome, EnrichError> {
        let cache = Arc::clone(&self.cache);
        Ok(tokio::task::spawn_blocking(move || cache.insert(&record)).await??)
    }

    async fn classify_section(
        &self,
        section: Section,
        documents: Arc<Vec<String>>,
    ) -> Result<Vec<String>, EnrichError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EnrichError::PoolClosed)?;
        let classifier = self.classifiers.get(section).clone();
        Ok(tokio::task::spawn_blocking(move || classifier.classify_labels(&documents)).await??)
    }
}

/// Trims `raw` and parses it, retrying once percent-decoded for clients that quote the
/// whole URL. Returns the cache key with the parsed URL.
fn resolve_target(raw: &str) -> Result<(String, Url), EnrichError> {
    let trimmed = raw.trim();
    let err = match parse_target(trimmed) {
        Ok(url) => return Ok((trimmed.to_string(), url)),
        Err(err) => err,
    };
    match percent_decode_str(trimmed).decode_utf8() {
        Ok(decoded) if decoded.trim() != trimmed => {
            let decoded = decoded.trim().to_string();
            let url = parse_target(&decoded).map_err(|_| err)?;
            Ok((decoded, url))
        }
        _ => Err(err),
    }
}

fn parse_target(key: &str) -> Result<Url, EnrichError> {
    let invalid = |reason: String| EnrichError::InvalidUrl {
        url: key.to_string(),
        reason,
    };
    if key.is_empty() {
        return Err(invalid("url must not be empty".to_string()));
    }
    let url = Url::parse(key).map_err(|err| invalid(err.to_string()))?;
    match url.scheme() {
        "http" | "https" if url.host().is_some() => Ok(url),
        "http" | "https" => Err(invalid("missing host".to_string())),
        other => Err(invalid(format!("unsupported scheme `{other}`"))),
    }
}

/// Deduplicates each section keeping first occurrences, unless `keep_all`.
pub fn shape_labels(labels: PerSection<Vec<String>>, keep_all: bool) -> PerSection<Vec<String>> {
    if keep_all {
        return labels;
    }
    labels.map(|_, sequence| {
        let mut seen = HashSet::new();
        sequence
            .into_iter()
            .filter(|label| seen.insert(label.clone()))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{LabelTable, TopicClassifier, TopicId};
    use crate::normalizer::{FetchedPage, NormalizationConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        body: String,
        calls: AtomicUsize,
    }

    impl CountingFetcher {
        fn new(body: &str) -> Self {
            Self {
                body: body.to_string(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PageFetcher for CountingFetcher {
        async fn fetch(&self, url: &Url) -> Result<FetchedPage, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(FetchedPage::html(url.clone(), self.body.clone()))
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl PageFetcher for FailingFetcher {
        async fn fetch(&self, url: &Url) -> Result<FetchedPage, FetchError> {
            Err(FetchError::Status {
                url: url.to_string(),
                status: 503,
            })
        }
    }

    /// Topic 0 for chunks mentioning revenue, 1 for risk, 7 (unknown) for anything else.
    struct WordClassifier;

    impl TopicClassifier for WordClassifier {
        fn classify(&self, documents: &[String]) -> Result<Vec<TopicId>, ClassifierError> {
            Ok(documents
                .iter()
                .map(|doc| {
                    if doc.contains("revenue") {
                        0
                    } else if doc.contains("risk") {
                        1
                    } else {
                        7
                    }
                })
                .collect())
        }
    }

    const PAGE: &str = "<html><body><article>\
        <p>revenue</p><p>risk</p><p>revenue</p><p>weather</p>\
        </article></body></html>";

    /// Returns no ids at all, like a model with nothing to say about the page.
    struct SilentClassifier;

    impl TopicClassifier for SilentClassifier {
        fn classify(&self, _documents: &[String]) -> Result<Vec<TopicId>, ClassifierError> {
            Ok(Vec::new())
        }
    }

    fn word_labels() -> LabelTable {
        LabelTable::from_pairs([(0, "growth"), (1, "exposure"), (-1, "outlier")])
    }

    fn enricher(fetcher: Arc<dyn PageFetcher>) -> Enricher {
        enricher_with(fetcher, |_| -> Arc<dyn TopicClassifier> { Arc::new(WordClassifier) })
    }

    fn enricher_with(
        fetcher: Arc<dyn PageFetcher>,
        model_for: impl Fn(Section) -> Arc<dyn TopicClassifier>,
    ) -> Enricher {
        let classifiers = PerSection::from_fn(|section| {
            SectionClassifier::new(section, model_for(section), word_labels())
        });
        let normalizer = Normalizer::new(NormalizationConfig {
            chunk_target_tokens: 1,
            ..NormalizationConfig::default()
        });
        Enricher::new(
            Arc::new(UrlCache::open_in_memory().unwrap()),
            fetcher,
            normalizer,
            classifiers,
            2,
        )
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let fetcher = Arc::new(CountingFetcher::new(PAGE));
        let enricher = enricher(fetcher.clone());

        let first = enricher.enrich("https://example.com/10k", false).await.unwrap();
        let second = enricher.enrich(" https://example.com/10k ", false).await.unwrap();

        assert_eq!(first.source, LabelSource::Computed);
        assert_eq!(second.source, LabelSource::Cache);
        assert_eq!(first.labels, second.labels);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(enricher.cache().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn quoted_urls_are_decoded_into_the_cache_key() {
        let fetcher = Arc::new(CountingFetcher::new(PAGE));
        let enricher = enricher(fetcher.clone());

        let quoted = enricher
            .enrich("https%3A//www.federalreserve.gov", false)
            .await
            .unwrap();
        let plain = enricher
            .enrich("https://www.federalreserve.gov", false)
            .await
            .unwrap();

        assert_eq!(quoted.url, "https://www.federalreserve.gov");
        assert_eq!(quoted.source, LabelSource::Computed);
        assert_eq!(plain.source, LabelSource::Cache);
        assert!(enricher
            .cache()
            .lookup("https://www.federalreserve.gov")
            .unwrap()
            .is_some());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_model_output_stays_empty_across_cache_hits() {
        let enricher = enricher_with(Arc::new(CountingFetcher::new(PAGE)), |section| -> Arc<dyn TopicClassifier> {
            if section == Section::Section1A {
                Arc::new(SilentClassifier)
            } else {
                Arc::new(WordClassifier)
            }
        });

        for keep_all in [true, false] {
            let first = enricher.enrich("https://example.com/quiet", keep_all).await.unwrap();
            assert!(first.labels.get(Section::Section1A).is_empty());
            assert!(!first.labels.get(Section::Section1).is_empty());
            assert!(!first.labels.get(Section::Section7).is_empty());
        }
        let cached = enricher.enrich("https://example.com/quiet", true).await.unwrap();
        assert_eq!(cached.source, LabelSource::Cache);
        assert!(cached.labels.get(Section::Section1A).is_empty());
        assert_eq!(
            cached.labels.get(Section::Section7),
            &["growth", "exposure", "growth", "unclassified"]
        );
    }

    #[tokio::test]
    async fn keep_all_returns_one_label_per_chunk() {
        let enricher = enricher(Arc::new(CountingFetcher::new(PAGE)));

        let all = enricher.enrich("https://example.com/a", true).await.unwrap();
        let unique = enricher.enrich("https://example.com/a", false).await.unwrap();

        for section in Section::ALL {
            let all = all.labels.get(section);
            let unique = unique.labels.get(section);
            assert_eq!(all.len(), 4);
            assert_eq!(all, &["growth", "exposure", "growth", "unclassified"]);
            assert_eq!(unique, &["growth", "exposure", "unclassified"]);
            let as_set: HashSet<_> = all.iter().collect();
            assert_eq!(as_set.len(), unique.len());
        }
    }

    #[tokio::test]
    async fn concurrent_enrichment_writes_one_record() {
        let enricher = enricher(Arc::new(CountingFetcher::new(PAGE)));

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let enricher = enricher.clone();
                tokio::spawn(async move { enricher.enrich("https://race.test/doc", true).await })
            })
            .collect();
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap().unwrap());
        }

        assert_eq!(enricher.cache().len().unwrap(), 1);
        assert!(results.windows(2).all(|w| w[0].labels == w[1].labels));
    }

    #[tokio::test]
    async fn rejects_malformed_urls_without_io() {
        let fetcher = Arc::new(CountingFetcher::new(PAGE));
        let enricher = enricher(fetcher.clone());

        for raw in ["", "   ", "not a url", "ftp://example.com/file", "mailto:a@b.c"] {
            let err = enricher.enrich(raw, false).await.unwrap_err();
            assert!(matches!(err, EnrichError::InvalidUrl { .. }), "{raw}: {err}");
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert!(enricher.cache().is_empty().unwrap());
    }

    #[tokio::test]
    async fn failures_leave_cache_untouched() {
        let failing = enricher(Arc::new(FailingFetcher));
        let err = failing.enrich("https://down.test", false).await.unwrap_err();
        assert!(matches!(err, EnrichError::Fetch(_)));
        assert!(failing.cache().is_empty().unwrap());

        let blank = enricher(Arc::new(CountingFetcher::new("<html><body></body></html>")));
        let err = blank.enrich("https://blank.test", false).await.unwrap_err();
        assert!(matches!(err, EnrichError::EmptyContent(_)));
        assert!(blank.cache().is_empty().unwrap());
    }

    #[test]
    fn shaping_keeps_first_occurrence_order() {
        let labels = PerSection::from_fn(|_| {
            ["b", "a", "b", "c", "a"].iter().map(|s| s.to_string()).collect()
        });
        let shaped = shape_labels(labels, false);
        assert_eq!(shaped.get(Section::Section7), &["b", "a", "c"]);
    }
}
