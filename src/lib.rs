#![warn(missing_docs)]
//! Core library for the 10-K filing topic service: asset aggregation and URL enrichment.

pub mod aggregation;
pub mod api;
pub mod assets;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod fetcher;
pub mod normalizer;
pub mod pipeline;
pub mod resample;
pub mod section;

pub use aggregation::{AggregatedSentimentRow, AggregationError, SentimentRows};
pub use api::{router, AppContext};
pub use assets::{AssetError, AssetStore, SentimentRow, TimeSeriesRow};
pub use cache::{CacheError, CacheRecord, InsertOutcome, UrlCache};
pub use classifier::{
    load_section_classifiers, ClassifierError, KeywordTopicModel, LabelTable, SectionClassifier,
    TopicClassifier, TopicId, OUTLIER_TOPIC, UNCLASSIFIED_LABEL,
};
pub use config::{AppConfig, Cli, DataPaths, Deployment};
pub use fetcher::{FetchError, FetchSettings, HttpFetcher, PageFetcher};
pub use normalizer::{
    BlockKind, DocumentChunk, FetchedPage, NormalizationConfig, NormalizationError, Normalizer,
    TextBlock,
};
pub use pipeline::{EnrichError, Enricher, Enrichment, LabelSource};
pub use resample::{FrequencyUnit, InvalidFrequency, ResampleRule};
pub use section::{PerSection, Section};
