//! HTTP surface: the application context, typed responses and axum handlers.

use crate::aggregation::{self, AggregationError, SentimentRows};
use crate::assets::{AssetStore, TimeSeriesRow};
use crate::cache::UrlCache;
use crate::classifier::load_section_classifiers;
use crate::config::AppConfig;
use crate::fetcher::HttpFetcher;
use crate::normalizer::Normalizer;
use crate::pipeline::{EnrichError, Enricher, LabelSource};
use crate::section::{PerSection, Section};
use anyhow::Context;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Startup state shared by every handler.
#[derive(Clone)]
pub struct AppContext {
    assets: Arc<AssetStore>,
    enricher: Arc<Enricher>,
}

impl AppContext {
    /// Wraps already-built collaborators.
    pub fn new(assets: AssetStore, enricher: Enricher) -> Self {
        Self {
            assets: Arc::new(assets),
            enricher: Arc::new(enricher),
        }
    }

    /// Loads assets, topic models and the cache database described by `config`.
    pub fn load(config: &AppConfig) -> anyhow::Result<Self> {
        let paths = &config.paths;
        let assets = AssetStore::load(&paths.assets_path)
            .with_context(|| format!("failed to load assets from {}", paths.assets_path.display()))?;
        let classifiers = load_section_classifiers(&paths.model_path).with_context(|| {
            format!("failed to load topic models from {}", paths.model_path.display())
        })?;
        let cache = UrlCache::open(&paths.db_path)
            .with_context(|| format!("failed to open url cache {}", paths.db_path.display()))?;
        let fetcher = HttpFetcher::new(config.fetch).context("failed to build http client")?;
        let enricher = Enricher::new(
            Arc::new(cache),
            Arc::new(fetcher),
            Normalizer::new(config.normalization),
            classifiers,
            config.inference_workers,
        );
        info!(
            assets = %paths.assets_path.display(),
            models = %paths.model_path.display(),
            db = %paths.db_path.display(),
            "application context ready"
        );
        Ok(Self::new(assets, enricher))
    }

    /// In-memory asset tables.
    pub fn assets(&self) -> &AssetStore {
        &self.assets
    }

    /// Enrichment pipeline.
    pub fn enricher(&self) -> &Enricher {
        &self.enricher
    }
}

/// Builds the router with every endpoint.
pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/", get(info_handler))
        .route("/get_topics_time", get(topics_time_handler))
        .route("/get_topics_sentiment", get(topics_sentiment_handler))
        .route(
            "/get_topics_url",
            get(topics_url_handler).post(topics_url_post_handler),
        )
        .with_state(ctx)
}

/// Error payload returned with every non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable failure description.
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

/// One entry of the root listing.
#[derive(Debug, Serialize)]
pub struct SectionInfo {
    /// Section key.
    pub name: &'static str,
    /// What the section covers.
    pub description: &'static str,
}

/// Body of `GET /`.
#[derive(Debug, Serialize)]
pub struct InfoResponse {
    /// Greeting.
    pub message: &'static str,
    /// Sections served by the topic endpoints.
    pub sections: Vec<SectionInfo>,
}

/// Query of `GET /get_topics_time`.
#[derive(Debug, Default, Deserialize)]
pub struct TopicsTimeParams {
    /// Resample rule such as `1Y`.
    pub freq: Option<String>,
    /// Keep outliers plus this many top topics.
    pub top_n: Option<usize>,
}

/// Body of `GET /get_topics_time`.
#[derive(Debug, Serialize)]
pub struct TopicsTimeResponse {
    /// Rows keyed by section name.
    #[serde(flatten)]
    pub sections: PerSection<Vec<TimeSeriesRow>>,
    /// Echo of the applied rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
    /// Echo of the applied filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_n: Option<usize>,
}

/// Query of `GET /get_topics_sentiment`.
#[derive(Debug, Default, Deserialize)]
pub struct TopicsSentimentParams {
    /// Resample rule such as `3M`.
    pub freq: Option<String>,
}

/// Body of `GET /get_topics_sentiment`.
#[derive(Debug, Serialize)]
pub struct TopicsSentimentResponse {
    /// Rows keyed by section name.
    #[serde(flatten)]
    pub sections: PerSection<SentimentRows>,
    /// Echo of the applied rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
}

/// Query or JSON body of `/get_topics_url`.
#[derive(Debug, Default, Deserialize)]
pub struct TopicsUrlRequest {
    /// Page to classify.
    pub url: Option<String>,
    /// Return every per-chunk label instead of unique ones.
    #[serde(default)]
    pub keep_all: bool,
}

/// Body of `/get_topics_url`.
#[derive(Debug, Serialize)]
pub struct TopicsUrlResponse {
    /// Cache key the labels are stored under.
    pub url: String,
    /// Whether the labels came from the cache.
    pub cached: bool,
    /// Labels keyed by section name.
    #[serde(flatten)]
    pub sections: PerSection<Vec<String>>,
}

/// `GET /`: service banner and the section list.
pub async fn info_handler() -> Json<InfoResponse> {
    Json(InfoResponse {
        message: "10-K topic modelling API",
        sections: Section::ALL
            .iter()
            .map(|section| SectionInfo {
                name: section.name(),
                description: section.description(),
            })
            .collect(),
    })
}

/// `GET /get_topics_time`.
pub async fn topics_time_handler(
    State(ctx): State<AppContext>,
    params: Result<Query<TopicsTimeParams>, QueryRejection>,
) -> Result<Json<TopicsTimeResponse>, ApiError> {
    let Query(params) = params.map_err(query_rejection)?;
    let frequency = non_blank(params.freq);
    let top_n = params.top_n;
    let assets = Arc::clone(&ctx.assets);
    let freq = frequency.clone();
    let sections = tokio::task::spawn_blocking(move || {
        aggregation::topics_over_time(&assets, freq.as_deref(), top_n)
    })
    .await
    .map_err(|err| internal_error(format!("aggregation task failed: {err}")))?
    .map_err(aggregation_error)?;
    Ok(Json(TopicsTimeResponse {
        sections,
        frequency,
        top_n,
    }))
}

/// `GET /get_topics_sentiment`.
pub async fn topics_sentiment_handler(
    State(ctx): State<AppContext>,
    params: Result<Query<TopicsSentimentParams>, QueryRejection>,
) -> Result<Json<TopicsSentimentResponse>, ApiError> {
    let Query(params) = params.map_err(query_rejection)?;
    let frequency = non_blank(params.freq);
    let assets = Arc::clone(&ctx.assets);
    let freq = frequency.clone();
    let sections = tokio::task::spawn_blocking(move || {
        aggregation::topics_sentiment(&assets, freq.as_deref())
    })
    .await
    .map_err(|err| internal_error(format!("aggregation task failed: {err}")))?
    .map_err(aggregation_error)?;
    Ok(Json(TopicsSentimentResponse {
        sections,
        frequency,
    }))
}

/// `GET /get_topics_url?url=...&keep_all=...`.
pub async fn topics_url_handler(
    State(ctx): State<AppContext>,
    request: Result<Query<TopicsUrlRequest>, QueryRejection>,
) -> Result<Json<TopicsUrlResponse>, ApiError> {
    let Query(request) = request.map_err(query_rejection)?;
    enrich_url(&ctx, request).await
}

/// `POST /get_topics_url` with a JSON body.
pub async fn topics_url_post_handler(
    State(ctx): State<AppContext>,
    request: Result<Json<TopicsUrlRequest>, JsonRejection>,
) -> Result<Json<TopicsUrlResponse>, ApiError> {
    let Json(request) = request.map_err(|rejection| {
        error_response(rejection.status(), rejection.body_text())
    })?;
    enrich_url(&ctx, request).await
}

async fn enrich_url(
    ctx: &AppContext,
    request: TopicsUrlRequest,
) -> Result<Json<TopicsUrlResponse>, ApiError> {
    let Some(raw) = request.url else {
        return Err(bad_request("url is required"));
    };
    let enrichment = ctx
        .enricher
        .enrich(&raw, request.keep_all)
        .await
        .map_err(enrich_error)?;
    Ok(Json(TopicsUrlResponse {
        url: enrichment.url,
        cached: enrichment.source == LabelSource::Cache,
        sections: enrichment.labels,
    }))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn query_rejection(rejection: QueryRejection) -> ApiError {
    bad_request(rejection.body_text())
}

fn aggregation_error(err: AggregationError) -> ApiError {
    match err {
        AggregationError::InvalidFrequency(_) => bad_request(err.to_string()),
        AggregationError::TimestampOutOfRange => internal_error(err.to_string()),
    }
}

fn enrich_error(err: EnrichError) -> ApiError {
    let status = match &err {
        EnrichError::InvalidUrl { .. } => StatusCode::BAD_REQUEST,
        EnrichError::Fetch(_) => StatusCode::BAD_GATEWAY,
        EnrichError::EmptyContent(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EnrichError::Classification(_)
        | EnrichError::Cache(_)
        | EnrichError::Worker(_)
        | EnrichError::PoolClosed => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %err, status = status.as_u16(), "url enrichment failed");
    }
    error_response(status, err.to_string())
}

fn bad_request(message: impl Into<String>) -> ApiError {
    error_response(StatusCode::BAD_REQUEST, message)
}

fn internal_error(message: impl Into<String>) -> ApiError {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}
