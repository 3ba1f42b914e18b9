//! Server configuration: CLI flags with environment fallbacks and deployment defaults.

use crate::fetcher::{FetchSettings, DEFAULT_MAX_BODY_BYTES};
use crate::normalizer::NormalizationConfig;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Where the service runs; selects default data locations.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum Deployment {
    /// Paths relative to the repository checkout.
    #[default]
    Local,
    /// Paths inside the container image.
    Docker,
}

impl Deployment {
    fn default_paths(self) -> DataPaths {
        match self {
            Deployment::Local => DataPaths {
                model_path: PathBuf::from("api/models"),
                assets_path: PathBuf::from("api/assets"),
                db_path: PathBuf::from("api/db/topics-url-db.db"),
            },
            Deployment::Docker => DataPaths {
                model_path: PathBuf::from("/app/models"),
                assets_path: PathBuf::from("/app/assets"),
                db_path: PathBuf::from("/app/db/data_docker.db"),
            },
        }
    }
}

/// Locations of the model artifacts, asset tables and URL cache database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPaths {
    /// Directory holding one topic model per section.
    pub model_path: PathBuf,
    /// Directory holding the pre-computed asset tables.
    pub assets_path: PathBuf,
    /// SQLite file for the URL cache.
    pub db_path: PathBuf,
}

/// Resolved settings used to build the application context.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Address the HTTP server binds.
    pub bind: SocketAddr,
    /// Data locations.
    pub paths: DataPaths,
    /// Page fetch limits.
    pub fetch: FetchSettings,
    /// Chunking parameters.
    pub normalization: NormalizationConfig,
    /// Concurrent inference runs allowed.
    pub inference_workers: usize,
}

/// Command-line interface of the API server.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "filing-topics-api",
    about = "HTTP API serving 10-K topic trends and URL topic enrichment"
)]
pub struct Cli {
    /// Address to bind the HTTP server to (host:port)
    #[arg(long, env = "FILING_TOPICS_BIND", default_value = "127.0.0.1:8000")]
    pub bind: String,

    /// Deployment profile selecting default data paths
    #[arg(
        long,
        env = "FILING_TOPICS_DEPLOYMENT",
        value_enum,
        default_value_t = Deployment::Local
    )]
    pub deployment: Deployment,

    /// Directory with topics_overtime.json and topics_and_docs_sentiment.json
    #[arg(long, env = "FILING_TOPICS_ASSETS_PATH")]
    pub assets_path: Option<PathBuf>,

    /// Directory with Section1.json, Section1A.json and Section7.json topic models
    #[arg(long, env = "FILING_TOPICS_MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// SQLite database file for the URL cache
    #[arg(long, env = "FILING_TOPICS_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Seconds before a page fetch times out
    #[arg(long, env = "FILING_TOPICS_FETCH_TIMEOUT_SECS", default_value_t = 20)]
    pub fetch_timeout_secs: u64,

    /// Largest page body accepted, in bytes
    #[arg(long, env = "FILING_TOPICS_MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// Whitespace tokens per classified chunk
    #[arg(long, env = "FILING_TOPICS_CHUNK_TOKENS", default_value_t = 256)]
    pub chunk_target_tokens: usize,

    /// Concurrent inference runs
    #[arg(long, env = "FILING_TOPICS_INFERENCE_WORKERS", default_value_t = 4)]
    pub inference_workers: usize,

    /// Emit logs as JSON lines
    #[arg(long, env = "FILING_TOPICS_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Cli {
    /// Data locations, explicit flags overriding the deployment defaults.
    pub fn data_paths(&self) -> DataPaths {
        let defaults = self.deployment.default_paths();
        DataPaths {
            model_path: self.model_path.clone().unwrap_or(defaults.model_path),
            assets_path: self.assets_path.clone().unwrap_or(defaults.assets_path),
            db_path: self.db_path.clone().unwrap_or(defaults.db_path),
        }
    }

    /// Converts the parsed CLI into an [`AppConfig`].
    pub fn build_config(&self) -> anyhow::Result<AppConfig> {
        let bind: SocketAddr = self
            .bind
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid bind address {}: {err}", self.bind))?;
        Ok(AppConfig {
            bind,
            paths: self.data_paths(),
            fetch: FetchSettings {
                timeout: Duration::from_secs(self.fetch_timeout_secs.max(1)),
                max_body_bytes: self.max_body_bytes.max(1),
            },
            normalization: NormalizationConfig {
                chunk_target_tokens: self.chunk_target_tokens.max(1),
                ..NormalizationConfig::default()
            },
            inference_workers: self.inference_workers.max(1),
        })
    }
}
