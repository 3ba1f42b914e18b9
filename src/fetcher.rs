//! Remote page retrieval for the enrichment pipeline.

use crate::normalizer::FetchedPage;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

const USER_AGENT: &str = concat!("filing-topics/", env!("CARGO_PKG_VERSION"));

/// Default upper bound on a fetched body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

/// Reasons a page could not be retrieved.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The request did not complete within the configured timeout.
    #[error("timed out fetching {url}")]
    Timeout {
        /// Requested URL.
        url: String,
    },
    /// DNS, connect, TLS or stream failure.
    #[error("failed to fetch {url}: {source}")]
    Transport {
        /// Requested URL.
        url: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },
    /// The server answered with a non-success status.
    #[error("{url} answered with HTTP {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// Response status code.
        status: u16,
    },
    /// The body exceeded the configured byte limit.
    #[error("{url} body exceeds {limit} bytes")]
    BodyTooLarge {
        /// Requested URL.
        url: String,
        /// Configured limit.
        limit: usize,
    },
}

impl FetchError {
    fn from_reqwest(url: &Url, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else {
            Self::Transport {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

/// Anything able to retrieve a page body for a URL.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetches `url`, failing on network errors, timeouts and non-success statuses.
    async fn fetch(&self, url: &Url) -> Result<FetchedPage, FetchError>;
}

/// Settings for [`HttpFetcher`].
#[derive(Debug, Clone, Copy)]
pub struct FetchSettings {
    /// Whole-request timeout, body included.
    pub timeout: Duration,
    /// Largest accepted body.
    pub max_body_bytes: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Reqwest-backed fetcher.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    max_body_bytes: usize,
}

impl HttpFetcher {
    /// Builds the underlying HTTP client.
    pub fn new(settings: FetchSettings) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(settings.timeout)
            .build()?;
        Ok(Self {
            client,
            max_body_bytes: settings.max_body_bytes,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedPage, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| FetchError::from_reqwest(url, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let final_url = response.url().clone();
        let headers = response.headers().clone();
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| FetchError::from_reqwest(url, err))?;
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(FetchError::BodyTooLarge {
                    url: url.to_string(),
                    limit: self.max_body_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        debug!(url = %url, bytes = body.len(), status = status.as_u16(), "page fetched");
        Ok(FetchedPage::new(final_url, headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn router() -> Router {
        Router::new()
            .route("/page", get(|| async { "<p>hello filings</p>" }))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route("/big", get(|| async { "x".repeat(4096) }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            )
    }

    fn fetcher(timeout: Duration, max_body_bytes: usize) -> HttpFetcher {
        HttpFetcher::new(FetchSettings {
            timeout,
            max_body_bytes,
        })
        .expect("client")
    }

    #[tokio::test]
    async fn fetches_success_bodies() {
        let base = serve(router()).await;
        let url = Url::parse(&format!("{base}/page")).unwrap();

        let page = fetcher(Duration::from_secs(5), 1024)
            .fetch(&url)
            .await
            .expect("fetch");

        assert_eq!(page.url, url);
        assert_eq!(page.body, b"<p>hello filings</p>");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let base = serve(router()).await;
        let url = Url::parse(&format!("{base}/missing")).unwrap();

        let err = fetcher(Duration::from_secs(5), 1024)
            .fetch(&url)
            .await
            .expect_err("404");
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected() {
        let base = serve(router()).await;
        let url = Url::parse(&format!("{base}/big")).unwrap();

        let err = fetcher(Duration::from_secs(5), 1024)
            .fetch(&url)
            .await
            .expect_err("too large");
        assert!(matches!(err, FetchError::BodyTooLarge { limit: 1024, .. }));
    }

    #[tokio::test]
    async fn slow_servers_time_out() {
        let base = serve(router()).await;
        let url = Url::parse(&format!("{base}/slow")).unwrap();

        let err = fetcher(Duration::from_millis(200), 1024)
            .fetch(&url)
            .await
            .expect_err("timeout");
        assert!(matches!(err, FetchError::Timeout { .. }), "got {err:?}");
    }
}
