//! Source client: a single-attempt probe against the numbered-posting API.
//!
//! Retry and backoff live in the scheduler, not here. The client's one job
//! is to perform a fetch and classify the result three ways: `Found` with a
//! parsed payload, `NotFound` (the definitive absence signal), or
//! `Transient` for anything that should be retried on a later run.

use std::time::Duration;

use anyhow::Context;
use apc_core::{FetchOutcome, PostingRef, SourceDocument, TransientError};
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "apc-source";

pub const DEFAULT_API_BASE: &str = "https://purchasing.alberta.ca/api/opportunity/public";

/// One fetch per call. Implementations must not retry internally.
#[async_trait]
pub trait SourceClient: Send + Sync {
    async fn fetch(&self, key: PostingRef) -> FetchOutcome;
}

#[derive(Debug, Clone)]
pub struct SourceClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for SourceClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: "apc-watch/0.1".to_string(),
        }
    }
}

/// Explicitly constructed HTTP client with its own lifetime; no ambient
/// global session.
#[derive(Debug)]
pub struct HttpSourceClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSourceClient {
    pub fn new(config: SourceClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, key: PostingRef) -> String {
        format!("{}/{}/{}", self.base_url, key.year, key.number)
    }
}

/// Map a non-success HTTP status to an outcome. Only 404 is treated as a
/// definitive absence; everything else is retried on a later run.
pub fn classify_status(status: StatusCode) -> FetchOutcome {
    if status == StatusCode::NOT_FOUND {
        FetchOutcome::NotFound
    } else {
        FetchOutcome::Transient(TransientError {
            http_status: Some(status.as_u16()),
            detail: status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string(),
        })
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn fetch(&self, key: PostingRef) -> FetchOutcome {
        let url = self.url_for(key);
        let span = info_span!("source_fetch", reference = %key, url = %url);

        async {
            let response = match self.client.get(&url).send().await {
                Ok(response) => response,
                Err(err) => {
                    warn!(reference = %key, error = %err, "request failed");
                    return FetchOutcome::Transient(TransientError {
                        http_status: None,
                        detail: err.to_string(),
                    });
                }
            };

            let status = response.status();
            if !status.is_success() {
                return classify_status(status);
            }

            match response.json::<SourceDocument>().await {
                Ok(document) => FetchOutcome::Found(document),
                Err(err) => {
                    // A 200 with an unreadable body is not an absence signal.
                    warn!(reference = %key, error = %err, "payload parse failed");
                    FetchOutcome::Transient(TransientError {
                        http_status: Some(status.as_u16()),
                        detail: format!("payload parse failed: {err}"),
                    })
                }
            }
        }
        .instrument(span)
        .await
    }
}
