//! Retrying HTTP fetch for net-table pages.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "netatlas-fetch";

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Linear retry schedule: the wait after attempt `n` (1-based) is
/// `initial_wait * n`. `max_attempts` bounds the total number of requests,
/// not the number of re-requests.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_wait: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        self.initial_wait.saturating_mul(attempt.min(u32::MAX as usize) as u32)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Unparsed content of one HTTP response. Never mutated after construction.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

/// Why the final attempt of a fetch failed.
#[derive(Debug, Error)]
pub enum FailureReason {
    #[error(transparent)]
    Request(reqwest::Error),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("expected page marker not found")]
    MarkerMissing,
}

/// Terminal fetch failure, reported only after every attempt is exhausted.
/// Never raised past this boundary as a panic; the driver decides how to
/// record it.
#[derive(Debug, Error)]
#[error("fetch failed after {attempts} attempts: {reason}")]
pub struct FetchError {
    pub reason: FailureReason,
    pub attempts: usize,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    /// Fetch a page, retrying every failure: transport errors, non-2xx
    /// statuses, and 200 responses the caller rejects via `accept` (the
    /// page was served but lacks the element the caller requires).
    ///
    /// No caching and no rate limiting happen here; spacing between calls
    /// is the driver's responsibility.
    pub async fn fetch_with_check<F>(&self, url: &str, accept: F) -> Result<RawPage, FetchError>
    where
        F: Fn(&RawPage) -> bool,
    {
        let span = info_span!("http_fetch", url);
        async {
            let mut last_reason = FailureReason::MarkerMissing;

            for attempt in 1..=self.retry.max_attempts.max(1) {
                match self.attempt(url, &accept).await {
                    Ok(page) => return Ok(page),
                    Err(reason) => {
                        let wait = self.retry.delay_for_attempt(attempt);
                        warn!(
                            attempt,
                            max_attempts = self.retry.max_attempts,
                            wait_ms = wait.as_millis() as u64,
                            %reason,
                            "fetch attempt failed"
                        );
                        last_reason = reason;
                        tokio::time::sleep(wait).await;
                    }
                }
            }

            Err(FetchError {
                reason: last_reason,
                attempts: self.retry.max_attempts.max(1),
            })
        }
        .instrument(span)
        .await
    }

    /// Fetch without a content check; only transport and status failures
    /// trigger retries.
    pub async fn fetch(&self, url: &str) -> Result<RawPage, FetchError> {
        self.fetch_with_check(url, |_| true).await
    }

    async fn attempt<F>(&self, url: &str, accept: &F) -> Result<RawPage, FailureReason>
    where
        F: Fn(&RawPage) -> bool,
    {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(FailureReason::Request)?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FailureReason::HttpStatus(status.as_u16()));
        }

        let body = resp.text().await.map_err(FailureReason::Request)?;
        let page = RawPage {
            status,
            final_url,
            body,
        };
        if !accept(&page) {
            return Err(FailureReason::MarkerMissing);
        }

        debug!(status = status.as_u16(), bytes = page.body.len(), "fetched");
        Ok(page)
    }
}
