//! Paginated listing extraction against the ranking API.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use anipulse_core::RawAnime;

pub const CRATE_NAME: &str = "anipulse-client";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited by the source")]
    RateLimited,
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Escalating delay schedule for consecutive rate-limit responses on one
/// page. `max_attempts` bounds the retries before the extractor gives up on
/// the run instead of spinning forever.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Zero-delay policy; unit tests substitute this so retries do not sleep.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// One page of the paginated listing. Implementations other than the HTTP
/// source exist only in tests.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, page: u32) -> Result<Vec<RawAnime>, FetchError>;
}

/// Production page source: `GET {base_url}?page={n}` expecting a JSON body
/// with a `data` array of listing items.
#[derive(Debug)]
pub struct HttpPageSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPageSource {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        user_agent: &str,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(&self, page: u32) -> Result<Vec<RawAnime>, FetchError> {
        let url = format!("{}?page={}", self.base_url, page);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited);
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let listing: ListingPage = resp.json().await?;
        Ok(listing.into_records())
    }
}

#[derive(Debug, Deserialize)]
struct ListingPage {
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

impl ListingPage {
    /// Items are decoded one by one so a single malformed entry drops that
    /// entry, not the page.
    fn into_records(self) -> Vec<RawAnime> {
        self.data
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<RawAnime>(item) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(%err, "skipping malformed listing item");
                    None
                }
            })
            .collect()
    }
}

/// How an extraction run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    /// The requested record count was reached.
    Complete,
    /// The source ran out of pages first.
    SourceExhausted,
    /// Extraction stopped early; whatever was collected is still usable.
    Aborted(String),
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub records: Vec<RawAnime>,
    pub outcome: ExtractOutcome,
}

/// Walks listing pages in order, accumulating records up to a cap.
///
/// Rate limiting retries the same page on the policy's escalating schedule;
/// every other failure is a soft stop that keeps the partial batch. The
/// cancellation token is honored at each request and each sleep.
pub struct Extractor<S> {
    source: S,
    retry: RetryPolicy,
    page_delay: Duration,
    cancel: CancellationToken,
}

impl<S: PageSource> Extractor<S> {
    pub fn new(source: S, retry: RetryPolicy, page_delay: Duration) -> Self {
        Self {
            source,
            retry,
            page_delay,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn extract(&self, limit: usize) -> Extraction {
        if limit == 0 {
            return Extraction {
                records: Vec::new(),
                outcome: ExtractOutcome::Complete,
            };
        }

        let mut records: Vec<RawAnime> = Vec::new();
        let mut page: u32 = 1;
        let mut rate_limit_strikes: usize = 0;

        let outcome = loop {
            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break aborted_by_cancel(),
                fetched = self.source.fetch_page(page) => fetched,
            };

            match fetched {
                Ok(items) if items.is_empty() => break ExtractOutcome::SourceExhausted,
                Ok(items) => {
                    rate_limit_strikes = 0;
                    records.extend(items);
                    debug!(page, total = records.len(), "listing page collected");
                    if records.len() >= limit {
                        break ExtractOutcome::Complete;
                    }
                    page += 1;
                    // Politeness pause between successive pages.
                    if !self.pause(self.page_delay).await {
                        break aborted_by_cancel();
                    }
                }
                Err(FetchError::RateLimited) => {
                    rate_limit_strikes += 1;
                    if rate_limit_strikes > self.retry.max_attempts {
                        warn!(page, strikes = rate_limit_strikes, "giving up on rate-limited page");
                        break ExtractOutcome::Aborted(format!(
                            "rate limited {rate_limit_strikes} times in a row on page {page}"
                        ));
                    }
                    let delay = self.retry.delay_for_attempt(rate_limit_strikes - 1);
                    warn!(page, ?delay, "rate limited; retrying the same page");
                    if !self.pause(delay).await {
                        break aborted_by_cancel();
                    }
                }
                Err(err) => {
                    warn!(page, %err, "extraction stopped early");
                    break ExtractOutcome::Aborted(err.to_string());
                }
            }
        };

        // The last page may over-fetch past the cap.
        records.truncate(limit);
        Extraction { records, outcome }
    }

    /// Returns false when the token fired instead of the timer.
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

fn aborted_by_cancel() -> ExtractOutcome {
    ExtractOutcome::Aborted("extraction cancelled".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Vec<RawAnime>, FetchError>>>,
        requested_pages: Mutex<Vec<u32>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Vec<RawAnime>, FetchError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                requested_pages: Mutex::new(Vec::new()),
            }
        }

        fn pages(&self) -> Vec<u32> {
            self.requested_pages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageSource for &ScriptedSource {
        async fn fetch_page(&self, page: u32) -> Result<Vec<RawAnime>, FetchError> {
            self.requested_pages.lock().unwrap().push(page);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn raw(id: i64) -> RawAnime {
        RawAnime {
            mal_id: Some(id),
            title: Some(format!("title-{id}")),
            ..RawAnime::default()
        }
    }

    fn extractor(source: &ScriptedSource) -> Extractor<&ScriptedSource> {
        Extractor::new(source, RetryPolicy::immediate(3), Duration::ZERO)
    }

    #[tokio::test]
    async fn zero_limit_makes_no_requests() {
        let source = ScriptedSource::new(vec![Ok(vec![raw(1)])]);
        let extraction = extractor(&source).extract(0).await;

        assert!(extraction.records.is_empty());
        assert_eq!(extraction.outcome, ExtractOutcome::Complete);
        assert!(source.pages().is_empty());
    }

    #[tokio::test]
    async fn truncates_to_exactly_the_limit() {
        let source = ScriptedSource::new(vec![
            Ok(vec![raw(1), raw(2), raw(3)]),
            Ok(vec![raw(4), raw(5), raw(6)]),
        ]);
        let extraction = extractor(&source).extract(5).await;

        assert_eq!(extraction.records.len(), 5);
        assert_eq!(extraction.outcome, ExtractOutcome::Complete);
        assert_eq!(source.pages(), vec![1, 2]);
    }

    #[tokio::test]
    async fn empty_page_stops_before_the_limit() {
        let source = ScriptedSource::new(vec![Ok(vec![raw(1), raw(2)]), Ok(vec![])]);
        let extraction = extractor(&source).extract(10).await;

        assert_eq!(extraction.records.len(), 2);
        assert_eq!(extraction.outcome, ExtractOutcome::SourceExhausted);
        assert_eq!(source.pages(), vec![1, 2]);
    }

    #[tokio::test]
    async fn rate_limit_retries_the_same_page() {
        let source = ScriptedSource::new(vec![
            Err(FetchError::RateLimited),
            Ok(vec![raw(1), raw(2), raw(3)]),
        ]);
        let extraction = extractor(&source).extract(3).await;

        assert_eq!(extraction.records.len(), 3);
        assert_eq!(extraction.outcome, ExtractOutcome::Complete);
        assert_eq!(source.pages(), vec![1, 1]);
    }

    #[tokio::test]
    async fn exhausted_rate_limit_retries_keep_the_partial_batch() {
        let source = ScriptedSource::new(vec![
            Ok(vec![raw(1), raw(2)]),
            Err(FetchError::RateLimited),
            Err(FetchError::RateLimited),
            Err(FetchError::RateLimited),
        ]);
        let extractor = Extractor::new(&source, RetryPolicy::immediate(2), Duration::ZERO);
        let extraction = extractor.extract(10).await;

        assert_eq!(extraction.records.len(), 2);
        assert!(matches!(extraction.outcome, ExtractOutcome::Aborted(_)));
        // Page 2 was attempted three times: two retries, then the give-up.
        assert_eq!(source.pages(), vec![1, 2, 2, 2]);
    }

    #[tokio::test]
    async fn non_rate_limit_failure_is_a_soft_stop() {
        let source = ScriptedSource::new(vec![
            Ok(vec![raw(1), raw(2)]),
            Err(FetchError::Status {
                status: 500,
                url: "https://example.test/top?page=2".to_string(),
            }),
        ]);
        let extraction = extractor(&source).extract(10).await;

        assert_eq!(extraction.records.len(), 2);
        match extraction.outcome {
            ExtractOutcome::Aborted(reason) => assert!(reason.contains("500")),
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_the_first_request() {
        let source = ScriptedSource::new(vec![Ok(vec![raw(1)])]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let extractor = Extractor::new(&source, RetryPolicy::immediate(3), Duration::ZERO)
            .with_cancellation(cancel);
        let extraction = extractor.extract(5).await;

        assert!(extraction.records.is_empty());
        assert!(matches!(extraction.outcome, ExtractOutcome::Aborted(_)));
        assert!(source.pages().is_empty());
    }

    #[test]
    fn retry_delays_escalate_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(12),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(12));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(12));
    }

    #[test]
    fn malformed_listing_items_are_dropped_individually() {
        let listing: ListingPage = serde_json::from_str(
            r#"{"data": [
                {"mal_id": 1, "title": "Monster"},
                {"mal_id": "not-a-number", "title": "Broken"},
                {"mal_id": 3, "title": "Mushishi"}
            ]}"#,
        )
        .expect("listing parses");
        let records = listing.into_records();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].mal_id, Some(1));
        assert_eq!(records[1].mal_id, Some(3));
    }
}
