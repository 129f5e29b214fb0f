//! HTTP access to the Itiner-e API.
//!
//! [`ItinereClient`] issues GET requests with the retry policy from
//! [`HarvesterConfig`]: statuses in the policy's retry list are retried with
//! exponential backoff, 404 maps to [`FetchError::NotFound`], everything
//! else is a [`FetchError::FatalFailure`].

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::config::HarvesterConfig;
use crate::harvest::traits::FetchError;
use crate::traits::SegmentSource;

pub struct ItinereClient {
    client: Client,
    config: HarvesterConfig,
}

impl ItinereClient {
    pub fn new(config: HarvesterConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| FetchError::FatalFailure {
                url: config.base_url.clone(),
                reason: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    /// Sends a GET, retrying retryable statuses until the policy is exhausted.
    ///
    /// `response_timeout` bounds the wait for each response's headers;
    /// `body_timeout`, when set, bounds the whole request including its body.
    async fn get_with_retry(
        &self,
        url: &str,
        response_timeout: Duration,
        body_timeout: Option<Duration>,
    ) -> Result<Response, FetchError> {
        let policy = &self.config.retry;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let mut request = self.client.get(url);
            if let Some(timeout) = body_timeout {
                request = request.timeout(timeout);
            }

            let response = tokio::time::timeout(response_timeout, request.send())
                .await
                .map_err(|_| FetchError::FatalFailure {
                    url: url.to_string(),
                    reason: format!("no response within {:?}", response_timeout),
                })?
                .map_err(|e| FetchError::FatalFailure {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;

            let status = response.status();
            if status.is_success() {
                debug!(url, attempt, "Request succeeded");
                return Ok(response);
            }
            if status == StatusCode::NOT_FOUND {
                return Err(FetchError::NotFound {
                    url: url.to_string(),
                });
            }
            if !policy.is_retryable(status.as_u16()) {
                return Err(FetchError::FatalFailure {
                    url: url.to_string(),
                    reason: format!("HTTP {}", status),
                });
            }
            if attempt > policy.max_retries {
                return Err(FetchError::TransientFailure {
                    url: url.to_string(),
                    status: status.as_u16(),
                    attempts: attempt,
                });
            }

            let delay = retry_after(&response)
                .map(|d| d.min(policy.max_backoff))
                .unwrap_or_else(|| policy.backoff(attempt));
            warn!(
                url,
                status = status.as_u16(),
                attempt,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Retryable response, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn stream_to_file(&self, mut response: Response, part: &Path) -> Result<u64, FetchError> {
        let url = response.url().to_string();
        let mut file = tokio::fs::File::create(part).await?;
        let mut total: u64 = 0;

        loop {
            // The stall timeout applies per chunk, so a large export is not
            // cut off while it is still making progress.
            let chunk = tokio::time::timeout(self.config.bulk_timeout, response.chunk())
                .await
                .map_err(|_| FetchError::FatalFailure {
                    url: url.clone(),
                    reason: format!(
                        "download stalled for {}s",
                        self.config.bulk_timeout.as_secs()
                    ),
                })?
                .map_err(|e| FetchError::FatalFailure {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;

            match chunk {
                Some(bytes) => {
                    file.write_all(&bytes).await?;
                    total += bytes.len() as u64;
                }
                None => break,
            }
        }

        file.flush().await?;
        Ok(total)
    }
}

#[async_trait]
impl SegmentSource for ItinereClient {
    fn source_id(&self) -> &str {
        &self.config.base_url
    }

    #[instrument(skip(self))]
    async fn fetch_segment(&self, segment_id: i64) -> Result<Vec<u8>, FetchError> {
        let url = self.config.segment_json_url(segment_id);
        let response = self
            .get_with_retry(
                &url,
                self.config.request_timeout,
                Some(self.config.request_timeout),
            )
            .await?;

        let body = response.bytes().await.map_err(|e| FetchError::FatalFailure {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        Ok(body.to_vec())
    }

    #[instrument(skip(self), fields(dest = %dest.display()))]
    async fn download_bulk(&self, dest: &Path) -> Result<u64, FetchError> {
        let url = self.config.bulk_url();
        info!(url = %url, "Downloading bulk export");

        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let response = self
            .get_with_retry(&url, self.config.bulk_timeout, None)
            .await?;
        let part = part_path(dest);

        let total = match self.stream_to_file(response, &part).await {
            Ok(total) => total,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&part).await {
                    debug!(error = %cleanup, path = %part.display(), "Could not remove partial download");
                }
                return Err(e);
            }
        };
        tokio::fs::rename(&part, dest).await?;

        info!(
            bytes = total,
            megabytes = %format!("{:.2}", total as f64 / 1e6),
            path = %dest.display(),
            "Bulk export downloaded"
        );
        Ok(total)
    }
}

/// `Retry-After` in its delta-seconds form.
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}
